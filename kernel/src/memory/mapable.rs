//! Mapable - a shareable range of virtual pages.
//!
//! A mapable owns one page table per 4 MiB of its size and per-page
//! residency metadata. Which physical frame backs a page is decided by the
//! pager; which linear address the range appears at is decided by each
//! pageable that maps it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::arch::{Machine, TableId, PAGE_SIZE, PAGE_TABLE_CAPACITY};
use crate::error::Result;
use crate::memory::pager::OrphanFrames;
use crate::memory::tables_for;
use crate::sync::{InterruptGuard, SpinLock, SpinLockGuard};

// ── Identifiers ─────────────────────────────────────────────────

static NEXT_MAPABLE: AtomicU64 = AtomicU64::new(1);

fn alloc_mapable_id() -> u64 {
    NEXT_MAPABLE.fetch_add(1, Ordering::Relaxed)
}

// ── Page state ──────────────────────────────────────────────────

bitflags! {
    /// Residency state of one page of a mapable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// The page has contents worth keeping. Cleared pages are
        /// zero-filled when they next become resident.
        const INITIALIZED = 1 << 0;

        /// The page is backed by `Page::frame` and mapped in the mapable's
        /// page table.
        const PRESENT     = 1 << 1;
    }
}

/// One page of a mapable.
///
/// An initialized page that is not present was evicted while dirty; its
/// contents would have to come from a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    pub flags: PageFlags,
    /// Physical frame number, meaningful while `PRESENT`.
    pub frame: usize,
}

impl Page {
    pub fn is_present(&self) -> bool {
        self.flags.contains(PageFlags::PRESENT)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.contains(PageFlags::INITIALIZED)
    }
}

/// Mutable part of a mapable, guarded by its spinlock.
pub(crate) struct MapableState {
    pub pages: Vec<Page>,
    /// All pages are pinned and out of the replacement queues.
    pub locked: bool,
    /// Physical address the mapable was pinned at, if any.
    pub fixed: Option<usize>,
    /// Linear addresses this mapable is currently mapped at, across all
    /// pageables. Used to invalidate stale translations on eviction.
    pub bases: Vec<usize>,
    /// Where pinned frames go if the mapable dies holding them. Set the
    /// first time the pager backs one of its pages.
    pub orphans: Option<Arc<OrphanFrames>>,
}

// ── Mapable ─────────────────────────────────────────────────────

pub struct Mapable {
    id: u64,
    size: usize,
    tables: Vec<TableId>,
    machine: &'static dyn Machine,
    state: SpinLock<MapableState>,
}

impl Mapable {
    /// Creates a mapable of `size` bytes with no resident pages.
    ///
    /// # Panics
    /// If `size` is zero or not a multiple of the page size.
    pub fn new(machine: &'static dyn Machine, size: usize) -> Result<Arc<Mapable>> {
        assert!(
            size != 0 && size % PAGE_SIZE == 0,
            "mapable size {:#x} is not a positive multiple of the page size",
            size
        );

        let mut tables = Vec::with_capacity(tables_for(size));
        for _ in 0..tables_for(size) {
            match machine.allocate_page_table() {
                Ok(table) => tables.push(table),
                Err(err) => {
                    for table in tables {
                        machine.release_page_table(table);
                    }
                    return Err(err);
                }
            }
        }

        let pages = alloc::vec![Page::default(); size / PAGE_SIZE];
        Ok(Arc::new(Mapable {
            id: alloc_mapable_id(),
            size,
            tables,
            machine,
            state: SpinLock::new(MapableState {
                pages,
                locked: false,
                fixed: None,
                bases: Vec::new(),
                orphans: None,
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Page tables backing the range, one per 4 MiB.
    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    /// Page table and entry index holding page `index`.
    pub fn locate(&self, index: usize) -> (TableId, usize) {
        (
            self.tables[index / PAGE_TABLE_CAPACITY],
            index % PAGE_TABLE_CAPACITY,
        )
    }

    /// Snapshot of page `index`.
    pub fn page(&self, index: usize) -> Page {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.lock_state();
        state.pages[index]
    }

    pub fn resident_pages(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.lock_state();
        state.pages.iter().filter(|page| page.is_present()).count()
    }

    pub fn is_locked(&self) -> bool {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.lock_state();
        state.locked
    }

    /// Takes the mapable's lock. Interrupts must already be disabled.
    pub(crate) fn lock_state(&self) -> SpinLockGuard<'_, MapableState> {
        self.state.lock(self.machine)
    }
}

impl fmt::Debug for Mapable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapable")
            .field("id", &self.id)
            .field("size", &format_args!("{:#x}", self.size))
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Drop for Mapable {
    fn drop(&mut self) {
        // Queued frames of a dead mapable count as free already. Pinned ones
        // are out of the pager's sight and have to be handed back.
        let state = self.state.get_mut();
        if let Some(orphans) = &state.orphans {
            if state.locked || state.fixed.is_some() {
                orphans.give_back(state.pages.iter().filter(|p| p.is_present()).map(|p| p.frame));
            }
        }

        for &table in &self.tables {
            self.machine.release_page_table(table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_TABLE_SIZE;
    use crate::testing::FakeMachine;

    #[test]
    fn one_table_per_four_mib() {
        let machine = FakeMachine::leak(16 << 20);
        let small = Mapable::new(machine, 3 * PAGE_SIZE).unwrap();
        assert_eq!(small.tables().len(), 1);
        assert_eq!(small.page_count(), 3);

        let large = Mapable::new(machine, PAGE_TABLE_SIZE + PAGE_SIZE).unwrap();
        assert_eq!(large.tables().len(), 2);
        assert_eq!(large.locate(PAGE_TABLE_CAPACITY), (large.tables()[1], 0));
    }

    #[test]
    fn pages_start_absent_and_uninitialized() {
        let machine = FakeMachine::leak(16 << 20);
        let mapable = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();
        assert_eq!(mapable.page(1), Page::default());
        assert_eq!(mapable.resident_pages(), 0);
        assert!(!mapable.is_locked());
    }

    #[test]
    fn drop_releases_tables() {
        let machine = FakeMachine::leak(16 << 20);
        let mapable = Mapable::new(machine, PAGE_TABLE_SIZE * 2).unwrap();
        assert_eq!(machine.live_tables(), 2);
        drop(mapable);
        assert_eq!(machine.live_tables(), 0);
    }

    #[test]
    #[should_panic(expected = "multiple of the page size")]
    fn unaligned_size_panics() {
        let machine = FakeMachine::leak(16 << 20);
        let _ = Mapable::new(machine, 100);
    }
}
