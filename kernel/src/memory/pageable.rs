//! Pageable - one virtual address space.
//!
//! The user half of the address space (below `KERNEL_SPACE_BOUNDARY`) is
//! handed out to mapables in page-table-aligned ranges. Mapables are indexed
//! by their end address so that a faulting address resolves with a single
//! upper-bound lookup.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ops::Bound;

use crate::arch::{DirectoryId, Machine, KERNEL_SPACE_BOUNDARY, PAGE_SIZE, PAGE_TABLE_SIZE};
use crate::error::{KernelError, Result};
use crate::memory::{align_up, Blocks, Mapable};
use crate::sync::{InterruptGuard, SpinLock};

struct PageableState {
    /// Unmapped ranges of the user half.
    blocks: Blocks,
    /// Mapped mapables keyed by end address.
    mapables: BTreeMap<usize, Arc<Mapable>>,
}

pub struct Pageable {
    directory: DirectoryId,
    machine: &'static dyn Machine,
    state: SpinLock<PageableState>,
}

impl Pageable {
    pub fn new(machine: &'static dyn Machine) -> Result<Pageable> {
        let directory = machine.allocate_page_directory()?;
        let mut blocks = Blocks::new();
        blocks.deallocate(0, KERNEL_SPACE_BOUNDARY);
        Ok(Pageable {
            directory,
            machine,
            state: SpinLock::new(PageableState {
                blocks,
                mapables: BTreeMap::new(),
            }),
        })
    }

    pub fn directory(&self) -> DirectoryId {
        self.directory
    }

    /// Maps `mapable` at `address`, or wherever it fits when `None`, and
    /// returns the base address. The range reserved is the mapable's size
    /// rounded up to whole page tables.
    ///
    /// # Panics
    /// If `address` is not page-table aligned.
    pub fn map(&self, mapable: &Arc<Mapable>, address: Option<usize>) -> Result<usize> {
        if let Some(address) = address {
            assert!(
                address % PAGE_TABLE_SIZE == 0,
                "mapable base {:#010x} is not page-table aligned",
                address
            );
        }
        let span = align_up(mapable.size(), PAGE_TABLE_SIZE);

        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        let base = match address {
            Some(address) => {
                state.blocks.force_allocate(address, span)?;
                address
            }
            None => state.blocks.allocate(span)?,
        };

        state.mapables.insert(base + mapable.size(), Arc::clone(mapable));
        for (i, &table) in mapable.tables().iter().enumerate() {
            self.machine
                .map_table_to_directory(self.directory, table, base / PAGE_TABLE_SIZE + i);
        }
        mapable.lock_state().bases.push(base);

        log::trace!(
            "pageable {:?}: mapable {} at {:#010x}..{:#010x}",
            self.directory,
            mapable.id(),
            base,
            base + mapable.size()
        );
        Ok(base)
    }

    /// Removes `mapable` from this address space and frees its range.
    pub fn unmap(&self, mapable: &Arc<Mapable>) -> Result<()> {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);

        let end = state
            .mapables
            .iter()
            .find(|(_, mapped)| Arc::ptr_eq(mapped, mapable))
            .map(|(&end, _)| end)
            .ok_or(KernelError::NotMapped)?;
        state.mapables.remove(&end);

        let base = end - mapable.size();
        self.detach(mapable, base);
        state
            .blocks
            .deallocate(base, align_up(mapable.size(), PAGE_TABLE_SIZE));
        Ok(())
    }

    /// The mapable covering `address` and its base address.
    pub fn lookup(&self, address: usize) -> Option<(Arc<Mapable>, usize)> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let (&end, mapable) = state
            .mapables
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()?;
        let base = end - mapable.size();
        (address >= base).then(|| (Arc::clone(mapable), base))
    }

    pub fn mapable_count(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        state.mapables.len()
    }

    /// Unhooks the mapable's tables from the directory. Caller holds the
    /// pageable lock with interrupts disabled.
    fn detach(&self, mapable: &Mapable, base: usize) {
        for i in 0..mapable.tables().len() {
            self.machine
                .unmap_table_from_directory(self.directory, base / PAGE_TABLE_SIZE + i);
        }
        for page in 0..mapable.page_count() {
            self.machine.invalidate_tlb_entry(base + page * PAGE_SIZE);
        }
        let mut mapped = mapable.lock_state();
        if let Some(position) = mapped.bases.iter().position(|&b| b == base) {
            mapped.bases.swap_remove(position);
        }
    }
}

impl Drop for Pageable {
    fn drop(&mut self) {
        let mapables = core::mem::take(&mut self.state.get_mut().mapables);
        let _irq = InterruptGuard::new(self.machine);
        for (end, mapable) in mapables {
            self.detach(&mapable, end - mapable.size());
        }
        self.machine.release_page_directory(self.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMachine;

    #[test]
    fn map_installs_tables_and_lookup_finds_them() {
        let machine = FakeMachine::leak(16 << 20);
        let pageable = Pageable::new(machine).unwrap();
        let first = Mapable::new(machine, 3 * PAGE_SIZE).unwrap();
        let second = Mapable::new(machine, PAGE_TABLE_SIZE + PAGE_SIZE).unwrap();

        assert_eq!(pageable.map(&first, None), Ok(0));
        let base = pageable.map(&second, None).unwrap();
        assert_eq!(base, PAGE_TABLE_SIZE);

        let directory = pageable.directory();
        assert_eq!(machine.table_at(directory, 0), Some(first.tables()[0]));
        assert_eq!(machine.table_at(directory, 1), Some(second.tables()[0]));
        assert_eq!(machine.table_at(directory, 2), Some(second.tables()[1]));

        let (found, found_base) = pageable.lookup(2 * PAGE_SIZE + 17).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert_eq!(found_base, 0);

        // Past the end of the first mapable, inside its reserved table.
        assert!(pageable.lookup(3 * PAGE_SIZE).is_none());

        let (found, _) = pageable.lookup(base + PAGE_TABLE_SIZE).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert!(pageable.lookup(base + PAGE_TABLE_SIZE + PAGE_SIZE).is_none());
    }

    #[test]
    fn fixed_address_must_be_free() {
        let machine = FakeMachine::leak(16 << 20);
        let pageable = Pageable::new(machine).unwrap();
        let a = Mapable::new(machine, PAGE_SIZE).unwrap();
        let b = Mapable::new(machine, PAGE_SIZE).unwrap();

        assert_eq!(pageable.map(&a, Some(8 * PAGE_TABLE_SIZE)), Ok(8 * PAGE_TABLE_SIZE));
        assert_eq!(
            pageable.map(&b, Some(8 * PAGE_TABLE_SIZE)),
            Err(KernelError::RangeNotFree {
                address: 8 * PAGE_TABLE_SIZE,
                size: PAGE_TABLE_SIZE
            })
        );
        assert!(pageable.map(&b, Some(KERNEL_SPACE_BOUNDARY)).is_err());
    }

    #[test]
    fn unmap_returns_the_range() {
        let machine = FakeMachine::leak(16 << 20);
        let pageable = Pageable::new(machine).unwrap();
        let mapable = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();

        let base = pageable.map(&mapable, None).unwrap();
        pageable.unmap(&mapable).unwrap();

        assert_eq!(machine.table_at(pageable.directory(), 0), None);
        assert!(machine.invalidated().contains(&(base + PAGE_SIZE)));
        assert_eq!(pageable.mapable_count(), 0);
        assert_eq!(pageable.unmap(&mapable), Err(KernelError::NotMapped));
        assert_eq!(pageable.map(&mapable, None), Ok(base));
    }
}
