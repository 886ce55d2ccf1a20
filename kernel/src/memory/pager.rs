// =============================================================================
// Nutshell - Pager (Physical Frames and Demand Paging)
// =============================================================================
//
// The pager owns every physical frame. Each frame is in exactly one of these
// places at any time:
//
//   firmware       below the kernel load address, never handed out
//   recent         replacement queue: touched during the last epoch
//   not-recent     replacement queue: candidates for eviction
//   pinned         owned by a mapable page but in neither queue (locked)
//   kernel reserve frames set aside for kernel heap growth
//   kernel heap    backing a page of the kernel half
//
// REPLACEMENT (second chance over two queues):
//
//   ```text
//        demote (clear A bit)
//   recent ───────────────────▶ not-recent ──▶ evict front
//     ▲                             │
//     └──────── A bit was set ──────┘
//   ```
//
//   1. While `recent` is longer than `not-recent`, move its head to the back
//      of `not-recent`, clearing the accessed bit on the way.
//   2. Scan `not-recent` from the front and promote frames whose accessed
//      bit got set since; stop at the first free or untouched frame.
//   3. Repeat until `not-recent` is non-empty, then take its front, evicting
//      the page that lives there if any.
//
// KERNEL HEAP:
//   The kernel half grows from inside the allocator. Growing must not
//   allocate, so it only draws from the reserve pool, never from the
//   replacement policy. After every allocator call the reserve is brought
//   back to its watermark through the replacement policy; that top-up backs
//   off when the pager lock is already held by the calling task, which means
//   the allocation came from inside a pager operation.
//
//   Every collection touched under the kernel-size lock is sized for all of
//   physical memory at construction, so nothing under that lock allocates.
//
// ORPHANS:
//   A mapable that dies while locked or pinned at a fixed address still owns
//   frames outside the queues. Its destructor hands them to `OrphanFrames`
//   and the pager takes them back before it next picks or counts frames.
//
// =============================================================================

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::arch::{
    DirectoryId, Machine, TableId, KERNEL_LOAD_ADDRESS, KERNEL_SPACE_BOUNDARY, PAGE_SIZE,
    PAGE_TABLE_CAPACITY, PAGE_TABLE_SIZE,
};
use crate::config::KernelConfig;
use crate::error::{Descriptor, KernelError, Result, Unsupported};
use crate::memory::{align_down, pages_for, tables_for, Mapable, Page, PageFlags, Pageable};
use crate::sync::{InterruptGuard, SpinLock};

// =============================================================================
// Frame bookkeeping
// =============================================================================

/// Who a physical frame belongs to.
#[derive(Debug, Clone)]
enum Owner {
    Firmware,
    Free,
    /// Kernel heap page or kernel reserve.
    Kernel,
    Mapable { mapable: Weak<Mapable>, index: usize },
}

impl Owner {
    /// The live mapable and page index, if the owner still exists.
    fn mapable(&self) -> Option<(Arc<Mapable>, usize)> {
        match self {
            Owner::Mapable { mapable, index } => mapable.upgrade().map(|m| (m, *index)),
            _ => None,
        }
    }

    /// Free, or owned by a mapable that has since been dropped.
    fn is_free(&self) -> bool {
        match self {
            Owner::Free => true,
            Owner::Mapable { mapable, .. } => mapable.strong_count() == 0,
            _ => false,
        }
    }
}

/// Frame table and replacement queues, under the pager lock.
struct PagerState {
    frames: Vec<Owner>,
    recent: VecDeque<usize>,
    not_recent: VecDeque<usize>,
    first_frame: usize,
    orphans: Arc<OrphanFrames>,
}

/// Frames a dropped mapable held outside the replacement queues.
///
/// Every mapable the pager backs keeps a handle to this list. The list has
/// room for every frame, and a frame is only handed back by its last owner,
/// so giving frames back never allocates.
pub(crate) struct OrphanFrames {
    machine: &'static dyn Machine,
    frames: SpinLock<Vec<usize>>,
}

impl OrphanFrames {
    pub(crate) fn give_back(&self, frames: impl Iterator<Item = usize>) {
        let _irq = InterruptGuard::new(self.machine);
        let mut list = self.frames.lock(self.machine);
        list.extend(frames);
    }
}

/// Kernel half bookkeeping, under the kernel-size lock.
struct KernelSpace {
    /// Page tables of the kernel half, allocated up front.
    tables: Vec<TableId>,
    /// Current break, in bytes above `KERNEL_SPACE_BOUNDARY`.
    size: usize,
    /// Frames held back for heap growth. `pop` hands out the next one.
    reserve: Vec<usize>,
    /// Frames backing kernel pages, in page order.
    heap: Vec<usize>,
    /// Every address space the kernel tables are installed in.
    directories: Vec<DirectoryId>,
}

/// Where every physical frame currently is.
///
/// A consistent census accounts for each frame exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCensus {
    pub total: usize,
    pub firmware: usize,
    /// Queued and free (or owned by a dropped mapable).
    pub queued_free: usize,
    /// Queued and backing a page of a live mapable.
    pub queued_owned: usize,
    /// Backing a page of a live mapable, out of the queues.
    pub pinned: usize,
    pub kernel_reserve: usize,
    pub kernel_heap: usize,
    /// Frames found twice, found nowhere, or found in the wrong place.
    pub misplaced: usize,
}

impl FrameCensus {
    pub fn is_consistent(&self) -> bool {
        self.misplaced == 0
            && self.firmware
                + self.queued_free
                + self.queued_owned
                + self.pinned
                + self.kernel_reserve
                + self.kernel_heap
                == self.total
    }
}

// =============================================================================
// Pager
// =============================================================================

pub struct Pager {
    machine: &'static dyn Machine,
    total_frames: usize,
    /// First frame above firmware memory.
    first_frame: usize,
    watermark: usize,
    state: SpinLock<PagerState>,
    kernel: SpinLock<KernelSpace>,
}

impl Pager {
    /// Takes over physical memory from the boot loader.
    ///
    /// Every frame from the kernel load address up is queued as free, except
    /// the ones backing the first `config.initial_kernel_size` bytes of the
    /// kernel half, which are remapped through the pager's own kernel tables.
    /// The reserve is then filled to its watermark.
    pub fn new(machine: &'static dyn Machine, config: &KernelConfig) -> Result<Pager> {
        let memory = machine.memory_size();
        let total_frames = memory / PAGE_SIZE;
        let first_frame = (KERNEL_LOAD_ADDRESS / PAGE_SIZE).min(total_frames);

        let mut frames = vec![Owner::Free; total_frames];
        for owner in &mut frames[..first_frame] {
            *owner = Owner::Firmware;
        }

        let mut tables = Vec::with_capacity(tables_for(memory));
        for _ in 0..tables_for(memory) {
            tables.push(machine.allocate_page_table()?);
        }

        // Frames under the boot-time kernel image, in page order.
        let mut reserve = Vec::with_capacity(total_frames);
        for page in 0..pages_for(config.initial_kernel_size) {
            let frame = machine.physical_address(KERNEL_SPACE_BOUNDARY + page * PAGE_SIZE) / PAGE_SIZE;
            frames[frame] = Owner::Kernel;
            reserve.push(frame);
        }
        reserve.reverse();

        let mut not_recent = VecDeque::with_capacity(total_frames);
        not_recent.extend((first_frame..total_frames).filter(|&f| frames[f].is_free()));

        let pager = Pager {
            machine,
            total_frames,
            first_frame,
            watermark: config.kernel_frame_reserve,
            state: SpinLock::new(PagerState {
                frames,
                recent: VecDeque::with_capacity(total_frames),
                not_recent,
                first_frame,
                orphans: Arc::new(OrphanFrames {
                    machine,
                    frames: SpinLock::new(Vec::with_capacity(total_frames)),
                }),
            }),
            kernel: SpinLock::new(KernelSpace {
                tables,
                size: 0,
                reserve,
                heap: Vec::with_capacity(total_frames),
                directories: Vec::with_capacity(total_frames),
            }),
        };

        pager.set_kernel_size(config.initial_kernel_size)?;
        pager.prepare_next_kernel_size()?;

        log::info!(
            "pager: {} frames ({} KiB), kernel {} KiB, reserve {}",
            total_frames,
            memory / 1024,
            config.initial_kernel_size / 1024,
            pager.watermark
        );
        Ok(pager)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Reserve watermark the pool is topped up to.
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    // ── Address spaces ──────────────────────────────────────────

    /// Installs the kernel half into `pageable`'s directory and keeps it
    /// there as the kernel grows.
    ///
    /// # Panics
    /// If the pageable was already added.
    pub fn add_pageable(&self, pageable: &Pageable) -> Result<()> {
        let directory = pageable.directory();
        let _irq = InterruptGuard::new(self.machine);
        let _state = self.state.lock(self.machine);
        let mut kernel = self.kernel.lock(self.machine);

        assert!(
            !kernel.directories.contains(&directory),
            "pageable {:?} added twice",
            directory
        );
        if kernel.directories.len() == kernel.directories.capacity() {
            return Err(KernelError::OutOfDescriptors(Descriptor::PageDirectory));
        }
        kernel.directories.push(directory);
        for (i, &table) in kernel.tables[..tables_for(kernel.size)].iter().enumerate() {
            self.machine
                .map_table_to_directory(directory, table, KERNEL_SPACE_BOUNDARY / PAGE_TABLE_SIZE + i);
        }
        Ok(())
    }

    /// Removes the kernel half from `pageable`'s directory.
    pub fn remove_pageable(&self, pageable: &Pageable) -> Result<()> {
        let directory = pageable.directory();
        let _irq = InterruptGuard::new(self.machine);
        let _state = self.state.lock(self.machine);
        let mut kernel = self.kernel.lock(self.machine);

        let position = kernel
            .directories
            .iter()
            .position(|&d| d == directory)
            .ok_or(KernelError::NotMapped)?;
        kernel.directories.swap_remove(position);
        for i in 0..tables_for(kernel.size) {
            self.machine
                .unmap_table_from_directory(directory, KERNEL_SPACE_BOUNDARY / PAGE_TABLE_SIZE + i);
        }
        Ok(())
    }

    // ── Pinning ─────────────────────────────────────────────────

    /// Makes every page of `mapable` resident and takes its frames out of the
    /// replacement queues.
    ///
    /// With `address`, page `i` is pinned at physical `address + i * 4096`;
    /// whatever page lives there now is evicted. Frames below the kernel load
    /// address may be pinned this way, kernel frames may not. Otherwise
    /// resident pages stay where they are and missing ones are brought in
    /// zero-filled.
    ///
    /// # Panics
    /// If the mapable is already locked.
    pub fn lock_mapable(&self, mapable: &Arc<Mapable>, address: Option<usize>) -> Result<()> {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);

        {
            let pages = mapable.lock_state();
            assert!(!pages.locked, "mapable {} locked twice", mapable.id());
            if pages.pages.iter().any(|p| p.is_initialized() && !p.is_present()) {
                return Err(KernelError::Unsupported(Unsupported::PageIn));
            }
            if address.is_some() && pages.pages.iter().any(Page::is_present) {
                return Err(KernelError::MapableResident);
            }
        }

        match address {
            Some(address) => self.pin_fixed(&mut state, mapable, address)?,
            None => {
                {
                    let pages = mapable.lock_state();
                    for page in pages.pages.iter().filter(|p| p.is_present()) {
                        state.unqueue(page.frame);
                    }
                }
                for index in 0..mapable.page_count() {
                    if mapable.lock_state().pages[index].is_present() {
                        continue;
                    }
                    let frame = match state.available_frame(self.machine) {
                        Ok(frame) => frame,
                        Err(err) => {
                            state.requeue(mapable);
                            return Err(err);
                        }
                    };
                    state.install(self.machine, mapable, index, frame, true);
                }
            }
        }

        mapable.lock_state().locked = true;
        log::trace!("pager: locked mapable {}", mapable.id());
        Ok(())
    }

    fn pin_fixed(&self, state: &mut PagerState, mapable: &Arc<Mapable>, address: usize) -> Result<()> {
        assert!(
            address % PAGE_SIZE == 0,
            "pin address {:#010x} is not page aligned",
            address
        );
        state.reclaim_orphans(self.machine);
        let first = address / PAGE_SIZE;
        let frames = first..first + mapable.page_count();

        for frame in frames.clone() {
            let available = match state.frames.get(frame) {
                None | Some(Owner::Kernel) => false,
                Some(owner) => owner.mapable().map_or(true, |(m, _)| !m.is_locked()),
            };
            if !available {
                return Err(KernelError::FrameUnavailable { frame });
            }
        }

        for (index, frame) in frames.enumerate() {
            state.unqueue(frame);
            state.make_frame_available(self.machine, frame);
            state.install(self.machine, mapable, index, frame, false);
        }
        mapable.lock_state().fixed = Some(address);
        Ok(())
    }

    /// Makes the pages of `mapable` eligible for eviction again.
    ///
    /// # Panics
    /// If the mapable is not locked.
    pub fn unlock_mapable(&self, mapable: &Arc<Mapable>) {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        let mut pages = mapable.lock_state();

        assert!(pages.locked, "mapable {} is not locked", mapable.id());
        for page in pages.pages.iter().filter(|p| p.is_present()) {
            // Firmware frames stay pinned for as long as they are mapped.
            if page.frame >= self.first_frame {
                state.recent.push_back(page.frame);
            }
        }
        pages.locked = false;
    }

    /// Drops every resident page of `mapable` and returns its frames.
    ///
    /// Page contents are discarded. Works on locked and unlocked mapables;
    /// the mapable ends up unlocked with no resident pages.
    pub fn release_mapable(&self, mapable: &Arc<Mapable>) {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        let mut guard = mapable.lock_state();
        let pages = &mut *guard;

        for (index, page) in pages.pages.iter_mut().enumerate() {
            if !page.is_present() {
                *page = Page::default();
                continue;
            }
            let (table, entry) = mapable.locate(index);
            self.machine.unmap_page(table, entry);
            for &base in &pages.bases {
                self.machine.invalidate_tlb_entry(base + index * PAGE_SIZE);
            }

            state.return_frame(page.frame);
            *page = Page::default();
        }
        pages.locked = false;
        pages.fixed = None;
    }

    // ── Faults ──────────────────────────────────────────────────

    /// Resolves a page fault at `address` in `pageable`.
    ///
    /// Faults outside every mapable return `InvalidAccess`; whoever takes
    /// the trap decides what to do with the faulting context. A fault on a
    /// page that is already present is ignored.
    pub fn page_fault(&self, pageable: &Pageable, address: usize) -> Result<()> {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);

        let page_address = align_down(address, PAGE_SIZE);
        let (mapable, base) = pageable
            .lookup(page_address)
            .ok_or(KernelError::InvalidAccess { address })?;
        let index = (page_address - base) / PAGE_SIZE;

        let page = mapable.lock_state().pages[index];
        if page.is_present() {
            log::warn!("pager: spurious fault at {:#010x}", address);
            return Ok(());
        }
        if page.is_initialized() {
            return Err(KernelError::Unsupported(Unsupported::PageIn));
        }

        let frame = state.available_frame(self.machine)?;
        state.recent.push_back(frame);
        state.install(self.machine, &mapable, index, frame, true);

        log::trace!(
            "pager: fault at {:#010x} -> mapable {} page {} in frame {:#x}",
            address,
            mapable.id(),
            index,
            frame
        );
        Ok(())
    }

    // ── Kernel heap ─────────────────────────────────────────────

    /// Current kernel break, in bytes above the kernel boundary.
    pub fn kernel_size(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let kernel = self.kernel.lock(self.machine);
        kernel.size
    }

    /// Frames currently held in the kernel reserve.
    pub fn reserve_len(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let kernel = self.kernel.lock(self.machine);
        kernel.reserve.len()
    }

    /// Moves the kernel break to `bytes` and maps or unmaps whole pages to
    /// match. Growth draws only on the reserve; shrinking returns frames to
    /// it.
    pub fn set_kernel_size(&self, bytes: usize) -> Result<()> {
        let _irq = InterruptGuard::new(self.machine);
        let mut kernel = self.kernel.lock(self.machine);
        self.resize_kernel(&mut kernel, bytes)
    }

    /// Moves the kernel break by `increment` bytes and returns the linear
    /// address of the old break.
    pub fn grow_kernel(&self, increment: isize) -> Result<usize> {
        let _irq = InterruptGuard::new(self.machine);
        let mut kernel = self.kernel.lock(self.machine);
        let old = kernel.size;
        let new = old
            .checked_add_signed(increment)
            .ok_or(KernelError::KernelReserveExhausted)?;
        self.resize_kernel(&mut kernel, new)?;
        Ok(KERNEL_SPACE_BOUNDARY + old)
    }

    fn resize_kernel(&self, kernel: &mut KernelSpace, bytes: usize) -> Result<()> {
        let current = pages_for(kernel.size);
        let target = pages_for(bytes);
        if target > kernel.tables.len() * PAGE_TABLE_CAPACITY
            || target.saturating_sub(current) > kernel.reserve.len()
        {
            log::error!(
                "pager: kernel heap cannot grow to {:#x} bytes with {} reserved frames",
                bytes,
                kernel.reserve.len()
            );
            return Err(KernelError::KernelReserveExhausted);
        }

        if target > current {
            for page in current..target {
                let Some(frame) = kernel.reserve.pop() else {
                    return Err(KernelError::KernelReserveExhausted);
                };
                let table = kernel.tables[page / PAGE_TABLE_CAPACITY];
                self.machine.map_page_to_frame(table, page % PAGE_TABLE_CAPACITY, frame);
                kernel.heap.push(frame);
            }
            for index in tables_for(kernel.size)..tables_for(bytes) {
                for &directory in &kernel.directories {
                    self.machine.map_table_to_directory(
                        directory,
                        kernel.tables[index],
                        KERNEL_SPACE_BOUNDARY / PAGE_TABLE_SIZE + index,
                    );
                }
            }
        } else {
            for page in (target..current).rev() {
                let Some(frame) = kernel.heap.pop() else {
                    break;
                };
                let table = kernel.tables[page / PAGE_TABLE_CAPACITY];
                self.machine.unmap_page(table, page % PAGE_TABLE_CAPACITY);
                self.machine
                    .invalidate_tlb_entry(KERNEL_SPACE_BOUNDARY + page * PAGE_SIZE);
                kernel.reserve.push(frame);
            }
        }

        if target != current {
            log::debug!("pager: kernel heap {} -> {} pages", current, target);
        }
        kernel.size = bytes;
        Ok(())
    }

    /// Brings the kernel reserve back to its watermark.
    ///
    /// Runs after every allocator call. When the pager lock is already held
    /// by this task the allocation happened inside a pager operation, and the
    /// top-up waits for the next call.
    pub fn prepare_next_kernel_size(&self) -> Result<()> {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        if state.is_nested() {
            return Ok(());
        }

        loop {
            let mut kernel = self.kernel.lock(self.machine);
            match kernel.reserve.len().cmp(&self.watermark) {
                Ordering::Less => {
                    // The replacement path may allocate; never under the
                    // kernel-size lock.
                    drop(kernel);
                    let frame = state.available_frame(self.machine)?;
                    state.frames[frame] = Owner::Kernel;
                    self.kernel.lock(self.machine).reserve.push(frame);
                }
                Ordering::Greater => {
                    let Some(frame) = kernel.reserve.pop() else {
                        break;
                    };
                    drop(kernel);
                    state.frames[frame] = Owner::Free;
                    state.not_recent.push_front(frame);
                }
                Ordering::Equal => break,
            }
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────

    /// The mapable page backed by `frame`, if any.
    pub fn frame_owner(&self, frame: usize) -> Option<(Arc<Mapable>, usize)> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        state.frames.get(frame)?.mapable()
    }

    /// Lengths of the recent and not-recent queues.
    pub fn queue_lengths(&self) -> (usize, usize) {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        (state.recent.len(), state.not_recent.len())
    }

    /// Whether `frame` sits in the not-recent queue.
    pub fn is_not_recent(&self, frame: usize) -> bool {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        state.not_recent.contains(&frame)
    }

    /// Accounts for every physical frame.
    pub fn census(&self) -> FrameCensus {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        state.reclaim_orphans(self.machine);
        let mut seen = vec![0u8; self.total_frames];
        let mut census = FrameCensus {
            total: self.total_frames,
            ..FrameCensus::default()
        };

        for &frame in state.recent.iter().chain(state.not_recent.iter()) {
            seen[frame] += 1;
            match &state.frames[frame] {
                owner if owner.is_free() => census.queued_free += 1,
                Owner::Mapable { .. } => census.queued_owned += 1,
                _ => census.misplaced += 1,
            }
        }

        {
            let kernel = self.kernel.lock(self.machine);
            for (&frame, heap) in kernel
                .reserve
                .iter()
                .map(|f| (f, false))
                .chain(kernel.heap.iter().map(|f| (f, true)))
            {
                seen[frame] += 1;
                match (&state.frames[frame], heap) {
                    (Owner::Kernel, false) => census.kernel_reserve += 1,
                    (Owner::Kernel, true) => census.kernel_heap += 1,
                    _ => census.misplaced += 1,
                }
            }
        }

        for (frame, &count) in seen.iter().enumerate() {
            match count {
                0 => match &state.frames[frame] {
                    Owner::Firmware => census.firmware += 1,
                    owner if owner.mapable().is_some() => census.pinned += 1,
                    _ => census.misplaced += 1,
                },
                1 => {}
                _ => census.misplaced += 1,
            }
        }
        census
    }
}

// =============================================================================
// Replacement policy
// =============================================================================

impl PagerState {
    /// Picks a frame through the second-chance policy and frees it.
    fn available_frame(&mut self, machine: &dyn Machine) -> Result<usize> {
        self.reclaim_orphans(machine);
        if self.recent.is_empty() && self.not_recent.is_empty() {
            log::error!("pager: out of physical frames");
            return Err(KernelError::OutOfFrames);
        }

        loop {
            while self.recent.len() > self.not_recent.len() {
                if let Some(frame) = self.recent.pop_front() {
                    self.reset_accessed(machine, frame);
                    self.not_recent.push_back(frame);
                }
            }

            while let Some(&frame) = self.not_recent.front() {
                if self.frames[frame].is_free() || !self.reset_accessed(machine, frame) {
                    break;
                }
                self.not_recent.pop_front();
                self.recent.push_back(frame);
            }

            if !self.not_recent.is_empty() {
                break;
            }
        }

        let frame = self.not_recent.pop_front().ok_or(KernelError::OutOfFrames)?;
        self.make_frame_available(machine, frame);
        Ok(frame)
    }

    /// Clears the accessed bit of the page backed by `frame` and returns
    /// whether it was set.
    fn reset_accessed(&self, machine: &dyn Machine, frame: usize) -> bool {
        match self.frames[frame].mapable() {
            Some((mapable, index)) => {
                let (table, entry) = mapable.locate(index);
                machine.reset_page_accessed(table, entry)
            }
            None => false,
        }
    }

    /// Evicts whatever page `frame` backs and marks it free.
    ///
    /// Clean pages are discarded and will be zero-filled on their next
    /// fault. Dirty pages have nowhere to go; they stay initialized so the
    /// next fault on them reports the missing page-in path.
    fn make_frame_available(&mut self, machine: &dyn Machine, frame: usize) {
        let owner = core::mem::replace(&mut self.frames[frame], Owner::Free);
        let Some((mapable, index)) = owner.mapable() else {
            if let Owner::Firmware = owner {
                self.frames[frame] = Owner::Firmware;
            }
            return;
        };

        let (table, entry) = mapable.locate(index);
        let mut guard = mapable.lock_state();
        let pages = &mut *guard;
        assert!(!pages.locked, "evicting a page of locked mapable {}", mapable.id());

        let dirty = machine.page_dirty(table, entry);
        machine.unmap_page(table, entry);
        for &base in &pages.bases {
            machine.invalidate_tlb_entry(base + index * PAGE_SIZE);
        }

        let page = &mut pages.pages[index];
        page.flags.remove(PageFlags::PRESENT);
        if dirty {
            log::warn!(
                "pager: dirty page {} of mapable {} evicted without backing store",
                index,
                mapable.id()
            );
        } else {
            page.flags.remove(PageFlags::INITIALIZED);
        }
        log::trace!("pager: evicted mapable {} page {} from frame {:#x}", mapable.id(), index, frame);
    }

    /// Backs page `index` of `mapable` with `frame`.
    fn install(
        &mut self,
        machine: &dyn Machine,
        mapable: &Arc<Mapable>,
        index: usize,
        frame: usize,
        zero_fill: bool,
    ) {
        let (table, entry) = mapable.locate(index);
        machine.map_page_to_frame(table, entry, frame);

        let mut pages = mapable.lock_state();
        let page = &mut pages.pages[index];
        if zero_fill && !page.is_initialized() {
            machine.zero_frame(frame);
        }
        page.flags = PageFlags::INITIALIZED | PageFlags::PRESENT;
        page.frame = frame;

        if pages.orphans.is_none() {
            pages.orphans = Some(Arc::clone(&self.orphans));
        }

        self.frames[frame] = Owner::Mapable {
            mapable: Arc::downgrade(mapable),
            index,
        };
    }

    /// Puts a frame that no page uses anymore back where it came from.
    fn return_frame(&mut self, frame: usize) {
        self.unqueue(frame);
        if frame < self.first_frame {
            self.frames[frame] = Owner::Firmware;
        } else {
            self.frames[frame] = Owner::Free;
            self.not_recent.push_front(frame);
        }
    }

    /// Takes back the frames dropped mapables left outside the queues.
    fn reclaim_orphans(&mut self, machine: &dyn Machine) {
        let orphans = Arc::clone(&self.orphans);
        let mut list = orphans.frames.lock(machine);
        while let Some(frame) = list.pop() {
            // Only frames still held by a dead owner; anything else was
            // reused since.
            if matches!(self.frames[frame], Owner::Mapable { .. }) && self.frames[frame].is_free() {
                self.return_frame(frame);
            }
        }
    }

    /// Takes `frame` out of whichever replacement queue holds it.
    fn unqueue(&mut self, frame: usize) {
        if let Some(position) = self.recent.iter().position(|&f| f == frame) {
            self.recent.remove(position);
        } else if let Some(position) = self.not_recent.iter().position(|&f| f == frame) {
            self.not_recent.remove(position);
        }
    }

    /// Puts the resident pages of a half-locked mapable back in the queues.
    fn requeue(&mut self, mapable: &Mapable) {
        let pages = mapable.lock_state();
        for page in pages.pages.iter().filter(|p| p.is_present()) {
            self.recent.push_back(page.frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMachine;

    const MIB: usize = 1 << 20;

    fn small_config() -> KernelConfig {
        KernelConfig {
            kernel_frame_reserve: 16,
            initial_kernel_size: 8 * PAGE_SIZE,
        }
    }

    /// 2 MiB: 256 firmware frames, 8 kernel, 16 reserved, 232 free.
    fn small_pager() -> (&'static FakeMachine, Pager) {
        let machine = FakeMachine::leak(2 * MIB);
        let pager = Pager::new(machine, &small_config()).unwrap();
        (machine, pager)
    }

    #[test]
    fn boot_accounts_for_every_frame() {
        let (_, pager) = small_pager();
        let census = pager.census();
        assert!(census.is_consistent(), "{:?}", census);
        assert_eq!(census.firmware, 256);
        assert_eq!(census.kernel_heap, 8);
        assert_eq!(census.kernel_reserve, 16);
        assert_eq!(census.queued_free, 512 - 256 - 8 - 16);
        assert_eq!(pager.kernel_size(), 8 * PAGE_SIZE);
    }

    #[test]
    fn boot_remaps_the_kernel_image_in_place() {
        let (machine, pager) = small_pager();
        let census = pager.census();
        assert!(census.is_consistent());
        // Kernel page 3 was at physical 1 MiB + 3 pages before the pager ran.
        let table = {
            let _irq = InterruptGuard::new(machine);
            let kernel = pager.kernel.lock(machine);
            kernel.tables[0]
        };
        assert_eq!(machine.entry(table, 3).frame, KERNEL_LOAD_ADDRESS / PAGE_SIZE + 3);
    }

    #[test]
    fn locking_takes_frames_out_of_the_queues() {
        let (machine, pager) = small_pager();
        let mapable = Mapable::new(machine, 3 * PAGE_SIZE).unwrap();
        pager.lock_mapable(&mapable, None).unwrap();

        let census = pager.census();
        assert!(census.is_consistent(), "{:?}", census);
        assert_eq!(census.pinned, 3);
        for index in 0..3 {
            let page = mapable.page(index);
            assert!(page.is_present());
            assert!(machine.was_zeroed(page.frame));
            let (owner, owner_index) = pager.frame_owner(page.frame).unwrap();
            assert!(Arc::ptr_eq(&owner, &mapable));
            assert_eq!(owner_index, index);
        }

        pager.unlock_mapable(&mapable);
        let census = pager.census();
        assert_eq!((census.pinned, census.queued_owned), (0, 3));
        assert!(census.is_consistent());
    }

    #[test]
    #[should_panic(expected = "locked twice")]
    fn double_lock_panics() {
        let (machine, pager) = small_pager();
        let mapable = Mapable::new(machine, PAGE_SIZE).unwrap();
        pager.lock_mapable(&mapable, None).unwrap();
        let _ = pager.lock_mapable(&mapable, None);
    }

    #[test]
    fn fixed_pins_may_use_firmware_frames_but_not_kernel_frames() {
        let (machine, pager) = small_pager();
        let video = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();
        pager.lock_mapable(&video, Some(0xB8000)).unwrap();
        assert_eq!(video.page(1).frame, 0xB9);
        assert!(!machine.was_zeroed(0xB8));
        assert!(pager.census().is_consistent());

        pager.release_mapable(&video);
        let census = pager.census();
        assert!(census.is_consistent(), "{:?}", census);
        assert_eq!(census.firmware, 256);

        let clash = Mapable::new(machine, PAGE_SIZE).unwrap();
        assert_eq!(
            pager.lock_mapable(&clash, Some(KERNEL_LOAD_ADDRESS)),
            Err(KernelError::FrameUnavailable { frame: KERNEL_LOAD_ADDRESS / PAGE_SIZE })
        );
    }

    #[test]
    fn dropping_a_locked_mapable_returns_its_frames() {
        let (machine, pager) = small_pager();
        let before = pager.census();
        let mapable = Mapable::new(machine, 3 * PAGE_SIZE).unwrap();
        pager.lock_mapable(&mapable, None).unwrap();
        let frames: Vec<usize> = (0..3).map(|i| mapable.page(i).frame).collect();

        drop(mapable);
        let census = pager.census();
        assert!(census.is_consistent(), "{:?}", census);
        assert_eq!(census.pinned, 0);
        assert_eq!(census.queued_free, before.queued_free);
        for frame in frames {
            assert!(pager.is_not_recent(frame));
        }
    }

    #[test]
    fn dropping_a_firmware_pin_gives_the_frames_back_to_firmware() {
        let (machine, pager) = small_pager();
        let video = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();
        pager.lock_mapable(&video, Some(0xB8000)).unwrap();
        pager.unlock_mapable(&video);
        drop(video);

        let census = pager.census();
        assert!(census.is_consistent(), "{:?}", census);
        assert_eq!(census.firmware, 256);

        // The same frames can be pinned again.
        let again = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();
        pager.lock_mapable(&again, Some(0xB8000)).unwrap();
        assert_eq!(again.page(0).frame, 0xB8);
    }

    #[test]
    fn orphaned_frames_are_handed_out_again() {
        let (machine, pager) = small_pager();
        let free = pager.census().queued_free;
        let hog = Mapable::new(machine, free * PAGE_SIZE).unwrap();
        pager.lock_mapable(&hog, None).unwrap();
        assert_eq!(pager.census().queued_free, 0);
        drop(hog);

        // Every frame comes back, so the same amount can be locked again.
        let next = Mapable::new(machine, free * PAGE_SIZE).unwrap();
        pager.lock_mapable(&next, None).unwrap();
        assert_eq!(pager.census().pinned, free);
        assert!(pager.census().is_consistent());
    }

    #[test]
    fn fault_outside_every_mapable_is_invalid() {
        let (machine, pager) = small_pager();
        let pageable = Pageable::new(machine).unwrap();
        assert_eq!(
            pager.page_fault(&pageable, 0x1234),
            Err(KernelError::InvalidAccess { address: 0x1234 })
        );
    }

    #[test]
    fn reserve_is_topped_up_and_trimmed() {
        let (_, pager) = small_pager();
        pager.grow_kernel(3 * PAGE_SIZE as isize).unwrap();
        assert_eq!(pager.reserve_len(), 13);
        pager.prepare_next_kernel_size().unwrap();
        assert_eq!(pager.reserve_len(), 16);

        pager.set_kernel_size(4 * PAGE_SIZE).unwrap();
        assert_eq!(pager.reserve_len(), 23);
        pager.prepare_next_kernel_size().unwrap();
        assert_eq!(pager.reserve_len(), 16);
        assert!(pager.census().is_consistent());
    }

    #[test]
    fn top_up_backs_off_inside_a_pager_operation() {
        let (machine, pager) = small_pager();
        pager.grow_kernel(PAGE_SIZE as isize).unwrap();

        let _irq = InterruptGuard::new(machine);
        let outer = pager.state.lock(machine);
        pager.prepare_next_kernel_size().unwrap();
        drop(outer);
        assert_eq!(pager.reserve_len(), 15);

        pager.prepare_next_kernel_size().unwrap();
        assert_eq!(pager.reserve_len(), 16);
    }

    #[test]
    fn growth_beyond_the_reserve_fails_without_side_effects() {
        let (_, pager) = small_pager();
        assert_eq!(
            pager.grow_kernel(17 * PAGE_SIZE as isize),
            Err(KernelError::KernelReserveExhausted)
        );
        assert_eq!(pager.reserve_len(), 16);
        assert_eq!(pager.kernel_size(), 8 * PAGE_SIZE);
    }

    #[test]
    fn kernel_tables_follow_every_pageable() {
        let (machine, pager) = small_pager();
        let pageable = Pageable::new(machine).unwrap();
        pager.add_pageable(&pageable).unwrap();

        let slot = KERNEL_SPACE_BOUNDARY / PAGE_TABLE_SIZE;
        assert!(machine.table_at(pageable.directory(), slot).is_some());

        pager.remove_pageable(&pageable).unwrap();
        assert_eq!(machine.table_at(pageable.directory(), slot), None);
        assert_eq!(pager.remove_pageable(&pageable), Err(KernelError::NotMapped));
    }

    #[test]
    fn clean_pages_are_discarded_and_dirty_pages_are_lost() {
        let (machine, pager) = small_pager();
        let pageable = Pageable::new(machine).unwrap();
        let mapable = Mapable::new(machine, 2 * PAGE_SIZE).unwrap();
        let base = pageable.map(&mapable, None).unwrap();

        pager.page_fault(&pageable, base).unwrap();
        pager.page_fault(&pageable, base + PAGE_SIZE).unwrap();
        let (table, _) = mapable.locate(0);
        machine.touch(table, 1, true);

        let (clean, dirty) = {
            let _irq = InterruptGuard::new(machine);
            let mut state = pager.state.lock(machine);
            let clean = mapable.page(0).frame;
            let dirty = mapable.page(1).frame;
            for frame in [clean, dirty] {
                state.unqueue(frame);
                state.make_frame_available(machine, frame);
                state.not_recent.push_front(frame);
            }
            (clean, dirty)
        };

        assert_eq!(mapable.page(0), Page::default());
        assert!(mapable.page(1).is_initialized());
        assert!(!mapable.page(1).is_present());
        assert!(machine.invalidated().contains(&base));
        assert!(pager.frame_owner(clean).is_none());
        assert!(pager.frame_owner(dirty).is_none());

        assert_eq!(
            pager.page_fault(&pageable, base + PAGE_SIZE),
            Err(KernelError::Unsupported(Unsupported::PageIn))
        );
        pager.page_fault(&pageable, base).unwrap();
        assert!(mapable.page(0).is_present());
        assert!(pager.census().is_consistent());
    }
}
