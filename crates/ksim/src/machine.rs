//! The simulated machine.
//!
//! Physical memory is a byte array and paging goes through `Mmu`. Each
//! hardware task is a host thread; exactly one of them holds the baton and
//! runs at any time, which makes the host behave like a single processor.
//! The thread that starts the machine becomes task 1, the boot context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use nutshell::arch::{
    DirectoryId, Machine, TableId, TaskId, ThreadEntry, KERNEL_LOAD_ADDRESS,
    KERNEL_SPACE_BOUNDARY, PAGE_SIZE,
};
use nutshell::error::{Descriptor, KernelError, Result};

use crate::paging::{Mmu, PageFault, PageTableEntry, PteFlags};

/// Task descriptor of the boot context.
pub const BOOT_TASK: TaskId = TaskId(1);

/// How long the boot context may wait for control to come back before the
/// machine is declared stalled.
const STALL_TIMEOUT: Duration = Duration::from_secs(20);

static NEXT_MACHINE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Task each machine runs on this host thread, by machine id.
    static CURRENT: RefCell<HashMap<u64, TaskId>> = RefCell::new(HashMap::new());
}

#[derive(Debug)]
struct Task {
    /// `None` for the boot context.
    directory: Option<DirectoryId>,
    stack_top: usize,
    interrupts: bool,
}

#[derive(Default)]
struct Tasks {
    slots: HashMap<usize, Task>,
    next: usize,
}

/// Which task holds the processor, and whether any task died.
struct Baton {
    running: TaskId,
    failure: Option<String>,
}

pub struct SimMachine {
    id: u64,
    /// Set by `start`; task threads borrow the machine through it.
    this: OnceLock<&'static SimMachine>,
    memory_size: usize,
    task_limit: usize,
    table_limit: usize,
    directory_limit: usize,
    physical: Mutex<Vec<u8>>,
    mmu: Mutex<Mmu>,
    tasks: Mutex<Tasks>,
    baton: Mutex<Baton>,
    handoff: Condvar,
    switches: AtomicUsize,
    tlb_invalidations: AtomicUsize,
}

impl SimMachine {
    pub fn new(memory_size: usize) -> Self {
        assert!(
            memory_size % PAGE_SIZE == 0 && memory_size > KERNEL_LOAD_ADDRESS,
            "simulated memory must be whole pages above the kernel load address"
        );
        Self {
            id: NEXT_MACHINE.fetch_add(1, Ordering::Relaxed),
            this: OnceLock::new(),
            memory_size,
            task_limit: 64,
            table_limit: 4096,
            directory_limit: 64,
            physical: Mutex::new(vec![0; memory_size]),
            mmu: Mutex::new(Mmu::default()),
            tasks: Mutex::new(Tasks::default()),
            baton: Mutex::new(Baton {
                running: BOOT_TASK,
                failure: None,
            }),
            handoff: Condvar::new(),
            switches: AtomicUsize::new(0),
            tlb_invalidations: AtomicUsize::new(0),
        }
    }

    /// Caps the number of live task descriptors, boot context included.
    pub fn with_task_limit(mut self, limit: usize) -> Self {
        self.task_limit = limit;
        self
    }

    pub fn with_directory_limit(mut self, limit: usize) -> Self {
        self.directory_limit = limit;
        self
    }

    pub fn with_table_limit(mut self, limit: usize) -> Self {
        self.table_limit = limit;
        self
    }

    /// Powers the machine on. The calling host thread becomes the boot
    /// task, running with interrupts enabled.
    pub fn start(self) -> &'static SimMachine {
        let machine: &'static SimMachine = Box::leak(Box::new(self));
        let _ = machine.this.set(machine);
        {
            let mut tasks = machine.lock_tasks();
            tasks.slots.insert(
                BOOT_TASK.0,
                Task {
                    directory: None,
                    stack_top: 0,
                    interrupts: true,
                },
            );
            tasks.next = BOOT_TASK.0 + 1;
        }
        machine.enter(BOOT_TASK);
        machine
    }

    fn enter(&self, task: TaskId) {
        CURRENT.with(|current| {
            current.borrow_mut().insert(self.id, task);
        });
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_mmu(&self) -> MutexGuard<'_, Mmu> {
        self.mmu.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_physical(&self) -> MutexGuard<'_, Vec<u8>> {
        self.physical.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Memory access as a running task sees it ─────────────────

    /// Reads a byte through `directory`, as the processor would.
    pub fn read_u8(&self, directory: DirectoryId, address: usize) -> std::result::Result<u8, PageFault> {
        let physical = self.lock_mmu().translate(directory, address, false)?;
        Ok(self.lock_physical()[physical])
    }

    pub fn write_u8(
        &self,
        directory: DirectoryId,
        address: usize,
        value: u8,
    ) -> std::result::Result<(), PageFault> {
        let physical = self.lock_mmu().translate(directory, address, true)?;
        self.lock_physical()[physical] = value;
        Ok(())
    }

    /// Directory of the running task. The boot context has none until it is
    /// given one.
    pub fn current_directory(&self) -> Option<DirectoryId> {
        let task = self.current_task();
        let tasks = self.lock_tasks();
        tasks.slots.get(&task.0).and_then(|t| t.directory)
    }

    /// Runs the boot context in `directory` from now on.
    pub fn set_boot_directory(&self, directory: DirectoryId) {
        let mut tasks = self.lock_tasks();
        if let Some(boot) = tasks.slots.get_mut(&BOOT_TASK.0) {
            boot.directory = Some(directory);
        }
    }

    // ── Physical memory inspection ──────────────────────────────

    pub fn frame_bytes(&self, frame: usize) -> Vec<u8> {
        let physical = self.lock_physical();
        physical[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE].to_vec()
    }

    pub fn fill_frame(&self, frame: usize, value: u8) {
        let mut physical = self.lock_physical();
        physical[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE].fill(value);
    }

    // ── Page table inspection ───────────────────────────────────

    pub fn entry(&self, table: TableId, index: usize) -> PageTableEntry {
        self.lock_mmu().table(table)[index]
    }

    pub fn table_at(&self, directory: DirectoryId, slot: usize) -> Option<TableId> {
        self.lock_mmu().directory(directory)[slot]
    }

    /// Sets the accessed (and for writes, dirty) bit of a present entry
    /// without going through a directory.
    pub fn touch(&self, table: TableId, index: usize, write: bool) {
        let mut mmu = self.lock_mmu();
        let entry = &mut mmu.table_mut(table)[index];
        assert!(entry.is_present(), "touching a page that is not present");
        entry.set(PteFlags::ACCESSED);
        if write {
            entry.set(PteFlags::DIRTY);
        }
    }

    pub fn live_tables(&self) -> usize {
        self.lock_mmu().live_tables()
    }

    pub fn live_directories(&self) -> usize {
        self.lock_mmu().live_directories()
    }

    pub fn live_tasks(&self) -> usize {
        self.lock_tasks().slots.len()
    }

    /// Stack top the task was created with.
    pub fn stack_top(&self, task: TaskId) -> Option<usize> {
        self.lock_tasks().slots.get(&task.0).map(|t| t.stack_top)
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn tlb_invalidations(&self) -> usize {
        self.tlb_invalidations.load(Ordering::Relaxed)
    }

    // ── Task execution ──────────────────────────────────────────

    /// Blocks the calling host thread until `task` holds the baton. Returns
    /// `false` if the task was released or another task failed first.
    fn wait_to_start(&self, task: TaskId) -> bool {
        let mut baton = self.lock_baton();
        loop {
            if baton.failure.is_some() || !self.lock_tasks().slots.contains_key(&task.0) {
                return false;
            }
            if baton.running == task {
                return true;
            }
            baton = self
                .handoff
                .wait(baton)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn fail(&self, message: String) {
        let mut baton = self.lock_baton();
        baton.failure.get_or_insert(message);
        self.handoff.notify_all();
    }

    fn run_task(&'static self, task: TaskId, entry: ThreadEntry, argument: usize) {
        self.enter(task);
        if !self.wait_to_start(task) {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(argument)));
        let message = match outcome {
            Ok(()) => format!("task {:?} returned from its entry point", task),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("task {:?} panicked: {}", task, reason)
            }
        };
        self.fail(message);
    }
}

impl Machine for SimMachine {
    fn memory_size(&self) -> usize {
        self.memory_size
    }

    fn disable_interrupts(&self) -> bool {
        let task = self.current_task();
        let mut tasks = self.lock_tasks();
        match tasks.slots.get_mut(&task.0) {
            Some(slot) => std::mem::replace(&mut slot.interrupts, false),
            None => false,
        }
    }

    fn enable_interrupts(&self) {
        let task = self.current_task();
        if let Some(slot) = self.lock_tasks().slots.get_mut(&task.0) {
            slot.interrupts = true;
        }
    }

    fn interrupts_enabled(&self) -> bool {
        let task = self.current_task();
        let tasks = self.lock_tasks();
        tasks.slots.get(&task.0).is_some_and(|slot| slot.interrupts)
    }

    fn current_task(&self) -> TaskId {
        CURRENT.with(|current| {
            current
                .borrow()
                .get(&self.id)
                .copied()
                .unwrap_or(TaskId::NONE)
        })
    }

    fn allocate_task(
        &self,
        directory: DirectoryId,
        stack_top: usize,
        entry: ThreadEntry,
        argument: usize,
    ) -> Result<TaskId> {
        let task = {
            let mut tasks = self.lock_tasks();
            if tasks.slots.len() >= self.task_limit {
                return Err(KernelError::OutOfDescriptors(Descriptor::Task));
            }
            let task = TaskId(tasks.next);
            tasks.next += 1;
            tasks.slots.insert(
                task.0,
                Task {
                    directory: Some(directory),
                    stack_top,
                    interrupts: true,
                },
            );
            task
        };

        let Some(&machine) = self.this.get() else {
            panic!("simulated machine {} was not started", self.id);
        };
        let spawned = thread::Builder::new()
            .name(format!("ksim-{}-task-{}", self.id, task.0))
            .spawn(move || machine.run_task(task, entry, argument));
        if spawned.is_err() {
            self.lock_tasks().slots.remove(&task.0);
            return Err(KernelError::OutOfDescriptors(Descriptor::Task));
        }
        Ok(task)
    }

    fn release_task(&self, task: TaskId) {
        assert_ne!(task, BOOT_TASK, "the boot context cannot be released");
        self.lock_tasks().slots.remove(&task.0);
        // Lets a task that never ran notice it is gone.
        let _baton = self.lock_baton();
        self.handoff.notify_all();
    }

    fn switch_to_task(&self, task: TaskId) {
        let me = self.current_task();
        assert!(
            self.lock_tasks().slots.contains_key(&task.0),
            "switch to released task {:?}",
            task
        );
        self.switches.fetch_add(1, Ordering::Relaxed);

        let mut baton = self.lock_baton();
        baton.running = task;
        self.handoff.notify_all();

        // Only the boot context gives up; task threads may legitimately sleep
        // for the rest of the run.
        let started = Instant::now();
        while baton.running != me {
            if let Some(failure) = &baton.failure {
                panic!("simulated machine halted: {}", failure);
            }
            if me != BOOT_TASK {
                baton = self
                    .handoff
                    .wait(baton)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                continue;
            }
            let Some(left) = STALL_TIMEOUT.checked_sub(started.elapsed()) else {
                let message = format!("task {:?} never got the processor back", me);
                baton.failure.get_or_insert(message.clone());
                self.handoff.notify_all();
                panic!("simulated machine stalled: {}", message);
            };
            baton = self
                .handoff
                .wait_timeout(baton, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn allocate_page_directory(&self) -> Result<DirectoryId> {
        let mut mmu = self.lock_mmu();
        if mmu.live_directories() >= self.directory_limit {
            return Err(KernelError::OutOfDescriptors(Descriptor::PageDirectory));
        }
        Ok(mmu.allocate_directory())
    }

    fn release_page_directory(&self, directory: DirectoryId) {
        self.lock_mmu().directories[directory.0] = None;
    }

    fn allocate_page_table(&self) -> Result<TableId> {
        let mut mmu = self.lock_mmu();
        if mmu.live_tables() >= self.table_limit {
            return Err(KernelError::OutOfDescriptors(Descriptor::PageTable));
        }
        Ok(mmu.allocate_table())
    }

    fn release_page_table(&self, table: TableId) {
        self.lock_mmu().tables[table.0] = None;
    }

    fn map_table_to_directory(&self, directory: DirectoryId, table: TableId, index: usize) {
        self.lock_mmu().directory_mut(directory)[index] = Some(table);
    }

    fn unmap_table_from_directory(&self, directory: DirectoryId, index: usize) {
        self.lock_mmu().directory_mut(directory)[index] = None;
    }

    fn map_page_to_frame(&self, table: TableId, page: usize, frame: usize) {
        assert!(frame * PAGE_SIZE < self.memory_size, "frame {:#x} out of memory", frame);
        self.lock_mmu().table_mut(table)[page] =
            PageTableEntry::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE);
    }

    fn unmap_page(&self, table: TableId, page: usize) {
        self.lock_mmu().table_mut(table)[page] = PageTableEntry::default();
    }

    fn reset_page_accessed(&self, table: TableId, page: usize) -> bool {
        let mut mmu = self.lock_mmu();
        let entry = &mut mmu.table_mut(table)[page];
        let accessed = entry.flags().contains(PteFlags::ACCESSED);
        entry.clear(PteFlags::ACCESSED);
        accessed
    }

    fn page_dirty(&self, table: TableId, page: usize) -> bool {
        self.lock_mmu().table(table)[page]
            .flags()
            .contains(PteFlags::DIRTY)
    }

    fn invalidate_tlb_entry(&self, _address: usize) {
        self.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn physical_address(&self, address: usize) -> usize {
        KERNEL_LOAD_ADDRESS + (address - KERNEL_SPACE_BOUNDARY)
    }

    fn zero_frame(&self, frame: usize) {
        self.fill_frame(frame, 0);
    }
}
