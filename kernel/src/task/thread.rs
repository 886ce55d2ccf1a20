//! Threads, the unit the scheduler runs.
//!
//! A thread owns a hardware task descriptor and a kernel stack. The stack is
//! a mapable locked into memory and mapped into the owning process, so the
//! processor can switch to it without ever faulting.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{Machine, TaskId, ThreadEntry, PAGE_SIZE};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::memory::Mapable;
use crate::sync::{InterruptGuard, SpinLock};
use crate::task::process::Process;
use crate::task::specific::{SpecificKey, SpecificValue};

/// Size of every kernel stack (64 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * PAGE_SIZE;

// ── Thread identifiers ──────────────────────────────────────────

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Unique, never reused thread identifier. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u64) -> ThreadId {
        ThreadId(raw)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Priorities ──────────────────────────────────────────────────

/// Base scheduling priority. Lower values run sooner, and the value is also
/// what a thread pays each time it is switched out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum Priority {
    Realtime = 0,
    High = 25,
    #[default]
    Normal = 50,
    Low = 75,
    VeryLow = 100,
}

impl Priority {
    pub const fn value(self) -> i32 {
        self as i32
    }
}

// ── Thread ──────────────────────────────────────────────────────

pub struct Thread {
    id: ThreadId,
    kernel: &'static Kernel,
    process: Weak<Process>,
    task: TaskId,
    /// `None` for the adopted boot context, which runs on the loader's
    /// stack and task descriptor.
    stack: Option<Arc<Mapable>>,
    priority: Priority,
    /// Thread-specific values indexed by key. Missing slots read as zero.
    specifics: SpinLock<Vec<SpecificValue>>,
}

impl Thread {
    /// Creates a thread of `process` that will start in `entry(argument)`.
    ///
    /// The thread is not scheduled; see `Kernel::spawn`.
    pub fn new(
        kernel: &'static Kernel,
        process: &Arc<Process>,
        entry: ThreadEntry,
        argument: usize,
        priority: Priority,
    ) -> Result<Arc<Thread>> {
        let machine = kernel.machine();
        let pager = kernel.pager();

        let stack = Mapable::new(machine, KERNEL_STACK_SIZE)?;
        pager.lock_mapable(&stack, None)?;

        let base = match process.pageable().map(&stack, None) {
            Ok(base) => base,
            Err(err) => {
                pager.release_mapable(&stack);
                return Err(err);
            }
        };

        let directory = process.pageable().directory();
        let task = match machine.allocate_task(directory, base + KERNEL_STACK_SIZE, entry, argument)
        {
            Ok(task) => task,
            Err(err) => {
                if let Err(unmap) = process.pageable().unmap(&stack) {
                    log::warn!("stack of failed thread already unmapped: {}", unmap);
                }
                pager.release_mapable(&stack);
                return Err(err);
            }
        };

        let thread = Thread {
            id: alloc_tid(),
            kernel,
            process: Arc::downgrade(process),
            task,
            stack: Some(stack),
            priority,
            specifics: SpinLock::new(Vec::new()),
        };
        log::info!(
            "thread {} created in process {} (task {:?}, stack at {:#010x})",
            thread.id,
            process.id(),
            task,
            base
        );
        Ok(Arc::new(thread))
    }

    /// Wraps the execution context that is already running, typically the
    /// boot code, into a thread of `process`.
    pub fn adopt(kernel: &'static Kernel, process: &Arc<Process>, priority: Priority) -> Arc<Thread> {
        let task = kernel.machine().current_task();
        let thread = Thread {
            id: alloc_tid(),
            kernel,
            process: Arc::downgrade(process),
            task,
            stack: None,
            priority,
            specifics: SpinLock::new(Vec::new()),
        };
        log::info!("thread {} adopted task {:?}", thread.id, task);
        Arc::new(thread)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The owning process, unless it is already gone.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn stack(&self) -> Option<&Arc<Mapable>> {
        self.stack.as_ref()
    }

    fn machine(&self) -> &'static dyn Machine {
        self.kernel.machine()
    }

    /// Value stored under `key`, zero if never set.
    pub fn specific(&self, key: SpecificKey) -> usize {
        let _irq = InterruptGuard::new(self.machine());
        let values = self.specifics.lock(self.machine());
        values.get(key.index()).map_or(0, |stored| stored.get(key))
    }

    pub fn set_specific(&self, key: SpecificKey, value: usize) {
        let _irq = InterruptGuard::new(self.machine());
        let mut values = self.specifics.lock(self.machine());
        if values.len() <= key.index() {
            values.resize(key.index() + 1, SpecificValue::default());
        }
        values[key.index()] = SpecificValue::new(key, value);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let values = core::mem::take(self.specifics.get_mut());
        self.kernel.specifics().run_destructors(&values);

        if let Some(stack) = self.stack.take() {
            if let Some(process) = self.process.upgrade() {
                if let Err(err) = process.pageable().unmap(&stack) {
                    log::warn!("thread {}: stack already unmapped: {}", self.id, err);
                }
            }
            self.kernel.pager().release_mapable(&stack);
            self.kernel.machine().release_task(self.task);
        }
        log::info!("thread {} destroyed", self.id);
    }
}
