//! The kernel context.
//!
//! One `Kernel` is built at boot, leaked, and passed by `&'static`
//! reference to every entry point: interrupt handlers, the allocator hooks,
//! and every thread and process.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::arch::{Machine, ThreadEntry};
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::memory::heap::HeapHooks;
use crate::memory::Pager;
use crate::task::{Priority, Process, Scheduler, SpecificDestructor, SpecificKey, SpecificKeys, Thread};

pub struct Kernel {
    pub(crate) machine: &'static dyn Machine,
    pub(crate) config: KernelConfig,
    pub(crate) pager: Pager,
    pub(crate) scheduler: Scheduler,
    pub(crate) specifics: SpecificKeys,
    pub(crate) heap: HeapHooks,
}

impl Kernel {
    /// Takes over physical memory and returns the context for the rest of
    /// the machine's lifetime.
    pub fn boot(machine: &'static dyn Machine, config: KernelConfig) -> Result<&'static Kernel> {
        log::info!(
            "nutshell: booting with {} KiB of physical memory",
            machine.memory_size() / 1024
        );
        let pager = Pager::new(machine, &config)?;
        let kernel = Box::leak(Box::new(Kernel {
            machine,
            config,
            pager,
            scheduler: Scheduler::new(machine),
            specifics: SpecificKeys::new(machine),
            heap: HeapHooks::new(),
        }));
        log::info!("nutshell: kernel core ready");
        Ok(kernel)
    }

    pub fn machine(&self) -> &'static dyn Machine {
        self.machine
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn specifics(&self) -> &SpecificKeys {
        &self.specifics
    }

    // ── Processes and threads ───────────────────────────────────

    pub fn create_process(&'static self) -> Result<Arc<Process>> {
        Process::new(self)
    }

    /// Creates a thread in `process` and makes it ready.
    pub fn spawn(
        &'static self,
        process: &Arc<Process>,
        entry: ThreadEntry,
        argument: usize,
        priority: Priority,
    ) -> Result<Arc<Thread>> {
        let thread = Thread::new(self, process, entry, argument, priority)?;
        self.scheduler.add_thread(Arc::clone(&thread));
        Ok(thread)
    }

    /// Turns the running boot context into the first thread and makes it
    /// current. Must be called before any other thread is scheduled.
    pub fn adopt_boot_thread(&'static self, process: &Arc<Process>, priority: Priority) -> Arc<Thread> {
        let thread = Thread::adopt(self, process, priority);
        self.scheduler.add_thread(Arc::clone(&thread));
        self.scheduler.switch();
        thread
    }

    // ── Interrupt entry points ──────────────────────────────────

    /// Timer tick.
    pub fn clock(&self) {
        self.scheduler.clock();
    }

    /// Page fault at `address` in the current thread's address space.
    pub fn page_fault(&self, address: usize) -> Result<()> {
        let thread = self.scheduler.current().ok_or(KernelError::NoCurrentThread)?;
        let process = thread.process().ok_or(KernelError::ProcessGone)?;
        self.pager.page_fault(process.pageable(), address)
    }

    // ── Thread-specific storage ─────────────────────────────────

    pub fn allocate_specific(&self, destructor: Option<SpecificDestructor>) -> SpecificKey {
        self.specifics.allocate(destructor)
    }

    pub fn release_specific(&self, key: SpecificKey) {
        self.specifics.release(key);
    }
}
