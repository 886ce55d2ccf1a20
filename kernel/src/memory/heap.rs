//! Kernel heap hooks.
//!
//! The kernel allocator is an external `malloc` built around `sbrk`. It calls
//! a pre-action hook before and a post-action hook after every operation,
//! and a failure hook when it cannot satisfy a request. The hooks serialize
//! the allocator with a task-keyed spinlock and, once the allocator is done,
//! let the pager refill the frame reserve the next `sbrk` will draw from.
//!
//! Interrupts are disabled from the outermost pre-action to the matching
//! post-action so the heap lock is never held across a task switch.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use crate::error::Result;
use crate::kernel::Kernel;
use crate::sync::SpinLock;

/// Allocator serialization state kept in the kernel context.
pub struct HeapHooks {
    lock: SpinLock<()>,
    /// Interrupt state saved by the outermost pre-action.
    interrupts_were_enabled: AtomicBool,
}

impl HeapHooks {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(()),
            interrupts_were_enabled: AtomicBool::new(false),
        }
    }
}

impl Default for HeapHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Moves the kernel break by `increment` bytes and returns the old
    /// break as a linear address.
    pub fn sbrk(&self, increment: isize) -> Result<usize> {
        self.pager.grow_kernel(increment)
    }

    pub fn malloc_pre_action(&self) {
        let was_enabled = self.machine.disable_interrupts();
        if self.heap.lock.acquire(self.machine) == 1 {
            self.heap
                .interrupts_were_enabled
                .store(was_enabled, Ordering::Relaxed);
        }
    }

    /// # Panics
    /// If the frame reserve cannot be refilled.
    pub fn malloc_post_action(&self) {
        let remaining = self.heap.lock.release(self.machine);
        if let Err(err) = self.pager.prepare_next_kernel_size() {
            log::error!("heap: frame reserve refill failed: {}", err);
            panic!("kernel frame reserve refill failed: {}", err);
        }
        if remaining == 0 && self.heap.interrupts_were_enabled.load(Ordering::Relaxed) {
            self.machine.enable_interrupts();
        }
    }

    pub fn malloc_failure_action(&self) -> ! {
        log::error!(
            "heap: allocation failed with the break at {:#x} bytes",
            self.pager.kernel_size()
        );
        panic!("kernel heap allocation failed");
    }

    /// Whether this task is currently inside the allocator.
    pub fn in_allocator(&self) -> bool {
        self.heap.lock.count(self.machine) > 0
    }
}

// ── C allocator bridge ──────────────────────────────────────────

/// Kernel the C allocator's hooks report to. Set once at boot.
static BRIDGE: Once<&'static Kernel> = Once::new();

/// Routes the `nutshell_*` allocator symbols to `kernel`. Returns `false`
/// if a kernel was already installed.
pub fn install(kernel: &'static Kernel) -> bool {
    let mut installed = false;
    BRIDGE.call_once(|| {
        installed = true;
        kernel
    });
    installed
}

#[no_mangle]
pub extern "C" fn nutshell_malloc_pre_action() {
    if let Some(kernel) = BRIDGE.get() {
        kernel.malloc_pre_action();
    }
}

#[no_mangle]
pub extern "C" fn nutshell_malloc_post_action() {
    if let Some(kernel) = BRIDGE.get() {
        kernel.malloc_post_action();
    }
}

#[no_mangle]
pub extern "C" fn nutshell_malloc_failure_action() -> ! {
    match BRIDGE.get() {
        Some(kernel) => kernel.malloc_failure_action(),
        None => panic!("kernel heap allocation failed"),
    }
}

/// `sbrk` for the C allocator. Returns `usize::MAX`, the C `(void *)-1`,
/// when the break cannot move.
#[no_mangle]
pub extern "C" fn nutshell_sbrk(increment: isize) -> usize {
    let Some(kernel) = BRIDGE.get() else {
        return usize::MAX;
    };
    match kernel.sbrk(increment) {
        Ok(address) => address,
        Err(err) => {
            log::warn!("heap: sbrk({}) refused: {}", increment, err);
            usize::MAX
        }
    }
}
