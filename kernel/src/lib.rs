// =============================================================================
// Nutshell - Kernel Core
// =============================================================================
//
// The virtual memory manager and the thread scheduler of the Nutshell i386
// kernel. The two are mutually dependent: threads lock their kernel stacks
// through the pager, the pager resolves faults against the current thread's
// process, and the kernel heap grows through frames the pager reserves.
//
// LAYOUT:
//   arch     - the `Machine` trait: everything that touches hardware
//   sync     - SpinLock (task-keyed), InterruptGuard, Mutex, Event
//   memory   - Blocks, Mapable, Pageable, Pager, kernel heap hooks
//   task     - Thread, thread-specific storage, run queue, Scheduler, Process
//   kernel   - the `Kernel` context threaded through every entry point
//
// Nothing in here is a global singleton except the optional C allocator
// bridge in `memory::heap`. Interrupt handlers reach the core through
// `Kernel::clock` and `Kernel::page_fault`.
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod sync;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use error::{KernelError, Result, Unsupported};
pub use kernel::Kernel;
