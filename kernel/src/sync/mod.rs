// =============================================================================
// Nutshell - Kernel Synchronization Primitives
// =============================================================================
//
// Two kinds of locks, keyed by two different identities:
//
//   SpinLock - recursive per hardware task descriptor. Busy-waits. Must be
//              taken with interrupts disabled and never held across a task
//              switch.
//   Mutex    - recursive per Thread. Sleeps on the scheduler when contended,
//              so it may be held across a switch.
//
// Event is a broadcast wakeup with no memory of past signals.
//
// IMPORTANT: Lock ordering rules:
//   interrupts disabled → pager lock → pageable lock → mapable lock
//   interrupts disabled → pager lock → orphan list
//   interrupts disabled → scheduler lock
//
// The kernel-size lock is only ever taken with the pager lock already held
// or from the allocator hooks, and nothing else is acquired under it.
// =============================================================================

pub mod event;
pub mod interrupt;
pub mod mutex;
pub mod spinlock;

pub use event::Event;
pub use interrupt::InterruptGuard;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{HeldLock, SpinLock, SpinLockGuard};
