//! Threads, processes and the priority scheduler.
//!
//! The run queue holds the pure priority arithmetic; the scheduler wraps it
//! in a spinlock and performs the machine-level switches.

pub mod process;
pub mod run_queue;
pub mod scheduler;
pub mod specific;
pub mod thread;

pub use process::Process;
pub use run_queue::{Channel, RunQueue, ThreadState, EFFECTIVE_PRIORITY_LIMIT};
pub use scheduler::Scheduler;
pub use specific::{SpecificDestructor, SpecificKey, SpecificKeys};
pub use thread::{Priority, Thread, ThreadId, KERNEL_STACK_SIZE};
