// =============================================================================
// ksim - Simulated i386 Machine
// =============================================================================
//
// A hosted implementation of `nutshell::arch::Machine` for tests:
//
//   paging   - software page tables with accessed/dirty bits
//   machine  - physical memory, descriptors, per-task interrupt flags and
//              hardware tasks realised as host threads sharing one baton
//   logger   - `log` sink in the kernel console's format
//   harness  - boot, spawn closures as threads, faulting loads and stores
//
// Only one simulated task runs at a time, so the kernel core sees a single
// processor even though every task owns a host thread.
// =============================================================================

pub mod harness;
pub mod logger;
pub mod machine;
pub mod paging;

pub use harness::{boot, Sim};
pub use machine::{SimMachine, BOOT_TASK};
pub use paging::{PageFault, PageTableEntry, PteFlags};
