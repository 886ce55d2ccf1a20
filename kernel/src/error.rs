//! Kernel error type.
//!
//! Resource exhaustion and unimplemented extensions surface as
//! `KernelError` values; broken invariants (double-locking a mapable,
//! unlocking a spinlock held by another task) stay assertions.

use core::fmt;

/// Which kind of machine descriptor ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Task,
    PageTable,
    PageDirectory,
}

/// Operations the kernel deliberately does not support yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// Reloading an evicted dirty page. There is no backing store.
    PageIn,
}

/// Errors returned by kernel core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every physical frame is in use and none can be evicted.
    OutOfFrames,
    /// The kernel heap tried to grow past its reserved frame pool.
    KernelReserveExhausted,
    /// No free virtual range of `size` bytes is left in the address space.
    AddressSpaceExhausted { size: usize },
    /// A fixed-address reservation overlaps memory that is not free.
    RangeNotFree { address: usize, size: usize },
    /// The machine has no free descriptor of this kind.
    OutOfDescriptors(Descriptor),
    /// A page fault hit an address no mapable covers.
    InvalidAccess { address: usize },
    /// The mapable is not mapped in this pageable.
    NotMapped,
    /// A fixed-address pin targets a frame the kernel itself owns.
    FrameUnavailable { frame: usize },
    /// A fixed-address pin was requested for a mapable with resident pages.
    MapableResident,
    /// The thread is running and cannot be removed.
    ThreadBusy,
    /// No thread with this id is known to the scheduler.
    UnknownThread,
    /// The operation needs a current thread and none is running.
    NoCurrentThread,
    /// The thread's process has already been dropped.
    ProcessGone,
    /// The operation is a known extension point that is not implemented.
    Unsupported(Unsupported),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::KernelReserveExhausted => write!(f, "out of available frames for kernel memory"),
            Self::AddressSpaceExhausted { size } => {
                write!(f, "no free virtual range of {:#x} bytes", size)
            }
            Self::RangeNotFree { address, size } => {
                write!(f, "range {:#010x}+{:#x} is not free", address, size)
            }
            Self::OutOfDescriptors(kind) => write!(f, "out of {:?} descriptors", kind),
            Self::InvalidAccess { address } => write!(f, "invalid access at {:#010x}", address),
            Self::NotMapped => write!(f, "mapable is not mapped in this address space"),
            Self::FrameUnavailable { frame } => write!(f, "frame {:#x} belongs to the kernel", frame),
            Self::MapableResident => write!(f, "mapable already has resident pages"),
            Self::ThreadBusy => write!(f, "thread is running"),
            Self::UnknownThread => write!(f, "unknown thread"),
            Self::NoCurrentThread => write!(f, "no current thread"),
            Self::ProcessGone => write!(f, "process no longer exists"),
            Self::Unsupported(what) => write!(f, "unsupported operation: {:?}", what),
        }
    }
}

/// Result alias used throughout the kernel core.
pub type Result<T> = core::result::Result<T, KernelError>;
