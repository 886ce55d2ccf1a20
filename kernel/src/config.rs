//! Runtime configuration for the kernel core.

/// Low watermark of the kernel frame reserve.
pub const KERNEL_FRAME_RESERVE: usize = 256;

/// Bytes the boot image and early heap occupy above the kernel boundary.
pub const INITIAL_KERNEL_SIZE: usize = 256 * 1024;

/// Knobs fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Frames kept aside so the kernel heap can grow without recursing
    /// into the replacement policy.
    pub kernel_frame_reserve: usize,
    /// Size of the kernel image and boot heap, a multiple of the page size.
    /// These pages are already mapped when the pager takes over.
    pub initial_kernel_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_frame_reserve: KERNEL_FRAME_RESERVE,
            initial_kernel_size: INITIAL_KERNEL_SIZE,
        }
    }
}
