//! The C allocator entry points, routed to a booted kernel.

use ksim::harness;
use nutshell::arch::{KERNEL_SPACE_BOUNDARY, PAGE_SIZE};
use nutshell::memory::heap::{
    install, nutshell_malloc_post_action, nutshell_malloc_pre_action, nutshell_sbrk,
};
use nutshell::KernelConfig;

#[test]
fn allocator_symbols_drive_the_installed_kernel() {
    // Before boot the break cannot move.
    assert_eq!(nutshell_sbrk(PAGE_SIZE as isize), usize::MAX);

    let sim = harness::boot(16 << 20, KernelConfig::default());
    let kernel = sim.kernel;
    let pager = kernel.pager();
    assert!(install(kernel));
    assert!(!install(kernel));

    let initial = pager.kernel_size();
    nutshell_malloc_pre_action();
    assert!(kernel.in_allocator());
    assert!(!kernel.machine().interrupts_enabled());

    let old = nutshell_sbrk(3 * PAGE_SIZE as isize);
    assert_eq!(old, KERNEL_SPACE_BOUNDARY + initial);
    assert_eq!(pager.reserve_len(), pager.watermark() - 3);

    nutshell_malloc_post_action();
    assert!(!kernel.in_allocator());
    assert!(kernel.machine().interrupts_enabled());
    assert_eq!(pager.reserve_len(), pager.watermark());
    assert_eq!(pager.kernel_size(), initial + 3 * PAGE_SIZE);

    // Asking for more than the reserve holds is refused, not fatal.
    let huge = (pager.watermark() + 1) * PAGE_SIZE;
    assert_eq!(nutshell_sbrk(huge as isize), usize::MAX);
    assert_eq!(pager.kernel_size(), initial + 3 * PAGE_SIZE);

    // The freshly grown heap is visible from the boot process.
    let directory = sim.process.pageable().directory();
    sim.machine.write_u8(directory, old, 0x77).unwrap();
    assert_eq!(sim.machine.read_u8(directory, old), Ok(0x77));
}
