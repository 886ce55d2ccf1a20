use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use ksim::harness::{self, run_until};
use ksim::SimMachine;
use nutshell::arch::PAGE_SIZE;
use nutshell::error::{Descriptor, KernelError};
use nutshell::memory::Mapable;
use nutshell::task::{Priority, KERNEL_STACK_SIZE};
use nutshell::KernelConfig;

const MEMORY: usize = 16 << 20;

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn record_destroyed(value: usize) {
    DESTROYED.fetch_add(value, Ordering::SeqCst);
}

#[test]
fn thread_lifecycle_releases_stack_and_task() {
    let sim = harness::boot(MEMORY, KernelConfig::default());
    let kernel = sim.kernel;
    let scheduler = kernel.scheduler();
    let pager = kernel.pager();
    let before = pager.census();
    let tasks_before = sim.machine.live_tasks();
    let key = kernel.allocate_specific(Some(record_destroyed));

    let ran = Arc::new(AtomicBool::new(false));
    let thread = {
        let ran = Arc::clone(&ran);
        harness::spawn(kernel, &sim.process, Priority::Normal, move || {
            let me = kernel.scheduler().current().unwrap();
            assert_eq!(me.specific(key), 0);
            me.set_specific(key, 7);
            assert_eq!(me.specific(key), 7);
            ran.store(true, Ordering::SeqCst);
        })
        .unwrap()
    };

    let stack = Arc::clone(thread.stack().unwrap());
    assert!(stack.is_locked());
    assert_eq!(stack.resident_pages(), KERNEL_STACK_SIZE / PAGE_SIZE);
    assert_eq!(pager.census().pinned, before.pinned + 16);
    assert_eq!(sim.machine.live_tasks(), tasks_before + 1);

    let top = sim.machine.stack_top(thread.task()).unwrap();
    let (found, base) = sim.process.pageable().lookup(top - 1).unwrap();
    assert!(Arc::ptr_eq(&found, &stack));
    assert_eq!(top, base + KERNEL_STACK_SIZE);

    assert!(run_until(kernel, 10, || ran.load(Ordering::SeqCst)));

    assert!(matches!(
        scheduler.remove_thread(sim.boot.id()),
        Err(KernelError::ThreadBusy)
    ));
    let removed = scheduler.remove_thread(thread.id()).unwrap();
    assert!(scheduler.thread(thread.id()).is_none());
    drop(removed);
    drop(thread);

    assert_eq!(DESTROYED.load(Ordering::SeqCst), 7);
    assert_eq!(sim.machine.live_tasks(), tasks_before);
    assert!(!stack.is_locked());
    assert_eq!(stack.resident_pages(), 0);
    assert_eq!(sim.process.pageable().mapable_count(), 0);
    let after = pager.census();
    assert_eq!(after.pinned, before.pinned);
    assert!(after.is_consistent(), "{:?}", after);

    kernel.release_specific(key);
}

#[test]
fn removing_an_unknown_thread_fails() {
    let sim = harness::boot(MEMORY, KernelConfig::default());
    let scheduler = sim.kernel.scheduler();
    let thread = harness::spawn(sim.kernel, &sim.process, Priority::Low, || {}).unwrap();

    scheduler.remove_thread(thread.id()).unwrap();
    assert!(matches!(
        scheduler.remove_thread(thread.id()),
        Err(KernelError::UnknownThread)
    ));
}

#[test]
fn task_exhaustion_rolls_back_the_stack() {
    let machine = SimMachine::new(MEMORY).with_task_limit(3);
    let sim = harness::boot_on(machine, KernelConfig::default());
    let pager = sim.kernel.pager();

    let _first = harness::spawn(sim.kernel, &sim.process, Priority::Normal, || {}).unwrap();
    let _second = harness::spawn(sim.kernel, &sim.process, Priority::Normal, || {}).unwrap();
    let before = pager.census();
    let mapables = sim.process.pageable().mapable_count();

    let third = harness::spawn(sim.kernel, &sim.process, Priority::Normal, || {});
    assert!(matches!(
        third,
        Err(KernelError::OutOfDescriptors(Descriptor::Task))
    ));

    let after = pager.census();
    assert_eq!(after.pinned, before.pinned);
    assert!(after.is_consistent(), "{:?}", after);
    assert_eq!(sim.process.pageable().mapable_count(), mapables);
    assert_eq!(sim.kernel.scheduler().thread_count(), 3);
}

#[test]
fn threads_fault_in_their_own_process() {
    let sim = harness::boot(MEMORY, KernelConfig::default());
    let kernel = sim.kernel;
    let other = kernel.create_process().unwrap();
    let mapable = Mapable::new(sim.machine, PAGE_SIZE).unwrap();
    let base = other.pageable().map(&mapable, None).unwrap();

    // The boot process has nothing mapped there.
    assert_eq!(
        kernel.page_fault(base),
        Err(KernelError::InvalidAccess { address: base })
    );

    let result = Arc::new(StdMutex::new(None));
    {
        let result = Arc::clone(&result);
        harness::spawn(kernel, &other, Priority::Normal, move || {
            *result.lock().unwrap() = Some(kernel.page_fault(base));
        })
        .unwrap();
    }
    assert!(run_until(kernel, 10, || result.lock().unwrap().is_some()));
    assert_eq!(*result.lock().unwrap(), Some(Ok(())));
    assert!(mapable.page(0).is_present());
}

static STALE: AtomicUsize = AtomicUsize::new(0);

fn record_stale(value: usize) {
    STALE.fetch_add(value, Ordering::SeqCst);
}

#[test]
fn released_specific_keys_forget_old_values() {
    let sim = harness::boot(MEMORY, KernelConfig::default());
    let kernel = sim.kernel;

    let first = kernel.allocate_specific(None);
    let second = kernel.allocate_specific(None);
    assert_ne!(first.index(), second.index());
    sim.boot.set_specific(second, 99);
    assert_eq!(sim.boot.specific(second), 99);
    assert_eq!(sim.boot.specific(first), 0);

    let thread = harness::spawn(kernel, &sim.process, Priority::Low, || {}).unwrap();
    thread.set_specific(second, 5);

    kernel.release_specific(second);
    let reused = kernel.allocate_specific(Some(record_stale));
    assert_eq!(reused.index(), second.index());
    assert_eq!(sim.boot.specific(reused), 0);
    assert_eq!(thread.specific(reused), 0);

    let removed = kernel.scheduler().remove_thread(thread.id()).unwrap();
    drop(removed);
    drop(thread);
    assert_eq!(STALE.load(Ordering::SeqCst), 0);
}
