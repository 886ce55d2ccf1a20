// =============================================================================
// Nutshell - Recursive Task-Keyed Spinlock
// =============================================================================
//
// A spinlock provides mutual exclusion between hardware tasks on a single
// core. The holder is identified by its task descriptor, not by a Thread:
// this is the identity the machine switches on, and it is valid even before
// the scheduler has created any Thread at all.
//
// HOW IT WORKS:
//   - `owner` holds the descriptor of the holding task, or 0 when free
//   - To lock: if we already own it, just bump `count`. Otherwise spin on a
//     compare-and-swap from 0 to our descriptor, then bump `count`.
//   - To unlock: decrement `count`; at zero, store 0 into `owner`.
//
// RECURSION:
//   The pager must tell whether it has been re-entered from inside one of
//   its own operations (an allocation made while the pager lock is held
//   grows the kernel heap, which calls back into the pager). Guards record
//   their recursion depth so the callee can see `is_nested()` and back off.
//   A nested guard only proves ownership; deref-ing it panics, because the
//   outer guard already hands out the data.
//
// IRQ DISCIPLINE:
//   Unlike a lock that masks interrupts itself, this one asserts that the
//   caller already did (see `InterruptGuard`). A spinlock is never held
//   across a preemption point: on one core, a task that switched away while
//   holding it would leave every other task spinning forever.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{Machine, TaskId};

/// A recursive spinlock keyed by the current hardware task.
///
/// # Examples
/// ```ignore
/// let _irq = InterruptGuard::new(machine);
/// let mut frames = self.frames.lock(machine);
/// frames.push(frame);
/// // lock released, then interrupts restored
/// ```
pub struct SpinLock<T> {
    /// Descriptor of the holding task, `TaskId::NONE` when free.
    owner: AtomicUsize,

    /// Recursion depth. Only touched by the owner.
    count: AtomicUsize,

    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the lock; a value moves between
// tasks when the lock changes hands, so `T: Send` is required.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(TaskId::NONE.0),
            count: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning while another task holds it.
    ///
    /// # Panics
    /// If interrupts are enabled.
    pub fn lock<'a>(&'a self, machine: &'a dyn Machine) -> SpinLockGuard<'a, T> {
        let depth = self.acquire(machine);
        SpinLockGuard {
            lock: self,
            machine,
            depth,
        }
    }

    /// Acquires the lock only if it is free or already ours.
    pub fn try_lock<'a>(&'a self, machine: &'a dyn Machine) -> Option<SpinLockGuard<'a, T>> {
        let task = holder(machine);
        if self.owner.load(Ordering::Relaxed) != task
            && self
                .owner
                .compare_exchange(TaskId::NONE.0, task, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return None;
        }
        let depth = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        Some(SpinLockGuard {
            lock: self,
            machine,
            depth,
        })
    }

    /// Takes the lock without a guard and returns the new recursion depth.
    ///
    /// For callers that cannot keep a guard alive between lock and unlock,
    /// such as the allocator's pre- and post-action hooks. Every `acquire`
    /// must be paired with one `release` from the same task.
    pub fn acquire(&self, machine: &dyn Machine) -> usize {
        let task = holder(machine);
        if self.owner.load(Ordering::Relaxed) != task {
            while self
                .owner
                .compare_exchange_weak(TaskId::NONE.0, task, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops one level of recursion and returns the remaining depth.
    ///
    /// # Panics
    /// If the current task does not hold the lock.
    pub fn release(&self, machine: &dyn Machine) -> usize {
        let task = holder(machine);
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            task,
            "spin lock released by a task that does not hold it"
        );
        let remaining = self.count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            self.owner.store(TaskId::NONE.0, Ordering::Release);
        }
        remaining
    }

    /// Recursion depth held by the current task, 0 if it does not hold the
    /// lock.
    pub fn count(&self, machine: &dyn Machine) -> usize {
        if self.owner.load(Ordering::Relaxed) == machine.current_task().0 {
            self.count.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Whether any task holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != TaskId::NONE.0
    }

    /// Exclusive access without locking, for when no other reference exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Checks the interrupt precondition and returns the caller's descriptor.
fn holder(machine: &dyn Machine) -> usize {
    assert!(
        !machine.interrupts_enabled(),
        "spin lock used with interrupts enabled"
    );
    let task = machine.current_task();
    assert_ne!(task, TaskId::NONE, "spin lock used outside of any task");
    task.0
}

/// RAII guard for one level of a held spinlock.
///
/// Dropping the guard releases that level. Interrupts are left alone; they
/// belong to whichever `InterruptGuard` the caller holds.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    machine: &'a dyn Machine,

    /// Recursion depth this guard was granted.
    depth: usize,
}

impl<T> SpinLockGuard<'_, T> {
    /// Whether the lock was already held by this task when the guard was
    /// taken.
    pub fn is_nested(&self) -> bool {
        self.depth > 1
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        assert!(
            !self.is_nested(),
            "data behind a re-entered spin lock belongs to the outer guard"
        );
        // SAFETY: we hold the lock and are its outermost guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        assert!(
            !self.is_nested(),
            "data behind a re-entered spin lock belongs to the outer guard"
        );
        // SAFETY: we hold the lock and are its outermost guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release(self.machine);
    }
}

/// A lock the scheduler may drop while putting the caller to sleep.
///
/// `Scheduler::sleep` releases it under the scheduler lock, so a wakeup
/// cannot slip in between the caller's check and the sleep, and takes it
/// again once the caller runs. `Scheduler::wake_up` does the same around a
/// preemptive switch.
pub trait HeldLock {
    fn release(&self);
    fn reacquire(&self);
}

impl<T> HeldLock for SpinLockGuard<'_, T> {
    fn release(&self) {
        self.lock.release(self.machine);
    }

    fn reacquire(&self) {
        self.lock.acquire(self.machine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::InterruptGuard;
    use crate::testing::FakeMachine;

    #[test]
    fn recursion_counts_per_task() {
        let machine = FakeMachine::new(16 << 20);
        let _irq = InterruptGuard::new(&machine);
        let lock = SpinLock::new(5u32);

        let mut outer = lock.lock(&machine);
        *outer += 1;
        {
            let inner = lock.lock(&machine);
            assert!(inner.is_nested());
            assert_eq!(lock.count(&machine), 2);
        }
        assert_eq!(lock.count(&machine), 1);
        assert_eq!(*outer, 6);
        drop(outer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn other_task_cannot_try_lock() {
        let machine = FakeMachine::new(16 << 20);
        let _irq = InterruptGuard::new(&machine);
        let lock = SpinLock::new(());

        let held = lock.lock(&machine);
        machine.set_current_task(TaskId(7));
        assert!(lock.try_lock(&machine).is_none());
        assert_eq!(lock.count(&machine), 0);
        machine.set_current_task(FakeMachine::BOOT_TASK);
        assert!(lock.try_lock(&machine).is_some());
        drop(held);
    }

    #[test]
    fn held_lock_release_and_reacquire() {
        let machine = FakeMachine::new(16 << 20);
        let _irq = InterruptGuard::new(&machine);
        let lock = SpinLock::new(0u8);

        let guard = lock.lock(&machine);
        HeldLock::release(&guard);
        assert!(!lock.is_locked());
        HeldLock::reacquire(&guard);
        assert_eq!(lock.count(&machine), 1);
    }

    #[test]
    #[should_panic(expected = "interrupts enabled")]
    fn locking_with_interrupts_enabled_panics() {
        let machine = FakeMachine::new(16 << 20);
        let lock = SpinLock::new(());
        let _guard = lock.lock(&machine);
    }

    #[test]
    #[should_panic(expected = "outer guard")]
    fn nested_guard_refuses_data_access() {
        let machine = FakeMachine::new(16 << 20);
        let _irq = InterruptGuard::new(&machine);
        let lock = SpinLock::new(1u8);
        let _outer = lock.lock(&machine);
        let inner = lock.lock(&machine);
        let _ = *inner;
    }
}
