//! Sleeping recursive mutex, owned by a thread.
//!
//! Contention puts the caller to sleep on the mutex's own channel. The
//! internal spinlock is handed to the scheduler so the unlocking thread
//! cannot wake the sleepers between their failed claim and their sleep.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::{InterruptGuard, SpinLock};
use crate::task::{Channel, Scheduler, ThreadId};

/// Boost granted to threads woken by an unlock, so a waiter that keeps
/// losing the race to same-priority peers eventually wins.
pub const AWAKEN_THREAD_BOOST: i32 = 1;

/// Raw value of `owner` when nobody holds the mutex.
const UNOWNED: u64 = 0;

pub struct Mutex {
    owner: AtomicU64,
    /// Recursion count of the owner.
    count: SpinLock<usize>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(UNOWNED),
            count: SpinLock::new(0),
        }
    }

    /// Blocks until the current thread owns the mutex. Re-locking by the
    /// owner only bumps the recursion count.
    ///
    /// # Panics
    /// Outside of any thread.
    pub fn lock(&self, scheduler: &Scheduler) {
        let Some(me) = scheduler.current_id() else {
            panic!("mutex locked outside of any thread");
        };
        let machine = scheduler.machine();

        let _irq = InterruptGuard::new(machine);
        let mut count = self.count.lock(machine);
        if self.owner.load(Ordering::Acquire) != me.as_raw() {
            while self
                .owner
                .compare_exchange(UNOWNED, me.as_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                scheduler.sleep(Channel::of(self), AWAKEN_THREAD_BOOST, Some(&count));
            }
        }
        *count += 1;
    }

    /// Drops one level of ownership; the last one wakes every waiter.
    ///
    /// # Panics
    /// If the current thread does not own the mutex.
    pub fn unlock(&self, scheduler: &Scheduler) {
        let me = scheduler.current_id();
        assert!(
            me.is_some() && self.owner() == me,
            "mutex unlocked by a thread that does not own it"
        );
        let machine = scheduler.machine();

        let _irq = InterruptGuard::new(machine);
        let mut count = self.count.lock(machine);
        *count -= 1;
        if *count == 0 {
            self.owner.store(UNOWNED, Ordering::Release);
            scheduler.wake_up(Channel::of(self), Some(&count));
        }
    }

    /// Locks the mutex for the lifetime of the returned guard.
    pub fn locked<'a>(&'a self, scheduler: &'a Scheduler) -> MutexGuard<'a> {
        self.lock(scheduler);
        MutexGuard {
            mutex: self,
            scheduler,
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            UNOWNED => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    scheduler: &'a Scheduler,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.scheduler);
    }
}
