//! Broadcast event.
//!
//! `signal` wakes whoever is waiting right now and is otherwise forgotten:
//! a `wait` that starts after the signal sleeps until the next one.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::task::{Channel, Scheduler};

pub struct Event {
    signals: AtomicUsize,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signals: AtomicUsize::new(0),
        }
    }

    /// Wakes every waiter and returns how many there were.
    pub fn signal(&self, scheduler: &Scheduler) -> usize {
        self.signals.fetch_add(1, Ordering::Relaxed);
        scheduler.wake_up(Channel::of(self), None)
    }

    pub fn wait(&self, scheduler: &Scheduler) {
        scheduler.sleep(Channel::of(self), 0, None);
    }

    /// Number of `signal` calls so far.
    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::Relaxed)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
