//! Priority scheduler with sleep/wakeup channels.
//!
//! All bookkeeping happens under one spinlock with interrupts disabled. The
//! lock is always dropped before the machine switches tasks: the switch is
//! where the calling thread stops running until it is picked again.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::arch::{Machine, TaskId};
use crate::error::{KernelError, Result};
use crate::sync::{HeldLock, InterruptGuard, SpinLock};
use crate::task::run_queue::{Channel, RunQueue, ThreadState};
use crate::task::thread::{Thread, ThreadId};

struct SchedulerState {
    queue: RunQueue,
    threads: BTreeMap<ThreadId, Arc<Thread>>,
}

pub struct Scheduler {
    machine: &'static dyn Machine,
    state: SpinLock<SchedulerState>,
}

impl Scheduler {
    pub fn new(machine: &'static dyn Machine) -> Self {
        Self {
            machine,
            state: SpinLock::new(SchedulerState {
                queue: RunQueue::new(),
                threads: BTreeMap::new(),
            }),
        }
    }

    pub fn machine(&self) -> &'static dyn Machine {
        self.machine
    }

    /// Makes `thread` ready. It runs once its effective priority is the
    /// best one at a switch.
    pub fn add_thread(&self, thread: Arc<Thread>) {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        let id = thread.id();
        state.queue.add(id, thread.priority());
        state.threads.insert(id, thread);
        log::debug!("scheduler: thread {} ready", id);
    }

    /// Takes a thread that is not running out of the scheduler and hands
    /// it back, so it is dropped outside the scheduler lock.
    pub fn remove_thread(&self, id: ThreadId) -> Result<Arc<Thread>> {
        let _irq = InterruptGuard::new(self.machine);
        let mut state = self.state.lock(self.machine);
        state.queue.remove(id)?;
        let thread = state.threads.remove(&id).ok_or(KernelError::UnknownThread)?;
        log::debug!("scheduler: thread {} removed", id);
        Ok(thread)
    }

    /// Timer interrupt entry point.
    pub fn clock(&self) {
        self.switch();
    }

    /// Gives the processor to the ready thread with the best effective
    /// priority, which may be the caller.
    ///
    /// # Panics
    /// If no thread at all is ready to run.
    pub fn switch(&self) {
        let _irq = InterruptGuard::new(self.machine);
        let task = {
            let mut state = self.state.lock(self.machine);
            let Some(next) = state.queue.select_next() else {
                log::error!("scheduler: every thread is asleep");
                panic!("no thread is ready to run");
            };
            let task = state.threads[&next].task();
            task
        };

        if self.machine.current_task() != task {
            self.machine.switch_to_task(task);
        }
    }

    /// Puts the current thread to sleep on `channel` until a `wake_up`.
    ///
    /// `held` is released after the thread is marked asleep and taken
    /// again once it runs, so a wakeup between the caller's check and the
    /// sleep cannot be lost. `boost` is the minimum priority credit the
    /// thread gets when it wakes.
    ///
    /// # Panics
    /// Outside of any thread.
    pub fn sleep(&self, channel: Channel, boost: i32, held: Option<&dyn HeldLock>) {
        let _irq = InterruptGuard::new(self.machine);
        {
            let mut state = self.state.lock(self.machine);
            if let Err(err) = state.queue.sleep_current(channel, boost) {
                panic!("cannot sleep on {:?}: {}", channel, err);
            }
            if let Some(held) = held {
                held.release();
            }
        }

        self.switch();

        if let Some(held) = held {
            held.reacquire();
        }
    }

    /// Readies every thread sleeping on `channel` and returns how many
    /// woke. If one of them now beats the caller, the caller yields at
    /// once, releasing `held` for the duration.
    pub fn wake_up(&self, channel: Channel, held: Option<&dyn HeldLock>) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let wakeup = {
            let mut state = self.state.lock(self.machine);
            let wakeup = state.queue.wake(channel);
            if wakeup.preempt {
                if let Some(held) = held {
                    held.release();
                }
            }
            wakeup
        };

        if wakeup.preempt {
            self.switch();
            if let Some(held) = held {
                held.reacquire();
            }
        }
        wakeup.count
    }

    pub fn current(&self) -> Option<Arc<Thread>> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let current = state
            .queue
            .current()
            .and_then(|id| state.threads.get(&id))
            .cloned();
        current
    }

    pub fn current_id(&self) -> Option<ThreadId> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let current = state.queue.current();
        current
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let thread = state.threads.get(&id).cloned();
        thread
    }

    /// Task descriptor of the current thread, if one is running.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current().map(|thread| thread.task())
    }

    // ── Diagnostics ─────────────────────────────────────────────

    pub fn effective_priority(&self, id: ThreadId) -> Option<i32> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let effective = state.queue.effective_priority(id);
        effective
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let thread_state = state.queue.state(id);
        thread_state
    }

    pub fn thread_count(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let count = state.threads.len();
        count
    }

    pub fn ready_count(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let count = state.queue.ready_len();
        count
    }

    pub fn sleeping_count(&self) -> usize {
        let _irq = InterruptGuard::new(self.machine);
        let state = self.state.lock(self.machine);
        let count = state.queue.sleeping_len();
        count
    }
}
