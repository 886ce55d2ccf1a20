//! Ready/sleeping bookkeeping and effective priority arithmetic.
//!
//! Effective priorities only ever grow while a thread waits its turn: each
//! time a runnable thread is switched out it pays its base priority, so a
//! low-priority thread is picked less often but never starves. When the
//! smallest ready value reaches `EFFECTIVE_PRIORITY_LIMIT` every ready
//! thread is shifted down by the limit, preserving their relative order.
//!
//! The queue knows nothing about tasks or locks. `Scheduler` owns one behind
//! its spinlock.

use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::error::{KernelError, Result};
use crate::task::thread::{Priority, ThreadId};

/// Smallest ready effective priority that triggers renormalization.
pub const EFFECTIVE_PRIORITY_LIMIT: i32 = 1000;

/// Scheduling state of a thread. The running thread is `Ready` and simply
/// absent from the heap until it is switched out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Sleeping,
}

/// Opaque identity a thread sleeps on, usually the address of the object
/// it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(usize);

impl Channel {
    pub fn of<T: ?Sized>(object: &T) -> Channel {
        Channel((object as *const T).cast::<u8>() as usize)
    }

    pub const fn from_raw(raw: usize) -> Channel {
        Channel(raw)
    }
}

#[derive(Debug, Clone)]
struct Scheduled {
    base: i32,
    boost: i32,
    effective: i32,
    state: ThreadState,
    channel: Option<Channel>,
}

impl Scheduled {
    /// `base - boost`, the distance the thread is placed behind a peer of
    /// effective priority zero.
    fn relative(&self) -> i32 {
        self.base - self.boost
    }
}

/// Heap entry. `BinaryHeap` is a max-heap, so the ordering is reversed to
/// pop the smallest effective priority, then the oldest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    effective: i32,
    thread: ThreadId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .effective
            .cmp(&self.effective)
            .then_with(|| other.thread.cmp(&self.thread))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of waking a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub count: usize,
    /// A woken thread now has a better effective priority than the
    /// current one.
    pub preempt: bool,
}

#[derive(Debug, Default)]
pub struct RunQueue {
    threads: BTreeMap<ThreadId, Scheduled>,
    ready: BinaryHeap<ReadyEntry>,
    /// Sleepers in the order they went to sleep.
    sleeping: Vec<ThreadId>,
    current: Option<ThreadId>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a ready thread. Its effective priority starts relative to
    /// the current thread, or at zero if nothing has run yet.
    pub fn add(&mut self, thread: ThreadId, priority: Priority) {
        let base = priority.value();
        let effective = match self.current_entry() {
            Some(current) => current.effective + base - current.relative(),
            None => 0,
        };
        self.threads.insert(
            thread,
            Scheduled {
                base,
                boost: 0,
                effective,
                state: ThreadState::Ready,
                channel: None,
            },
        );
        self.ready.push(ReadyEntry { effective, thread });
    }

    /// Forgets a thread that is not running.
    pub fn remove(&mut self, thread: ThreadId) -> Result<()> {
        if self.current == Some(thread) {
            return Err(KernelError::ThreadBusy);
        }
        self.threads
            .remove(&thread)
            .ok_or(KernelError::UnknownThread)?;
        self.ready.retain(|entry| entry.thread != thread);
        self.sleeping.retain(|&sleeper| sleeper != thread);
        Ok(())
    }

    /// Ages the outgoing thread, if still runnable, and makes the best ready
    /// thread current. Returns `None` when no thread can run.
    pub fn select_next(&mut self) -> Option<ThreadId> {
        if let Some(id) = self.current {
            if let Some(outgoing) = self.threads.get_mut(&id) {
                if outgoing.state == ThreadState::Ready {
                    outgoing.effective += outgoing.base;
                    if outgoing.boost > 0 {
                        outgoing.boost -= 1;
                        outgoing.effective += 1;
                    }
                    self.ready.push(ReadyEntry {
                        effective: outgoing.effective,
                        thread: id,
                    });
                }
            }
        }

        if self
            .ready
            .peek()
            .is_some_and(|top| top.effective >= EFFECTIVE_PRIORITY_LIMIT)
        {
            self.renormalize();
        }

        let next = self.ready.pop()?;
        self.current = Some(next.thread);
        Some(next.thread)
    }

    fn renormalize(&mut self) {
        let mut entries = core::mem::take(&mut self.ready).into_vec();
        for entry in &mut entries {
            entry.effective -= EFFECTIVE_PRIORITY_LIMIT;
            if let Some(thread) = self.threads.get_mut(&entry.thread) {
                thread.effective = entry.effective;
            }
        }
        self.ready = BinaryHeap::from(entries);
    }

    /// Moves the current thread to the sleeping set. The caller switches
    /// away right after.
    pub fn sleep_current(&mut self, channel: Channel, boost: i32) -> Result<ThreadId> {
        let id = self.current.ok_or(KernelError::NoCurrentThread)?;
        let current = self
            .threads
            .get_mut(&id)
            .ok_or(KernelError::UnknownThread)?;
        current.state = ThreadState::Sleeping;
        current.boost = current.boost.max(boost);
        current.effective = current.base + current.boost;
        current.channel = Some(channel);
        self.sleeping.push(id);
        Ok(id)
    }

    /// Readies every thread sleeping on `channel`, newest sleeper first.
    /// Each later-found thread gets one more unit of boost than the one
    /// before it.
    pub fn wake(&mut self, channel: Channel) -> Wakeup {
        let (current_effective, current_relative) = match self.current_entry() {
            Some(current) => (current.effective, current.relative()),
            None => (0, 0),
        };

        let mut count = 0;
        let mut preempt = false;
        for &id in self.sleeping.iter().rev() {
            let Some(thread) = self.threads.get_mut(&id) else {
                continue;
            };
            if thread.channel != Some(channel) {
                continue;
            }
            thread.state = ThreadState::Ready;
            thread.channel = None;
            thread.boost += count;
            thread.effective = current_effective + thread.relative() - current_relative;
            self.ready.push(ReadyEntry {
                effective: thread.effective,
                thread: id,
            });
            preempt |= thread.effective < current_effective;
            count += 1;
        }

        if count > 0 {
            let threads = &self.threads;
            self.sleeping
                .retain(|id| threads.get(id).is_some_and(|t| t.state == ThreadState::Sleeping));
        }
        Wakeup {
            count: count as usize,
            preempt,
        }
    }

    fn current_entry(&self) -> Option<&Scheduled> {
        self.current.and_then(|id| self.threads.get(&id))
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn effective_priority(&self, thread: ThreadId) -> Option<i32> {
        self.threads.get(&thread).map(|t| t.effective)
    }

    pub fn boost(&self, thread: ThreadId) -> Option<i32> {
        self.threads.get(&thread).map(|t| t.boost)
    }

    pub fn state(&self, thread: ThreadId) -> Option<ThreadState> {
        self.threads.get(&thread).map(|t| t.state)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn sleeping_len(&self) -> usize {
        self.sleeping.len()
    }
}
