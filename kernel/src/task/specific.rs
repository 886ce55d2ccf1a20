//! Thread-specific storage keys.
//!
//! Keys are small indices shared by every thread; each thread stores its
//! own value per key. A key may carry a destructor that runs on a thread's
//! non-zero value when the thread is destroyed. Released indices are handed
//! out again by later allocations under a new generation, so values stored
//! under the old key read as zero and never reach the new destructor.

use alloc::vec::Vec;

use crate::arch::Machine;
use crate::sync::{InterruptGuard, SpinLock};

/// Called with a thread's value for a key when the thread is destroyed.
pub type SpecificDestructor = fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecificKey {
    index: usize,
    generation: u64,
}

impl SpecificKey {
    pub fn index(self) -> usize {
        self.index
    }
}

/// A thread's value under one key index, tagged with the key's generation.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SpecificValue {
    generation: u64,
    value: usize,
}

impl SpecificValue {
    pub(crate) fn new(key: SpecificKey, value: usize) -> Self {
        Self {
            generation: key.generation,
            value,
        }
    }

    /// The stored value if it was set under `key`, zero otherwise.
    pub(crate) fn get(&self, key: SpecificKey) -> usize {
        if self.generation == key.generation {
            self.value
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    Released,
    Allocated(Option<SpecificDestructor>),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u64,
    usage: Use,
}

impl Slot {
    /// Destructor of the slot if `generation` is its live allocation.
    fn live(&self, generation: u64) -> Option<Option<SpecificDestructor>> {
        match self.usage {
            Use::Allocated(destructor) if self.generation == generation => Some(destructor),
            _ => None,
        }
    }
}

struct Registry {
    slots: Vec<Slot>,
    /// Released indices, reused last-in first-out.
    available: Vec<usize>,
}

pub struct SpecificKeys {
    machine: &'static dyn Machine,
    registry: SpinLock<Registry>,
}

impl SpecificKeys {
    pub fn new(machine: &'static dyn Machine) -> Self {
        Self {
            machine,
            registry: SpinLock::new(Registry {
                slots: Vec::new(),
                available: Vec::new(),
            }),
        }
    }

    pub fn allocate(&self, destructor: Option<SpecificDestructor>) -> SpecificKey {
        let _irq = InterruptGuard::new(self.machine);
        let mut registry = self.registry.lock(self.machine);
        let index = match registry.available.pop() {
            Some(index) => index,
            None => {
                registry.slots.push(Slot {
                    generation: 0,
                    usage: Use::Released,
                });
                registry.slots.len() - 1
            }
        };
        let slot = &mut registry.slots[index];
        slot.usage = Use::Allocated(destructor);
        SpecificKey {
            index,
            generation: slot.generation,
        }
    }

    /// # Panics
    /// If the key was never allocated or is already released.
    pub fn release(&self, key: SpecificKey) {
        let _irq = InterruptGuard::new(self.machine);
        let mut registry = self.registry.lock(self.machine);
        let slot = match registry.slots.get_mut(key.index) {
            Some(slot) if slot.live(key.generation).is_some() => slot,
            _ => panic!("thread specific key {} is not allocated", key.index),
        };
        slot.generation += 1;
        slot.usage = Use::Released;
        registry.available.push(key.index);
    }

    pub fn destructor(&self, key: SpecificKey) -> Option<SpecificDestructor> {
        let _irq = InterruptGuard::new(self.machine);
        let registry = self.registry.lock(self.machine);
        registry
            .slots
            .get(key.index)
            .and_then(|slot| slot.live(key.generation))
            .flatten()
    }

    /// Runs the destructors of a dying thread's values, outside the
    /// registry lock.
    pub(crate) fn run_destructors(&self, values: &[SpecificValue]) {
        let pending: Vec<(SpecificDestructor, usize)> = {
            let _irq = InterruptGuard::new(self.machine);
            let registry = self.registry.lock(self.machine);
            let pending: Vec<_> = values
                .iter()
                .zip(registry.slots.iter())
                .filter(|(stored, _)| stored.value != 0)
                .filter_map(|(stored, slot)| {
                    slot.live(stored.generation)
                        .flatten()
                        .map(|destructor| (destructor, stored.value))
                })
                .collect();
            pending
        };

        for (destructor, value) in pending {
            destructor(value);
        }
    }
}
