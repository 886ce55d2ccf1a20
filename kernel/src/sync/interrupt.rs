//! Scoped interrupt masking.

use crate::arch::Machine;

/// Disables interrupts for its lifetime and restores the previous state on
/// drop. Nested guards compose: only the outermost one re-enables.
pub struct InterruptGuard<'a> {
    machine: &'a dyn Machine,
    was_enabled: bool,
}

impl<'a> InterruptGuard<'a> {
    pub fn new(machine: &'a dyn Machine) -> Self {
        let was_enabled = machine.disable_interrupts();
        Self {
            machine,
            was_enabled,
        }
    }

    /// Whether interrupts were enabled when the guard was created.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.machine.enable_interrupts();
        }
    }
}
