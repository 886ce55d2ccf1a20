//! Free-list of virtual address ranges.
//!
//! Spans are kept in an address-ordered map from base address to size.
//! Adjacent spans are always merged, so no two entries overlap or touch.

use alloc::collections::BTreeMap;

use crate::error::{KernelError, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Blocks {
    free: BTreeMap<usize, usize>,
}

impl Blocks {
    pub const fn new() -> Self {
        Self {
            free: BTreeMap::new(),
        }
    }

    /// First-fit allocation of `size` bytes. The rest of the chosen span
    /// stays free.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let (address, span) = self
            .free
            .iter()
            .find(|&(_, &span)| span >= size)
            .map(|(&address, &span)| (address, span))
            .ok_or(KernelError::AddressSpaceExhausted { size })?;

        self.free.remove(&address);
        if span > size {
            self.free.insert(address + size, span - size);
        }
        Ok(address)
    }

    /// Reserves exactly `[address, address + size)`, which must lie inside a
    /// single free span.
    pub fn force_allocate(&mut self, address: usize, size: usize) -> Result<()> {
        let not_free = KernelError::RangeNotFree { address, size };
        let (start, span) = self
            .free
            .range(..=address)
            .next_back()
            .map(|(&start, &span)| (start, span))
            .ok_or(not_free)?;

        let end = start + span;
        if address + size > end {
            return Err(not_free);
        }

        if address + size < end {
            self.free.insert(address + size, end - (address + size));
        }
        if address == start {
            self.free.remove(&start);
        } else {
            self.free.insert(start, address - start);
        }
        Ok(())
    }

    /// Returns a range and merges it with its free neighbours.
    ///
    /// The range must not be free already.
    pub fn deallocate(&mut self, address: usize, size: usize) {
        let mut start = address;
        let mut size = size;

        if let Some(next) = self.free.remove(&(address + size)) {
            size += next;
        }
        if let Some((&prev, &prev_size)) = self.free.range(..address).next_back() {
            if prev + prev_size == address {
                start = prev;
                size += prev_size;
            }
        }
        self.free.insert(start, size);
    }

    /// Free spans as `(address, size)`, lowest address first.
    pub fn spans(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(&address, &size)| (address, size))
    }

    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }
}
