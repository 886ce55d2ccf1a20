//! Software page tables with hardware-style entries.
//!
//! Entries use the i386 layout: the frame number in bits 31..12 and the
//! flag bits below. The accessed and dirty bits are set by `Mmu::translate`
//! exactly where the processor would set them.

use bitflags::bitflags;

use nutshell::arch::{DirectoryId, TableId, PAGE_SIZE, PAGE_TABLE_CAPACITY};

bitflags! {
    /// Low bits of an i386 page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub fn new(frame: usize, flags: PteFlags) -> Self {
        Self(((frame * PAGE_SIZE) as u32 & !0xFFF) | flags.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> usize {
        (self.0 & !0xFFF) as usize / PAGE_SIZE
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn set(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    pub fn clear(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }
}

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: usize,
    pub write: bool,
}

/// Descriptor tables of the simulated MMU.
#[derive(Default)]
pub struct Mmu {
    pub(crate) tables: Vec<Option<Box<[PageTableEntry]>>>,
    pub(crate) directories: Vec<Option<Box<[Option<TableId>]>>>,
}

impl Mmu {
    pub fn live_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    pub fn live_directories(&self) -> usize {
        self.directories.iter().filter(|d| d.is_some()).count()
    }

    pub(crate) fn allocate_table(&mut self) -> TableId {
        let table = vec![PageTableEntry::default(); PAGE_TABLE_CAPACITY].into_boxed_slice();
        match self.tables.iter().position(Option::is_none) {
            Some(slot) => {
                self.tables[slot] = Some(table);
                TableId(slot)
            }
            None => {
                self.tables.push(Some(table));
                TableId(self.tables.len() - 1)
            }
        }
    }

    pub(crate) fn allocate_directory(&mut self) -> DirectoryId {
        let directory = vec![None; PAGE_TABLE_CAPACITY].into_boxed_slice();
        match self.directories.iter().position(Option::is_none) {
            Some(slot) => {
                self.directories[slot] = Some(directory);
                DirectoryId(slot)
            }
            None => {
                self.directories.push(Some(directory));
                DirectoryId(self.directories.len() - 1)
            }
        }
    }

    pub(crate) fn table_mut(&mut self, table: TableId) -> &mut [PageTableEntry] {
        match self.tables.get_mut(table.0) {
            Some(Some(entries)) => entries,
            _ => panic!("page table {:?} is not allocated", table),
        }
    }

    pub(crate) fn table(&self, table: TableId) -> &[PageTableEntry] {
        match self.tables.get(table.0) {
            Some(Some(entries)) => entries,
            _ => panic!("page table {:?} is not allocated", table),
        }
    }

    pub(crate) fn directory_mut(&mut self, directory: DirectoryId) -> &mut [Option<TableId>] {
        match self.directories.get_mut(directory.0) {
            Some(Some(slots)) => slots,
            _ => panic!("page directory {:?} is not allocated", directory),
        }
    }

    pub(crate) fn directory(&self, directory: DirectoryId) -> &[Option<TableId>] {
        match self.directories.get(directory.0) {
            Some(Some(slots)) => slots,
            _ => panic!("page directory {:?} is not allocated", directory),
        }
    }

    /// Walks `directory` for `address` the way the processor does, setting
    /// the accessed bit and, for writes, the dirty bit.
    pub fn translate(
        &mut self,
        directory: DirectoryId,
        address: usize,
        write: bool,
    ) -> Result<usize, PageFault> {
        let fault = PageFault { address, write };
        let slot = address / (PAGE_SIZE * PAGE_TABLE_CAPACITY);
        let table = self.directory(directory)[slot].ok_or(fault)?;
        let entry = &mut self.table_mut(table)[(address / PAGE_SIZE) % PAGE_TABLE_CAPACITY];
        if !entry.is_present() {
            return Err(fault);
        }
        entry.set(PteFlags::ACCESSED);
        if write {
            entry.set(PteFlags::DIRTY);
        }
        Ok(entry.frame() * PAGE_SIZE + address % PAGE_SIZE)
    }
}
