// =============================================================================
// Nutshell - Machine Interface
// =============================================================================
//
// The kernel core never touches hardware directly. Descriptor tables, page
// table entry layouts, task state segments and the interrupt flag all live
// behind the `Machine` trait; the core only sees opaque descriptor handles.
//
// i386 PAGING GEOMETRY:
//
//   linear address = [31..22 directory index][21..12 table index][11..0 offset]
//
//   One page directory per address space holds 1024 page tables, and each
//   page table maps 1024 pages of 4 KiB, so one table spans 4 MiB.
//
//   ```text
//   0x0000_0000 ┌──────────────────────────┐
//               │ per-process mapables     │  carved out by Blocks
//   0xC000_0000 ├──────────────────────────┤  KERNEL_SPACE_BOUNDARY
//               │ kernel heap              │  same tables in every directory
//   0xFFFF_FFFF └──────────────────────────┘
//   ```
//
// The kernel image is loaded at physical 1 MiB; frames below that belong to
// firmware and are never handed to the replacement policy.
// =============================================================================

use crate::error::Result;

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table (and per page directory).
pub const PAGE_TABLE_CAPACITY: usize = 1024;

/// Bytes of linear address space covered by one page table.
pub const PAGE_TABLE_SIZE: usize = PAGE_SIZE * PAGE_TABLE_CAPACITY;

/// First linear address of the kernel half of every address space.
pub const KERNEL_SPACE_BOUNDARY: usize = 0xC000_0000;

/// Physical address the kernel image is loaded at.
pub const KERNEL_LOAD_ADDRESS: usize = 0x0010_0000;

/// Entry point of a kernel thread. The argument is passed through verbatim.
pub type ThreadEntry = fn(usize);

/// Hardware task descriptor. `TaskId::NONE` never names a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    pub const NONE: TaskId = TaskId(0);
}

/// Page table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub usize);

/// Page directory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectoryId(pub usize);

/// The architecture layer the kernel core runs on.
///
/// Implementations model exactly one processor. Every method may be called
/// with interrupts disabled, and none of them may call back into the core.
pub trait Machine: Send + Sync {
    /// Bytes of physical memory.
    fn memory_size(&self) -> usize;

    /// Clears the interrupt flag of the running task and returns whether it
    /// was set before.
    fn disable_interrupts(&self) -> bool;

    /// Sets the interrupt flag of the running task.
    fn enable_interrupts(&self);

    fn interrupts_enabled(&self) -> bool;

    /// Descriptor of the task currently executing.
    fn current_task(&self) -> TaskId;

    /// Creates a task that starts in `entry(argument)` on the stack ending at
    /// `stack_top`, running in the address space of `directory`.
    fn allocate_task(
        &self,
        directory: DirectoryId,
        stack_top: usize,
        entry: ThreadEntry,
        argument: usize,
    ) -> Result<TaskId>;

    fn release_task(&self, task: TaskId);

    /// Suspends the current task and resumes `task`. Returns when some other
    /// task switches back to the caller.
    fn switch_to_task(&self, task: TaskId);

    fn allocate_page_directory(&self) -> Result<DirectoryId>;

    fn release_page_directory(&self, directory: DirectoryId);

    fn allocate_page_table(&self) -> Result<TableId>;

    fn release_page_table(&self, table: TableId);

    /// Installs `table` at `index` of `directory` (present, writable).
    fn map_table_to_directory(&self, directory: DirectoryId, table: TableId, index: usize);

    fn unmap_table_from_directory(&self, directory: DirectoryId, index: usize);

    /// Points entry `page` of `table` at physical frame `frame` (present,
    /// writable, accessed and dirty clear).
    fn map_page_to_frame(&self, table: TableId, page: usize, frame: usize);

    fn unmap_page(&self, table: TableId, page: usize);

    /// Clears the accessed flag of an entry and returns its previous value.
    fn reset_page_accessed(&self, table: TableId, page: usize) -> bool;

    /// Whether the page was written since it was mapped.
    fn page_dirty(&self, table: TableId, page: usize) -> bool;

    /// Drops any cached translation of `address`.
    fn invalidate_tlb_entry(&self, address: usize);

    /// Physical address behind a linear address of the boot-time kernel
    /// mapping.
    fn physical_address(&self, address: usize) -> usize;

    /// Fills physical frame `frame` with zeroes.
    fn zero_frame(&self, frame: usize);
}
