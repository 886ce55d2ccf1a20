// =============================================================================
// Nutshell - Memory Management
// =============================================================================
//
//   Blocks    - free-list of virtual ranges inside one address space
//   Mapable   - a shareable range of virtual pages with its own page tables
//   Pageable  - one address space: a page directory hosting mapables
//   Pager     - owns every physical frame, resolves faults, evicts pages,
//               and grows the kernel heap from a reserved frame pool
//   heap      - the kernel allocator's pre/post/failure hooks and sbrk
//
// A Mapable owns its page tables. Mapping it into a Pageable installs those
// same tables into the Pageable's directory, so a page made resident once is
// visible in every address space the mapable is mapped into.
// =============================================================================

pub mod blocks;
pub mod heap;
pub mod mapable;
pub mod pageable;
pub mod pager;

pub use blocks::Blocks;
pub use mapable::{Mapable, Page, PageFlags};
pub use pageable::Pageable;
pub use pager::{FrameCensus, Pager};

use crate::arch::{PAGE_SIZE, PAGE_TABLE_SIZE};

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Number of page tables needed to cover `bytes`.
#[inline]
pub const fn tables_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_TABLE_SIZE)
}

/// Number of pages needed to cover `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
