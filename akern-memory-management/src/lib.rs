//! AKern Memory Management
//!
//! This crate provides the simulated memory subsystem of the AKern kernel:
//! zoned buddy allocation, slab caches, two-level page tables, a bounded
//! TLB, per-process VMA sets and the [`MemoryManager`] that ties them
//! together. Nothing here touches real memory; every effect is a state
//! transition that can be inspected.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

#[macro_use]
mod logging;

pub mod allocator;
pub mod manager;
pub mod page_table;
pub mod physical;
pub mod tlb;
pub mod vma;

pub use akern_api::{Error, Result};

pub use allocator::buddy::{BuddyAllocator, BuddyStats, MemoryZone, ZoneStats, MAX_ORDER};
pub use allocator::slab::{SlabCacheStats, SlabAllocator};
pub use manager::{
    AccessKind, AccessResult, FaultCounters, FaultOutcome, FaultReason, MemoryConfig,
    MemoryManager, MemoryStatistics, MmapRequest, STACK_GUARD_PAGES,
};
pub use page_table::{PageState, PageTable, PageTableEntry, PteFlags};
pub use physical::{
    PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE, addr_to_pfn, is_page_aligned, page_round_down,
    page_round_up, pfn_to_addr,
};
pub use tlb::{Tlb, TlbEntry, TlbStats};
pub use vma::{MmapFlags, Protection, Vma, VmaBacking, VmaSet};

/// Signal number delivered for invalid memory references
pub const SIGSEGV: u32 = 11;
/// Signal number delivered for bus errors
pub const SIGBUS: u32 = 7;
