//! Two-level page tables
//!
//! The virtual page number is split into a directory index (the bits above
//! the low nine) and a table index (the low nine bits). Tables are created
//! on first use and dropped when their last entry is removed.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::physical::{PhysAddr, VirtAddr, addr_to_pfn, page_round_down, pfn_to_addr};
use crate::vma::Protection;

/// Bits of the virtual page number resolved by the leaf table
pub const TABLE_BITS: u32 = 9;
/// Entries per leaf table
pub const ENTRIES_PER_TABLE: usize = 1 << TABLE_BITS;

bitflags! {
    /// Hardware-style page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Translation is valid
        const PRESENT = 1 << 0;
        /// Writes are allowed
        const WRITABLE = 1 << 1;
        /// Accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled
        const CACHE_DISABLE = 1 << 4;
        /// Set on any access
        const ACCESSED = 1 << 5;
        /// Set on write
        const DIRTY = 1 << 6;
        /// Maps a huge page
        const HUGE_PAGE = 1 << 7;
        /// Survives address-space switches
        const GLOBAL = 1 << 8;
        /// Shared copy-on-write frame; a write must copy it first
        const COW = 1 << 9;
        /// Instruction fetches fault
        const NO_EXECUTE = 1 << 63;
    }
}

impl PteFlags {
    /// Flags for a fresh user mapping with the given protection
    pub fn from_protection(prot: Protection) -> Self {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if prot.contains(Protection::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if !prot.contains(Protection::EXEC) {
            flags |= PteFlags::NO_EXECUTE;
        }
        if prot.contains(Protection::NO_CACHE) {
            flags |= PteFlags::CACHE_DISABLE;
        }
        if prot.contains(Protection::WRITE_COMBINE) {
            flags |= PteFlags::WRITE_THROUGH;
        }
        flags
    }
}

/// Life-cycle state of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Not in use
    Free,
    /// Frame reserved but not mapped
    Allocated,
    /// Mapped and resident
    Mapped,
    /// Contents live in a swap slot
    Swapped,
    /// Pinned in memory, never swapped
    Locked,
    /// Modified since last writeback
    Dirty,
    /// Being written back
    Writeback,
    /// Reserved by the platform
    Reserved,
    /// Owned by a slab cache
    Slab,
    /// Part of a compound page
    Compound,
    /// Sitting on a buddy free list
    Buddy,
}

/// One virtual to physical mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Page-aligned virtual address
    pub virtual_address: VirtAddr,
    /// Page-aligned physical address; meaningless while swapped
    pub physical_address: PhysAddr,
    /// Hardware flags
    pub flags: PteFlags,
    /// Page state
    pub state: PageState,
    /// Protection inherited from the covering VMA
    pub protection: Protection,
    /// Sharers of the underlying frame at the time of the last update
    pub ref_count: u32,
    /// Simulated time of the last access
    pub last_access_ns: u64,
    /// Swap slot holding the page, if swapped out
    pub swap_slot: Option<u64>,
}

impl PageTableEntry {
    /// Creates a present entry
    pub fn new(vaddr: VirtAddr, paddr: PhysAddr, prot: Protection, now_ns: u64) -> Self {
        Self {
            virtual_address: page_round_down(vaddr),
            physical_address: page_round_down(paddr),
            flags: PteFlags::from_protection(prot),
            state: PageState::Mapped,
            protection: prot,
            ref_count: 1,
            last_access_ns: now_ns,
            swap_slot: None,
        }
    }

    /// Whether the translation is valid
    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    /// Physical frame number
    pub fn frame(&self) -> u64 {
        addr_to_pfn(self.physical_address)
    }
}

type LeafTable = BTreeMap<u16, PageTableEntry>;

/// Page table of one address space
pub struct PageTable {
    asid: u32,
    directory: BTreeMap<u64, Box<LeafTable>>,
    entries: usize,
    walks: AtomicU64,
}

fn split(vaddr: VirtAddr) -> (u64, u16) {
    let vpn = addr_to_pfn(vaddr);
    (vpn >> TABLE_BITS, (vpn & (ENTRIES_PER_TABLE as u64 - 1)) as u16)
}

fn join(dir: u64, idx: u16) -> VirtAddr {
    pfn_to_addr((dir << TABLE_BITS) | idx as u64)
}

impl PageTable {
    /// Creates an empty table for address space `asid`
    pub fn new(asid: u32) -> Self {
        Self {
            asid,
            directory: BTreeMap::new(),
            entries: 0,
            walks: AtomicU64::new(0),
        }
    }

    /// Address space id
    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// Installs `entry`, replacing any previous entry for the same page
    pub fn insert(&mut self, entry: PageTableEntry) -> Option<PageTableEntry> {
        let (dir, idx) = split(entry.virtual_address);
        let table = self.directory.entry(dir).or_insert_with(|| Box::new(LeafTable::new()));
        let old = table.insert(idx, entry);
        if old.is_none() {
            self.entries += 1;
        }
        old
    }

    /// Removes the entry for the page containing `vaddr`
    pub fn remove(&mut self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        let (dir, idx) = split(vaddr);
        let table = self.directory.get_mut(&dir)?;
        let old = table.remove(&idx);
        if table.is_empty() {
            self.directory.remove(&dir);
        }
        if old.is_some() {
            self.entries -= 1;
        }
        old
    }

    /// Walks the table for `vaddr`
    pub fn walk(&self, vaddr: VirtAddr) -> Option<&PageTableEntry> {
        self.walks.fetch_add(1, Ordering::Relaxed);
        let (dir, idx) = split(vaddr);
        self.directory.get(&dir)?.get(&idx)
    }

    /// Walks the table for `vaddr`, returning a mutable entry
    pub fn walk_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageTableEntry> {
        self.walks.fetch_add(1, Ordering::Relaxed);
        self.entry_mut(vaddr)
    }

    /// Entry lookup that does not count as a walk (TLB-hit bookkeeping)
    pub fn entry_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageTableEntry> {
        let (dir, idx) = split(vaddr);
        self.directory.get_mut(&dir)?.get_mut(&idx)
    }

    /// Page addresses with an entry inside `[start, end)`
    pub fn pages_in(&self, start: VirtAddr, end: VirtAddr) -> Vec<VirtAddr> {
        let (first_dir, _) = split(start);
        let (last_dir, _) = split(end.saturating_sub(1));
        let mut pages = Vec::new();
        if end <= start {
            return pages;
        }
        for (dir, table) in self.directory.range(first_dir..=last_dir) {
            for idx in table.keys() {
                let va = join(*dir, *idx);
                if va >= page_round_down(start) && va < end {
                    pages.push(va);
                }
            }
        }
        pages
    }

    /// Every entry in address order
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> + '_ {
        self.directory.values().flat_map(|t| t.values())
    }

    /// Every entry in address order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> + '_ {
        self.directory.values_mut().flat_map(|t| t.values_mut())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the table maps nothing
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of leaf tables allocated
    pub fn table_count(&self) -> usize {
        self.directory.len()
    }

    /// Walks performed so far
    pub fn page_walks(&self) -> u64 {
        self.walks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::PAGE_SIZE;

    #[test]
    fn test_insert_walk_remove() {
        let mut pt = PageTable::new(7);
        let va = 0x40_0000;
        let rw = Protection::READ | Protection::WRITE;
        assert!(pt.insert(PageTableEntry::new(va, 0x9000, rw, 0)).is_none());
        let entry = pt.walk(va + 12).unwrap();
        assert_eq!(entry.physical_address, 0x9000);
        assert!(entry.flags.contains(PteFlags::WRITABLE | PteFlags::NO_EXECUTE));
        assert_eq!(pt.page_walks(), 1);
        assert!(pt.remove(va).is_some());
        assert!(pt.is_empty());
        assert_eq!(pt.table_count(), 0);
    }

    #[test]
    fn test_pages_in_spans_tables() {
        let mut pt = PageTable::new(1);
        let base = (ENTRIES_PER_TABLE as u64 - 1) * PAGE_SIZE;
        for i in 0..3 {
            pt.insert(PageTableEntry::new(base + i * PAGE_SIZE, 0, Protection::READ, 0));
        }
        assert_eq!(pt.table_count(), 2);
        assert_eq!(pt.pages_in(base, base + 3 * PAGE_SIZE).len(), 3);
        assert_eq!(pt.pages_in(base + PAGE_SIZE, base + 2 * PAGE_SIZE), alloc::vec![base + PAGE_SIZE]);
    }
}
