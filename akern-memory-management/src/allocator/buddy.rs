//! Zoned buddy allocator
//!
//! Each zone owns a contiguous run of page frames and keeps one free list
//! per order (a block of order `n` spans `2^n` pages). Blocks are tracked by
//! their page offset inside the zone, so a block's buddy is found by
//! flipping bit `n` of that offset.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Result};
use static_assertions::const_assert;

/// Largest supported block order (2^10 pages = 4MB)
pub const MAX_ORDER: usize = 10;

const_assert!(MAX_ORDER < 16);

/// Physical memory zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryZone {
    /// Low memory reachable by legacy DMA
    Dma,
    /// Memory below 4GB
    Dma32,
    /// Regular memory
    Normal,
    /// Memory not permanently mapped by the kernel
    HighMem,
    /// Memory whose pages can be migrated
    Movable,
    /// Device memory
    Device,
}

impl MemoryZone {
    /// Every zone in physical address order
    pub const ALL: [MemoryZone; 6] = [
        MemoryZone::Dma,
        MemoryZone::Dma32,
        MemoryZone::Normal,
        MemoryZone::HighMem,
        MemoryZone::Movable,
        MemoryZone::Device,
    ];

    /// Position in [`MemoryZone::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Zones tried, in order, when allocating for this zone
    pub fn fallback(self) -> &'static [MemoryZone] {
        use MemoryZone::*;
        match self {
            Dma => &[Dma],
            Dma32 => &[Dma32, Dma],
            Normal => &[Normal, Dma32, Dma],
            HighMem => &[HighMem, Normal, Dma32, Dma],
            Movable => &[Movable, HighMem, Normal, Dma32, Dma],
            Device => &[Device],
        }
    }

    /// Short display name
    pub fn name(self) -> &'static str {
        match self {
            MemoryZone::Dma => "DMA",
            MemoryZone::Dma32 => "DMA32",
            MemoryZone::Normal => "Normal",
            MemoryZone::HighMem => "HighMem",
            MemoryZone::Movable => "Movable",
            MemoryZone::Device => "Device",
        }
    }
}

/// Per-zone counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStats {
    /// Pages managed by the zone
    pub total_pages: u64,
    /// Pages currently on a free list
    pub free_pages: u64,
    /// Free blocks per order
    pub free_blocks: [u64; MAX_ORDER + 1],
}

/// Allocator-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Successful allocations
    pub allocations: u64,
    /// Successful frees
    pub frees: u64,
    /// Block splits performed while allocating
    pub splits: u64,
    /// Buddy merges performed while freeing
    pub merges: u64,
    /// Allocations that found no block in any eligible zone
    pub failures: u64,
    /// Allocations served by a fallback zone
    pub fallbacks: u64,
}

struct Zone {
    kind: MemoryZone,
    base_pfn: u64,
    pages: u64,
    free_lists: [BTreeSet<u64>; MAX_ORDER + 1],
    free_pages: u64,
}

impl Zone {
    fn new(kind: MemoryZone, base_pfn: u64, pages: u64) -> Self {
        let mut zone = Zone {
            kind,
            base_pfn,
            pages,
            free_lists: Default::default(),
            free_pages: pages,
        };
        // carve the zone into the largest naturally aligned blocks
        let mut offset = 0u64;
        while offset < pages {
            let mut order = MAX_ORDER;
            while order > 0 {
                let size = 1u64 << order;
                if offset % size == 0 && offset + size <= pages {
                    break;
                }
                order -= 1;
            }
            zone.free_lists[order].insert(offset);
            offset += 1u64 << order;
        }
        zone
    }

    fn take(&mut self, order: usize) -> Option<(u64, u64)> {
        let found = (order..=MAX_ORDER).find(|o| !self.free_lists[*o].is_empty())?;
        let block = self.free_lists[found].pop_first()?;
        let mut splits = 0;
        let mut current = found;
        while current > order {
            current -= 1;
            self.free_lists[current].insert(block + (1u64 << current));
            splits += 1;
        }
        self.free_pages -= 1u64 << order;
        Some((self.base_pfn + block, splits))
    }

    fn give_back(&mut self, pfn: u64, order: usize) -> u64 {
        let mut block = pfn - self.base_pfn;
        let mut current = order;
        let mut merges = 0;
        while current < MAX_ORDER {
            let buddy = block ^ (1u64 << current);
            if !self.free_lists[current].remove(&buddy) {
                break;
            }
            block = block.min(buddy);
            current += 1;
            merges += 1;
        }
        self.free_lists[current].insert(block);
        self.free_pages += 1u64 << order;
        merges
    }

    fn contains(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.pages
    }

    fn stats(&self) -> ZoneStats {
        let mut free_blocks = [0u64; MAX_ORDER + 1];
        for (order, list) in self.free_lists.iter().enumerate() {
            free_blocks[order] = list.len() as u64;
        }
        ZoneStats {
            total_pages: self.pages,
            free_pages: self.free_pages,
            free_blocks,
        }
    }
}

/// Buddy allocator over the six memory zones
pub struct BuddyAllocator {
    zones: Vec<Zone>,
    /// Allocated block start pfn -> (zone, order)
    allocated: BTreeMap<u64, (MemoryZone, usize)>,
    stats: BuddyStats,
}

impl BuddyAllocator {
    /// Creates an allocator with `zone_pages[i]` pages in zone `MemoryZone::ALL[i]`
    ///
    /// Zones are laid out back to back starting at frame 0.
    pub fn new(zone_pages: [u64; 6]) -> Self {
        let mut zones = Vec::with_capacity(6);
        let mut base = 0u64;
        for (kind, pages) in MemoryZone::ALL.iter().zip(zone_pages.iter()) {
            zones.push(Zone::new(*kind, base, *pages));
            base += *pages;
        }
        Self {
            zones,
            allocated: BTreeMap::new(),
            stats: BuddyStats::default(),
        }
    }

    /// Allocates a block of `2^order` pages, returning its first frame number
    pub fn alloc(&mut self, order: usize, zone: MemoryZone) -> Result<u64> {
        if order > MAX_ORDER {
            return Err(Error::InvalidArgument(format!(
                "order {} exceeds maximum {}",
                order, MAX_ORDER
            )));
        }
        for (i, candidate) in zone.fallback().iter().enumerate() {
            let z = &mut self.zones[candidate.index()];
            if let Some((pfn, splits)) = z.take(order) {
                self.allocated.insert(pfn, (z.kind, order));
                self.stats.allocations += 1;
                self.stats.splits += splits;
                if i > 0 {
                    self.stats.fallbacks += 1;
                }
                mm_trace!("buddy: order {} from {} at pfn {:#x}", order, z.kind.name(), pfn);
                return Ok(pfn);
            }
        }
        self.stats.failures += 1;
        Err(Error::ResourceExhausted(format!(
            "no free block of order {} for zone {}",
            order,
            zone.name()
        )))
    }

    /// Frees a block previously returned by [`BuddyAllocator::alloc`]
    pub fn free(&mut self, pfn: u64) -> Result<()> {
        let (zone, order) = self.allocated.remove(&pfn).ok_or_else(|| {
            Error::InvalidArgument(format!("pfn {:#x} is not an allocated block", pfn))
        })?;
        let merges = self.zones[zone.index()].give_back(pfn, order);
        self.stats.frees += 1;
        self.stats.merges += merges;
        Ok(())
    }

    /// Order of the allocated block starting at `pfn`
    pub fn block_order(&self, pfn: u64) -> Option<usize> {
        self.allocated.get(&pfn).map(|(_, order)| *order)
    }

    /// Zone owning frame `pfn`
    pub fn zone_of(&self, pfn: u64) -> Option<MemoryZone> {
        self.zones.iter().find(|z| z.contains(pfn)).map(|z| z.kind)
    }

    /// Counters for one zone
    pub fn zone_stats(&self, zone: MemoryZone) -> ZoneStats {
        self.zones[zone.index()].stats()
    }

    /// Allocator-wide counters
    pub fn stats(&self) -> BuddyStats {
        self.stats
    }

    /// Free pages over every zone
    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.free_pages).sum()
    }

    /// Pages managed over every zone
    pub fn total_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.pages).sum()
    }
}
