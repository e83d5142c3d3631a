//! Virtual memory areas
//!
//! A [`VmaSet`] keeps one process's mapped ranges keyed by start address.
//! Ranges never overlap; removing or re-protecting part of an area splits
//! it.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Result};
use bitflags::bitflags;

use crate::physical::{PAGE_SIZE, VirtAddr};

/// Lowest address handed out by the top-down search
pub const MIN_MAP_ADDR: VirtAddr = 0x1_0000;

bitflags! {
    /// Page protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
        /// Copy on write
        const COW = 1 << 3;
        /// Shared with other address spaces
        const SHARED = 1 << 4;
        /// Private to the address space
        const PRIVATE = 1 << 5;
        /// Uncached
        const NO_CACHE = 1 << 6;
        /// Write-combining
        const WRITE_COMBINE = 1 << 7;
        /// Guard page; any access faults
        const GUARD = 1 << 8;
        /// User accessible
        const USER = 1 << 9;
    }
}

bitflags! {
    /// `mmap` behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmapFlags: u32 {
        /// Changes are shared
        const SHARED = 1 << 0;
        /// Changes are private
        const PRIVATE = 1 << 1;
        /// Place exactly at the hint, replacing old mappings
        const FIXED = 1 << 2;
        /// Not backed by a file
        const ANONYMOUS = 1 << 3;
        /// Grows downward on faults just below its start
        const GROWS_DOWN = 1 << 4;
        /// Prefer huge pages
        const HUGE_PAGES = 1 << 5;
        /// Pin pages in memory
        const LOCKED = 1 << 6;
        /// Fault every page in immediately
        const POPULATE = 1 << 7;
        /// Do not block on I/O
        const NON_BLOCK = 1 << 8;
        /// Thread stack
        const STACK = 1 << 9;
        /// File backed
        const FILE = 1 << 10;
    }
}

/// What a VMA's pages are filled from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmaBacking {
    /// Zero-filled on first touch
    Anonymous,
    /// A file in the VFS
    File {
        /// Absolute path
        path: String,
        /// Byte offset of the area's first page
        offset: u64,
    },
    /// Frames shared by every area mapping the same object key
    Shared {
        /// Shared object key
        key: u64,
        /// Byte offset of the area's first page inside the object
        offset: u64,
    },
}

/// A mapped address range with uniform protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    /// First address (inclusive, page aligned)
    pub start: VirtAddr,
    /// End address (exclusive, page aligned)
    pub end: VirtAddr,
    /// Protection
    pub protection: Protection,
    /// Mapping flags
    pub flags: MmapFlags,
    /// Backing store
    pub backing: VmaBacking,
    /// Label shown in maps listings, e.g. `[heap]`
    pub name: String,
}

impl Vma {
    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the area is empty
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Number of pages covered
    pub fn pages(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    /// Whether `addr` falls inside the area
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether the area intersects `[start, end)`
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end
    }

    /// Copy of the area restricted to `[start, end)`, with file offsets adjusted
    fn slice(&self, start: VirtAddr, end: VirtAddr) -> Vma {
        let mut piece = self.clone();
        piece.start = start;
        piece.end = end;
        match &mut piece.backing {
            VmaBacking::File { offset, .. } | VmaBacking::Shared { offset, .. } => {
                *offset += start - self.start;
            }
            VmaBacking::Anonymous => {}
        }
        piece
    }
}

/// Non-overlapping set of areas for one address space
#[derive(Debug, Clone, Default)]
pub struct VmaSet {
    areas: BTreeMap<VirtAddr, Vma>,
}

impl VmaSet {
    /// Creates an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `vma`; it must not overlap any existing area
    pub fn insert(&mut self, vma: Vma) -> Result<()> {
        if vma.start >= vma.end {
            return Err(Error::InvalidArgument(format!(
                "empty area {:#x}..{:#x}",
                vma.start, vma.end
            )));
        }
        if self.overlaps(vma.start, vma.end) {
            return Err(Error::AlreadyExists(format!(
                "range {:#x}..{:#x} overlaps an existing mapping",
                vma.start, vma.end
            )));
        }
        self.areas.insert(vma.start, vma);
        Ok(())
    }

    /// Whether any area intersects `[start, end)`
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        if let Some((_, prev)) = self.areas.range(..start).next_back() {
            if prev.end > start {
                return true;
            }
        }
        self.areas.range(start..end).next().is_some()
    }

    /// Area containing `addr`
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.areas
            .range(..=addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(addr))
    }

    /// Closest area starting above `addr`
    pub fn next_above(&self, addr: VirtAddr) -> Option<&Vma> {
        self.areas
            .range((core::ops::Bound::Excluded(addr), core::ops::Bound::Unbounded))
            .next()
            .map(|(_, v)| v)
    }

    /// Closest area ending at or below `addr`
    pub fn prev_below(&self, addr: VirtAddr) -> Option<&Vma> {
        self.areas
            .range(..addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.end <= addr)
    }

    /// Highest free, page aligned gap of `len` bytes ending at or below `limit`
    pub fn find_free(&self, len: u64, limit: VirtAddr) -> Option<VirtAddr> {
        let mut top = limit;
        for vma in self.areas.values().rev() {
            if vma.start >= top {
                continue;
            }
            if vma.end <= top && top - vma.end >= len {
                return Some(top - len);
            }
            top = top.min(vma.start);
        }
        if top >= MIN_MAP_ADDR && top - MIN_MAP_ADDR >= len {
            Some(top - len)
        } else {
            None
        }
    }

    /// Removes `[start, end)`, splitting partially covered areas
    ///
    /// Returns the removed pieces.
    pub fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<Vma> {
        let hit: Vec<VirtAddr> = self
            .areas
            .values()
            .filter(|v| v.overlaps(start, end))
            .map(|v| v.start)
            .collect();
        let mut removed = Vec::new();
        for key in hit {
            let Some(vma) = self.areas.remove(&key) else {
                continue;
            };
            if vma.start < start {
                let head = vma.slice(vma.start, start);
                self.areas.insert(head.start, head);
            }
            if vma.end > end {
                let tail = vma.slice(end, vma.end);
                self.areas.insert(tail.start, tail);
            }
            removed.push(vma.slice(vma.start.max(start), vma.end.min(end)));
        }
        removed
    }

    /// Whether `[start, end)` is covered without holes
    pub fn covers(&self, start: VirtAddr, end: VirtAddr) -> bool {
        let mut cursor = start;
        while cursor < end {
            match self.find(cursor) {
                Some(v) => cursor = v.end,
                None => return false,
            }
        }
        true
    }

    /// Changes protection over `[start, end)`, splitting at the edges
    pub fn protect_range(&mut self, start: VirtAddr, end: VirtAddr, prot: Protection) -> Result<()> {
        if !self.covers(start, end) {
            return Err(Error::NotFound(format!(
                "range {:#x}..{:#x} is not fully mapped",
                start, end
            )));
        }
        for mut piece in self.remove_range(start, end) {
            let keep = piece.protection & (Protection::SHARED | Protection::PRIVATE);
            piece.protection = prot | keep;
            self.areas.insert(piece.start, piece);
        }
        Ok(())
    }

    /// Replaces the area starting at `old_start` with `vma`
    pub fn replace(&mut self, old_start: VirtAddr, vma: Vma) -> Result<()> {
        let old = self
            .areas
            .remove(&old_start)
            .ok_or_else(|| Error::NotFound(format!("no area at {:#x}", old_start)))?;
        if self.overlaps(vma.start, vma.end) {
            self.areas.insert(old.start, old);
            return Err(Error::ResourceExhausted(format!(
                "area {:#x}..{:#x} would overlap a neighbour",
                vma.start, vma.end
            )));
        }
        self.areas.insert(vma.start, vma);
        Ok(())
    }

    /// Areas in address order
    pub fn iter(&self) -> impl Iterator<Item = &Vma> + '_ {
        self.areas.values()
    }

    /// Number of areas
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: u64, end: u64) -> Vma {
        Vma {
            start,
            end,
            protection: Protection::READ | Protection::WRITE | Protection::PRIVATE,
            flags: MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
            backing: VmaBacking::Anonymous,
            name: "[anon]".into(),
        }
    }

    #[test]
    fn test_overlap_rejected() {
        let mut set = VmaSet::new();
        set.insert(anon(0x10000, 0x20000)).unwrap();
        assert!(set.insert(anon(0x1f000, 0x21000)).is_err());
        set.insert(anon(0x20000, 0x21000)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_find_free_top_down() {
        let mut set = VmaSet::new();
        set.insert(anon(0xf000_0000 - 0x2000, 0xf000_0000)).unwrap();
        assert_eq!(set.find_free(0x1000, 0xf000_0000), Some(0xf000_0000 - 0x3000));
        assert_eq!(set.find_free(0x1000, 0x2_0000), Some(0x1_f000));
    }

    #[test]
    fn test_remove_splits() {
        let mut set = VmaSet::new();
        set.insert(anon(0x10000, 0x14000)).unwrap();
        let removed = set.remove_range(0x11000, 0x12000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].len(), 0x1000);
        let left: Vec<_> = set.iter().map(|v| (v.start, v.end)).collect();
        assert_eq!(left, alloc::vec![(0x10000, 0x11000), (0x12000, 0x14000)]);
    }

    #[test]
    fn test_protect_requires_coverage() {
        let mut set = VmaSet::new();
        set.insert(anon(0x10000, 0x12000)).unwrap();
        assert!(set.protect_range(0x10000, 0x13000, Protection::READ).is_err());
        set.protect_range(0x11000, 0x12000, Protection::READ).unwrap();
        let area = set.find(0x11000).unwrap();
        assert!(!area.protection.contains(Protection::WRITE));
        assert!(area.protection.contains(Protection::PRIVATE));
        assert!(set.find(0x10000).unwrap().protection.contains(Protection::WRITE));
    }
}
