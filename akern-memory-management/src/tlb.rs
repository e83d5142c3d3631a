//! Software TLB
//!
//! A bounded cache of translations keyed by (virtual page, address space).
//! Every lookup or fill stamps the entry with a monotonically increasing
//! use tick; when full, the entry with the oldest tick is evicted.

use alloc::collections::BTreeMap;

use crate::page_table::PteFlags;

/// One cached translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page number
    pub virtual_page: u64,
    /// Physical frame number
    pub physical_frame: u64,
    /// Address space the translation belongs to
    pub asid: u32,
    /// Flags copied from the page table entry
    pub flags: PteFlags,
    /// Entry is usable
    pub valid: bool,
    /// Use tick of the most recent hit or fill
    pub last_used: u64,
}

/// TLB counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Flush operations of any scope
    pub flushes: u64,
    /// Current number of entries
    pub entries: u64,
    /// Maximum number of entries
    pub capacity: u64,
}

/// LRU translation cache
pub struct Tlb {
    entries: BTreeMap<(u64, u32), TlbEntry>,
    capacity: usize,
    tick: u64,
    stats: TlbStats,
}

impl Tlb {
    /// Creates a TLB holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            tick: 0,
            stats: TlbStats::default(),
        }
    }

    /// Looks up a translation, refreshing its LRU position on a hit
    pub fn lookup(&mut self, vpn: u64, asid: u32) -> Option<TlbEntry> {
        self.tick += 1;
        match self.entries.get_mut(&(vpn, asid)) {
            Some(entry) if entry.valid => {
                entry.last_used = self.tick;
                self.stats.hits += 1;
                Some(*entry)
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Caches a translation, evicting the least recently used entry if full
    pub fn insert(&mut self, vpn: u64, frame: u64, asid: u32, flags: PteFlags) {
        self.tick += 1;
        let key = (vpn, asid);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k);
            if let Some(victim) = victim {
                self.entries.remove(&victim);
                self.stats.evictions += 1;
            }
        }
        self.entries.insert(
            key,
            TlbEntry {
                virtual_page: vpn,
                physical_frame: frame,
                asid,
                flags,
                valid: true,
                last_used: self.tick,
            },
        );
    }

    /// Drops every entry
    pub fn flush_all(&mut self) {
        self.entries.clear();
        self.stats.flushes += 1;
    }

    /// Drops the entries for page `vpn`, in one address space or all of them
    pub fn flush_page(&mut self, vpn: u64, asid: Option<u32>) {
        match asid {
            Some(asid) => {
                self.entries.remove(&(vpn, asid));
            }
            None => self.entries.retain(|(v, _), _| *v != vpn),
        }
        self.stats.flushes += 1;
    }

    /// Drops every entry of one address space
    pub fn flush_asid(&mut self, asid: u32) {
        self.entries.retain(|(_, a), _| *a != asid);
        self.stats.flushes += 1;
    }

    /// Whether a translation is cached, without touching LRU state
    pub fn contains(&self, vpn: u64, asid: u32) -> bool {
        self.entries.contains_key(&(vpn, asid))
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the TLB is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters
    pub fn stats(&self) -> TlbStats {
        TlbStats {
            entries: self.entries.len() as u64,
            capacity: self.capacity as u64,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let mut tlb = Tlb::new(2);
        tlb.insert(1, 10, 1, PteFlags::PRESENT);
        tlb.insert(2, 20, 1, PteFlags::PRESENT);
        // touch page 1 so page 2 becomes the LRU victim
        assert!(tlb.lookup(1, 1).is_some());
        tlb.insert(3, 30, 1, PteFlags::PRESENT);
        assert!(tlb.contains(1, 1));
        assert!(!tlb.contains(2, 1));
        assert_eq!(tlb.stats().evictions, 1);
        assert_eq!(tlb.len(), 2);
    }

    #[test]
    fn test_asid_isolation_and_flush() {
        let mut tlb = Tlb::new(8);
        tlb.insert(5, 50, 1, PteFlags::PRESENT);
        tlb.insert(5, 51, 2, PteFlags::PRESENT);
        assert_eq!(tlb.lookup(5, 2).unwrap().physical_frame, 51);
        tlb.flush_asid(1);
        assert!(tlb.lookup(5, 1).is_none());
        tlb.flush_page(5, None);
        assert!(tlb.is_empty());
        let stats = tlb.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }
}
