//! Slab caches on top of the buddy allocator
//!
//! A cache serves objects of one size and alignment. It grows one slab (a
//! buddy block cut into equal objects) at a time when no partial slab has
//! a free object, and keeps empty slabs until `shrink` is called.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Result};

use super::buddy::{BuddyAllocator, MemoryZone, MAX_ORDER};
use crate::physical::{PAGE_SIZE, addr_to_pfn, pfn_to_addr};

/// Minimum number of objects a slab must hold
const MIN_OBJECTS_PER_SLAB: u64 = 8;

/// Counters for one cache
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlabCacheStats {
    /// Cache name
    pub name: String,
    /// Object size after alignment
    pub object_size: u64,
    /// Slabs currently owned
    pub slabs: u64,
    /// Objects handed out and not yet freed
    pub active_objects: u64,
    /// Objects sitting on free lists
    pub free_objects: u64,
    /// Total successful allocations
    pub allocations: u64,
    /// Total frees
    pub frees: u64,
    /// Allocations served from an existing slab
    pub hits: u64,
    /// Allocations that needed a new slab
    pub misses: u64,
}

struct Slab {
    base_pfn: u64,
    /// Object indices ready for reuse, most recently freed last
    free: Vec<u32>,
    in_use: Vec<bool>,
}

impl Slab {
    fn active(&self) -> u64 {
        self.in_use.iter().filter(|used| **used).count() as u64
    }
}

struct SlabCache {
    name: String,
    object_size: u64,
    order: usize,
    objects_per_slab: u64,
    slabs: BTreeMap<u64, Slab>,
    allocations: u64,
    frees: u64,
    hits: u64,
    misses: u64,
}

impl SlabCache {
    fn slab_bytes(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    fn stats(&self) -> SlabCacheStats {
        let active: u64 = self.slabs.values().map(Slab::active).sum();
        let free: u64 = self.slabs.values().map(|s| s.free.len() as u64).sum();
        SlabCacheStats {
            name: self.name.clone(),
            object_size: self.object_size,
            slabs: self.slabs.len() as u64,
            active_objects: active,
            free_objects: free,
            allocations: self.allocations,
            frees: self.frees,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Registry of slab caches
#[derive(Default)]
pub struct SlabAllocator {
    caches: BTreeMap<u32, SlabCache>,
    next_id: u32,
}

impl SlabAllocator {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            caches: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Creates a cache for objects of `size` bytes aligned to `align`
    pub fn create_cache(&mut self, name: &str, size: u64, align: u64) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidArgument("slab object size is zero".into()));
        }
        let align = align.max(8);
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "slab alignment {} is not a power of two",
                align
            )));
        }
        if self.caches.values().any(|c| c.name == name) {
            return Err(Error::AlreadyExists(format!("slab cache {}", name)));
        }
        let object_size = size.div_ceil(align) * align;
        let order = (0..=MAX_ORDER)
            .find(|o| (PAGE_SIZE << o) / object_size >= MIN_OBJECTS_PER_SLAB)
            .or_else(|| (0..=MAX_ORDER).find(|o| (PAGE_SIZE << o) >= object_size))
            .ok_or_else(|| Error::InvalidArgument(format!("slab object size {} too large", size)))?;

        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.caches.insert(
            id,
            SlabCache {
                name: name.into(),
                object_size,
                order,
                objects_per_slab: (PAGE_SIZE << order) / object_size,
                slabs: BTreeMap::new(),
                allocations: 0,
                frees: 0,
                hits: 0,
                misses: 0,
            },
        );
        mm_debug!("slab: created cache {} ({} bytes, order {})", name, object_size, order);
        Ok(id)
    }

    /// Destroys an empty cache, returning its slabs to `buddy`
    pub fn destroy_cache(&mut self, id: u32, buddy: &mut BuddyAllocator) -> Result<()> {
        let cache = self.cache(id)?;
        if cache.slabs.values().any(|s| s.active() > 0) {
            return Err(Error::Busy(format!("slab cache {} has live objects", cache.name)));
        }
        if let Some(cache) = self.caches.remove(&id) {
            for pfn in cache.slabs.keys() {
                buddy.free(*pfn)?;
            }
        }
        Ok(())
    }

    /// Allocates one object, returning its address
    pub fn alloc(&mut self, id: u32, buddy: &mut BuddyAllocator) -> Result<u64> {
        let cache = self
            .caches
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("slab cache {}", id)))?;

        let partial = cache
            .slabs
            .values_mut()
            .find(|s| !s.free.is_empty())
            .map(|s| s.base_pfn);
        let base_pfn = match partial {
            Some(pfn) => {
                cache.hits += 1;
                pfn
            }
            None => {
                let pfn = buddy.alloc(cache.order, MemoryZone::Normal)?;
                let count = cache.objects_per_slab as u32;
                cache.slabs.insert(
                    pfn,
                    Slab {
                        base_pfn: pfn,
                        free: (0..count).rev().collect(),
                        in_use: alloc::vec![false; count as usize],
                    },
                );
                cache.misses += 1;
                pfn
            }
        };

        let object_size = cache.object_size;
        let slab = cache
            .slabs
            .get_mut(&base_pfn)
            .ok_or_else(|| Error::InvariantViolation("slab vanished during allocation".into()))?;
        let index = slab
            .free
            .pop()
            .ok_or_else(|| Error::InvariantViolation("partial slab without free object".into()))?;
        slab.in_use[index as usize] = true;
        cache.allocations += 1;
        Ok(pfn_to_addr(base_pfn) + index as u64 * object_size)
    }

    /// Returns an object to its slab's free list
    ///
    /// The slab itself stays allocated even when it becomes empty.
    pub fn free(&mut self, id: u32, addr: u64) -> Result<()> {
        let cache = self
            .caches
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("slab cache {}", id)))?;
        let slab_bytes = cache.slab_bytes();
        let object_size = cache.object_size;
        let pfn = addr_to_pfn(addr);
        let slab = cache
            .slabs
            .range_mut(..=pfn)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| addr < pfn_to_addr(s.base_pfn) + slab_bytes)
            .ok_or_else(|| Error::InvalidArgument(format!("{:#x} is not a slab object", addr)))?;

        let offset = addr - pfn_to_addr(slab.base_pfn);
        if offset % object_size != 0 {
            return Err(Error::InvalidArgument(format!("{:#x} is misaligned", addr)));
        }
        let index = (offset / object_size) as usize;
        match slab.in_use.get_mut(index) {
            Some(used) if *used => {
                *used = false;
                slab.free.push(index as u32);
            }
            _ => {
                return Err(Error::InvalidArgument(format!("{:#x} is not allocated", addr)));
            }
        }
        cache.frees += 1;
        Ok(())
    }

    /// Releases empty slabs back to `buddy`, returning the pages freed
    pub fn shrink(&mut self, id: u32, buddy: &mut BuddyAllocator) -> Result<u64> {
        let cache = self
            .caches
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("slab cache {}", id)))?;
        let empty: Vec<u64> = cache
            .slabs
            .values()
            .filter(|s| s.active() == 0)
            .map(|s| s.base_pfn)
            .collect();
        for pfn in &empty {
            cache.slabs.remove(pfn);
            buddy.free(*pfn)?;
        }
        Ok(empty.len() as u64 * (1u64 << cache.order))
    }

    /// Counters for one cache
    pub fn stats(&self, id: u32) -> Result<SlabCacheStats> {
        Ok(self.cache(id)?.stats())
    }

    /// Ids of every cache
    pub fn cache_ids(&self) -> Vec<u32> {
        self.caches.keys().copied().collect()
    }

    /// Looks a cache id up by name
    pub fn find(&self, name: &str) -> Option<u32> {
        self.caches.iter().find(|(_, c)| c.name == name).map(|(id, _)| *id)
    }

    /// Whether a slab starting at frame `pfn` belongs to some cache
    pub fn owns_slab(&self, pfn: u64) -> bool {
        self.caches.values().any(|c| c.slabs.contains_key(&pfn))
    }

    /// Pages held by every cache
    pub fn pages_held(&self) -> u64 {
        self.caches
            .values()
            .map(|c| c.slabs.len() as u64 * (1u64 << c.order))
            .sum()
    }

    fn cache(&self, id: u32) -> Result<&SlabCache> {
        self.caches
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("slab cache {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SlabAllocator, BuddyAllocator) {
        (SlabAllocator::new(), BuddyAllocator::new([0, 0, 64, 0, 0, 0]))
    }

    #[test]
    fn test_hit_and_miss_accounting() {
        let (mut slabs, mut buddy) = setup();
        let id = slabs.create_cache("task_struct", 100, 8).unwrap();
        let a = slabs.alloc(id, &mut buddy).unwrap();
        let b = slabs.alloc(id, &mut buddy).unwrap();
        assert_ne!(a, b);
        let stats = slabs.stats(id).unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.object_size, 104);
        assert_eq!(stats.active_objects, 2);
    }

    #[test]
    fn test_free_keeps_slab_and_reuses_object() {
        let (mut slabs, mut buddy) = setup();
        let id = slabs.create_cache("dentry", 64, 64).unwrap();
        let a = slabs.alloc(id, &mut buddy).unwrap();
        slabs.free(id, a).unwrap();
        assert_eq!(slabs.stats(id).unwrap().slabs, 1);
        assert_eq!(slabs.alloc(id, &mut buddy).unwrap(), a);
        assert!(slabs.free(id, a + 1).is_err());
    }

    #[test]
    fn test_destroy_busy_then_shrink() {
        let (mut slabs, mut buddy) = setup();
        let id = slabs.create_cache("inode", 256, 8).unwrap();
        let free_before = buddy.free_pages();
        let a = slabs.alloc(id, &mut buddy).unwrap();
        assert!(matches!(slabs.destroy_cache(id, &mut buddy), Err(Error::Busy(_))));
        slabs.free(id, a).unwrap();
        assert_eq!(slabs.shrink(id, &mut buddy).unwrap(), 1);
        assert_eq!(buddy.free_pages(), free_before);
        slabs.destroy_cache(id, &mut buddy).unwrap();
        assert!(slabs.stats(id).is_err());
    }
}
