//! Directory entry cache for VFS

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::error::{VfsError, VfsResult};

/// Directory entry cache
///
/// A dentry binds a name under its parent to an inode, or records that
/// the name does not exist (negative). Mount roots have no parent; the
/// mount table remembers which dentry they cover.
#[derive(Debug, Clone)]
pub struct Dentry {
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    /// `None` for a negative entry
    pub inode: Option<u64>,
    pub children: BTreeMap<String, u64>,
    /// Mount stacked on this dentry
    pub mounted: Option<u32>,
    pub ref_count: usize,
}

impl Dentry {
    pub fn is_negative(&self) -> bool {
        self.inode.is_none()
    }
}

/// Result of a cached name lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Positive(u64),
    Negative(u64),
    Miss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DcacheStats {
    pub entries: usize,
    pub negative: usize,
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub pruned: u64,
}

#[derive(Debug, Default)]
pub struct DentryCache {
    dentries: BTreeMap<u64, Dentry>,
    next_id: u64,
    hits: u64,
    misses: u64,
    negative_hits: u64,
    pruned: u64,
}

impl DentryCache {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn get(&self, id: u64) -> Option<&Dentry> {
        self.dentries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Dentry> {
        self.dentries.get_mut(&id)
    }

    /// New parentless dentry for a mount root
    pub fn new_root(&mut self, name: &str, ino: u64) -> u64 {
        let id = self.alloc();
        self.dentries.insert(
            id,
            Dentry {
                id,
                name: String::from(name),
                parent: None,
                inode: Some(ino),
                children: BTreeMap::new(),
                mounted: None,
                ref_count: 0,
            },
        );
        id
    }

    /// Looks `name` up under `parent`, counting hits and misses
    pub fn lookup(&mut self, parent: u64, name: &str) -> CacheLookup {
        let child = self.dentries.get(&parent).and_then(|d| d.children.get(name)).copied();
        match child.and_then(|id| self.dentries.get(&id)) {
            Some(d) if d.is_negative() => {
                self.negative_hits += 1;
                CacheLookup::Negative(d.id)
            }
            Some(d) => {
                self.hits += 1;
                CacheLookup::Positive(d.id)
            }
            None => {
                self.misses += 1;
                CacheLookup::Miss
            }
        }
    }

    /// Binds `name` under `parent` to `inode`, reusing a cached dentry
    pub fn bind(&mut self, parent: u64, name: &str, inode: Option<u64>) -> VfsResult<u64> {
        let existing = self
            .dentries
            .get(&parent)
            .ok_or(VfsError::NotFound)?
            .children
            .get(name)
            .copied();
        if let Some(id) = existing {
            if let Some(d) = self.dentries.get_mut(&id) {
                d.inode = inode;
                return Ok(id);
            }
        }
        let id = self.alloc();
        self.dentries.insert(
            id,
            Dentry {
                id,
                name: String::from(name),
                parent: Some(parent),
                inode,
                children: BTreeMap::new(),
                mounted: None,
                ref_count: 0,
            },
        );
        if let Some(p) = self.dentries.get_mut(&parent) {
            p.children.insert(String::from(name), id);
        }
        Ok(id)
    }

    pub fn grab(&mut self, id: u64) {
        if let Some(d) = self.dentries.get_mut(&id) {
            d.ref_count += 1;
        }
    }

    /// Drops a reference; dropping past zero is an invariant violation
    pub fn put(&mut self, id: u64) -> VfsResult<()> {
        let d = self.dentries.get_mut(&id).ok_or(VfsError::NotFound)?;
        match d.ref_count.checked_sub(1) {
            Some(n) => {
                d.ref_count = n;
                Ok(())
            }
            None => Err(VfsError::Corrupted),
        }
    }

    /// Drops every cached child below `id`, keeping `id` itself
    pub fn drop_children(&mut self, id: u64) {
        let mut stack: Vec<u64> = self
            .dentries
            .get_mut(&id)
            .map(|d| core::mem::take(&mut d.children).into_values().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(d) = self.dentries.remove(&next) {
                stack.extend(d.children.into_values());
            }
        }
    }

    /// Removes `id` and everything below it
    pub fn remove_subtree(&mut self, id: u64) {
        self.drop_children(id);
        if let Some(d) = self.dentries.remove(&id) {
            if let Some(parent) = d.parent.and_then(|p| self.dentries.get_mut(&p)) {
                parent.children.remove(&d.name);
            }
        }
    }

    /// Reclaims unreferenced childless dentries that carry no mount
    ///
    /// Mount roots are never pruned. Returns the number reclaimed.
    pub fn prune(&mut self) -> usize {
        let mut reclaimed = 0;
        loop {
            let victims: Vec<u64> = self
                .dentries
                .values()
                .filter(|d| d.ref_count == 0 && d.children.is_empty() && d.mounted.is_none() && d.parent.is_some())
                .map(|d| d.id)
                .collect();
            if victims.is_empty() {
                break;
            }
            for id in victims {
                self.remove_subtree(id);
                reclaimed += 1;
            }
        }
        self.pruned += reclaimed as u64;
        reclaimed
    }

    pub fn stats(&self) -> DcacheStats {
        DcacheStats {
            entries: self.dentries.len(),
            negative: self.dentries.values().filter(|d| d.is_negative()).count(),
            hits: self.hits,
            misses: self.misses,
            negative_hits: self.negative_hits,
            pruned: self.pruned,
        }
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
