//! Namespaces
//!
//! A namespace is a flat set of member pids for one resource class. Each
//! class has a root namespace created at boot; new namespaces remember the
//! one they were created from so PID visibility can look down the tree.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result, Uid};

/// Namespace type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NamespaceType {
    Mount,
    Uts,
    Ipc,
    Pid,
    Network,
    User,
    Cgroup,
    Time,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 8] = [
        NamespaceType::Mount,
        NamespaceType::Uts,
        NamespaceType::Ipc,
        NamespaceType::Pid,
        NamespaceType::Network,
        NamespaceType::User,
        NamespaceType::Cgroup,
        NamespaceType::Time,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            NamespaceType::Mount => "mnt",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Pid => "pid",
            NamespaceType::Network => "net",
            NamespaceType::User => "user",
            NamespaceType::Cgroup => "cgroup",
            NamespaceType::Time => "time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub id: u32,
    pub kind: NamespaceType,
    pub members: BTreeSet<Pid>,
    pub owner_uid: Uid,
    pub created_at: Nanoseconds,
    /// Namespace this one was created from
    pub parent: Option<u32>,
}

/// Namespace memberships of one process, indexed by type
pub type NamespaceSet = [u32; 8];

pub struct NamespaceTable {
    namespaces: BTreeMap<u32, Namespace>,
    next_id: u32,
    roots: NamespaceSet,
}

impl NamespaceTable {
    /// Creates the eight root namespaces
    pub fn new(now: Nanoseconds) -> Self {
        let mut table = Self {
            namespaces: BTreeMap::new(),
            next_id: 1,
            roots: [0; 8],
        };
        for kind in NamespaceType::ALL {
            table.roots[kind.index()] = table.insert(kind, 0, now, None);
        }
        table
    }

    pub fn roots(&self) -> NamespaceSet {
        self.roots
    }

    pub fn get(&self, id: u32) -> Result<&Namespace> {
        self.namespaces
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("namespace {}", id)))
    }

    /// New namespace of `kind` descending from `from`
    pub fn create(&mut self, kind: NamespaceType, from: u32, owner_uid: Uid, now: Nanoseconds) -> Result<u32> {
        let parent = self.get(from)?;
        if parent.kind != kind {
            return Err(Error::InvalidArgument(format!(
                "namespace {} is not a {} namespace",
                from,
                kind.name()
            )));
        }
        Ok(self.insert(kind, owner_uid, now, Some(from)))
    }

    /// Moves `pid` from `old` into `new`; both must be of the same type
    pub fn transfer(&mut self, pid: Pid, old: u32, new: u32) -> Result<()> {
        let kind = self.get(new)?.kind;
        if self.get(old)?.kind != kind {
            return Err(Error::InvalidArgument(format!("namespaces {} and {} differ in type", old, new)));
        }
        if let Some(ns) = self.namespaces.get_mut(&old) {
            ns.members.remove(&pid);
        }
        if let Some(ns) = self.namespaces.get_mut(&new) {
            ns.members.insert(pid);
        }
        Ok(())
    }

    pub fn enter(&mut self, pid: Pid, set: &NamespaceSet) {
        for id in set {
            if let Some(ns) = self.namespaces.get_mut(id) {
                ns.members.insert(pid);
            }
        }
    }

    pub fn leave(&mut self, pid: Pid, set: &NamespaceSet) {
        for id in set {
            if let Some(ns) = self.namespaces.get_mut(id) {
                ns.members.remove(&pid);
            }
        }
    }

    /// Whether `inner` is `outer` or was created beneath it
    pub fn is_within(&self, inner: u32, outer: u32) -> bool {
        let mut cursor = Some(inner);
        while let Some(id) = cursor {
            if id == outer {
                return true;
            }
            cursor = self.namespaces.get(&id).and_then(|ns| ns.parent);
        }
        false
    }

    pub fn list(&self) -> Vec<&Namespace> {
        self.namespaces.values().collect()
    }

    fn insert(&mut self, kind: NamespaceType, owner_uid: Uid, now: Nanoseconds, parent: Option<u32>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.namespaces.insert(
            id,
            Namespace {
                id,
                kind,
                members: BTreeSet::new(),
                owner_uid,
                created_at: now,
                parent,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_pid_namespaces() {
        let mut table = NamespaceTable::new(0);
        let root = table.roots()[NamespaceType::Pid.index()];
        let child = table.create(NamespaceType::Pid, root, 1000, 5).unwrap();
        let grandchild = table.create(NamespaceType::Pid, child, 1000, 6).unwrap();

        assert!(table.is_within(grandchild, root));
        assert!(table.is_within(child, child));
        assert!(!table.is_within(root, child));

        let net = table.roots()[NamespaceType::Network.index()];
        assert!(table.create(NamespaceType::Pid, net, 0, 7).is_err());
        assert!(table.transfer(10, net, child).is_err());
    }
}
