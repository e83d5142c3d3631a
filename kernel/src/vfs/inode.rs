//! In-memory inodes
//!
//! Every mounted file system keeps its inodes in the one arena owned by
//! [`Vfs`](super::Vfs); directory inodes name their children by inode
//! number, so there are no back references to maintain.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Gid, Nanoseconds, Uid};

use super::types::{Access, FileAttr, FileMode, FileType};
use crate::cred::Credentials;

/// An inode
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: u64,
    pub kind: FileType,
    /// Permission and special bits only
    pub mode: u32,
    pub uid: Uid,
    pub gid: Gid,
    pub nlink: u32,
    /// Descriptors currently referring to this inode
    pub open_count: u32,
    pub data: Vec<u8>,
    /// Children of a directory, by name
    pub entries: BTreeMap<String, u64>,
    /// Target of a symlink
    pub target: Option<String>,
    pub rdev: (u32, u32),
    pub atime: Nanoseconds,
    pub mtime: Nanoseconds,
    pub ctime: Nanoseconds,
    pub crtime: Nanoseconds,
    /// Mount this inode belongs to
    pub mount: u32,
}

impl Inode {
    pub fn new(ino: u64, kind: FileType, mode: u32, uid: Uid, gid: Gid, mount: u32, now: Nanoseconds) -> Self {
        Self {
            ino,
            kind,
            mode: mode & FileMode::MASK,
            uid,
            gid,
            nlink: 1,
            open_count: 0,
            data: Vec::new(),
            entries: BTreeMap::new(),
            target: None,
            rdev: (0, 0),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            mount,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileType::Symlink
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            FileType::Symlink => self.target.as_ref().map_or(0, |t| t.len() as u64),
            _ => self.data.len() as u64,
        }
    }

    /// Blocks of `block_size` bytes the data occupies
    pub fn blocks(&self, block_size: u64) -> u64 {
        blocks_for(self.data.len() as u64, block_size)
    }

    /// No name and no open descriptor refers to the inode anymore
    pub fn is_reclaimable(&self) -> bool {
        self.nlink == 0 && self.open_count == 0
    }

    /// Mode-bit check; the superuser bypasses it
    pub fn permits(&self, creds: &Credentials, access: Access) -> bool {
        if creds.is_superuser() {
            return true;
        }
        let shift = if creds.euid == self.uid {
            0
        } else if creds.egid == self.gid {
            3
        } else {
            6
        };
        self.mode & (access.owner_bit() >> shift) != 0
    }

    pub fn attr(&self, block_size: u64) -> FileAttr {
        FileAttr {
            ino: self.ino,
            kind: self.kind,
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size: self.size(),
            blksize: block_size,
            blocks: self.blocks(block_size),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            rdev: self.rdev,
            mount: self.mount,
        }
    }
}

pub fn blocks_for(bytes: u64, block_size: u64) -> u64 {
    bytes.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use akern_api::Capabilities;

    #[test]
    fn test_mode_classes() {
        let inode = Inode::new(2, FileType::Regular, 0o640, 1000, 100, 1, 0);
        let owner = Credentials::user(10, 1000, 100, Capabilities::empty());
        let group = Credentials::user(11, 1001, 100, Capabilities::empty());
        let other = Credentials::user(12, 1002, 200, Capabilities::empty());

        assert!(owner.euid == inode.uid && inode.permits(&owner, Access::Write));
        assert!(inode.permits(&group, Access::Read));
        assert!(!inode.permits(&group, Access::Write));
        assert!(!inode.permits(&other, Access::Read));
        assert!(inode.permits(&Credentials::root(), Access::Execute));
    }

    #[test]
    fn test_block_rounding() {
        assert_eq!(blocks_for(0, 4096), 0);
        assert_eq!(blocks_for(1, 4096), 1);
        assert_eq!(blocks_for(4097, 4096), 2);
    }
}
