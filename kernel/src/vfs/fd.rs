//! Per-process file descriptor tables

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use akern_api::Fd;

use super::error::{VfsError, VfsResult};
use super::types::OpenFlags;
use crate::ipc::pipe::PipeEnd;

/// What a descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTarget {
    Inode { ino: u64, dentry: u64 },
    Pipe { id: u32, end: PipeEnd },
}

/// An open file descriptor
///
/// Offsets are per descriptor even when several descriptors share an
/// inode.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub fd: Fd,
    pub target: FdTarget,
    pub offset: u64,
    pub flags: OpenFlags,
    pub close_on_exec: bool,
    pub nonblocking: bool,
    pub append: bool,
}

#[derive(Debug, Clone)]
pub struct FdTable {
    fds: BTreeMap<Fd, FileDescriptor>,
    limit: usize,
}

impl FdTable {
    pub fn new(limit: usize) -> Self {
        Self {
            fds: BTreeMap::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Installs at the lowest free descriptor number
    pub fn install(&mut self, target: FdTarget, flags: OpenFlags) -> VfsResult<Fd> {
        if self.fds.len() >= self.limit {
            return Err(VfsError::TooManyOpenFiles);
        }
        let mut fd: Fd = 0;
        for &used in self.fds.keys() {
            if used != fd {
                break;
            }
            fd += 1;
        }
        self.fds.insert(
            fd,
            FileDescriptor {
                fd,
                target,
                offset: 0,
                flags,
                close_on_exec: flags.contains(OpenFlags::CLOEXEC),
                nonblocking: flags.contains(OpenFlags::NONBLOCK),
                append: flags.contains(OpenFlags::APPEND),
            },
        );
        Ok(fd)
    }

    pub fn get(&self, fd: Fd) -> VfsResult<&FileDescriptor> {
        self.fds.get(&fd).ok_or(VfsError::BadDescriptor)
    }

    pub fn get_mut(&mut self, fd: Fd) -> VfsResult<&mut FileDescriptor> {
        self.fds.get_mut(&fd).ok_or(VfsError::BadDescriptor)
    }

    pub fn remove(&mut self, fd: Fd) -> VfsResult<FileDescriptor> {
        self.fds.remove(&fd).ok_or(VfsError::BadDescriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.fds.values()
    }

    pub fn drain(&mut self) -> Vec<FileDescriptor> {
        core::mem::take(&mut self.fds).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_descriptor() {
        let mut table = FdTable::new(3);
        let file = FdTarget::Inode { ino: 7, dentry: 1 };
        assert_eq!(table.install(file, OpenFlags::RDONLY).unwrap(), 0);
        assert_eq!(table.install(file, OpenFlags::APPEND).unwrap(), 1);
        assert_eq!(table.install(file, OpenFlags::RDONLY).unwrap(), 2);
        assert_eq!(table.install(file, OpenFlags::RDONLY), Err(VfsError::TooManyOpenFiles));

        table.remove(1).unwrap();
        assert_eq!(table.install(file, OpenFlags::CLOEXEC).unwrap(), 1);
        assert!(table.get(1).unwrap().close_on_exec);
        assert_eq!(table.remove(9).unwrap_err(), VfsError::BadDescriptor);
    }
}
