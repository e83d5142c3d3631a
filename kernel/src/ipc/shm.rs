//! Shared memory segments
//!
//! A segment owns its bytes. Attaching maps a shared VMA into the caller's
//! address space (done by the kernel under the memory lock) and records the
//! address here. A segment destroyed while attached is only marked; the
//! last detach releases it.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result, Uid};
use akern_memory_management::{VirtAddr, page_round_up};

/// Offset added to segment ids to form the memory manager's shared-frame key
pub const SHM_KEY_BASE: u64 = 1 << 32;

/// Snapshot of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub id: u32,
    pub key: i64,
    pub size: u64,
    pub owner: Pid,
    pub attachments: usize,
    pub marked_for_deletion: bool,
    pub last_attach_ns: Option<Nanoseconds>,
    pub last_detach_ns: Option<Nanoseconds>,
}

/// One shared memory segment
#[derive(Debug)]
pub struct SharedSegment {
    pub id: u32,
    pub key: i64,
    pub size: u64,
    pub owner: Pid,
    pub owner_uid: Uid,
    pub mode: u32,
    data: Vec<u8>,
    attachments: Vec<(Pid, VirtAddr)>,
    marked_for_deletion: bool,
    last_attach_ns: Option<Nanoseconds>,
    last_detach_ns: Option<Nanoseconds>,
}

impl SharedSegment {
    /// Creates a zero-filled segment; the size is rounded up to whole pages
    pub fn new(id: u32, key: i64, size: u64, owner: Pid, owner_uid: Uid, mode: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("shared memory size must be non-zero".into()));
        }
        let size = page_round_up(size);
        let len = usize::try_from(size)
            .map_err(|_| Error::ResourceExhausted(format!("segment of {} bytes", size)))?;
        Ok(Self {
            id,
            key,
            size,
            owner,
            owner_uid,
            mode,
            data: vec![0; len],
            attachments: Vec::new(),
            marked_for_deletion: false,
            last_attach_ns: None,
            last_detach_ns: None,
        })
    }

    /// Key the memory manager shares frames under
    pub fn frame_key(&self) -> u64 {
        SHM_KEY_BASE + u64::from(self.id)
    }

    pub fn is_marked(&self) -> bool {
        self.marked_for_deletion
    }

    pub fn attach_count(&self) -> usize {
        self.attachments.len()
    }

    /// Address `pid` attached the segment at
    pub fn address_of(&self, pid: Pid) -> Option<VirtAddr> {
        self.attachments.iter().find(|(p, _)| *p == pid).map(|(_, a)| *a)
    }

    /// Refuses attaches to a segment pending deletion
    pub fn check_attach(&self) -> Result<()> {
        if self.marked_for_deletion {
            return Err(Error::NotFound(format!("segment {} is marked for deletion", self.id)));
        }
        Ok(())
    }

    pub fn attach(&mut self, pid: Pid, addr: VirtAddr, now: Nanoseconds) -> Result<()> {
        self.check_attach()?;
        self.attachments.push((pid, addr));
        self.last_attach_ns = Some(now);
        Ok(())
    }

    /// Drops one attachment; true when the segment should now be released
    pub fn detach(&mut self, pid: Pid, addr: VirtAddr, now: Nanoseconds) -> Result<bool> {
        let pos = self
            .attachments
            .iter()
            .position(|a| *a == (pid, addr))
            .ok_or_else(|| Error::InvalidArgument(format!("segment {} not attached at {:#x}", self.id, addr)))?;
        self.attachments.remove(pos);
        self.last_detach_ns = Some(now);
        Ok(self.marked_for_deletion && self.attachments.is_empty())
    }

    /// Removes every attachment of `pid`, returning their addresses
    pub fn detach_process(&mut self, pid: Pid, now: Nanoseconds) -> Vec<VirtAddr> {
        let addrs: Vec<VirtAddr> = self
            .attachments
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, a)| *a)
            .collect();
        if !addrs.is_empty() {
            self.attachments.retain(|(p, _)| *p != pid);
            self.last_detach_ns = Some(now);
        }
        addrs
    }

    /// Marks for deletion; true when nothing is attached and it can go now
    pub fn mark_for_deletion(&mut self) -> bool {
        self.marked_for_deletion = true;
        self.attachments.is_empty()
    }

    fn range(&self, offset: u64, len: usize) -> Result<core::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| self.out_of_bounds(offset, len))?;
        let end = start.checked_add(len).ok_or_else(|| self.out_of_bounds(offset, len))?;
        if end > self.data.len() {
            return Err(self.out_of_bounds(offset, len));
        }
        Ok(start..end)
    }

    fn out_of_bounds(&self, offset: u64, len: usize) -> Error {
        Error::InvalidArgument(format!(
            "{} bytes at offset {} exceed segment {} of {} bytes",
            len, offset, self.id, self.size
        ))
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.data[self.range(offset, len)?].to_vec())
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            id: self.id,
            key: self.key,
            size: self.size,
            owner: self.owner,
            attachments: self.attachments.len(),
            marked_for_deletion: self.marked_for_deletion,
            last_attach_ns: self.last_attach_ns,
            last_detach_ns: self.last_detach_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_release() {
        let mut seg = SharedSegment::new(1, 42, 100, 1, 0, 0o600).unwrap();
        assert_eq!(seg.size, 4096);
        seg.attach(2, 0x1000, 1).unwrap();
        seg.attach(3, 0x2000, 2).unwrap();
        assert!(!seg.mark_for_deletion());
        assert!(seg.attach(4, 0x3000, 3).is_err());
        assert!(!seg.detach(2, 0x1000, 4).unwrap());
        assert!(seg.detach(3, 0x2000, 5).unwrap());
    }

    #[test]
    fn test_bounds_checked_access() {
        let mut seg = SharedSegment::new(1, 0, 4096, 1, 0, 0o600).unwrap();
        seg.write(10, b"hello").unwrap();
        assert_eq!(seg.read(10, 5).unwrap(), b"hello".to_vec());
        assert!(seg.write(4094, b"abc").is_err());
        assert!(seg.read(u64::MAX, 1).is_err());
        assert!(SharedSegment::new(2, 0, 0, 1, 0, 0).is_err());
    }
}
