//! Mount point information for VFS

use alloc::format;
use alloc::string::String;

use bitflags::bitflags;

use super::error::{VfsError, VfsResult};
use super::types::{FileMode, FileSystemType, FsStats};

/// Default capacity of a simulated device, in blocks
pub const DEFAULT_BLOCKS: u64 = 262_144;
/// Default inode capacity of a simulated device
pub const DEFAULT_INODES: u64 = 65_536;
pub const BLOCK_SIZE: u64 = 4096;

bitflags! {
    /// Mount flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
        const NOSUID = 1 << 1;
        const NODEV = 1 << 2;
        const NOEXEC = 1 << 3;
        const NOATIME = 1 << 10;
    }
}

/// Per-mount file system metadata
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub fs_type: FileSystemType,
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub max_name_len: usize,
    pub max_file_size: u64,
    pub label: String,
    pub uuid: String,
    pub root_ino: u64,
}

impl SuperBlock {
    pub fn new(fs_type: FileSystemType, blocks: u64, inodes: u64, label: String, mount_id: u32) -> Self {
        Self {
            fs_type,
            block_size: BLOCK_SIZE,
            total_blocks: blocks,
            free_blocks: blocks,
            total_inodes: inodes,
            free_inodes: inodes,
            max_name_len: fs_type.max_name_len(),
            max_file_size: blocks * BLOCK_SIZE,
            label,
            uuid: format!("{:08x}-0000-4000-8000-{:012x}", mount_id, u64::from(mount_id) * 0x9e37_79b9),
            root_ino: 0,
        }
    }

    pub fn alloc_inode(&mut self) -> VfsResult<()> {
        if self.free_inodes == 0 {
            return Err(VfsError::NoSpace);
        }
        self.free_inodes -= 1;
        Ok(())
    }

    pub fn free_inode(&mut self) {
        self.free_inodes = (self.free_inodes + 1).min(self.total_inodes);
    }

    /// Moves the block charge of a file from `old` to `new` blocks
    pub fn recharge(&mut self, old: u64, new: u64) -> VfsResult<()> {
        if new > old {
            let extra = new - old;
            if extra > self.free_blocks {
                return Err(VfsError::NoSpace);
            }
            self.free_blocks -= extra;
        } else {
            self.release_blocks(old - new);
        }
        Ok(())
    }

    pub fn release_blocks(&mut self, n: u64) {
        self.free_blocks = (self.free_blocks + n).min(self.total_blocks);
    }
}

/// Mount point information
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub id: u32,
    /// Device or pseudo source
    pub source: String,
    /// Canonical mount point path
    pub target: String,
    pub flags: MountFlags,
    pub options: String,
    /// Mount the target lives on
    pub parent: Option<u32>,
    /// Dentry this mount covers in its parent
    pub covered: Option<u64>,
    pub root_dentry: u64,
    pub superblock: SuperBlock,
}

impl MountPoint {
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::RDONLY)
    }

    pub fn stats(&self) -> FsStats {
        let sb = &self.superblock;
        FsStats {
            mount_point: self.target.clone(),
            fs_type: sb.fs_type,
            device: self.source.clone(),
            bsize: sb.block_size,
            blocks: sb.total_blocks,
            bfree: sb.free_blocks,
            files: sb.total_inodes,
            ffree: sb.free_inodes,
            namelen: sb.max_name_len,
            read_only: self.is_read_only(),
        }
    }
}

/// Capacity options understood in a mount option string
///
/// `blocks=N` and `inodes=N` size the simulated device; anything else is
/// kept verbatim but otherwise ignored.
pub fn parse_capacity(options: &str) -> VfsResult<(u64, u64)> {
    let mut blocks = DEFAULT_BLOCKS;
    let mut inodes = DEFAULT_INODES;
    for opt in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        let Some((key, value)) = opt.split_once('=') else {
            continue;
        };
        let slot = match key {
            "blocks" => &mut blocks,
            "inodes" => &mut inodes,
            _ => continue,
        };
        *slot = value.parse().map_err(|_| VfsError::InvalidOperation)?;
        if *slot == 0 {
            return Err(VfsError::InvalidOperation);
        }
    }
    Ok((blocks, inodes))
}

/// Root directory mode from a `mode=` option, in octal
pub fn parse_mode(options: &str) -> VfsResult<Option<u32>> {
    let Some(raw) = options.split(',').map(str::trim).find_map(|o| o.strip_prefix("mode=")) else {
        return Ok(None);
    };
    u32::from_str_radix(raw, 8)
        .map(|m| Some(m & FileMode::MASK))
        .map_err(|_| VfsError::InvalidOperation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_options() {
        assert_eq!(parse_capacity("").unwrap(), (DEFAULT_BLOCKS, DEFAULT_INODES));
        assert_eq!(parse_capacity("mode=1777, inodes=4,blocks=8").unwrap(), (8, 4));
        assert!(parse_capacity("blocks=x").is_err());
        assert!(parse_capacity("inodes=0").is_err());
        assert_eq!(parse_mode("size=1,mode=1777").unwrap(), Some(0o1777));
        assert_eq!(parse_mode("ro").unwrap(), None);
    }

    #[test]
    fn test_block_accounting() {
        let mut sb = SuperBlock::new(FileSystemType::TmpFs, 4, 1, String::from("t"), 2);
        sb.alloc_inode().unwrap();
        assert_eq!(sb.alloc_inode(), Err(VfsError::NoSpace));
        sb.recharge(0, 3).unwrap();
        assert_eq!(sb.recharge(3, 5), Err(VfsError::NoSpace));
        sb.recharge(3, 1).unwrap();
        assert_eq!(sb.free_blocks, 3);
    }
}
