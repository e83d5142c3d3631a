//! File types, modes and flags for VFS

use alloc::string::String;

use akern_api::{Gid, Nanoseconds, Uid};
use bitflags::bitflags;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// File system types a mount may claim
///
/// Every type is simulated in memory with the same semantics; the type
/// only shows up in statistics and mount listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FileSystemType {
    Ext4,
    Xfs,
    Btrfs,
    Zfs,
    Ntfs,
    Fat32,
    ExFat,
    Hfs,
    Apfs,
    TmpFs,
    ProcFs,
    SysFs,
    DevFs,
    Nfs,
    Cifs,
    OverlayFs,
    SquashFs,
    F2fs,
    Fuse,
    Iso9660,
    Udf,
    Jfs,
    ReiserFs,
    Minix,
}

impl FileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            FileSystemType::Ext4 => "ext4",
            FileSystemType::Xfs => "xfs",
            FileSystemType::Btrfs => "btrfs",
            FileSystemType::Zfs => "zfs",
            FileSystemType::Ntfs => "ntfs",
            FileSystemType::Fat32 => "vfat",
            FileSystemType::ExFat => "exfat",
            FileSystemType::Hfs => "hfs",
            FileSystemType::Apfs => "apfs",
            FileSystemType::TmpFs => "tmpfs",
            FileSystemType::ProcFs => "proc",
            FileSystemType::SysFs => "sysfs",
            FileSystemType::DevFs => "devtmpfs",
            FileSystemType::Nfs => "nfs",
            FileSystemType::Cifs => "cifs",
            FileSystemType::OverlayFs => "overlay",
            FileSystemType::SquashFs => "squashfs",
            FileSystemType::F2fs => "f2fs",
            FileSystemType::Fuse => "fuse",
            FileSystemType::Iso9660 => "iso9660",
            FileSystemType::Udf => "udf",
            FileSystemType::Jfs => "jfs",
            FileSystemType::ReiserFs => "reiserfs",
            FileSystemType::Minix => "minix",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [FileSystemType; 24] = [
            FileSystemType::Ext4,
            FileSystemType::Xfs,
            FileSystemType::Btrfs,
            FileSystemType::Zfs,
            FileSystemType::Ntfs,
            FileSystemType::Fat32,
            FileSystemType::ExFat,
            FileSystemType::Hfs,
            FileSystemType::Apfs,
            FileSystemType::TmpFs,
            FileSystemType::ProcFs,
            FileSystemType::SysFs,
            FileSystemType::DevFs,
            FileSystemType::Nfs,
            FileSystemType::Cifs,
            FileSystemType::OverlayFs,
            FileSystemType::SquashFs,
            FileSystemType::F2fs,
            FileSystemType::Fuse,
            FileSystemType::Iso9660,
            FileSystemType::Udf,
            FileSystemType::Jfs,
            FileSystemType::ReiserFs,
            FileSystemType::Minix,
        ];
        ALL.into_iter().find(|t| t.name() == name)
    }

    /// Longest name a directory entry may have
    pub fn max_name_len(self) -> usize {
        match self {
            FileSystemType::Iso9660 => 207,
            FileSystemType::Ntfs | FileSystemType::Fat32 | FileSystemType::ExFat => 255,
            _ => 255,
        }
    }
}

/// Mode bits
pub struct FileMode;

impl FileMode {
    pub const S_ISUID: u32 = 0o4000;
    pub const S_ISGID: u32 = 0o2000;
    pub const S_ISVTX: u32 = 0o1000;

    pub const S_IRUSR: u32 = 0o400;
    pub const S_IWUSR: u32 = 0o200;
    pub const S_IXUSR: u32 = 0o100;

    /// Permission and special bits
    pub const MASK: u32 = 0o7777;
}

/// Access being checked against mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// The owner-class bit for this access
    pub fn owner_bit(self) -> u32 {
        match self {
            Access::Read => FileMode::S_IRUSR,
            Access::Write => FileMode::S_IWUSR,
            Access::Execute => FileMode::S_IXUSR,
        }
    }
}

bitflags! {
    /// Flags accepted by open
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
        const CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    const ACCMODE: u32 = 0o3;

    pub fn readable(self) -> bool {
        self.bits() & Self::ACCMODE != Self::WRONLY.bits()
    }

    pub fn writable(self) -> bool {
        matches!(self.bits() & Self::ACCMODE, b if b == Self::WRONLY.bits() || b == Self::RDWR.bits())
    }
}

/// File attributes (stat structure equivalent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub kind: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: Uid,
    pub gid: Gid,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Nanoseconds,
    pub mtime: Nanoseconds,
    pub ctime: Nanoseconds,
    pub crtime: Nanoseconds,
    pub rdev: (u32, u32),
    /// Mount the inode lives on
    pub mount: u32,
}

/// Seek whence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl SeekWhence {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(SeekWhence::Set),
            1 => Some(SeekWhence::Cur),
            2 => Some(SeekWhence::End),
            _ => None,
        }
    }
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

/// File system statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStats {
    pub mount_point: String,
    pub fs_type: FileSystemType,
    pub device: String,
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: usize,
    pub read_only: bool,
}
