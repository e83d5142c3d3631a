//! Virtual File System
//!
//! Inodes of every mount live in one arena keyed by inode number, and the
//! dentry cache sits in front of directory inodes. Paths are walked one
//! component at a time from the root mount; mounts splice their own root
//! dentry in at the dentry they cover, and symlinks are expanded in place
//! up to a configured depth.
//!
//! Every path operation runs on behalf of a [`FsCaller`], whose
//! credentials drive the mode-bit checks and whose working directory
//! anchors relative paths.

pub mod dentry;
pub mod error;
pub mod fd;
pub mod inode;
pub mod mount;
pub mod types;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use akern_api::{Capabilities, Fd, Gid, Nanoseconds, Pid, ROOT_GID, ROOT_UID, Uid};
use hashbrown::HashMap;

pub use self::dentry::{CacheLookup, DcacheStats, Dentry, DentryCache};
pub use self::error::{VfsError, VfsResult};
pub use self::fd::{FdTable, FdTarget, FileDescriptor};
pub use self::inode::Inode;
pub use self::mount::{MountFlags, MountPoint, SuperBlock};
pub use self::types::{
    Access, DirEntry, FileAttr, FileMode, FileSystemType, FileType, FsStats, OpenFlags, SeekWhence,
};

use self::inode::blocks_for;
use self::mount::{DEFAULT_BLOCKS, DEFAULT_INODES, parse_capacity, parse_mode};
use crate::cred::Credentials;
use crate::ipc::PipeEnd;

/// Mount id of the root file system
pub const ROOT_MOUNT: u32 = 1;

const BOOT_DIRS: [(&str, u32); 8] = [
    ("/bin", 0o755),
    ("/dev", 0o755),
    ("/etc", 0o755),
    ("/home", 0o755),
    ("/proc", 0o555),
    ("/tmp", 0o1777),
    ("/usr", 0o755),
    ("/var", 0o755),
];

/// Who a path operation runs as
#[derive(Debug, Clone)]
pub struct FsCaller {
    pub creds: Credentials,
    /// Absolute working directory
    pub cwd: String,
    pub now: Nanoseconds,
}

impl FsCaller {
    pub fn new(creds: Credentials, cwd: &str, now: Nanoseconds) -> Self {
        Self {
            creds,
            cwd: String::from(cwd),
            now,
        }
    }

    /// Root credentials at `/`
    pub fn kernel(now: Nanoseconds) -> Self {
        Self::new(Credentials::root(), "/", now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Unlink,
    Rmdir,
    Any,
}

pub struct Vfs {
    inodes: BTreeMap<u64, Inode>,
    next_ino: u64,
    dcache: DentryCache,
    mounts: BTreeMap<u32, MountPoint>,
    next_mount: u32,
    root_dentry: u64,
    fds: HashMap<Pid, FdTable>,
    max_symlink_depth: usize,
    max_fds: usize,
}

impl Vfs {
    /// Boots a tmpfs-type `rootfs` at `/` with the standard top-level tree
    pub fn new(max_symlink_depth: usize, max_fds: usize, now: Nanoseconds) -> Self {
        let mut vfs = Self {
            inodes: BTreeMap::new(),
            next_ino: 2,
            dcache: DentryCache::new(),
            mounts: BTreeMap::new(),
            next_mount: ROOT_MOUNT,
            root_dentry: 0,
            fds: HashMap::new(),
            max_symlink_depth,
            max_fds,
        };

        let ino = vfs.alloc_ino();
        let mut sb = SuperBlock::new(FileSystemType::TmpFs, DEFAULT_BLOCKS, DEFAULT_INODES, String::from("rootfs"), ROOT_MOUNT);
        sb.free_inodes -= 1;
        sb.root_ino = ino;
        vfs.inodes.insert(ino, Inode::new(ino, FileType::Directory, 0o755, ROOT_UID, ROOT_GID, ROOT_MOUNT, now));
        vfs.root_dentry = vfs.dcache.new_root("/", ino);
        vfs.mounts.insert(
            ROOT_MOUNT,
            MountPoint {
                id: ROOT_MOUNT,
                source: String::from("rootfs"),
                target: String::from("/"),
                flags: MountFlags::empty(),
                options: String::new(),
                parent: None,
                covered: None,
                root_dentry: vfs.root_dentry,
                superblock: sb,
            },
        );
        vfs.next_mount = ROOT_MOUNT + 1;

        let kernel = FsCaller::kernel(now);
        for (path, mode) in BOOT_DIRS {
            if let Err(e) = vfs.create_directory(&kernel, path, mode) {
                log::error!("vfs: failed to create {}: {:?}", path, e);
            }
        }
        log::info!("vfs: rootfs mounted at /");
        vfs
    }

    // ========================================================================
    // Mounts
    // ========================================================================

    /// Mounts a new file system on the directory at `target`
    ///
    /// `options` may size the device (`blocks=`, `inodes=`) and set the
    /// root directory mode (`mode=`, octal).
    pub fn mount(
        &mut self,
        caller: &FsCaller,
        source: &str,
        target: &str,
        fs_type: FileSystemType,
        flags: MountFlags,
        options: &str,
    ) -> VfsResult<u32> {
        let covered = self.walk(caller, target, true)?;
        let covered_ino = self.ino_of(covered)?;
        let parent = self.inode(covered_ino)?;
        if !parent.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        let parent_mount = parent.mount;
        if self.dcache.get(covered).is_some_and(|d| d.mounted.is_some()) {
            return Err(VfsError::Busy);
        }
        let (blocks, inodes) = parse_capacity(options)?;
        let mode = parse_mode(options)?.unwrap_or(0o755);
        let path = self.path_of(covered)?;

        let id = self.next_mount;
        let mut sb = SuperBlock::new(fs_type, blocks, inodes, String::from(source), id);
        sb.alloc_inode()?;
        let ino = self.alloc_ino();
        sb.root_ino = ino;
        self.inodes
            .insert(ino, Inode::new(ino, FileType::Directory, mode, ROOT_UID, ROOT_GID, id, caller.now));
        let root_dentry = self.dcache.new_root(&path, ino);
        self.next_mount += 1;

        self.mounts.insert(
            id,
            MountPoint {
                id,
                source: String::from(source),
                target: path.clone(),
                flags,
                options: String::from(options),
                parent: Some(parent_mount),
                covered: Some(covered),
                root_dentry,
                superblock: sb,
            },
        );
        if let Some(d) = self.dcache.get_mut(covered) {
            d.mounted = Some(id);
        }
        self.dcache.grab(covered);
        log::info!("vfs: mounted {} ({}) on {}", source, fs_type.name(), path);
        Ok(id)
    }

    /// Unmounts the file system mounted at `target`
    ///
    /// Fails with `Busy` while descriptors are open on it or other mounts
    /// sit on top of it.
    pub fn unmount(&mut self, caller: &FsCaller, target: &str) -> VfsResult<()> {
        let dentry = self.walk(caller, target, true)?;
        let id = self.mount_rooted_at(dentry).map(|m| m.id).ok_or(VfsError::NotMounted)?;
        if id == ROOT_MOUNT {
            return Err(VfsError::Busy);
        }
        if self.mounts.values().any(|m| m.parent == Some(id)) {
            return Err(VfsError::Busy);
        }
        if self.inodes.values().any(|i| i.mount == id && i.open_count > 0) {
            return Err(VfsError::Busy);
        }
        let Some(mount) = self.mounts.remove(&id) else {
            return Err(VfsError::NotMounted);
        };
        self.inodes.retain(|_, i| i.mount != id);
        self.dcache.remove_subtree(mount.root_dentry);
        if let Some(covered) = mount.covered {
            if let Some(d) = self.dcache.get_mut(covered) {
                d.mounted = None;
            }
            self.dcache.put(covered)?;
        }
        log::info!("vfs: unmounted {}", mount.target);
        Ok(())
    }

    pub fn mounted_file_systems(&self) -> Vec<MountPoint> {
        self.mounts.values().cloned().collect()
    }

    /// Statistics of the file system holding `path`
    pub fn statistics(&mut self, caller: &FsCaller, path: &str) -> VfsResult<FsStats> {
        let dentry = self.walk(caller, path, true)?;
        let mount = self.inode(self.ino_of(dentry)?)?.mount;
        Ok(self.mount_ref(mount)?.stats())
    }

    // ========================================================================
    // Namespace operations
    // ========================================================================

    pub fn lookup_path(&mut self, caller: &FsCaller, path: &str) -> VfsResult<FileAttr> {
        self.stat(caller, path, true)
    }

    pub fn stat(&mut self, caller: &FsCaller, path: &str, follow: bool) -> VfsResult<FileAttr> {
        let dentry = self.walk(caller, path, follow)?;
        self.attr_of(self.ino_of(dentry)?)
    }

    pub fn create_file(&mut self, caller: &FsCaller, path: &str, mode: u32) -> VfsResult<FileAttr> {
        let (_, ino) = self.create_node(caller, path, FileType::Regular, mode)?;
        self.attr_of(ino)
    }

    pub fn create_directory(&mut self, caller: &FsCaller, path: &str, mode: u32) -> VfsResult<FileAttr> {
        let (_, ino) = self.create_node(caller, path, FileType::Directory, mode)?;
        self.attr_of(ino)
    }

    /// Removes the name at `path`, whatever it refers to
    ///
    /// Directories must be empty. The inode itself is reclaimed once its
    /// last link is gone and no descriptor has it open.
    pub fn delete_inode(&mut self, caller: &FsCaller, path: &str) -> VfsResult<()> {
        self.remove_entry(caller, path, Removal::Any)
    }

    pub fn unlink(&mut self, caller: &FsCaller, path: &str) -> VfsResult<()> {
        self.remove_entry(caller, path, Removal::Unlink)
    }

    pub fn rmdir(&mut self, caller: &FsCaller, path: &str) -> VfsResult<()> {
        self.remove_entry(caller, path, Removal::Rmdir)
    }

    /// Hard link `new_path` to the inode at `existing`
    pub fn link(&mut self, caller: &FsCaller, existing: &str, new_path: &str) -> VfsResult<()> {
        let src = self.walk(caller, existing, false)?;
        let ino = self.ino_of(src)?;
        if self.inode(ino)?.is_dir() {
            return Err(VfsError::PermissionDenied);
        }
        let (parent, name) = self.walk_parent(caller, new_path)?;
        let pino = self.check_mutable_dir(&caller.creds, parent)?;
        if self.inode(pino)?.mount != self.inode(ino)?.mount {
            return Err(VfsError::CrossDevice);
        }
        if self.peek_child(parent, &name)?.is_some() {
            return Err(VfsError::Exists);
        }
        self.add_entry(pino, parent, &name, ino, caller.now)?;
        let inode = self.inode_mut(ino)?;
        inode.nlink += 1;
        inode.ctime = caller.now;
        Ok(())
    }

    pub fn symlink(&mut self, caller: &FsCaller, target: &str, link_path: &str) -> VfsResult<FileAttr> {
        if target.is_empty() {
            return Err(VfsError::InvalidPath);
        }
        let (_, ino) = self.create_node(caller, link_path, FileType::Symlink, 0o777)?;
        self.inode_mut(ino)?.target = Some(String::from(target));
        self.attr_of(ino)
    }

    pub fn read_link(&mut self, caller: &FsCaller, path: &str) -> VfsResult<String> {
        let dentry = self.walk(caller, path, false)?;
        let inode = self.inode(self.ino_of(dentry)?)?;
        inode.target.clone().ok_or(VfsError::InvalidOperation)
    }

    pub fn read_directory(&mut self, caller: &FsCaller, path: &str) -> VfsResult<Vec<DirEntry>> {
        let dentry = self.walk(caller, path, true)?;
        let ino = self.ino_of(dentry)?;
        let dir = self.inode(ino)?;
        if !dir.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if !dir.permits(&caller.creds, Access::Read) {
            return Err(VfsError::PermissionDenied);
        }
        let listing = dir
            .entries
            .iter()
            .map(|(name, &child)| DirEntry {
                name: name.clone(),
                ino: child,
                kind: self.inodes.get(&child).map_or(FileType::Regular, |i| i.kind),
            })
            .collect();
        self.inode_mut(ino)?.atime = caller.now;
        Ok(listing)
    }

    /// Changes permission bits; owner or `FOWNER` only
    pub fn chmod(&mut self, caller: &FsCaller, path: &str, mode: u32) -> VfsResult<()> {
        let dentry = self.walk(caller, path, true)?;
        let ino = self.ino_of(dentry)?;
        self.check_writable_mount(ino)?;
        let creds = caller.creds;
        let inode = self.inode_mut(ino)?;
        if creds.euid != inode.uid && !creds.is_superuser() && !creds.has(Capabilities::FOWNER) {
            return Err(VfsError::PermissionDenied);
        }
        inode.mode = mode & FileMode::MASK;
        inode.ctime = caller.now;
        Ok(())
    }

    /// Changes ownership; needs `CHOWN`
    pub fn chown(&mut self, caller: &FsCaller, path: &str, uid: Option<Uid>, gid: Option<Gid>) -> VfsResult<()> {
        let dentry = self.walk(caller, path, true)?;
        let ino = self.ino_of(dentry)?;
        self.check_writable_mount(ino)?;
        if caller.creds.euid != ROOT_UID && !caller.creds.has(Capabilities::CHOWN) {
            return Err(VfsError::PermissionDenied);
        }
        let inode = self.inode_mut(ino)?;
        if let Some(uid) = uid {
            inode.uid = uid;
        }
        if let Some(gid) = gid {
            inode.gid = gid;
        }
        inode.mode &= !(FileMode::S_ISUID | FileMode::S_ISGID);
        inode.ctime = caller.now;
        Ok(())
    }

    /// Canonical absolute path of a searchable directory
    pub fn resolve_directory(&mut self, caller: &FsCaller, path: &str) -> VfsResult<String> {
        let dentry = self.walk(caller, path, true)?;
        let dir = self.inode(self.ino_of(dentry)?)?;
        if !dir.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if !dir.permits(&caller.creds, Access::Execute) {
            return Err(VfsError::PermissionDenied);
        }
        self.path_of(dentry)
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Opens `path` in the caller's descriptor table
    pub fn open(&mut self, caller: &FsCaller, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Fd> {
        let follow = !flags.contains(OpenFlags::NOFOLLOW);
        let (dentry, created) = match self.walk(caller, path, follow) {
            Ok(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => return Err(VfsError::Exists),
            Ok(d) => (d, false),
            Err(VfsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                (self.create_node(caller, path, FileType::Regular, mode)?.0, true)
            }
            Err(e) => return Err(e),
        };
        let ino = self.ino_of(dentry)?;
        let inode = self.inode(ino)?;
        let truncate = flags.contains(OpenFlags::TRUNC);
        if inode.is_symlink() {
            return Err(VfsError::TooManyLinks);
        }
        if flags.contains(OpenFlags::DIRECTORY) && !inode.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if inode.is_dir() && (flags.writable() || truncate) {
            return Err(VfsError::IsDirectory);
        }
        if !created {
            if flags.readable() && !inode.permits(&caller.creds, Access::Read) {
                return Err(VfsError::PermissionDenied);
            }
            if (flags.writable() || truncate) && !inode.permits(&caller.creds, Access::Write) {
                return Err(VfsError::PermissionDenied);
            }
        }
        if flags.writable() || truncate {
            self.check_writable_mount(ino)?;
        }

        let fd = self.table_mut(caller.creds.pid).install(FdTarget::Inode { ino, dentry }, flags)?;
        if truncate && flags.writable() {
            self.resize(ino, 0, caller.now)?;
        }
        let inode = self.inode_mut(ino)?;
        inode.open_count += 1;
        inode.atime = caller.now;
        self.dcache.grab(dentry);
        Ok(fd)
    }

    /// Closes `fd`, returning what it referred to
    pub fn close(&mut self, pid: Pid, fd: Fd) -> VfsResult<FdTarget> {
        let desc = self.fds.get_mut(&pid).ok_or(VfsError::BadDescriptor)?.remove(fd)?;
        self.release(desc.target)?;
        Ok(desc.target)
    }

    pub fn descriptor(&self, pid: Pid, fd: Fd) -> VfsResult<&FileDescriptor> {
        self.fds.get(&pid).ok_or(VfsError::BadDescriptor)?.get(fd)
    }

    pub fn read(&mut self, pid: Pid, fd: Fd, max: usize, now: Nanoseconds) -> VfsResult<Vec<u8>> {
        let desc = self.descriptor(pid, fd)?;
        let FdTarget::Inode { ino, .. } = desc.target else {
            return Err(VfsError::InvalidOperation);
        };
        if !desc.flags.readable() {
            return Err(VfsError::BadDescriptor);
        }
        let offset = desc.offset;
        let inode = self.inode_mut(ino)?;
        if inode.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        let len = inode.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(max).min(len);
        let data = inode.data[start..end].to_vec();
        inode.atime = now;
        self.desc_mut(pid, fd)?.offset = offset + data.len() as u64;
        Ok(data)
    }

    pub fn write(&mut self, pid: Pid, fd: Fd, data: &[u8], now: Nanoseconds) -> VfsResult<usize> {
        let desc = self.descriptor(pid, fd)?;
        let FdTarget::Inode { ino, .. } = desc.target else {
            return Err(VfsError::InvalidOperation);
        };
        if !desc.flags.writable() {
            return Err(VfsError::BadDescriptor);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let (append, offset) = (desc.append, desc.offset);
        let size = self.inode(ino)?.data.len() as u64;
        let start = if append { size } else { offset };
        let end = start + data.len() as u64;
        if end > size {
            self.resize(ino, end, now)?;
        }
        let inode = self.inode_mut(ino)?;
        let (start, end) = (start as usize, end as usize);
        inode.data[start..end].copy_from_slice(data);
        inode.mtime = now;
        inode.ctime = now;
        self.desc_mut(pid, fd)?.offset = end as u64;
        Ok(data.len())
    }

    pub fn seek(&mut self, pid: Pid, fd: Fd, offset: i64, whence: SeekWhence) -> VfsResult<u64> {
        let desc = self.descriptor(pid, fd)?;
        let FdTarget::Inode { ino, .. } = desc.target else {
            return Err(VfsError::InvalidOperation);
        };
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => desc.offset,
            SeekWhence::End => self.inode(ino)?.size(),
        };
        let pos = i64::try_from(base)
            .ok()
            .and_then(|b| b.checked_add(offset))
            .filter(|p| *p >= 0)
            .ok_or(VfsError::InvalidOperation)? as u64;
        self.desc_mut(pid, fd)?.offset = pos;
        Ok(pos)
    }

    pub fn install_pipe(&mut self, pid: Pid, id: u32, end: PipeEnd, flags: OpenFlags) -> VfsResult<Fd> {
        self.table_mut(pid).install(FdTarget::Pipe { id, end }, flags)
    }

    /// Copies the parent's descriptors into the child
    ///
    /// Returns the pipe ends the copy now references.
    pub fn fork_fds(&mut self, parent: Pid, child: Pid) -> Vec<(u32, PipeEnd)> {
        let Some(table) = self.fds.get(&parent).cloned() else {
            return Vec::new();
        };
        let mut pipes = Vec::new();
        for desc in table.iter() {
            match desc.target {
                FdTarget::Inode { ino, dentry } => {
                    if let Some(inode) = self.inodes.get_mut(&ino) {
                        inode.open_count += 1;
                    }
                    self.dcache.grab(dentry);
                }
                FdTarget::Pipe { id, end } => pipes.push((id, end)),
            }
        }
        self.fds.insert(child, table);
        pipes
    }

    /// Drops the whole descriptor table of `pid`
    ///
    /// Returns the pipe ends that were open.
    pub fn close_all(&mut self, pid: Pid) -> VfsResult<Vec<(u32, PipeEnd)>> {
        let Some(mut table) = self.fds.remove(&pid) else {
            return Ok(Vec::new());
        };
        let mut pipes = Vec::new();
        for desc in table.drain() {
            match desc.target {
                FdTarget::Pipe { id, end } => pipes.push((id, end)),
                target => self.release(target)?,
            }
        }
        Ok(pipes)
    }

    pub fn fd_count(&self, pid: Pid) -> usize {
        self.fds.get(&pid).map_or(0, FdTable::len)
    }

    pub fn set_fd_limit(&mut self, pid: Pid, limit: usize) {
        self.table_mut(pid).set_limit(limit);
    }

    // ========================================================================
    // Cache
    // ========================================================================

    pub fn prune_dentries(&mut self) -> usize {
        self.dcache.prune()
    }

    pub fn dcache_stats(&self) -> DcacheStats {
        self.dcache.stats()
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn inode(&self, ino: u64) -> VfsResult<&Inode> {
        self.inodes.get(&ino).ok_or(VfsError::NotFound)
    }

    fn inode_mut(&mut self, ino: u64) -> VfsResult<&mut Inode> {
        self.inodes.get_mut(&ino).ok_or(VfsError::NotFound)
    }

    fn mount_ref(&self, id: u32) -> VfsResult<&MountPoint> {
        self.mounts.get(&id).ok_or(VfsError::NotMounted)
    }

    fn ino_of(&self, dentry: u64) -> VfsResult<u64> {
        self.dcache.get(dentry).and_then(|d| d.inode).ok_or(VfsError::NotFound)
    }

    fn attr_of(&self, ino: u64) -> VfsResult<FileAttr> {
        let inode = self.inode(ino)?;
        let bsize = self.mount_ref(inode.mount)?.superblock.block_size;
        Ok(inode.attr(bsize))
    }

    fn table_mut(&mut self, pid: Pid) -> &mut FdTable {
        let limit = self.max_fds;
        self.fds.entry(pid).or_insert_with(|| FdTable::new(limit))
    }

    fn desc_mut(&mut self, pid: Pid, fd: Fd) -> VfsResult<&mut FileDescriptor> {
        self.fds.get_mut(&pid).ok_or(VfsError::BadDescriptor)?.get_mut(fd)
    }

    fn mount_rooted_at(&self, dentry: u64) -> Option<&MountPoint> {
        self.mounts.values().find(|m| m.root_dentry == dentry)
    }

    /// Follows mounts stacked on `dentry` down to the topmost root
    fn step_into_mounts(&self, mut dentry: u64) -> u64 {
        while let Some(id) = self.dcache.get(dentry).and_then(|d| d.mounted) {
            match self.mounts.get(&id) {
                Some(m) => dentry = m.root_dentry,
                None => break,
            }
        }
        dentry
    }

    /// Parent for `..`; at a mount root this crosses into the covered mount
    fn parent_dentry(&self, mut dentry: u64) -> u64 {
        loop {
            let Some(d) = self.dcache.get(dentry) else {
                return dentry;
            };
            if let Some(parent) = d.parent {
                return parent;
            }
            match self.mount_rooted_at(dentry).and_then(|m| m.covered) {
                Some(covered) => dentry = covered,
                None => return dentry,
            }
        }
    }

    pub fn path_of(&self, dentry: u64) -> VfsResult<String> {
        let mut parts = Vec::new();
        let mut cur = dentry;
        loop {
            let d = self.dcache.get(cur).ok_or(VfsError::NotFound)?;
            match d.parent {
                Some(parent) => {
                    parts.push(d.name.as_str());
                    cur = parent;
                }
                None => match self.mount_rooted_at(cur).and_then(|m| m.covered) {
                    Some(covered) => cur = covered,
                    None => break,
                },
            }
        }
        if parts.is_empty() {
            return Ok(String::from("/"));
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn absolute(caller: &FsCaller, path: &str) -> VfsResult<String> {
        if path.is_empty() {
            return Err(VfsError::InvalidPath);
        }
        if path.starts_with('/') {
            Ok(path.to_string())
        } else {
            Ok(format!("{}/{}", caller.cwd.trim_end_matches('/'), path))
        }
    }

    /// Resolves `name` under the directory dentry `parent`
    fn lookup_child(&mut self, parent: u64, name: &str) -> VfsResult<u64> {
        match self.dcache.lookup(parent, name) {
            CacheLookup::Positive(id) => Ok(self.step_into_mounts(id)),
            CacheLookup::Negative(_) => Err(VfsError::NotFound),
            CacheLookup::Miss => {
                let dir = self.ino_of(parent)?;
                let found = self.inode(dir)?.entries.get(name).copied();
                let id = self.dcache.bind(parent, name, found)?;
                match found {
                    Some(_) => Ok(self.step_into_mounts(id)),
                    None => Err(VfsError::NotFound),
                }
            }
        }
    }

    /// Like `lookup_child`, but a missing name is `None`
    fn peek_child(&mut self, parent: u64, name: &str) -> VfsResult<Option<u64>> {
        match self.lookup_child(parent, name) {
            Ok(d) => Ok(Some(d)),
            Err(VfsError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Walks `path` to a positive dentry
    fn walk(&mut self, caller: &FsCaller, path: &str, follow_last: bool) -> VfsResult<u64> {
        let full = Self::absolute(caller, path)?;
        let mut pending: VecDeque<String> = components(&full).collect();
        let mut cur = self.step_into_mounts(self.root_dentry);
        let mut links = 0usize;

        while let Some(name) = pending.pop_front() {
            if name == ".." {
                cur = self.step_into_mounts(self.parent_dentry(cur));
                continue;
            }
            let dir = self.inode(self.ino_of(cur)?)?;
            if !dir.is_dir() {
                return Err(VfsError::NotDirectory);
            }
            if !dir.permits(&caller.creds, Access::Execute) {
                return Err(VfsError::PermissionDenied);
            }
            let next = self.lookup_child(cur, &name)?;
            let inode = self.inode(self.ino_of(next)?)?;
            if inode.is_symlink() && (follow_last || !pending.is_empty()) {
                links += 1;
                if links > self.max_symlink_depth {
                    return Err(VfsError::TooManyLinks);
                }
                let target = inode.target.clone().unwrap_or_default();
                if target.starts_with('/') {
                    cur = self.step_into_mounts(self.root_dentry);
                }
                for part in components(&target).collect::<Vec<_>>().into_iter().rev() {
                    pending.push_front(part);
                }
                continue;
            }
            cur = next;
        }
        Ok(cur)
    }

    /// Walks to the parent directory of `path` and returns the final name
    fn walk_parent(&mut self, caller: &FsCaller, path: &str) -> VfsResult<(u64, String)> {
        let full = Self::absolute(caller, path)?;
        let trimmed = full.trim_end_matches('/');
        let (dir, name) = trimmed.rsplit_once('/').ok_or(VfsError::InvalidPath)?;
        if name.is_empty() || name == "." || name == ".." {
            return Err(VfsError::InvalidPath);
        }
        let dir = if dir.is_empty() { "/" } else { dir };
        let parent = self.walk(caller, dir, true)?;
        let pino = self.ino_of(parent)?;
        let parent_inode = self.inode(pino)?;
        if !parent_inode.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if name.len() > self.mount_ref(parent_inode.mount)?.superblock.max_name_len {
            return Err(VfsError::InvalidPath);
        }
        Ok((parent, String::from(name)))
    }

    fn check_writable_mount(&self, ino: u64) -> VfsResult<()> {
        if self.mount_ref(self.inode(ino)?.mount)?.is_read_only() {
            return Err(VfsError::ReadOnly);
        }
        Ok(())
    }

    /// Directory entries may change only with write and search permission
    fn check_mutable_dir(&self, creds: &Credentials, dir: u64) -> VfsResult<u64> {
        let ino = self.ino_of(dir)?;
        self.check_writable_mount(ino)?;
        let inode = self.inode(ino)?;
        if !inode.permits(creds, Access::Write) || !inode.permits(creds, Access::Execute) {
            return Err(VfsError::PermissionDenied);
        }
        Ok(ino)
    }

    /// In a sticky directory only owners may remove entries
    fn check_sticky(&self, creds: &Credentials, dir: u64, victim: u64) -> VfsResult<()> {
        let dir = self.inode(dir)?;
        if dir.mode & FileMode::S_ISVTX == 0 || creds.is_superuser() {
            return Ok(());
        }
        if creds.euid == dir.uid || creds.euid == self.inode(victim)?.uid {
            return Ok(());
        }
        Err(VfsError::PermissionDenied)
    }

    /// Leaves the directory untouched when the dentry cannot be bound
    fn add_entry(&mut self, dir: u64, parent: u64, name: &str, ino: u64, now: Nanoseconds) -> VfsResult<u64> {
        self.inode(dir)?;
        let dentry = self.dcache.bind(parent, name, Some(ino))?;
        let inode = self.inode_mut(dir)?;
        inode.entries.insert(String::from(name), ino);
        inode.mtime = now;
        inode.ctime = now;
        Ok(dentry)
    }

    fn create_node(&mut self, caller: &FsCaller, path: &str, kind: FileType, mode: u32) -> VfsResult<(u64, u64)> {
        let (parent, name) = self.walk_parent(caller, path)?;
        let pino = self.check_mutable_dir(&caller.creds, parent)?;
        if self.peek_child(parent, &name)?.is_some() {
            return Err(VfsError::Exists);
        }
        let mount = self.inode(pino)?.mount;
        self.mounts
            .get_mut(&mount)
            .ok_or(VfsError::NotMounted)?
            .superblock
            .alloc_inode()?;
        let ino = self.alloc_ino();
        self.inodes.insert(
            ino,
            Inode::new(ino, kind, mode, caller.creds.euid, caller.creds.egid, mount, caller.now),
        );
        let dentry = match self.add_entry(pino, parent, &name, ino, caller.now) {
            Ok(dentry) => dentry,
            Err(err) => {
                self.inodes.remove(&ino);
                if let Some(mount) = self.mounts.get_mut(&mount) {
                    mount.superblock.free_inode();
                }
                return Err(err);
            }
        };
        log::debug!("vfs: created {:?} {} (ino {})", kind, path, ino);
        Ok((dentry, ino))
    }

    fn remove_entry(&mut self, caller: &FsCaller, path: &str, removal: Removal) -> VfsResult<()> {
        let (parent, name) = self.walk_parent(caller, path)?;
        let pino = self.check_mutable_dir(&caller.creds, parent)?;
        let dentry = self.peek_child(parent, &name)?.ok_or(VfsError::NotFound)?;
        if self.dcache.get(dentry).is_some_and(|d| d.parent.is_none()) {
            return Err(VfsError::Busy);
        }
        let ino = self.ino_of(dentry)?;
        self.check_sticky(&caller.creds, pino, ino)?;
        let victim = self.inode(ino)?;
        match (victim.is_dir(), removal) {
            (true, Removal::Unlink) => return Err(VfsError::IsDirectory),
            (false, Removal::Rmdir) => return Err(VfsError::NotDirectory),
            _ => {}
        }
        let is_dir = victim.is_dir();
        if is_dir && !victim.entries.is_empty() {
            return Err(VfsError::NotEmpty);
        }
        if is_dir {
            self.dcache.drop_children(dentry);
        }

        let dir = self.inode_mut(pino)?;
        dir.entries.remove(&name);
        dir.mtime = caller.now;
        dir.ctime = caller.now;
        self.dcache.bind(parent, &name, None)?;

        let victim = self.inode_mut(ino)?;
        victim.nlink = if is_dir { 0 } else { victim.nlink.checked_sub(1).ok_or(VfsError::Corrupted)? };
        victim.ctime = caller.now;
        self.reclaim_if_unused(ino);
        log::debug!("vfs: removed {}", path);
        Ok(())
    }

    /// Grows or shrinks file data, charging the superblock
    fn resize(&mut self, ino: u64, len: u64, now: Nanoseconds) -> VfsResult<()> {
        let inode = self.inode(ino)?;
        let (mount, old) = (inode.mount, inode.data.len() as u64);
        let sb = &mut self.mounts.get_mut(&mount).ok_or(VfsError::NotMounted)?.superblock;
        if len > sb.max_file_size {
            return Err(VfsError::NoSpace);
        }
        let bsize = sb.block_size;
        sb.recharge(blocks_for(old, bsize), blocks_for(len, bsize))?;
        let inode = self.inode_mut(ino)?;
        inode.data.resize(len as usize, 0);
        inode.mtime = now;
        inode.ctime = now;
        Ok(())
    }

    fn release(&mut self, target: FdTarget) -> VfsResult<()> {
        let FdTarget::Inode { ino, dentry } = target else {
            return Ok(());
        };
        let inode = self.inode_mut(ino)?;
        inode.open_count = inode.open_count.checked_sub(1).ok_or(VfsError::Corrupted)?;
        match self.dcache.put(dentry) {
            // Detached when its directory was removed underneath the descriptor
            Ok(()) | Err(VfsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.reclaim_if_unused(ino);
        Ok(())
    }

    fn reclaim_if_unused(&mut self, ino: u64) {
        if !self.inodes.get(&ino).is_some_and(Inode::is_reclaimable) {
            return;
        }
        let Some(inode) = self.inodes.remove(&ino) else {
            return;
        };
        if let Some(mount) = self.mounts.get_mut(&inode.mount) {
            let sb = &mut mount.superblock;
            let held = inode.blocks(sb.block_size);
            sb.release_blocks(held);
            sb.free_inode();
        }
        log::trace!("vfs: reclaimed ino {}", ino);
    }
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs() -> Vfs {
        Vfs::new(8, 16, 0)
    }

    fn user(pid: Pid, uid: Uid) -> FsCaller {
        FsCaller::new(Credentials::user(pid, uid, uid, Capabilities::empty()), "/", 0)
    }

    #[test]
    fn test_boot_tree() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        let names: Vec<_> = vfs.read_directory(&root, "/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["bin", "dev", "etc", "home", "proc", "tmp", "usr", "var"]);
        assert_eq!(vfs.stat(&root, "/tmp", true).unwrap().mode, 0o1777);
    }

    #[test]
    fn test_create_lookup_delete() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.create_file(&root, "/tmp/a.txt", 0o644).unwrap();
        let attr = vfs.lookup_path(&root, "/tmp/a.txt").unwrap();
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.kind, FileType::Regular);
        assert_eq!(vfs.create_file(&root, "/tmp/a.txt", 0o644), Err(VfsError::Exists));

        vfs.delete_inode(&root, "/tmp/a.txt").unwrap();
        assert_eq!(vfs.lookup_path(&root, "/tmp/a.txt"), Err(VfsError::NotFound));
        assert!(vfs.dcache_stats().negative_hits >= 1);
    }

    #[test]
    fn test_descriptor_offsets_are_independent() {
        let mut vfs = vfs();
        let caller = FsCaller::kernel(0);
        let flags = OpenFlags::RDWR | OpenFlags::CREAT;
        let a = vfs.open(&caller, "/tmp/f", flags, 0o644).unwrap();
        let b = vfs.open(&caller, "/tmp/f", OpenFlags::RDONLY, 0).unwrap();
        assert_ne!(a, b);

        assert_eq!(vfs.write(1, a, b"hello world", 5).unwrap(), 11);
        assert_eq!(vfs.read(1, b, 5, 6).unwrap(), b"hello");
        assert_eq!(vfs.read(1, b, 100, 6).unwrap(), b" world");
        assert_eq!(vfs.seek(1, a, -5, SeekWhence::End).unwrap(), 6);
        assert_eq!(vfs.read(1, a, 5, 7).unwrap(), b"world");
        assert_eq!(vfs.write(1, b, b"x", 7), Err(VfsError::BadDescriptor));
        assert_eq!(vfs.seek(1, b, -1, SeekWhence::Set), Err(VfsError::InvalidOperation));
    }

    #[test]
    fn test_unlinked_file_lives_until_last_close() {
        let mut vfs = vfs();
        let caller = FsCaller::kernel(0);
        let fd = vfs.open(&caller, "/tmp/held", OpenFlags::RDWR | OpenFlags::CREAT, 0o600).unwrap();
        let before = vfs.inode_count();
        vfs.write(1, fd, &[7; 5000], 1).unwrap();
        let used = vfs.statistics(&caller, "/tmp").unwrap().bfree;

        vfs.unlink(&caller, "/tmp/held").unwrap();
        assert_eq!(vfs.inode_count(), before);
        vfs.seek(1, fd, 0, SeekWhence::Set).unwrap();
        assert_eq!(vfs.read(1, fd, 2, 2).unwrap(), [7, 7]);

        vfs.close(1, fd).unwrap();
        assert_eq!(vfs.inode_count(), before - 1);
        assert_eq!(vfs.statistics(&caller, "/tmp").unwrap().bfree, used + 2);
    }

    #[test]
    fn test_symlinks_and_loops() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.create_directory(&root, "/home/u", 0o755).unwrap();
        vfs.create_file(&root, "/home/u/data", 0o644).unwrap();
        vfs.symlink(&root, "u/data", "/home/link").unwrap();
        vfs.symlink(&root, "/home/loop2", "/home/loop1").unwrap();
        vfs.symlink(&root, "/home/loop1", "/home/loop2").unwrap();

        let target = vfs.lookup_path(&root, "/home/u/data").unwrap();
        assert_eq!(vfs.lookup_path(&root, "/home/link").unwrap().ino, target.ino);
        assert_eq!(vfs.stat(&root, "/home/link", false).unwrap().kind, FileType::Symlink);
        assert_eq!(vfs.read_link(&root, "/home/link").unwrap(), "u/data");
        assert_eq!(vfs.lookup_path(&root, "/home/loop1"), Err(VfsError::TooManyLinks));
        assert_eq!(
            vfs.open(&root, "/home/link", OpenFlags::NOFOLLOW, 0),
            Err(VfsError::TooManyLinks)
        );
    }

    #[test]
    fn test_mount_splices_and_dotdot_crosses_back() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.create_directory(&root, "/mnt", 0o755).unwrap();
        let id = vfs
            .mount(&root, "/dev/sdb1", "/mnt", FileSystemType::Ext4, MountFlags::empty(), "inodes=3")
            .unwrap();
        vfs.create_directory(&root, "/mnt/sub", 0o755).unwrap();

        let sub = vfs.stat(&root, "/mnt/sub", true).unwrap();
        assert_eq!(sub.mount, id);
        assert_eq!(vfs.stat(&root, "/mnt/sub/../..", true).unwrap().ino, vfs.stat(&root, "/", true).unwrap().ino);
        let inside = FsCaller::new(Credentials::root(), "/mnt/sub", 0);
        assert_eq!(vfs.resolve_directory(&inside, "..").unwrap(), "/mnt");

        vfs.create_file(&root, "/mnt/a", 0o644).unwrap();
        assert_eq!(vfs.create_file(&root, "/mnt/b", 0o644), Err(VfsError::NoSpace));
        assert_eq!(vfs.link(&root, "/mnt/a", "/tmp/a"), Err(VfsError::CrossDevice));

        let fd = vfs.open(&root, "/mnt/a", OpenFlags::RDONLY, 0).unwrap();
        assert_eq!(vfs.unmount(&root, "/mnt"), Err(VfsError::Busy));
        vfs.close(1, fd).unwrap();
        vfs.unmount(&root, "/mnt").unwrap();
        assert_eq!(vfs.lookup_path(&root, "/mnt/sub"), Err(VfsError::NotFound));
        assert_eq!(vfs.mounted_file_systems().len(), 1);
    }

    #[test]
    fn test_read_only_mount_rejects_mutation() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.mount(&root, "cdrom", "/usr", FileSystemType::Iso9660, MountFlags::RDONLY, "")
            .unwrap();
        assert_eq!(vfs.create_file(&root, "/usr/x", 0o644), Err(VfsError::ReadOnly));
        assert!(vfs.statistics(&root, "/usr").unwrap().read_only);
    }

    #[test]
    fn test_permissions_and_sticky_tmp() {
        let mut vfs = vfs();
        let alice = user(10, 1000);
        let bob = user(11, 1001);
        assert_eq!(vfs.create_file(&alice, "/etc/passwd", 0o644), Err(VfsError::PermissionDenied));

        vfs.create_file(&alice, "/tmp/mine", 0o644).unwrap();
        assert_eq!(vfs.unlink(&bob, "/tmp/mine"), Err(VfsError::PermissionDenied));
        assert_eq!(vfs.chmod(&bob, "/tmp/mine", 0o777), Err(VfsError::PermissionDenied));
        assert_eq!(
            vfs.open(&bob, "/tmp/mine", OpenFlags::WRONLY, 0),
            Err(VfsError::PermissionDenied)
        );
        vfs.open(&bob, "/tmp/mine", OpenFlags::RDONLY, 0).unwrap();
        vfs.unlink(&alice, "/tmp/mine").unwrap();
    }

    #[test]
    fn test_rmdir_rules() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.create_directory(&root, "/var/log", 0o755).unwrap();
        vfs.create_file(&root, "/var/log/syslog", 0o644).unwrap();
        assert_eq!(vfs.rmdir(&root, "/var/log"), Err(VfsError::NotEmpty));
        assert_eq!(vfs.unlink(&root, "/var/log"), Err(VfsError::IsDirectory));
        assert_eq!(vfs.rmdir(&root, "/var/log/syslog"), Err(VfsError::NotDirectory));
        vfs.unlink(&root, "/var/log/syslog").unwrap();
        vfs.rmdir(&root, "/var/log").unwrap();
        assert!(vfs.prune_dentries() > 0);
    }

    #[test]
    fn test_hard_links_share_inode() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        vfs.create_file(&root, "/tmp/one", 0o644).unwrap();
        vfs.link(&root, "/tmp/one", "/tmp/two").unwrap();
        assert_eq!(vfs.lookup_path(&root, "/tmp/two").unwrap().nlink, 2);
        vfs.unlink(&root, "/tmp/one").unwrap();
        assert_eq!(vfs.lookup_path(&root, "/tmp/two").unwrap().nlink, 1);
        assert_eq!(vfs.link(&root, "/tmp", "/tmp/dir"), Err(VfsError::PermissionDenied));
    }

    #[test]
    fn test_failed_link_leaves_count_alone() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        let before = vfs.inode_count();
        vfs.create_file(&root, "/tmp/src", 0o644).unwrap();
        vfs.create_file(&root, "/tmp/taken", 0o644).unwrap();
        assert_eq!(vfs.link(&root, "/tmp/src", "/tmp/taken"), Err(VfsError::Exists));
        assert_eq!(vfs.lookup_path(&root, "/tmp/src").unwrap().nlink, 1);

        vfs.unlink(&root, "/tmp/src").unwrap();
        vfs.unlink(&root, "/tmp/taken").unwrap();
        assert_eq!(vfs.inode_count(), before);
    }

    #[test]
    fn test_descriptor_outlives_removed_parent() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        let before = vfs.inode_count();
        vfs.create_directory(&root, "/tmp/d", 0o755).unwrap();
        let fd = vfs.open(&root, "/tmp/d/f", OpenFlags::RDWR | OpenFlags::CREAT, 0o644).unwrap();
        vfs.unlink(&root, "/tmp/d/f").unwrap();
        vfs.rmdir(&root, "/tmp/d").unwrap();
        assert_eq!(vfs.inode_count(), before + 1);

        assert_eq!(vfs.write(1, fd, b"still here", 1).unwrap(), 10);
        vfs.close(1, fd).unwrap();
        assert_eq!(vfs.inode_count(), before);
    }

    #[test]
    fn test_empty_write_past_end_is_noop() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        let fd = vfs.open(&root, "/tmp/sparse", OpenFlags::RDWR | OpenFlags::CREAT, 0o644).unwrap();
        vfs.seek(1, fd, 100, SeekWhence::Set).unwrap();
        assert_eq!(vfs.write(1, fd, b"", 1).unwrap(), 0);
        assert_eq!(vfs.stat(&root, "/tmp/sparse", true).unwrap().size, 0);
        assert_eq!(vfs.seek(1, fd, 0, SeekWhence::Cur).unwrap(), 100);
    }

    #[test]
    fn test_fork_and_close_all() {
        let mut vfs = vfs();
        let root = FsCaller::kernel(0);
        let fd = vfs.open(&root, "/tmp/shared", OpenFlags::RDWR | OpenFlags::CREAT, 0o644).unwrap();
        vfs.install_pipe(1, 4, PipeEnd::Read, OpenFlags::RDONLY).unwrap();
        assert_eq!(vfs.fork_fds(1, 2), [(4, PipeEnd::Read)]);
        assert_eq!(vfs.fd_count(2), 2);

        vfs.unlink(&root, "/tmp/shared").unwrap();
        vfs.close(1, fd).unwrap();
        let before = vfs.inode_count();
        assert_eq!(vfs.close_all(2).unwrap(), [(4, PipeEnd::Read)]);
        assert_eq!(vfs.inode_count(), before - 1);
    }
}
