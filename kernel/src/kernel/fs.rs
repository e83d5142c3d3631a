//! File system entry points
//!
//! Path operations without a pid run with kernel authority (root at `/`).
//! The per-process ones resolve against the caller's working directory and
//! credentials and go through its sandbox path rules first.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Fd, Gid, Nanoseconds, Pid, Result, Tid, Uid};

use super::Kernel;
use crate::cred::Credentials;
use crate::ipc::PipeEnd;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::process::ProcessManager;
use crate::vfs::{
    DcacheStats, DirEntry, FdTarget, FileAttr, FileSystemType, FsCaller, FsStats, MountFlags, MountPoint, OpenFlags,
    SeekWhence, Vfs, VfsError, VfsResult,
};
use crate::wait::Blocking;

/// Joins `path` onto `cwd` and folds `.` and `..`
pub(crate) fn absolute_path(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') { None } else { Some(cwd) };
    for part in joined.into_iter().chain(core::iter::once(path)).flat_map(|p| p.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

impl Kernel {
    /// Identity `pid` presents to the VFS
    pub(super) fn fs_caller(&self, pm: &ProcessManager, pid: Pid, now: Nanoseconds) -> Result<FsCaller> {
        Self::live_process(pm, pid)?;
        let p = pm.table.get(pid)?;
        let caps = self.security.lock().effective(pid);
        let creds = Credentials {
            pid,
            uid: p.uid,
            gid: p.gid,
            euid: p.euid,
            egid: p.egid,
            caps,
        };
        Ok(FsCaller::new(creds, &p.cwd, now))
    }

    /// Runs `f` on the VFS as `pid`
    pub(crate) fn fs_as<T>(&self, pid: Pid, f: impl FnOnce(&mut Vfs, &FsCaller) -> VfsResult<T>) -> Result<T> {
        let now = self.now();
        let caller = {
            let pm = self.procs.lock();
            self.fs_caller(&pm, pid, now)?
        };
        let mut vfs = self.vfs.lock();
        Ok(f(&mut vfs, &caller)?)
    }

    fn fs_kernel<T>(&self, f: impl FnOnce(&mut Vfs, &FsCaller) -> VfsResult<T>) -> Result<T> {
        let caller = FsCaller::kernel(self.now());
        let mut vfs = self.vfs.lock();
        Ok(f(&mut vfs, &caller)?)
    }

    /// Sandbox path check for `path` as seen from `pid`
    pub(crate) fn check_path_as(&self, pid: Pid, path: &str) -> Result<()> {
        let cwd = self.procs.lock().table.get(pid)?.cwd.clone();
        let full = absolute_path(&cwd, path);
        let checked = self.security.lock().check_path(pid, &full);
        if let Err(err) = &checked {
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("pid {} denied access to {}: {}", pid, full, err),
                LogContext::pid(pid),
            );
        }
        checked
    }

    pub(crate) fn check_creation_as(&self, pid: Pid) -> Result<()> {
        let checked = self.security.lock().check_file_creation(pid);
        if let Err(err) = &checked {
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("pid {} may not create files: {}", pid, err),
                LogContext::pid(pid),
            );
        }
        checked
    }

    // ========================================================================
    // Mounts
    // ========================================================================

    pub fn mount_file_system(
        &self,
        source: &str,
        target: &str,
        fs_type: FileSystemType,
        flags: MountFlags,
        options: &str,
    ) -> Result<u32> {
        let id = self.fs_kernel(|vfs, caller| vfs.mount(caller, source, target, fs_type, flags, options))?;
        self.klog(
            LogLevel::Info,
            LogFacility::Vfs,
            format!("mounted {} ({:?}) on {}", source, fs_type, target),
            LogContext::default(),
        );
        Ok(id)
    }

    pub fn unmount_file_system(&self, target: &str) -> Result<()> {
        self.fs_kernel(|vfs, caller| vfs.unmount(caller, target))?;
        self.klog(
            LogLevel::Info,
            LogFacility::Vfs,
            format!("unmounted {}", target),
            LogContext::default(),
        );
        Ok(())
    }

    pub fn mounted_file_systems(&self) -> Vec<MountPoint> {
        self.vfs.lock().mounted_file_systems()
    }

    /// `statfs` of the mount holding `path`
    pub fn file_system_statistics(&self, path: &str) -> Result<FsStats> {
        self.fs_kernel(|vfs, caller| vfs.statistics(caller, path))
    }

    // ========================================================================
    // Paths, kernel authority
    // ========================================================================

    /// Resolves a path, following symlinks
    pub fn lookup_path(&self, path: &str) -> Result<FileAttr> {
        self.fs_kernel(|vfs, caller| vfs.lookup_path(caller, path))
    }

    pub fn stat_path(&self, path: &str, follow: bool) -> Result<FileAttr> {
        self.fs_kernel(|vfs, caller| vfs.stat(caller, path, follow))
    }

    pub fn create_file(&self, path: &str, mode: u32) -> Result<FileAttr> {
        self.fs_kernel(|vfs, caller| vfs.create_file(caller, path, mode))
    }

    pub fn create_directory(&self, path: &str, mode: u32) -> Result<FileAttr> {
        self.fs_kernel(|vfs, caller| vfs.create_directory(caller, path, mode))
    }

    /// Removes a file, symlink or empty directory
    pub fn delete_inode(&self, path: &str) -> Result<()> {
        self.fs_kernel(|vfs, caller| vfs.delete_inode(caller, path))
    }

    pub fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.fs_kernel(|vfs, caller| vfs.read_directory(caller, path))
    }

    /// Hard link; directories cannot be linked
    pub fn link_path(&self, existing: &str, new_path: &str) -> Result<()> {
        self.fs_kernel(|vfs, caller| vfs.link(caller, existing, new_path))
    }

    pub fn symlink_path(&self, target: &str, link_path: &str) -> Result<FileAttr> {
        self.fs_kernel(|vfs, caller| vfs.symlink(caller, target, link_path))
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        self.fs_kernel(|vfs, caller| vfs.read_link(caller, path))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.fs_kernel(|vfs, caller| vfs.chmod(caller, path, mode))
    }

    pub fn chown(&self, path: &str, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        self.fs_kernel(|vfs, caller| vfs.chown(caller, path, uid, gid))
    }

    /// Drops unreferenced dentries; returns how many went
    pub fn prune_dentries(&self) -> usize {
        self.vfs.lock().prune_dentries()
    }

    pub fn dcache_stats(&self) -> DcacheStats {
        self.vfs.lock().dcache_stats()
    }

    pub fn inode_count(&self) -> usize {
        self.vfs.lock().inode_count()
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Opens `path` for `pid`
    ///
    /// Creating a file that does not exist yet also needs the sandbox's
    /// file-creation permission.
    pub fn open_file(&self, pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        self.check_path_as(pid, path)?;
        if flags.contains(OpenFlags::CREAT) {
            let exists = match self.fs_as(pid, |vfs, caller| vfs.lookup_path(caller, path)) {
                Ok(_) => true,
                Err(Error::NotFound(_)) => false,
                Err(err) => return Err(err),
            };
            if !exists {
                self.check_creation_as(pid)?;
            }
        }
        let fd = self.fs_as(pid, |vfs, caller| vfs.open(caller, path, flags, mode))?;
        self.klog(
            LogLevel::Trace,
            LogFacility::Vfs,
            format!("pid {} opened {} as fd {}", pid, path, fd),
            LogContext::pid(pid),
        );
        Ok(fd)
    }

    /// Reads without blocking; an empty pipe gives `WouldBlock`
    pub fn read_file(&self, pid: Pid, fd: Fd, max: usize) -> Result<Vec<u8>> {
        match self.descriptor_target(pid, fd)? {
            FdTarget::Pipe { id, end } => {
                Self::require_end(end, PipeEnd::Read)?;
                let tid = self.main_thread(pid)?;
                self.pipe_read(tid, id, max, true)?.ready().ok_or(Error::WouldBlock)
            }
            FdTarget::Inode { .. } => {
                let now = self.now();
                Ok(self.vfs.lock().read(pid, fd, max, now)?)
            }
        }
    }

    /// Writes without blocking; a full pipe gives `WouldBlock`
    pub fn write_file(&self, pid: Pid, fd: Fd, data: &[u8]) -> Result<usize> {
        match self.descriptor_target(pid, fd)? {
            FdTarget::Pipe { id, end } => {
                Self::require_end(end, PipeEnd::Write)?;
                let tid = self.main_thread(pid)?;
                self.pipe_write(tid, id, data, true)?.ready().ok_or(Error::WouldBlock)
            }
            FdTarget::Inode { .. } => {
                let now = self.now();
                Ok(self.vfs.lock().write(pid, fd, data, now)?)
            }
        }
    }

    /// `read(2)` on behalf of a thread; pipes block unless the descriptor
    /// is non-blocking
    pub fn read_descriptor(&self, tid: Tid, fd: Fd, max: usize) -> Result<Blocking<Vec<u8>>> {
        let pid = self.procs.lock().pid_of(tid)?;
        let (target, nonblock) = self.descriptor_mode(pid, fd)?;
        match target {
            FdTarget::Pipe { id, end } => {
                Self::require_end(end, PipeEnd::Read)?;
                self.pipe_read(tid, id, max, nonblock)
            }
            FdTarget::Inode { .. } => {
                let now = self.now();
                Ok(Blocking::Ready(self.vfs.lock().read(pid, fd, max, now)?))
            }
        }
    }

    /// `write(2)` on behalf of a thread
    pub fn write_descriptor(&self, tid: Tid, fd: Fd, data: &[u8]) -> Result<Blocking<usize>> {
        let pid = self.procs.lock().pid_of(tid)?;
        let (target, nonblock) = self.descriptor_mode(pid, fd)?;
        match target {
            FdTarget::Pipe { id, end } => {
                Self::require_end(end, PipeEnd::Write)?;
                self.pipe_write(tid, id, data, nonblock)
            }
            FdTarget::Inode { .. } => {
                let now = self.now();
                Ok(Blocking::Ready(self.vfs.lock().write(pid, fd, data, now)?))
            }
        }
    }

    pub fn close_file(&self, pid: Pid, fd: Fd) -> Result<()> {
        let target = self.vfs.lock().close(pid, fd)?;
        if let FdTarget::Pipe { id, end } = target {
            self.close_pipe(id, end)?;
        }
        Ok(())
    }

    pub fn seek_file(&self, pid: Pid, fd: Fd, offset: i64, whence: SeekWhence) -> Result<u64> {
        Ok(self.vfs.lock().seek(pid, fd, offset, whence)?)
    }

    /// Anonymous pipe installed as a read and a write descriptor
    pub fn pipe_fds(&self, pid: Pid, flags: OpenFlags) -> Result<(Fd, Fd)> {
        let id = self.create_pipe(pid)?;
        let mut undo = None;
        let installed = {
            let mut vfs = self.vfs.lock();
            vfs.install_pipe(pid, id, PipeEnd::Read, flags).and_then(|rfd| {
                match vfs.install_pipe(pid, id, PipeEnd::Write, flags) {
                    Ok(wfd) => Ok((rfd, wfd)),
                    Err(err) => {
                        undo = vfs.close(pid, rfd).err();
                        Err(err)
                    }
                }
            })
        };
        if let Some(undo) = undo {
            self.note_failure("pipe descriptor rollback", &undo.into(), LogContext::pid(pid));
        }
        match installed {
            Ok(fds) => Ok(fds),
            Err(err) => {
                for end in [PipeEnd::Read, PipeEnd::Write] {
                    if let Err(undo) = self.close_pipe(id, end) {
                        self.note_failure("pipe rollback", &undo, LogContext::pid(pid));
                    }
                }
                Err(err.into())
            }
        }
    }

    pub fn fd_count(&self, pid: Pid) -> usize {
        self.vfs.lock().fd_count(pid)
    }

    fn descriptor_target(&self, pid: Pid, fd: Fd) -> Result<FdTarget> {
        Ok(self.vfs.lock().descriptor(pid, fd)?.target)
    }

    fn descriptor_mode(&self, pid: Pid, fd: Fd) -> Result<(FdTarget, bool)> {
        let vfs = self.vfs.lock();
        let desc = vfs.descriptor(pid, fd)?;
        Ok((desc.target, desc.nonblocking))
    }

    fn require_end(end: PipeEnd, wanted: PipeEnd) -> Result<()> {
        if end == wanted {
            Ok(())
        } else {
            Err(VfsError::BadDescriptor.into())
        }
    }

    /// First live thread of `pid`
    pub(crate) fn main_thread(&self, pid: Pid) -> Result<Tid> {
        let pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        pm.table
            .threads_of(pid)
            .into_iter()
            .filter(|t| !t.state.has_exited())
            .map(|t| t.tid)
            .min()
            .ok_or_else(|| Error::NotFound(format!("pid {} has no live thread", pid)))
    }

    // ========================================================================
    // Working directory
    // ========================================================================

    pub fn chdir(&self, pid: Pid, path: &str) -> Result<()> {
        self.check_path_as(pid, path)?;
        let dir = self.fs_as(pid, |vfs, caller| vfs.resolve_directory(caller, path))?;
        self.procs.lock().table.get_mut(pid)?.cwd = dir;
        Ok(())
    }

    pub fn getcwd(&self, pid: Pid) -> Result<String> {
        Ok(self.procs.lock().table.get(pid)?.cwd.clone())
    }
}

#[cfg(test)]
mod tests {
    use akern_api::INIT_PID;

    use super::*;
    use crate::config::KernelConfig;
    use crate::security::SandboxProfile;

    #[test]
    fn test_absolute_path() {
        assert_eq!(absolute_path("/home/user", "notes.txt"), "/home/user/notes.txt");
        assert_eq!(absolute_path("/home/user", "../../etc/./passwd"), "/etc/passwd");
        assert_eq!(absolute_path("/tmp", "/var//log/"), "/var/log");
        assert_eq!(absolute_path("/", ".."), "/");
    }

    #[test]
    fn test_open_write_seek_read() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("editor", INIT_PID).unwrap();
        let fd = kernel
            .open_file(pid, "/tmp/notes", OpenFlags::RDWR | OpenFlags::CREAT, 0o644)
            .unwrap();
        assert_eq!(kernel.write_file(pid, fd, b"hello world").unwrap(), 11);
        assert_eq!(kernel.seek_file(pid, fd, 6, SeekWhence::Set).unwrap(), 6);
        assert_eq!(kernel.read_file(pid, fd, 64).unwrap(), b"world");
        kernel.close_file(pid, fd).unwrap();
        assert!(kernel.read_file(pid, fd, 1).is_err());
        assert_eq!(kernel.lookup_path("/tmp/notes").unwrap().size, 11);
    }

    #[test]
    fn test_pipe_descriptors() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("shell", INIT_PID).unwrap();
        let (rfd, wfd) = kernel.pipe_fds(pid, OpenFlags::empty()).unwrap();
        assert_eq!(kernel.fd_count(pid), 2);
        assert_eq!(kernel.write_file(pid, wfd, b"ping").unwrap(), 4);
        assert!(kernel.write_file(pid, rfd, b"x").is_err());
        assert_eq!(kernel.read_file(pid, rfd, 16).unwrap(), b"ping");
        assert_eq!(kernel.read_file(pid, rfd, 16), Err(Error::WouldBlock));

        kernel.close_file(pid, wfd).unwrap();
        assert!(kernel.read_file(pid, rfd, 16).unwrap().is_empty());
    }

    #[test]
    fn test_chdir_and_relative_open() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("worker", INIT_PID).unwrap();
        kernel.create_directory("/srv", 0o755).unwrap();
        kernel.chdir(pid, "/srv").unwrap();
        assert_eq!(kernel.getcwd(pid).unwrap(), "/srv");
        let fd = kernel
            .open_file(pid, "data", OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
            .unwrap();
        kernel.close_file(pid, fd).unwrap();
        assert!(kernel.lookup_path("/srv/data").is_ok());
        assert!(kernel.chdir(pid, "/srv/data").is_err());
    }

    #[test]
    fn test_sandbox_path_rules() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("jailed", INIT_PID).unwrap();
        kernel.install_sandbox_profile(SandboxProfile::new("jail").allow_path("/tmp").without_file_creation());
        kernel.apply_sandbox("jail", pid).unwrap();

        assert!(matches!(
            kernel.open_file(pid, "/etc/../etc/hostname", OpenFlags::RDONLY, 0),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            kernel.open_file(pid, "/tmp/new", OpenFlags::WRONLY | OpenFlags::CREAT, 0o600),
            Err(Error::PermissionDenied(_))
        ));
    }
}
