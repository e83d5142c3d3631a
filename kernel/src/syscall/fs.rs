//! File and descriptor calls
//!
//! Structured replies travel in the result's data bytes, little endian:
//! `stat` packs [`STAT_LEN`] bytes (ino u64, mode u32 with type bits,
//! nlink u32, uid u32, gid u32, size u64, mtime u64), `pipe` packs both
//! descriptors as i32, and name lists are newline separated.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Result, SyscallNumber, SyscallResult};

use super::{Args, FnHandler, SyscallContext, SyscallTable, add, blocking_result};
use crate::kernel::Kernel;
use crate::vfs::{FileAttr, FileSystemType, FileType, MountFlags, OpenFlags, SeekWhence};

/// Bytes of a packed `stat` reply
pub const STAT_LEN: usize = 40;

pub(super) fn register(table: &SyscallTable) {
    use SyscallNumber::*;
    add(table, FnHandler::new(Open, sys_open));
    add(table, FnHandler::new(Close, sys_close));
    add(table, FnHandler::new(Read, sys_read));
    add(table, FnHandler::new(Write, sys_write));
    add(table, FnHandler::new(Lseek, sys_lseek));
    add(table, FnHandler::new(Stat, sys_stat));
    add(table, FnHandler::new(Lstat, sys_lstat));
    add(table, FnHandler::new(Pipe, sys_pipe));
    add(table, FnHandler::new(Mkdir, sys_mkdir));
    add(table, FnHandler::new(Rmdir, sys_rmdir));
    add(table, FnHandler::new(Unlink, sys_unlink));
    add(table, FnHandler::new(Link, sys_link));
    add(table, FnHandler::new(Symlink, sys_symlink));
    add(table, FnHandler::new(Readlink, sys_readlink));
    add(table, FnHandler::new(Chmod, sys_chmod));
    add(table, FnHandler::new(Chown, sys_chown));
    add(table, FnHandler::new(Getdents, sys_getdents));
    add(table, FnHandler::new(Getcwd, sys_getcwd));
    add(table, FnHandler::new(Chdir, sys_chdir));
    add(table, FnHandler::new(Mount, sys_mount).requiring(Capabilities::SYS_ADMIN));
    add(table, FnHandler::new(Umount, sys_umount).requiring(Capabilities::SYS_ADMIN));
}

fn type_bits(kind: FileType) -> u32 {
    match kind {
        FileType::Regular => 0o100000,
        FileType::Directory => 0o040000,
        FileType::Symlink => 0o120000,
        FileType::CharDevice => 0o020000,
        FileType::BlockDevice => 0o060000,
        FileType::Fifo => 0o010000,
        FileType::Socket => 0o140000,
    }
}

fn pack_stat(attr: &FileAttr) -> Vec<u8> {
    let mut out = Vec::with_capacity(STAT_LEN);
    out.extend_from_slice(&attr.ino.to_le_bytes());
    out.extend_from_slice(&(type_bits(attr.kind) | attr.mode).to_le_bytes());
    out.extend_from_slice(&attr.nlink.to_le_bytes());
    out.extend_from_slice(&attr.uid.to_le_bytes());
    out.extend_from_slice(&attr.gid.to_le_bytes());
    out.extend_from_slice(&attr.size.to_le_bytes());
    out.extend_from_slice(&attr.mtime.to_le_bytes());
    out
}

/// `-1` keeps an owner id unchanged
fn optional_id(raw: i64) -> Result<Option<u32>> {
    match raw {
        -1 => Ok(None),
        id => u32::try_from(id)
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("id {}", id))),
    }
}

/// `open(path, flags, mode)`
fn sys_open(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    let flags = OpenFlags::from_bits_truncate(args.int_or(1, 0)? as u32);
    let mode = args.int_or(2, 0o644)? as u32;
    let fd = kernel.open_file(ctx.pid, path, flags, mode)?;
    Ok(SyscallResult::ok(fd as i64))
}

fn sys_close(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    kernel.close_file(ctx.pid, args.i32(0)?)?;
    Ok(SyscallResult::ok(0))
}

/// `read(fd, count)`; the bytes come back as data
fn sys_read(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let fd = args.i32(0)?;
    let count = args.u64(1)? as usize;
    let outcome = kernel.read_descriptor(ctx.tid, fd, count)?;
    Ok(blocking_result(outcome, |bytes| SyscallResult::with_data(bytes.len() as i64, bytes)))
}

/// `write(fd, buf)`
fn sys_write(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let fd = args.i32(0)?;
    let buf = args.bytes(1)?;
    let outcome = kernel.write_descriptor(ctx.tid, fd, buf)?;
    Ok(blocking_result(outcome, |n| SyscallResult::ok(n as i64)))
}

/// `lseek(fd, offset, whence)` with whence 0, 1, 2 for set, current, end
fn sys_lseek(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let fd = args.i32(0)?;
    let offset = args.int(1)?;
    let raw = args.int(2)?;
    let whence = SeekWhence::from_raw(raw).ok_or_else(|| Error::InvalidArgument(format!("whence {}", raw)))?;
    let pos = kernel.seek_file(ctx.pid, fd, offset, whence)?;
    Ok(SyscallResult::ok(pos as i64))
}

fn stat_as(kernel: &Kernel, ctx: &SyscallContext, path: &str, follow: bool) -> Result<SyscallResult> {
    kernel.check_path_as(ctx.pid, path)?;
    let attr = kernel.fs_as(ctx.pid, |vfs, caller| vfs.stat(caller, path, follow))?;
    Ok(SyscallResult::with_data(attr.size as i64, pack_stat(&attr)))
}

fn sys_stat(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    stat_as(kernel, ctx, args.str(0)?, true)
}

fn sys_lstat(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    stat_as(kernel, ctx, args.str(0)?, false)
}

/// `pipe(flags)`; read and write descriptors in the data
fn sys_pipe(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let flags = OpenFlags::from_bits_truncate(args.int_or(0, 0)? as u32) & OpenFlags::NONBLOCK;
    let (rfd, wfd) = kernel.pipe_fds(ctx.pid, flags)?;
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&rfd.to_le_bytes());
    data.extend_from_slice(&wfd.to_le_bytes());
    Ok(SyscallResult::with_data(0, data))
}

fn sys_mkdir(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    let mode = args.int_or(1, 0o755)? as u32;
    kernel.check_path_as(ctx.pid, path)?;
    kernel.check_creation_as(ctx.pid)?;
    let attr = kernel.fs_as(ctx.pid, |vfs, caller| vfs.create_directory(caller, path, mode))?;
    Ok(SyscallResult::ok(attr.ino as i64))
}

fn sys_rmdir(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    kernel.check_path_as(ctx.pid, path)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.rmdir(caller, path))?;
    Ok(SyscallResult::ok(0))
}

fn sys_unlink(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    kernel.check_path_as(ctx.pid, path)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.unlink(caller, path))?;
    Ok(SyscallResult::ok(0))
}

/// `link(existing, new)`
fn sys_link(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let existing = args.str(0)?;
    let new_path = args.str(1)?;
    kernel.check_path_as(ctx.pid, existing)?;
    kernel.check_path_as(ctx.pid, new_path)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.link(caller, existing, new_path))?;
    Ok(SyscallResult::ok(0))
}

/// `symlink(target, link)`; the target is stored verbatim and not checked
fn sys_symlink(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = args.str(0)?;
    let link = args.str(1)?;
    kernel.check_path_as(ctx.pid, link)?;
    kernel.check_creation_as(ctx.pid)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.symlink(caller, target, link))?;
    Ok(SyscallResult::ok(0))
}

fn sys_readlink(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    kernel.check_path_as(ctx.pid, path)?;
    let target = kernel.fs_as(ctx.pid, |vfs, caller| vfs.read_link(caller, path))?;
    Ok(SyscallResult::with_data(target.len() as i64, target.into_bytes()))
}

fn sys_chmod(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    let mode = args.u32(1)?;
    kernel.check_path_as(ctx.pid, path)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.chmod(caller, path, mode))?;
    Ok(SyscallResult::ok(0))
}

/// `chown(path, uid, gid)`; `-1` leaves an id as it is
fn sys_chown(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = args.str(0)?;
    let uid = optional_id(args.int(1)?)?;
    let gid = optional_id(args.int_or(2, -1)?)?;
    kernel.check_path_as(ctx.pid, path)?;
    kernel.fs_as(ctx.pid, |vfs, caller| vfs.chown(caller, path, uid, gid))?;
    Ok(SyscallResult::ok(0))
}

/// `getdents(path)`; entry count as the return value, names as data
fn sys_getdents(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let path = if args.is_empty() { "." } else { args.str(0)? };
    kernel.check_path_as(ctx.pid, path)?;
    let entries = kernel.fs_as(ctx.pid, |vfs, caller| vfs.read_directory(caller, path))?;
    let mut names = String::new();
    for entry in &entries {
        if !names.is_empty() {
            names.push('\n');
        }
        names.push_str(&entry.name);
    }
    Ok(SyscallResult::with_data(entries.len() as i64, names.into_bytes()))
}

fn sys_getcwd(kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    let cwd = kernel.getcwd(ctx.pid)?;
    Ok(SyscallResult::with_data(cwd.len() as i64, cwd.into_bytes()))
}

fn sys_chdir(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    kernel.chdir(ctx.pid, args.str(0)?)?;
    Ok(SyscallResult::ok(0))
}

/// `mount(source, target, fstype, flags, options)`
fn sys_mount(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let source = args.str(0)?;
    let target = args.str(1)?;
    let name = args.str(2)?;
    let fs_type = FileSystemType::from_name(name)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown file system type {}", name)))?;
    let flags = MountFlags::from_bits_truncate(args.int_or(3, 0)? as u32);
    let options = if args.len() > 4 { args.str(4)? } else { "" };
    kernel.check_path_as(ctx.pid, target)?;
    let id = kernel.mount_file_system(source, target, fs_type, flags, options)?;
    Ok(SyscallResult::ok(id as i64))
}

fn sys_umount(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = args.str(0)?;
    kernel.check_path_as(ctx.pid, target)?;
    kernel.unmount_file_system(target)?;
    Ok(SyscallResult::ok(0))
}
