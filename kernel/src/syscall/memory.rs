//! Memory mapping calls
//!
//! Protection and mapping flags use the Linux bit values and are translated
//! to the memory manager's own flag types here.

use alloc::format;
use alloc::string::String;

use akern_api::{Error, Result, SyscallNumber, SyscallResult};
use akern_memory_management::{MmapFlags, MmapRequest, Protection};

use super::{Args, FnHandler, SyscallContext, SyscallTable, add};
use crate::kernel::Kernel;

pub const PROT_READ: i64 = 0x1;
pub const PROT_WRITE: i64 = 0x2;
pub const PROT_EXEC: i64 = 0x4;

pub const MAP_SHARED: i64 = 0x01;
pub const MAP_PRIVATE: i64 = 0x02;
pub const MAP_FIXED: i64 = 0x10;
pub const MAP_ANONYMOUS: i64 = 0x20;
pub const MAP_GROWSDOWN: i64 = 0x100;
pub const MAP_LOCKED: i64 = 0x2000;
pub const MAP_POPULATE: i64 = 0x8000;
pub const MAP_NONBLOCK: i64 = 0x10000;
pub const MAP_STACK: i64 = 0x20000;
pub const MAP_HUGETLB: i64 = 0x40000;

const MAP_BITS: [(i64, MmapFlags); 10] = [
    (MAP_SHARED, MmapFlags::SHARED),
    (MAP_PRIVATE, MmapFlags::PRIVATE),
    (MAP_FIXED, MmapFlags::FIXED),
    (MAP_ANONYMOUS, MmapFlags::ANONYMOUS),
    (MAP_GROWSDOWN, MmapFlags::GROWS_DOWN),
    (MAP_LOCKED, MmapFlags::LOCKED),
    (MAP_POPULATE, MmapFlags::POPULATE),
    (MAP_NONBLOCK, MmapFlags::NON_BLOCK),
    (MAP_STACK, MmapFlags::STACK),
    (MAP_HUGETLB, MmapFlags::HUGE_PAGES),
];

pub(super) fn register(table: &SyscallTable) {
    add(table, FnHandler::new(SyscallNumber::Mmap, sys_mmap));
    add(table, FnHandler::new(SyscallNumber::Munmap, sys_munmap));
    add(table, FnHandler::new(SyscallNumber::Mprotect, sys_mprotect));
    add(table, FnHandler::new(SyscallNumber::Brk, sys_brk));
}

fn protection(raw: i64) -> Result<Protection> {
    if raw & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
        return Err(Error::InvalidArgument(format!("protection bits {:#x}", raw)));
    }
    let mut prot = Protection::USER;
    if raw & PROT_READ != 0 {
        prot |= Protection::READ;
    }
    if raw & PROT_WRITE != 0 {
        prot |= Protection::WRITE;
    }
    if raw & PROT_EXEC != 0 {
        prot |= Protection::EXEC;
    }
    Ok(prot)
}

fn map_flags(raw: i64) -> Result<MmapFlags> {
    if raw & (MAP_SHARED | MAP_PRIVATE) == MAP_SHARED | MAP_PRIVATE {
        return Err(Error::InvalidArgument(String::from("MAP_SHARED and MAP_PRIVATE together")));
    }
    Ok(MAP_BITS
        .iter()
        .filter(|(bit, _)| raw & bit != 0)
        .fold(MmapFlags::empty(), |acc, (_, flag)| acc | *flag))
}

/// `mmap(addr, length, prot, flags[, path, offset])`; returns the start address
///
/// Without `MAP_ANONYMOUS` the fifth argument names the backing file.
fn sys_mmap(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let addr = args.u64(0)?;
    let length = args.u64(1)?;
    let prot = protection(args.int(2)?)?;
    let raw_flags = args.int_or(3, MAP_PRIVATE | MAP_ANONYMOUS)?;
    let flags = map_flags(raw_flags)?;

    let mut req = MmapRequest::anonymous(length, prot).at(addr);
    if raw_flags & MAP_ANONYMOUS == 0 {
        let path = args.str(4)?;
        let offset = args.int_or(5, 0)?;
        let offset = u64::try_from(offset).map_err(|_| Error::InvalidArgument(format!("offset {}", offset)))?;
        kernel.check_path_as(ctx.pid, path)?;
        req = req.file(path, offset);
    }
    req = req.with_flags(flags - MmapFlags::ANONYMOUS);
    if flags.contains(MmapFlags::SHARED) {
        req.flags.remove(MmapFlags::PRIVATE);
    }
    let vma = kernel.mmap_with(ctx.pid, req)?;
    Ok(SyscallResult::ok(vma.start as i64))
}

/// `munmap(addr, length)`; returns the resident pages released
fn sys_munmap(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let released = kernel.munmap_for_process(ctx.pid, args.u64(0)?, args.u64(1)?)?;
    Ok(SyscallResult::ok(released as i64))
}

fn sys_mprotect(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let prot = protection(args.int(2)?)?;
    kernel.mprotect_for_process(ctx.pid, args.u64(0)?, args.u64(1)?, prot)?;
    Ok(SyscallResult::ok(0))
}

/// `brk(end)`; zero queries the current break
fn sys_brk(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let end = kernel.brk(ctx.pid, args.u64(0)?)?;
    Ok(SyscallResult::ok(end as i64))
}

#[cfg(test)]
mod tests {
    use akern_api::{INIT_PID, SyscallArg};
    use akern_memory_management::PAGE_SIZE;

    use super::*;
    use crate::config::KernelConfig;

    fn call(kernel: &Kernel, number: SyscallNumber, args: &[SyscallArg]) -> SyscallResult {
        kernel.execute_syscall_as(INIT_PID, number.raw(), args)
    }

    #[test]
    fn test_flag_translation() {
        let flags = map_flags(MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE).unwrap();
        assert_eq!(flags, MmapFlags::SHARED | MmapFlags::ANONYMOUS | MmapFlags::POPULATE);
        assert!(map_flags(MAP_SHARED | MAP_PRIVATE).is_err());
        assert!(protection(0x8).is_err());
        assert!(protection(PROT_READ | PROT_WRITE).unwrap().contains(Protection::READ | Protection::WRITE));
    }

    #[test]
    fn test_mmap_munmap() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let len = (4 * PAGE_SIZE) as i64;
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE;
        let r = call(&kernel, SyscallNumber::Mmap, &[0i64.into(), len.into(), (PROT_READ | PROT_WRITE).into(), flags.into()]);
        assert!(r.success, "{}", r.error_message);
        let addr = r.return_value as u64;
        assert!(kernel.translate_address(INIT_PID, addr).is_ok());

        let r = call(&kernel, SyscallNumber::Mprotect, &[(addr as i64).into(), len.into(), PROT_READ.into()]);
        assert!(r.success);
        let r = call(&kernel, SyscallNumber::Munmap, &[(addr as i64).into(), len.into()]);
        assert_eq!(r.return_value, 4);
        assert!(kernel.translate_address(INIT_PID, addr).is_err());
    }

    #[test]
    fn test_brk_grows() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let base = call(&kernel, SyscallNumber::Brk, &[0i64.into()]).return_value;
        let grown = base + 2 * PAGE_SIZE as i64;
        assert_eq!(call(&kernel, SyscallNumber::Brk, &[grown.into()]).return_value, grown);
    }
}
