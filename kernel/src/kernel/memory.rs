//! Memory entry points
//!
//! Thin wrappers over [`MemoryManager`](akern_memory_management::MemoryManager)
//! that add what only the kernel knows: whether the process is alive, its
//! sandbox memory budget, the VFS for file-backed mappings, fault counters
//! in the PCB and signal delivery for fatal faults.

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result};
use akern_memory_management::{
    AccessKind, AccessResult, FaultOutcome, FaultReason, MemoryManager, MemoryStatistics, MemoryZone,
    MmapFlags, MmapRequest, PageTableEntry, PhysAddr, Protection, SlabCacheStats, TlbStats, VirtAddr,
    Vma, VmaBacking, ZoneStats, page_round_up,
};

use super::Kernel;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::process::ProcessManager;

impl Kernel {
    pub(super) fn live_process(pm: &ProcessManager, pid: Pid) -> Result<()> {
        let p = pm.table.get(pid)?;
        if p.state.has_exited() {
            return Err(Error::NotFound(format!("pid {} has exited", pid)));
        }
        Ok(())
    }

    fn sync_fault_counters(pm: &mut ProcessManager, memory: &MemoryManager, pid: Pid) {
        if let (Ok(counters), Ok(p)) = (memory.fault_counters(pid), pm.table.get_mut(pid)) {
            p.page_faults = counters.page_faults;
            p.minor_faults = counters.minor;
            p.major_faults = counters.major;
        }
    }

    fn after_fault(&self, pm: &mut ProcessManager, pid: Pid, vaddr: VirtAddr, outcome: FaultOutcome, now: Nanoseconds) {
        match outcome {
            FaultOutcome::Fatal { signal } => {
                let ctx = LogContext::pid(pid);
                self.klog(
                    LogLevel::Error,
                    LogFacility::Memory,
                    format!("fatal page fault at {:#x} in pid {}, delivering signal {}", vaddr, pid, signal),
                    ctx,
                );
                if let Err(err) = self.signal_locked(pm, pid, signal, now) {
                    self.note_failure("fault signal", &err, ctx);
                }
            }
            FaultOutcome::Minor | FaultOutcome::Major => self.enforce_memory_limits(pm, now),
            FaultOutcome::Spurious => {}
        }
    }

    /// Anonymous mapping in `pid`'s address space
    ///
    /// `addr` is a hint unless `flags` has `FIXED`; zero lets the kernel
    /// choose. The returned area never overlaps another area of `pid`.
    pub fn mmap_for_process(
        &self,
        pid: Pid,
        addr: VirtAddr,
        length: u64,
        prot: Protection,
        flags: MmapFlags,
    ) -> Result<Vma> {
        let mut req = MmapRequest::anonymous(length, prot).at(addr).with_flags(flags);
        if flags.contains(MmapFlags::SHARED) {
            req.flags.remove(MmapFlags::PRIVATE);
        }
        self.mmap_with(pid, req)
    }

    /// Mapping from a full request, including file-backed ones
    pub fn mmap_with(&self, pid: Pid, req: MmapRequest) -> Result<Vma> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_process(&pm, pid)?;

        let mapped: u64 = self.memory.lock().vmas(pid)?.iter().map(Vma::len).sum();
        let wanted = mapped.saturating_add(page_round_up(req.length));
        let budget = self.security.lock().check_memory(pid, wanted);
        if let Err(err) = budget {
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("pid {} mapping of {} bytes exceeds its sandbox memory", pid, req.length),
                LogContext::pid(pid),
            );
            return Err(err);
        }
        if let VmaBacking::File { path, .. } = &req.backing {
            let caller = self.fs_caller(&pm, pid, now)?;
            self.vfs.lock().lookup_path(&caller, path)?;
        }

        let eager = req.flags.intersects(MmapFlags::POPULATE | MmapFlags::LOCKED);
        let vma = {
            let mut memory = self.memory.lock();
            let vma = memory.mmap(pid, req)?;
            Self::sync_fault_counters(&mut pm, &memory, pid);
            vma
        };
        self.klog(
            LogLevel::Debug,
            LogFacility::Memory,
            format!("pid {} mapped {} at [{:#x}, {:#x})", pid, vma.name, vma.start, vma.end),
            LogContext::pid(pid),
        );
        if eager {
            self.enforce_memory_limits(&mut pm, now);
        }
        Ok(vma)
    }

    /// Unmaps a range; returns the resident pages released
    pub fn munmap_for_process(&self, pid: Pid, addr: VirtAddr, length: u64) -> Result<u64> {
        let released = self.memory.lock().munmap(pid, addr, length)?;
        self.klog(
            LogLevel::Debug,
            LogFacility::Memory,
            format!("pid {} unmapped [{:#x}, +{:#x}), {} pages released", pid, addr, length, released),
            LogContext::pid(pid),
        );
        Ok(released)
    }

    pub fn mprotect_for_process(&self, pid: Pid, addr: VirtAddr, length: u64, prot: Protection) -> Result<()> {
        self.memory.lock().mprotect(pid, addr, length, prot)
    }

    /// Moves the program break; zero queries it
    pub fn brk(&self, pid: Pid, new_end: VirtAddr) -> Result<VirtAddr> {
        let pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        if new_end != 0 {
            let mut memory = self.memory.lock();
            let current = memory.current_brk(pid)?;
            if new_end > current {
                let mapped: u64 = memory.vmas(pid)?.iter().map(Vma::len).sum();
                self.security
                    .lock()
                    .check_memory(pid, mapped.saturating_add(page_round_up(new_end - current)))?;
            }
            return memory.brk(pid, new_end);
        }
        self.memory.lock().brk(pid, 0)
    }

    /// Resolves a fault raised on `vaddr`
    ///
    /// Fatal outcomes deliver their signal to the process before returning.
    pub fn handle_page_fault(&self, pid: Pid, vaddr: VirtAddr, reason: FaultReason) -> Result<FaultOutcome> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        let outcome = {
            let mut memory = self.memory.lock();
            let outcome = memory.handle_page_fault(pid, vaddr, reason)?;
            Self::sync_fault_counters(&mut pm, &memory, pid);
            outcome
        };
        self.after_fault(&mut pm, pid, vaddr, outcome, now);
        Ok(outcome)
    }

    /// Simulated load, store or instruction fetch
    pub fn access(&self, pid: Pid, vaddr: VirtAddr, kind: AccessKind) -> Result<AccessResult> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        let result = {
            let mut memory = self.memory.lock();
            let result = memory.access(pid, vaddr, kind)?;
            Self::sync_fault_counters(&mut pm, &memory, pid);
            result
        };
        if let Some((_, outcome)) = result.fault {
            self.after_fault(&mut pm, pid, vaddr, outcome, now);
        }
        Ok(result)
    }

    /// Virtual to physical translation through the TLB and page table
    pub fn translate_address(&self, pid: Pid, vaddr: VirtAddr) -> Result<PhysAddr> {
        self.memory.lock().translate(pid, vaddr)
    }

    /// Maps one page with a fresh frame
    pub fn map_virtual_address(&self, pid: Pid, vaddr: VirtAddr, prot: Protection) -> Result<PhysAddr> {
        self.memory.lock().map_page(pid, vaddr, prot)
    }

    pub fn unmap_virtual_address(&self, pid: Pid, vaddr: VirtAddr) -> Result<()> {
        self.memory.lock().unmap_page(pid, vaddr)
    }

    /// Pushes one resident page out to swap
    pub fn swap_out(&self, pid: Pid, vaddr: VirtAddr) -> Result<()> {
        self.memory.lock().swap_out(pid, vaddr)
    }

    pub fn page_entry(&self, pid: Pid, vaddr: VirtAddr) -> Option<PageTableEntry> {
        self.memory.lock().page_entry(pid, vaddr)
    }

    pub fn vmas(&self, pid: Pid) -> Result<Vec<Vma>> {
        self.memory.lock().vmas(pid)
    }

    pub fn find_vma(&self, pid: Pid, addr: VirtAddr) -> Result<Option<Vma>> {
        self.memory.lock().find_vma(pid, addr)
    }

    pub fn resident_pages(&self, pid: Pid) -> u64 {
        self.memory.lock().resident_pages(pid)
    }

    // ---- allocators ----

    pub fn slab_create(&self, name: &str, size: u64, align: u64) -> Result<u32> {
        self.memory.lock().slab_create(name, size, align)
    }

    /// Fails with `Busy` while objects are live
    pub fn slab_destroy(&self, id: u32) -> Result<()> {
        self.memory.lock().slab_destroy(id)
    }

    pub fn slab_alloc(&self, id: u32) -> Result<u64> {
        self.memory.lock().slab_alloc(id)
    }

    pub fn slab_free(&self, id: u32, addr: u64) -> Result<()> {
        self.memory.lock().slab_free(id, addr)
    }

    /// Returns empty slabs to the buddy allocator; yields the pages freed
    pub fn slab_shrink(&self, id: u32) -> Result<u64> {
        self.memory.lock().slab_shrink(id)
    }

    pub fn slab_stats(&self, id: u32) -> Result<SlabCacheStats> {
        self.memory.lock().slab_stats(id)
    }

    /// `2^order` contiguous pages from `zone` or its fallbacks; returns the pfn
    pub fn buddy_alloc(&self, order: usize, zone: MemoryZone) -> Result<u64> {
        self.memory.lock().buddy_alloc(order, zone)
    }

    pub fn buddy_free(&self, pfn: u64) -> Result<()> {
        self.memory.lock().buddy_free(pfn)
    }

    pub fn allocate_page(&self) -> Result<PhysAddr> {
        self.memory.lock().allocate_page()
    }

    pub fn free_page(&self, paddr: PhysAddr) -> Result<()> {
        self.memory.lock().free_page(paddr)
    }

    pub fn zone_stats(&self, zone: MemoryZone) -> ZoneStats {
        self.memory.lock().zone_stats(zone)
    }

    // ---- TLB ----

    pub fn flush_tlb(&self) {
        self.memory.lock().flush_tlb();
    }

    pub fn flush_tlb_entry(&self, vaddr: VirtAddr) {
        self.memory.lock().flush_tlb_entry(vaddr);
    }

    pub fn flush_tlb_asid(&self, pid: Pid) {
        self.memory.lock().flush_tlb_asid(pid);
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.memory.lock().tlb_stats()
    }

    pub fn memory_statistics(&self) -> MemoryStatistics {
        self.memory.lock().statistics()
    }
}

#[cfg(test)]
mod tests {
    use akern_api::INIT_PID;
    use akern_memory_management::PAGE_SIZE;

    use super::*;
    use crate::config::KernelConfig;
    use crate::process::ProcessState;

    #[test]
    fn test_mmap_translate_munmap() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("app", INIT_PID).unwrap();
        let vma = kernel
            .mmap_for_process(pid, 0, PAGE_SIZE, Protection::READ | Protection::WRITE, MmapFlags::ANONYMOUS)
            .unwrap();
        assert_eq!(vma.len(), PAGE_SIZE);

        let result = kernel.access(pid, vma.start, AccessKind::Write).unwrap();
        assert!(result.physical.is_some());
        assert_eq!(kernel.process(pid).unwrap().minor_faults, 1);
        assert!(kernel.translate_address(pid, vma.start).is_ok());

        kernel.munmap_for_process(pid, vma.start, vma.len()).unwrap();
        assert!(matches!(kernel.translate_address(pid, vma.start), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_fatal_fault_kills_process() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("crash", INIT_PID).unwrap();
        let outcome = kernel.handle_page_fault(pid, 0x10, FaultReason::NotPresent).unwrap();
        assert!(outcome.is_fatal());
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Zombie);
        assert!(kernel.memory_statistics().faults.fatal >= 1);
    }

    #[test]
    fn test_file_mapping_needs_existing_path() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("reader", INIT_PID).unwrap();
        let req = MmapRequest::anonymous(PAGE_SIZE, Protection::READ).file("/etc/missing", 0);
        assert!(matches!(kernel.mmap_with(pid, req), Err(Error::NotFound(_))));

        kernel.create_file("/etc/present", 0o644).unwrap();
        let req = MmapRequest::anonymous(PAGE_SIZE, Protection::READ).file("/etc/present", 0);
        assert_eq!(kernel.mmap_with(pid, req).unwrap().name, "/etc/present");
    }
}
