//! Memory manager
//!
//! Composes the allocators, page tables, TLB and VMA sets into per-process
//! address spaces keyed by an address space id (the owning pid). All
//! operations are synchronous state transitions; callers serialize access
//! (the kernel keeps the manager behind a lock).

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Result};
use hashbrown::HashMap;

use crate::allocator::buddy::{BuddyAllocator, BuddyStats, MemoryZone, ZoneStats};
use crate::allocator::slab::{SlabAllocator, SlabCacheStats};
use crate::page_table::{PageState, PageTable, PageTableEntry, PteFlags};
use crate::physical::{
    PAGE_SIZE, PhysAddr, VirtAddr, addr_to_pfn, is_page_aligned, page_round_down, page_round_up,
    pfn_to_addr,
};
use crate::tlb::{Tlb, TlbStats};
use crate::vma::{MIN_MAP_ADDR, MmapFlags, Protection, Vma, VmaBacking, VmaSet};
use crate::{SIGBUS, SIGSEGV};

/// How far below a grows-down area a fault may extend it
pub const STACK_GUARD_PAGES: u64 = 256;

/// Memory manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Pages per zone, in [`MemoryZone::ALL`] order
    pub zone_pages: [u64; 6],
    /// Swap slots (one page each)
    pub swap_pages: u64,
    /// TLB entries
    pub tlb_capacity: usize,
    /// Top of the top-down mmap search
    pub mmap_base: VirtAddr,
    /// Top of the stack search
    pub stack_top: VirtAddr,
    /// Start of every heap
    pub heap_base: VirtAddr,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            zone_pages: [1024, 3072, 12288, 0, 0, 0],
            swap_pages: 4096,
            tlb_capacity: 64,
            mmap_base: 0x7f00_0000_0000,
            stack_top: 0x7fff_ffff_f000,
            heap_base: 0x1000_0000,
        }
    }
}

/// Why a page fault was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReason {
    /// No translation for the page
    NotPresent,
    /// The access violated the page protection
    Protection,
    /// Write to a page without a translation
    WriteAccess,
    /// Instruction fetch from a page without a translation
    InstructionFetch,
    /// Reserved bit set in a page table entry
    Reserved,
    /// Write to a copy-on-write page
    CopyOnWrite,
    /// Access to a swapped-out page
    SwapIn,
    /// First touch of an anonymous page
    DemandZero,
    /// First touch of a file-backed page
    MemoryMapped,
    /// Access just below a grows-down area
    StackGrowth,
}

impl FaultReason {
    /// The access implied by this fault
    pub fn access(self) -> AccessKind {
        match self {
            FaultReason::WriteAccess | FaultReason::CopyOnWrite => AccessKind::Write,
            FaultReason::InstructionFetch => AccessKind::Execute,
            _ => AccessKind::Read,
        }
    }
}

/// Kind of simulated memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Load
    Read,
    /// Store
    Write,
    /// Instruction fetch
    Execute,
}

/// Result of handling a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOutcome {
    /// Resolved without I/O
    Minor,
    /// Resolved with simulated I/O (swap or file read)
    Major,
    /// Nothing to do; the translation was already valid
    Spurious,
    /// Unresolvable; `signal` must be delivered to the owner
    Fatal {
        /// Signal number (SIGSEGV or SIGBUS)
        signal: u32,
    },
}

impl FaultOutcome {
    /// Whether the fault kills the access
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultOutcome::Fatal { .. })
    }
}

/// Outcome of a simulated access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessResult {
    /// Physical address reached, `None` after a fatal fault
    pub physical: Option<PhysAddr>,
    /// Last fault raised on the way, if any
    pub fault: Option<(FaultReason, FaultOutcome)>,
}

/// Fault counters, per address space and global
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    /// Faults handled
    pub page_faults: u64,
    /// Minor faults
    pub minor: u64,
    /// Major faults
    pub major: u64,
    /// Spurious faults
    pub spurious: u64,
    /// Fatal faults
    pub fatal: u64,
    /// Copy-on-write breaks
    pub cow: u64,
}

impl FaultCounters {
    fn record(&mut self, outcome: FaultOutcome) {
        self.page_faults += 1;
        match outcome {
            FaultOutcome::Minor => self.minor += 1,
            FaultOutcome::Major => self.major += 1,
            FaultOutcome::Spurious => self.spurious += 1,
            FaultOutcome::Fatal { .. } => self.fatal += 1,
        }
    }
}

/// Parameters of an `mmap` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapRequest {
    /// Placement hint (or exact address with `FIXED`), 0 for none
    pub addr: VirtAddr,
    /// Length in bytes, rounded up to pages
    pub length: u64,
    /// Protection
    pub protection: Protection,
    /// Flags
    pub flags: MmapFlags,
    /// Backing store
    pub backing: VmaBacking,
    /// Optional label
    pub name: Option<String>,
}

impl MmapRequest {
    /// Private anonymous mapping anywhere
    pub fn anonymous(length: u64, protection: Protection) -> Self {
        Self {
            addr: 0,
            length,
            protection,
            flags: MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
            backing: VmaBacking::Anonymous,
            name: None,
        }
    }

    /// Sets the address hint
    pub fn at(mut self, addr: VirtAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Adds flags
    pub fn with_flags(mut self, flags: MmapFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets a label
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Backs the mapping with a file
    pub fn file(mut self, path: &str, offset: u64) -> Self {
        self.backing = VmaBacking::File {
            path: path.into(),
            offset,
        };
        self.flags.remove(MmapFlags::ANONYMOUS);
        self.flags |= MmapFlags::FILE;
        self
    }

    /// Backs the mapping with shared object `key`
    pub fn shared(mut self, key: u64) -> Self {
        self.backing = VmaBacking::Shared { key, offset: 0 };
        self.flags.remove(MmapFlags::PRIVATE);
        self.flags |= MmapFlags::SHARED;
        self
    }
}

/// Snapshot of memory usage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryStatistics {
    /// Bytes managed by the buddy allocator
    pub total_bytes: u64,
    /// Bytes on buddy free lists
    pub available_bytes: u64,
    /// Bytes allocated
    pub used_bytes: u64,
    /// Bytes held by slab caches
    pub cached_bytes: u64,
    /// Swap capacity in bytes
    pub swap_total_bytes: u64,
    /// Swap in use in bytes
    pub swap_used_bytes: u64,
    /// Per-zone counters
    pub zones: Vec<(MemoryZone, ZoneStats)>,
    /// TLB counters
    pub tlb: TlbStats,
    /// Buddy counters
    pub buddy: BuddyStats,
    /// Fault counters over all address spaces
    pub faults: FaultCounters,
    /// Page table walks
    pub page_walks: u64,
    /// Pages brought back from swap
    pub swap_ins: u64,
    /// Pages written to swap
    pub swap_outs: u64,
    /// Resident user pages over all address spaces
    pub resident_pages: u64,
    /// Live address spaces
    pub address_spaces: u64,
    /// Slab caches
    pub slab_caches: u64,
}

struct AddressSpace {
    page_table: PageTable,
    vmas: VmaSet,
    brk_start: VirtAddr,
    brk: VirtAddr,
    resident: u64,
    faults: FaultCounters,
}

impl AddressSpace {
    fn new(asid: u32, heap_base: VirtAddr) -> Self {
        Self {
            page_table: PageTable::new(asid),
            vmas: VmaSet::new(),
            brk_start: heap_base,
            brk: heap_base,
            resident: 0,
            faults: FaultCounters::default(),
        }
    }
}

/// Buddy frames plus the sharer count of every user frame
struct Frames {
    buddy: BuddyAllocator,
    refs: HashMap<u64, u32>,
}

impl Frames {
    fn alloc(&mut self) -> Result<u64> {
        let pfn = self.buddy.alloc(0, MemoryZone::Normal)?;
        self.refs.insert(pfn, 1);
        Ok(pfn)
    }

    fn get(&mut self, pfn: u64) {
        if let Some(refs) = self.refs.get_mut(&pfn) {
            *refs += 1;
        }
    }

    fn put(&mut self, pfn: u64) -> Result<()> {
        let Some(refs) = self.refs.get_mut(&pfn) else {
            return Ok(());
        };
        if *refs == 0 {
            mm_warn!("frame {:#x} has a zero reference count", pfn);
            return Err(Error::InvariantViolation(format!(
                "frame {:#x} released with zero references",
                pfn
            )));
        }
        *refs -= 1;
        if *refs == 0 {
            self.refs.remove(&pfn);
            self.buddy.free(pfn)?;
        }
        Ok(())
    }

    fn sharers(&self, pfn: u64) -> u32 {
        self.refs.get(&pfn).copied().unwrap_or(1)
    }
}

struct SwapArea {
    free: BTreeSet<u64>,
    total: u64,
}

impl SwapArea {
    fn new(total: u64) -> Self {
        Self {
            free: (0..total).collect(),
            total,
        }
    }

    fn used(&self) -> u64 {
        self.total - self.free.len() as u64
    }
}

/// The simulated memory subsystem
pub struct MemoryManager {
    config: MemoryConfig,
    frames: Frames,
    slabs: SlabAllocator,
    tlb: Tlb,
    spaces: HashMap<u32, AddressSpace>,
    /// (shared object key, page index) -> frame
    shared: HashMap<(u64, u64), u64>,
    swap: SwapArea,
    faults: FaultCounters,
    swap_ins: u64,
    swap_outs: u64,
    retired_walks: u64,
    now_ns: u64,
}

impl MemoryManager {
    /// Creates a manager with the given configuration
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            frames: Frames {
                buddy: BuddyAllocator::new(config.zone_pages),
                refs: HashMap::new(),
            },
            slabs: SlabAllocator::new(),
            tlb: Tlb::new(config.tlb_capacity),
            spaces: HashMap::new(),
            shared: HashMap::new(),
            swap: SwapArea::new(config.swap_pages),
            faults: FaultCounters::default(),
            swap_ins: 0,
            swap_outs: 0,
            retired_walks: 0,
            now_ns: 0,
            config,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Updates the simulated time stamped on page accesses
    pub fn set_time(&mut self, now_ns: u64) {
        self.now_ns = now_ns;
    }

    // ---- address spaces ----

    /// Creates an empty address space
    pub fn create_address_space(&mut self, asid: u32) -> Result<()> {
        if self.spaces.contains_key(&asid) {
            return Err(Error::AlreadyExists(format!("address space {}", asid)));
        }
        self.spaces
            .insert(asid, AddressSpace::new(asid, self.config.heap_base));
        Ok(())
    }

    /// Whether an address space exists
    pub fn has_address_space(&self, asid: u32) -> bool {
        self.spaces.contains_key(&asid)
    }

    /// Tears down an address space, returning the number of resident pages released
    pub fn destroy_address_space(&mut self, asid: u32) -> Result<u64> {
        let space = self
            .spaces
            .remove(&asid)
            .ok_or_else(|| Error::NotFound(format!("address space {}", asid)))?;
        let released = space.resident;
        for pte in space.page_table.iter() {
            self.release_entry(pte)?;
        }
        self.retired_walks += space.page_table.page_walks();
        self.tlb.flush_asid(asid);
        mm_debug!("destroyed address space {} ({} pages)", asid, released);
        Ok(released)
    }

    /// Duplicates `parent` into a new address space `child` with copy-on-write
    ///
    /// Private pages become read-only and COW in both spaces; shared areas keep
    /// sharing their frames.
    pub fn clone_address_space(&mut self, parent: u32, child: u32) -> Result<()> {
        if self.spaces.contains_key(&child) {
            return Err(Error::AlreadyExists(format!("address space {}", child)));
        }
        let swapped: Vec<VirtAddr> = self
            .space(parent)?
            .page_table
            .iter()
            .filter(|p| p.swap_slot.is_some())
            .map(|p| p.virtual_address)
            .collect();
        for page in swapped {
            self.swap_in_page(parent, page)?;
        }

        let heap_base = self.config.heap_base;
        let space = self.space_mut(parent)?;
        let mut copy = AddressSpace::new(child, heap_base);
        copy.brk_start = space.brk_start;
        copy.brk = space.brk;
        copy.vmas = space.vmas.clone();
        let mut shared_frames = Vec::new();
        for pte in space.page_table.iter_mut() {
            let shared = space
                .vmas
                .find(pte.virtual_address)
                .is_some_and(|v| v.flags.contains(MmapFlags::SHARED));
            if !shared {
                pte.flags.remove(PteFlags::WRITABLE);
                pte.flags.insert(PteFlags::COW);
            }
            shared_frames.push(pte.frame());
            let mut entry = pte.clone();
            entry.flags.remove(PteFlags::ACCESSED);
            copy.page_table.insert(entry);
            copy.resident += 1;
        }
        for pfn in shared_frames {
            self.frames.get(pfn);
        }
        self.tlb.flush_asid(parent);
        self.spaces.insert(child, copy);
        Ok(())
    }

    // ---- page mappings ----

    /// Maps one page at `vaddr` to a freshly allocated frame
    pub fn map_page(&mut self, asid: u32, vaddr: VirtAddr, prot: Protection) -> Result<PhysAddr> {
        self.check_unmapped(asid, vaddr)?;
        let pfn = self.frames.alloc()?;
        let now = self.now_ns;
        let space = self.space_mut(asid)?;
        space
            .page_table
            .insert(PageTableEntry::new(vaddr, pfn_to_addr(pfn), prot, now));
        space.resident += 1;
        Ok(pfn_to_addr(pfn))
    }

    /// Maps one page at `vaddr` to an explicit physical address
    pub fn map_page_to(
        &mut self,
        asid: u32,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        prot: Protection,
    ) -> Result<()> {
        if !is_page_aligned(paddr) {
            return Err(Error::InvalidArgument(format!(
                "physical address {:#x} is not page aligned",
                paddr
            )));
        }
        self.check_unmapped(asid, vaddr)?;
        self.frames.get(addr_to_pfn(paddr));
        let now = self.now_ns;
        let space = self.space_mut(asid)?;
        space
            .page_table
            .insert(PageTableEntry::new(vaddr, paddr, prot, now));
        space.resident += 1;
        Ok(())
    }

    /// Removes the mapping of one page
    pub fn unmap_page(&mut self, asid: u32, vaddr: VirtAddr) -> Result<()> {
        let page = page_round_down(vaddr);
        let entry = self
            .space_mut(asid)?
            .page_table
            .remove(page)
            .ok_or_else(|| Error::NotFound(format!("{:#x} is not mapped", vaddr)))?;
        if entry.is_present() {
            self.space_mut(asid)?.resident -= 1;
        }
        self.release_entry(&entry)?;
        self.tlb.flush_page(addr_to_pfn(page), Some(asid));
        Ok(())
    }

    /// Translates `vaddr`, consulting the TLB before walking the page table
    pub fn translate(&mut self, asid: u32, vaddr: VirtAddr) -> Result<PhysAddr> {
        let page = page_round_down(vaddr);
        let offset = vaddr - page;
        let vpn = addr_to_pfn(page);
        let now = self.now_ns;
        let space = self
            .spaces
            .get_mut(&asid)
            .ok_or_else(|| Error::NotFound(format!("address space {}", asid)))?;

        if let Some(hit) = self.tlb.lookup(vpn, asid) {
            if let Some(pte) = space.page_table.entry_mut(page) {
                pte.flags.insert(PteFlags::ACCESSED);
                pte.last_access_ns = now;
            }
            return Ok(pfn_to_addr(hit.physical_frame) + offset);
        }

        match space.page_table.walk_mut(page) {
            Some(pte) if pte.is_present() => {
                pte.flags.insert(PteFlags::ACCESSED);
                pte.last_access_ns = now;
                let frame = pte.frame();
                let flags = pte.flags;
                self.tlb.insert(vpn, frame, asid, flags);
                Ok(pfn_to_addr(frame) + offset)
            }
            _ => Err(Error::NotFound(format!(
                "no translation for {:#x} in address space {}",
                vaddr, asid
            ))),
        }
    }

    /// Copy of the page table entry covering `vaddr`
    pub fn page_entry(&self, asid: u32, vaddr: VirtAddr) -> Option<PageTableEntry> {
        let space = self.spaces.get(&asid)?;
        let mut entry = space.page_table.walk(page_round_down(vaddr))?.clone();
        if entry.is_present() {
            entry.ref_count = self.frames.sharers(entry.frame());
        }
        Some(entry)
    }

    // ---- faults ----

    /// Resolves a page fault raised at `vaddr` for `reason`
    pub fn handle_page_fault(
        &mut self,
        asid: u32,
        vaddr: VirtAddr,
        reason: FaultReason,
    ) -> Result<FaultOutcome> {
        let outcome = self.resolve_fault(asid, page_round_down(vaddr), reason)?;
        self.faults.record(outcome);
        let space = self.space_mut(asid)?;
        space.faults.record(outcome);
        if outcome.is_fatal() {
            mm_debug!("fatal {:?} fault at {:#x} in {}", reason, vaddr, asid);
        } else {
            mm_trace!("{:?} fault at {:#x} in {} -> {:?}", reason, vaddr, asid, outcome);
        }
        Ok(outcome)
    }

    /// Simulated load, store or fetch; faults are raised and handled on the way
    pub fn access(&mut self, asid: u32, vaddr: VirtAddr, kind: AccessKind) -> Result<AccessResult> {
        let page = page_round_down(vaddr);
        let mut last_fault = None;
        // one fault to fault in, one to break COW, one spare
        for _ in 0..3 {
            let entry = self.space(asid)?.page_table.walk(page).cloned();
            let reason = match entry {
                None => match kind {
                    AccessKind::Read => FaultReason::NotPresent,
                    AccessKind::Write => FaultReason::WriteAccess,
                    AccessKind::Execute => FaultReason::InstructionFetch,
                },
                Some(e) if !e.is_present() => {
                    if e.swap_slot.is_some() {
                        FaultReason::SwapIn
                    } else {
                        FaultReason::NotPresent
                    }
                }
                Some(e) => match Self::check_access(&e, kind) {
                    Some(reason) => reason,
                    None => {
                        let physical = self.translate(asid, vaddr)?;
                        if kind == AccessKind::Write {
                            if let Some(pte) = self.space_mut(asid)?.page_table.entry_mut(page) {
                                pte.flags.insert(PteFlags::DIRTY);
                            }
                        }
                        return Ok(AccessResult {
                            physical: Some(physical),
                            fault: last_fault,
                        });
                    }
                },
            };
            let outcome = self.handle_page_fault(asid, vaddr, reason)?;
            last_fault = Some((reason, outcome));
            if outcome.is_fatal() {
                return Ok(AccessResult {
                    physical: None,
                    fault: last_fault,
                });
            }
        }
        Err(Error::InvariantViolation(format!(
            "access to {:#x} did not converge",
            vaddr
        )))
    }

    fn check_access(entry: &PageTableEntry, kind: AccessKind) -> Option<FaultReason> {
        let usable = Protection::READ | Protection::WRITE | Protection::EXEC;
        if entry.protection.contains(Protection::GUARD) || !entry.protection.intersects(usable) {
            return Some(FaultReason::Protection);
        }
        match kind {
            AccessKind::Write if !entry.flags.contains(PteFlags::WRITABLE) => {
                if entry.flags.contains(PteFlags::COW) {
                    Some(FaultReason::CopyOnWrite)
                } else {
                    Some(FaultReason::Protection)
                }
            }
            AccessKind::Execute if entry.flags.contains(PteFlags::NO_EXECUTE) => {
                Some(FaultReason::Protection)
            }
            _ => None,
        }
    }

    fn resolve_fault(&mut self, asid: u32, page: VirtAddr, reason: FaultReason) -> Result<FaultOutcome> {
        const SEGV: FaultOutcome = FaultOutcome::Fatal { signal: SIGSEGV };
        if reason == FaultReason::Reserved {
            return Ok(FaultOutcome::Fatal { signal: SIGBUS });
        }
        let covering = self.space(asid)?.vmas.find(page).cloned();
        let vma = match covering {
            Some(vma) => vma,
            None => match self.grow_stack(asid, page)? {
                Some(vma) => vma,
                None => return Ok(SEGV),
            },
        };
        let usable = Protection::READ | Protection::WRITE | Protection::EXEC;
        if reason == FaultReason::Protection
            || vma.protection.contains(Protection::GUARD)
            || !vma.protection.intersects(usable)
        {
            return Ok(SEGV);
        }
        let access = reason.access();
        if access == AccessKind::Write && !vma.protection.contains(Protection::WRITE) {
            return Ok(SEGV);
        }
        if access == AccessKind::Execute && !vma.protection.contains(Protection::EXEC) {
            return Ok(SEGV);
        }

        let entry = self.space(asid)?.page_table.walk(page).cloned();
        match entry {
            Some(e) if e.is_present() => {
                if access == AccessKind::Write && e.flags.contains(PteFlags::COW) {
                    self.break_cow(asid, page)
                } else {
                    Ok(FaultOutcome::Spurious)
                }
            }
            Some(e) if e.swap_slot.is_some() => self.swap_in_page(asid, page),
            _ => {
                let outcome = self.populate(asid, page, &vma)?;
                if access == AccessKind::Write {
                    if let Some(pte) = self.space_mut(asid)?.page_table.entry_mut(page) {
                        pte.flags.insert(PteFlags::DIRTY);
                    }
                }
                Ok(outcome)
            }
        }
    }

    /// Extends a grows-down area down to `page` if it sits within the guard gap
    fn grow_stack(&mut self, asid: u32, page: VirtAddr) -> Result<Option<Vma>> {
        let space = self.space_mut(asid)?;
        let Some(above) = space.vmas.next_above(page).cloned() else {
            return Ok(None);
        };
        if !above.flags.contains(MmapFlags::GROWS_DOWN)
            || above.start - page > STACK_GUARD_PAGES * PAGE_SIZE
            || space.vmas.overlaps(page, above.start)
        {
            return Ok(None);
        }
        let mut grown = above.clone();
        grown.start = page;
        space.vmas.replace(above.start, grown.clone())?;
        mm_debug!("stack of {} grew to {:#x}", asid, page);
        Ok(Some(grown))
    }

    /// Faults in one page of `vma`
    fn populate(&mut self, asid: u32, page: VirtAddr, vma: &Vma) -> Result<FaultOutcome> {
        let (pfn, outcome) = match &vma.backing {
            VmaBacking::Shared { key, offset } => {
                let index = (page - vma.start + offset) / PAGE_SIZE;
                match self.shared.get(&(*key, index)) {
                    Some(pfn) => {
                        let pfn = *pfn;
                        self.frames.get(pfn);
                        (pfn, FaultOutcome::Minor)
                    }
                    None => {
                        let pfn = self.frames.alloc()?;
                        // the object itself keeps one reference
                        self.frames.get(pfn);
                        self.shared.insert((*key, index), pfn);
                        (pfn, FaultOutcome::Minor)
                    }
                }
            }
            VmaBacking::File { .. } => (self.frames.alloc()?, FaultOutcome::Major),
            VmaBacking::Anonymous => (self.frames.alloc()?, FaultOutcome::Minor),
        };
        let now = self.now_ns;
        let mut entry = PageTableEntry::new(page, pfn_to_addr(pfn), vma.protection, now);
        entry.flags.insert(PteFlags::ACCESSED);
        if vma.flags.contains(MmapFlags::LOCKED) {
            entry.state = PageState::Locked;
        }
        let space = self.space_mut(asid)?;
        space.page_table.insert(entry);
        space.resident += 1;
        Ok(outcome)
    }

    fn break_cow(&mut self, asid: u32, page: VirtAddr) -> Result<FaultOutcome> {
        let old = self
            .space(asid)?
            .page_table
            .walk(page)
            .map(|e| e.frame())
            .ok_or_else(|| Error::InvariantViolation(format!("COW page {:#x} vanished", page)))?;
        let frame = if self.frames.sharers(old) > 1 {
            let fresh = self.frames.alloc()?;
            self.frames.put(old)?;
            fresh
        } else {
            old
        };
        self.tlb.flush_page(addr_to_pfn(page), Some(asid));
        self.faults.cow += 1;
        let space = self.space_mut(asid)?;
        if let Some(pte) = space.page_table.entry_mut(page) {
            pte.physical_address = pfn_to_addr(frame);
            pte.flags.remove(PteFlags::COW);
            pte.flags.insert(PteFlags::WRITABLE | PteFlags::DIRTY | PteFlags::ACCESSED);
            pte.state = PageState::Mapped;
            pte.ref_count = 1;
        }
        space.faults.cow += 1;
        Ok(FaultOutcome::Minor)
    }

    // ---- swap ----

    /// Writes one resident page to swap and frees its frame
    pub fn swap_out(&mut self, asid: u32, vaddr: VirtAddr) -> Result<()> {
        let page = page_round_down(vaddr);
        let entry = self
            .space(asid)?
            .page_table
            .walk(page)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{:#x} is not mapped", vaddr)))?;
        if !entry.is_present() {
            return Err(Error::InvalidArgument(format!("{:#x} is not resident", vaddr)));
        }
        if entry.state == PageState::Locked {
            return Err(Error::Busy(format!("{:#x} is locked in memory", vaddr)));
        }
        if self.frames.sharers(entry.frame()) > 1 {
            return Err(Error::Busy(format!("{:#x} shares its frame", vaddr)));
        }
        let slot = self
            .swap
            .free
            .pop_first()
            .ok_or_else(|| Error::ResourceExhausted("swap space full".into()))?;
        self.frames.put(entry.frame())?;
        let space = self.space_mut(asid)?;
        if let Some(pte) = space.page_table.entry_mut(page) {
            pte.flags.remove(PteFlags::PRESENT | PteFlags::ACCESSED | PteFlags::DIRTY);
            pte.state = PageState::Swapped;
            pte.swap_slot = Some(slot);
        }
        space.resident -= 1;
        self.tlb.flush_page(addr_to_pfn(page), Some(asid));
        self.swap_outs += 1;
        Ok(())
    }

    fn swap_in_page(&mut self, asid: u32, page: VirtAddr) -> Result<FaultOutcome> {
        let pfn = self.frames.alloc()?;
        let now = self.now_ns;
        let space = self.space_mut(asid)?;
        let Some(pte) = space.page_table.entry_mut(page) else {
            return Err(Error::InvariantViolation(format!("swapped page {:#x} vanished", page)));
        };
        let slot = pte.swap_slot.take();
        let cow = pte.flags.contains(PteFlags::COW);
        pte.physical_address = pfn_to_addr(pfn);
        pte.flags = PteFlags::from_protection(pte.protection) | PteFlags::ACCESSED;
        if cow {
            pte.flags.remove(PteFlags::WRITABLE);
            pte.flags.insert(PteFlags::COW);
        }
        pte.state = PageState::Mapped;
        pte.last_access_ns = now;
        space.resident += 1;
        if let Some(slot) = slot {
            self.swap.free.insert(slot);
        }
        self.swap_ins += 1;
        Ok(FaultOutcome::Major)
    }

    // ---- mmap family ----

    /// Creates a mapping and returns it
    pub fn mmap(&mut self, asid: u32, req: MmapRequest) -> Result<Vma> {
        if req.length == 0 {
            return Err(Error::InvalidArgument("mmap length is zero".into()));
        }
        let len = page_round_up(req.length);
        if len < req.length {
            return Err(Error::InvalidArgument("mmap length overflows".into()));
        }
        let file_backed = matches!(req.backing, VmaBacking::File { .. });
        if file_backed && req.flags.contains(MmapFlags::ANONYMOUS) {
            return Err(Error::InvalidArgument("anonymous mapping with a file".into()));
        }
        if req.flags.contains(MmapFlags::FILE) && !file_backed {
            return Err(Error::InvalidArgument("file mapping without a file".into()));
        }
        let limit = if req.flags.contains(MmapFlags::STACK) {
            self.config.stack_top
        } else {
            self.config.mmap_base
        };
        let stack_top = self.config.stack_top;

        let start = if req.flags.contains(MmapFlags::FIXED) {
            if !is_page_aligned(req.addr) || req.addr < MIN_MAP_ADDR {
                return Err(Error::InvalidArgument(format!(
                    "fixed address {:#x} is not usable",
                    req.addr
                )));
            }
            let end = req
                .addr
                .checked_add(len)
                .filter(|e| *e <= stack_top)
                .ok_or_else(|| Error::InvalidArgument("fixed range overflows".into()))?;
            self.unmap_range(asid, req.addr, end)?;
            req.addr
        } else {
            let space = self.space(asid)?;
            let hint = page_round_down(req.addr);
            let hint_ok = hint >= MIN_MAP_ADDR
                && hint.checked_add(len).is_some_and(|e| e <= stack_top)
                && !space.vmas.overlaps(hint, hint + len);
            if hint_ok {
                hint
            } else {
                space.vmas.find_free(len, limit).ok_or_else(|| {
                    Error::ResourceExhausted(format!("no free range of {} bytes", len))
                })?
            }
        };

        let mut protection = req.protection | Protection::USER;
        if req.flags.contains(MmapFlags::SHARED) {
            protection |= Protection::SHARED;
        } else {
            protection |= Protection::PRIVATE;
        }
        let name = req.name.unwrap_or_else(|| match &req.backing {
            VmaBacking::File { path, .. } => path.clone(),
            VmaBacking::Shared { key, .. } => format!("[shm:{}]", key),
            VmaBacking::Anonymous if req.flags.contains(MmapFlags::STACK) => "[stack]".into(),
            VmaBacking::Anonymous => "[anon]".into(),
        });
        let vma = Vma {
            start,
            end: start + len,
            protection,
            flags: req.flags,
            backing: req.backing,
            name,
        };
        self.space_mut(asid)?.vmas.insert(vma.clone())?;

        if vma.flags.intersects(MmapFlags::POPULATE | MmapFlags::LOCKED) {
            let mut page = vma.start;
            while page < vma.end {
                self.populate(asid, page, &vma)?;
                page += PAGE_SIZE;
            }
        }
        mm_debug!("mmap {} [{:#x}, {:#x}) {:?}", asid, vma.start, vma.end, vma.protection);
        Ok(vma)
    }

    /// Removes mappings over `[addr, addr + length)`, returning the pages released
    pub fn munmap(&mut self, asid: u32, addr: VirtAddr, length: u64) -> Result<u64> {
        let end = self.checked_range(addr, length)?;
        if !self.space(asid)?.vmas.overlaps(addr, end) {
            return Err(Error::NotFound(format!(
                "nothing mapped in [{:#x}, {:#x})",
                addr, end
            )));
        }
        self.unmap_range(asid, addr, end)
    }

    /// Changes protection over `[addr, addr + length)`
    pub fn mprotect(&mut self, asid: u32, addr: VirtAddr, length: u64, prot: Protection) -> Result<()> {
        let end = self.checked_range(addr, length)?;
        let space = self
            .spaces
            .get_mut(&asid)
            .ok_or_else(|| Error::NotFound(format!("address space {}", asid)))?;
        space.vmas.protect_range(addr, end, prot | Protection::USER)?;
        for page in space.page_table.pages_in(addr, end) {
            let effective = space
                .vmas
                .find(page)
                .map(|v| v.protection)
                .unwrap_or(prot);
            if let Some(pte) = space.page_table.entry_mut(page) {
                let cow = pte.flags.contains(PteFlags::COW);
                let keep = pte.flags & (PteFlags::PRESENT | PteFlags::ACCESSED | PteFlags::DIRTY | PteFlags::COW);
                pte.flags = (PteFlags::from_protection(effective) - PteFlags::PRESENT) | keep;
                if cow {
                    pte.flags.remove(PteFlags::WRITABLE);
                }
                pte.protection = effective;
            }
            self.tlb.flush_page(addr_to_pfn(page), Some(asid));
        }
        Ok(())
    }

    /// Moves the program break; `new_end == 0` queries it
    pub fn brk(&mut self, asid: u32, new_end: VirtAddr) -> Result<VirtAddr> {
        let space = self.space(asid)?;
        let (start, current) = (space.brk_start, space.brk);
        if new_end == 0 {
            return Ok(current);
        }
        if new_end < start {
            return Err(Error::InvalidArgument(format!(
                "break {:#x} below heap start {:#x}",
                new_end, start
            )));
        }
        let old_top = page_round_up(current);
        let new_top = page_round_up(new_end);
        if new_top > old_top {
            let space = self.space_mut(asid)?;
            if space.vmas.overlaps(old_top, new_top) {
                return Err(Error::ResourceExhausted(format!(
                    "heap growth to {:#x} collides with a mapping",
                    new_end
                )));
            }
            let tail = space
                .vmas
                .find(old_top.wrapping_sub(1))
                .filter(|v| old_top > start && v.name == "[heap]")
                .cloned();
            match tail {
                Some(mut heap) => {
                    let old_start = heap.start;
                    heap.end = new_top;
                    space.vmas.replace(old_start, heap)?;
                }
                None => space.vmas.insert(Vma {
                    start: old_top,
                    end: new_top,
                    protection: Protection::READ
                        | Protection::WRITE
                        | Protection::PRIVATE
                        | Protection::USER,
                    flags: MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                    backing: VmaBacking::Anonymous,
                    name: "[heap]".into(),
                })?,
            }
        } else if new_top < old_top {
            self.unmap_range(asid, new_top, old_top)?;
        }
        self.space_mut(asid)?.brk = new_end;
        Ok(new_end)
    }

    fn checked_range(&self, addr: VirtAddr, length: u64) -> Result<VirtAddr> {
        if !is_page_aligned(addr) {
            return Err(Error::InvalidArgument(format!("{:#x} is not page aligned", addr)));
        }
        if length == 0 {
            return Err(Error::InvalidArgument("length is zero".into()));
        }
        addr.checked_add(page_round_up(length))
            .ok_or_else(|| Error::InvalidArgument("range overflows".into()))
    }

    fn unmap_range(&mut self, asid: u32, start: VirtAddr, end: VirtAddr) -> Result<u64> {
        let space = self.space_mut(asid)?;
        space.vmas.remove_range(start, end);
        let mut removed = Vec::new();
        for page in space.page_table.pages_in(start, end) {
            if let Some(entry) = space.page_table.remove(page) {
                if entry.is_present() {
                    space.resident -= 1;
                }
                removed.push(entry);
            }
        }
        for entry in &removed {
            self.release_entry(entry)?;
            self.tlb
                .flush_page(addr_to_pfn(entry.virtual_address), Some(asid));
        }
        Ok(removed.len() as u64)
    }

    fn release_entry(&mut self, entry: &PageTableEntry) -> Result<()> {
        if entry.is_present() {
            self.frames.put(entry.frame())
        } else {
            if let Some(slot) = entry.swap_slot {
                self.swap.free.insert(slot);
            }
            Ok(())
        }
    }

    /// Drops the frames held by shared object `key`
    pub fn release_shared(&mut self, key: u64) -> Result<()> {
        let frames: Vec<(u64, u64)> = self
            .shared
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|(k, pfn)| (k.1, *pfn))
            .collect();
        for (index, pfn) in frames {
            self.shared.remove(&(key, index));
            self.frames.put(pfn)?;
        }
        Ok(())
    }

    /// Areas of an address space in address order
    pub fn vmas(&self, asid: u32) -> Result<Vec<Vma>> {
        Ok(self.space(asid)?.vmas.iter().cloned().collect())
    }

    /// Area covering `addr`
    pub fn find_vma(&self, asid: u32, addr: VirtAddr) -> Result<Option<Vma>> {
        Ok(self.space(asid)?.vmas.find(addr).cloned())
    }

    /// Resident pages of an address space
    pub fn resident_pages(&self, asid: u32) -> u64 {
        self.spaces.get(&asid).map(|s| s.resident).unwrap_or(0)
    }

    /// Fault counters of an address space
    pub fn fault_counters(&self, asid: u32) -> Result<FaultCounters> {
        Ok(self.space(asid)?.faults)
    }

    /// Current program break
    pub fn current_brk(&self, asid: u32) -> Result<VirtAddr> {
        Ok(self.space(asid)?.brk)
    }

    // ---- TLB ----

    /// Drops every TLB entry
    pub fn flush_tlb(&mut self) {
        self.tlb.flush_all();
    }

    /// Drops the TLB entries for the page containing `vaddr` in every address space
    pub fn flush_tlb_entry(&mut self, vaddr: VirtAddr) {
        self.tlb.flush_page(addr_to_pfn(vaddr), None);
    }

    /// Drops the TLB entries of one address space
    pub fn flush_tlb_asid(&mut self, asid: u32) {
        self.tlb.flush_asid(asid);
    }

    /// TLB counters
    pub fn tlb_stats(&self) -> TlbStats {
        self.tlb.stats()
    }

    // ---- allocators ----

    /// Allocates one kernel page from the Normal zone
    pub fn allocate_page(&mut self) -> Result<PhysAddr> {
        Ok(pfn_to_addr(self.frames.buddy.alloc(0, MemoryZone::Normal)?))
    }

    /// Frees a page from [`MemoryManager::allocate_page`]
    pub fn free_page(&mut self, paddr: PhysAddr) -> Result<()> {
        self.buddy_free(addr_to_pfn(paddr))
    }

    /// Allocates `2^order` contiguous pages in `zone` (with fallback)
    pub fn buddy_alloc(&mut self, order: usize, zone: MemoryZone) -> Result<u64> {
        self.frames.buddy.alloc(order, zone)
    }

    /// Frees a block from [`MemoryManager::buddy_alloc`]
    pub fn buddy_free(&mut self, pfn: u64) -> Result<()> {
        if self.frames.refs.contains_key(&pfn) {
            return Err(Error::Busy(format!("frame {:#x} is mapped by a process", pfn)));
        }
        if self.slabs.owns_slab(pfn) {
            return Err(Error::Busy(format!("frame {:#x} belongs to a slab", pfn)));
        }
        self.frames.buddy.free(pfn)
    }

    /// Counters for one zone
    pub fn zone_stats(&self, zone: MemoryZone) -> ZoneStats {
        self.frames.buddy.zone_stats(zone)
    }

    /// Creates a slab cache
    pub fn slab_create(&mut self, name: &str, size: u64, align: u64) -> Result<u32> {
        self.slabs.create_cache(name, size, align)
    }

    /// Destroys an empty slab cache
    pub fn slab_destroy(&mut self, id: u32) -> Result<()> {
        self.slabs.destroy_cache(id, &mut self.frames.buddy)
    }

    /// Allocates an object from a slab cache
    pub fn slab_alloc(&mut self, id: u32) -> Result<u64> {
        self.slabs.alloc(id, &mut self.frames.buddy)
    }

    /// Returns an object to its slab cache
    pub fn slab_free(&mut self, id: u32, addr: u64) -> Result<()> {
        self.slabs.free(id, addr)
    }

    /// Releases a cache's empty slabs, returning the pages freed
    pub fn slab_shrink(&mut self, id: u32) -> Result<u64> {
        self.slabs.shrink(id, &mut self.frames.buddy)
    }

    /// Counters for one slab cache
    pub fn slab_stats(&self, id: u32) -> Result<SlabCacheStats> {
        self.slabs.stats(id)
    }

    /// Looks a slab cache up by name
    pub fn slab_find(&self, name: &str) -> Option<u32> {
        self.slabs.find(name)
    }

    // ---- statistics ----

    /// Usage snapshot
    pub fn statistics(&self) -> MemoryStatistics {
        let buddy = &self.frames.buddy;
        let total = buddy.total_pages() * PAGE_SIZE;
        let free = buddy.free_pages() * PAGE_SIZE;
        MemoryStatistics {
            total_bytes: total,
            available_bytes: free,
            used_bytes: total - free,
            cached_bytes: self.slabs.pages_held() * PAGE_SIZE,
            swap_total_bytes: self.swap.total * PAGE_SIZE,
            swap_used_bytes: self.swap.used() * PAGE_SIZE,
            zones: MemoryZone::ALL
                .iter()
                .map(|z| (*z, buddy.zone_stats(*z)))
                .collect(),
            tlb: self.tlb.stats(),
            buddy: buddy.stats(),
            faults: self.faults,
            page_walks: self.page_walks(),
            swap_ins: self.swap_ins,
            swap_outs: self.swap_outs,
            resident_pages: self.spaces.values().map(|s| s.resident).sum(),
            address_spaces: self.spaces.len() as u64,
            slab_caches: self.slabs.cache_ids().len() as u64,
        }
    }

    /// Page table walks over all address spaces, live and destroyed
    pub fn page_walks(&self) -> u64 {
        self.retired_walks
            + self
                .spaces
                .values()
                .map(|s| s.page_table.page_walks())
                .sum::<u64>()
    }

    fn space(&self, asid: u32) -> Result<&AddressSpace> {
        self.spaces
            .get(&asid)
            .ok_or_else(|| Error::NotFound(format!("address space {}", asid)))
    }

    fn space_mut(&mut self, asid: u32) -> Result<&mut AddressSpace> {
        self.spaces
            .get_mut(&asid)
            .ok_or_else(|| Error::NotFound(format!("address space {}", asid)))
    }

    fn check_unmapped(&self, asid: u32, vaddr: VirtAddr) -> Result<()> {
        if !is_page_aligned(vaddr) {
            return Err(Error::InvalidArgument(format!("{:#x} is not page aligned", vaddr)));
        }
        if self.space(asid)?.page_table.walk(vaddr).is_some() {
            return Err(Error::AlreadyExists(format!("{:#x} is already mapped", vaddr)));
        }
        Ok(())
    }
}
