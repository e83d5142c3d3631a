//! Integration tests for the memory manager

use akern_memory_management::*;
use proptest::prelude::*;

fn rw() -> Protection {
    Protection::READ | Protection::WRITE
}

fn small_manager() -> MemoryManager {
    MemoryManager::new(MemoryConfig {
        zone_pages: [16, 16, 128, 0, 0, 0],
        swap_pages: 8,
        tlb_capacity: 8,
        ..MemoryConfig::default()
    })
}

#[test]
fn test_mmap_munmap_translate() {
    let mut mm = small_manager();
    mm.create_address_space(100).unwrap();
    let vma = mm.mmap(100, MmapRequest::anonymous(4096, rw())).unwrap();
    assert_eq!(vma.len(), PAGE_SIZE);
    let other = mm.mmap(100, MmapRequest::anonymous(8192, rw())).unwrap();
    assert!(!vma.overlaps(other.start, other.end));

    mm.access(100, vma.start, AccessKind::Write).unwrap();
    assert!(mm.translate(100, vma.start).is_ok());

    mm.munmap(100, vma.start, 4096).unwrap();
    assert!(matches!(mm.translate(100, vma.start), Err(Error::NotFound(_))));
    assert!(matches!(mm.munmap(100, vma.start, 4096), Err(Error::NotFound(_))));
}

#[test]
fn test_zero_length_mmap_rejected() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    assert!(matches!(
        mm.mmap(1, MmapRequest::anonymous(0, rw())),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_fixed_mapping_replaces_overlap() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    let first = mm
        .mmap(1, MmapRequest::anonymous(4 * PAGE_SIZE, rw()).at(0x2000_0000))
        .unwrap();
    assert_eq!(first.start, 0x2000_0000);
    let fixed = MmapRequest::anonymous(PAGE_SIZE, Protection::READ)
        .at(0x2000_1000)
        .with_flags(MmapFlags::FIXED);
    mm.mmap(1, fixed).unwrap();
    let areas = mm.vmas(1).unwrap();
    assert_eq!(areas.len(), 3);
    for pair in areas.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }
    let misaligned = MmapRequest::anonymous(PAGE_SIZE, rw())
        .at(0x2000_0010)
        .with_flags(MmapFlags::FIXED);
    assert!(mm.mmap(1, misaligned).is_err());
}

#[test]
fn test_fork_copy_on_write() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    let vma = mm.mmap(1, MmapRequest::anonymous(PAGE_SIZE, rw())).unwrap();
    mm.access(1, vma.start, AccessKind::Write).unwrap();
    let parent_frame = mm.translate(1, vma.start).unwrap();

    mm.clone_address_space(1, 2).unwrap();
    assert_eq!(mm.translate(2, vma.start).unwrap(), parent_frame);
    let shared = mm.page_entry(2, vma.start).unwrap();
    assert!(shared.flags.contains(PteFlags::COW));
    assert!(!shared.flags.contains(PteFlags::WRITABLE));
    assert_eq!(shared.ref_count, 2);

    let result = mm.access(2, vma.start, AccessKind::Write).unwrap();
    assert_eq!(
        result.fault,
        Some((FaultReason::CopyOnWrite, FaultOutcome::Minor))
    );
    let child_frame = mm.translate(2, vma.start).unwrap();
    assert_ne!(child_frame, parent_frame);
    assert_eq!(mm.page_entry(1, vma.start).unwrap().ref_count, 1);

    // the parent is now the only sharer and reuses its frame
    mm.access(1, vma.start, AccessKind::Write).unwrap();
    assert_eq!(mm.translate(1, vma.start).unwrap(), parent_frame);
    assert_eq!(mm.statistics().faults.cow, 2);
}

#[test]
fn test_swap_out_and_in() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    let vma = mm.mmap(1, MmapRequest::anonymous(PAGE_SIZE, rw())).unwrap();
    mm.access(1, vma.start, AccessKind::Write).unwrap();
    mm.swap_out(1, vma.start).unwrap();
    assert_eq!(mm.page_entry(1, vma.start).unwrap().state, PageState::Swapped);
    assert!(mm.translate(1, vma.start).is_err());
    assert_eq!(mm.statistics().swap_used_bytes, PAGE_SIZE);

    let result = mm.access(1, vma.start, AccessKind::Read).unwrap();
    assert_eq!(result.fault, Some((FaultReason::SwapIn, FaultOutcome::Major)));
    assert_eq!(mm.statistics().swap_used_bytes, 0);
}

#[test]
fn test_locked_pages_refuse_swap() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    let req = MmapRequest::anonymous(2 * PAGE_SIZE, rw()).with_flags(MmapFlags::LOCKED);
    let vma = mm.mmap(1, req).unwrap();
    assert_eq!(mm.resident_pages(1), 2);
    assert!(matches!(mm.swap_out(1, vma.start), Err(Error::Busy(_))));
}

#[test]
fn test_shared_mapping_shares_frames() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    mm.create_address_space(2).unwrap();
    let a = mm
        .mmap(1, MmapRequest::anonymous(PAGE_SIZE, rw()).shared(77))
        .unwrap();
    let b = mm
        .mmap(2, MmapRequest::anonymous(PAGE_SIZE, rw()).shared(77))
        .unwrap();
    mm.access(1, a.start, AccessKind::Write).unwrap();
    mm.access(2, b.start, AccessKind::Read).unwrap();
    assert_eq!(
        mm.translate(1, a.start).unwrap(),
        mm.translate(2, b.start).unwrap()
    );
    let before = mm.statistics().available_bytes;
    mm.destroy_address_space(1).unwrap();
    mm.destroy_address_space(2).unwrap();
    mm.release_shared(77).unwrap();
    assert_eq!(mm.statistics().available_bytes, before + PAGE_SIZE);
}

#[test]
fn test_mprotect_revokes_write() {
    let mut mm = small_manager();
    mm.create_address_space(1).unwrap();
    let vma = mm.mmap(1, MmapRequest::anonymous(2 * PAGE_SIZE, rw())).unwrap();
    mm.access(1, vma.start, AccessKind::Write).unwrap();
    mm.mprotect(1, vma.start, PAGE_SIZE, Protection::READ).unwrap();
    let result = mm.access(1, vma.start, AccessKind::Write).unwrap();
    assert!(result.fault.unwrap().1.is_fatal());
    assert_eq!(mm.vmas(1).unwrap().len(), 2);
    assert!(mm.access(1, vma.start + PAGE_SIZE, AccessKind::Write).unwrap().physical.is_some());
}

#[test]
fn test_slab_through_manager() {
    let mut mm = small_manager();
    let cache = mm.slab_create("files", 192, 64).unwrap();
    let obj = mm.slab_alloc(cache).unwrap();
    assert_eq!(obj % 64, 0);
    let page = addr_to_pfn(obj);
    assert!(matches!(mm.buddy_free(page), Err(Error::Busy(_))));
    mm.slab_free(cache, obj).unwrap();
    assert_eq!(mm.slab_shrink(cache).unwrap(), 1);
    mm.slab_destroy(cache).unwrap();
    assert_eq!(mm.slab_find("files"), None);
}

#[test]
fn test_destroy_releases_frames() {
    let mut mm = small_manager();
    let before = mm.statistics().available_bytes;
    mm.create_address_space(1).unwrap();
    let req = MmapRequest::anonymous(4 * PAGE_SIZE, rw()).with_flags(MmapFlags::POPULATE);
    mm.mmap(1, req).unwrap();
    assert_eq!(mm.statistics().available_bytes, before - 4 * PAGE_SIZE);
    assert_eq!(mm.destroy_address_space(1).unwrap(), 4);
    assert_eq!(mm.statistics().available_bytes, before);
}

proptest! {
    #[test]
    fn prop_buddy_conserves_pages(orders in proptest::collection::vec(0usize..4, 1..24)) {
        let mut buddy = BuddyAllocator::new([0, 0, 256, 0, 0, 0]);
        let mut blocks = Vec::new();
        for order in orders {
            if let Ok(pfn) = buddy.alloc(order, MemoryZone::Normal) {
                blocks.push(pfn);
            }
        }
        for pfn in blocks {
            buddy.free(pfn).unwrap();
        }
        let stats = buddy.zone_stats(MemoryZone::Normal);
        prop_assert_eq!(stats.free_pages, 256);
        prop_assert_eq!(stats.free_blocks[8], 1);
    }

    #[test]
    fn prop_mmaps_never_overlap(lens in proptest::collection::vec(1u64..5 * 4096, 1..16)) {
        let mut mm = small_manager();
        mm.create_address_space(1).unwrap();
        for len in lens {
            mm.mmap(1, MmapRequest::anonymous(len, Protection::READ)).unwrap();
        }
        let areas = mm.vmas(1).unwrap();
        for pair in areas.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
    }
}
