//! Page geometry helpers

use static_assertions::const_assert;

/// Simulated virtual address
pub type VirtAddr = u64;
/// Simulated physical address
pub type PhysAddr = u64;

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1u64 << PAGE_SHIFT == PAGE_SIZE);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary, saturating at the last page
#[inline]
pub const fn page_round_up(addr: u64) -> u64 {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => page_round_down(addr),
    }
}

/// Address to page number
#[inline]
pub const fn addr_to_pfn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Page number to address
#[inline]
pub const fn pfn_to_addr(pfn: u64) -> u64 {
    pfn << PAGE_SHIFT
}

/// Whether `addr` sits on a page boundary
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_down(PAGE_SIZE + 5), PAGE_SIZE);
        assert_eq!(addr_to_pfn(pfn_to_addr(42)), 42);
        assert!(is_page_aligned(0x7000));
    }
}
