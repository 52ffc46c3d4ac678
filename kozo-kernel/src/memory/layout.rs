//! Kernel virtual-address layout
//!
//! The fixed map agreed between the bootloader and the kernel:
//!
//! ```text
//! 0x0000_0000_0000_0000 .. 0x0000_8000_0000_0000   user space
//! 0xFFFF_8000_0000_0000 ..                          direct physical map
//! 0xFF00_0000_0000_0000 (slot 510)                  recursive paging window
//! 0xFFFF_FFFF_8000_0000 ..                          kernel image
//! ```
//!
//! The direct physical map is set up by the bootloader before handover and
//! covers all of physical memory; the kernel uses it to touch frames,
//! CNode storage, and the firmware structures. The recursive window is
//! owned by [`paging`](super::paging).

use kozo_common::{PhysAddr, VirtAddr};

/// Base of the direct physical map: physical address `p` is visible at
/// `PHYS_MAP_BASE + p`.
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel image mapping.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Exclusive top of user space (lowest non-canonical address).
pub const USER_SPACE_TOP: u64 = 0x0000_8000_0000_0000;

/// Root-table slot holding the self-referential entry.
pub const RECURSIVE_INDEX: usize = 510;

/// Translate a physical address through the direct map.
#[inline]
#[must_use]
pub const fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYS_MAP_BASE + phys.as_u64())
}

/// Check that an address lies in user space.
#[inline]
#[must_use]
pub const fn is_user_addr(virt: VirtAddr) -> bool {
    virt.as_u64() < USER_SPACE_TOP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_to_virt() {
        assert_eq!(
            phys_to_virt(PhysAddr::new(0x1000)).as_u64(),
            0xFFFF_8000_0000_1000
        );
    }

    #[test]
    fn test_user_addr() {
        assert!(is_user_addr(VirtAddr::new(0x40_0000)));
        assert!(!is_user_addr(VirtAddr::new(KERNEL_BASE)));
        assert!(!is_user_addr(VirtAddr::new(USER_SPACE_TOP)));
    }
}
