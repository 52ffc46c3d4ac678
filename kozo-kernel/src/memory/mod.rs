//! Memory management
//!
//! Two allocators, no heap:
//!
//! - [`frame`]: a bitmap over every 4 KiB physical frame, built from the
//!   firmware memory map. Single-frame allocations only.
//! - [`paging`]: the recursive-paging virtual memory manager, which
//!   materialises intermediate tables on demand from the frame allocator.
//!
//! [`layout`] holds the fixed virtual-address map the bootloader and
//! kernel agree on.

pub mod frame;
pub mod layout;
pub mod paging;

use kozo_common::{BootInfo, MemoryMapIter};

/// Initialise physical and virtual memory management from the handover
/// record.
///
/// # Safety
///
/// Must be called exactly once, before any allocation, with the direct
/// physical map already active.
pub unsafe fn init(boot_info: &BootInfo) {
    let map_bytes = unsafe {
        core::slice::from_raw_parts(
            layout::phys_to_virt(kozo_common::PhysAddr::new(boot_info.memory_map_addr))
                .as_ptr::<u8>(),
            boot_info.memory_map_size as usize,
        )
    };
    let iter = MemoryMapIter::new(map_bytes, boot_info.descriptor_size as usize)
        .expect("firmware descriptor stride smaller than the portable prefix");

    unsafe {
        frame::init(iter.clone());
    }

    // Keep the initrd out of the allocator's hands.
    if boot_info.has_initrd() {
        frame::reserve_range(
            kozo_common::PhysAddr::new(boot_info.initrd_addr),
            boot_info.initrd_size,
        );
    }

    unsafe {
        paging::init(kozo_common::PhysAddr::new(boot_info.pml4_phys));
    }
}
