//! Virtual Memory Manager
//!
//! Recursive-paging manipulation of the active four-level address space.
//! Slot 510 of every root table points at the root itself, which makes
//! every table in the tree addressable at a fixed virtual window: for a
//! virtual address with indices `(l4, l3, l2, l1)`, the level-1 table
//! holding its entry appears at
//! `REC | l4 << 30 | l3 << 21 | l2 << 12`, and each higher level repeats
//! the recursive index once more.
//!
//! Intermediate tables are materialised on demand from the frame
//! allocator. W^X is enforced at the leaf: a writable user mapping is
//! always no-execute.

use bitflags::bitflags;
use kozo_common::memory::PAGE_SIZE;
use kozo_common::{PhysAddr, VirtAddr};

use super::frame;
use super::layout::{phys_to_virt, RECURSIVE_INDEX};

/// Entries per page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First index of the kernel half of the root table.
pub const KERNEL_HALF_START: usize = 256;

bitflags! {
    /// x86-64 page-table entry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is present.
        const PRESENT = 1 << 0;
        /// Writable.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY = 1 << 6;
        /// Large page (2 MiB / 1 GiB).
        const HUGE = 1 << 7;
        /// Not flushed on address-space switch.
        const GLOBAL = 1 << 8;
        /// Execution forbidden (requires EFER.NXE).
        const NO_EXECUTE = 1 << 63;
    }
}

/// Mask selecting the physical-address bits of an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// An intermediate table could not be allocated.
    TableAllocFailed,
    /// The leaf entry is already present.
    AlreadyMapped,
    /// No mapping exists at the address.
    NotMapped,
    /// The address is not canonical or not page-aligned.
    BadAddress,
}

/// A single page-table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (non-present) entry.
    pub const EMPTY: Self = Self(0);

    /// Build an entry from a frame address and flags.
    #[inline]
    #[must_use]
    pub const fn new(phys: PhysAddr, flags: PageFlags) -> Self {
        Self((phys.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Check the present bit.
    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Physical address this entry points at.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Flag bits of this entry.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Clear the entry.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// One 4 KiB page table: 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries.
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Zero every entry.
    pub fn clear(&mut self) {
        for e in self.entries.iter_mut() {
            e.clear();
        }
    }
}

// -- Index and window arithmetic (pure; unit-tested)

/// The four table indices of a virtual address, root first.
#[inline]
#[must_use]
pub const fn table_indices(virt: VirtAddr) -> [usize; 4] {
    let v = virt.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

/// Sign-extend a 48-bit virtual address.
#[inline]
#[must_use]
const fn canonicalise(addr: u64) -> u64 {
    if addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

const REC: u64 = RECURSIVE_INDEX as u64;

/// Window address of the root table.
#[inline]
#[must_use]
pub const fn l4_window() -> VirtAddr {
    VirtAddr::new(canonicalise(
        (REC << 39) | (REC << 30) | (REC << 21) | (REC << 12),
    ))
}

/// Window address of the level-3 table for root index `i4`.
#[inline]
#[must_use]
pub const fn l3_window(i4: usize) -> VirtAddr {
    VirtAddr::new(canonicalise(
        (REC << 39) | (REC << 30) | (REC << 21) | ((i4 as u64) << 12),
    ))
}

/// Window address of the level-2 table for indices `(i4, i3)`.
#[inline]
#[must_use]
pub const fn l2_window(i4: usize, i3: usize) -> VirtAddr {
    VirtAddr::new(canonicalise(
        (REC << 39) | (REC << 30) | ((i4 as u64) << 21) | ((i3 as u64) << 12),
    ))
}

/// Window address of the level-1 table for indices `(i4, i3, i2)`.
#[inline]
#[must_use]
pub const fn l1_window(i4: usize, i3: usize, i2: usize) -> VirtAddr {
    VirtAddr::new(canonicalise(
        (REC << 39) | ((i4 as u64) << 30) | ((i3 as u64) << 21) | ((i2 as u64) << 12),
    ))
}

/// Leaf flags for a user mapping with the given permissions.
///
/// Read is implicit in Present; a writable user page is forced
/// no-execute (W^X), and a non-executable read-only page keeps NX as
/// well unless execution was requested.
#[inline]
#[must_use]
pub fn user_leaf_flags(write: bool, execute: bool) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if write {
        flags |= PageFlags::WRITABLE | PageFlags::NO_EXECUTE;
    } else if !execute {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

// -- Active-address-space operations

#[inline]
fn window_table(addr: VirtAddr) -> *mut PageTable {
    addr.as_mut_ptr::<PageTable>()
}

#[inline]
fn flush_tlb(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

/// Walk one level: return the next-level window, materialising the table
/// if `create` and the entry is absent.
///
/// # Safety
///
/// The recursive slot must be installed in the active root.
unsafe fn descend(
    table: *mut PageTable,
    index: usize,
    next_window: VirtAddr,
    create: bool,
) -> Result<*mut PageTable, MapError> {
    // SAFETY: Caller guarantees the window maps a live table.
    let entry = unsafe { &mut (*table).entries[index] };
    if !entry.is_present() {
        if !create {
            return Err(MapError::NotMapped);
        }
        let table_frame = frame::alloc_frame_zeroed().ok_or(MapError::TableAllocFailed)?;
        *entry = PageTableEntry::new(
            table_frame,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        );
        flush_tlb(next_window);
    } else if entry.flags().contains(PageFlags::HUGE) {
        return Err(MapError::AlreadyMapped);
    }
    Ok(window_table(next_window))
}

/// Map a 4 KiB page in the active address space.
///
/// Missing intermediate tables are allocated and zeroed. Fails with
/// `AlreadyMapped` without touching the tree if the leaf entry is
/// present. For user mappings, Write implies No-Execute.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
    if !virt.is_page_aligned() || !virt.is_canonical() || !phys.is_page_aligned() {
        return Err(MapError::BadAddress);
    }
    let [i4, i3, i2, i1] = table_indices(virt);
    if i4 == RECURSIVE_INDEX {
        return Err(MapError::BadAddress);
    }

    let mut leaf_flags = flags | PageFlags::PRESENT;
    if leaf_flags.contains(PageFlags::USER) && leaf_flags.contains(PageFlags::WRITABLE) {
        leaf_flags |= PageFlags::NO_EXECUTE;
    }

    // SAFETY: The recursive slot is installed at init; windows resolve to
    // live tables once descend materialises them.
    unsafe {
        let l4 = window_table(l4_window());
        let l3 = descend(l4, i4, l3_window(i4), true)?;
        let l2 = descend(l3, i3, l2_window(i4, i3), true)?;
        let l1 = descend(l2, i2, l1_window(i4, i3, i2), true)?;

        let entry = &mut (*l1).entries[i1];
        if entry.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        *entry = PageTableEntry::new(phys, leaf_flags);
    }
    flush_tlb(virt);
    Ok(())
}

/// Remove a 4 KiB mapping from the active address space.
///
/// Returns the physical frame that was mapped. Intermediate tables are
/// left in place.
pub fn unmap_page(virt: VirtAddr) -> Result<PhysAddr, MapError> {
    if !virt.is_page_aligned() || !virt.is_canonical() {
        return Err(MapError::BadAddress);
    }
    let [i4, i3, i2, i1] = table_indices(virt);

    // SAFETY: As in map_page; no table is created (create = false).
    unsafe {
        let l4 = window_table(l4_window());
        let l3 = descend(l4, i4, l3_window(i4), false)?;
        let l2 = descend(l3, i3, l2_window(i4, i3), false)?;
        let l1 = descend(l2, i2, l1_window(i4, i3, i2), false)?;

        let entry = &mut (*l1).entries[i1];
        if !entry.is_present() {
            return Err(MapError::NotMapped);
        }
        let phys = entry.addr();
        entry.clear();
        flush_tlb(virt);
        Ok(phys)
    }
}

/// Check whether a virtual address is mapped in the active address space.
#[must_use]
pub fn is_mapped(virt: VirtAddr) -> bool {
    translate(virt).is_some()
}

/// Translate a virtual address through the active tables.
#[must_use]
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    let [i4, i3, i2, i1] = table_indices(virt.page_align_down());

    // SAFETY: Read-only walk through the recursive window.
    unsafe {
        let l4 = window_table(l4_window());
        let l3 = descend(l4, i4, l3_window(i4), false).ok()?;
        let l2 = descend(l3, i3, l2_window(i4, i3), false).ok()?;
        let l1 = descend(l2, i2, l1_window(i4, i3, i2), false).ok()?;
        let entry = (*l1).entries[i1];
        if entry.is_present() {
            Some(entry.addr())
        } else {
            None
        }
    }
}

/// Turn a zeroed frame into an address-space root.
///
/// Copies the higher-half kernel entries from the active root (so every
/// address space sees the kernel) and installs the recursive slot
/// pointing at the frame itself.
pub fn init_address_space_root(root_phys: PhysAddr) {
    // SAFETY: The frame is exclusively owned by the new address space;
    // the active root is readable through the direct map.
    unsafe {
        let new_root = &mut *phys_to_virt(root_phys).as_mut_ptr::<PageTable>();
        let current = &*phys_to_virt(active_root()).as_ptr::<PageTable>();

        for i in KERNEL_HALF_START..ENTRIES_PER_TABLE {
            if i != RECURSIVE_INDEX {
                new_root.entries[i] = current.entries[i];
            }
        }
        new_root.entries[RECURSIVE_INDEX] =
            PageTableEntry::new(root_phys, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
}

/// Create a new address space. Returns the root's physical address.
pub fn create_address_space() -> Option<PhysAddr> {
    let root_phys = frame::alloc_frame_zeroed()?;
    init_address_space_root(root_phys);
    Some(root_phys)
}

/// Destroy an address space, freeing its intermediate tables.
///
/// Only the user half is walked; leaf frames belong to Frame
/// capabilities and are reclaimed by revocation, not here. The address
/// space must not be active.
pub fn destroy_address_space(root_phys: PhysAddr) {
    // SAFETY: The root is inactive and reachable through the direct map.
    unsafe {
        let root = &*phys_to_virt(root_phys).as_ptr::<PageTable>();
        for l4e in &root.entries[..KERNEL_HALF_START] {
            if !l4e.is_present() {
                continue;
            }
            let l3 = &*phys_to_virt(l4e.addr()).as_ptr::<PageTable>();
            for l3e in &l3.entries {
                if !l3e.is_present() || l3e.flags().contains(PageFlags::HUGE) {
                    continue;
                }
                let l2 = &*phys_to_virt(l3e.addr()).as_ptr::<PageTable>();
                for l2e in &l2.entries {
                    if l2e.is_present() && !l2e.flags().contains(PageFlags::HUGE) {
                        frame::free_frame(l2e.addr());
                    }
                }
                frame::free_frame(l3e.addr());
            }
            frame::free_frame(l4e.addr());
        }
    }
    frame::free_frame(root_phys);
}

/// Physical address of the active root table.
#[must_use]
pub fn active_root() -> PhysAddr {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    PhysAddr::new(frame.start_address().as_u64())
}

/// Switch to `root`, run `f` against that address space, switch back.
///
/// Both address spaces share the kernel half, so kernel code and stacks
/// stay mapped across the switch.
pub fn with_address_space<R>(root: PhysAddr, f: impl FnOnce() -> R) -> R {
    use x86_64::registers::control::Cr3;
    use x86_64::structures::paging::PhysFrame;

    let (old, cr3_flags) = Cr3::read();
    let target = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
    if target == old {
        return f();
    }
    // SAFETY: The target root was built by create_address_space and keeps
    // the kernel half mapped.
    unsafe { Cr3::write(target, cr3_flags) };
    let result = f();
    // SAFETY: Restoring the previous root.
    unsafe { Cr3::write(old, cr3_flags) };
    result
}

/// Switch the active address space if it differs. Used by the scheduler.
pub fn switch_address_space(root: PhysAddr) {
    use x86_64::registers::control::Cr3;
    use x86_64::structures::paging::PhysFrame;

    let (old, cr3_flags) = Cr3::read();
    let target = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
    if target != old {
        // SAFETY: Every address space shares the kernel half.
        unsafe { Cr3::write(target, cr3_flags) };
    }
}

/// Install the recursive slot in the firmware-provided root and reload.
///
/// # Safety
///
/// Must be called once, with `pml4_phys` naming the active root.
pub unsafe fn init(pml4_phys: PhysAddr) {
    // SAFETY: The firmware root is live and reachable through the direct
    // map; slot 510 is reserved for us by the handover contract.
    unsafe {
        let root = &mut *phys_to_virt(pml4_phys).as_mut_ptr::<PageTable>();
        root.entries[RECURSIVE_INDEX] =
            PageTableEntry::new(pml4_phys, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    // Reload CR3 to drop any stale translations for the window.
    let (frame, flags) = x86_64::registers::control::Cr3::read();
    // SAFETY: Rewriting the same root.
    unsafe { x86_64::registers::control::Cr3::write(frame, flags) };

    log::info!("recursive paging window installed (slot {RECURSIVE_INDEX})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indices() {
        let v = VirtAddr::new(0x0000_7FFF_FFFF_F000);
        assert_eq!(table_indices(v), [255, 511, 511, 511]);
        let v = VirtAddr::new(0x40_0000); // 4 MiB
        assert_eq!(table_indices(v), [0, 0, 2, 0]);
    }

    #[test]
    fn test_window_addresses() {
        // All four indices at the recursive slot: the root maps itself.
        let l4 = l4_window().as_u64();
        assert_eq!(table_indices(VirtAddr::new(l4)), [510, 510, 510, 510]);
        // The window addresses are canonical (510 sets bit 47).
        assert!(VirtAddr::new(l4).is_canonical());

        let l1 = l1_window(3, 7, 11).as_u64();
        assert_eq!(table_indices(VirtAddr::new(l1)), [510, 3, 7, 11]);
    }

    #[test]
    fn test_entry_round_trip() {
        let e = PageTableEntry::new(
            PhysAddr::new(0xABC000),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        );
        assert!(e.is_present());
        assert_eq!(e.addr(), PhysAddr::new(0xABC000));
        assert!(e.flags().contains(PageFlags::WRITABLE));
        assert!(e.flags().contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn test_wx_enforced() {
        // Writable user pages are never executable.
        let f = user_leaf_flags(true, false);
        assert!(f.contains(PageFlags::NO_EXECUTE));
        let f = user_leaf_flags(true, true);
        assert!(f.contains(PageFlags::NO_EXECUTE));
        // Read-execute stays executable.
        let f = user_leaf_flags(false, true);
        assert!(!f.contains(PageFlags::NO_EXECUTE));
        // Read-only data is not executable.
        let f = user_leaf_flags(false, false);
        assert!(f.contains(PageFlags::NO_EXECUTE));
    }
}
