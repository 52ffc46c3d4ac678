//! Service archive loading
//!
//! The initrd is a cpio archive of service executables. [`load_service`]
//! finds one by name, builds its address space image segment by segment,
//! and maps an initial user stack.

pub mod cpio;
pub mod elf_loader;

use kozo_common::memory::PAGE_SIZE;
use kozo_common::{PhysAddr, VirtAddr};

use crate::memory::layout::phys_to_virt;
use crate::memory::{frame, paging};

use elf_loader::{ElfLoadError, LoadedElf};

/// Top of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;

/// Initial user stack size in pages.
pub const USER_STACK_PAGES: usize = 16;

/// A service ready to run.
#[derive(Debug)]
pub struct LoadedService {
    /// Entry point.
    pub entry: VirtAddr,
    /// Initial user stack pointer.
    pub stack_top: VirtAddr,
    /// Program break after the image.
    pub brk: VirtAddr,
}

/// Errors from service loading.
#[derive(Debug)]
pub enum ServiceLoadError {
    /// The archive has no member with the requested name.
    NotFound,
    /// The executable image is malformed.
    Elf(ElfLoadError),
}

impl From<ElfLoadError> for ServiceLoadError {
    fn from(e: ElfLoadError) -> Self {
        Self::Elf(e)
    }
}

/// Map one page of a service image into the target address space.
///
/// Allocates a zeroed frame, copies the file bytes at the in-page
/// offset, and installs the mapping with the segment's permissions.
fn map_service_page(
    va: u64,
    perms: elf_loader::PagePerms,
    in_page: usize,
    data: &[u8],
) -> Result<(), ElfLoadError> {
    let virt = VirtAddr::new(va);

    // Overlapping segments would silently alias each other's frames.
    if paging::is_mapped(virt) {
        return Err(ElfLoadError::InvalidSegment);
    }

    let phys = frame::alloc_frame_zeroed().ok_or(ElfLoadError::MappingFailed)?;
    if !data.is_empty() {
        // SAFETY: The frame was just allocated and the slice fits the
        // page by the loader's construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                phys_to_virt(phys).as_mut_ptr::<u8>().add(in_page),
                data.len(),
            );
        }
    }

    let flags = paging::user_leaf_flags(perms.write, perms.execute);
    paging::map_page(virt, phys, flags).map_err(|_| ElfLoadError::MappingFailed)?;
    Ok(())
}

/// Load a service executable from the archive into `aspace_root`.
///
/// The image and stack are mapped with the target address space active;
/// both roots share the kernel half, so kernel execution continues
/// unaffected across the switch.
pub fn load_service(
    archive: &[u8],
    name: &str,
    aspace_root: PhysAddr,
) -> Result<LoadedService, ServiceLoadError> {
    let image = cpio::find_file(archive, name).ok_or(ServiceLoadError::NotFound)?;
    log::info!("loading service '{}' ({} bytes)", name, image.len());

    let loaded: Result<LoadedElf, ElfLoadError> = paging::with_address_space(aspace_root, || {
        let elf = elf_loader::load_elf(image, map_service_page)?;

        // Initial stack: read-write, never executable.
        let stack_base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u64;
        for i in 0..USER_STACK_PAGES {
            let va = VirtAddr::new(stack_base + (i * PAGE_SIZE) as u64);
            let phys = frame::alloc_frame_zeroed().ok_or(ElfLoadError::MappingFailed)?;
            paging::map_page(va, phys, paging::user_leaf_flags(true, false))
                .map_err(|_| ElfLoadError::MappingFailed)?;
        }
        Ok(elf)
    });
    let elf = loaded?;

    Ok(LoadedService {
        entry: VirtAddr::new(elf.entry),
        stack_top: VirtAddr::new(USER_STACK_TOP),
        brk: VirtAddr::new(elf.brk),
    })
}
