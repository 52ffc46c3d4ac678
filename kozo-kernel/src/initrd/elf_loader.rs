//! ELF64 service loader
//!
//! Parses a service executable and maps its `PT_LOAD` segments through a
//! caller-supplied callback. Permission policy: every page is readable;
//! writable only if the segment carries `PF_W`; executable only if it
//! carries `PF_X` — and the page-table layer additionally forces
//! writable user pages to be no-execute.

use elf_rs::{Elf, ElfFile, ProgramHeaderFlags, ProgramType};
use kozo_common::memory::PAGE_SIZE;

use crate::memory::layout::USER_SPACE_TOP;

/// Result of a successful load.
#[derive(Debug)]
pub struct LoadedElf {
    /// Entry point virtual address.
    pub entry: u64,
    /// Highest mapped virtual address, page-aligned (program break).
    pub brk: u64,
    /// Number of pages mapped.
    pub page_count: usize,
}

/// Errors from ELF loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfLoadError {
    /// The bytes do not parse as an ELF file.
    ParseError,
    /// Not a 64-bit image.
    Not64Bit,
    /// No `PT_LOAD` segment present.
    NoLoadableSegments,
    /// A segment's file range lies outside the image.
    SegmentOutOfBounds,
    /// A segment maps outside user space.
    InvalidSegment,
    /// The mapping callback failed (allocation or page-table error).
    MappingFailed,
}

/// Page permissions derived from segment flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagePerms {
    /// Readable (always set for loaded pages).
    pub read: bool,
    /// Writable.
    pub write: bool,
    /// Executable.
    pub execute: bool,
}

/// Derive page permissions from ELF segment flags.
#[must_use]
pub fn segment_perms(flags: ProgramHeaderFlags) -> PagePerms {
    PagePerms {
        read: true,
        write: flags.contains(ProgramHeaderFlags::WRITE),
        execute: flags.contains(ProgramHeaderFlags::EXECUTE),
    }
}

/// Load an ELF64 image.
///
/// `map_page` receives each page's virtual address, its permissions, the
/// offset within the page where file bytes begin, and the slice of file
/// bytes belonging to it (empty for BSS pages); it allocates the frame,
/// copies the data at that offset, zeroes the rest, and installs the
/// mapping.
pub fn load_elf<F>(elf_data: &[u8], mut map_page: F) -> Result<LoadedElf, ElfLoadError>
where
    F: FnMut(u64, PagePerms, usize, &[u8]) -> Result<(), ElfLoadError>,
{
    let elf = Elf::from_bytes(elf_data).map_err(|_| ElfLoadError::ParseError)?;
    let elf64 = match elf {
        Elf::Elf64(e) => e,
        Elf::Elf32(_) => return Err(ElfLoadError::Not64Bit),
    };

    let entry = elf64.elf_header().entry_point();
    let mut brk = 0u64;
    let mut page_count = 0usize;
    let mut has_loadable = false;

    for phdr in elf64.program_header_iter() {
        if phdr.ph_type() != ProgramType::LOAD || phdr.memsz() == 0 {
            continue;
        }
        has_loadable = true;

        let vaddr = phdr.vaddr();
        let memsz = phdr.memsz();
        let filesz = phdr.filesz();
        let offset = phdr.offset() as usize;

        if filesz > 0 {
            let file_end = offset.saturating_add(filesz as usize);
            if file_end > elf_data.len() {
                return Err(ElfLoadError::SegmentOutOfBounds);
            }
        }
        let segment_end = vaddr.saturating_add(memsz);
        if segment_end > USER_SPACE_TOP {
            return Err(ElfLoadError::InvalidSegment);
        }
        if segment_end > brk {
            brk = segment_end;
        }

        let perms = segment_perms(phdr.flags());

        let page_size = PAGE_SIZE as u64;
        let aligned_start = vaddr & !(page_size - 1);
        let aligned_end = (segment_end + page_size - 1) & !(page_size - 1);

        let mut va = aligned_start;
        while va < aligned_end {
            // File bytes covering this page, if any; the first page of
            // an unaligned segment starts partway in.
            let page_file_start = va.max(vaddr);
            let in_page = (page_file_start - va) as usize;
            let data: &[u8] = if page_file_start >= vaddr + filesz {
                &[]
            } else {
                let start = offset + (page_file_start - vaddr) as usize;
                let end = (offset + filesz as usize)
                    .min(start + page_size as usize - in_page);
                &elf_data[start..end]
            };

            map_page(va, perms, in_page, data)?;
            page_count += 1;
            va += page_size;
        }
    }

    if !has_loadable {
        return Err(ElfLoadError::NoLoadableSegments);
    }

    brk = (brk + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

    log::info!("ELF loaded: entry={entry:#x} brk={brk:#x} pages={page_count}");

    Ok(LoadedElf {
        entry,
        brk,
        page_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perms_from_flags() {
        let rx = segment_perms(ProgramHeaderFlags::READ | ProgramHeaderFlags::EXECUTE);
        assert!(rx.read && rx.execute && !rx.write);

        let rw = segment_perms(ProgramHeaderFlags::READ | ProgramHeaderFlags::WRITE);
        assert!(rw.read && rw.write && !rw.execute);

        // Read is unconditional even for oddly-flagged segments.
        let none = segment_perms(ProgramHeaderFlags::from_bits_truncate(0));
        assert!(none.read);
    }

    #[test]
    fn test_garbage_rejected() {
        let r = load_elf(b"definitely not an elf", |_, _, _, _| Ok(()));
        assert!(matches!(r, Err(ElfLoadError::ParseError)));
    }
}
