//! cpio "new ASCII" archive parser
//!
//! Minimal reader for the `070701` (newc) format the service archive
//! uses: a 110-byte header of ASCII-hex fields, the name (NUL included
//! in its recorded length), then the data, with name and data each
//! padded to four bytes from the start of the entry. The `TRAILER!!!`
//! entry ends iteration.
//!
//! The name length always comes from the header; scanning for NUL would
//! mis-walk archives with padded or embedded names.

/// Header magic for the new ASCII format.
const NEWC_MAGIC: &[u8; 6] = b"070701";

/// Size of the fixed header.
const HEADER_SIZE: usize = 110;

/// Name of the terminating entry.
const TRAILER: &str = "TRAILER!!!";

/// cpio header (ASCII-hex fields, 8 characters each after the magic).
#[repr(C)]
struct NewcHeader {
    magic: [u8; 6],
    ino: [u8; 8],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    nlink: [u8; 8],
    mtime: [u8; 8],
    filesize: [u8; 8],
    devmajor: [u8; 8],
    devminor: [u8; 8],
    rdevmajor: [u8; 8],
    rdevminor: [u8; 8],
    namesize: [u8; 8],
    check: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<NewcHeader>() == HEADER_SIZE);

/// Parse an 8-character ASCII-hex field.
fn parse_hex(field: &[u8; 8]) -> Option<u32> {
    let mut value: u32 = 0;
    for &b in field {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = value.checked_mul(16)?.checked_add(digit as u32)?;
    }
    Some(value)
}

/// Round up to the format's 4-byte padding.
#[inline]
const fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// One archive member.
#[derive(Clone, Copy, Debug)]
pub struct CpioEntry<'a> {
    /// Member path (without the trailing NUL).
    pub name: &'a str,
    /// File contents.
    pub data: &'a [u8],
    /// Raw mode bits.
    pub mode: u32,
}

/// Iterator over the members of a newc archive.
pub struct CpioIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CpioIter<'a> {
    /// Walk an archive from its first byte.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for CpioIter<'a> {
    type Item = CpioEntry<'a>;

    fn next(&mut self) -> Option<CpioEntry<'a>> {
        if self.done {
            return None;
        }

        let start = self.offset;
        let header_bytes = self.bytes.get(start..start + HEADER_SIZE)?;

        // SAFETY: NewcHeader is repr(C), exactly 110 bytes of u8 arrays,
        // so any bit pattern is a valid value.
        let header: &NewcHeader = unsafe { &*(header_bytes.as_ptr() as *const NewcHeader) };

        if &header.magic != NEWC_MAGIC {
            log::warn!("cpio: bad magic at offset {start:#x}");
            self.done = true;
            return None;
        }

        let namesize = parse_hex(&header.namesize)? as usize;
        let filesize = parse_hex(&header.filesize)? as usize;
        let mode = parse_hex(&header.mode)?;
        if namesize == 0 {
            self.done = true;
            return None;
        }

        // Name follows the header; data starts at the padded boundary.
        let name_start = start + HEADER_SIZE;
        let name_bytes = self.bytes.get(name_start..name_start + namesize)?;
        let name =
            core::str::from_utf8(name_bytes.strip_suffix(&[0]).unwrap_or(name_bytes)).ok()?;

        let data_start = start + pad4(HEADER_SIZE + namesize);
        let next_offset = data_start + pad4(filesize);

        if name == TRAILER {
            self.done = true;
            return None;
        }

        let data = self.bytes.get(data_start..data_start + filesize)?;
        self.offset = next_offset;

        Some(CpioEntry { name, data, mode })
    }
}

/// Find a member by exact name.
#[must_use]
pub fn find_file<'a>(archive: &'a [u8], name: &str) -> Option<&'a [u8]> {
    CpioIter::new(archive)
        .find(|e| e.name == name)
        .map(|e| e.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Append one newc entry to a byte vector.
    fn push_entry(out: &mut Vec<u8>, name: &str, data: &[u8]) {
        let start = out.len();
        out.extend_from_slice(b"070701");
        // ino, mode, uid, gid, nlink, mtime
        for value in [1u32, 0o100644, 0, 0, 1, 0] {
            out.extend_from_slice(format!("{value:08X}").as_bytes());
        }
        out.extend_from_slice(format!("{:08X}", data.len()).as_bytes());
        // devmajor, devminor, rdevmajor, rdevminor
        for _ in 0..4 {
            out.extend_from_slice(b"00000000");
        }
        out.extend_from_slice(format!("{:08X}", name.len() + 1).as_bytes());
        out.extend_from_slice(b"00000000"); // check
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
    }

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in entries {
            push_entry(&mut out, name, data);
        }
        push_entry(&mut out, "TRAILER!!!", &[]);
        out
    }

    #[test]
    fn test_iterates_members() {
        let a = archive(&[("init", b"ELF..."), ("policy", b"more")]);
        let names: Vec<&str> = CpioIter::new(&a).map(|e| e.name).collect();
        assert_eq!(names, ["init", "policy"]);
    }

    #[test]
    fn test_find_file() {
        let a = archive(&[("init", b"hello"), ("etc/config", b"key=1")]);
        assert_eq!(find_file(&a, "init"), Some(&b"hello"[..]));
        assert_eq!(find_file(&a, "etc/config"), Some(&b"key=1"[..]));
        assert_eq!(find_file(&a, "missing"), None);
    }

    #[test]
    fn test_unpadded_sizes() {
        // 5-byte payloads exercise both padding paths.
        let a = archive(&[("a", b"12345"), ("bb", b"xyz")]);
        let entries: Vec<_> = CpioIter::new(&a).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data, b"12345");
        assert_eq!(entries[1].data, b"xyz");
    }

    #[test]
    fn test_trailer_ends_iteration() {
        let mut a = archive(&[("init", b"x")]);
        // Garbage after the trailer must never be reached.
        a.extend_from_slice(&[0xFF; 64]);
        assert_eq!(CpioIter::new(&a).count(), 1);
    }

    #[test]
    fn test_truncated_archive() {
        let a = archive(&[("init", b"payload")]);
        let cut = &a[..a.len() / 2];
        // Iteration stops cleanly instead of reading out of bounds.
        let _ = CpioIter::new(cut).count();
    }

    #[test]
    fn test_bad_magic() {
        let mut a = archive(&[("init", b"x")]);
        a[0] = b'9';
        assert_eq!(CpioIter::new(&a).count(), 0);
    }
}
