//! Debug operations

use kozo_cap::{CapStore, SlotRef, CNODE_SLOTS};
use kozo_syscall::SysError;

use crate::arch::serial;
use crate::cap::with_space;
use crate::thread::Tid;

use super::caller_root;

/// DebugDumpCaps: log every occupied slot of the caller's root CNode.
pub fn dump_caps(caller: Tid) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    with_space(|space| {
        log::info!("capability dump for tid {caller} ({root}):");
        let mut occupied = 0;
        for i in 0..CNODE_SLOTS {
            if let Some(slot) = space.cnodes.slot(SlotRef::new(root, i as u16)) {
                if !slot.is_null() {
                    log::info!("  [{i:4}] {slot}");
                    occupied += 1;
                }
            }
        }
        log::info!("  {occupied} occupied slots");
        Ok(occupied as i64)
    })
}

/// DebugPutchar: write one byte to the kernel console.
pub fn putchar(args: &[u64; 6]) -> Result<i64, SysError> {
    serial::putc(args[0] as u8);
    Ok(0)
}
