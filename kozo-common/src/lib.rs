//! # kozo-common
//!
//! Types shared between the firmware handover, the kernel, and user-level
//! services. Everything here is plain data with a fixed `#[repr(C)]` layout:
//! this crate defines the ABI surface that crosses the bootloader/kernel
//! boundary, so layouts are pinned with compile-time asserts and nothing in
//! it may depend on kernel internals.
//!
//! # Contents
//!
//! - [`PhysAddr`] / [`VirtAddr`]: address newtypes
//! - [`BootInfo`]: the immutable handover record written by the firmware
//!   bootloader (framebuffer, memory map, root page table, initrd)
//! - [`MemoryDescriptor`] and [`MemoryMapIter`]: stride-indexed firmware
//!   memory map access
//! - [`memory`]: page-size constants and alignment helpers

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

mod addr;
pub mod boot;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr};
pub use boot::{BootInfo, MemoryDescriptor, MemoryMapIter};
