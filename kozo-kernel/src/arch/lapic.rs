//! Local APIC
//!
//! Minimal driver: enable the APIC, run its timer periodically on vector
//! 32, and acknowledge interrupts. Registers are 32-bit, 16-byte spaced,
//! accessed as volatile loads and stores through the direct physical
//! map. The legacy PICs are masked out of the way at init.

use kozo_common::PhysAddr;
use x86_64::instructions::port::Port;

use crate::memory::layout::phys_to_virt;

/// Default local-APIC register block.
const LAPIC_PHYS: u64 = 0xFEE0_0000;

/// Vector the periodic timer fires on.
pub const TIMER_VECTOR: u8 = 32;

/// Spurious-interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Timer initial count: the preemption quantum in bus-clock/16 units.
const TIMER_INITIAL_COUNT: u32 = 10_000_000;

mod reg {
    pub const EOI: usize = 0xB0;
    pub const SPURIOUS: usize = 0xF0;
    pub const LVT_TIMER: usize = 0x320;
    pub const TIMER_INITIAL: usize = 0x380;
    pub const TIMER_DIVIDE: usize = 0x3E0;
}

/// Timer mode bit: periodic.
const TIMER_PERIODIC: u32 = 1 << 17;

/// APIC software-enable bit in the spurious register.
const APIC_ENABLE: u32 = 1 << 8;

/// Divide configuration: divide bus clock by 16.
const DIVIDE_BY_16: u32 = 0b0011;

#[inline]
fn reg_ptr(offset: usize) -> *mut u32 {
    phys_to_virt(PhysAddr::new(LAPIC_PHYS + offset as u64)).as_mut_ptr::<u32>()
}

#[inline]
fn write(offset: usize, value: u32) {
    // SAFETY: The register block is device memory mapped by the direct
    // map; offsets come from the constants above.
    unsafe {
        reg_ptr(offset).write_volatile(value);
    }
}

/// Mask both legacy PICs so only the APIC delivers interrupts.
fn mask_legacy_pics() {
    // SAFETY: Writing the interrupt-mask registers of both 8259s.
    unsafe {
        Port::<u8>::new(0x21).write(0xFFu8);
        Port::<u8>::new(0xA1).write(0xFFu8);
    }
}

/// Enable the local APIC and start the periodic preemption timer.
pub fn init() {
    mask_legacy_pics();

    write(reg::SPURIOUS, APIC_ENABLE | SPURIOUS_VECTOR as u32);
    write(reg::TIMER_DIVIDE, DIVIDE_BY_16);
    write(reg::LVT_TIMER, TIMER_PERIODIC | TIMER_VECTOR as u32);
    write(reg::TIMER_INITIAL, TIMER_INITIAL_COUNT);

    log::info!("local APIC timer: vector {TIMER_VECTOR}, periodic");
}

/// Signal end-of-interrupt. Must run before the handler yields.
#[inline]
pub fn eoi() {
    write(reg::EOI, 0);
}
