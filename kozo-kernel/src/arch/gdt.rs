//! Segmentation: GDT and TSS
//!
//! Long mode needs segments only for privilege levels and the TSS. The
//! layout is fixed by the fast-syscall MSR contract:
//!
//! | Index | Selector | Segment |
//! |---|---|---|
//! | 1 | 0x08 | kernel code |
//! | 2 | 0x10 | kernel data |
//! | 3 | 0x1B | user data (RPL 3) |
//! | 4 | 0x23 | user code (RPL 3) |
//! | 5 | 0x28 | TSS |
//!
//! `syscall` derives kernel CS/SS from index 1/2; `sysretq` derives user
//! SS/CS from index 3/4. The TSS carries RSP0 (updated on every thread
//! switch) and two emergency IST stacks for double fault and machine
//! check, which must not trust the current stack pointer.

use core::cell::UnsafeCell;

use kozo_common::VirtAddr;
use spin::Lazy;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::PrivilegeLevel;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// IST slot used by the machine-check handler.
pub const MACHINE_CHECK_IST_INDEX: u16 = 1;

const EMERGENCY_STACK_SIZE: usize = 4096 * 4;

#[repr(C, align(16))]
struct EmergencyStack([u8; EMERGENCY_STACK_SIZE]);

struct StackCell(UnsafeCell<EmergencyStack>);
// SAFETY: Written only by the CPU while the corresponding exception runs.
unsafe impl Sync for StackCell {}

static DOUBLE_FAULT_STACK: StackCell =
    StackCell(UnsafeCell::new(EmergencyStack([0; EMERGENCY_STACK_SIZE])));
static MACHINE_CHECK_STACK: StackCell =
    StackCell(UnsafeCell::new(EmergencyStack([0; EMERGENCY_STACK_SIZE])));

struct TssCell(UnsafeCell<TaskStateSegment>);
// SAFETY: Mutated only with interrupts disabled on a single processor.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::new()));

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
    tss: SegmentSelector,
}

static GDT: Lazy<(GlobalDescriptorTable, Selectors)> = Lazy::new(|| {
    // SAFETY: One-time setup before the GDT is loaded.
    let tss = unsafe {
        let tss = &mut *TSS.0.get();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = x86_64::VirtAddr::new(
            DOUBLE_FAULT_STACK.0.get() as u64 + EMERGENCY_STACK_SIZE as u64,
        );
        tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize] = x86_64::VirtAddr::new(
            MACHINE_CHECK_STACK.0.get() as u64 + EMERGENCY_STACK_SIZE as u64,
        );
        &*TSS.0.get()
    };

    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss_sel = gdt.append(Descriptor::tss_segment(tss));

    (
        gdt,
        Selectors {
            kernel_code,
            kernel_data,
            user_data,
            user_code,
            tss: tss_sel,
        },
    )
});

/// Load the GDT, reload the segment registers, load the TSS.
pub fn init() {
    let (gdt, selectors) = &*GDT;
    gdt.load();
    // SAFETY: The selectors index the GDT just loaded.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        SS::set_reg(selectors.kernel_data);
        DS::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        ES::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        load_tss(selectors.tss);
    }
    log::info!("GDT and TSS loaded");
}

/// Point TSS RSP0 at a thread's kernel stack top.
pub fn set_tss_rsp0(top: VirtAddr) {
    // SAFETY: Single processor, interrupts disabled in kernel mode; the
    // CPU reads RSP0 only on a ring transition.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = x86_64::VirtAddr::new(top.as_u64());
    }
}

/// Kernel code selector value (for synthetic privilege-return frames).
#[must_use]
pub fn kernel_code_selector() -> u16 {
    GDT.1.kernel_code.0
}

/// Kernel data selector value.
#[must_use]
pub fn kernel_data_selector() -> u16 {
    GDT.1.kernel_data.0
}

/// User code selector value, RPL 3.
#[must_use]
pub fn user_code_selector() -> u16 {
    GDT.1.user_code.0 | 3
}

/// User data selector value, RPL 3.
#[must_use]
pub fn user_data_selector() -> u16 {
    GDT.1.user_data.0 | 3
}

/// Selectors for the fast-syscall MSRs.
pub(crate) fn star_selectors() -> (SegmentSelector, SegmentSelector, SegmentSelector, SegmentSelector)
{
    let s = &GDT.1;
    (s.user_code, s.user_data, s.kernel_code, s.kernel_data)
}
