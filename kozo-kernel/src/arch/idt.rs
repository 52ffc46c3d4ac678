//! Trap and interrupt dispatch
//!
//! Vectors 0-31 are CPU exceptions, 32 is the preemption timer, 0xFF the
//! APIC spurious vector. Fault policy:
//!
//! - an exception raised from user mode kills the faulting thread and
//!   schedules the next one; no signal delivery exists
//! - an exception raised in kernel mode is a kernel bug and panics
//! - double fault and machine check run on dedicated IST stacks, since
//!   the current stack may be the problem

use spin::Lazy;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{gdt, lapic};
use crate::sched;
use crate::thread::ThreadState;

static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    idt.divide_error.set_handler_fn(divide_error);
    idt.debug.set_handler_fn(debug_exception);
    idt.non_maskable_interrupt.set_handler_fn(non_maskable);
    idt.breakpoint.set_handler_fn(breakpoint);
    idt.overflow.set_handler_fn(overflow);
    idt.bound_range_exceeded.set_handler_fn(bound_range);
    idt.invalid_opcode.set_handler_fn(invalid_opcode);
    idt.device_not_available.set_handler_fn(device_not_available);
    idt.invalid_tss.set_handler_fn(invalid_tss);
    idt.segment_not_present.set_handler_fn(segment_not_present);
    idt.stack_segment_fault.set_handler_fn(stack_segment_fault);
    idt.general_protection_fault.set_handler_fn(general_protection);
    idt.page_fault.set_handler_fn(page_fault);
    idt.x87_floating_point.set_handler_fn(x87_floating_point);
    idt.alignment_check.set_handler_fn(alignment_check);
    idt.simd_floating_point.set_handler_fn(simd_floating_point);

    // SAFETY: The IST indices match the stacks installed in the TSS.
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault)
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        idt.machine_check
            .set_handler_fn(machine_check)
            .set_stack_index(gdt::MACHINE_CHECK_IST_INDEX);
    }

    idt[lapic::TIMER_VECTOR].set_handler_fn(timer_interrupt);
    idt[lapic::SPURIOUS_VECTOR].set_handler_fn(spurious_interrupt);

    idt
});

/// Load the IDT.
pub fn init() {
    IDT.load();
    log::info!("IDT loaded");
}

/// Whether the interrupted context was user mode (RPL 3).
fn from_user(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3
}

/// Common fault policy: kill the faulting user thread or panic.
fn handle_fault(name: &str, frame: &InterruptStackFrame, error_code: Option<u64>) {
    if from_user(frame) {
        let tid = sched::current();
        log::error!(
            "thread {} killed by {} at {:#x} (error {:?})",
            tid,
            name,
            frame.instruction_pointer.as_u64(),
            error_code,
        );
        // The thread is unrecoverable: take it off the processor for
        // good. Its TCB and capabilities go away when its Thread
        // capability is revoked.
        sched::block(ThreadState::Blocked);
        unreachable!("killed thread rescheduled");
    }
    panic!(
        "kernel {} at {:#x} (error {:?})",
        name,
        frame.instruction_pointer.as_u64(),
        error_code
    );
}

extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
    handle_fault("divide error", &frame, None);
}

extern "x86-interrupt" fn debug_exception(frame: InterruptStackFrame) {
    handle_fault("debug exception", &frame, None);
}

extern "x86-interrupt" fn non_maskable(_frame: InterruptStackFrame) {
    log::warn!("non-maskable interrupt");
}

extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    handle_fault("breakpoint", &frame, None);
}

extern "x86-interrupt" fn overflow(frame: InterruptStackFrame) {
    handle_fault("overflow", &frame, None);
}

extern "x86-interrupt" fn bound_range(frame: InterruptStackFrame) {
    handle_fault("bound range exceeded", &frame, None);
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
    handle_fault("invalid opcode", &frame, None);
}

extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
    handle_fault("device not available", &frame, None);
}

extern "x86-interrupt" fn invalid_tss(frame: InterruptStackFrame, code: u64) {
    handle_fault("invalid TSS", &frame, Some(code));
}

extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, code: u64) {
    handle_fault("segment not present", &frame, Some(code));
}

extern "x86-interrupt" fn stack_segment_fault(frame: InterruptStackFrame, code: u64) {
    handle_fault("stack segment fault", &frame, Some(code));
}

extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, code: u64) {
    handle_fault("general protection fault", &frame, Some(code));
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    if from_user(&frame) {
        let tid = sched::current();
        log::error!(
            "thread {} killed by page fault at {:#x} accessing {:#x} ({:?})",
            tid,
            frame.instruction_pointer.as_u64(),
            addr,
            code,
        );
        sched::block(ThreadState::Blocked);
        unreachable!("killed thread rescheduled");
    }
    // Demand paging does not exist; a kernel page fault is fatal.
    panic!(
        "kernel page fault at {:#x} accessing {:#x} ({:?})",
        frame.instruction_pointer.as_u64(),
        addr,
        code
    );
}

extern "x86-interrupt" fn x87_floating_point(frame: InterruptStackFrame) {
    handle_fault("x87 floating point", &frame, None);
}

extern "x86-interrupt" fn alignment_check(frame: InterruptStackFrame, code: u64) {
    handle_fault("alignment check", &frame, Some(code));
}

extern "x86-interrupt" fn simd_floating_point(frame: InterruptStackFrame) {
    handle_fault("SIMD floating point", &frame, None);
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, code: u64) -> ! {
    panic!(
        "double fault at {:#x} (error {})",
        frame.instruction_pointer.as_u64(),
        code
    );
}

extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
    panic!(
        "machine check at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

/// Preemption tick: acknowledge, then hand the processor on.
extern "x86-interrupt" fn timer_interrupt(_frame: InterruptStackFrame) {
    lapic::eoi();
    sched::preempt();
}

extern "x86-interrupt" fn spurious_interrupt(_frame: InterruptStackFrame) {}
