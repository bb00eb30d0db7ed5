//! The Cortex-M4/M7 port.
//!
//! Register access goes through the `cortex-m` crate where it has a
//! name for it, raw system control block pokes where it does not. The
//! pend-switch and service call entry stubs are written in assembly
//! because they run before any Rust frame exists; they plug into the
//! `cortex-m-rt` vector table through their exception symbol names.

use core::arch::{asm, global_asm};

use cortex_m::peripheral::{NVIC, SCB, SYST};
use cortex_m::register::{basepri, control, msp, primask, psp};

use crate::condvar::ConditionVariable;
use crate::config::{
    PENDSV_PRIORITY, PREEMPTION_BITS, SERVICE_CALL_PRIORITY, SYSTICK_PRIORITY,
};
use crate::mutex::PriorityMutex;
use crate::sched::{self, SVC_SLEEP, SVC_SWITCH, SVC_TERMINATE, SVC_WAIT};
use crate::task::{StackFrame, TaskControlBlock};

extern "C" {
    /// Provided by the startup code, as in CMSIS projects.
    static SystemCoreClock: u32;
}

use crate::priority::IsrPriority;

pub fn core_clock() -> u32 {
    unsafe { SystemCoreClock }
}

/// Only the Cortex-M4 and M7 are supported.
pub fn core_type_supported() -> bool {
    const PARTNO_CORTEX_M4: u32 = 0xC24;
    const PARTNO_CORTEX_M7: u32 = 0xC27;
    let cpuid = unsafe { (*SCB::ptr()).cpuid.read() };
    let partno = (cpuid >> 4) & 0xFFF;
    partno == PARTNO_CORTEX_M4 || partno == PARTNO_CORTEX_M7
}

/// Writes the interrupt mask register and returns its previous value.
pub fn set_basepri(priority: IsrPriority) -> IsrPriority {
    let previous = basepri::read();
    unsafe { basepri::write(priority.value()) };
    cortex_m::asm::isb();
    IsrPriority::new(previous)
}

pub fn disable_interrupts() {
    cortex_m::interrupt::disable();
}

pub fn enable_interrupts() {
    unsafe { cortex_m::interrupt::enable() };
}

pub fn primask_active() -> bool {
    primask::read().is_active()
}

fn ipsr() -> u32 {
    let value: u32;
    unsafe {
        asm!("mrs {}, IPSR", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

pub fn is_thread_mode() -> bool {
    ipsr() == 0
}

/// The priority of the currently executing exception, `None` in thread
/// mode.
pub fn current_priority() -> Option<IsrPriority> {
    let exception = ipsr() & 0x1FF;
    if exception == 0 {
        None
    } else if exception < 4 {
        // Reset, NMI and HardFault have fixed priorities above anything
        // configurable.
        Some(IsrPriority::new(0))
    } else if exception < 16 {
        let value = unsafe { (*SCB::ptr()).shpr[exception as usize - 4].read() };
        Some(IsrPriority::new(value))
    } else {
        let value = unsafe { (*NVIC::ptr()).ipr[exception as usize - 16].read() };
        Some(IsrPriority::new(value))
    }
}

pub fn trigger_pend_sv() {
    SCB::set_pendsv();
}

pub fn clear_pend_sv() {
    SCB::clear_pendsv();
}

/// Programs the preemption split and the three kernel exception
/// priorities. The handlers themselves are linked into the vector table
/// by symbol name.
pub fn install_kernel_handlers() {
    unsafe {
        let scb = &*SCB::ptr();
        scb.aircr
            .write(0x05FA_0000 | (((7 - PREEMPTION_BITS) as u32) << 8));
        // SVCall, PendSV and SysTick are exceptions 11, 14 and 15.
        scb.shpr[7].write(SERVICE_CALL_PRIORITY.value());
        scb.shpr[10].write(PENDSV_PRIORITY.value());
        scb.shpr[11].write(SYSTICK_PRIORITY.value());
    }
}

pub fn enable_systick(reload: u32) {
    unsafe {
        let syst = &*SYST::ptr();
        syst.rvr.write(reload - 1);
        syst.cvr.write(0);
        // Core clock source, interrupt on wrap, counter on.
        syst.csr.write(0b111);
    }
}

/// Moves execution to the process stack pointer and winds the main stack
/// pointer back to its reset value, reclaiming it for exception
/// handling.
pub fn swap_to_process_stack() {
    unsafe {
        psp::write(msp::read());
        let mut ctrl = control::read();
        ctrl.set_spsel(control::Spsel::Psp);
        control::write(ctrl);
        cortex_m::asm::isb();
        let vector_table = (*SCB::ptr()).vtor.read();
        msp::write(core::ptr::read_volatile(vector_table as *const u32));
    }
}

pub fn wfi() {
    cortex_m::asm::wfi();
}

pub fn nop() {
    cortex_m::asm::nop();
}

pub fn breakpoint() {
    cortex_m::asm::bkpt();
}

pub fn svc_terminate(task: *mut TaskControlBlock) {
    unsafe {
        asm!(
            "svc #{number}",
            number = const SVC_TERMINATE as u32,
            in("r0") task,
            lateout("r1") _, lateout("r2") _, lateout("r3") _, lateout("r12") _,
        );
    }
}

pub fn svc_sleep(ticks: i32) {
    unsafe {
        asm!(
            "svc #{number}",
            number = const SVC_SLEEP as u32,
            in("r0") ticks,
            lateout("r1") _, lateout("r2") _, lateout("r3") _, lateout("r12") _,
        );
    }
}

pub fn svc_switch() {
    unsafe {
        asm!(
            "svc #{number}",
            number = const SVC_SWITCH as u32,
            lateout("r0") _, lateout("r1") _, lateout("r2") _, lateout("r3") _, lateout("r12") _,
        );
    }
}

/// Returns the wait status the kernel wrote into the saved frame before
/// resuming this task.
pub fn svc_wait(condition: *const ConditionVariable, timeout: i32, mutex: *const PriorityMutex) -> u32 {
    let mut result = condition as usize;
    unsafe {
        asm!(
            "svc #{number}",
            number = const SVC_WAIT as u32,
            inout("r0") result,
            in("r1") timeout,
            in("r2") mutex,
            lateout("r3") _, lateout("r12") _,
        );
    }
    result as u32
}

#[no_mangle]
extern "C" fn SysTick() {
    sched::tick_handler();
}

/// Rust side of the pend-switch stub: returns the incoming stack pointer
/// in the low word and the interrupt mask to apply on exception return in
/// the high word.
#[no_mangle]
extern "C" fn kron_pend_sv(psp: *mut u32) -> u64 {
    let (stack_pointer, mask) = sched::pend_sv_handler(psp);
    (stack_pointer as usize as u64) | ((mask as u64) << 32)
}

/// Rust side of the service call stub.
#[no_mangle]
extern "C" fn kron_service_call(frame: *mut StackFrame, number: u32, is_thread: u32) {
    unsafe {
        sched::service_call_handler(
            (*frame).r0 as usize,
            (*frame).r1 as usize,
            (*frame).r2 as usize,
            number as u8,
            is_thread != 0,
        );
    }
}

// The pend-switch entry stub. Masks the kernel out while it runs, saves
// the software context below the hardware frame, asks the scheduler for
// the incoming stack, and applies the returned interrupt mask on the way
// out. The floating point bank is stacked only when the outgoing frame
// used it (EXC_RETURN bit 4 clear).
#[cfg(target_abi = "eabihf")]
global_asm!(
    ".syntax unified",
    ".global PendSV",
    ".thumb_func",
    "PendSV:",
    "mov r1, #{mask}",
    "msr BASEPRI, r1",
    "isb",
    "mrs r0, PSP",
    "tst lr, #16",
    "it eq",
    "vstmdbeq r0!, {{s16-s31}}",
    "mov r2, lr",
    "mrs r3, CONTROL",
    "stmdb r0!, {{r2-r11}}",
    "bl {handler}",
    "ldmia r0!, {{r2-r11}}",
    "mov lr, r2",
    "msr CONTROL, r3",
    "isb",
    "tst lr, #16",
    "it eq",
    "vldmiaeq r0!, {{s16-s31}}",
    "msr PSP, r0",
    "msr BASEPRI, r1",
    "isb",
    "bx lr",
    mask = const SERVICE_CALL_PRIORITY.value() as u32,
    handler = sym kron_pend_sv,
);

#[cfg(not(target_abi = "eabihf"))]
global_asm!(
    ".syntax unified",
    ".global PendSV",
    ".thumb_func",
    "PendSV:",
    "mov r1, #{mask}",
    "msr BASEPRI, r1",
    "isb",
    "mrs r0, PSP",
    "mov r2, lr",
    "mrs r3, CONTROL",
    "stmdb r0!, {{r2-r11}}",
    "bl {handler}",
    "ldmia r0!, {{r2-r11}}",
    "mov lr, r2",
    "msr CONTROL, r3",
    "isb",
    "msr PSP, r0",
    "msr BASEPRI, r1",
    "isb",
    "bx lr",
    mask = const SERVICE_CALL_PRIORITY.value() as u32,
    handler = sym kron_pend_sv,
);

// The service call entry stub. Recovers the frame of the interrupted
// context, the immediate encoded in the `svc` instruction, and whether
// the caller was in thread mode.
global_asm!(
    ".syntax unified",
    ".global SVCall",
    ".thumb_func",
    "SVCall:",
    "tst lr, #4",
    "ite eq",
    "mrseq r0, MSP",
    "mrsne r0, PSP",
    "tst lr, #8",
    "ite eq",
    "moveq r2, #0",
    "movne r2, #1",
    "ldr r1, [r0, #24]",
    "ldrb r1, [r1, #-2]",
    "push {{lr}}",
    "bl {handler}",
    "isb",
    "dsb",
    "pop {{lr}}",
    "bx lr",
    handler = sym kron_service_call,
);
