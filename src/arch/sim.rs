//! The host simulation port.
//!
//! Replaces the Cortex-M with a small software model: a BASEPRI byte, the
//! PRIMASK flag, a stack of active exception priorities, a pend-switch
//! pending bit and a handful of pendable interrupt slots. A cooperative
//! dispatcher runs whatever is pending whenever the masking state allows,
//! on every unmasking edge, which reproduces the preemption and
//! tail-chaining order of the real interrupt controller closely enough to
//! exercise every kernel path.
//!
//! Tests drive it through [`take`] (serializes tests and resets all
//! kernel state), [`advance`] (the fake tick driver) and
//! [`run_isr`]/[`raise_irq`] (simulated interrupt service routines).
//!
//! There is no real stack switching on the host: a blocking service call
//! returns to the test driver once the kernel has switched tasks, and the
//! driver carries on as whichever task is now current. The value a
//! blocking wait wrapper returns here is therefore meaningless; read the
//! woken task's status with [`wait_status`] instead.

use spin::Mutex as SpinLock;

use crate::condvar::{ConditionVariable, WaitStatus};
use crate::config::{
    PENDSV_PRIORITY, PREEMPTION_BITS, PRIORITY_BITS, SERVICE_CALL_PRIORITY, SYSTICK_PRIORITY,
};
use crate::hooks;
use crate::mutex::PriorityMutex;
use crate::priority::IsrPriority;
use crate::sched::{self, SVC_SLEEP, SVC_SWITCH, SVC_TERMINATE, SVC_WAIT};
use crate::task::TaskControlBlock;
use crate::time::Duration;
use crate::trap_assert;

const MAX_NESTED_EXCEPTIONS: usize = 16;
const MAX_PENDED_IRQS: usize = 8;

#[derive(Clone, Copy)]
struct PendedIrq {
    priority: u8,
    handler: fn(),
}

struct SimCpu {
    basepri: u8,
    primask: bool,
    active: [u8; MAX_NESTED_EXCEPTIONS],
    depth: usize,
    pend_sv_pending: bool,
    pended_irqs: [Option<PendedIrq>; MAX_PENDED_IRQS],
    systick_enabled: bool,
    systick_reload: u32,
    core_clock: u32,
    psp: usize,
    msp: usize,
    process_stack: bool,
    handlers_installed: bool,
}

impl SimCpu {
    const fn new() -> SimCpu {
        SimCpu {
            basepri: 0,
            primask: false,
            active: [0; MAX_NESTED_EXCEPTIONS],
            depth: 0,
            pend_sv_pending: false,
            pended_irqs: [None; MAX_PENDED_IRQS],
            systick_enabled: false,
            systick_reload: 0,
            core_clock: 16_000_000,
            psp: 0,
            msp: 0,
            process_stack: false,
            handlers_installed: false,
        }
    }

    fn masked(value: u8) -> u8 {
        IsrPriority::new(value).masked_value(PRIORITY_BITS)
    }

    fn group(value: u8) -> u8 {
        IsrPriority::new(value).masked_value(PREEMPTION_BITS)
    }

    /// Whether an exception at `priority` may begin executing right now,
    /// following the NVIC rules: PRIMASK blocks everything, BASEPRI
    /// blocks its level and below, and a running exception is only
    /// preempted by a more urgent preemption group.
    fn can_run(&self, priority: u8) -> bool {
        if self.primask {
            return false;
        }
        if self.basepri != 0 && Self::masked(priority) >= Self::masked(self.basepri) {
            return false;
        }
        if self.depth > 0 && Self::group(priority) >= Self::group(self.active[self.depth - 1]) {
            return false;
        }
        true
    }
}

static CPU: SpinLock<SimCpu> = SpinLock::new(SimCpu::new());
static DRIVER: SpinLock<()> = SpinLock::new(());

fn enter_exception(priority: u8) {
    let mut cpu = CPU.lock();
    trap_assert!(cpu.can_run(priority));
    trap_assert!(cpu.depth < MAX_NESTED_EXCEPTIONS);
    let depth = cpu.depth;
    cpu.active[depth] = priority;
    cpu.depth += 1;
}

fn exit_exception() {
    {
        let mut cpu = CPU.lock();
        trap_assert!(cpu.depth > 0);
        cpu.depth -= 1;
    }
    run_pending();
}

enum Job {
    PendSv,
    Irq(PendedIrq),
}

/// Runs pended exceptions, most urgent first, until nothing runnable
/// remains. Called on every edge that could unmask something.
fn run_pending() {
    loop {
        let job = {
            let mut cpu = CPU.lock();

            // (priority, pended slot); no slot means the pend-switch.
            let mut best: Option<(u8, Option<usize>)> = None;
            if cpu.pend_sv_pending && cpu.can_run(PENDSV_PRIORITY.value()) {
                best = Some((PENDSV_PRIORITY.value(), None));
            }
            for (slot, pended) in cpu.pended_irqs.iter().enumerate() {
                if let Some(irq) = pended {
                    if cpu.can_run(irq.priority) {
                        let better = match best {
                            None => true,
                            Some((priority, _)) => {
                                SimCpu::masked(irq.priority) < SimCpu::masked(priority)
                            }
                        };
                        if better {
                            best = Some((irq.priority, Some(slot)));
                        }
                    }
                }
            }

            match best {
                None => None,
                Some((priority, None)) => {
                    cpu.pend_sv_pending = false;
                    let depth = cpu.depth;
                    cpu.active[depth] = priority;
                    cpu.depth += 1;
                    Some(Job::PendSv)
                }
                Some((priority, Some(slot))) => {
                    let irq = cpu.pended_irqs[slot].take();
                    let depth = cpu.depth;
                    cpu.active[depth] = priority;
                    cpu.depth += 1;
                    irq.map(Job::Irq)
                }
            }
        };

        match job {
            None => break,
            Some(Job::PendSv) => execute_pend_sv(),
            Some(Job::Irq(irq)) => (irq.handler)(),
        }

        let mut cpu = CPU.lock();
        cpu.depth -= 1;
    }
}

/// Mirrors the pend-switch entry stub: the kernel is masked out while
/// the handler runs and the returned mask is applied on the way out.
fn execute_pend_sv() {
    let psp = {
        let mut cpu = CPU.lock();
        cpu.basepri = SERVICE_CALL_PRIORITY.value();
        cpu.psp
    };
    let (stack_pointer, mask) = sched::pend_sv_handler(psp as *mut u32);
    let mut cpu = CPU.lock();
    cpu.psp = stack_pointer as usize;
    cpu.basepri = mask;
}

/// Mirrors the synchronous `svc` instruction: the handler runs
/// immediately at the service call priority, then anything it pended
/// drains.
fn service_call(number: u8, arg0: usize, arg1: usize, arg2: usize) {
    let is_thread = CPU.lock().depth == 0;
    enter_exception(SERVICE_CALL_PRIORITY.value());
    sched::service_call_handler(arg0, arg1, arg2, number, is_thread);
    exit_exception();
}

// ----- the port surface, as the kernel sees it -----

pub fn core_type_supported() -> bool {
    true
}

pub fn core_clock() -> u32 {
    CPU.lock().core_clock
}

pub fn set_basepri(priority: IsrPriority) -> IsrPriority {
    let previous = {
        let mut cpu = CPU.lock();
        let previous = cpu.basepri;
        cpu.basepri = SimCpu::masked(priority.value());
        previous
    };
    run_pending();
    IsrPriority::new(previous)
}

pub fn disable_interrupts() {
    CPU.lock().primask = true;
}

pub fn enable_interrupts() {
    CPU.lock().primask = false;
    run_pending();
}

pub fn primask_active() -> bool {
    CPU.lock().primask
}

pub fn is_thread_mode() -> bool {
    CPU.lock().depth == 0
}

pub fn current_priority() -> Option<IsrPriority> {
    let cpu = CPU.lock();
    if cpu.depth == 0 {
        None
    } else {
        Some(IsrPriority::new(cpu.active[cpu.depth - 1]))
    }
}

pub fn trigger_pend_sv() {
    CPU.lock().pend_sv_pending = true;
    run_pending();
}

pub fn clear_pend_sv() {
    CPU.lock().pend_sv_pending = false;
}

pub fn install_kernel_handlers() {
    CPU.lock().handlers_installed = true;
}

pub fn enable_systick(reload: u32) {
    let mut cpu = CPU.lock();
    cpu.systick_enabled = true;
    cpu.systick_reload = reload;
}

pub fn swap_to_process_stack() {
    let mut cpu = CPU.lock();
    cpu.process_stack = true;
    cpu.psp = cpu.msp;
}

pub fn wfi() {}

pub fn nop() {}

pub fn breakpoint() {
    panic!("breakpoint trap");
}

pub fn svc_terminate(task: *mut TaskControlBlock) {
    service_call(SVC_TERMINATE, task as usize, 0, 0);
}

pub fn svc_sleep(ticks: i32) {
    service_call(SVC_SLEEP, ticks as u32 as usize, 0, 0);
}

pub fn svc_switch() {
    service_call(SVC_SWITCH, 0, 0, 0);
}

pub fn svc_wait(
    condition: *const ConditionVariable,
    timeout: i32,
    mutex: *const PriorityMutex,
) -> u32 {
    service_call(
        SVC_WAIT,
        condition as usize,
        timeout as u32 as usize,
        mutex as usize,
    );
    // The real status is delivered through the blocked task's saved
    // frame; see the module docs.
    0
}

// ----- the driver surface, for tests -----

/// Serializes simulator users and resets the kernel, the hooks and the
/// simulated CPU. Hold the returned handle for the duration of the test.
pub fn take() -> SimHandle {
    let guard = DRIVER.lock();
    *CPU.lock() = SimCpu::new();
    sched::reset_kernel();
    hooks::reset_hooks();
    SimHandle { _guard: guard }
}

/// Exclusive use of the simulator; dropping it lets the next test in.
pub struct SimHandle {
    _guard: spin::MutexGuard<'static, ()>,
}

/// The fake tick driver: delivers `span` worth of tick interrupts, one
/// at a time, letting any released task switch in between.
pub fn advance(span: Duration) {
    for _ in 0..span.ticks() {
        trap_assert!(CPU.lock().systick_enabled);
        enter_exception(SYSTICK_PRIORITY.value());
        sched::tick_handler();
        exit_exception();
    }
}

/// Runs `handler` as an interrupt service routine at `priority`,
/// draining whatever it pended before returning, like the real exception
/// return would.
pub fn run_isr(priority: IsrPriority, handler: impl FnOnce()) {
    enter_exception(priority.value());
    handler();
    exit_exception();
}

/// Raises an interrupt at `priority`. When the masking state allows it
/// runs immediately; otherwise it stays pending until unmasked, like a
/// pended NVIC line.
pub fn raise_irq(priority: IsrPriority, handler: fn()) {
    let run_now = CPU.lock().can_run(priority.value());
    if run_now {
        run_isr(priority, handler);
    } else {
        let mut cpu = CPU.lock();
        let slot = cpu.pended_irqs.iter().position(|slot| slot.is_none());
        match slot {
            Some(slot) => {
                cpu.pended_irqs[slot] = Some(PendedIrq {
                    priority: priority.value(),
                    handler,
                })
            }
            None => trap_assert!(false),
        }
    }
}

/// The wait status the kernel last wrote into `task`'s saved frame.
pub fn wait_status(task: &TaskControlBlock) -> WaitStatus {
    WaitStatus::from_raw(task.saved_return_value())
}

/// The simulated process stack pointer.
pub fn current_stack_pointer() -> *mut u32 {
    CPU.lock().psp as *mut u32
}

/// Overrides the simulated core clock, 16 MHz by default.
pub fn set_core_clock(hz: u32) {
    CPU.lock().core_clock = hz;
}

/// The SysTick reload value the scheduler programmed, in core cycles per
/// tick.
pub fn systick_reload() -> u32 {
    CPU.lock().systick_reload
}

/// Whether the scheduler programmed the kernel exception priorities.
pub fn kernel_handlers_installed() -> bool {
    CPU.lock().handlers_installed
}

/// Whether execution moved to the process stack pointer.
pub fn on_process_stack() -> bool {
    CPU.lock().process_stack
}

/// The simulated BASEPRI value, for assertions on masking state.
pub fn basepri_value() -> u8 {
    CPU.lock().basepri
}

pub use crate::sched::introspect;
