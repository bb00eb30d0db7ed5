//! Kernel tracing hooks.
//!
//! Every significant kernel transition calls into a process-wide
//! [`Hooks`] implementation. The default implementation is empty, so an
//! ordinary build carries no tracing cost beyond the indirect calls. A
//! monitoring integration registers its own implementation with
//! [`set_hooks`] before the scheduler starts.

use crate::condvar::ConditionVariable;
use crate::priority::IsrPriority;
use crate::task::TaskControlBlock;
use crate::time::{Duration, Instant};

/// Methods called by the kernel at significant transitions. All have
/// empty default bodies, implement only what the tracer needs.
pub trait Hooks: Sync {
    /// The scheduler is starting, with the core clock in hertz.
    fn starting(&self, _core_clock: u32) {}

    /// Entering the context switch handler.
    fn enter_pend_sv(&self) {}

    /// The system is going idle, there is no task ready to run.
    fn enter_idle(&self) {}

    /// Entering the tick handler.
    fn enter_tick(&self) {}

    /// Exiting the tick handler; `switch` tells whether a task switch was
    /// requested.
    fn exit_tick(&self, _switch: bool) {}

    /// Entering the service call handler.
    fn enter_service_call(&self) {}

    /// Exiting the service call handler; `switch` tells whether a task
    /// switch was requested.
    fn exit_service_call(&self, _switch: bool) {}

    /// A task was added to the active set.
    fn task_added(&self, _task: &TaskControlBlock) {}

    /// A task was terminated and removed from the active set.
    fn task_terminated(&self, _task: &TaskControlBlock) {}

    /// A task is being given the processor.
    fn task_started(&self, _task: &TaskControlBlock) {}

    /// A task is being taken off the processor.
    fn task_stopped(&self, _task: &TaskControlBlock) {}

    /// A task was put to sleep.
    fn task_sleep(&self, _task: &TaskControlBlock) {}

    /// A task starts waiting on a condition variable without a deadline.
    fn task_wait(&self, _task: &TaskControlBlock, _condition: &ConditionVariable) {}

    /// A task starts waiting on a condition variable with a deadline.
    fn task_wait_timeout(
        &self,
        _task: &TaskControlBlock,
        _condition: &ConditionVariable,
        _deadline: Instant,
    ) {
    }

    /// A task became ready to run.
    fn task_ready(&self, _task: &TaskControlBlock) {}

    /// A task name changed.
    fn task_name_changed(&self, _task: &TaskControlBlock) {}

    /// A task priority changed.
    fn task_priority_changed(&self, _task: &TaskControlBlock) {}

    /// A critical section was entered, task switching is suspended.
    fn enter_critical_section(&self) {}

    /// The critical section ended, task switching is allowed again.
    fn exit_critical_section(&self) {}

    /// The kernel stored a mutex to re-acquire for a waiting task.
    fn mutex_stored(&self, _task: &TaskControlBlock) {}

    /// The kernel re-acquired a stored mutex for a resuming task.
    fn mutex_restored(&self, _task: &TaskControlBlock) {}

    /// A full lock was entered, all interrupts are masked.
    fn enter_full_lock(&self) {}

    /// The full lock was released.
    fn exit_full_lock(&self) {}

    /// A priority lock was entered, interrupts up to the given priority
    /// are masked.
    fn enter_priority_lock(&self, _priority: IsrPriority) {}

    /// The priority lock was released.
    fn exit_priority_lock(&self) {}

    /// A task starts waiting on the condition variable, with the timeout
    /// when there is one.
    fn condition_start_waiting(
        &self,
        _condition: &ConditionVariable,
        _task: &TaskControlBlock,
        _timeout: Option<Duration>,
    ) {
    }

    /// A condition variable notifies its most urgent waiter.
    fn condition_notify_one(&self, _condition: &ConditionVariable) {}

    /// A condition variable notifies all its waiters.
    fn condition_notify_all(&self, _condition: &ConditionVariable) {}
}

struct NullHooks;

impl Hooks for NullHooks {}

static NULL_HOOKS: NullHooks = NullHooks;

static mut HOOKS: &'static dyn Hooks = &NULL_HOOKS;

/// Registers the process-wide hooks implementation.
///
/// Call once, before the scheduler starts and before any task or
/// synchronization primitive is used.
pub fn set_hooks(hooks: &'static dyn Hooks) {
    unsafe {
        *core::ptr::addr_of_mut!(HOOKS) = hooks;
    }
}

pub(crate) fn hooks() -> &'static dyn Hooks {
    unsafe { *core::ptr::addr_of!(HOOKS) }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub(crate) fn reset_hooks() {
    unsafe {
        *core::ptr::addr_of_mut!(HOOKS) = &NULL_HOOKS;
    }
}
