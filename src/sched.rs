//! The scheduler.
//!
//! Owns every piece of process-wide kernel state: the tick counter, the
//! all-tasks list, the ready queue, the timeout queue, the
//! current/next/previous task pointers and the critical section flag.
//!
//! Three handlers drive it. The service call handler is the single entry
//! point for every blocking operation, so all of them execute at one
//! known priority. The tick handler advances time and releases expired
//! timed waits. The pend-switch handler, at the lowest priority that
//! exists, performs the actual stack swap once everything else has had
//! its say. Any other code path that needs to touch kernel state first
//! raises the interrupt mask to the service call priority, which makes
//! every mutation totally ordered with respect to the handlers.
//!
//! Tasks are not time sliced: a task runs until it blocks, yields, or a
//! more urgent task becomes ready.

use num_integer::Integer;

use crate::arch;
use crate::condvar::{ConditionVariable, WaitStatus};
use crate::config::{SERVICE_CALL_PRIORITY, SYSTICK_PRIORITY, TICKS_PER_SECOND};
use crate::critical::CriticalSection;
use crate::hooks::hooks;
use crate::list::{Handle, TaskList, Timeout, Waiting};
use crate::mutex::PriorityMutex;
use crate::priority::{IsrPriority, Priority};
use crate::task::{IdleTaskControlBlock, TaskControlBlock};
use crate::time::{Duration, Instant, STARTUP};
use crate::trap::TrapUnwrap;
use crate::trap_assert;

/// The service call numbers, encoded as the immediate of the `svc`
/// instruction.
pub(crate) const SVC_TERMINATE: u8 = 0;
pub(crate) const SVC_SLEEP: u8 = 1;
pub(crate) const SVC_SWITCH: u8 = 2;
pub(crate) const SVC_WAIT: u8 = 3;

/// The process-wide kernel record.
pub(crate) struct Kernel {
    is_started: bool,
    ticks: Instant,
    idling: bool,
    may_need_switch: bool,
    critical_section: bool,
    all_tasks: TaskList<Handle>,
    timeouts: TaskList<Timeout>,
    ready: TaskList<Waiting>,
    idle: *const IdleTaskControlBlock,
    previous_task: *mut TaskControlBlock,
    current_task: *mut TaskControlBlock,
    next_task: *mut TaskControlBlock,
}

impl Kernel {
    const fn new() -> Kernel {
        Kernel {
            is_started: false,
            ticks: STARTUP,
            idling: false,
            may_need_switch: false,
            critical_section: false,
            all_tasks: TaskList::new(),
            timeouts: TaskList::new(),
            ready: TaskList::new(),
            idle: core::ptr::null(),
            previous_task: core::ptr::null_mut(),
            current_task: core::ptr::null_mut(),
            next_task: core::ptr::null_mut(),
        }
    }
}

static mut KERNEL: Kernel = Kernel::new();

pub(crate) fn kernel() -> &'static mut Kernel {
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub(crate) fn reset_kernel() {
    unsafe {
        core::ptr::addr_of_mut!(KERNEL).write(Kernel::new());
    }
}

/// The scheduler. All state is process-wide, the type is only a
/// namespace.
pub struct Scheduler;

impl Scheduler {
    /// Starts the scheduler with `idle` as the idle task.
    ///
    /// From this point on the most urgent started task runs; the calling
    /// context is abandoned at the first task switch. Returns `false`
    /// when the scheduler was already started.
    pub fn start(idle: &'static IdleTaskControlBlock) -> bool {
        trap_assert!(arch::core_type_supported());

        let k = kernel();
        if k.is_started {
            return false;
        }
        k.is_started = true;

        let core_clock = arch::core_clock();
        idle.prime_stack();
        k.idle = idle;

        arch::install_kernel_handlers();

        // An exact tick requires the core clock to divide evenly.
        let (reload, remainder) = core_clock.div_rem(&TICKS_PER_SECOND);
        trap_assert!(remainder == 0);
        arch::enable_systick(reload);

        hooks().starting(core_clock);

        // Move to the process stack and give the main stack back to the
        // exception handlers.
        arch::swap_to_process_stack();

        do_switch()
    }

    /// The current time, in ticks since the scheduler started.
    pub fn now() -> Instant {
        let k = kernel();
        trap_assert!(k.is_started);
        // Reading the tick is only sound where the tick handler cannot
        // slice the read.
        trap_assert!(
            arch::current_priority()
                .unwrap_or(IsrPriority::new(0xFF))
                .value()
                >= SYSTICK_PRIORITY.value()
        );
        k.ticks
    }

    /// Asks for a hold on task switching. The returned token is valid
    /// when no other critical section is active, inert otherwise; either
    /// way the hold ends when the one valid token is dropped.
    ///
    /// Use this for task versus task exclusion only. A
    /// [`PriorityMutex`](crate::PriorityMutex) also synchronizes against
    /// interrupt service routines.
    pub fn critical_section() -> CriticalSection {
        let k = kernel();
        if k.critical_section {
            CriticalSection::new(false)
        } else {
            hooks().enter_critical_section();
            k.critical_section = true;
            CriticalSection::new(true)
        }
    }

    /// Iterates over every started task.
    pub fn all_tasks() -> AllTasks {
        trap_assert!(kernel().is_started);
        AllTasks {
            iter: kernel().all_tasks.iter(),
        }
    }

    /// The task currently holding the processor, `None` while idling or
    /// mid-switch.
    pub fn current() -> Option<&'static TaskControlBlock> {
        let current = kernel().current_task;
        if current.is_null() {
            None
        } else {
            Some(unsafe { &*current })
        }
    }
}

/// An iterator over every started task.
pub struct AllTasks {
    iter: crate::list::ListIter<Handle>,
}

impl Iterator for AllTasks {
    type Item = &'static TaskControlBlock;

    fn next(&mut self) -> Option<&'static TaskControlBlock> {
        self.iter.next().map(|task| unsafe { &*task })
    }
}

pub(crate) fn current_task_pointer() -> *mut TaskControlBlock {
    kernel().current_task
}

/// Ascending deadline order for the timeout queue.
fn wakeup_after(left: &TaskControlBlock, right: &TaskControlBlock) -> bool {
    left.wait_until.get().trap_unwrap() < right.wait_until.get().trap_unwrap()
}

/// Publishes a freshly started task and reschedules when the scheduler
/// already runs.
pub(crate) fn add_task(task: *mut TaskControlBlock) {
    let previous = arch::set_basepri(SERVICE_CALL_PRIORITY);
    let k = kernel();
    unsafe {
        hooks().task_added(&*task);
        k.all_tasks.push_front(task);
        k.ready.insert_when(TaskControlBlock::priority_is_lower, task);
    }
    if k.is_started {
        k.may_need_switch = false;
        do_switch();
    }
    arch::set_basepri(previous);
}

/// Re-evaluates which task should run, under the mask already raised to
/// the service call priority.
fn trigger_soft_switch() {
    let previous = arch::set_basepri(SERVICE_CALL_PRIORITY);
    kernel().may_need_switch = false;
    // A mutex ceiling above the switch request would deadlock it.
    trap_assert!(previous.value() == 0);
    do_switch();
    arch::set_basepri(previous);
}

/// The core switch decision. Returns whether a hardware switch was
/// requested.
///
/// Inside a critical section nothing happens beyond noting that a switch
/// may be due; the note is honored when the section ends.
pub(crate) fn do_switch() -> bool {
    let k = kernel();
    trap_assert!(k.is_started);
    trap_assert!(!k.current_task.is_null() || !k.critical_section);

    if k.critical_section {
        k.may_need_switch = true;
        return false;
    }

    unsafe {
        // A candidate that was promoted but never ran competes again.
        if !k.next_task.is_null() {
            trap_assert!(k.current_task != k.next_task);
            k.ready
                .insert_when(TaskControlBlock::priority_is_lower, k.next_task);
            k.next_task = core::ptr::null_mut();
        }

        let current = k.current_task;
        if !current.is_null() {
            k.ready
                .insert_when(TaskControlBlock::priority_is_lower, current);
            k.current_task = core::ptr::null_mut();
        }

        if k.ready.is_empty() {
            // Nothing to run; the switch handler will enter idle.
            arch::trigger_pend_sv();
            true
        } else {
            k.next_task = k.ready.pop_front();
            if k.next_task == current {
                // Still the best choice, keep running it without a switch.
                k.current_task = k.next_task;
                k.next_task = core::ptr::null_mut();
                false
            } else {
                arch::trigger_pend_sv();
                true
            }
        }
    }
}

/// Releases a waiter on behalf of a condition variable notify. Runs with
/// the mask raised to the service call priority, under the condition
/// variable's notifier mutex.
pub(crate) fn wake(task: *mut TaskControlBlock, condition: &ConditionVariable) {
    let previous = arch::set_basepri(SERVICE_CALL_PRIORITY);
    let k = kernel();

    unsafe {
        trap_assert!((*task).waiting.get() == condition as *const ConditionVariable);

        condition.remove_waiting(task);
        (*task).waiting.set(core::ptr::null());
        (*task).set_return_value(WaitStatus::Notified as u32);

        // A timed wait also sits in the timeout queue.
        if (*task).wait_until.get().is_some() {
            (*task).wait_until.set(None);
            k.timeouts.remove(task);
        }

        k.ready.insert_when(TaskControlBlock::priority_is_lower, task);
    }

    do_switch();
    arch::set_basepri(previous);
}

/// Applies a priority change, re-sorting whichever queue the task sits
/// in and rescheduling when the change matters right now.
pub(crate) fn update_priority(task: *mut TaskControlBlock, new_priority: Priority) {
    let previous = arch::set_basepri(SERVICE_CALL_PRIORITY);
    let k = kernel();

    unsafe {
        (*task).priority.set(new_priority);
        if (*task).is_started() {
            if task == k.current_task || task == k.next_task {
                // Compare against the ready queue again.
                do_switch();
            } else if !(*task).waiting.get().is_null() {
                let condition = (*task).waiting.get();
                (*condition).remove_waiting(task);
                (*condition).add_waiting(task);
            } else if (*task).wait_until.get().is_none() {
                // Neither running, waiting nor sleeping, so it is ready.
                k.ready.remove(task);
                k.ready.insert_when(TaskControlBlock::priority_is_lower, task);
                if k.ready.front() == task {
                    do_switch();
                }
            }
        }
        hooks().task_priority_changed(&*task);
    }

    arch::set_basepri(previous);
}

/// The tick handler. Advances time and releases every timed wait whose
/// deadline has passed; a wait that also sat on a condition variable is
/// released with the timeout status.
pub(crate) fn tick_handler() {
    hooks().enter_tick();
    let k = kernel();
    k.ticks += Duration::from_ticks(1);

    let mut dirty = false;

    loop {
        let head = k.timeouts.front();
        if head.is_null() {
            break;
        }
        unsafe {
            if (*head).wait_until.get().trap_unwrap() > k.ticks {
                break;
            }
            k.timeouts.pop_front();
            (*head).wait_until.set(None);

            let condition = (*head).waiting.get();
            if !condition.is_null() {
                (*condition).remove_waiting(head);
                (*head).waiting.set(core::ptr::null());
                (*head).set_return_value(WaitStatus::TimedOut as u32);
            }

            k.ready.insert_when(TaskControlBlock::priority_is_lower, head);
            hooks().task_ready(&*head);
        }
        dirty = true;
    }

    if dirty {
        hooks().exit_tick(do_switch());
    } else {
        hooks().exit_tick(false);
    }
}

/// The pend-switch handler. Entered with the outgoing stack pointer,
/// returns the incoming stack pointer and the interrupt mask to apply on
/// exception return (the re-acquired mutex ceiling, or zero).
///
/// On entry either a next task has been promoted or the system goes
/// idle.
pub(crate) fn pend_sv_handler(psp: *mut u32) -> (*mut u32, u8) {
    hooks().enter_pend_sv();
    arch::clear_pend_sv();

    let k = kernel();

    unsafe {
        if !k.previous_task.is_null() {
            (*k.previous_task).stack_pointer.set(psp);
            hooks().task_stopped(&*k.previous_task);
        }

        if k.idling {
            (*k.idle).stack_pointer.set(psp);
        }

        if k.next_task.is_null() {
            k.idling = true;
            k.previous_task = core::ptr::null_mut();
            hooks().enter_idle();
            ((*k.idle).stack_pointer.get(), 0)
        } else {
            k.idling = false;
            k.previous_task = k.next_task;
            k.current_task = k.next_task;
            k.next_task = core::ptr::null_mut();

            let task = k.current_task;
            (*task).last_started.set(k.ticks);

            let mut mask = 0u8;
            let mutex = (*task).mutex.get();
            if !mutex.is_null() {
                // Re-acquire the mutex stored across a wait; the ceiling
                // is applied by the switch epilogue on exception return.
                mask = (*mutex).relock_from_pend_sv(CriticalSection::new(true));
                k.critical_section = true;
                (*task).mutex.set(core::ptr::null());
                hooks().mutex_restored(&*task);
            }

            trap_assert!((*task).is_started());
            hooks().task_started(&*task);
            ((*task).stack_pointer.get(), mask)
        }
    }
}

/// The service call handler. `arg0` to `arg2` come from the first three
/// argument slots of the interrupted frame.
pub(crate) fn service_call_handler(
    arg0: usize,
    arg1: usize,
    arg2: usize,
    number: u8,
    is_thread: bool,
) {
    hooks().enter_service_call();
    let k = kernel();
    let mut task_switch = false;

    match number {
        SVC_TERMINATE => {
            let task = arg0 as *mut TaskControlBlock;
            trap_assert!(!task.is_null());
            trap_assert!(task != k.next_task);

            unsafe {
                // The flag may already have flipped back; only the winner
                // tears the task down.
                if (*task).active.swap(false, core::sync::atomic::Ordering::SeqCst) {
                    k.all_tasks.remove(task);

                    if (*task).wait_until.get().is_some() {
                        k.timeouts.remove(task);
                        (*task).wait_until.set(None);
                    }

                    if !(*task).waiting.get().is_null() {
                        (*(*task).waiting.get()).remove_waiting(task);
                        (*task).waiting.set(core::ptr::null());
                    } else if TaskList::<Waiting>::is_linked(task) {
                        // Queued but not running: leave the ready queue.
                        k.ready.remove(task);
                    }
                    (*task).mutex.set(core::ptr::null());

                    if task == k.current_task {
                        trap_assert!(!k.critical_section);
                        k.previous_task = core::ptr::null_mut();
                        k.current_task = core::ptr::null_mut();
                        task_switch = do_switch();
                    }
                    hooks().task_terminated(&*task);
                }
            }
        }

        SVC_SLEEP => {
            trap_assert!(is_thread);
            trap_assert!(!k.critical_section);
            trap_assert!(!k.current_task.is_null());

            // One extra tick so at least the requested time elapses.
            let delta = Duration::from_ticks(arg0 as u32 as i32 + 1);
            trap_assert!(delta.ticks() >= 0);

            let current = k.current_task;
            unsafe {
                (*current).wait_until.set(Some(k.ticks + delta));
                k.timeouts.insert_when(wakeup_after, current);
                hooks().task_sleep(&*current);
            }
            k.current_task = core::ptr::null_mut();
            task_switch = do_switch();
        }

        SVC_SWITCH => {
            trap_assert!(is_thread);
            trap_assert!(!k.critical_section);
            task_switch = do_switch();
        }

        SVC_WAIT => {
            trap_assert!(is_thread);
            let condition = arg0 as *const ConditionVariable;
            trap_assert!(!condition.is_null());
            trap_assert!(!k.current_task.is_null());

            let timeout = arg1 as u32 as i32;
            let mutex = arg2 as *const PriorityMutex;
            let current = k.current_task;

            unsafe {
                if timeout >= 0 {
                    let deadline = k.ticks + Duration::from_ticks(timeout);
                    (*current).wait_until.set(Some(deadline));
                    k.timeouts.insert_when(wakeup_after, current);
                    hooks().task_wait_timeout(&*current, &*condition, deadline);
                    hooks().condition_start_waiting(
                        &*condition,
                        &*current,
                        Some(Duration::from_ticks(timeout)),
                    );
                } else {
                    hooks().task_wait(&*current, &*condition);
                    hooks().condition_start_waiting(&*condition, &*current, None);
                }

                if !mutex.is_null() {
                    // The caller held the mutex, so the critical section
                    // flag is set; the kernel takes it over and releases
                    // the interrupt mask part right here.
                    trap_assert!(k.critical_section);
                    (*current).mutex.set(mutex);
                    (*mutex).release_from_service_call();
                    (*mutex).forget_critical_section();
                    k.critical_section = false;
                    hooks().mutex_stored(&*current);
                }

                (*condition).add_waiting(current);
                (*current).waiting.set(condition);
            }
            k.current_task = core::ptr::null_mut();
            task_switch = do_switch();
        }

        _ => {
            trap_assert!(false);
        }
    }

    hooks().exit_service_call(task_switch);
}

/// Ends the one valid critical section; called when its token drops.
pub(crate) fn critical_section_end() {
    let k = kernel();
    trap_assert!(k.critical_section);
    k.critical_section = false;
    hooks().exit_critical_section();
    if k.may_need_switch {
        trigger_soft_switch();
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod introspect {
    //! Kernel state peeks for the host simulation harness.

    use super::kernel;
    use crate::task::TaskControlBlock;

    pub fn is_started() -> bool {
        kernel().is_started
    }

    pub fn is_idling() -> bool {
        kernel().idling
    }

    pub fn in_critical_section() -> bool {
        kernel().critical_section
    }

    pub fn ready_count() -> usize {
        kernel().ready.iter().count()
    }

    pub fn timeout_count() -> usize {
        kernel().timeouts.iter().count()
    }

    pub fn is_ready(task: &TaskControlBlock) -> bool {
        let task = task as *const TaskControlBlock as *mut TaskControlBlock;
        kernel().ready.iter().any(|t| t == task)
    }

    pub fn is_timed(task: &TaskControlBlock) -> bool {
        let task = task as *const TaskControlBlock as *mut TaskControlBlock;
        kernel().timeouts.iter().any(|t| t == task)
    }

    pub fn is_waiting(task: &TaskControlBlock) -> bool {
        !task.waiting.get().is_null()
    }

    pub fn has_deadline(task: &TaskControlBlock) -> bool {
        task.wait_until.get().is_some()
    }

    pub fn saved_stack_pointer(task: &TaskControlBlock) -> *mut u32 {
        task.stack_pointer.get()
    }
}
