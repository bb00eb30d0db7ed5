//! The condition variable.
//!
//! Waiters queue in priority order and are released by `notify_one` or
//! `notify_all`, or by their deadline when they waited with one. Notify
//! runs under an internal notifier mutex so that tasks and interrupt
//! service routines can notify concurrently. There are no spurious
//! wakeups: a wait returns because of a matching notify or a real
//! timeout, never otherwise, so there is no predicate-loop variant.
//!
//! Only tasks may wait. Waiting from an interrupt service routine is not
//! allowed in any form.

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::config::{Mutex, PREEMPTION_BITS, SERVICE_CALL_PRIORITY};
use crate::hooks::hooks;
use crate::list::{TaskList, Waiting};
use crate::priority::IsrPriority;
use crate::sched;
use crate::task::TaskControlBlock;
use crate::time::{Duration, Instant};
use crate::trap_assert;

/// The result of a wait with a deadline.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitStatus {
    /// The wait was released by a notify.
    Notified = 0,
    /// The deadline elapsed before any notify arrived.
    TimedOut = 1,
}

impl WaitStatus {
    pub(crate) fn from_raw(raw: u32) -> WaitStatus {
        trap_assert!(raw <= 1);
        if raw == 0 {
            WaitStatus::Notified
        } else {
            WaitStatus::TimedOut
        }
    }
}

/// A condition variable with priority-ordered waiters.
pub struct ConditionVariable {
    mutex: Mutex,
    waiters: UnsafeCell<TaskList<Waiting>>,
}

// The waiter list is only touched at the service call priority; the
// notifier mutex serializes notify against notify.
unsafe impl Sync for ConditionVariable {}

impl ConditionVariable {
    /// Creates a condition variable whose notifiers synchronize at
    /// `notifier_priority`, or with a task-only critical section when no
    /// priority is given.
    pub const fn new(notifier_priority: Option<IsrPriority>) -> ConditionVariable {
        ConditionVariable {
            mutex: Mutex::new(notifier_priority),
            waiters: UnsafeCell::new(TaskList::new()),
        }
    }

    /// Releases the most urgent waiter, if there is one.
    pub fn notify_one(&self) {
        self.assert_notifier_priority();

        self.mutex.lock();
        hooks().condition_notify_one(self);
        let waiter = unsafe { (*self.waiters.get()).front() };
        if !waiter.is_null() {
            sched::wake(waiter, self);
        }
        self.mutex.unlock();
    }

    /// Releases every waiter.
    pub fn notify_all(&self) {
        self.assert_notifier_priority();

        self.mutex.lock();
        hooks().condition_notify_all(self);
        loop {
            let waiter = unsafe { (*self.waiters.get()).front() };
            if waiter.is_null() {
                break;
            }
            sched::wake(waiter, self);
        }
        self.mutex.unlock();
    }

    /// Waits until notified, with no deadline and no mutex.
    pub fn wait(&self) {
        self.assert_waiter_context();
        arch::svc_wait(self, -1, ptr::null());
    }

    /// Atomically releases `mutex` and waits until notified. The mutex is
    /// re-acquired, with its full ceiling effect, before the task runs
    /// again.
    pub fn wait_with(&self, mutex: &Mutex) {
        self.assert_waiter_context();
        arch::svc_wait(self, -1, mutex);
    }

    /// Waits until notified or until `timeout` has elapsed.
    pub fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.assert_waiter_context();
        WaitStatus::from_raw(arch::svc_wait(self, timeout.ticks(), ptr::null()))
    }

    /// Atomically releases `mutex` and waits until notified or until
    /// `timeout` has elapsed. The mutex is re-acquired before the task
    /// runs again, whichever way the wait ends.
    pub fn wait_for_with(&self, mutex: &Mutex, timeout: Duration) -> WaitStatus {
        self.assert_waiter_context();
        WaitStatus::from_raw(arch::svc_wait(self, timeout.ticks(), mutex))
    }

    /// Waits until notified or until `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> WaitStatus {
        self.wait_for(deadline - sched::Scheduler::now())
    }

    /// Atomically releases `mutex` and waits until notified or until
    /// `deadline`.
    pub fn wait_until_with(&self, mutex: &Mutex, deadline: Instant) -> WaitStatus {
        self.wait_for_with(mutex, deadline - sched::Scheduler::now())
    }

    pub(crate) unsafe fn add_waiting(&self, task: *mut TaskControlBlock) {
        (*self.waiters.get()).insert_when(TaskControlBlock::priority_is_lower, task);
    }

    pub(crate) unsafe fn remove_waiting(&self, task: *mut TaskControlBlock) {
        (*self.waiters.get()).remove(task);
    }

    /// The number of queued waiters; a host test helper.
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    pub fn waiter_count(&self) -> usize {
        unsafe { (*self.waiters.get()).iter().count() }
    }

    /// A notifier more urgent than the notifier mutex ceiling could slip
    /// between the lock and the waiter list walk, and the ceiling itself
    /// must not outrank the service call the wake goes through.
    fn assert_notifier_priority(&self) {
        let ceiling = self
            .mutex
            .priority()
            .unwrap_or(SERVICE_CALL_PRIORITY)
            .masked_value(PREEMPTION_BITS);
        trap_assert!(
            ceiling
                >= arch::current_priority()
                    .unwrap_or(SERVICE_CALL_PRIORITY)
                    .masked_value(PREEMPTION_BITS)
        );
        trap_assert!(ceiling >= SERVICE_CALL_PRIORITY.masked_value(PREEMPTION_BITS));
    }

    fn assert_waiter_context(&self) {
        trap_assert!(arch::is_thread_mode());
        trap_assert!(
            self.mutex
                .priority()
                .unwrap_or(SERVICE_CALL_PRIORITY)
                .masked_value(PREEMPTION_BITS)
                >= SERVICE_CALL_PRIORITY.masked_value(PREEMPTION_BITS)
        );
    }
}
