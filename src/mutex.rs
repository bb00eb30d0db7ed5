//! The priority mutex.
//!
//! A hybrid lock built from two ingredients: a critical section for task
//! versus task exclusion, and interrupt masking up to a ceiling priority
//! for interrupt service routine exclusion. Which ingredients apply
//! depends on the ceiling the mutex was built with and on the context the
//! lock is taken from.
//!
//! `lock` and `unlock` cannot fail and never spin.

use core::cell::{Cell, UnsafeCell};
use core::ptr;

use crate::arch;
use crate::config::PREEMPTION_BITS;
use crate::critical::CriticalSection;
use crate::hooks::hooks;
use crate::priority::IsrPriority;
use crate::sched::Scheduler;
use crate::trap_assert;

/// A mutual exclusion lock for data shared between tasks and interrupt
/// service routines.
///
/// * No ceiling: a plain critical section, task versus task exclusion
///   only. Lock from task context only.
/// * Ceiling 0: a full lock, every interrupt is masked while held.
/// * Any other ceiling: interrupts at or below the ceiling urgency are
///   masked while held; from task context a critical section is taken as
///   well. An interrupt service routine may take the lock only when its
///   own priority is not more urgent than the ceiling.
///
/// Non-reentrant, move-only.
pub struct PriorityMutex {
    locked: Cell<bool>,
    previous_lock: Cell<IsrPriority>,
    critical_section: UnsafeCell<CriticalSection>,
    priority: Option<IsrPriority>,
}

// Interior state is only touched under the exclusion the mutex itself
// establishes (critical section or raised mask).
unsafe impl Sync for PriorityMutex {}

impl PriorityMutex {
    /// Creates a mutex locking interrupts up to `priority`, or tasks only
    /// when no priority is given. Use priority value 0 for a full lock.
    pub const fn new(priority: Option<IsrPriority>) -> PriorityMutex {
        PriorityMutex {
            locked: Cell::new(false),
            previous_lock: Cell::new(IsrPriority::new(0)),
            critical_section: UnsafeCell::new(CriticalSection::inert()),
            priority,
        }
    }

    /// The ceiling this mutex locks, or `None` for task-only exclusion.
    pub const fn priority(&self) -> Option<IsrPriority> {
        self.priority
    }

    /// Takes the lock.
    pub fn lock(&self) {
        match self.priority {
            Some(ceiling) if ceiling.value() == 0 => {
                trap_assert!(!arch::primask_active());
                hooks().enter_full_lock();
                arch::disable_interrupts();
            }
            Some(ceiling) => {
                if arch::is_thread_mode() {
                    self.store_critical_section(Scheduler::critical_section());
                } else {
                    // An interrupt more urgent than the ceiling cannot
                    // participate in the exclusion.
                    trap_assert!(
                        arch::current_priority()
                            .unwrap_or(IsrPriority::new(0))
                            .masked_value(PREEMPTION_BITS)
                            >= ceiling.masked_value(PREEMPTION_BITS)
                    );
                }
                hooks().enter_priority_lock(ceiling);
                let previous =
                    arch::set_basepri(IsrPriority::new(ceiling.masked_value(PREEMPTION_BITS)));
                self.previous_lock.set(previous);
                trap_assert!(
                    previous.masked_value(PREEMPTION_BITS) <= ceiling.masked_value(PREEMPTION_BITS)
                );
            }
            None => {
                trap_assert!(arch::is_thread_mode());
                self.store_critical_section(Scheduler::critical_section());
            }
        }
        self.locked.set(true);
    }

    /// Releases the lock. Does nothing when the mutex is not locked.
    pub fn unlock(&self) {
        if !self.locked.get() {
            return;
        }
        self.locked.set(false);

        match self.priority {
            Some(ceiling) if ceiling.value() == 0 => {
                trap_assert!(arch::primask_active());
                arch::enable_interrupts();
                hooks().exit_full_lock();
            }
            Some(ceiling) => {
                let was = arch::set_basepri(self.previous_lock.get());
                trap_assert!(
                    was.masked_value(PREEMPTION_BITS) == ceiling.masked_value(PREEMPTION_BITS)
                );
                hooks().exit_priority_lock();
                let _section = unsafe { (*self.critical_section.get()).take() };
            }
            None => {
                trap_assert!(arch::is_thread_mode());
                let _section = unsafe { (*self.critical_section.get()).take() };
            }
        }
    }

    /// Restores the interrupt mask while leaving the critical section
    /// with the scheduler. Called from the service call handler when the
    /// holding task enters a condition variable wait.
    pub(crate) fn release_from_service_call(&self) {
        trap_assert!(self.locked.get());

        if let Some(ceiling) = self.priority {
            if ceiling.value() == 0 {
                trap_assert!(arch::primask_active());
                arch::enable_interrupts();
            } else {
                let was = arch::set_basepri(self.previous_lock.get());
                trap_assert!(
                    was.masked_value(PREEMPTION_BITS) == ceiling.masked_value(PREEMPTION_BITS)
                );
            }
        }
    }

    /// Re-acquires the lock on behalf of a resuming task, consuming the
    /// critical section the scheduler minted. Returns the masked ceiling
    /// for the switch epilogue to write into the interrupt mask register
    /// on exception return. Called from the context switch handler only.
    pub(crate) fn relock_from_pend_sv(&self, section: CriticalSection) -> u8 {
        self.store_critical_section(section);

        if let Some(ceiling) = self.priority {
            // A full lock cannot be held across a wait, the kernel could
            // not have preempted it in the first place.
            trap_assert!(ceiling.value() != 0);
            self.previous_lock.set(IsrPriority::new(0));
        }

        self.locked.set(true);
        self.priority
            .unwrap_or(IsrPriority::new(0))
            .masked_value(PREEMPTION_BITS)
    }

    /// Invalidates the stored critical section without releasing it; the
    /// scheduler owns the flag for the rest of the service call.
    pub(crate) fn forget_critical_section(&self) {
        unsafe { (*self.critical_section.get()).disable() }
    }

    fn store_critical_section(&self, section: CriticalSection) {
        unsafe {
            trap_assert!(!(*self.critical_section.get()).is_valid());
            ptr::write(self.critical_section.get(), section);
        }
    }
}
