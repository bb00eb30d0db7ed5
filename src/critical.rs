//! The critical section token.
//!
//! While a valid token is alive the scheduler will not change the running
//! task; no interrupt is masked. The scheduler mints at most one valid
//! token at a time, further requests yield inert ones so that nested
//! sections release exactly once, when the valid token goes away.

use crate::sched;
use crate::trap_assert;

/// A scope-bound hold on task switching.
///
/// Only [`Scheduler::critical_section`] creates valid tokens. The token is
/// move-only; dropping a valid one releases the hold and performs any
/// task switch that was deferred while it was alive.
///
/// Do not call blocking kernel operations while holding one, with the
/// single exception of a condition variable wait through a mutex.
///
/// [`Scheduler::critical_section`]: crate::Scheduler::critical_section
pub struct CriticalSection {
    valid: bool,
}

impl CriticalSection {
    /// Creates an inert token. It represents no hold and its drop does
    /// nothing.
    pub const fn inert() -> CriticalSection {
        CriticalSection { valid: false }
    }

    pub(crate) const fn new(valid: bool) -> CriticalSection {
        CriticalSection { valid }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    /// Invalidates the token without releasing the hold. Used when the
    /// kernel takes over ownership of the section during a service call.
    pub(crate) fn disable(&mut self) {
        trap_assert!(self.valid);
        self.valid = false;
    }

    /// Moves the token out, leaving an inert one behind.
    pub(crate) fn take(&mut self) -> CriticalSection {
        core::mem::replace(self, CriticalSection::inert())
    }
}

impl Default for CriticalSection {
    fn default() -> CriticalSection {
        CriticalSection::inert()
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if self.valid {
            sched::critical_section_end();
        }
    }
}
