/*!
This crate provides `kron`, a preemptive real-time micro-kernel for Cortex-M
microcontrollers.

# Target

**Single-core** Cortex-M4 / M7 systems (`thumbv7em-none-eabi` /
`thumbv7em-none-eabihf`).

# Features

* Fixed-priority preemptive tasks
  * A task is a statically allocated [`Task`] with its own stack, started
    with a closure.
  * The most urgent ready task always runs; equal priorities are served
    oldest first. There is no time slicing: a task runs until it blocks,
    yields or is preempted.
* Synchronization
  * [`PriorityMutex`]: a hybrid of a critical section (task versus task)
    and interrupt masking up to a ceiling priority (task versus interrupt
    service routine).
  * [`ConditionVariable`]: priority-ordered waiters, timed waits, atomic
    mutex release and re-acquire across a wait, no spurious wakeups.
  * [`CriticalSection`]: an RAII hold on task switching that masks no
    interrupt at all.
* A monotonic tick clock driving [`sleep_for`], [`sleep_until`] and every
  timed wait.
* Static allocation only
  * All kernel state lives in statics; there is no heap in the kernel.

Every blocking operation enters the kernel through a synchronous service
call, so all scheduler state changes execute at one known interrupt
priority. The context switch itself happens in the lowest-priority
exception there is, triggered on demand.

# Usage outline

```ignore
#![no_main]
#![no_std]

use cortex_m_rt::entry;
use kron_cortex_m::*;
extern crate panic_semihosting;

static WORKER: Task<256> = Task::new();
static BLINKER: Task<256> = Task::new();
static EVENTS: ConditionVariable = ConditionVariable::new(None);

#[entry]
fn main() -> ! {
    WORKER.start(Callback::new(|| worker()), Some("worker"));
    BLINKER.start(Callback::new(|| blinker()), Some("blinker"));

    Scheduler::start(default_idle());

    loop {} // not reached, the scheduler owns the processor now
}

fn worker() {
    loop {
        EVENTS.wait();
        // handle the event...
    }
}

fn blinker() {
    loop {
        // toggle a pin...
        EVENTS.notify_one();
        sleep_for(Duration::from_millis(500));
    }
}
```

On the host (any non-`arm` target) the kernel compiles against a simulated
CPU instead of the real one, driven through the [`sim`] module; that is
what the test suite uses.
*/

#![no_std]

#[cfg(test)]
extern crate std;

#[doc(hidden)]
pub mod arch;
mod callback;
mod condvar;
mod config;
mod critical;
mod hooks;
mod list;
mod mutex;
mod priority;
mod sched;
mod task;
mod time;
mod trap;

pub use crate::callback::{Callback, DEFAULT_CALLBACK_WORDS};
pub use crate::condvar::{ConditionVariable, WaitStatus};
pub use crate::config::{
    Mutex, KERNEL_PREEMPTION, PENDSV_PRIORITY, PREEMPTION_BITS, PRIORITY_BITS,
    SERVICE_CALL_PRIORITY, SYSTICK_PRIORITY, TICKS_PER_SECOND,
};
pub use crate::critical::CriticalSection;
pub use crate::hooks::{set_hooks, Hooks};
pub use crate::mutex::PriorityMutex;
pub use crate::priority::{IsrPriority, Priority};
pub use crate::sched::{AllTasks, Scheduler};
pub use crate::task::{
    default_idle, IdleTask, IdleTaskControlBlock, StackItem, Task, TaskControlBlock,
};
pub use crate::time::{Duration, Instant, STARTUP};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use crate::arch::sim;

/// Pauses the calling task for at least `span`.
///
/// The kernel rounds up by one tick so that no less than the requested
/// time elapses. Call from a task only, never from an interrupt service
/// routine, and release every mutex first.
pub fn sleep_for(span: Duration) {
    arch::svc_sleep(span.ticks());
}

/// Pauses the calling task until at least `deadline`.
///
/// Call from a task only, never from an interrupt service routine, and
/// release every mutex first.
pub fn sleep_until(deadline: Instant) {
    let remaining = deadline - Scheduler::now();
    // Sleeping for over an hour usually means a missing low-power path.
    crate::trap_assert!(remaining < Duration::from_secs(3600));
    sleep_for(remaining);
}

/// Yields the processor, letting the scheduler pick the most urgent ready
/// task again. The calling task stays ready and resumes immediately when
/// it is still the best choice.
pub fn yield_now() {
    arch::svc_switch();
}
