//! Compile-time kernel configuration.
//!
//! The defaults match a typical Cortex-M4/M7 part: 4 implemented NVIC
//! priority bits, 2 of them used for preemption, the kernel at the second
//! highest preemption level so one level remains for interrupt service
//! routines that cannot tolerate kernel latency. Such routines must not
//! call into the kernel at all.

use crate::mutex::PriorityMutex;
use crate::priority::IsrPriority;

/// The number of NVIC priority bits implemented by the target.
pub const PRIORITY_BITS: u8 = 4;

/// The number of priority bits used as preemption levels.
pub const PREEMPTION_BITS: u8 = 2;

/// The preemption level the kernel runs its service call and tick at.
pub const KERNEL_PREEMPTION: u8 = 1;

/// Scheduler ticks per second. One tick is the granularity of every
/// timeout and sleep, 1 ms with the default value.
pub const TICKS_PER_SECOND: u32 = 1_000;

/// The concrete mutex type used by the kernel and by condition variable
/// notifier synchronization.
pub type Mutex = PriorityMutex;

/// The service call priority: kernel preemption level, most urgent
/// sub-priority.
pub const SERVICE_CALL_PRIORITY: IsrPriority =
    IsrPriority::from_preempt_sub(KERNEL_PREEMPTION, 0, PREEMPTION_BITS);

/// The tick priority: kernel preemption level, least urgent sub-priority,
/// so the service call wins a simultaneous arrival but neither preempts
/// the other.
pub const SYSTICK_PRIORITY: IsrPriority =
    IsrPriority::from_preempt_sub(KERNEL_PREEMPTION, MIN_SUB, PREEMPTION_BITS);

/// The context switch priority: the least urgent priority that exists, so
/// a switch never interrupts anything else. The switch handler itself
/// masks up to the service call priority while it runs.
pub const PENDSV_PRIORITY: IsrPriority =
    IsrPriority::from_preempt_sub(MIN_PREEMPT, MIN_SUB, PREEMPTION_BITS);

const MIN_PREEMPT: u8 = (1u16 << PREEMPTION_BITS) as u8 - 1;
const MIN_SUB: u8 = (1u16 << (IsrPriority::MAX_PREEMPTION_BITS - PREEMPTION_BITS)) as u8 - 1;

const _: () = assert!(
    PREEMPTION_BITS <= PRIORITY_BITS,
    "more preemption bits requested than the hardware implements"
);
const _: () = assert!(
    (KERNEL_PREEMPTION as u16) < (1u16 << PREEMPTION_BITS),
    "kernel preemption level does not fit the preemption bits"
);
