//! Tasks and their control blocks.
//!
//! A [`TaskControlBlock`] is the persistent record the kernel schedules; a
//! [`Task`] bundles one with a dedicated stack. Starting a task primes its
//! stack with the two frames the context switch machinery expects, a
//! hardware exception frame and a software context frame, so the first
//! resume drops straight into the entry trampoline.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::callback::Callback;
use crate::condvar::ConditionVariable;
use crate::hooks::hooks;
use crate::list::Link;
use crate::mutex::PriorityMutex;
use crate::priority::Priority;
use crate::sched;
use crate::time::{Instant, STARTUP};
use crate::trap_assert;

/// The type of one stack slot.
pub type StackItem = u32;

/// The frame the hardware stacks on exception entry.
///
/// Offsets follow the exception entry behavior of the ARMv7-M
/// architecture reference manual.
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct StackFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub psr: u32,
}

/// The frame the context switch stub stacks below the hardware frame:
/// the exception return value, CONTROL, and the callee-saved registers.
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct ContextFrame {
    pub lr: u32,
    pub control: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
}

const FRAME_ITEMS: usize = core::mem::size_of::<StackFrame>() / core::mem::size_of::<StackItem>();
const CONTEXT_ITEMS: usize =
    core::mem::size_of::<ContextFrame>() / core::mem::size_of::<StackItem>();

/// The extended software context holds S16 to S31 above the integer part.
const FP_CONTEXT_ITEMS: usize = 16;

/// If this bit is clear in the saved exception return value, the frames
/// carry floating point state.
const FP_FLAG: u32 = 0b10000;

/// Exception return: thread mode, process stack, no floating point.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// CONTROL value for a task: unprivileged bit clear, process stack.
const CONTROL_PSP: u32 = 0b10;

/// The xPSR thumb bit; a Cortex-M executes thumb code only.
const PSR_THUMB: u32 = 1 << 24;

/// The control block of one task: everything the kernel needs to
/// schedule, block, wake and terminate it.
///
/// Prefer [`Task`], which carries its own stack. A `TaskControlBlock` is
/// only useful directly when the stack memory comes from somewhere
/// special.
pub struct TaskControlBlock {
    pub(crate) stack_base: Cell<*mut StackItem>,
    pub(crate) stack_size: Cell<usize>,
    pub(crate) active: AtomicBool,
    pub(crate) stack_pointer: Cell<*mut StackItem>,
    pub(crate) priority: Cell<Priority>,
    pub(crate) last_started: Cell<Instant>,
    pub(crate) wait_until: Cell<Option<Instant>>,
    pub(crate) name: Cell<Option<&'static str>>,
    pub(crate) entry: UnsafeCell<Callback>,
    pub(crate) waiting: Cell<*const ConditionVariable>,
    pub(crate) mutex: Cell<*const PriorityMutex>,
    pub(crate) handle_link: UnsafeCell<Link>,
    pub(crate) timeout_link: UnsafeCell<Link>,
    pub(crate) waiting_link: UnsafeCell<Link>,
}

// Kernel-side mutation happens at the service call priority only, user
// entry points go through service calls or atomics.
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    /// Creates a control block with no stack attached. Attach one with
    /// [`assign_stack`] before starting it.
    ///
    /// [`assign_stack`]: TaskControlBlock::assign_stack
    pub const fn new() -> TaskControlBlock {
        TaskControlBlock {
            stack_base: Cell::new(ptr::null_mut()),
            stack_size: Cell::new(0),
            active: AtomicBool::new(false),
            stack_pointer: Cell::new(ptr::null_mut()),
            priority: Cell::new(Priority::LOWEST),
            last_started: Cell::new(STARTUP),
            wait_until: Cell::new(None),
            name: Cell::new(None),
            entry: UnsafeCell::new(Callback::empty()),
            waiting: Cell::new(ptr::null()),
            mutex: Cell::new(ptr::null()),
            handle_link: UnsafeCell::new(Link::new()),
            timeout_link: UnsafeCell::new(Link::new()),
            waiting_link: UnsafeCell::new(Link::new()),
        }
    }

    /// Gives the control block its stack memory, `size` items starting at
    /// `base`.
    ///
    /// # Safety
    ///
    /// The region must be writable, 8 byte aligned, unused by anything
    /// else, and must outlive the control block. Do not call while the
    /// task is active.
    pub unsafe fn assign_stack(&self, base: *mut StackItem, size: usize) {
        trap_assert!(!self.is_started());
        trap_assert!(size >= 2 * (FRAME_ITEMS + CONTEXT_ITEMS));
        self.stack_base.set(base);
        self.stack_size.set(size);
    }

    /// Starts the task, making it call `entry` once it is scheduled.
    ///
    /// Returns `false` when the task was already started. Tasks may be
    /// started before the scheduler runs; they are queued until it does.
    pub fn start(&'static self, entry: Callback, name: Option<&'static str>) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }

        trap_assert!(!self.stack_base.get().is_null());

        unsafe {
            *self.entry.get() = entry;
        }
        self.name.set(name);
        self.wait_until.set(None);
        self.waiting.set(ptr::null());
        self.mutex.set(ptr::null());
        self.prime_stack();

        sched::add_task(self as *const TaskControlBlock as *mut TaskControlBlock);
        true
    }

    /// Stops the task whatever its state. Returns `false` when it was not
    /// started. A stopped task can be started again with a fresh entry.
    ///
    /// When a task stops itself this does not return.
    pub fn stop(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        arch::svc_terminate(self as *const TaskControlBlock as *mut TaskControlBlock);
        true
    }

    /// Checks whether the task is started.
    pub fn is_started(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// The current priority of the task.
    pub fn priority(&self) -> Priority {
        self.priority.get()
    }

    /// Changes the priority of the task. This may switch tasks on the
    /// spot when the change makes another task the most urgent runnable
    /// one.
    pub fn set_priority(&self, new_priority: Priority) {
        if new_priority != self.priority.get() {
            sched::update_priority(
                self as *const TaskControlBlock as *mut TaskControlBlock,
                new_priority,
            );
        }
    }

    /// The current name of the task.
    pub fn name(&self) -> Option<&'static str> {
        self.name.get()
    }

    /// Renames the task.
    pub fn set_name(&self, name: Option<&'static str>) {
        self.name.set(name);
        hooks().task_name_changed(self);
    }

    /// The time the task was last given the processor; the FIFO
    /// tiebreaker between equal priorities.
    pub fn last_started(&self) -> Instant {
        self.last_started.get()
    }

    /// Strict scheduling order: `left` before `right` when it is more
    /// urgent, or as urgent but scheduled longer ago.
    pub fn priority_is_lower(left: &TaskControlBlock, right: &TaskControlBlock) -> bool {
        if left.priority.get() > right.priority.get() {
            return false;
        }
        if left.priority.get() < right.priority.get() {
            return true;
        }
        left.last_started.get() < right.last_started.get()
    }

    /// Lays out the initial frames. The hardware frame makes the first
    /// exception return land in the entry trampoline with `&self` as its
    /// argument, the context frame below it satisfies the switch stub.
    fn prime_stack(&self) {
        let base = self.stack_base.get();
        let size = self.stack_size.get();

        unsafe {
            if cfg!(debug_assertions) {
                for i in 0..size {
                    base.add(i).write(0xDEAD_BEEF);
                }
            }

            // Keep the topmost slot zero to stop stack trace unwinding.
            let top = base.add(size - 1);
            top.write(0);

            let frame = align_down(top) as *mut StackFrame;
            let frame = frame.sub(1);
            (*frame).r0 = self as *const TaskControlBlock as usize as u32;
            (*frame).r1 = 0;
            (*frame).r2 = 0;
            (*frame).r3 = 0;
            (*frame).r12 = 0;
            (*frame).lr = task_return_guard as usize as u32;
            (*frame).pc = task_starter as usize as u32;
            (*frame).psr = PSR_THUMB;

            let context = (frame as *mut StackItem).sub(CONTEXT_ITEMS) as *mut ContextFrame;
            (*context).lr = EXC_RETURN_THREAD_PSP;
            (*context).control = CONTROL_PSP;

            let stack_pointer = context as *mut StackItem;
            trap_assert!(stack_pointer >= base);
            self.stack_pointer.set(stack_pointer);
        }
    }

    /// Writes `value` into the slot of the saved frames that the first
    /// argument register is restored from, skipping the floating point
    /// bank when the saved exception return says one was stacked. The
    /// kernel uses this to deliver wait results across a wake.
    pub(crate) fn set_return_value(&self, value: u32) {
        unsafe {
            let frame = self.saved_frame();
            (*frame).r0 = value;
        }
    }

    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    pub(crate) fn saved_return_value(&self) -> u32 {
        unsafe { (*self.saved_frame()).r0 }
    }

    unsafe fn saved_frame(&self) -> *mut StackFrame {
        let pointer = self.stack_pointer.get();
        let context = pointer as *mut ContextFrame;
        let items = if (*context).lr & FP_FLAG == 0 {
            CONTEXT_ITEMS + FP_CONTEXT_ITEMS
        } else {
            CONTEXT_ITEMS
        };
        pointer.add(items) as *mut StackFrame
    }
}

/// The trampoline every task begins at: runs the entry callback, then
/// terminates the task.
extern "C" fn task_starter(task: *mut TaskControlBlock) {
    unsafe {
        (*(*task).entry.get()).invoke();
    }
    arch::svc_terminate(task);
}

/// Where a task would land if the trampoline ever returned. Terminates
/// the running task as a backstop.
extern "C" fn task_return_guard() -> ! {
    let current = sched::current_task_pointer();
    if !current.is_null() {
        arch::svc_terminate(current);
    }
    loop {
        arch::nop();
    }
}

fn align_down(pointer: *mut StackItem) -> *mut StackItem {
    let align = core::mem::align_of::<u64>();
    ((pointer as usize) / align * align) as *mut StackItem
}

/// A task with a dedicated stack of `STACK_ITEMS` stack slots.
pub struct Task<const STACK_ITEMS: usize> {
    stack: UnsafeCell<[StackItem; STACK_ITEMS]>,
    control: TaskControlBlock,
}

unsafe impl<const STACK_ITEMS: usize> Sync for Task<STACK_ITEMS> {}

impl<const STACK_ITEMS: usize> Task<STACK_ITEMS> {
    /// Creates a stopped task.
    pub const fn new() -> Task<STACK_ITEMS> {
        assert!(
            STACK_ITEMS >= 2 * (FRAME_ITEMS + CONTEXT_ITEMS),
            "stack too small"
        );
        Task {
            stack: UnsafeCell::new([0; STACK_ITEMS]),
            control: TaskControlBlock::new(),
        }
    }

    /// Starts the task, making it call `entry` once it is scheduled.
    /// Returns `false` when it was already started.
    pub fn start(&'static self, entry: Callback, name: Option<&'static str>) -> bool {
        if self.control.stack_base.get().is_null() {
            unsafe {
                self.control
                    .assign_stack(self.stack.get() as *mut StackItem, STACK_ITEMS);
            }
        }
        self.control.start(entry, name)
    }

    /// The control block of this task.
    pub fn control_block(&self) -> &TaskControlBlock {
        &self.control
    }
}

impl<const STACK_ITEMS: usize> core::ops::Deref for Task<STACK_ITEMS> {
    type Target = TaskControlBlock;

    fn deref(&self) -> &TaskControlBlock {
        &self.control
    }
}

/// The control block of the reserved idle task, used whenever no task is
/// ready to run.
pub struct IdleTaskControlBlock {
    pub(crate) stack_base: Cell<*mut StackItem>,
    pub(crate) stack_size: Cell<usize>,
    pub(crate) stack_pointer: Cell<*mut StackItem>,
    entry: fn() -> !,
}

unsafe impl Sync for IdleTaskControlBlock {}

impl IdleTaskControlBlock {
    const fn new(entry: fn() -> !) -> IdleTaskControlBlock {
        IdleTaskControlBlock {
            stack_base: Cell::new(ptr::null_mut()),
            stack_size: Cell::new(0),
            stack_pointer: Cell::new(ptr::null_mut()),
            entry,
        }
    }

    /// Primes the idle stack; called by the scheduler on start.
    pub(crate) fn prime_stack(&self) {
        let base = self.stack_base.get();
        let size = self.stack_size.get();
        trap_assert!(!base.is_null());

        unsafe {
            let top = base.add(size - 1);
            top.write(0);

            let frame = align_down(top) as *mut StackFrame;
            let frame = frame.sub(1);
            (*frame).psr = PSR_THUMB;
            (*frame).pc = self.entry as usize as u32;
            (*frame).lr = idle_return_guard as usize as u32;

            let context = (frame as *mut StackItem).sub(CONTEXT_ITEMS) as *mut ContextFrame;
            (*context).lr = EXC_RETURN_THREAD_PSP;
            (*context).control = CONTROL_PSP;

            self.stack_pointer.set(context as *mut StackItem);
        }
    }
}

/// The idle entry never returns; parking on a breakpoint is all that is
/// left if it somehow does.
extern "C" fn idle_return_guard() -> ! {
    loop {
        arch::breakpoint();
    }
}

/// An idle task with a dedicated stack of `STACK_ITEMS` stack slots.
pub struct IdleTask<const STACK_ITEMS: usize = 64> {
    stack: UnsafeCell<[StackItem; STACK_ITEMS]>,
    control: IdleTaskControlBlock,
}

unsafe impl<const STACK_ITEMS: usize> Sync for IdleTask<STACK_ITEMS> {}

impl<const STACK_ITEMS: usize> IdleTask<STACK_ITEMS> {
    /// Creates an idle task running `entry`, a loop that must never
    /// return.
    pub const fn new(entry: fn() -> !) -> IdleTask<STACK_ITEMS> {
        assert!(
            STACK_ITEMS >= 2 * (FRAME_ITEMS + CONTEXT_ITEMS),
            "stack too small"
        );
        IdleTask {
            stack: UnsafeCell::new([0; STACK_ITEMS]),
            control: IdleTaskControlBlock::new(entry),
        }
    }

    /// The control block of this idle task, with the stack wired up.
    pub fn control_block(&'static self) -> &'static IdleTaskControlBlock {
        self.control
            .stack_base
            .set(self.stack.get() as *mut StackItem);
        self.control.stack_size.set(STACK_ITEMS);
        &self.control
    }
}

fn default_idle_entry() -> ! {
    loop {
        if cfg!(debug_assertions) {
            arch::nop();
        } else {
            arch::wfi();
        }
    }
}

static DEFAULT_IDLE: IdleTask<64> = IdleTask::new(default_idle_entry);

/// The default idle task, a wait-for-interrupt loop.
pub fn default_idle() -> &'static IdleTaskControlBlock {
    DEFAULT_IDLE.control_block()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn leak_with_stack() -> &'static TaskControlBlock {
        let task: &'static Task<128> = Box::leak(Box::new(Task::new()));
        unsafe {
            task.control
                .assign_stack(task.stack.get() as *mut StackItem, 128);
        }
        &task.control
    }

    #[test]
    fn primed_frame_layout() {
        let task = leak_with_stack();
        task.priority.set(Priority::NORMAL);
        task.prime_stack();

        let sp = task.stack_pointer.get();
        assert_eq!(sp as usize % core::mem::align_of::<u64>(), 0);
        unsafe {
            let context = sp as *mut ContextFrame;
            assert_eq!((*context).lr, EXC_RETURN_THREAD_PSP);
            assert_eq!((*context).control, CONTROL_PSP);

            let frame = sp.add(CONTEXT_ITEMS) as *mut StackFrame;
            assert_eq!((*frame).psr, PSR_THUMB);
            assert_eq!((*frame).pc, task_starter as usize as u32);
            assert_eq!((*frame).r0, task as *const TaskControlBlock as usize as u32);
        }
    }

    #[test]
    fn return_value_lands_in_saved_r0() {
        let task = leak_with_stack();
        task.prime_stack();
        task.set_return_value(1);
        assert_eq!(task.saved_return_value(), 1);
        task.set_return_value(0);
        assert_eq!(task.saved_return_value(), 0);
    }

    #[test]
    fn priority_order_with_fifo_tiebreak() {
        let a = TaskControlBlock::new();
        let b = TaskControlBlock::new();
        a.priority.set(Priority::HIGH);
        b.priority.set(Priority::NORMAL);
        assert!(TaskControlBlock::priority_is_lower(&a, &b));
        assert!(!TaskControlBlock::priority_is_lower(&b, &a));

        b.priority.set(Priority::HIGH);
        a.last_started.set(STARTUP);
        b.last_started.set(STARTUP + crate::time::Duration::from_ticks(1));
        assert!(TaskControlBlock::priority_is_lower(&a, &b));
        assert!(!TaskControlBlock::priority_is_lower(&b, &a));
    }
}
