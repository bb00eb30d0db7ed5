//! Scheduler behavior on the simulated CPU: dispatch order, preemption,
//! sleeping, termination and the clock.

use kron_cortex_m::{
    default_idle, sim, sleep_for, yield_now, Callback, ConditionVariable, Duration, IsrPriority,
    Priority, Scheduler, Task, WaitStatus, STARTUP,
};

fn leak_task(priority: Priority) -> &'static Task<256> {
    let task: &'static Task<256> = Box::leak(Box::new(Task::new()));
    task.set_priority(priority);
    task
}

fn leak_condition(priority: Option<IsrPriority>) -> &'static ConditionVariable {
    Box::leak(Box::new(ConditionVariable::new(priority)))
}

fn current_is(task: &Task<256>) -> bool {
    Scheduler::current().map(|t| core::ptr::eq(t, task.control_block())) == Some(true)
}

#[test]
fn starts_the_most_urgent_task() {
    let _sim = sim::take();
    let normal = leak_task(Priority::NORMAL);
    let high = leak_task(Priority::HIGH);
    let low = leak_task(Priority::LOW);

    assert!(normal.start(Callback::new(|| {}), Some("normal")));
    assert!(high.start(Callback::new(|| {}), Some("high")));
    assert!(low.start(Callback::new(|| {}), Some("low")));

    assert!(Scheduler::start(default_idle()));
    assert!(current_is(high));
    assert_eq!(sim::introspect::ready_count(), 2);

    // Start-up side effects: handler priorities programmed, the tick
    // derived from the core clock, execution on the process stack.
    assert!(sim::kernel_handlers_installed());
    assert_eq!(sim::systick_reload(), 16_000);
    assert!(sim::on_process_stack());
}

#[test]
fn double_start_is_refused() {
    let _sim = sim::take();
    let task = leak_task(Priority::NORMAL);
    assert!(task.start(Callback::new(|| {}), None));
    assert!(!task.start(Callback::new(|| {}), None));

    assert!(Scheduler::start(default_idle()));
    assert!(!Scheduler::start(default_idle()));
}

#[test]
fn idles_without_tasks() {
    let _sim = sim::take();
    assert!(Scheduler::start(default_idle()));
    assert!(Scheduler::current().is_none());
    assert!(sim::introspect::is_idling());

    // Ticks keep running while idle.
    sim::advance(Duration::from_millis(3));
    assert_eq!(Scheduler::now(), STARTUP + Duration::from_millis(3));
}

#[test]
fn equal_priorities_run_fifo() {
    let _sim = sim::take();
    let a = leak_task(Priority::NORMAL);
    let b = leak_task(Priority::NORMAL);
    let c = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("a"));
    b.start(Callback::new(|| {}), Some("b"));
    c.start(Callback::new(|| {}), Some("c"));

    Scheduler::start(default_idle());
    assert!(current_is(a));

    yield_now();
    assert!(current_is(b));
    yield_now();
    assert!(current_is(c));
}

#[test]
fn starting_a_more_urgent_task_preempts() {
    let _sim = sim::take();
    let normal = leak_task(Priority::NORMAL);
    let high = leak_task(Priority::HIGH);
    normal.start(Callback::new(|| {}), Some("normal"));

    Scheduler::start(default_idle());
    assert!(current_is(normal));

    high.start(Callback::new(|| {}), Some("high"));
    assert!(current_is(high));
    assert!(sim::introspect::is_ready(normal.control_block()));
}

#[test]
fn starting_a_less_urgent_task_does_not_preempt() {
    let _sim = sim::take();
    let high = leak_task(Priority::HIGH);
    let low = leak_task(Priority::LOW);
    high.start(Callback::new(|| {}), Some("high"));

    Scheduler::start(default_idle());
    assert!(current_is(high));

    low.start(Callback::new(|| {}), Some("low"));
    assert!(current_is(high));
    assert!(sim::introspect::is_ready(low.control_block()));
}

#[test]
fn sleep_waits_at_least_the_requested_time() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("a"));
    b.start(Callback::new(|| {}), Some("b"));

    Scheduler::start(default_idle());
    assert!(current_is(a));

    sleep_for(Duration::from_millis(10));
    assert!(current_is(b));
    assert!(sim::introspect::is_timed(a.control_block()));

    // Not yet: ten ticks have elapsed, the kernel holds it one more.
    sim::advance(Duration::from_millis(10));
    assert!(current_is(b));

    sim::advance(Duration::from_millis(1));
    assert!(current_is(a));
    assert!(Scheduler::now() - STARTUP >= Duration::from_millis(10));
    assert!(!sim::introspect::is_timed(a.control_block()));
}

#[test]
fn same_deadline_wakes_in_last_started_order() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::HIGH);
    a.start(Callback::new(|| {}), Some("a"));

    Scheduler::start(default_idle());
    assert!(current_is(a));

    sim::advance(Duration::from_millis(5));

    // Both sleep 10 ms at t = 5; a has held the processor since t = 0,
    // b first runs now.
    sleep_for(Duration::from_millis(10));
    b.start(Callback::new(|| {}), Some("b"));
    assert!(current_is(b));
    assert_eq!(b.last_started(), STARTUP + Duration::from_millis(5));
    sleep_for(Duration::from_millis(10));
    assert!(sim::introspect::is_idling());

    sim::advance(Duration::from_millis(11));
    assert_eq!(Scheduler::now(), STARTUP + Duration::from_millis(16));
    // Both woke this tick; the older last start runs first.
    assert!(current_is(a));
    assert!(sim::introspect::is_ready(b.control_block()));
}

#[test]
fn terminate_current_task_and_restart() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("a"));
    b.start(Callback::new(|| {}), Some("b"));

    Scheduler::start(default_idle());
    assert!(current_is(a));

    assert!(a.stop());
    assert!(!a.is_started());
    assert!(current_is(b));
    assert!(!sim::introspect::is_ready(a.control_block()));
    assert!(!sim::introspect::is_timed(a.control_block()));

    // Stopping again reports failure.
    assert!(!a.stop());

    // A terminated task can be started again with a fresh entry.
    assert!(a.start(Callback::new(|| {}), Some("a2")));
    assert!(current_is(a));
    assert_eq!(a.name(), Some("a2"));
}

#[test]
fn terminate_ready_task_leaves_no_queue_entry() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("a"));
    b.start(Callback::new(|| {}), Some("b"));

    Scheduler::start(default_idle());
    assert!(current_is(a));
    assert!(sim::introspect::is_ready(b.control_block()));

    assert!(b.stop());
    assert!(!b.is_started());
    assert!(current_is(a));
    assert!(!sim::introspect::is_ready(b.control_block()));
    assert_eq!(sim::introspect::ready_count(), 0);
}

#[test]
fn terminate_sleeping_task_cancels_its_timeout() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("a"));
    b.start(Callback::new(|| {}), Some("b"));

    Scheduler::start(default_idle());
    sleep_for(Duration::from_millis(5));
    assert!(current_is(b));
    assert!(sim::introspect::is_timed(a.control_block()));

    assert!(a.stop());
    assert_eq!(sim::introspect::timeout_count(), 0);
    sim::advance(Duration::from_millis(10));
    assert!(current_is(b));
    assert!(!a.is_started());
}

#[test]
fn preemption_happens_before_the_isr_returns() {
    let _sim = sim::take();
    let busy = leak_task(Priority::LOW);
    let urgent = leak_task(Priority::HIGH);
    let events = leak_condition(Some(IsrPriority::new(0x80)));

    urgent.start(Callback::new(|| {}), Some("urgent"));
    busy.start(Callback::new(|| {}), Some("busy"));

    Scheduler::start(default_idle());
    assert!(current_is(urgent));

    // The urgent task waits, the busy one runs.
    events.wait();
    assert!(current_is(busy));
    let busy_sp = sim::current_stack_pointer();

    // A peripheral interrupt notifies; by the time it has fully
    // returned the urgent task holds the processor.
    sim::run_isr(IsrPriority::new(0x80), || {
        events.notify_one();
        // Still inside the interrupt: no switch happened yet.
        assert!(current_is(busy));
    });
    assert!(current_is(urgent));
    assert_eq!(sim::wait_status(urgent.control_block()), WaitStatus::Notified);

    // The preempted task's context was parked on its own stack.
    assert_eq!(
        sim::introspect::saved_stack_pointer(busy.control_block()),
        busy_sp
    );
    assert_eq!(busy.control_block().last_started(), STARTUP);
    assert!(sim::introspect::is_ready(busy.control_block()));
}

#[test]
fn ping_pong_via_condition_variable() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    let events = leak_condition(None);

    b.start(Callback::new(|| {}), Some("b"));
    Scheduler::start(default_idle());

    // b runs first and immediately waits.
    assert!(current_is(b));
    events.wait();
    assert!(sim::introspect::is_idling());

    a.start(Callback::new(|| {}), Some("a"));
    assert!(current_is(a));

    let mut counter = 0;
    for i in 0..5i64 {
        if i > 0 {
            // Deliver a's wakeup.
            sim::advance(Duration::from_millis(11));
        }
        assert!(current_is(a));
        assert_eq!(Scheduler::now(), STARTUP + Duration::from_ticks(11 * i as i32));

        // a's loop body.
        counter += 1;
        events.notify_one();
        assert_eq!(
            sim::wait_status(b.control_block()),
            WaitStatus::Notified
        );
        sleep_for(Duration::from_millis(10));

        // b was notified and runs now that a sleeps.
        assert!(current_is(b));
        counter += 2;
        events.wait();
        assert!(sim::introspect::is_idling());
    }

    assert_eq!(counter, 15);
    assert_eq!(a.last_started(), STARTUP + Duration::from_millis(44));
    assert_eq!(b.last_started(), STARTUP + Duration::from_millis(44));

    // Nothing else happens up to the 50 ms mark.
    sim::advance(Duration::from_millis(6));
    assert_eq!(Scheduler::now(), STARTUP + Duration::from_millis(50));
    assert_eq!(counter, 15);
    assert_eq!(sim::introspect::ready_count(), 0);
    assert_eq!(events.waiter_count(), 1);
    assert_eq!(sim::introspect::timeout_count(), 1);
}

#[test]
fn tasks_are_listed_and_named() {
    let _sim = sim::take();
    let a = leak_task(Priority::HIGH);
    let b = leak_task(Priority::NORMAL);
    a.start(Callback::new(|| {}), Some("alpha"));
    b.start(Callback::new(|| {}), Some("beta"));

    Scheduler::start(default_idle());

    let names: Vec<&str> = Scheduler::all_tasks().filter_map(|task| task.name()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"alpha"));
    assert!(names.contains(&"beta"));

    b.set_name(Some("gamma"));
    assert_eq!(b.name(), Some("gamma"));
}
