//! Scheduler behavior: priority selection, FIFO order within a priority,
//! delays, and the pre-start error surface.
use keel::kernel::{CurrentTaskError, DelayError, TickError, YieldError};
use keel::prelude::*;
use keel::time::Duration;

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// 1. `urgent` (priority 5) runs before `relaxed` (priority 1) and goes to
///    sleep for 2 ticks.
/// 2. `relaxed` runs and goes to sleep for 10 ticks.
/// 3. (t = 2) `urgent` wakes up first despite having blocked first... and
///    despite `relaxed`'s earlier deadline being nowhere near.
/// 4. (t = 10) `relaxed` wakes up.
#[test]
fn priority_selection_and_delay() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 8,
            tasks: {
                urgent => { entry: urgent_body, priority: 5, stack_size: 4096 },
                relaxed => { entry: relaxed_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn urgent_body() {
        SEQ.expect_and_replace(0, 1);
        SystemTraits::delay(Duration::from_ticks(2)).unwrap();
        SEQ.expect_and_replace(2, 3);
    }

    fn relaxed_body() {
        SEQ.expect_and_replace(1, 2);
        SystemTraits::delay(Duration::from_ticks(10)).unwrap();
        SEQ.expect_and_replace(3, 4);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 2);

    run_ticks::<SystemTraits>(2);
    wait_seq::<SystemTraits>(&SEQ, 3);

    run_ticks::<SystemTraits>(8);
    wait_seq::<SystemTraits>(&SEQ, 4);

    assert_eq!(SystemTraits::tick_count(), Ok(10));
}

/// Two tasks of the same priority alternate through `yield_now`, proving
/// that a yielding task rejoins the back of its ready list.
#[test]
fn fifo_order_within_priority() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                first => { entry: first_body, priority: 2, stack_size: 4096 },
                second => { entry: second_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn first_body() {
        SEQ.expect_and_replace(0, 1);
        SystemTraits::yield_now().unwrap();
        SEQ.expect_and_replace(2, 3);
        // Terminating hands the processor to `second`
    }

    fn second_body() {
        SEQ.expect_and_replace(1, 2);
        SystemTraits::yield_now().unwrap();
        SEQ.expect_and_replace(3, 4);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 4);
}

/// A task that yields with no equal-or-higher-priority task ready simply
/// keeps running.
#[test]
fn yield_without_rival_keeps_running() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                busy => { entry: busy_body, priority: 3, stack_size: 4096 },
                background => { entry: background_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn busy_body() {
        SEQ.expect_and_replace(0, 1);
        // `background` is ready, but it must not run here
        SystemTraits::yield_now().unwrap();
        SystemTraits::yield_now().unwrap();
        SEQ.expect_and_replace(1, 2);
    }

    fn background_body() {
        SEQ.expect_and_replace(2, 3);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 3);
}

/// The kernel's operations are rejected cleanly before `start` and from
/// the wrong context.
#[test]
fn errors_before_start_and_from_interrupt_context() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 2,
            tasks: {
                never_started => { entry: never_started_body, priority: 0, stack_size: 4096 },
            },
        }
    }

    fn never_started_body() {
        unreachable!("this kernel is never started");
    }

    // The tick source must not outrun `start`
    assert_eq!(SystemTraits::tick(), Err(TickError::NotInitialized));

    // Blocking operations are meaningless outside a task context
    assert_eq!(
        SystemTraits::delay(Duration::from_ticks(1)),
        Err(DelayError::InvalidState)
    );
    assert_eq!(SystemTraits::yield_now(), Err(YieldError::InvalidState));
    assert_eq!(
        SystemTraits::current_task(),
        Err(CurrentTaskError::InvalidState)
    );
}

/// `current_task` identifies the caller, and task handles expose the
/// configured name and priority.
#[test]
fn current_task_identity() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 8,
            tasks: {
                inspector => { entry: inspector_body, priority: 6, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn inspector_body() {
        let me = SystemTraits::current_task().unwrap();
        assert_eq!(me.name(), "inspector");
        assert_eq!(me.priority(), 6);
        assert_eq!(SystemTraits::task(0), Some(me));
        assert_eq!(SystemTraits::task(1), None);
        SEQ.expect_and_replace(0, 1);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
}
