//! Tickless idle behavior: the sleep decision, the low-power delegation,
//! and tick-counter reconciliation.
use keel::kernel::{NotifyWaitFlags, SleepMode};
use keel::prelude::*;
use keel::time::Duration;
use keel_port_std::{quiesce, sleep_log};

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// 1. The policy refuses to sleep while the nearest deadline is closer
///    than `min_sleep`.
/// 2. Once the next wake is far enough away, `enter_sleep` hands the whole
///    span to the platform hook and reconciles the tick counter in one
///    step, waking the sleeper exactly once.
#[test]
fn sleep_decision_and_reconciliation() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                sleeper => { entry: sleeper_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn sleeper_body() {
        SystemTraits::configure_idle(SleepMode::Deep, Duration::from_ticks(3)).unwrap();
        SystemTraits::idle_set_enabled(true).unwrap();

        SEQ.expect_and_replace(0, 1);

        // Too close to be worth sleeping through
        SystemTraits::delay(Duration::from_ticks(2)).unwrap();

        SEQ.expect_and_replace(1, 2);

        // Far enough for the deep mode to pay off
        SystemTraits::delay(Duration::from_ticks(10)).unwrap();

        // The reconciliation must have advanced time by the full span
        assert!(SystemTraits::tick_count().unwrap() >= 12);
        SEQ.expect_and_replace(2, 3);

        let _ = SystemTraits::notify_wait(NotifyWaitFlags::empty());
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
    quiesce::<SystemTraits>();

    // The nearest deadline is 2 ticks away, below the 3-tick threshold
    assert_eq!(SystemTraits::should_sleep(), Ok(false));
    SystemTraits::enter_sleep().unwrap();
    assert!(sleep_log::<SystemTraits>().is_empty());

    run_ticks::<SystemTraits>(2);
    wait_seq::<SystemTraits>(&SEQ, 2);
    quiesce::<SystemTraits>();

    // Now the nearest deadline is 10 ticks away
    assert_eq!(SystemTraits::should_sleep(), Ok(true));
    SystemTraits::enter_sleep().unwrap();

    // The hook saw the deep mode and the full predicted span, and the
    // sleeper woke exactly at its deadline
    assert_eq!(sleep_log::<SystemTraits>(), [(SleepMode::Deep, 10)]);
    wait_seq::<SystemTraits>(&SEQ, 3);

    let stats = SystemTraits::idle_stats().unwrap();
    assert_eq!(stats.slept_ticks, 10);
    assert_eq!(stats.wake_count, 1);

    // With the sleeper parked indefinitely there is no deadline at all;
    // only an external event could end a sleep now
    quiesce::<SystemTraits>();
    assert_eq!(SystemTraits::should_sleep(), Ok(true));
}

/// The policy never sleeps while disabled, while a task is runnable, or
/// before `start`.
#[test]
fn sleep_is_refused_when_work_remains() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                napper => { entry: napper_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn napper_body() {
        SEQ.expect_and_replace(0, 1);
        SystemTraits::delay(Duration::from_ticks(50)).unwrap();
    }

    // Not started yet
    assert_eq!(SystemTraits::should_sleep(), Ok(false));

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
    quiesce::<SystemTraits>();

    // Disabled by default, even though the next deadline is far away
    assert_eq!(SystemTraits::should_sleep(), Ok(false));
    SystemTraits::enter_sleep().unwrap();
    assert!(sleep_log::<SystemTraits>().is_empty());

    SystemTraits::idle_set_enabled(true).unwrap();
    assert_eq!(SystemTraits::should_sleep(), Ok(true));
}
