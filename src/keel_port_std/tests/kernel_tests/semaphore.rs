//! Semaphore behavior: signaling, bounded counting, timeouts.
use keel::kernel::{GiveSemaphoreError, Semaphore, TakeSemaphoreTimeoutError,
                   TryTakeSemaphoreError};
use keel::prelude::*;
use keel::time::Duration;

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// A `give` hands the permit straight to the most urgent waiter, and the
/// counter saturates at the configured maximum.
#[test]
fn give_wakes_waiter_and_counting_is_bounded() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                waiter => { entry: waiter_body, priority: 2, stack_size: 4096 },
                signaler => { entry: signaler_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 2);
    static SEQ: SeqTracker = SeqTracker::new();

    fn waiter_body() {
        // Blocks; the semaphore starts empty
        SEM.take().unwrap();
        SEQ.expect_and_replace(1, 2);

        // The permit was handed over directly, so the counter is still 0
        assert_eq!(SEM.value(), Ok(0));
        assert_eq!(SEM.try_take(), Err(TryTakeSemaphoreError::Timeout));
        SEQ.expect_and_replace(2, 3);
    }

    fn signaler_body() {
        SEQ.expect_and_replace(0, 1);

        // Wakes `waiter`, which preempts us
        SEM.give().unwrap();

        SEQ.expect_and_replace(3, 4);

        // Nobody is waiting anymore; permits accumulate up to the maximum
        SEM.give().unwrap();
        SEM.give().unwrap();
        assert_eq!(SEM.give(), Err(GiveSemaphoreError::InvalidState));
        assert_eq!(SEM.value(), Ok(2));

        SEM.try_take().unwrap();
        SEM.try_take().unwrap();
        assert_eq!(SEM.try_take(), Err(TryTakeSemaphoreError::Timeout));

        SEQ.expect_and_replace(4, 5);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 5);
}

/// A timed `take` on a starved semaphore reports `Timeout` no earlier
/// than requested.
#[test]
fn take_timeout_expires() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                starved => { entry: starved_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 1);
    static SEQ: SeqTracker = SeqTracker::new();

    fn starved_body() {
        SEQ.expect_and_replace(0, 1);

        let before = SystemTraits::tick_count().unwrap();
        assert_eq!(
            SEM.take_timeout(Duration::from_ticks(4)),
            Err(TakeSemaphoreTimeoutError::Timeout)
        );
        let elapsed = SystemTraits::tick_count().unwrap() - before;
        assert!(elapsed >= 4, "woke up after only {elapsed} ticks");

        SEQ.expect_and_replace(1, 2);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);

    run_ticks::<SystemTraits>(4);
    wait_seq::<SystemTraits>(&SEQ, 2);
}
