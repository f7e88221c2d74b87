//! Task notification behavior: combine rules, overflow signaling, and
//! interrupt-context wake-up.
use keel::kernel::{NotifyAction, NotifyError, NotifyWaitFlags, TryNotifyWaitError};
use keel::prelude::*;
use keel::time::Duration;

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// `SetBits` accumulates event flags across notifications, and
/// `OverwriteIfEmpty` refuses to clobber a pending notification.
#[test]
fn combine_rules() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                listener => { entry: listener_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn listener_body() {
        assert_eq!(
            SystemTraits::try_notify_wait(NotifyWaitFlags::empty()),
            Err(TryNotifyWaitError::Timeout)
        );

        SEQ.expect_and_replace(0, 1);

        // The driver fires `SetBits(0x01)` and `SetBits(0x02)` while we
        // sleep; they merge in the slot
        SystemTraits::delay(Duration::from_ticks(2)).unwrap();

        assert_eq!(
            SystemTraits::notify_wait(NotifyWaitFlags::CLEAR_ON_EXIT),
            Ok(0x03)
        );

        // Exercise the overflow signal from task context, on our own slot
        let me = SystemTraits::current_task().unwrap();
        me.notify(5, NotifyAction::OverwriteIfEmpty).unwrap();
        assert_eq!(
            me.notify(6, NotifyAction::OverwriteIfEmpty),
            Err(NotifyError::InvalidState)
        );
        assert_eq!(me.notify_peek(), 5);
        assert!(me.notification_pending());
        assert_eq!(me.notify_clear(), 5);
        assert!(!me.notification_pending());
        assert_eq!(me.notify_peek(), 0);

        // `Overwrite` replaces unconditionally
        me.notify(7, NotifyAction::Overwrite).unwrap();
        me.notify(8, NotifyAction::Overwrite).unwrap();
        assert_eq!(
            SystemTraits::try_notify_wait(NotifyWaitFlags::CLEAR_ON_EXIT),
            Ok(8)
        );

        SEQ.expect_and_replace(1, 2);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);

    // Simulated interrupt context: the driver thread is not a task
    let listener = SystemTraits::task(0).unwrap();
    listener
        .notify_from_isr(0x01, NotifyAction::SetBits)
        .unwrap();
    listener
        .notify_from_isr(0x02, NotifyAction::SetBits)
        .unwrap();

    run_ticks::<SystemTraits>(2);
    wait_seq::<SystemTraits>(&SEQ, 2);
}

/// A notification from the (simulated) interrupt context wakes a task
/// blocked in `notify_wait`, and `Increment` turns the slot into a
/// counting substitute.
#[test]
fn isr_wake_and_increment() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                listener => { entry: listener_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static SEQ: SeqTracker = SeqTracker::new();

    fn listener_body() {
        SEQ.expect_and_replace(0, 1);

        // Parks until the driver's notification arrives
        assert_eq!(
            SystemTraits::notify_wait(NotifyWaitFlags::CLEAR_ON_EXIT),
            Ok(42)
        );

        SEQ.expect_and_replace(1, 2);

        // Three increments land while we sleep
        SystemTraits::delay(Duration::from_ticks(2)).unwrap();
        assert_eq!(
            SystemTraits::try_notify_wait(NotifyWaitFlags::CLEAR_ON_EXIT),
            Ok(3)
        );

        SEQ.expect_and_replace(2, 3);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
    keel_port_std::quiesce::<SystemTraits>();

    let listener = SystemTraits::task(0).unwrap();
    listener.notify_from_isr(42, NotifyAction::Overwrite).unwrap();
    wait_seq::<SystemTraits>(&SEQ, 2);

    for _ in 0..3 {
        listener.notify_from_isr(0, NotifyAction::Increment).unwrap();
    }
    run_ticks::<SystemTraits>(2);
    wait_seq::<SystemTraits>(&SEQ, 3);
}
