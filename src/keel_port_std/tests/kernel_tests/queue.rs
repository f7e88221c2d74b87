//! Message queue behavior: FIFO order, capacity accounting, blocking
//! handoff in both directions, timeouts.
use keel::kernel::{Queue, ReceiveQueueTimeoutError, TryReceiveQueueError, TrySendQueueError};
use keel::prelude::*;
use keel::time::Duration;

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// Non-blocking round trip: elements come back in insertion order, and the
/// capacity accounting is exact.
#[test]
fn fifo_round_trip_and_capacity() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                prober => { entry: prober_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static CHANNEL: Queue<SystemTraits, u32, 4> = Queue::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn prober_body() {
        assert_eq!(CHANNEL.try_receive(), Err(TryReceiveQueueError::QueueEmpty));
        assert_eq!(CHANNEL.is_empty(), Ok(true));
        assert_eq!(CHANNEL.capacity(), 4);

        for value in [10, 20, 30, 40] {
            CHANNEL.try_send(value).unwrap();
        }
        assert_eq!(CHANNEL.try_send(50), Err(TrySendQueueError::QueueFull));
        assert_eq!(CHANNEL.is_full(), Ok(true));
        assert_eq!(CHANNEL.available(), Ok(0));

        assert_eq!(CHANNEL.try_receive(), Ok(10));
        assert_eq!(CHANNEL.try_receive(), Ok(20));
        assert_eq!(CHANNEL.available(), Ok(2));

        // The ring wraps while preserving order
        CHANNEL.try_send(50).unwrap();
        CHANNEL.try_send(60).unwrap();
        for expected in [30, 40, 50, 60] {
            assert_eq!(CHANNEL.try_receive(), Ok(expected));
        }
        assert_eq!(CHANNEL.is_empty(), Ok(true));

        SEQ.expect_and_replace(0, 1);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
}

/// A sender blocked on a full queue is completed by the receive that frees
/// a slot, without disturbing the element order.
#[test]
fn blocked_sender_preserves_element_order() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                producer => { entry: producer_body, priority: 2, stack_size: 4096 },
                consumer => { entry: consumer_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static CHANNEL: Queue<SystemTraits, u32, 2> = Queue::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn producer_body() {
        CHANNEL.try_send(1).unwrap();
        CHANNEL.try_send(2).unwrap();
        SEQ.expect_and_replace(0, 1);

        // The queue is full; this parks the producer with `3` staged on
        // its stack
        CHANNEL.send(3).unwrap();

        SEQ.expect_and_replace(2, 3);
    }

    fn consumer_body() {
        SEQ.expect_and_replace(1, 2);

        // Frees a slot; the staged `3` slides in and the producer (more
        // urgent than us) resumes before `receive` returns... after which
        // the order must still be exactly 1, 2, 3
        assert_eq!(CHANNEL.receive(), Ok(1));

        SEQ.expect_and_replace(3, 4);
        assert_eq!(CHANNEL.receive(), Ok(2));
        assert_eq!(CHANNEL.receive(), Ok(3));
        assert_eq!(CHANNEL.is_empty(), Ok(true));

        SEQ.expect_and_replace(4, 5);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 5);
}

/// A receiver blocked on an empty queue gets the element handed straight
/// to it, and a timed receive on a silent queue expires.
#[test]
fn blocked_receiver_handoff_and_timeout() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                consumer => { entry: consumer_body, priority: 2, stack_size: 4096 },
                producer => { entry: producer_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static CHANNEL: Queue<SystemTraits, [u8; 12], 2> = Queue::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn consumer_body() {
        // Blocks; the queue is empty
        assert_eq!(CHANNEL.receive(), Ok(*b"keel message"));
        SEQ.expect_and_replace(1, 2);

        let before = SystemTraits::tick_count().unwrap();
        assert_eq!(
            CHANNEL.receive_timeout(Duration::from_ticks(5)),
            Err(ReceiveQueueTimeoutError::Timeout)
        );
        let elapsed = SystemTraits::tick_count().unwrap() - before;
        assert!(elapsed >= 5, "woke up after only {elapsed} ticks");

        SEQ.expect_and_replace(3, 4);
    }

    fn producer_body() {
        SEQ.expect_and_replace(0, 1);

        // Wakes the consumer through the direct handoff path; the buffer
        // itself stays empty. The consumer preempts us, consumes the
        // element, and parks in its timed receive.
        CHANNEL.send(*b"keel message").unwrap();

        SEQ.expect_and_replace(2, 3);
        assert_eq!(CHANNEL.is_empty(), Ok(true));
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 3);

    run_ticks::<SystemTraits>(5);
    wait_seq::<SystemTraits>(&SEQ, 4);
}
