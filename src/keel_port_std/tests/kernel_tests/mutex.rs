//! Mutex behavior: ownership rules, priority inheritance, timeouts.
use keel::kernel::{LockMutexError, LockMutexTimeoutError, Mutex, TryLockMutexError,
                   UnlockMutexError};
use keel::prelude::*;
use keel::time::Duration;

use crate::utils::{boot, run_ticks, wait_seq, SeqTracker};

/// Ownership violations are ordinary recoverable errors.
#[test]
fn ownership_rules() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                prober => { entry: prober_body, priority: 2, stack_size: 4096 },
            },
        }
    }

    static LOCK: Mutex<SystemTraits> = Mutex::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn prober_body() {
        // Releasing a mutex nobody holds is an ownership violation
        assert_eq!(LOCK.unlock(), Err(UnlockMutexError::NotOwner));

        LOCK.lock().unwrap();

        // This mutex is not re-entrant
        assert_eq!(LOCK.lock(), Err(LockMutexError::Deadlock));
        assert_eq!(LOCK.try_lock(), Err(TryLockMutexError::Deadlock));

        LOCK.unlock().unwrap();
        assert_eq!(LOCK.unlock(), Err(UnlockMutexError::NotOwner));

        // A free mutex is immediately acquirable
        LOCK.try_lock().unwrap();
        LOCK.unlock().unwrap();

        SEQ.expect_and_replace(0, 1);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 1);
}

/// Priority inheritance keeps a middle-priority task off the processor
/// while a low-priority task holds a lock a high-priority task wants.
///
/// 1. (`seq`: 0 → 1) `low` acquires the lock and wakes `high`.
/// 2. `high` preempts `low` and blocks on the lock, boosting `low` to
///    `high`'s priority.
/// 3. (`seq`: 1 → 2) `low`, still boosted, wakes `middle`, which must
///    *not* preempt it, although `middle` outranks `low`'s base priority.
/// 4. (`seq`: 2 → 3) `low` releases the lock: ownership passes to `high`,
///    the boost ends.
/// 5. (`seq`: 3 → 5) `high` finishes with the lock and terminates.
/// 6. (`seq`: 5 → 6) only now does `middle` run.
/// 7. (`seq`: 6 → 7) `low` runs last.
#[test]
fn priority_inheritance_bounds_inversion() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 8,
            tasks: {
                high => { entry: high_body, priority: 3, stack_size: 4096 },
                middle => { entry: middle_body, priority: 2, stack_size: 4096 },
                low => { entry: low_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static LOCK: Mutex<SystemTraits> = Mutex::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn high_body() {
        // Park until `low` owns the lock
        let _ = SystemTraits::notify_wait(keel::kernel::NotifyWaitFlags::CLEAR_ON_EXIT).unwrap();

        LOCK.lock().unwrap();
        SEQ.expect_and_replace(3, 4);
        LOCK.unlock().unwrap();
        SEQ.expect_and_replace(4, 5);
    }

    fn middle_body() {
        // Park until `low` signals; once ready, whether this runs is
        // purely a question of `low`'s *effective* priority
        let _ = SystemTraits::notify_wait(keel::kernel::NotifyWaitFlags::CLEAR_ON_EXIT).unwrap();

        SEQ.expect_and_replace(5, 6);
    }

    fn low_body() {
        LOCK.lock().unwrap();
        SEQ.expect_and_replace(0, 1);

        // `high` immediately preempts and blocks on the lock, donating its
        // priority
        SystemTraits::task(0).unwrap().notify(1, keel::kernel::NotifyAction::Overwrite).unwrap();

        SEQ.expect_and_replace(1, 2);

        // Without the boost, `middle` would preempt here and the sequence
        // numbers would not line up
        SystemTraits::task(1).unwrap().notify(1, keel::kernel::NotifyAction::Overwrite).unwrap();

        SEQ.expect_and_replace(2, 3);

        // Ownership transfer; `high` preempts
        LOCK.unlock().unwrap();

        SEQ.expect_and_replace(6, 7);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 7);
}

/// A `lock_timeout` on a mutex that is never released comes back with
/// `Timeout`, and no earlier than requested.
#[test]
fn lock_timeout_expires() {
    keel_port_std::use_port!(unsafe struct SystemTraits);
    keel::static_kernel! {
        impl Kernel for SystemTraits {
            priority_levels: 4,
            tasks: {
                holder => { entry: holder_body, priority: 2, stack_size: 4096 },
                contender => { entry: contender_body, priority: 1, stack_size: 4096 },
            },
        }
    }

    static LOCK: Mutex<SystemTraits> = Mutex::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn holder_body() {
        LOCK.lock().unwrap();
        SEQ.expect_and_replace(0, 1);

        // Sit on the lock well past the contender's patience
        SystemTraits::delay(Duration::from_ticks(10)).unwrap();

        LOCK.unlock().unwrap();
        SEQ.expect_and_replace(3, 4);
    }

    fn contender_body() {
        SEQ.expect_and_replace(1, 2);

        let before = SystemTraits::tick_count().unwrap();
        assert_eq!(
            LOCK.lock_timeout(Duration::from_ticks(3)),
            Err(LockMutexTimeoutError::Timeout)
        );
        let elapsed = SystemTraits::tick_count().unwrap() - before;
        assert!(elapsed >= 3, "woke up after only {elapsed} ticks");

        SEQ.expect_and_replace(2, 3);

        // The second attempt outlives the holder's nap and succeeds
        LOCK.lock_timeout(Duration::from_ticks(20)).unwrap();
        LOCK.unlock().unwrap();
        SEQ.expect_and_replace(4, 5);
    }

    boot::<SystemTraits>();
    wait_seq::<SystemTraits>(&SEQ, 2);

    run_ticks::<SystemTraits>(3);
    wait_seq::<SystemTraits>(&SEQ, 3);

    run_ticks::<SystemTraits>(7);
    wait_seq::<SystemTraits>(&SEQ, 5);
}
