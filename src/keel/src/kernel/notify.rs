//! Task notifications
//!
//! Every task carries a two-word *notification slot*: a 32-bit value and a
//! pending indicator. Notifying is lock-free (the slot is mutated with
//! atomic read-modify-write operations only), which makes it the cheapest
//! way for an interrupt handler to signal a task. Only the act of waking a
//! task that is blocked in a notification wait takes the CPU Lock, for a
//! bounded span and without ever blocking the notifier.
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

use super::{
    error::{
        NotifyError, NotifyWaitError, NotifyWaitTimeoutError, TryNotifyWaitError,
        WaitTimeoutError,
    },
    expect_waitable_context, klock, task,
    task::{TaskCb, TaskRef},
    wait, Kernel,
};
use crate::time::Duration;

/// No notification is pending and the owner is not waiting for one.
const STATE_IDLE: u8 = 0;
/// The owning task is blocked waiting for a notification.
const STATE_WAITING: u8 = 1;
/// A notification is pending.
const STATE_PENDING: u8 = 2;

/// Specifies how [`TaskRef::notify`] combines the supplied value into the
/// target's notification slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Bitwise-or the supplied value into the slot. Turns the slot into a
    /// set of event flags.
    SetBits,
    /// Add one to the slot, saturating at `u32::MAX`. The supplied value is
    /// ignored. Turns the slot into a counting-semaphore substitute.
    Increment,
    /// Unconditionally replace the slot's value. A simple data handoff that
    /// silently discards an unconsumed predecessor.
    Overwrite,
    /// Replace the slot's value only if no notification is pending; fail
    /// with `InvalidState` otherwise, signaling overflow to the notifier.
    OverwriteIfEmpty,
}

bitflags! {
    /// Controls when a notification wait clears the slot's value.
    ///
    /// With neither flag set, the value is left in place for a later
    /// [`TaskRef::notify_clear`].
    pub struct NotifyWaitFlags: u8 {
        /// Zero the value before blocking.
        const CLEAR_ON_ENTRY = 1 << 0;
        /// Zero the value after it has been returned.
        const CLEAR_ON_EXIT = 1 << 1;
    }
}

/// The per-task notification slot. Embedded in
/// [`TaskCb`](crate::kernel::TaskCb).
pub struct NotificationSlot {
    value: AtomicU32,
    state: AtomicU8,
}

impl NotificationSlot {
    pub(super) const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            state: AtomicU8::new(STATE_IDLE),
        }
    }
}

impl fmt::Debug for NotificationSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NotificationSlot")
            .field("value", &self.value.load(Ordering::Relaxed))
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl<System: Kernel> TaskRef<System> {
    /// Combine `value` into this task's notification slot per `action` and
    /// mark a notification pending, waking the task if it is blocked in a
    /// notification wait.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn notify(self, value: u32, action: NotifyAction) -> Result<(), NotifyError> {
        notify_inner::<System>(self.cb(), value, action)
    }

    /// The interrupt-context variant of [`Self::notify`].
    ///
    /// Never blocks and allocates nothing. If the woken task outranks the
    /// interrupted one, the context switch is pended and taken on return
    /// from the interrupt handler.
    pub fn notify_from_isr(self, value: u32, action: NotifyAction) -> Result<(), NotifyError> {
        notify_inner::<System>(self.cb(), value, action)
    }

    /// Read this task's notification value without consuming it.
    pub fn notify_peek(self) -> u32 {
        self.cb().notification.value.load(Ordering::Acquire)
    }

    /// Whether a notification is pending for this task.
    pub fn notification_pending(self) -> bool {
        self.cb().notification.state.load(Ordering::Acquire) == STATE_PENDING
    }

    /// Clear this task's pending notification (if any) and zero the value.
    /// Returns the value the slot held.
    pub fn notify_clear(self) -> u32 {
        let slot = &self.cb().notification;

        // Retract a pending indication, leaving a concurrent waiter's
        // `STATE_WAITING` untouched
        let _ = slot.state.compare_exchange(
            STATE_PENDING,
            STATE_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        slot.value.swap(0, Ordering::AcqRel)
    }
}

fn notify_inner<System: Kernel>(
    task_cb: &'static TaskCb<System>,
    value: u32,
    action: NotifyAction,
) -> Result<(), NotifyError> {
    if System::is_cpu_lock_active() {
        return Err(NotifyError::InvalidState);
    }

    let slot = &task_cb.notification;

    match action {
        NotifyAction::SetBits => {
            slot.value.fetch_or(value, Ordering::AcqRel);
        }
        NotifyAction::Increment => {
            // The stored value saturates rather than wrapping so that an
            // unserviced burst reads as "many", not as a small number again
            let _ = slot
                .value
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_add(1))
                });
        }
        NotifyAction::Overwrite => {
            slot.value.store(value, Ordering::Release);
        }
        NotifyAction::OverwriteIfEmpty => {
            if slot.state.load(Ordering::Acquire) == STATE_PENDING {
                return Err(NotifyError::InvalidState);
            }
            slot.value.store(value, Ordering::Release);
        }
    }

    let prev_state = slot.state.swap(STATE_PENDING, Ordering::AcqRel);

    if prev_state == STATE_WAITING {
        // The owner is blocked in a notification wait. Waking it needs the
        // scheduler structures, so take the CPU Lock: a bounded
        // interrupt-disable section, never a blocking acquire.
        let mut lock = klock::lock_cpu::<System>()?;

        let is_in_notify_wait =
            wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
                matches!(payload, Some(wait::WaitPayload::Notification))
            });

        if is_in_notify_wait {
            match wait::interrupt_task(lock.borrow_mut(), task_cb, Ok(())) {
                // The task is Ready now; a concurrent wake is also fine
                Ok(()) | Err(_) => {}
            }
        }

        // The woken task may outrank the interrupted context
        task::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

/// Block the calling task until a notification is pending, returning the
/// notification value. Implements [`Kernel::notify_wait`].
///
/// [`Kernel::notify_wait`]: crate::kernel::Kernel::notify_wait
pub(super) fn notify_wait<System: Kernel>(
    flags: NotifyWaitFlags,
) -> Result<u32, NotifyWaitError> {
    expect_waitable_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;

    if let Some(value) = consume_pending::<System>(lock.borrow_mut(), flags) {
        return Ok(value);
    }

    let task_cb = System::state().running_task(lock.borrow_mut()).unwrap();
    prepare_to_wait(&task_cb.notification, flags);

    wait::wait_no_queue(lock.borrow_mut(), wait::WaitPayload::Notification);

    // Nothing but a notification ends this wait
    let value = finish_wait::<System>(lock.borrow_mut(), flags, Ok(()));
    Ok(value.unwrap())
}

/// The timed variant of [`notify_wait`]. Implements
/// [`Kernel::notify_wait_timeout`].
///
/// [`Kernel::notify_wait_timeout`]: crate::kernel::Kernel::notify_wait_timeout
pub(super) fn notify_wait_timeout<System: Kernel>(
    flags: NotifyWaitFlags,
    timeout: Duration,
) -> Result<u32, NotifyWaitTimeoutError> {
    expect_waitable_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;

    if let Some(value) = consume_pending::<System>(lock.borrow_mut(), flags) {
        return Ok(value);
    }

    let task_cb = System::state().running_task(lock.borrow_mut()).unwrap();
    prepare_to_wait(&task_cb.notification, flags);

    let result = wait::wait_no_queue_timeout(
        lock.borrow_mut(),
        wait::WaitPayload::Notification,
        timeout.as_ticks(),
    )
    .map(|_| ());

    match finish_wait::<System>(lock.borrow_mut(), flags, result) {
        Some(value) => Ok(value),
        None => Err(NotifyWaitTimeoutError::Timeout),
    }
}

/// The polling variant of [`notify_wait`]. Implements
/// [`Kernel::try_notify_wait`].
///
/// [`Kernel::try_notify_wait`]: crate::kernel::Kernel::try_notify_wait
pub(super) fn try_notify_wait<System: Kernel>(
    flags: NotifyWaitFlags,
) -> Result<u32, TryNotifyWaitError> {
    expect_waitable_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;

    if let Some(value) = consume_pending::<System>(lock.borrow_mut(), flags) {
        Ok(value)
    } else {
        Err(TryNotifyWaitError::Timeout)
    }
}

/// Consume a pending notification of the running task, if any. Runs under
/// CPU Lock.
fn consume_pending<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    flags: NotifyWaitFlags,
) -> Option<u32> {
    let task_cb = System::state().running_task(lock.borrow_mut()).unwrap();
    let slot = &task_cb.notification;

    if slot.state.load(Ordering::Acquire) != STATE_PENDING {
        return None;
    }

    slot.state.store(STATE_IDLE, Ordering::Release);
    Some(read_value(slot, flags))
}

/// Apply `CLEAR_ON_ENTRY` and announce the upcoming wait to notifiers.
fn prepare_to_wait(slot: &NotificationSlot, flags: NotifyWaitFlags) {
    if flags.contains(NotifyWaitFlags::CLEAR_ON_ENTRY) {
        slot.value.store(0, Ordering::Release);
    }

    slot.state.store(STATE_WAITING, Ordering::Release);
}

/// Resolve a finished notification wait.
///
/// A wait is successful iff a notification is pending at the moment the
/// task resumed, even if the wait operation itself reported a timeout:
/// because a notifier may have fired in the instant between the timeout
/// processing and this check.
fn finish_wait<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    flags: NotifyWaitFlags,
    wait_result: Result<(), WaitTimeoutError>,
) -> Option<u32> {
    let task_cb = System::state().running_task(lock.borrow_mut()).unwrap();
    let slot = &task_cb.notification;

    let got_notified = slot.state.load(Ordering::Acquire) == STATE_PENDING;
    slot.state.store(STATE_IDLE, Ordering::Release);

    debug_assert!(got_notified || wait_result.is_err());

    if got_notified {
        Some(read_value(slot, flags))
    } else {
        None
    }
}

fn read_value(slot: &NotificationSlot, flags: NotifyWaitFlags) -> u32 {
    if flags.contains(NotifyWaitFlags::CLEAR_ON_EXIT) {
        slot.value.swap(0, Ordering::AcqRel)
    } else {
        slot.value.load(Ordering::Acquire)
    }
}
