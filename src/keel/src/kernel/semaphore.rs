//! Semaphores
use core::fmt;

use super::{
    error::{
        GiveSemaphoreError, QueryError, TakeSemaphoreError, TakeSemaphoreTimeoutError,
        TryTakeSemaphoreError,
    },
    expect_waitable_context, klock, task,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, Port,
};
use crate::time::Duration;

/// Unsigned integer type representing the number of permits held by a
/// [`Semaphore`].
pub type SemaphoreValue = usize;

/// A counting semaphore: a bounded permit counter plus a wait queue.
///
/// A *binary* semaphore is simply a `Semaphore` constructed with
/// `maximum == 1`.
///
/// Semaphores are intended to be instantiated as `static` items:
///
/// ```rust,ignore
/// static READY: Semaphore<SystemTraits> = Semaphore::new(0, 1);
/// ```
pub struct Semaphore<System: Port> {
    cb: SemaphoreCb<System>,
}

impl<System: Port> Semaphore<System> {
    /// Construct a `Semaphore` with the specified initial and maximum
    /// permit count.
    ///
    /// Panics (at compile time when used in a `const`/`static` context) if
    /// `initial > maximum` or `maximum == 0`.
    pub const fn new(initial: SemaphoreValue, maximum: SemaphoreValue) -> Self {
        assert!(maximum > 0, "a semaphore needs at least one permit");
        assert!(initial <= maximum, "initial permit count exceeds the maximum");
        Self {
            cb: SemaphoreCb {
                value: klock::CpuLockCell::new(initial),
                max_value: maximum,
                wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            },
        }
    }
}

impl<System: Kernel> fmt::Debug for Semaphore<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.cb).finish()
    }
}

impl<System: Kernel> Semaphore<System> {
    /// Deposit one permit, waking the most urgent waiting task if any.
    ///
    /// Fails with `InvalidState` if the semaphore is already at its
    /// configured maximum.
    pub fn give(&'static self) -> Result<(), GiveSemaphoreError> {
        let lock = klock::lock_cpu::<System>()?;
        signal(&self.cb, lock)
    }

    /// Remove one permit, blocking the calling task until one is available.
    pub fn take(&'static self) -> Result<(), TakeSemaphoreError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        if !poll_core(self.cb.value.write(&mut *lock)) {
            // The current state does not satisfy the wait condition. In
            // this case, start waiting. The wake-upper is responsible for
            // using `poll_core` to complete the effect of the wait
            // operation.
            self.cb
                .wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Semaphore);
        }

        Ok(())
    }

    /// Remove one permit, blocking the calling task for at most `timeout`.
    pub fn take_timeout(&'static self, timeout: Duration) -> Result<(), TakeSemaphoreTimeoutError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        if !poll_core(self.cb.value.write(&mut *lock)) {
            // The current state does not satisfy the wait condition. In
            // this case, start waiting. The wake-upper is responsible for
            // using `poll_core` to complete the effect of the wait
            // operation.
            self.cb.wait_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::Semaphore,
                timeout.as_ticks(),
            )?;
        }

        Ok(())
    }

    /// Remove one permit if one is immediately available; fail with
    /// `Timeout` otherwise.
    pub fn try_take(&'static self) -> Result<(), TryTakeSemaphoreError> {
        let mut lock = klock::lock_cpu::<System>()?;

        if poll_core(self.cb.value.write(&mut *lock)) {
            Ok(())
        } else {
            Err(TryTakeSemaphoreError::Timeout)
        }
    }

    /// Get the current permit count.
    pub fn value(&'static self) -> Result<SemaphoreValue, QueryError> {
        let lock = klock::lock_cpu::<System>()?;
        Ok(*self.cb.value.read(&*lock))
    }
}

/// *Semaphore control block* - the state data of a semaphore.
#[doc(hidden)]
pub struct SemaphoreCb<System: Port> {
    pub(super) value: klock::CpuLockCell<System, SemaphoreValue>,
    pub(super) max_value: SemaphoreValue,

    pub(super) wait_queue: WaitQueue<System>,
}

impl<System: Kernel> fmt::Debug for SemaphoreCb<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Check if the current state of a semaphore, `value`, satisfies the wait
/// condition.
///
/// If `value` satisfies the wait condition, this function updates `value`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

#[inline]
fn signal<System: Kernel>(
    semaphore_cb: &'static SemaphoreCb<System>,
    mut lock: klock::CpuLockGuard<System>,
) -> Result<(), GiveSemaphoreError> {
    let value = *semaphore_cb.value.read(&*lock);

    if value >= semaphore_cb.max_value {
        return Err(GiveSemaphoreError::InvalidState);
    }

    if semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // We just woke up a task. The permit is handed to that task
        // directly, bypassing the counter.
        task::unlock_cpu_and_check_preemption(lock);
    } else {
        // There's no task to wake up; deposit the permit
        semaphore_cb.value.replace(&mut *lock, value + 1);
    }

    Ok(())
}
