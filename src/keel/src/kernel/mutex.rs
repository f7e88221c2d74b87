//! Mutexes
use core::fmt;

use super::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, TryLockMutexError,
        UnlockMutexError,
    },
    expect_waitable_context, klock, task,
    task::{Priority, TaskCb, TaskSt},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, Port,
};
use crate::time::Duration;
use crate::utils::Init;

/// A mutual-exclusion lock with priority inheritance.
///
/// While a task more urgent than the owner waits for the lock, the owner's
/// effective priority is temporarily raised to the waiter's level, bounding
/// the time the waiter can be delayed by less-urgent tasks (*priority
/// inversion*). The boost is undone when the owner releases the lock.
///
/// Mutexes are intended to be instantiated as `static` items:
///
/// ```rust,ignore
/// static LOCK: Mutex<SystemTraits> = Mutex::new();
///
/// fn writer_task() {
///     LOCK.lock().unwrap();
///     // ... exclusive section ...
///     LOCK.unlock().unwrap();
/// }
/// ```
pub struct Mutex<System: Port> {
    cb: MutexCb<System>,
}

impl<System: Port> Mutex<System> {
    /// Construct a `Mutex`.
    pub const fn new() -> Self {
        Self {
            cb: MutexCb {
                owning_task: klock::CpuLockCell::new(None),
                prev_mutex_held: klock::CpuLockCell::new(None),
                wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            },
        }
    }
}

impl<System: Port> Default for Mutex<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<System: Port> Init for Mutex<System> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<System: Kernel> fmt::Debug for Mutex<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.cb).finish()
    }
}

impl<System: Kernel> Mutex<System> {
    /// Acquire the mutex, blocking the calling task until it's available.
    ///
    /// A task that already owns the mutex fails with `Deadlock`; this
    /// mutex is not re-entrant.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        lock_mutex(&self.cb, lock.borrow_mut())?;
        Ok(())
    }

    /// Acquire the mutex, blocking the calling task for at most `timeout`.
    pub fn lock_timeout(&'static self, timeout: Duration) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        lock_mutex_timeout(&self.cb, lock.borrow_mut(), timeout)?;
        Ok(())
    }

    /// Acquire the mutex if it's immediately available; fail with `Timeout`
    /// otherwise.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        let running_task = precheck_and_get_running_task(lock.borrow_mut(), &self.cb)?;

        if poll_core(&self.cb, running_task, lock.borrow_mut()) {
            Ok(())
        } else {
            Err(TryLockMutexError::Timeout)
        }
    }

    /// Release the mutex, transferring the ownership to the most urgent
    /// waiter (if any) and restoring any inherited priority.
    ///
    /// Only the current owner may release the mutex.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        let task = System::state().running_task(lock.borrow_mut()).unwrap();

        if ptr_from_option_ref(*self.cb.owning_task.read(&*lock)) != task as *const _ {
            // The current task does not currently own the mutex.
            return Err(UnlockMutexError::NotOwner);
        }

        // Remove `self.cb` from the list of the mutexes held by the task.
        remove_from_held_list(lock.borrow_mut(), task, &self.cb);

        // Lower the task's effective priority back to what the remaining
        // held mutexes justify. This may cause preemption.
        let base_priority = *task.base_priority.read(&*lock);
        let effective_priority =
            evaluate_task_effective_priority(lock.borrow_mut(), task, base_priority);
        task.effective_priority
            .replace(&mut *lock, effective_priority);

        // Wake up the next waiter
        unlock_mutex_unchecked(&self.cb, lock.borrow_mut());

        task::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }
}

/// *Mutex control block* - the state data of a mutex.
#[doc(hidden)]
pub struct MutexCb<System: Port> {
    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the task.
    pub(super) prev_mutex_held: klock::CpuLockCell<System, Option<&'static Self>>,

    /// The task that currently owns the mutex lock.
    pub(super) owning_task: klock::CpuLockCell<System, Option<&'static TaskCb<System>>>,

    /// Wait objects of the tasks waiting for the lock, most urgent first.
    pub(super) wait_queue: WaitQueue<System>,
}

impl<System: Kernel> fmt::Debug for MutexCb<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .field(
                "prev_mutex_held",
                // prevent O((# of held mutexes)²)-order debug printing
                &self
                    .prev_mutex_held
                    .debug_fmt_with(|x, f| fmt::Debug::fmt(&x.map(|x| x as *const _), f)),
            )
            .field(
                "owning_task",
                // break infinite recursion (TaskCb → MutexCb → TaskCb → ...)
                &self
                    .owning_task
                    .debug_fmt_with(|x, f| fmt::Debug::fmt(&x.map(|x| x as *const _), f)),
            )
            .finish()
    }
}

/// Check the error conditions covered by [`LockMutexPrecheckError`].
///
///  - `Deadlock`: The current task already owns the mutex.
///
/// Returns the currently running task for convenience of the caller.
#[inline]
fn precheck_and_get_running_task<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    mutex_cb: &'static MutexCb<System>,
) -> Result<&'static TaskCb<System>, LockMutexPrecheckError> {
    let task = System::state().running_task(lock.borrow_mut()).unwrap();

    if ptr_from_option_ref(*mutex_cb.owning_task.read(&*lock)) == task as *const _ {
        return Err(LockMutexPrecheckError::Deadlock);
    }

    Ok(task)
}

/// Reevaluate the task's effective priority and return the result.
/// (This function doesn't update [`TaskCb::effective_priority`].)
/// The base priority is assumed to be `base_priority`.
///
/// The effective priority is the maximum of the base priority and the
/// priorities of the most urgent waiter of every mutex the task holds.
pub(super) fn evaluate_task_effective_priority<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    task: &'static TaskCb<System>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = *task.last_mutex_held.read(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        if let Some(waiting_task) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
            let waiter_priority = *waiting_task.effective_priority.read(&*lock);
            effective_priority = effective_priority.max(waiter_priority);
        }

        maybe_mutex_cb = *mutex_cb.prev_mutex_held.read(&*lock);
    }

    effective_priority
}

/// Check if the current state of a mutex satisfies the wait condition.
///
/// If it satisfies the wait condition, this function updates it and returns
/// `true`. Otherwise, it returns `false`, indicating the calling task should
/// be blocked.
#[inline]
fn poll_core<System: Kernel>(
    mutex_cb: &'static MutexCb<System>,
    running_task: &'static TaskCb<System>,
    lock: klock::CpuLockTokenRefMut<'_, System>,
) -> bool {
    if mutex_cb.owning_task.read(&*lock).is_some() {
        false
    } else {
        lock_core(mutex_cb, running_task, lock);
        true
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running or Blocked state.
#[inline]
fn lock_core<System: Kernel>(
    mutex_cb: &'static MutexCb<System>,
    task: &'static TaskCb<System>,
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
) {
    debug_assert!(matches!(
        *task.st.read(&*lock),
        TaskSt::Running | TaskSt::Blocked
    ));

    mutex_cb.owning_task.replace(&mut *lock, Some(task));

    // Push `mutex_cb` to the list of the mutexes held by the task.
    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb
        .prev_mutex_held
        .replace(&mut *lock, prev_mutex_held);
}

/// Donate the caller's effective priority to the mutex's current owner
/// before the caller starts waiting.
///
/// The donation is single-level: it raises this owner, repositioning it in
/// whatever list currently holds it, but does not walk chains of nested
/// mutexes. The boost is undone by `unlock`'s recomputation.
fn donate_priority_to_owner<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    mutex_cb: &'static MutexCb<System>,
    caller: &'static TaskCb<System>,
) {
    // The mutex is contended, so it must have an owner
    let owner = (*mutex_cb.owning_task.read(&*lock)).unwrap();

    let caller_priority = *caller.effective_priority.read(&*lock);
    let owner_priority = *owner.effective_priority.read(&*lock);

    if caller_priority <= owner_priority {
        return;
    }

    let old_effective_priority = owner
        .effective_priority
        .replace(&mut *lock, caller_priority);

    match *owner.st.read(&*lock) {
        TaskSt::Ready => unsafe {
            // Move the owner within the ready queue
            //
            // Safety: The owner was inserted to the ready queue with an
            // effective priority identical to `old_effective_priority`.
            System::state().task_ready_queue.reorder_task(
                lock.borrow_mut().into(),
                owner,
                caller_priority,
                old_effective_priority,
            );
        },
        TaskSt::Blocked => {
            // Reposition the owner in the wait queue it's blocked on, if
            // that queue is priority-ordered
            super::wait::reorder_wait_of_task(lock.borrow_mut(), owner);
        }
        TaskSt::Running => {
            // The owner is the task being preempted by the caller; raising
            // its priority requires no repositioning
        }
        TaskSt::Terminated => {
            // The owner terminated while holding the lock; the lock is
            // permanently wedged and the donation is moot
        }
        TaskSt::PendingStart => unreachable!(),
    }
}

#[inline]
fn lock_mutex<System: Kernel>(
    mutex_cb: &'static MutexCb<System>,
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
) -> Result<(), LockMutexError> {
    let running_task = precheck_and_get_running_task(lock.borrow_mut(), mutex_cb)?;

    if !poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        // The current state does not satisfy the wait condition. In this
        // case, start waiting. The wake-upper is responsible for using
        // `lock_core` to complete the effect of the wait operation.
        donate_priority_to_owner(lock.borrow_mut(), mutex_cb, running_task);
        mutex_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb));
    }

    Ok(())
}

#[inline]
fn lock_mutex_timeout<System: Kernel>(
    mutex_cb: &'static MutexCb<System>,
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    timeout: Duration,
) -> Result<(), LockMutexTimeoutError> {
    let running_task = precheck_and_get_running_task(lock.borrow_mut(), mutex_cb)?;

    if !poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        // The current state does not satisfy the wait condition. In this
        // case, start waiting. The wake-upper is responsible for using
        // `lock_core` to complete the effect of the wait operation.
        donate_priority_to_owner(lock.borrow_mut(), mutex_cb, running_task);
        mutex_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::Mutex(mutex_cb),
            timeout.as_ticks(),
        )?;
    }

    Ok(())
}

/// Remove `mutex_cb` from the list of mutexes held by `task`.
///
/// Unlike a strict lock-order discipline, mutexes may be released in any
/// order, so this walks the held list to find the predecessor.
fn remove_from_held_list<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    task: &'static TaskCb<System>,
    mutex_cb: &'static MutexCb<System>,
) {
    let mut maybe_cur = *task.last_mutex_held.read(&*lock);

    if ptr_from_option_ref(maybe_cur) == mutex_cb as *const _ {
        let next = *mutex_cb.prev_mutex_held.read(&*lock);
        task.last_mutex_held.replace(&mut *lock, next);
    } else {
        while let Some(cur) = maybe_cur {
            let prev = *cur.prev_mutex_held.read(&*lock);
            if ptr_from_option_ref(prev) == mutex_cb as *const _ {
                let next = *mutex_cb.prev_mutex_held.read(&*lock);
                cur.prev_mutex_held.replace(&mut *lock, next);
                break;
            }
            maybe_cur = prev;
        }
    }

    mutex_cb.prev_mutex_held.replace(&mut *lock, None);
}

/// Wake up the next waiter of the mutex, transferring the ownership to it.
///
/// This function doesn't restore the previous owner's effective priority.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<System: Kernel>(
    mutex_cb: &'static MutexCb<System>,
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
) {
    // Check if there's any other task waiting on the mutex
    if let Some(next_task) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task`
        lock_core(mutex_cb, next_task, lock.borrow_mut());

        // Wake up the next waiter
        assert!(mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()));
    } else {
        // There's no one waiting
        mutex_cb.owning_task.replace(&mut *lock, None);
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
