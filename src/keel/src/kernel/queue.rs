//! Message queues
use core::{fmt, mem::MaybeUninit, ptr::NonNull};

use super::{
    error::{
        QueryError, ReceiveQueueError, ReceiveQueueTimeoutError, SendQueueError,
        SendQueueTimeoutError, TryReceiveQueueError, TrySendQueueError,
    },
    expect_waitable_context, klock, task,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, Port,
};
use crate::time::Duration;
use crate::utils::{mem::uninit_array, RawCell};

/// The largest supported element size, in bytes.
///
/// Elements are copied in and out of the buffer (and across blocked peers'
/// stacks) under CPU Lock, so their size bounds both the buffer footprint
/// and the critical-section length.
pub const QUEUE_ITEM_SIZE_MAX: usize = 256;

/// A fixed-capacity FIFO message channel.
///
/// Elements are transferred by copy: a sender's element is copied into the
/// buffer (or straight into a blocked receiver's stack slot), so the
/// element type must be [`Copy`] and must not contain any form of embedded
/// ownership. Strict FIFO order of elements is the only ordering guarantee;
/// *tasks* blocked on the queue are served most-urgent-first.
///
/// Queues are intended to be instantiated as `static` items:
///
/// ```rust,ignore
/// static EVENTS: Queue<SystemTraits, Event, 16> = Queue::new();
/// ```
pub struct Queue<System: Port, T, const N: usize> {
    /// The circular element buffer. Only the `count` elements starting at
    /// `head` (mod `N`) are initialized.
    storage: RawCell<[MaybeUninit<T>; N]>,

    /// The index of the oldest element.
    head: klock::CpuLockCell<System, usize>,

    /// The number of elements currently stored.
    count: klock::CpuLockCell<System, usize>,

    /// Tasks blocked in `send`, most urgent first. Non-empty only while the
    /// buffer is full.
    send_wait_queue: WaitQueue<System>,

    /// Tasks blocked in `receive`, most urgent first. Non-empty only while
    /// the buffer is empty.
    recv_wait_queue: WaitQueue<System>,
}

// Safety: The buffer is only accessed under CPU Lock, which also guards the
// indices describing which elements are initialized
unsafe impl<System: Port, T: Send, const N: usize> Sync for Queue<System, T, N> {}

impl<System: Port, T: Copy + Send + 'static, const N: usize> Queue<System, T, N> {
    const LAYOUT_OK: () = {
        assert!(N > 0, "a queue needs at least one slot");
        assert!(
            core::mem::size_of::<T>() <= QUEUE_ITEM_SIZE_MAX,
            "element type is too large"
        );
    };

    /// Construct a `Queue`.
    pub const fn new() -> Self {
        let () = Self::LAYOUT_OK;
        Self {
            storage: RawCell::new(uninit_array()),
            head: klock::CpuLockCell::new(0),
            count: klock::CpuLockCell::new(0),
            send_wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            recv_wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<System: Port, T: Copy + Send + 'static, const N: usize> Default for Queue<System, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<System: Kernel, T, const N: usize> fmt::Debug for Queue<System, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("self", &(self as *const _))
            .field("head", &self.head)
            .field("count", &self.count)
            .field("send_wait_queue", &self.send_wait_queue)
            .field("recv_wait_queue", &self.recv_wait_queue)
            .finish_non_exhaustive()
    }
}

impl<System: Kernel, T: Copy + Send + 'static, const N: usize> Queue<System, T, N> {
    /// Copy `value` into the queue, blocking the calling task while the
    /// queue is full.
    pub fn send(&'static self, value: T) -> Result<(), SendQueueError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        match self.send_core(lock.borrow_mut(), &value) {
            SendOutcome::Buffered => {}
            SendOutcome::Handoff => task::unlock_cpu_and_check_preemption(lock),
            SendOutcome::Full => {
                // Stage the element on this task's stack; whichever receive
                // operation frees a slot will copy it over before waking us.
                self.send_wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::QueueSend(erase(&value)));
            }
        }

        Ok(())
    }

    /// Copy `value` into the queue, blocking the calling task for at most
    /// `timeout` while the queue is full.
    pub fn send_timeout(
        &'static self,
        value: T,
        timeout: Duration,
    ) -> Result<(), SendQueueTimeoutError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        match self.send_core(lock.borrow_mut(), &value) {
            SendOutcome::Buffered => {}
            SendOutcome::Handoff => task::unlock_cpu_and_check_preemption(lock),
            SendOutcome::Full => {
                self.send_wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::QueueSend(erase(&value)),
                    timeout.as_ticks(),
                )?;
            }
        }

        Ok(())
    }

    /// Copy `value` into the queue if space is immediately available; fail
    /// with `QueueFull` otherwise.
    pub fn try_send(&'static self, value: T) -> Result<(), TrySendQueueError> {
        let mut lock = klock::lock_cpu::<System>()?;

        match self.send_core(lock.borrow_mut(), &value) {
            SendOutcome::Buffered => Ok(()),
            SendOutcome::Handoff => {
                task::unlock_cpu_and_check_preemption(lock);
                Ok(())
            }
            SendOutcome::Full => Err(TrySendQueueError::QueueFull),
        }
    }

    /// Remove and return the oldest element, blocking the calling task
    /// while the queue is empty.
    pub fn receive(&'static self) -> Result<T, ReceiveQueueError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        if let Some((value, woke_sender)) = self.receive_core(lock.borrow_mut()) {
            if woke_sender {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(value);
        }

        // Park until a sender fills the slot staged on this task's stack
        let mut slot = MaybeUninit::<T>::uninit();
        self.recv_wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::QueueReceive(erase_mut(&mut slot)),
        );

        // Safety: The wait completed, so the wake-upper filled `slot`
        Ok(unsafe { slot.assume_init() })
    }

    /// Remove and return the oldest element, blocking the calling task for
    /// at most `timeout` while the queue is empty.
    pub fn receive_timeout(&'static self, timeout: Duration) -> Result<T, ReceiveQueueTimeoutError> {
        let mut lock = klock::lock_cpu::<System>()?;
        expect_waitable_context::<System>()?;

        if let Some((value, woke_sender)) = self.receive_core(lock.borrow_mut()) {
            if woke_sender {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(value);
        }

        let mut slot = MaybeUninit::<T>::uninit();
        self.recv_wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::QueueReceive(erase_mut(&mut slot)),
            timeout.as_ticks(),
        )?;

        // Safety: The wait completed, so the wake-upper filled `slot`
        Ok(unsafe { slot.assume_init() })
    }

    /// Remove and return the oldest element if one is immediately
    /// available; fail with `QueueEmpty` otherwise.
    pub fn try_receive(&'static self) -> Result<T, TryReceiveQueueError> {
        let mut lock = klock::lock_cpu::<System>()?;

        if let Some((value, woke_sender)) = self.receive_core(lock.borrow_mut()) {
            if woke_sender {
                task::unlock_cpu_and_check_preemption(lock);
            }
            Ok(value)
        } else {
            Err(TryReceiveQueueError::QueueEmpty)
        }
    }

    /// Whether the queue currently stores no elements.
    pub fn is_empty(&'static self) -> Result<bool, QueryError> {
        let lock = klock::lock_cpu::<System>()?;
        Ok(*self.count.read(&*lock) == 0)
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&'static self) -> Result<bool, QueryError> {
        let lock = klock::lock_cpu::<System>()?;
        Ok(*self.count.read(&*lock) == N)
    }

    /// The number of free element slots.
    pub fn available(&'static self) -> Result<usize, QueryError> {
        let lock = klock::lock_cpu::<System>()?;
        Ok(N - *self.count.read(&*lock))
    }

    /// The total number of element slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Try to make `value` available to a consumer: hand it straight to a
    /// blocked receiver, or copy it into the buffer.
    fn send_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, System>,
        value: &T,
    ) -> SendOutcome {
        // A blocked receiver implies an empty buffer, so the element can
        // skip the buffer entirely.
        let staged_dst = self
            .recv_wait_queue
            .with_first_wait_payload(lock.borrow_mut(), |payload| match payload {
                Some(&WaitPayload::QueueReceive(dst)) => Some(dst),
                None => None,
                // Only `QueueReceive` waits are enqueued here
                Some(_) => unreachable!(),
            });

        if let Some(dst) = staged_dst {
            debug_assert_eq!(*self.count.read(&*lock), 0);
            // Safety: `dst` points to a `MaybeUninit<T>` on the waiting
            //         task's stack, staged by this queue's receive path and
            //         kept alive until the wait completes
            unsafe { (dst.as_ptr() as *mut T).write(*value) };
            assert!(self.recv_wait_queue.wake_up_one(lock.borrow_mut()));
            return SendOutcome::Handoff;
        }

        let count = *self.count.read(&*lock);
        if count == N {
            return SendOutcome::Full;
        }

        let head = *self.head.read(&*lock);
        // Safety: CPU Lock is held, and slot `head + count` is outside the
        //         initialized portion of the ring
        unsafe {
            let buffer = self.storage.get() as *mut MaybeUninit<T>;
            (*buffer.add((head + count) % N)).write(*value);
        }
        self.count.replace(&mut *lock, count + 1);

        SendOutcome::Buffered
    }

    /// Try to pop the oldest element. On success, additionally pull one
    /// blocked sender's staged element into the freed slot; the returned
    /// flag tells whether that happened (and thus a preemption check is
    /// due).
    fn receive_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, System>,
    ) -> Option<(T, bool)> {
        let count = *self.count.read(&*lock);
        if count == 0 {
            return None;
        }

        let head = *self.head.read(&*lock);
        let value = unsafe {
            let buffer = self.storage.get() as *const MaybeUninit<T>;
            // Safety: CPU Lock is held and slot `head` is initialized
            (*buffer.add(head)).assume_init_read()
        };
        self.head.replace(&mut *lock, (head + 1) % N);
        self.count.replace(&mut *lock, count - 1);

        // A slot just became free; complete one blocked sender, preserving
        // the element order (the staged element is the newest).
        let staged_src = self
            .send_wait_queue
            .with_first_wait_payload(lock.borrow_mut(), |payload| match payload {
                Some(&WaitPayload::QueueSend(src)) => Some(src),
                None => None,
                // Only `QueueSend` waits are enqueued here
                Some(_) => unreachable!(),
            });

        if let Some(src) = staged_src {
            let head = *self.head.read(&*lock);
            let count = *self.count.read(&*lock);
            debug_assert_eq!(count, N - 1);
            // Safety: `src` points to a `T` on the waiting task's stack,
            //         staged by this queue's send path and kept alive until
            //         the wait completes
            unsafe {
                let buffer = self.storage.get() as *mut MaybeUninit<T>;
                (*buffer.add((head + count) % N)).write(*(src.as_ptr() as *const T));
            }
            self.count.replace(&mut *lock, count + 1);
            assert!(self.send_wait_queue.wake_up_one(lock.borrow_mut()));
        }

        Some((value, staged_src.is_some()))
    }
}

enum SendOutcome {
    /// The element was copied into the buffer.
    Buffered,
    /// The element was handed straight to a blocked receiver, which is now
    /// Ready.
    Handoff,
    /// The buffer is at capacity.
    Full,
}

#[inline]
fn erase<T>(p: &T) -> NonNull<u8> {
    NonNull::from(p).cast()
}

#[inline]
fn erase_mut<T>(p: &mut MaybeUninit<T>) -> NonNull<u8> {
    NonNull::from(p).cast()
}
