use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use keel::kernel::ResultCode;
            /// assert_eq!(ResultCode::Timeout.as_str(), "Timeout");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel can produce.
    ///
    /// The discriminants are loosely derived from the equivalent μITRON4.0
    /// error codes where one exists, so that a port exposing a C API can
    /// pass them through unchanged.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is
        /// available.
        Success = 0,
        /// The kernel has not been started yet.
        NotInitialized = -2,
        /// The tick machinery failed in a way the kernel cannot recover
        /// from. Reported through [`fatal`](crate::kernel::fatal) only.
        TickError = -5,
        /// The port's context-switch machinery failed. Reported through
        /// [`fatal`](crate::kernel::fatal) only.
        ContextSwitchError = -6,
        /// A task priority is outside the configured range. Violations are
        /// caught at compile time by
        /// [`static_kernel!`](crate::static_kernel), so this code only
        /// travels through diagnostic surfaces.
        InvalidPriority = -17,
        /// The current context or the target object's state disallows the
        /// operation.
        InvalidState = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        Deadlock = -30,
        /// A memory pool has no free blocks left.
        NoMemory = -33,
        /// A pointer does not refer to a block of the pool it was returned
        /// to.
        InvalidPointer = -34,
        /// A queue is at capacity.
        QueueFull = -43,
        /// A queue has no elements.
        QueueEmpty = -44,
        /// The operation timed out.
        Timeout = -50,
        /// A task overran its stack. Reported through
        /// [`fatal`](crate::kernel::fatal) only.
        StackOverflow = -56,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` have the same
                //         representation type, and the representation of
                //         `ResultCode` is a superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

/// Define an internal error type that maps onto a subset of multiple public
/// error types.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_error! {
    mod tick_error {}
    /// Error type for [`Kernel::tick`].
    ///
    /// [`Kernel::tick`]: crate::kernel::Kernel::tick
    pub enum TickError {
        /// The kernel has not been started yet.
        NotInitialized,
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod time_error {}
    /// Error type for [`Kernel::tick_count`].
    ///
    /// [`Kernel::tick_count`]: crate::kernel::Kernel::tick_count
    pub enum TimeError {
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`Kernel::yield_now`].
    ///
    /// [`Kernel::yield_now`]: crate::kernel::Kernel::yield_now
    pub enum YieldError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod delay_error {}
    /// Error type for [`Kernel::delay`].
    ///
    /// [`Kernel::delay`]: crate::kernel::Kernel::delay
    pub enum DelayError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod current_task_error {}
    /// Error type for [`Kernel::current_task`].
    ///
    /// [`Kernel::current_task`]: crate::kernel::Kernel::current_task
    pub enum CurrentTaskError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`].
    ///
    /// [`Mutex::lock`]: crate::kernel::Mutex::lock
    pub enum LockMutexError {
        /// The current task already owns the mutex.
        Deadlock,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod lock_mutex_timeout_error {}
    /// Error type for [`Mutex::lock_timeout`].
    ///
    /// [`Mutex::lock_timeout`]: crate::kernel::Mutex::lock_timeout
    pub enum LockMutexTimeoutError {
        /// The timeout elapsed before the mutex could be acquired.
        Timeout,
        /// The current task already owns the mutex.
        Deadlock,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`].
    ///
    /// [`Mutex::try_lock`]: crate::kernel::Mutex::try_lock
    pub enum TryLockMutexError {
        /// The mutex is held by another task.
        Timeout,
        /// The current task already owns the mutex.
        Deadlock,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`].
    ///
    /// [`Mutex::unlock`]: crate::kernel::Mutex::unlock
    pub enum UnlockMutexError {
        /// The current task does not own the mutex.
        NotOwner,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod give_semaphore_error {}
    /// Error type for [`Semaphore::give`].
    ///
    /// [`Semaphore::give`]: crate::kernel::Semaphore::give
    pub enum GiveSemaphoreError {
        /// The semaphore is already at its maximum value, or CPU Lock is
        /// active.
        InvalidState,
    }
}

define_error! {
    mod take_semaphore_error {}
    /// Error type for [`Semaphore::take`].
    ///
    /// [`Semaphore::take`]: crate::kernel::Semaphore::take
    pub enum TakeSemaphoreError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod take_semaphore_timeout_error {}
    /// Error type for [`Semaphore::take_timeout`].
    ///
    /// [`Semaphore::take_timeout`]: crate::kernel::Semaphore::take_timeout
    pub enum TakeSemaphoreTimeoutError {
        /// The timeout elapsed before a permit became available.
        Timeout,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod try_take_semaphore_error {}
    /// Error type for [`Semaphore::try_take`].
    ///
    /// [`Semaphore::try_take`]: crate::kernel::Semaphore::try_take
    pub enum TryTakeSemaphoreError {
        /// No permit was available.
        Timeout,
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod send_queue_error {}
    /// Error type for [`Queue::send`].
    ///
    /// [`Queue::send`]: crate::kernel::Queue::send
    pub enum SendQueueError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod send_queue_timeout_error {}
    /// Error type for [`Queue::send_timeout`].
    ///
    /// [`Queue::send_timeout`]: crate::kernel::Queue::send_timeout
    pub enum SendQueueTimeoutError {
        /// The timeout elapsed before buffer space became available.
        Timeout,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod try_send_queue_error {}
    /// Error type for [`Queue::try_send`].
    ///
    /// [`Queue::try_send`]: crate::kernel::Queue::try_send
    pub enum TrySendQueueError {
        /// The queue is at capacity.
        QueueFull,
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod receive_queue_error {}
    /// Error type for [`Queue::receive`].
    ///
    /// [`Queue::receive`]: crate::kernel::Queue::receive
    pub enum ReceiveQueueError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod receive_queue_timeout_error {}
    /// Error type for [`Queue::receive_timeout`].
    ///
    /// [`Queue::receive_timeout`]: crate::kernel::Queue::receive_timeout
    pub enum ReceiveQueueTimeoutError {
        /// The timeout elapsed before an element arrived.
        Timeout,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod try_receive_queue_error {}
    /// Error type for [`Queue::try_receive`].
    ///
    /// [`Queue::try_receive`]: crate::kernel::Queue::try_receive
    pub enum TryReceiveQueueError {
        /// The queue has no elements.
        QueueEmpty,
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod notify_error {}
    /// Error type for [`TaskRef::notify`] and [`TaskRef::notify_from_isr`].
    ///
    /// [`TaskRef::notify`]: crate::kernel::TaskRef::notify
    /// [`TaskRef::notify_from_isr`]: crate::kernel::TaskRef::notify_from_isr
    pub enum NotifyError {
        /// A notification is already pending
        /// ([`OverwriteIfEmpty`](crate::kernel::NotifyAction::OverwriteIfEmpty)
        /// only), or CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod notify_wait_error {}
    /// Error type for [`Kernel::notify_wait`].
    ///
    /// [`Kernel::notify_wait`]: crate::kernel::Kernel::notify_wait
    pub enum NotifyWaitError {
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod notify_wait_timeout_error {}
    /// Error type for [`Kernel::notify_wait_timeout`].
    ///
    /// [`Kernel::notify_wait_timeout`]: crate::kernel::Kernel::notify_wait_timeout
    pub enum NotifyWaitTimeoutError {
        /// The timeout elapsed with no notification pending.
        Timeout,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod try_notify_wait_error {}
    /// Error type for [`Kernel::try_notify_wait`].
    ///
    /// [`Kernel::try_notify_wait`]: crate::kernel::Kernel::try_notify_wait
    pub enum TryNotifyWaitError {
        /// No notification is pending.
        Timeout,
        /// CPU Lock is active, or the current context is not a task context.
        InvalidState,
    }
}

define_error! {
    mod query_error {}
    /// Error type for the side-effect-free state accessors
    /// ([`Queue::is_empty`], [`Semaphore::value`], and friends).
    ///
    /// [`Queue::is_empty`]: crate::kernel::Queue::is_empty
    /// [`Semaphore::value`]: crate::kernel::Semaphore::value
    pub enum QueryError {
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod allocate_pool_error {}
    /// Error type for [`StaticPool::allocate`].
    ///
    /// [`StaticPool::allocate`]: crate::pool::StaticPool::allocate
    pub enum AllocatePoolError {
        /// The pool has no free blocks left.
        NoMemory,
    }
}

define_error! {
    mod deallocate_pool_error {}
    /// Error type for [`StaticPool::deallocate`].
    ///
    /// [`StaticPool::deallocate`]: crate::pool::StaticPool::deallocate
    pub enum DeallocatePoolError {
        /// The pointer does not refer to a block of this pool.
        InvalidPointer,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for the tickless idle operations.
    pub enum SleepError {
        /// CPU Lock is active.
        InvalidState,
    }
}

define_error! {
    mod configure_idle_error {}
    /// Error type for [`Kernel::configure_idle`].
    ///
    /// [`Kernel::configure_idle`]: crate::kernel::Kernel::configure_idle
    pub enum ConfigureIdleError {
        /// CPU Lock is active.
        InvalidState,
    }
}

define_suberror! {
    /// `InvalidState`
    #[into(TickError)]
    #[into(TimeError)]
    #[into(YieldError)]
    #[into(DelayError)]
    #[into(CurrentTaskError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(GiveSemaphoreError)]
    #[into(TakeSemaphoreError)]
    #[into(TakeSemaphoreTimeoutError)]
    #[into(TryTakeSemaphoreError)]
    #[into(SendQueueError)]
    #[into(SendQueueTimeoutError)]
    #[into(TrySendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(ReceiveQueueTimeoutError)]
    #[into(TryReceiveQueueError)]
    #[into(NotifyError)]
    #[into(NotifyWaitError)]
    #[into(NotifyWaitTimeoutError)]
    #[into(TryNotifyWaitError)]
    #[into(QueryError)]
    #[into(SleepError)]
    #[into(ConfigureIdleError)]
    pub(crate) enum InvalidStateError {
        InvalidState,
    }
}

define_suberror! {
    /// The result of a wait operation, set by a wake-upper.
    #[into(LockMutexTimeoutError)]
    #[into(TakeSemaphoreTimeoutError)]
    #[into(SendQueueTimeoutError)]
    #[into(ReceiveQueueTimeoutError)]
    #[into(NotifyWaitTimeoutError)]
    pub(crate) enum WaitTimeoutError {
        Timeout,
    }
}

define_suberror! {
    /// The error conditions shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally
    /// by the mutex implementation.
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    pub(crate) enum LockMutexPrecheckError {
        Deadlock,
    }
}
