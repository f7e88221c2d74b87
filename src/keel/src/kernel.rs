//! The RTOS kernel
//!
//! # Lifecycle
//!
//! An application defines a *system type* and attaches a kernel instance to
//! it with [`static_kernel!`](crate::static_kernel). The port supplies the
//! execution-environment primitives by implementing [`Port`]. Calling
//! [`Kernel::start`] hands the processor over to the scheduler; it never
//! returns. From that point on, an external time source is expected to call
//! [`Kernel::tick`] once per tick period.
//!
//! # Contexts
//!
//! Code runs in one of two contexts:
//!
//!  - **Task context**: inside a task's entry function. All operations,
//!    including the blocking ones, are allowed here.
//!  - **Interrupt context**: inside an interrupt handler or, more generally,
//!    any context that is not a task (including the startup code). Only
//!    non-blocking operations are allowed here.
//!
//! Blocking operations fail with an `InvalidState`-mapped error when called
//! from an interrupt context.
use core::mem::forget;

use crate::time::{Duration, Ticks};
use crate::utils::{binary_heap::VecLike, Init};

pub mod cfg;
mod error;
pub mod idle;
mod klock;
pub mod mutex;
pub mod notify;
pub mod queue;
pub mod semaphore;
pub mod task;
pub mod timeout;
mod wait;
pub use self::{
    error::*,
    idle::{IdleStats, SleepMode},
    mutex::Mutex,
    notify::{NotifyAction, NotifyWaitFlags},
    queue::Queue,
    semaphore::{Semaphore, SemaphoreValue},
    task::{Priority, TaskAttr, TaskCb, TaskRef, TaskStack},
};

/// Represents "system" types having sufficient trait `impl`s to instantiate
/// the kernel.
pub trait Kernel: Port + KernelCfg2 + Sized + 'static {
    /// Transfer the control to the highest-priority task.
    ///
    /// This method initializes every configured task and never returns. It
    /// panics if the kernel is already running or if it's called with CPU
    /// Lock active.
    fn start() -> ! {
        let mut lock = match klock::lock_cpu::<Self>() {
            Ok(lock) => lock,
            Err(_) => panic!("CPU Lock is active"),
        };

        if *Self::state().lifecycle.read(&*lock) != Lifecycle::PendingStart {
            panic!("the kernel is already running");
        }

        timeout::init::<Self>(lock.borrow_mut());

        for task_cb in Self::task_cb_pool() {
            task::init_task(lock.borrow_mut(), task_cb);
        }

        Self::state()
            .lifecycle
            .replace(&mut *lock, Lifecycle::Running);

        task::choose_next_running_task(lock.borrow_mut());

        // `dispatch_first_task` expects CPU Lock to be active
        forget(lock);

        // Safety: CPU Lock active, the kernel is in the startup phase, and
        //         `running_task` has just been chosen
        unsafe { Self::dispatch_first_task() }
    }

    /// Advance the kernel's notion of time by exactly one tick.
    ///
    /// Meant to be called by the external periodic time source (a hardware
    /// timer interrupt on a real target). Expired waits are woken here; if
    /// any woken task outranks the interrupted one, a context switch is
    /// requested and performed at the next safe point rather than inside
    /// this handler.
    fn tick() -> Result<(), TickError> {
        let mut lock = klock::lock_cpu::<Self>()?;

        if *Self::state().lifecycle.read(&*lock) != Lifecycle::Running {
            return Err(TickError::NotInitialized);
        }

        // A blown stack cannot be reported to the offending task; there is
        // no state left to trust.
        if let Some(running_task) = Self::state().running_task(lock.borrow_mut()) {
            if !task::stack_canary_ok(running_task) {
                fatal(ResultCode::StackOverflow);
            }
        }

        let lock = timeout::handle_tick::<Self>(lock, 1);

        // Wake-ups may have outranked the running task. Check for dispatch
        // and release CPU Lock.
        task::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Get the current tick count.
    fn tick_count() -> Result<Ticks, TimeError> {
        let mut lock = klock::lock_cpu::<Self>()?;
        Ok(timeout::tick_count::<Self>(lock.borrow_mut()))
    }

    /// Voluntarily relinquish the processor.
    ///
    /// A context switch happens only if another task of an equal or higher
    /// priority is ready; otherwise the calling task keeps running.
    fn yield_now() -> Result<(), YieldError> {
        task::yield_current_task::<Self>()
    }

    /// Block the calling task for the specified duration.
    fn delay(duration: Duration) -> Result<(), DelayError> {
        task::delay_current_task::<Self>(duration)
    }

    /// Get a reference to the task in the Running state.
    fn current_task() -> Result<TaskRef<Self>, CurrentTaskError> {
        task::current_task::<Self>()
    }

    /// Get a reference to the task with the specified zero-based
    /// configuration index.
    fn task(index: usize) -> Option<TaskRef<Self>> {
        Self::task_cb_pool().get(index).map(TaskRef::from_cb)
    }

    /// Block the calling task until a notification is pending, returning
    /// the notification value.
    fn notify_wait(flags: NotifyWaitFlags) -> Result<u32, NotifyWaitError> {
        notify::notify_wait::<Self>(flags)
    }

    /// Block the calling task until a notification is pending or `timeout`
    /// elapses, returning the notification value.
    fn notify_wait_timeout(
        flags: NotifyWaitFlags,
        timeout: Duration,
    ) -> Result<u32, NotifyWaitTimeoutError> {
        notify::notify_wait_timeout::<Self>(flags, timeout)
    }

    /// Consume a pending notification of the calling task if one exists;
    /// fail with `Timeout` otherwise.
    fn try_notify_wait(flags: NotifyWaitFlags) -> Result<u32, TryNotifyWaitError> {
        notify::try_notify_wait::<Self>(flags)
    }

    /// Enable or disable the tickless idle policy.
    fn idle_set_enabled(enabled: bool) -> Result<(), ConfigureIdleError> {
        idle::set_enabled::<Self>(enabled)
    }

    /// Configure the tickless idle policy: the low-power mode handed to the
    /// platform hook and the minimum predicted idle span that justifies the
    /// mode's entry/exit overhead.
    fn configure_idle(mode: SleepMode, min_sleep: Duration) -> Result<(), ConfigureIdleError> {
        idle::configure::<Self>(mode, min_sleep)
    }

    /// Check whether the idle path is allowed to enter a low-power state
    /// right now.
    fn should_sleep() -> Result<bool, SleepError> {
        idle::should_sleep::<Self>()
    }

    /// Enter a low-power state until (at most) the nearest deadline.
    ///
    /// Consulted from the idle path. Delegates the actual transition to
    /// [`Port::enter_low_power`] and reconciles the tick counter afterwards,
    /// because the tick source itself may have been suspended while
    /// sleeping.
    fn enter_sleep() -> Result<(), SleepError> {
        idle::enter_sleep::<Self>()
    }

    /// Get the accumulated tickless idle statistics.
    fn idle_stats() -> Result<IdleStats, SleepError> {
        idle::stats::<Self>()
    }
}

impl<T: Port + KernelCfg2 + 'static> Kernel for T {}

/// Associates "system" types with the compile-time-selected kernel data
/// structure types. Implemented by [`static_kernel!`](crate::static_kernel).
///
/// # Safety
///
/// The associated items must describe a coherent kernel configuration; this
/// is only upheld when the implementation comes from `static_kernel!`.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The number of task priority levels. Valid priorities are
    /// `0..NUM_TASK_PRIORITY_LEVELS`, the numerically largest being the most
    /// urgent.
    const NUM_TASK_PRIORITY_LEVELS: usize;

    /// The task ready queue type.
    type TaskReadyQueue: task::readyqueue::ReadyQueue<Self>;

    /// The storage for the timeout heap, sized by the task count (a task
    /// can have at most one outstanding timeout).
    type TimeoutHeap: VecLike<Element = timeout::TimeoutRef<Self>> + core::fmt::Debug + 'static;
}

/// Implemented by a port.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait Port: KernelCfg1 {
    /// Port-specific per-task state.
    ///
    /// This is stored at the beginning of each task control block so that
    /// low-level dispatcher code can locate it easily.
    type PortTaskState: Send + Sync + Init + core::fmt::Debug + 'static;

    /// The default stack size for tasks, in bytes.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// The alignment requirement for task stack regions, in bytes.
    const STACK_ALIGN: usize = core::mem::size_of::<usize>();

    /// Transfer the control to the task selected by the last scheduling
    /// decision, discarding the current (startup) context.
    ///
    /// Precondition: CPU Lock active, startup phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In an interrupt context, the context switch is pended and takes place
    /// when the processor returns to an outer task context.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Terminate the current task's context and transfer the control to the
    /// task selected by the last scheduling decision. The terminated
    /// context is never resumed.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch() -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Try to enter a CPU Lock state. Returns `false` if the CPU Lock state
    /// is already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Prepare the task for execution. More specifically, set the current
    /// program counter to the entry point and the current stack pointer to
    /// either end of the task's stack region, ensuring the task starts
    /// execution from its entry point next time it receives the control.
    ///
    /// Precondition: CPU Lock active, the task has never run or has been
    /// terminated
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Enter the platform's low-power state for at most `max_ticks` ticks.
    ///
    /// Returns the number of ticks that actually elapsed while sleeping,
    /// which the kernel uses to reconcile its tick counter. The tick source
    /// may be suspended for the duration of the call.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_low_power(mode: SleepMode, max_ticks: Ticks) -> Ticks;
}

/// Associates "system" types with kernel-private static storage. Implemented
/// by [`static_kernel!`](crate::static_kernel).
///
/// # Safety
///
/// This is only intended to be implemented by `static_kernel!`.
pub unsafe trait KernelCfg2: Port + Sized {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    /// Access the task control block pool.
    fn task_cb_pool() -> &'static [task::TaskCb<Self>];

    /// The numeric spread between the most and the least urgent configured
    /// task priority. Purely advisory; see
    /// [`priority_spread_is_wide`](State::priority_spread_is_wide).
    const PRIORITY_SPREAD: Priority;
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel: Port {
    /// Determine the next task to run and update the kernel's idea of the
    /// running task.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Get the task that was selected by the last scheduling decision.
    ///
    /// Precondition: CPU Lock active
    unsafe fn running_task() -> Option<&'static task::TaskCb<Self>>;

    /// Called by the port when a task's entry function returns.
    ///
    /// Transitions the task to the Terminated state and schedules the next
    /// task. There is no safe teardown path for a task; the terminated
    /// task's stack and held resources are permanently abandoned.
    unsafe fn exit_task() -> !;
}

impl<System: Kernel> PortToKernel for System {
    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };

        task::choose_next_running_task(lock.borrow_mut());

        // Postcondition: CPU Lock active
        forget(lock);
    }

    unsafe fn running_task() -> Option<&'static task::TaskCb<Self>> {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };
        let running_task = Self::state().running_task(lock.borrow_mut());
        forget(lock);
        running_task
    }

    unsafe fn exit_task() -> ! {
        // Safety: The caller is the port, which guarantees the current
        // context belongs to the exiting task
        unsafe { task::exit_current_task::<Self>() }
    }
}

/// The lifecycle phase of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Lifecycle {
    /// `start` has not been called yet.
    PendingStart,
    /// The scheduler is in control of the processor.
    Running,
}

impl Init for Lifecycle {
    const INIT: Self = Self::PendingStart;
}

/// Global kernel state.
///
/// One instance per system type is instantiated by
/// [`static_kernel!`](crate::static_kernel).
pub struct State<System: Port> {
    /// The task in the Running state.
    running_task: klock::CpuLockCell<System, Option<&'static task::TaskCb<System>>>,

    /// The task ready queue.
    pub(super) task_ready_queue: System::TaskReadyQueue,

    /// The lifecycle phase.
    pub(super) lifecycle: klock::CpuLockCell<System, Lifecycle>,

    /// Timekeeping and outstanding timeouts.
    pub(super) timeout: timeout::TimeoutGlobals<System>,

    /// Tickless idle policy state.
    pub(super) idle: idle::IdleGlobals<System>,
}

impl<System: Port> Init for State<System> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        task_ready_queue: Init::INIT,
        lifecycle: Init::INIT,
        timeout: Init::INIT,
        idle: Init::INIT,
    };
}

impl<System: Kernel> State<System> {
    /// Get the task in the Running state.
    pub(super) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, System>,
    ) -> Option<&'static task::TaskCb<System>> {
        *self.running_task.read(&*lock)
    }

    pub(super) fn set_running_task(
        &self,
        mut lock: klock::CpuLockTokenRefMut<'_, System>,
        task_cb: Option<&'static task::TaskCb<System>>,
    ) {
        self.running_task.replace(&mut *lock, task_cb);
    }

    /// Whether the configured task priorities leave a gap wider than half
    /// the priority levels between the most and the least urgent task.
    ///
    /// A wide spread is a *hint* that the application may be susceptible to
    /// extended priority inversion if intermediate-priority tasks are added
    /// later. The mutex's priority inheritance is the actual mitigation, so
    /// this never rejects a configuration; ports may surface it as a
    /// boot-time warning.
    pub fn priority_spread_is_wide(&self) -> bool {
        (System::PRIORITY_SPREAD as usize) > System::NUM_TASK_PRIORITY_LEVELS / 2
    }
}

impl<System: Kernel> core::fmt::Debug for State<System> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("State")
            .field(
                "running_task",
                &self
                    .running_task
                    .debug_fmt_with(|t, f| core::fmt::Debug::fmt(&t.map(|t| t as *const _), f)),
            )
            .field("task_ready_queue", &self.task_ready_queue)
            .field("lifecycle", &self.lifecycle)
            .field("timeout", &self.timeout)
            .field("idle", &self.idle)
            .finish()
    }
}

/// Escalate an unrecoverable kernel error.
///
/// The kernel has no mechanism to unwind or isolate a corrupted scheduling
/// state, so conditions such as a blown stack canary
/// ([`ResultCode::StackOverflow`]) or a failed context switch
/// ([`ResultCode::ContextSwitchError`], reported by ports) end here.
pub fn fatal(code: ResultCode) -> ! {
    panic!("unrecoverable kernel error: {code:?}");
}

/// If the current context is not a task context, return
/// `Err(InvalidState)`.
pub(super) fn expect_task_context<System: Kernel>() -> Result<(), InvalidStateError> {
    if !System::is_task_context() {
        Err(InvalidStateError::InvalidState)
    } else {
        Ok(())
    }
}

/// If the current context doesn't allow blocking, return
/// `Err(InvalidState)`.
pub(super) fn expect_waitable_context<System: Kernel>() -> Result<(), InvalidStateError> {
    expect_task_context::<System>()
}
