//! Tasks
use core::{fmt, mem};

use super::{
    error::{CurrentTaskError, DelayError, WaitTimeoutError, YieldError},
    expect_task_context, expect_waitable_context, klock, mutex, notify, wait, Kernel, KernelCfg1,
    Port,
};
use crate::time::Duration;
use crate::utils::Init;

pub mod readyqueue;
use self::readyqueue::ReadyQueue as _;

/// A task priority. The numerically largest value is the most urgent.
pub type Priority = u8;

/// The smallest supported stack region size, in bytes.
pub const STACK_SIZE_MIN: usize = 256;

/// The largest supported stack region size, in bytes.
pub const STACK_SIZE_MAX: usize = 65536;

/// The value planted at the low end of every stack region.
///
/// The running task's canary is verified on every tick; an overwrite
/// escalates to [`fatal`](crate::kernel::fatal) with
/// [`StackOverflow`](crate::kernel::ResultCode::StackOverflow) because a task
/// that has overrun its stack has no state left to safely unwind.
const STACK_CANARY: u32 = 0xa5a5_5a5a;

/// A task's stack region.
///
/// Points into a `static` byte array instantiated by
/// [`static_kernel!`](crate::static_kernel). The region is owned exclusively
/// by one task, sized within [`STACK_SIZE_MIN`]`..=`[`STACK_SIZE_MAX`], and
/// aligned to [`Port::STACK_ALIGN`]; all three properties are enforced at
/// compile time.
pub struct TaskStack {
    base: *mut u8,
    len: usize,
}

// Safety: Safe code can't access the pointee. The port is responsible for
// using `TaskStack` in the correct way.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    /// Construct a `TaskStack` from a base pointer and a length.
    ///
    /// # Safety
    ///
    /// `base` must point to a static memory region of `len` bytes that is
    /// used for nothing but the stack of exactly one task.
    pub const unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Get a raw pointer to the start (lowest address) of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Get the size of the region, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskStack").field(&self.base).finish()
    }
}

/// The static properties of a task.
pub struct TaskAttr {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code.
    pub entry_point: fn(),

    /// The stack region allocated to the task.
    pub stack: TaskStack,

    /// The initial base priority of the task.
    pub priority: Priority,

    /// The task's display name.
    pub name: &'static str,
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish()
    }
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<System: Port> {
    /// Port-specific per-task state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that low-level dispatcher code can refer to it easily.
    pub port_task_state: System::PortTaskState,

    /// The static properties of the task.
    pub attr: TaskAttr,

    /// The task's base priority, assigned at configuration time and
    /// immutable thereafter.
    pub(super) base_priority: klock::CpuLockCell<System, Priority>,

    /// The task's effective priority. Differs from `base_priority` only
    /// while the task holds a mutex that a more urgent task is waiting for.
    ///
    /// The effective priority determines the task's position within the
    /// task ready queue. `ReadyQueue::reorder_task` must be called after
    /// updating the `effective_priority` of a task in the Ready state.
    pub(super) effective_priority: klock::CpuLockCell<System, Priority>,

    pub(super) st: klock::CpuLockCell<System, TaskSt>,

    /// Intrusive link for the ready queue.
    pub(super) ready_queue_data:
        <<System as KernelCfg1>::TaskReadyQueue as readyqueue::ReadyQueue<System>>::PerTaskData,

    /// The wait state of the task.
    pub(super) wait: wait::TaskWait<System>,

    /// The head of the list of mutexes currently held by the task.
    pub(super) last_mutex_held: klock::CpuLockCell<System, Option<&'static mutex::MutexCb<System>>>,

    /// The task's notification slot. Lock-free; reachable from interrupt
    /// context without taking CPU Lock.
    pub(super) notification: notify::NotificationSlot,
}

impl<System: Port> TaskCb<System> {
    /// Construct a `TaskCb`. Used by [`static_kernel!`](crate::static_kernel).
    pub const fn new(attr: TaskAttr) -> Self {
        Self {
            port_task_state: Init::INIT,
            base_priority: klock::CpuLockCell::new(attr.priority),
            effective_priority: klock::CpuLockCell::new(attr.priority),
            st: klock::CpuLockCell::new(TaskSt::PendingStart),
            ready_queue_data: Init::INIT,
            wait: wait::TaskWait::new(),
            last_mutex_held: klock::CpuLockCell::new(None),
            notification: notify::NotificationSlot::new(),
            attr,
        }
    }
}

impl<System: Kernel> fmt::Debug for TaskCb<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("attr", &self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .field(
                "last_mutex_held",
                // Don't print the contents of the mutex; that would recurse
                // right back into this task
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| fmt::Debug::fmt(&x.map(|x| x as *const _), f)),
            )
            .field("notification", &self.notification)
            .finish()
    }
}

/// Task state machine
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                      .--------------.
///      .-------------->| PendingStart |
///      |               '--------------'
///      |                      | start
///      |                      v
///      |  wake  .---------.       .-------.
///      |   .--->|  Ready  |<------+       |
///      |   |    '---------'  preempt,     |
///      |   |      | select      yield     |
///      |   |      v               |       |
/// .---------.   .---------.-------'       |
/// | Blocked |<--| Running |---------------'
/// '---------'   '---------'
///     wait            | entry function returns
///                     v
///               .------------.
///               | Terminated |
///               '------------'
/// ```
)]
///
/// </center>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task has been configured but the kernel hasn't started yet.
    PendingStart,

    /// The task is eligible to run and linked into a ready list.
    Ready,

    /// The task is in control of the processor.
    Running,

    /// The task is waiting for an event or a deadline.
    Blocked,

    /// The task's entry function returned. There is no teardown path; the
    /// task will never be scheduled again and its resources are abandoned.
    Terminated,
}

impl Init for TaskSt {
    const INIT: Self = Self::PendingStart;
}

/// A borrowed reference to a task.
pub struct TaskRef<System: Port>(&'static TaskCb<System>);

impl<System: Port> Clone for TaskRef<System> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<System: Port> Copy for TaskRef<System> {}

impl<System: Port> PartialEq for TaskRef<System> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<System: Port> Eq for TaskRef<System> {}

impl<System: Port> fmt::Debug for TaskRef<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0.attr.name).finish()
    }
}

impl<System: Port> TaskRef<System> {
    pub(super) fn from_cb(cb: &'static TaskCb<System>) -> Self {
        Self(cb)
    }

    pub(super) fn cb(self) -> &'static TaskCb<System> {
        self.0
    }

    /// The task's display name.
    pub fn name(self) -> &'static str {
        self.0.attr.name
    }

    /// The task's base priority.
    pub fn priority(self) -> Priority {
        self.0.attr.priority
    }
}

/// Implements [`Kernel::current_task`].
pub(super) fn current_task<System: Kernel>() -> Result<TaskRef<System>, CurrentTaskError> {
    expect_task_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;
    let task_cb = System::state().running_task(lock.borrow_mut()).unwrap();
    Ok(TaskRef::from_cb(task_cb))
}

/// Initialize a task at boot time: plant the stack canary, let the port set
/// up the execution state, and make the task Ready.
pub(super) fn init_task<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    task_cb: &'static TaskCb<System>,
) {
    debug_assert_eq!(*task_cb.st.read(&*lock), TaskSt::PendingStart);

    // Safety: The stack region is exclusively owned by `task_cb` and is at
    //         least `STACK_SIZE_MIN` (> 4) bytes long
    unsafe {
        (task_cb.attr.stack.as_ptr() as *mut u32).write_volatile(STACK_CANARY);
    }

    // Safety: CPU Lock active, the task has never run
    unsafe { System::initialize_task_state(task_cb) };

    // Safety: The task is not in a ready list and we just initialized its
    //         execution state
    unsafe { make_ready(lock.borrow_mut(), task_cb) };
}

/// Check the integrity of the guard word planted by [`init_task`].
pub(super) fn stack_canary_ok<System: Kernel>(task_cb: &TaskCb<System>) -> bool {
    // Safety: Same region as in `init_task`
    unsafe { (task_cb.attr.stack.as_ptr() as *const u32).read_volatile() == STACK_CANARY }
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state.
///
/// # Safety
///
/// The task must not be linked into a ready list, and its execution state
/// must be valid to resume (or start).
pub(super) unsafe fn make_ready<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
    task_cb: &'static TaskCb<System>,
) {
    // Make the task Ready
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    // Insert the task into the ready queue.
    //
    // Safety: `task_cb` is not in the ready queue
    unsafe {
        System::state()
            .task_ready_queue
            .push_back_task(lock.into(), task_cb);
    }
}

/// Relinquish CPU Lock. After that, if there's a task more urgent than the
/// running one ready, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<System: Kernel>(
    mut lock: klock::CpuLockGuard<System>,
) {
    let prev_task_priority =
        if let Some(running_task) = System::state().running_task(lock.borrow_mut()) {
            if *running_task.st.read(&*lock) == TaskSt::Running {
                Some(*running_task.effective_priority.read(&*lock))
            } else {
                None
            }
        } else {
            None
        };

    let has_preempting_task = System::state()
        .task_ready_queue
        .has_ready_task_above(lock.borrow_mut().into(), prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { System::yield_cpu() };
    }
}

/// Determine the next task to run and update `State::running_task`.
///
/// The actual transfer of control is the port's business; this only makes
/// the scheduling decision.
#[inline]
pub(super) fn choose_next_running_task<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<System>,
) {
    // The effective priority of `running_task`, or `None` if there is no
    // running task or it's not in a runnable state anymore. In the `None`
    // case a new task must be elected even if the ready queue is empty
    // (electing "no task" then).
    let prev_running_task = System::state().running_task(lock.borrow_mut());
    let prev_task_priority = if let Some(running_task) = prev_running_task {
        if *running_task.st.read(&*lock) == TaskSt::Running {
            Some(*running_task.effective_priority.read(&*lock))
        } else {
            None
        }
    } else {
        None
    };

    let decision = System::state()
        .task_ready_queue
        .pop_front_task(lock.borrow_mut().into(), prev_task_priority);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,

        // There's no task willing to take over the current one, and the
        // current one can still run.
        readyqueue::ScheduleDecision::Keep => {
            debug_assert!(prev_task_priority.is_some());
            return;
        }
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == task as *const _ {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(running_task) = prev_running_task {
        debug_assert_ne!(
            ptr_from_option_ref(prev_running_task),
            ptr_from_option_ref(next_running_task),
        );
        match *running_task.st.read(&*lock) {
            TaskSt::Running => {
                // Safety: The previous state is Running, so the task state
                //         is valid to resume later
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            TaskSt::Blocked | TaskSt::Ready | TaskSt::Terminated => {
                // `prev_running_task` already left the Running state by
                // other means; nothing to clean up.
            }
            TaskSt::PendingStart => unreachable!(),
        }
    }

    System::state().set_running_task(lock.borrow_mut(), next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Blocked state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `expect_waitable_context` to do that.
pub(super) fn wait_until_woken_up<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
) {
    debug_assert_eq!(expect_waitable_context::<System>(), Ok(()));

    // Transition the current task into Blocked
    let running_task = System::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Blocked);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { System::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { System::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { System::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(*running_task.st.read(&*lock), TaskSt::Blocked);
    }
}

/// Implements [`Kernel::yield_now`].
pub(super) fn yield_current_task<System: Kernel>() -> Result<(), YieldError> {
    expect_task_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;

    let running_task = System::state().running_task(lock.borrow_mut()).unwrap();

    // Rejoin the back of this priority's ready list. The next scheduling
    // decision then picks the most urgent ready task, which is the current
    // task again unless an equal-or-higher-priority task is ready.
    //
    // Safety: The task was Running, so its state is valid to resume
    unsafe { make_ready(lock.borrow_mut(), running_task) };

    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { System::yield_cpu() };

    Ok(())
}

/// Implements [`Kernel::delay`].
pub(super) fn delay_current_task<System: Kernel>(duration: Duration) -> Result<(), DelayError> {
    expect_waitable_context::<System>()?;
    let mut lock = klock::lock_cpu::<System>()?;

    if duration.as_ticks() == 0 {
        // An empty delay degenerates to a scheduling pass
        let running_task = System::state().running_task(lock.borrow_mut()).unwrap();
        // Safety: The task was Running, so its state is valid to resume
        unsafe { make_ready(lock.borrow_mut(), running_task) };
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { System::yield_cpu() };
        return Ok(());
    }

    match wait::wait_no_queue_timeout(
        lock.borrow_mut(),
        wait::WaitPayload::Sleep,
        duration.as_ticks(),
    ) {
        // The deadline elapsing is the expected outcome of a delay
        Err(WaitTimeoutError::Timeout) => Ok(()),
        // Nothing else ends a `Sleep` wait
        Ok(_) => unreachable!(),
    }
}

/// Terminate the calling task in response to its entry function returning.
///
/// # Safety
///
/// The current context must belong to the running task.
pub(super) unsafe fn exit_current_task<System: Kernel>() -> ! {
    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !System::is_cpu_lock_active() {
            System::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<System>()
    };

    let running_task = System::state().running_task(lock.borrow_mut()).unwrap();

    // There is no safe task-teardown path: whatever the task holds stays
    // held, and the stack contents are abandoned in place.
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Terminated);

    System::state().set_running_task(lock.borrow_mut(), None);

    choose_next_running_task(lock.borrow_mut());

    mem::forget(lock);

    // Safety: CPU Lock active, the task is no longer `running_task`
    unsafe { System::exit_and_dispatch() }
}
