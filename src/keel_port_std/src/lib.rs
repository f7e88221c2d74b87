//! Simulator port for the Keel RTOS kernel.
//!
//! Runs a Keel kernel on a hosted environment, mapping each kernel task to
//! one OS thread. The kernel believes it is doing single-core preemptive
//! scheduling; this port arranges for at most one task thread to execute
//! kernel-observable steps at a time:
//!
//!  - **CPU Lock** is an owner-tracked spinlock. `enter_cpu_lock` by a task
//!    thread additionally parks the thread until its task is the running
//!    task, which turns every kernel API boundary into a preemption point.
//!  - **Dispatching** (`yield_cpu` and friends) runs the kernel's
//!    scheduling decision, unparks the elected task's thread, and parks the
//!    calling task's thread if it lost the processor.
//!  - **Preemption of compute-bound code is cooperative**: a task that was
//!    preempted while executing pure user code keeps executing until its
//!    next kernel call. The deterministic tests in `tests/` are built
//!    around this property, with every simulated "interrupt" issued from
//!    the driver thread via [`Kernel::tick`] while the tasks are quiescent
//!    (see [`quiesce`]).
//!
//! The simulated timer never fires on its own: the test driver calls
//! `System::tick()` itself, which also makes it the interrupt context for
//! `notify_from_isr` and similar.
//!
//! [`Kernel::tick`]: keel::kernel::Kernel::tick
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex as StdMutex};
use std::thread;

use keel::kernel::{Kernel, KernelCfg2, Port, PortToKernel, SleepMode, TaskCb};
use keel::time::Ticks;
use keel::utils::Init;
use spin::Mutex as SpinMutex;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate keel;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: Kernel + Port<PortTaskState = TaskState> {
    fn port_state() -> &'static State;
}

/// The internal state of the port. One instance per system type,
/// instantiated by [`use_port!`].
#[doc(hidden)]
pub struct State {
    /// The thread currently holding the CPU Lock, or `0`.
    cpu_lock_owner: AtomicU64,

    /// Every `(mode, span)` pair passed to the low-power hook, oldest
    /// first. Exposed to tests through [`sleep_log`].
    sleep_log: SpinMutex<Vec<(SleepMode, Ticks)>>,

    /// The number of task threads that panicked. Tests use [`check_panics`]
    /// to fail fast instead of deadlocking on a task that will never
    /// respond again.
    panic_count: AtomicUsize,
    panic_message: SpinMutex<Option<String>>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock_owner: AtomicU64::new(0),
            sleep_log: SpinMutex::new(Vec::new()),
            panic_count: AtomicUsize::new(0),
            panic_message: SpinMutex::new(None),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The port-specific part of a task control block.
#[derive(Debug)]
pub struct TaskState {
    /// The task's execution state, used for lazily spawning the backing
    /// thread.
    tsm: SpinMutex<Tsm>,

    /// The gate the backing thread parks on whenever the task is not the
    /// running task.
    gate: Gate,
}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tsm: SpinMutex::new(Tsm::Uninit),
        gate: Gate::new(),
    };
}

/// Task state machine (port side).
///
/// This doesn't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before choosing this task as the
    /// running task.
    Uninit,
    /// The task's context state is initialized but no backing thread has
    /// been spawned yet.
    Dormant,
    /// The backing thread is running (or parked on the gate).
    Live,
}

/// A stateful parking spot: a signal delivered before the wait is not
/// lost. Spurious resumes are absorbed by the kernel's own re-check loop
/// (`wait_until_woken_up`).
#[derive(Debug)]
struct Gate {
    scheduled: StdMutex<bool>,
    cond: Condvar,
}

impl Gate {
    const fn new() -> Self {
        Self {
            scheduled: StdMutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut scheduled = self.scheduled.lock().unwrap();
        while !*scheduled {
            scheduled = self.cond.wait(scheduled).unwrap();
        }
        *scheduled = false;
    }

    fn signal(&self) {
        *self.scheduled.lock().unwrap() = true;
        self.cond.notify_one();
    }
}

std::thread_local! {
    /// A process-unique identifier of the current thread. `0` is reserved.
    static THREAD_ID: u64 = {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    };

    /// The task control block the current thread is backing, or null. Type-
    /// erased; a thread only ever belongs to one system type.
    static CURRENT_TASK: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

fn current_task_ptr() -> *const () {
    CURRENT_TASK.with(|t| t.get())
}

/// Get the task control block backing the current thread.
fn current_task<System: PortInstance>() -> Option<&'static TaskCb<System>> {
    let ptr = current_task_ptr();
    if ptr.is_null() {
        None
    } else {
        // Safety: The pointer was stored by `task_thread_main::<System>`,
        //         and a thread never changes its system type
        Some(unsafe { &*(ptr as *const TaskCb<System>) })
    }
}

/// Acquire the raw CPU Lock, spinning while another thread holds it.
/// Panics on re-entry, which mirrors a double-`enter_cpu_lock` on real
/// hardware.
fn acquire_raw<System: PortInstance>() {
    let me = thread_id();
    let owner = &System::port_state().cpu_lock_owner;
    loop {
        match owner.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) if observed == me => panic!("CPU Lock is already active"),
            Err(_) => std::hint::spin_loop(),
        }
    }
}

fn release_raw<System: PortInstance>() {
    let me = thread_id();
    let owner = &System::port_state().cpu_lock_owner;
    assert_eq!(
        owner.swap(0, Ordering::Release),
        me,
        "CPU Lock released by a thread that does not hold it"
    );
}

#[doc(hidden)]
pub fn enter_cpu_lock<System: PortInstance>() {
    loop {
        acquire_raw::<System>();

        // A task thread may only proceed into kernel code while its task
        // is the running task; anything else means it was preempted at
        // this boundary and must wait for its turn.
        if let Some(task) = current_task::<System>() {
            // Safety: CPU Lock active
            let running = unsafe { System::running_task() };
            if !matches!(running, Some(r) if std::ptr::eq(r, task)) {
                release_raw::<System>();
                task.port_task_state.gate.wait();
                continue;
            }
        }

        return;
    }
}

#[doc(hidden)]
pub fn try_enter_cpu_lock<System: PortInstance>() -> bool {
    let owner = &System::port_state().cpu_lock_owner;
    if owner.load(Ordering::Relaxed) == thread_id() {
        return false;
    }
    enter_cpu_lock::<System>();
    true
}

#[doc(hidden)]
pub fn leave_cpu_lock<System: PortInstance>() {
    release_raw::<System>();
}

#[doc(hidden)]
pub fn is_cpu_lock_active<System: PortInstance>() -> bool {
    System::port_state().cpu_lock_owner.load(Ordering::Relaxed) == thread_id()
}

#[doc(hidden)]
pub fn is_task_context() -> bool {
    !current_task_ptr().is_null()
}

#[doc(hidden)]
pub fn initialize_task_state<System: PortInstance>(task: &'static TaskCb<System>) {
    let mut tsm = task.port_task_state.tsm.lock();
    match *tsm {
        Tsm::Uninit => *tsm = Tsm::Dormant,
        Tsm::Dormant | Tsm::Live => unreachable!("task is already initialized"),
    }
}

/// Unpark (spawning it first if necessary) the backing thread of `task`.
fn dispatch_to<System: PortInstance>(task: &'static TaskCb<System>) {
    {
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Dormant => {
                *tsm = Tsm::Live;
                drop(tsm);
                thread::Builder::new()
                    .name(task.attr.name.to_owned())
                    .spawn(move || task_thread_main::<System>(task))
                    .unwrap();
            }
            Tsm::Live => {}
            Tsm::Uninit => unreachable!("dispatching a task with no context"),
        }
    }

    task.port_task_state.gate.signal();
}

fn task_thread_main<System: PortInstance>(task: &'static TaskCb<System>) {
    CURRENT_TASK.with(|t| t.set(task as *const _ as *const ()));

    // Wait to be dispatched for the first time
    task.port_task_state.gate.wait();

    log::trace!("task `{}` started", task.attr.name);

    // A panicking task would otherwise silently stop responding and
    // deadlock the test; record it so `check_panics` can fail the test
    // from the driver thread.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task.attr.entry_point)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        log::error!("task `{}` panicked: {}", task.attr.name, message);

        let port_state = System::port_state();
        *port_state.panic_message.lock() = Some(format!(
            "task `{}` panicked: {}",
            task.attr.name, message
        ));
        port_state.panic_count.fetch_add(1, Ordering::SeqCst);

        // The kernel may be in an arbitrary state; don't touch it. Keep
        // the thread around so nothing dereferences a dead stack.
        loop {
            thread::park();
        }
    }

    log::trace!("task `{}` exited", task.attr.name);

    // Safety: This thread backs the task whose entry function just
    //         returned
    unsafe { System::exit_task() }
}

#[doc(hidden)]
pub fn yield_cpu<System: PortInstance>() {
    enter_cpu_lock::<System>();
    // Safety: CPU Lock active
    unsafe { System::choose_running_task() };
    let running = unsafe { System::running_task() };
    leave_cpu_lock::<System>();

    if let Some(next) = running {
        dispatch_to::<System>(next);
    }

    // If this is a task thread and it lost the processor, wait here until
    // it is scheduled again
    if let Some(task) = current_task::<System>() {
        if !matches!(running, Some(r) if std::ptr::eq(r, task)) {
            task.port_task_state.gate.wait();
        }
    }
}

#[doc(hidden)]
pub fn dispatch_first_task<System: PortInstance>() -> ! {
    static INIT_LOGGER: std::sync::Once = std::sync::Once::new();
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });

    if System::state().priority_spread_is_wide() {
        log::warn!(
            "the configured task priorities span a wide range; \
             intermediate-priority tasks added later may suffer extended \
             priority inversion"
        );
    }

    // Safety: CPU Lock active (precondition)
    let running = unsafe { System::running_task() };
    leave_cpu_lock::<System>();

    if let Some(next) = running {
        dispatch_to::<System>(next);
    }

    // The startup context retires; from now on the system is driven by the
    // task threads and the test driver's simulated timer
    loop {
        thread::park();
    }
}

#[doc(hidden)]
pub fn exit_and_dispatch<System: PortInstance>() -> ! {
    // Safety: CPU Lock active (precondition); the next task is chosen
    let running = unsafe { System::running_task() };
    leave_cpu_lock::<System>();

    if let Some(next) = running {
        dispatch_to::<System>(next);
    }

    // The task context is never resumed
    loop {
        thread::park();
    }
}

#[doc(hidden)]
pub fn enter_low_power<System: PortInstance>(mode: SleepMode, max_ticks: Ticks) -> Ticks {
    System::port_state().sleep_log.lock().push((mode, max_ticks));

    // The simulated platform "sleeps" for the whole permitted span and
    // lets the kernel reconcile the tick counter accordingly
    max_ticks
}

/// Get a copy of every `(mode, span)` pair the kernel has passed to the
/// low-power hook so far.
pub fn sleep_log<System: PortInstance>() -> Vec<(SleepMode, Ticks)> {
    System::port_state().sleep_log.lock().clone()
}

/// Panic if any task thread of the given system has panicked.
pub fn check_panics<System: PortInstance>() {
    if System::port_state().panic_count.load(Ordering::SeqCst) != 0 {
        let message = System::port_state().panic_message.lock().take();
        panic!(
            "{}",
            message.unwrap_or_else(|| "a task thread panicked".to_owned())
        );
    }
}

/// Busy-wait (with back-off) until no task is in the Running state, i.e.,
/// every task thread is parked in a kernel wait.
///
/// The driver thread calls this before injecting a tick so that the test's
/// interleaving is deterministic.
pub fn quiesce<System: PortInstance>() {
    loop {
        check_panics::<System>();

        enter_cpu_lock::<System>();
        // Safety: CPU Lock active
        let running = unsafe { System::running_task() };
        leave_cpu_lock::<System>();

        if running.is_none() {
            return;
        }

        thread::yield_now();
        thread::sleep(std::time::Duration::from_micros(100));
    }
}

/// Define a system type and implement [`Port`] on it.
///
/// # Safety
///
/// The macro implements unsafe traits on the given type.
///
/// # Example
///
/// ```rust,ignore
/// keel_port_std::use_port!(unsafe struct SystemTraits);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $sys:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $sys;

        const _: () = {
            static PORT_STATE: $crate::State = $crate::State::new();

            // Safety: `PORT_STATE` is dedicated to `$sys`
            unsafe impl $crate::PortInstance for $sys {
                fn port_state() -> &'static $crate::State {
                    &PORT_STATE
                }
            }

            // Safety: The port contract is upheld by emulating a single
            //         core with host threads; see the crate documentation
            unsafe impl $crate::keel::kernel::Port for $sys {
                type PortTaskState = $crate::TaskState;

                unsafe fn dispatch_first_task() -> ! {
                    $crate::dispatch_first_task::<Self>()
                }

                unsafe fn yield_cpu() {
                    $crate::yield_cpu::<Self>()
                }

                unsafe fn exit_and_dispatch() -> ! {
                    $crate::exit_and_dispatch::<Self>()
                }

                unsafe fn enter_cpu_lock() {
                    $crate::enter_cpu_lock::<Self>()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    $crate::try_enter_cpu_lock::<Self>()
                }

                unsafe fn leave_cpu_lock() {
                    $crate::leave_cpu_lock::<Self>()
                }

                unsafe fn initialize_task_state(
                    task: &'static $crate::keel::kernel::TaskCb<Self>,
                ) {
                    $crate::initialize_task_state::<Self>(task)
                }

                fn is_cpu_lock_active() -> bool {
                    $crate::is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }

                unsafe fn enter_low_power(
                    mode: $crate::keel::kernel::SleepMode,
                    max_ticks: $crate::keel::time::Ticks,
                ) -> $crate::keel::time::Ticks {
                    $crate::enter_low_power::<Self>(mode, max_ticks)
                }
            }
        };
    };
}
