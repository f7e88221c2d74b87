//! Tickless idle
//!
//! When nothing is runnable, the idle path can put the platform into a
//! low-power state instead of letting the periodic tick interrupt burn
//! power. The kernel computes how long the processor may stay asleep (the
//! span until the nearest deadline), hands the actual transition to
//! [`Port::enter_low_power`], and reconciles the tick counter afterwards
//! (the tick source itself is typically suspended while sleeping).
use core::fmt;

use super::{
    error::{ConfigureIdleError, SleepError},
    klock, task,
    task::readyqueue::ReadyQueue as _,
    timeout, Kernel, Lifecycle, Port,
};
use crate::time::{Duration, Ticks};
use crate::utils::Init;

/// The longest span a single sleep may cover, in ticks.
pub const MAX_SLEEP: Ticks = timeout::DURATION_MAX;

/// The low-power mode selector handed to [`Port::enter_low_power`].
///
/// The kernel attaches no meaning to the variants beyond "deeper costs
/// more to enter and leave"; the platform decides what they map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    /// A shallow sleep with negligible entry/exit overhead.
    Light,
    /// A deep sleep that pays off only for longer idle spans.
    Deep,
}

impl Init for SleepMode {
    const INIT: Self = Self::Light;
}

/// A snapshot of the tickless idle statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStats {
    /// The total number of ticks spent in a low-power state.
    pub slept_ticks: u64,
    /// The number of times the idle path returned from a low-power state.
    pub wake_count: u32,
}

/// The tickless idle policy state. Initialized once at startup; mutated
/// only by the idle path and the configuration operations.
pub(super) struct IdleGlobals<System: Port> {
    enabled: klock::CpuLockCell<System, bool>,
    mode: klock::CpuLockCell<System, SleepMode>,

    /// The smallest predicted idle span that justifies entering the
    /// configured mode at all.
    min_sleep: klock::CpuLockCell<System, Ticks>,

    slept_ticks: klock::CpuLockCell<System, u64>,
    wake_count: klock::CpuLockCell<System, u32>,
}

impl<System: Port> Init for IdleGlobals<System> {
    const INIT: Self = Self {
        enabled: Init::INIT,
        mode: Init::INIT,
        min_sleep: klock::CpuLockCell::new(1),
        slept_ticks: Init::INIT,
        wake_count: Init::INIT,
    };
}

impl<System: Kernel> fmt::Debug for IdleGlobals<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdleGlobals")
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .field("min_sleep", &self.min_sleep)
            .field("slept_ticks", &self.slept_ticks)
            .field("wake_count", &self.wake_count)
            .finish()
    }
}

/// Implements [`Kernel::idle_set_enabled`].
///
/// [`Kernel::idle_set_enabled`]: crate::kernel::Kernel::idle_set_enabled
pub(super) fn set_enabled<System: Kernel>(enabled: bool) -> Result<(), ConfigureIdleError> {
    let mut lock = klock::lock_cpu::<System>()?;
    System::state().idle.enabled.replace(&mut *lock, enabled);
    Ok(())
}

/// Implements [`Kernel::configure_idle`].
///
/// [`Kernel::configure_idle`]: crate::kernel::Kernel::configure_idle
pub(super) fn configure<System: Kernel>(
    mode: SleepMode,
    min_sleep: Duration,
) -> Result<(), ConfigureIdleError> {
    let mut lock = klock::lock_cpu::<System>()?;
    let idle = &System::state().idle;
    idle.mode.replace(&mut *lock, mode);
    idle.min_sleep.replace(&mut *lock, min_sleep.as_ticks());
    Ok(())
}

/// Implements [`Kernel::should_sleep`].
///
/// [`Kernel::should_sleep`]: crate::kernel::Kernel::should_sleep
pub(super) fn should_sleep<System: Kernel>() -> Result<bool, SleepError> {
    let mut lock = klock::lock_cpu::<System>()?;
    Ok(evaluate_sleep(lock.borrow_mut()).is_some())
}

/// Implements [`Kernel::enter_sleep`].
///
/// [`Kernel::enter_sleep`]: crate::kernel::Kernel::enter_sleep
pub(super) fn enter_sleep<System: Kernel>() -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<System>()?;

    let span = match evaluate_sleep(lock.borrow_mut()) {
        Some(span) => span,
        // Something became runnable, or the next wake is too close to be
        // worth the mode's entry/exit overhead
        None => return Ok(()),
    };

    let mode = *System::state().idle.mode.read(&*lock);

    // The platform hook runs with CPU Lock inactive so that the wake-up
    // interrupt can be taken
    drop(lock);

    // Safety: CPU Lock inactive
    let slept = unsafe { System::enter_low_power(mode, span) };

    let lock = klock::lock_cpu::<System>()?;

    // The tick source was suspended while sleeping; account for the
    // missed period in a single step
    let mut lock = timeout::handle_tick::<System>(lock, slept);

    let idle = &System::state().idle;
    idle.slept_ticks
        .replace_with(&mut *lock, |t| *t + slept as u64);
    idle.wake_count
        .replace_with(&mut *lock, |c| c.wrapping_add(1));

    // Reconciliation may have woken tasks
    task::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Implements [`Kernel::idle_stats`].
///
/// [`Kernel::idle_stats`]: crate::kernel::Kernel::idle_stats
pub(super) fn stats<System: Kernel>() -> Result<IdleStats, SleepError> {
    let lock = klock::lock_cpu::<System>()?;
    let idle = &System::state().idle;
    Ok(IdleStats {
        slept_ticks: *idle.slept_ticks.read(&*lock),
        wake_count: *idle.wake_count.read(&*lock),
    })
}

/// Decide whether the processor may sleep right now, and for how long.
///
/// Sleeping is justified iff the tickless idle policy is enabled, the
/// kernel is past `start`, no task is Running or Ready, and the nearest
/// deadline (if any) is at least `min_sleep` ticks away.
fn evaluate_sleep<System: Kernel>(
    mut lock: klock::CpuLockTokenRefMut<'_, System>,
) -> Option<Ticks> {
    let state = System::state();

    if !*state.idle.enabled.read(&*lock) {
        return None;
    }

    if *state.lifecycle.read(&*lock) != Lifecycle::Running {
        return None;
    }

    if state.running_task(lock.borrow_mut()).is_some() {
        return None;
    }

    if state
        .task_ready_queue
        .has_ready_task_above(lock.borrow_mut().into(), None)
    {
        return None;
    }

    let min_sleep = *state.idle.min_sleep.read(&*lock);

    match timeout::next_deadline_delta::<System>(lock.borrow_mut()) {
        // Nothing is scheduled to wake; only an external event can end the
        // sleep
        None => Some(MAX_SLEEP),
        Some(delta) if delta >= min_sleep => Some(delta.min(MAX_SLEEP)),
        Some(_) => None,
    }
}
