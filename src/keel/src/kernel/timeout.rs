//! Manages the tick counter and outstanding timeouts (timed events).
//!
//! # Ticks and deadlines
//!
//! The kernel's only notion of time is a free-running tick counter of type
//! [`Ticks`], advanced by one whenever the external time source calls
//! [`Kernel::tick`], or by a larger step when the tickless idle path
//! reconciles a sleep period. Deadlines are stored as absolute counter
//! values and compared with wrapping arithmetic.
//!
//! For the comparison to be unambiguous, a timeout may lie at most
//! [`DURATION_MAX`] ticks in the future. The remaining half of the value
//! range acts as the *overdue zone*: a deadline the counter has passed but
//! that hasn't been processed yet (because tick delivery was delayed, or
//! because several ticks were reconciled in one step) is still correctly
//! ordered before every upcoming deadline.
//!
//! ```text
//!        overdue zone         CET      enqueueable zone
//! ▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃|░░░░░░░░░░░░░░░░░░░░░░░░░░░░░
//! ═════╤═══════════════════════╧═════════════════════════════
//!      │                        `CET ..= CET + DURATION_MAX`
//! critical point
//! ```
//!
//! The *critical point* trails the current event time (CET) by
//! `OVERDUE_HEADROOM` ticks; deadline order is total when evaluated
//! relative to it. No timeout may be left unprocessed for longer than the
//! headroom; the tick source would have to be silent for half the counter
//! range for that to happen.
//!
//! [`Kernel::tick`]: crate::kernel::Kernel::tick
use core::{fmt, marker::PhantomData, marker::PhantomPinned, pin::Pin, ptr::NonNull};
use tokenlock::{Token, TokenLock};

use super::{
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    Kernel, KernelCfg1, Port,
};
use crate::time::Ticks;
use crate::utils::{
    binary_heap::{BinaryHeap, BinaryHeapCtx, VecLike},
    Init,
};

/// The largest duration, in ticks, a timeout can be configured with.
pub const DURATION_MAX: Ticks = 0x7fff_ffff;

/// The width of the overdue zone. Fills the part of the value range that
/// [`DURATION_MAX`] leaves unused.
const OVERDUE_HEADROOM: Ticks = 0x8000_0000;

// ---------------------------------------------------------------------------
// A token type permitting mutable access to `Timeout::{at, heap_pos}`.
//
// These fields can't be `CpuLockCell`s: the binary heap's context object
// needs to update `heap_pos` while `TimeoutGlobals::heap_and_prop_token` is
// mutably borrowed through the CPU Lock token, so a second token type is
// required. The sole `TimeoutPropToken` instance is owned by
// `TimeoutGlobals`, which is in turn guarded by the CPU Lock, so the
// exclusivity guarantee is inherited.

pub(super) struct TimeoutPropToken {
    _nonexhaustive: (),
}

#[derive(Clone, Copy)]
pub(super) struct TimeoutPropKeyhole;

impl fmt::Debug for TimeoutPropToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutPropToken").finish()
    }
}

// This is safe because there is only one instance of `TimeoutPropToken` per
// system, owned by that system's `TimeoutGlobals`. (If there are multiple
// system types in a program, a token could technically unlock another
// system's cells, but a `Timeout<System>` is only ever reachable from its
// own system's heap.)
unsafe impl Token<TimeoutPropKeyhole> for TimeoutPropToken {
    fn eq_id(&self, _: &TimeoutPropKeyhole) -> bool {
        true
    }
}

/// Cell type that can be accessed by [`TimeoutPropToken`].
type TimeoutPropCell<T> = TokenLock<T, TimeoutPropKeyhole>;

// ---------------------------------------------------------------------------

/// A kernel-global state for timed event management.
pub(super) struct TimeoutGlobals<System: Port> {
    /// The current tick count. Advanced only by [`handle_tick`].
    tick_count: CpuLockCell<System, Ticks>,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time, and the `TimeoutPropToken` used to access
    /// [`Timeout`]`<System>`'s field contents.
    heap_and_prop_token: CpuLockCell<System, TimeoutHeapAndPropToken<System>>,
}

struct TimeoutHeapAndPropToken<System: KernelCfg1> {
    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time.
    heap: System::TimeoutHeap,

    /// The `TimeoutPropToken` used to access [`Timeout`]`<System>`'s field
    /// contents.
    prop_token: TimeoutPropToken,
}

impl<System: KernelCfg1> fmt::Debug for TimeoutHeapAndPropToken<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutHeapAndPropToken")
            .field("heap", &self.heap)
            .finish()
    }
}

impl<System: Port> Init for TimeoutGlobals<System> {
    const INIT: Self = Self {
        tick_count: Init::INIT,
        heap_and_prop_token: CpuLockCell::new(TimeoutHeapAndPropToken {
            heap: <System::TimeoutHeap as VecLike>::DEFAULT,
            // Safety: In each particular system type, this is the only
            //         instance of `TimeoutPropToken`.
            prop_token: TimeoutPropToken { _nonexhaustive: () },
        }),
    };
}

impl<System: Kernel> fmt::Debug for TimeoutGlobals<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .field("heap_and_prop_token", &self.heap_and_prop_token)
            .finish()
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// A timeout.
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
/// Dropping isn't allowed either. `Timeout::drop` can detect the violation
/// of this requirement and cause a panic.
///
/// `Timeout` is unregistered by one of the following ways:
///
///  - On expiration, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at any time. There is a
///    RAII guard type [`TimeoutGuard`] that does this automatically.
pub(super) struct Timeout<System: Port> {
    /// The arrival time of the timeout, as an absolute tick count.
    ///
    /// This is wrapped by `TimeoutPropCell` because [`TimeoutHeapCtx`]'s
    /// methods need to access this while `TimeoutGlobals::heap_and_prop_token`
    /// is mutably borrowed.
    at: TimeoutPropCell<Ticks>,

    /// The position of this timeout in [`TimeoutGlobals::heap_and_prop_token`].
    ///
    /// [`HEAP_POS_NONE`] indicates this timeout is not included in the heap.
    heap_pos: TimeoutPropCell<usize>,

    /// Callback function.
    callback: TimeoutFn<System>,

    /// Parameter given to the callback function.
    callback_param: usize,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,

    _phantom: PhantomData<System>,
}

/// Timeout callback function.
///
/// The callback function is called with CPU Lock active when the associated
/// [`Timeout`] expires.
///
/// The callback function may wake up tasks. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu`; that's
/// automatically taken care of by [`handle_tick`]'s caller.
pub(super) type TimeoutFn<System> = fn(usize, CpuLockGuard<System>) -> CpuLockGuard<System>;

/// Value of [`Timeout::heap_pos`] indicating the timeout is not included in
/// the heap.
const HEAP_POS_NONE: usize = usize::MAX;

impl<System: Port> Drop for Timeout<System> {
    #[inline]
    fn drop(&mut self) {
        if *self.heap_pos.get_mut() != HEAP_POS_NONE {
            // The timeout is still in the heap. Dropping `self` now would
            // cause a use-after-free. Since we don't have CPU Lock and we
            // aren't sure if we can get a hold of it, panicking (which
            // escalates to abort in a `panic = "abort"` build) is the only
            // course of action we can take. The owner of `Timeout` is
            // responsible for ensuring this does not happen.
            panic!("timeout is still linked");
        }
    }
}

impl<System: Kernel> fmt::Debug for Timeout<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &self.callback)
            .field("callback_param", &self.callback_param)
            .finish_non_exhaustive()
    }
}

impl<System: Kernel> Timeout<System> {
    /// Construct a `Timeout`.
    ///
    /// The expiration time is initially unset; use [`Self::set_expiration_after`].
    pub(super) const fn new(callback: TimeoutFn<System>, callback_param: usize) -> Self {
        Self {
            at: TimeoutPropCell::new(TimeoutPropKeyhole, 0),
            heap_pos: TimeoutPropCell::new(TimeoutPropKeyhole, HEAP_POS_NONE),
            callback,
            callback_param,
            _pin: PhantomPinned,
            _phantom: PhantomData,
        }
    }

    /// Configure the `Timeout` to expire in the specified duration from the
    /// current time.
    ///
    /// `duration_ticks` must not exceed [`DURATION_MAX`].
    pub(super) fn set_expiration_after(
        &self,
        mut lock: CpuLockTokenRefMut<'_, System>,
        duration_ticks: Ticks,
    ) {
        debug_assert!(duration_ticks <= DURATION_MAX);

        let now = *System::state().timeout.tick_count.read(&*lock);
        let at = now.wrapping_add(duration_ticks);

        let prop_token = &mut System::state()
            .timeout
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        self.at.replace(prop_token, at);
    }
}

/// A reference to a [`Timeout`].
///
/// This type is `pub` because it appears in
/// [`KernelCfg1::TimeoutHeap`](crate::kernel::KernelCfg1::TimeoutHeap)'s
/// bounds; it's not meant to be used directly.
pub struct TimeoutRef<System: Port>(NonNull<Timeout<System>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<System: Port> Send for TimeoutRef<System> {}
unsafe impl<System: Port> Sync for TimeoutRef<System> {}

impl<System: Port> Clone for TimeoutRef<System> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<System: Port> Copy for TimeoutRef<System> {}

impl<System: Port> fmt::Debug for TimeoutRef<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

/// Used when manipulating the timeout heap. Provides the correct comparator
/// function for [`Timeout`]s. Ensures [`Timeout::heap_pos`] is up-to-date.
struct TimeoutHeapCtx<'a> {
    critical_point: Ticks,
    prop_token: &'a mut TimeoutPropToken,
}

impl<System: Kernel> BinaryHeapCtx<TimeoutRef<System>> for TimeoutHeapCtx<'_> {
    #[inline]
    fn lt(&mut self, x: &TimeoutRef<System>, y: &TimeoutRef<System>) -> bool {
        // Safety: `x` and `y` are in the heap, so the pointees must be valid
        let (x, y) = unsafe {
            (
                *x.0.as_ref().at.read(&*self.prop_token),
                *y.0.as_ref().at.read(&*self.prop_token),
            )
        };
        let critical_point = self.critical_point;
        x.wrapping_sub(critical_point) < y.wrapping_sub(critical_point)
    }

    #[inline]
    fn on_move(&mut self, e: &mut TimeoutRef<System>, new_index: usize) {
        // Safety: `e` is in the heap, so the pointee must be valid
        unsafe { e.0.as_ref() }
            .heap_pos
            .replace(self.prop_token, new_index);
    }
}

// Global time management
// ---------------------------------------------------------------------------

/// Initialize the timekeeping system. Called once by [`Kernel::start`].
///
/// [`Kernel::start`]: crate::kernel::Kernel::start
pub(super) fn init<System: Kernel>(mut lock: CpuLockTokenRefMut<'_, System>) {
    System::state().timeout.tick_count.replace(&mut *lock, 0);
}

/// Get the current tick count.
pub(super) fn tick_count<System: Kernel>(lock: CpuLockTokenRefMut<'_, System>) -> Ticks {
    *System::state().timeout.tick_count.read(&*lock)
}

/// Find the critical point based on the current tick count.
#[inline]
fn critical_point(now: Ticks) -> Ticks {
    now.wrapping_sub(OVERDUE_HEADROOM)
}

/// Calculate the duration until the specified arrival time is reached.
/// Returns `0` if the arrival time is already overdue.
#[inline]
fn saturating_duration_until(at: Ticks, now: Ticks) -> Ticks {
    at.wrapping_sub(critical_point(now)).saturating_sub(OVERDUE_HEADROOM)
}

/// Advance the tick counter by `advance` ticks and process expired
/// timeouts, calling their callback functions.
///
/// The callback functions may wake up tasks, so the caller is responsible
/// for performing a preemption check afterwards.
pub(super) fn handle_tick<System: Kernel>(
    mut lock: CpuLockGuard<System>,
    advance: Ticks,
) -> CpuLockGuard<System> {
    let g_timeout = &System::state().timeout;

    g_timeout
        .tick_count
        .replace_with(&mut *lock, |t| t.wrapping_add(advance));
    let now = *g_timeout.tick_count.read(&*lock);
    let critical_point = critical_point(now);

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty.
    while let Some(&timeout_ref) = g_timeout.heap_and_prop_token.read(&*lock).heap.first() {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { &*timeout_ref.0.as_ptr() };

        let TimeoutHeapAndPropToken { heap, prop_token } =
            g_timeout.heap_and_prop_token.write(&mut *lock);

        // How much time do we have before `timeout` becomes overdue?
        let remaining = saturating_duration_until(*timeout.at.read(&*prop_token), now);
        if remaining > 0 {
            break;
        }

        // The timeout has expired. Remove it from the heap.
        let Timeout {
            callback,
            callback_param,
            ..
        } = *timeout;

        debug_assert_eq!(*timeout.heap_pos.read(&*prop_token), 0);
        timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);

        heap.heap_remove(
            0,
            TimeoutHeapCtx {
                critical_point,
                prop_token,
            },
        );

        // (Note: `timeout` is considered invalid at this point because it's
        // not in the heap anymore)

        // Call the callback function.
        lock = callback(callback_param, lock);
    }

    lock
}

/// Get the number of ticks until the earliest outstanding timeout, or
/// `None` if there is none. Returns `Some(0)` for an overdue timeout.
pub(super) fn next_deadline_delta<System: Kernel>(
    lock: CpuLockTokenRefMut<'_, System>,
) -> Option<Ticks> {
    let g_timeout = &System::state().timeout;
    let now = *g_timeout.tick_count.read(&*lock);

    let TimeoutHeapAndPropToken { heap, prop_token } = g_timeout.heap_and_prop_token.read(&*lock);

    heap.first().map(|timeout_ref| {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { timeout_ref.0.as_ref() };
        saturating_duration_until(*timeout.at.read(prop_token), now)
    })
}

// Timeout management
// ---------------------------------------------------------------------------

/// Register the specified timeout.
pub(super) fn insert_timeout<System: Kernel>(
    mut lock: CpuLockTokenRefMut<'_, System>,
    timeout: Pin<&Timeout<System>>,
) {
    // This check is important for memory safety. For each `Timeout`, there
    // can be only one heap entry pointing to that `Timeout`. `heap_pos`
    // indicates whether there's a corresponding heap entry or not. If we
    // let two entries reside in the heap, when we remove the first one, we
    // would falsely flag the `Timeout` as "not in the heap". If we drop the
    // `Timeout` in this state, the second entry would still be referencing
    // the no-longer-existent `Timeout`.
    let g_timeout = &System::state().timeout;
    let prop_token = &g_timeout.heap_and_prop_token.read(&*lock).prop_token;
    assert_eq!(
        *timeout.heap_pos.read(prop_token),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    let now = *g_timeout.tick_count.read(&*lock);
    let critical_point = critical_point(now);

    // Insert a reference to `timeout` into the heap
    //
    // `Timeout` is `!Unpin` and `Timeout::drop` ensures it's not dropped
    // while it's still in the heap, so `*timeout` will never be leaked¹
    // while being referenced by the heap. Therefore, it's safe to insert a
    // reference to `*timeout` into the heap.
    //
    //  ¹ Rust jargon meaning destroying an object without running its
    //    destructor.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        g_timeout.heap_and_prop_token.write(&mut *lock);

    let pos = heap.heap_push(
        TimeoutRef((&*timeout).into()),
        TimeoutHeapCtx {
            critical_point,
            prop_token,
        },
    );

    // `TimeoutHeapCtx::on_move` should have assigned `heap_pos`
    let prop_token = &g_timeout.heap_and_prop_token.read(&*lock).prop_token;
    debug_assert_eq!(*timeout.heap_pos.read(prop_token), pos);
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
#[inline]
pub(super) fn remove_timeout<System: Kernel>(
    mut lock: CpuLockTokenRefMut<'_, System>,
    timeout: &Timeout<System>,
) {
    let g_timeout = &System::state().timeout;

    let now = *g_timeout.tick_count.read(&*lock);
    let critical_point = critical_point(now);

    // Remove `timeout` from the heap
    //
    // If `heap_pos == HEAP_POS_NONE`, we are supposed to do nothing.
    // `HEAP_POS_NONE` is a huge value, so `heap_remove` will inevitably
    // reject it by bounds check. This way, we can check both for bounds and
    // `HEAP_POS_NONE` in one fell swoop.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        g_timeout.heap_and_prop_token.write(&mut *lock);

    let heap_pos = *timeout.heap_pos.read(&*prop_token);

    let timeout_ref = heap.heap_remove(
        heap_pos,
        TimeoutHeapCtx {
            critical_point,
            prop_token,
        },
    );

    if timeout_ref.is_none() {
        // The cause of failure must be `timeout` not being registered in
        // the first place. (A bounds check failure would clearly be our
        // programming error.)
        debug_assert_eq!(heap_pos, HEAP_POS_NONE);
        return;
    }

    // The removed element should have pointed to `timeout`
    debug_assert_eq!(
        timeout_ref.unwrap().0.as_ptr() as *const _,
        timeout as *const _
    );

    let prop_token = &mut g_timeout.heap_and_prop_token.write(&mut *lock).prop_token;

    // Reset `heap_pos` so that the check in `Timeout::drop` passes
    timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(super) struct TimeoutGuard<'a, 'b, System: Kernel> {
    pub(super) timeout: Pin<&'a Timeout<System>>,
    pub(super) lock: CpuLockTokenRefMut<'b, System>,
}

impl<System: Kernel> Drop for TimeoutGuard<'_, '_, System> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_until_upcoming_deadline() {
        assert_eq!(saturating_duration_until(100, 60), 40);
        assert_eq!(saturating_duration_until(60, 60), 0);
    }

    #[test]
    fn overdue_deadline_saturates_to_zero() {
        assert_eq!(saturating_duration_until(50, 60), 0);
        assert_eq!(saturating_duration_until(0, u32::MAX), 0);
    }

    #[test]
    fn wrapping_deadline_stays_ordered() {
        // A deadline that numerically wrapped around is still "in the
        // future" relative to a counter near the wrap-around point
        let now = u32::MAX - 10;
        let at = now.wrapping_add(DURATION_MAX);
        assert_eq!(saturating_duration_until(at, now), DURATION_MAX);
        assert_eq!(saturating_duration_until(now.wrapping_add(1), now), 1);
    }
}
