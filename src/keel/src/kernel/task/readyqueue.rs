//! Task ready queue implementation (internal use only).
use core::fmt;

use crate::kernel::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{Priority, TaskCb},
    Kernel, KernelCfg1, Port,
};
use crate::utils::{
    intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
    Init, PrioBitmap,
};

/// Represents a task ready queue, which tracks the list of Ready tasks,
/// segregated by effective priority.
///
/// This trait is not intended to be implemented on custom types.
pub trait ReadyQueue<System>: Send + Sync + fmt::Debug + Init + 'static + private::Sealed {
    type PerTaskData: Send + Sync + fmt::Debug + Init + 'static;

    /// Return a flag indicating whether there's a task in the Ready state
    /// whose effective priority is more urgent than `priority`. When
    /// `priority` is `None`, any Ready task counts.
    fn has_ready_task_above(&self, ctx: Ctx<'_, System>, priority: Option<Priority>) -> bool
    where
        System: Kernel;

    /// Insert the specified task `task_cb` into the ready queue.
    ///
    /// `task_cb` will be inserted as close to the back as possible without
    /// violating the priority ordering. I.e., if there are one or more tasks
    /// having effective priorities identical to that of `task_cb`, `task_cb`
    /// will be inserted after such tasks.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is already
    /// included in the queue.
    unsafe fn push_back_task(&self, ctx: Ctx<'_, System>, task_cb: &'static TaskCb<System>)
    where
        System: Kernel;

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// effective priority of the current task, or `None` if there is no
    /// current task (or there was one but it is not runnable anymore), in
    /// which case this method will return `SwitchTo(_)`.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed
    /// from the queue.
    ///
    /// | `prev_task_priority` | Most urgent ready priority |     Returns         |
    /// | -------------------- | -------------------------- | ------------------- |
    /// |        `None`        |            none            |  `SwitchTo(None)`   |
    /// |        `None`        |           `next`           | `SwitchTo(Some(_))` |
    /// |     `Some(prev)`     |            none            |       `Keep`        |
    /// |     `Some(prev)`     |      `next` ≤ `prev`       |       `Keep`        |
    /// |     `Some(prev)`     |      `next` > `prev`       | `SwitchTo(Some(_))` |
    fn pop_front_task(
        &self,
        ctx: Ctx<'_, System>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<System>>
    where
        System: Kernel;

    /// Reposition the specified task within the ready queue after a change
    /// in its effective priority from `old_effective_priority` to
    /// `effective_priority`.
    ///
    /// `task_cb` will be re-inserted as close to the back as possible
    /// without violating the priority ordering.
    ///
    /// The caller should ensure `old_effective_priority` is not identical
    /// to `effective_priority`.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not
    /// included in the queue or was lastly inserted to the queue with an
    /// effective priority that is not identical to `old_effective_priority`.
    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, System>,
        task_cb: &'static TaskCb<System>,
        effective_priority: Priority,
        old_effective_priority: Priority,
    ) where
        System: Kernel;
}

/// Implements [the sealed trait pattern], which prevents [`ReadyQueue`]
/// against downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The result type of [`ReadyQueue::pop_front_task`].
pub enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue
    /// to schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The context type for [`ReadyQueue`].
pub struct Ctx<'a, System: Port> {
    pub(in crate::kernel) lock: CpuLockTokenRefMut<'a, System>,
}

impl<'a, System: Port> From<CpuLockTokenRefMut<'a, System>> for Ctx<'a, System> {
    #[inline]
    fn from(lock: CpuLockTokenRefMut<'a, System>) -> Self {
        Self { lock }
    }
}

/// The ready queue implementation that uses a set of queues segregated by
/// the effective priorities of contained tasks.
pub struct BitmapQueue<System: Port, Bitmap: 'static, const LEN: usize> {
    /// The set of segregated task ready queues, in which each queue stores
    /// the list of Ready tasks at the corresponding priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<System, StaticListHead<TaskCb<System>>>; LEN],

    /// The task ready bitmap, in which each bit indicates whether the
    /// segregated queue corresponding to that bit contains a task or not.
    bitmap: CpuLockCell<System, Bitmap>,
}

impl<System: Port, Bitmap: 'static + Init, const LEN: usize> Init
    for BitmapQueue<System, Bitmap, LEN>
{
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

/// The per-task portion of [`BitmapQueue`]'s intrusive ready lists.
pub struct BitmapQueuePerTaskData<System: Port> {
    link: CpuLockCell<System, Option<StaticLink<TaskCb<System>>>>,
}

impl<System: Port> Init for BitmapQueuePerTaskData<System> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { link: Init::INIT };
}

impl<System: Kernel> fmt::Debug for BitmapQueuePerTaskData<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueuePerTaskData")
            .field("link", &self.link)
            .finish()
    }
}

/// Get a `ListAccessorCell` used to access a task ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new(
            $head,
            &Static,
            |task_cb: &TaskCb<System>| &task_cb.ready_queue_data.link,
            $key,
        );

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

impl<System: Kernel, Bitmap: PrioBitmap, const LEN: usize> ReadyQueue<System>
    for BitmapQueue<System, Bitmap, LEN>
where
    System: KernelCfg1<TaskReadyQueue = Self>,
{
    type PerTaskData = BitmapQueuePerTaskData<System>;

    #[inline]
    fn has_ready_task_above(
        &self,
        Ctx { lock }: Ctx<'_, System>,
        priority: Option<Priority>,
    ) -> bool {
        match (self.bitmap.read(&*lock).find_set(), priority) {
            (Some(ready), Some(prev)) => ready > prev as usize,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    #[inline]
    unsafe fn push_back_task(
        &self,
        Ctx { mut lock }: Ctx<'_, System>,
        task_cb: &'static TaskCb<System>,
    ) {
        // Insert the task into the ready queue of its effective priority
        //
        // Safety: `task_cb` is unlinked, so it shouldn't return
        //         `InsertError::AlreadyLinked`.
        let pri = *task_cb.effective_priority.read(&*lock) as usize;
        unsafe {
            list_accessor!(&self.queues[pri], lock.borrow_mut())
                .push_back(Ident(task_cb))
                .unwrap_unchecked();
        }

        // Update `bitmap` accordingly
        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    fn pop_front_task(
        &self,
        Ctx { mut lock }: Ctx<'_, System>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<System>> {
        let next_task_priority = self.bitmap.read(&*lock).find_set();

        match (next_task_priority, prev_task_priority) {
            // The current task can keep running unless a strictly more
            // urgent task is ready
            (Some(next), Some(prev)) if next <= prev as usize => ScheduleDecision::Keep,
            (None, Some(_)) => ScheduleDecision::Keep,

            (Some(next), _) => {
                // Take the first task from the ready queue corresponding to
                // `next`
                let mut accessor = list_accessor!(&self.queues[next], lock.borrow_mut());
                // Safety: The linked list is structurally sound, and the
                //         bitmap said it's non-empty
                let task = unsafe { accessor.pop_front().unwrap_unchecked() };
                // There must be at least one element, because the bitmap
                // indicated so
                let task = task.unwrap().0;

                // Update `bitmap` accordingly
                if accessor.is_empty() {
                    self.bitmap.write(&mut *lock).clear(next);
                }

                ScheduleDecision::SwitchTo(Some(task))
            }

            (None, None) => ScheduleDecision::SwitchTo(None),
        }
    }

    #[inline]
    unsafe fn reorder_task(
        &self,
        Ctx { mut lock }: Ctx<'_, System>,
        task_cb: &'static TaskCb<System>,
        effective_priority: Priority,
        old_effective_priority: Priority,
    ) {
        debug_assert_ne!(effective_priority, old_effective_priority);

        // Move the task between ready queues
        let old_pri_empty = {
            let mut accessor = list_accessor!(
                &self.queues[old_effective_priority as usize],
                lock.borrow_mut()
            );
            // Safety: `task_cb` is definitely linked to this list, so
            //         `remove` shouldn't return `ItemError::NotLinked`.
            unsafe { accessor.remove(Ident(task_cb)).unwrap_unchecked() };
            accessor.is_empty()
        };

        // Safety: `task_cb` is not affiliated with any of `self.queues[..]`
        //         at this point, so `push_back` shouldn't return
        //         `AlreadyLinked`.
        unsafe {
            list_accessor!(&self.queues[effective_priority as usize], lock.borrow_mut())
                .push_back(Ident(task_cb))
                .unwrap_unchecked();
        }

        // Update `bitmap` accordingly
        // (This code assumes `effective_priority != old_effective_priority`.)
        let task_ready_bitmap = self.bitmap.write(&mut *lock);
        task_ready_bitmap.set(effective_priority as usize);
        if old_pri_empty {
            task_ready_bitmap.clear(old_effective_priority as usize);
        }
    }
}

impl<System: Kernel, Bitmap: fmt::Debug + 'static, const LEN: usize> fmt::Debug
    for BitmapQueue<System, Bitmap, LEN>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

impl<System: Kernel, Bitmap: PrioBitmap, const LEN: usize> private::Sealed
    for BitmapQueue<System, Bitmap, LEN>
where
    System: KernelCfg1<TaskReadyQueue = Self>,
{
}
