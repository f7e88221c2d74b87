//! Static configuration mechanism for the kernel
//!
//! A kernel instance is attached to an application-defined *system type*
//! with [`static_kernel!`](crate::static_kernel). The macro instantiates
//! every kernel data structure (task control blocks, stack storage, the
//! ready queue, the timeout heap) as `static` items sized exactly for the
//! given configuration, and implements [`KernelCfg1`] and [`KernelCfg2`]
//! for the system type. There is no dynamic allocation anywhere, and the
//! structural limits (priority range, stack size bounds) are enforced by
//! `const` assertions at compile time.
//!
//! [`KernelCfg1`]: crate::kernel::KernelCfg1
//! [`KernelCfg2`]: crate::kernel::KernelCfg2

/// Attach a kernel instance to a system type.
///
/// The system type must also implement [`Port`](crate::kernel::Port)
/// (typically through a port crate's `use_port!` macro).
///
/// # Example
///
/// ```rust,ignore
/// keel_port_std::use_port!(unsafe struct SystemTraits);
///
/// keel::static_kernel! {
///     impl Kernel for SystemTraits {
///         priority_levels: 8,
///         tasks: {
///             blink => { entry: blink_body, priority: 3, stack_size: 4096 },
///             idle_log => { entry: idle_log_body, priority: 0, stack_size: 4096 },
///         },
///     }
/// }
/// ```
///
/// Each entry of `tasks` names a task (the identifier doubles as the task's
/// display name), its entry function (`fn()`), its base priority
/// (`0..priority_levels`, larger = more urgent), and its stack size in
/// bytes.
#[macro_export]
macro_rules! static_kernel {
    (
        impl Kernel for $sys:ty {
            priority_levels: $levels:literal,
            tasks: {
                $( $task_name:ident => {
                    entry: $entry:expr,
                    priority: $priority:expr,
                    stack_size: $stack_size:expr $(,)?
                } ),* $(,)?
            } $(,)?
        }
    ) => {
        const _: () = {
            const TASK_COUNT: usize = 0 $( + { let _ = stringify!($task_name); 1 } )*;

            // Structural limits are enforced here, not at runtime
            const _: () = ::core::assert!(
                $levels >= 1 && $levels <= $crate::utils::FIXED_PRIO_BITMAP_MAX_LEN,
                "priority level count out of range"
            );
            $(
                const _: () = {
                    ::core::assert!(
                        ($priority as usize) < $levels,
                        "task priority out of range"
                    );
                    ::core::assert!(
                        $stack_size >= $crate::kernel::task::STACK_SIZE_MIN
                            && $stack_size <= $crate::kernel::task::STACK_SIZE_MAX,
                        "task stack size out of bounds"
                    );
                };
            )*

            // One statically-allocated stack region per task. The task's
            // name is reused as the item name, so each task gets a
            // distinct, recognizable symbol.
            $(
                #[allow(non_upper_case_globals)]
                static $task_name: $crate::utils::RawCell<
                    $crate::utils::AlignedStorage<
                        { $stack_size },
                        { <$sys as $crate::kernel::Port>::STACK_ALIGN },
                    >,
                > = $crate::utils::RawCell::new($crate::utils::Init::INIT);
            )*

            static TASK_CB_POOL: [$crate::kernel::TaskCb<$sys>; TASK_COUNT] = [
                $(
                    $crate::kernel::TaskCb::new($crate::kernel::TaskAttr {
                        entry_point: $entry,
                        // Safety: The storage above is used for nothing but
                        //         this task's stack
                        stack: unsafe {
                            $crate::kernel::TaskStack::from_raw_parts(
                                $task_name.get() as *mut u8,
                                $stack_size,
                            )
                        },
                        priority: $priority,
                        name: stringify!($task_name),
                    })
                ),*
            ];

            static KERNEL_STATE: $crate::kernel::State<$sys> =
                <$crate::kernel::State<$sys> as $crate::utils::Init>::INIT;

            // The numeric distance between the most and the least urgent
            // configured task. Advisory only; see
            // `State::priority_spread_is_wide`.
            const PRIORITY_SPREAD: $crate::kernel::Priority = {
                let mut max = 0;
                let mut min = $crate::kernel::Priority::MAX;
                $(
                    if $priority > max {
                        max = $priority;
                    }
                    if $priority < min {
                        min = $priority;
                    }
                )*
                if TASK_COUNT == 0 {
                    0
                } else {
                    max - min
                }
            };

            // Safety: The associated items describe the configuration
            //         instantiated right above
            unsafe impl $crate::kernel::KernelCfg1 for $sys {
                const NUM_TASK_PRIORITY_LEVELS: usize = $levels;
                type TaskReadyQueue = $crate::kernel::task::readyqueue::BitmapQueue<
                    $sys,
                    $crate::utils::FixedPrioBitmap<{ $levels }>,
                    { $levels },
                >;
                type TimeoutHeap = $crate::arrayvec::ArrayVec<
                    $crate::kernel::timeout::TimeoutRef<$sys>,
                    TASK_COUNT,
                >;
            }

            // Safety: Ditto
            unsafe impl $crate::kernel::KernelCfg2 for $sys {
                fn state() -> &'static $crate::kernel::State<$sys> {
                    &KERNEL_STATE
                }

                fn task_cb_pool() -> &'static [$crate::kernel::TaskCb<$sys>] {
                    &TASK_CB_POOL
                }

                const PRIORITY_SPREAD: $crate::kernel::Priority = PRIORITY_SPREAD;
            }
        };
    };
}
