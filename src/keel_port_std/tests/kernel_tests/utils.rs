//! Utility code shared by the kernel tests.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration as StdDuration, Instant};

use keel::prelude::*;
use keel_port_std::{check_panics, quiesce, PortInstance};

/// How long the driver waits for the tasks to make progress before
/// declaring the test hung.
const WAIT_BUDGET: StdDuration = StdDuration::from_secs(10);

/// An atomic counter used to validate the order of execution.
pub struct SeqTracker {
    value: AtomicUsize,
}

#[allow(dead_code)] // each test binary module uses a different subset
impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Assert that the counter is `old` and replace it with `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        assert_eq!(
            self.value.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst),
            Ok(old),
            "unexpected sequence point",
        );
    }
}

/// Boot the given system on a background thread. The thread never exits;
/// it becomes part of the simulated machine.
#[allow(dead_code)]
pub fn boot<System: PortInstance>() {
    std::thread::Builder::new()
        .name("boot".to_owned())
        .spawn(|| System::start())
        .unwrap();
}

/// Block the driver until `tracker` reaches `expected`, failing fast if a
/// task panicked.
#[allow(dead_code)]
#[track_caller]
pub fn wait_seq<System: PortInstance>(tracker: &SeqTracker, expected: usize) {
    let deadline = Instant::now() + WAIT_BUDGET;
    loop {
        check_panics::<System>();
        let value = tracker.get();
        if value == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for sequence point {expected} (currently at {value})"
        );
        std::thread::sleep(StdDuration::from_millis(1));
    }
}

/// Inject `n` timer ticks, each one issued only once the tasks are
/// quiescent.
#[allow(dead_code)]
pub fn run_ticks<System: PortInstance>(n: usize) {
    for _ in 0..n {
        quiesce::<System>();
        System::tick().unwrap();
    }
}
