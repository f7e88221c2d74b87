//! Kernel tests running on the simulator port.
//!
//! Each test defines its own system type with `use_port!` +
//! `static_kernel!`, boots it on a background thread, and plays the timer
//! driver: it injects ticks (and interrupt-context notifications) only
//! while every task is parked in a kernel wait, which makes the
//! interleavings deterministic. Progress is asserted through a shared
//! `SeqTracker` whose value names the step each task is expected to be at.
mod utils;

mod mutex;
mod notify;
mod queue;
mod scheduler;
mod semaphore;
mod tickless;
