//! Temporal quantities used by the kernel API.
//!
//! The kernel has no notion of wall-clock time. Everything is expressed in
//! **ticks**, periods of the fixed-frequency time source that drives
//! [`tick`](crate::kernel::Kernel::tick).
use core::fmt;

use crate::utils::Init;

/// Represents a point of time or a time span as a raw tick count.
pub type Ticks = u32;

/// Represents a non-negative time span used by the API surface of the kernel.
///
/// `Duration` is backed by `u32` and can represent the range
/// `0..=0x7fff_ffff` ticks. The upper half of the `u32` range is reserved so
/// that deadlines in the past and deadlines in the future remain
/// distinguishable under wrapping tick arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Duration {
    ticks: Ticks,
}

impl Init for Duration {
    const INIT: Self = Self::ZERO;
}

impl Default for Duration {
    fn default() -> Self {
        Self::INIT
    }
}

impl Duration {
    /// An empty interval.
    pub const ZERO: Self = Duration { ticks: 0 };

    /// The largest representable time span (`0x7fff_ffff` ticks).
    pub const MAX: Self = Duration {
        ticks: crate::kernel::timeout::DURATION_MAX,
    };

    /// Construct a new `Duration` from the specified number of ticks.
    ///
    /// Panics if `ticks` overflows the representable range of `Duration`.
    #[inline]
    pub const fn from_ticks(ticks: Ticks) -> Self {
        assert!(
            ticks <= crate::kernel::timeout::DURATION_MAX,
            "duration overflow"
        );
        Self { ticks }
    }

    /// Get the total number of ticks contained by this `Duration`.
    #[inline]
    pub const fn as_ticks(self) -> Ticks {
        self.ticks
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ticks", self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_round_trip() {
        assert_eq!(Duration::from_ticks(42).as_ticks(), 42);
        assert_eq!(Duration::ZERO.as_ticks(), 0);
        assert_eq!(Duration::MAX.as_ticks(), 0x7fff_ffff);
    }

    #[test]
    #[should_panic(expected = "duration overflow")]
    fn duration_overflow() {
        let _ = Duration::from_ticks(0x8000_0000);
    }
}
