//! Monotonic time for the shedder.
//!
//! All time arithmetic in this crate is done in ticks, where one tick is one
//! microsecond measured from an arbitrary fixed epoch, in practice the moment
//! the clock was created. The source is monotonic and immune to wall-clock
//! adjustment. Tests substitute a deterministic implementation.

use std::time::Instant;

/// One millisecond in ticks.
pub(crate) const TICKS_PER_MILLI: u64 = 1_000;

/// One second in ticks.
pub(crate) const TICKS_PER_SECOND: u64 = 1_000_000;

/// The clock used for every shedder.
pub trait Clock {
    /// The number of ticks elapsed since an arbitrary fixed epoch.
    fn ticks_elapsed(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    /// Return the number of ticks since `Clock` was created.
    ///
    /// # Panics
    ///
    /// Function will panic if the number of ticks elapsed is greater than
    /// `u64::MAX`.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let ticks_since: u128 = self.start.elapsed().as_micros();
        assert!(
            ticks_since <= u128::from(u64::MAX),
            "584,554 years elapsed since last call!"
        );
        ticks_since as u64
    }
}
