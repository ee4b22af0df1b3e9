//! Time-bucketed rolling counters.
//!
//! The shedder's throughput and latency estimators are rings of accumulator
//! buckets indexed by time. Memory is bounded by the ring size and expiry is
//! lazy: buckets that have aged out are zeroed by the next writer, and readers
//! step around them by construction. No background sweeper exists. The caller
//! maintains the clock and passes the current tick to every operation, so the
//! whole module is deterministic under test.

use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
/// A single time slice's accumulator.
pub(crate) struct Bucket {
    /// Sum of the samples recorded in this slice.
    pub(crate) sum: f64,
    /// Number of samples recorded in this slice.
    pub(crate) count: u64,
}

impl Bucket {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// A fixed ring of buckets. Indexing is modular and the ring never
/// reallocates. Synchronization is [`RollingWindow`]'s concern.
#[derive(Debug)]
struct Ring {
    buckets: Vec<Bucket>,
}

impl Ring {
    fn new(size: NonZeroUsize) -> Self {
        Self {
            buckets: vec![Bucket::default(); size.get()],
        }
    }

    fn add(&mut self, offset: usize, v: f64) {
        let size = self.buckets.len();
        self.buckets[offset % size].add(v);
    }

    fn reset_bucket(&mut self, offset: usize) {
        let size = self.buckets.len();
        self.buckets[offset % size].reset();
    }

    /// Apply `f` to `count` consecutive buckets starting at `start`, in ring
    /// order, without copying.
    fn reduce<F>(&self, start: usize, count: usize, f: &mut F)
    where
        F: FnMut(&Bucket),
    {
        let size = self.buckets.len();
        for i in 0..count {
            f(&self.buckets[(start + i) % size]);
        }
    }
}

/// State shared between writers and readers, guarded by the window's lock.
#[derive(Debug)]
struct State {
    ring: Ring,
    /// Index of the bucket currently accepting writes.
    offset: usize,
    /// Tick at which `offset` last advanced.
    last_tick: u64,
}

#[derive(Debug)]
/// A ring of [`Bucket`]s indexed by time.
///
/// The window spans `size * interval` ticks. Writers serialize against
/// readers through one `RwLock`: `add` takes it exclusively, `reduce` shared.
pub(crate) struct RollingWindow {
    size: usize,
    /// Width of one bucket, in ticks.
    interval: u64,
    /// Skip the bucket currently accepting writes during reductions. That
    /// bucket holds partial data and would bias any extremum taken over the
    /// window.
    ignore_current: bool,
    state: RwLock<State>,
}

impl RollingWindow {
    pub(crate) fn new(
        size: NonZeroUsize,
        interval: NonZeroU64,
        ignore_current: bool,
        now: u64,
    ) -> Self {
        Self {
            size: size.get(),
            interval: interval.get(),
            ignore_current,
            state: RwLock::new(State {
                ring: Ring::new(size),
                offset: 0,
                last_tick: now,
            }),
        }
    }

    /// Record `v` in the bucket current at `now`.
    pub(crate) fn add(&self, now: u64, v: f64) {
        let mut state = self.state.write().expect("rolling window lock poisoned");
        self.update_offset(&mut state, now);
        let offset = state.offset;
        state.ring.add(offset, v);
    }

    /// Apply `f` to every non-expired bucket, oldest first.
    ///
    /// Observes only: `offset` and `last_tick` are untouched, and expired
    /// buckets not yet zeroed by a writer are stepped around by the start
    /// index arithmetic. `f` runs under the shared lock and must not call
    /// back into this window.
    pub(crate) fn reduce<F>(&self, now: u64, mut f: F)
    where
        F: FnMut(&Bucket),
    {
        let state = self.state.read().expect("rolling window lock poisoned");
        let span = self.span(&state, now);
        let diff = if span == 0 && self.ignore_current {
            self.size - 1
        } else {
            self.size - span
        };
        if diff > 0 {
            let start = (state.offset + span + 1) % self.size;
            state.ring.reduce(start, diff, &mut f);
        }
    }

    /// Bucket boundaries passed since `offset` last advanced.
    fn span(&self, state: &State, now: u64) -> usize {
        span_of(now.saturating_sub(state.last_tick), self.interval, self.size)
    }

    /// Lazy expiry. Zero the buckets that have aged out since the last
    /// write, then advance `offset` to the slice containing `now`.
    fn update_offset(&self, state: &mut State, now: u64) {
        let span = self.span(state, now);
        if span == 0 {
            return;
        }

        let offset = state.offset;
        for i in 1..=span {
            state.ring.reset_bucket(offset + i);
        }

        state.offset = (offset + span) % self.size;
        state.last_tick = now;
    }
}

/// Number of bucket boundaries inside `elapsed`, clamped to `size` once the
/// whole window has rotated.
#[inline]
#[allow(clippy::cast_possible_truncation)]
fn span_of(elapsed: u64, interval: u64, size: usize) -> usize {
    let passed = elapsed / interval;
    if passed < size as u64 {
        passed as usize
    } else {
        size
    }
}

#[cfg(kani)]
mod verification {
    use super::span_of;

    /// The span never exceeds the ring size, no matter how long the window
    /// sat idle.
    #[kani::proof]
    fn span_clamps_to_size() {
        let elapsed: u64 = kani::any();
        let interval: u64 = kani::any_where(|i: &u64| *i > 0);
        let size: usize = kani::any_where(|s: &usize| *s > 0);

        let span = span_of(elapsed, interval, size);
        kani::assert(span <= size, "span must clamp to the ring size");
    }

    /// Inside the first interval no boundary has passed.
    #[kani::proof]
    fn span_zero_inside_first_interval() {
        let interval: u64 = kani::any_where(|i: &u64| *i > 0);
        let elapsed: u64 = kani::any_where(|e: &u64| *e < interval);
        let size: usize = kani::any_where(|s: &usize| *s > 0);

        let span = span_of(elapsed, interval, size);
        kani::assert(span == 0, "no boundary passes inside one interval");
    }

    /// More elapsed time never yields a smaller span.
    #[kani::proof]
    fn span_monotone_in_elapsed() {
        let interval: u64 = kani::any_where(|i: &u64| *i > 0);
        let size: usize = kani::any_where(|s: &usize| *s > 0);
        let shorter: u64 = kani::any();
        let longer: u64 = kani::any_where(|l: &u64| *l >= shorter);

        kani::assert(
            span_of(shorter, interval, size) <= span_of(longer, interval, size),
            "span is monotone in elapsed time",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MS: u64 = 1_000;

    fn window(size: usize, interval_ms: u64, ignore_current: bool) -> RollingWindow {
        RollingWindow::new(
            NonZeroUsize::new(size).expect("test size"),
            NonZeroU64::new(interval_ms * MS).expect("test interval"),
            ignore_current,
            0,
        )
    }

    fn sum_of(window: &RollingWindow, now: u64) -> (f64, usize) {
        let mut sum = 0.0;
        let mut visited = 0;
        window.reduce(now, |b| {
            sum += b.sum;
            visited += 1;
        });
        (sum, visited)
    }

    #[test]
    fn expired_buckets_are_not_observed() {
        let w = window(4, 10, false);
        w.add(0, 1.0);
        w.add(5 * MS, 2.0);

        // The whole window has rotated: nothing is left to visit.
        let (sum, visited) = sum_of(&w, 100 * MS);
        assert_eq!(visited, 0);
        assert!(sum.abs() < f64::EPSILON);
    }

    #[test]
    fn ignore_current_skips_the_partial_bucket() {
        let w = window(3, 50, true);
        w.add(0, 7.0);
        w.add(10 * MS, 11.0);

        // Still inside the first bucket: the reduction sees only the older,
        // empty two.
        let (sum, visited) = sum_of(&w, 20 * MS);
        assert_eq!(visited, 2);
        assert!(sum.abs() < f64::EPSILON);
    }

    #[test]
    fn current_bucket_is_visible_without_ignore() {
        let w = window(3, 50, false);
        w.add(0, 7.0);
        w.add(10 * MS, 11.0);

        let (sum, visited) = sum_of(&w, 20 * MS);
        assert_eq!(visited, 3);
        assert!((sum - 18.0).abs() < f64::EPSILON);
    }

    #[test]
    fn writes_land_in_successive_buckets() {
        let w = window(2, 10, false);
        w.add(0, 1.0);
        w.add(10 * MS, 2.0);
        w.add(15 * MS, 3.0);

        // Both buckets are inside the span while less than one full rotation
        // has passed.
        let (sum, visited) = sum_of(&w, 15 * MS);
        assert_eq!(visited, 2);
        assert!((sum - 6.0).abs() < f64::EPSILON);

        // One boundary later the oldest bucket has expired and is stepped
        // around even though no writer has zeroed it yet.
        let (sum, visited) = sum_of(&w, 25 * MS);
        assert_eq!(visited, 1);
        assert!((sum - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn full_rotation_resets_every_bucket() {
        let w = window(2, 10, false);
        w.add(0, 5.0);
        w.add(5 * MS, 5.0);

        // 100ms is far past the 20ms span: the write triggers lazy expiry of
        // everything before landing in a fresh bucket.
        w.add(100 * MS, 1.0);

        let (sum, visited) = sum_of(&w, 100 * MS);
        assert_eq!(visited, 2);
        assert!((sum - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reduce_visits_size_minus_span() {
        let w = window(5, 10, false);
        w.add(0, 4.0);

        // Three boundaries have passed, none consumed by a writer yet.
        let (sum, visited) = sum_of(&w, 32 * MS);
        assert_eq!(visited, 2);
        // The 32ms-old write is still inside the 50ms span.
        assert!((sum - 4.0).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn offsets_stay_in_bounds(
            size in 1usize..24,
            interval in 1u64..1_000,
            deltas in prop::collection::vec(0u64..5_000, 1..100),
        ) {
            let w = RollingWindow::new(
                NonZeroUsize::new(size).expect("size"),
                NonZeroU64::new(interval).expect("interval"),
                false,
                0,
            );
            let mut now = 0u64;
            for delta in deltas {
                now += delta;
                w.add(now, 1.0);

                {
                    let state = w.state.read().expect("lock");
                    prop_assert!(state.offset < size);
                    prop_assert!(state.last_tick <= now);
                }

                // A reduction at the write's own tick has span 0 and visits
                // the whole ring, current bucket included.
                let (sum, visited) = sum_of(&w, now);
                prop_assert_eq!(visited, size);
                prop_assert!(sum >= 1.0);
            }
        }

        #[test]
        fn ignore_current_always_visits_size_minus_one(
            size in 1usize..24,
            interval in 1u64..1_000,
            deltas in prop::collection::vec(0u64..5_000, 1..100),
        ) {
            let w = RollingWindow::new(
                NonZeroUsize::new(size).expect("size"),
                NonZeroU64::new(interval).expect("interval"),
                true,
                0,
            );
            let mut now = 0u64;
            for delta in deltas {
                now += delta;
                w.add(now, 1.0);

                let mut visited = 0usize;
                w.reduce(now, |_| visited += 1);
                prop_assert_eq!(visited, size - 1);
            }
        }
    }
}
