//! The adaptive admission engine.
//!
//! Each admission check reduces two rolling windows into a peak-throughput
//! and a minimum-latency estimate, combines them into a Little's-law style
//! in-flight cap (`inflight ≈ throughput × latency`), and sheds when both the
//! raw and the smoothed in-flight counts sit above that cap while the host is
//! under CPU pressure or inside the cool-off that follows a shed. Everything
//! on this path is atomics and two `RwLock`ed rings; there is no I/O, no
//! waiting, and no background work.

use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use metrics::{counter, gauge};
use tracing::error;

use crate::clock::{Clock, RealClock, TICKS_PER_MILLI, TICKS_PER_SECOND};
use crate::cpu::CpuMonitor;
use crate::window::RollingWindow;
use crate::{Config, ConfigError, Error};

/// Weight of history in the in-flight moving average.
const FLYING_BETA: f64 = 0.9;

/// How long one shed decision keeps the engine hot, in ticks.
const COOL_OFF_TICKS: u64 = TICKS_PER_SECOND;

/// Starting point for the minimum-response-time fold, in milliseconds. A
/// window with no recorded samples reports this instead of collapsing the
/// in-flight cap toward zero.
const DEFAULT_MIN_RT_MS: f64 = 1_000.0;

#[derive(Debug)]
/// The adaptive admission engine.
///
/// All state lives behind an `Arc`: clones are cheap and one engine serves
/// every worker thread without external synchronization.
pub struct Adaptive<C = RealClock> {
    engine: Arc<Engine<C>>,
}

impl<C> Clone for Adaptive<C> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

#[derive(Debug)]
struct Engine<C> {
    clock: C,
    cpu: Box<dyn CpuMonitor>,
    /// CPU trip point in per-mille units.
    cpu_threshold: u64,
    /// Buckets per second. Scales per-bucket pass counts to QPS.
    windows: i64,
    /// Requests admitted but not yet completed.
    flying: AtomicI64,
    /// Smoothed in-flight estimate. Folded on completion only.
    avg_flying: AtomicF64,
    /// Tick of the most recent shed decision. Zero reads as never.
    drop_tick: AtomicU64,
    /// Latch set on shed, cleared once the cool-off elapses.
    dropped_recently: AtomicBool,
    /// Per-bucket successful completion counts.
    pass_counter: RollingWindow,
    /// Per-bucket response time sums, in milliseconds.
    rt_counter: RollingWindow,
}

impl<C> Adaptive<C>
where
    C: Clock,
{
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn with_clock(
        config: Config,
        clock: C,
        cpu: Box<dyn CpuMonitor>,
    ) -> Result<Self, ConfigError> {
        if config.cpu_threshold > 1_000 {
            return Err(ConfigError::CpuThreshold {
                threshold: config.cpu_threshold,
            });
        }

        let window_ticks = config.window_millis.get().saturating_mul(TICKS_PER_MILLI);
        let bucket_ticks = NonZeroU64::new(window_ticks / u64::from(config.buckets.get()))
            .ok_or(ConfigError::ZeroBucketInterval {
                window_millis: config.window_millis.get(),
                buckets: config.buckets.get(),
            })?;
        let size = NonZeroUsize::new(config.buckets.get() as usize)
            .expect("buckets is non-zero by construction");

        #[allow(clippy::cast_possible_wrap)]
        let windows = (TICKS_PER_SECOND / bucket_ticks.get()) as i64;

        let now = clock.ticks_elapsed();
        Ok(Self {
            engine: Arc::new(Engine {
                cpu,
                cpu_threshold: config.cpu_threshold,
                windows,
                flying: AtomicI64::new(0),
                avg_flying: AtomicF64::new(0.0),
                drop_tick: AtomicU64::new(0),
                dropped_recently: AtomicBool::new(false),
                pass_counter: RollingWindow::new(size, bucket_ticks, true, now),
                rt_counter: RollingWindow::new(size, bucket_ticks, true, now),
                clock,
            }),
        })
    }

    pub(crate) fn allow(&self) -> Result<Permit<C>, Error> {
        if self.engine.should_drop() {
            let now = self.engine.clock.ticks_elapsed();
            self.engine.drop_tick.store(now, Ordering::SeqCst);
            self.engine.dropped_recently.store(true, Ordering::SeqCst);
            return Err(Error::ServiceOverloaded);
        }

        self.engine.add_flying(1);
        Ok(Permit {
            start_tick: self.engine.clock.ticks_elapsed(),
            engine: Some(Arc::clone(&self.engine)),
        })
    }
}

impl<C> Engine<C>
where
    C: Clock,
{
    fn add_flying(&self, delta: i64) {
        let flying = self.flying.fetch_add(delta, Ordering::Relaxed) + delta;
        // Fold on completion only. The average lags the raw count in both
        // directions: a burst is admitted before the cap tightens, and a
        // brief lull does not reopen the gate.
        if delta < 0 {
            self.avg_flying
                .update(|avg| avg * FLYING_BETA + (flying as f64) * (1.0 - FLYING_BETA));
        }
    }

    /// Both the smoothed and the raw in-flight count sit above the cap. The
    /// smoothed count catches sustained saturation while ignoring short
    /// bursts; the raw count keeps the gate open once load has genuinely
    /// dropped and the smoother is still catching up.
    #[allow(clippy::cast_possible_truncation)]
    fn high_thru(&self) -> bool {
        let avg_flying = self.avg_flying.load();
        let max_flight = self.max_flight();
        avg_flying as i64 > max_flight && self.flying.load(Ordering::Relaxed) > max_flight
    }

    /// Dynamic in-flight cap: peak observed QPS times minimum observed
    /// response time in seconds, floored at one.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn max_flight(&self) -> i64 {
        let max_qps = (self.max_pass() * self.windows) as f64;
        (max_qps * (self.min_rt() / 1_000.0)).max(1.0) as i64
    }

    /// Largest per-bucket pass count over the window, floored at one.
    #[allow(clippy::cast_possible_truncation)]
    fn max_pass(&self) -> i64 {
        let mut result = 1.0_f64;
        let now = self.clock.ticks_elapsed();
        self.pass_counter.reduce(now, |b| {
            if b.sum > result {
                result = b.sum;
            }
        });
        result as i64
    }

    /// Smallest per-bucket average response time over the window, in
    /// milliseconds, starting from [`DEFAULT_MIN_RT_MS`].
    #[allow(clippy::cast_precision_loss)]
    fn min_rt(&self) -> f64 {
        let mut result = DEFAULT_MIN_RT_MS;
        let now = self.clock.ticks_elapsed();
        self.rt_counter.reduce(now, |b| {
            if b.count == 0 {
                return;
            }
            let avg = (b.sum / b.count as f64).round();
            if avg < result {
                result = avg;
            }
        });
        result
    }

    #[allow(clippy::cast_precision_loss)]
    fn should_drop(&self) -> bool {
        if (self.system_overloaded() || self.still_hot()) && self.high_thru() {
            let flying = self.flying.load(Ordering::Relaxed);
            let avg_flying = self.avg_flying.load();
            let max_pass = self.max_pass();
            let min_rt = self.min_rt();
            let hot = self.still_hot();
            error!(
                cpu = self.cpu.per_mille(),
                max_pass, min_rt, hot, flying, avg_flying, "shedding request"
            );
            counter!("requests_shed").increment(1);
            gauge!("shedder_flying").set(flying as f64);
            gauge!("shedder_avg_flying").set(avg_flying);
            return true;
        }

        false
    }

    /// Whether the engine shed something within the last cool-off period.
    ///
    /// A single shed decision opens a one-second hot window during which
    /// borderline load keeps shedding, a hysteresis band against
    /// oscillation. The latch self-clears on the first read past the
    /// cool-off.
    fn still_hot(&self) -> bool {
        if !self.dropped_recently.load(Ordering::SeqCst) {
            return false;
        }

        let drop_tick = self.drop_tick.load(Ordering::SeqCst);
        if drop_tick == 0 {
            return false;
        }

        let hot = self.clock.ticks_elapsed().saturating_sub(drop_tick) < COOL_OFF_TICKS;
        if !hot {
            self.dropped_recently.store(false, Ordering::SeqCst);
        }

        hot
    }

    fn system_overloaded(&self) -> bool {
        self.cpu.per_mille() >= self.cpu_threshold
    }
}

#[derive(Debug)]
/// One admitted request.
///
/// Completing consumes the permit, so every admission terminates in exactly
/// one of [`Permit::pass`] or [`Permit::fail`]. A permit dropped without
/// being completed leaks its in-flight slot; the engine does not detect this
/// caller error.
pub struct Permit<C = RealClock> {
    start_tick: u64,
    engine: Option<Arc<Engine<C>>>,
}

impl<C> Permit<C>
where
    C: Clock,
{
    /// The request completed successfully. Records its response time and
    /// counts it toward observed throughput.
    #[allow(clippy::cast_precision_loss)]
    pub fn pass(self) {
        let Some(engine) = self.engine else { return };
        let now = engine.clock.ticks_elapsed();
        // Response time in whole milliseconds, rounded up.
        let rt = now.saturating_sub(self.start_tick).div_ceil(TICKS_PER_MILLI);
        engine.add_flying(-1);
        engine.rt_counter.add(now, rt as f64);
        engine.pass_counter.add(now, 1.0);
    }

    /// The request aborted or errored. Releases its in-flight slot; failed
    /// requests are not recorded in the pass or response-time windows.
    pub fn fail(self) {
        let Some(engine) = self.engine else { return };
        engine.add_flying(-1);
    }

    /// A permit whose completions touch nothing. What a disabled shedder
    /// hands out.
    pub(crate) fn inert() -> Self {
        Self {
            start_tick: 0,
            engine: None,
        }
    }
}

/// An `f64` stored as an `AtomicU64` bit pattern, updated with a CAS loop.
#[derive(Debug)]
struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn update<F>(&self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            let new = f(f64::from_bits(old)).to_bits();
            match self
                .bits
                .compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }
}
