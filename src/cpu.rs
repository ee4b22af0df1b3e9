//! Host CPU utilization monitoring.
//!
//! The shedder consumes CPU load as a per-mille reading, 0 through 1000,
//! where 900 means 90% of the host's capacity is busy. The [`CpuMonitor`]
//! trait is that contract; implementations must return promptly since they
//! are consulted on the admission path.

use std::fmt::Debug;
#[cfg(target_os = "linux")]
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};
#[cfg(target_os = "linux")]
use std::time::Instant;

#[cfg(target_os = "linux")]
use tracing::debug;

/// Source of host CPU utilization readings.
pub trait CpuMonitor: Debug + Send + Sync {
    /// Current CPU load in per-mille units, 0 to 1000.
    fn per_mille(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
/// A monitor that always reports the same load.
///
/// Stands in where host sampling is unavailable, and substitutes for the real
/// sampler in tests.
pub struct FixedCpu(pub u64);

impl CpuMonitor for FixedCpu {
    fn per_mille(&self) -> u64 {
        self.0
    }
}

/// The default monitor for this platform.
pub(crate) fn default_monitor() -> Box<dyn CpuMonitor> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcStat::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        // No sampler on this platform: report an idle host so CPU pressure
        // never trips.
        Box::new(FixedCpu(0))
    }
}

/// Weight of history in the utilization moving average.
#[cfg(target_os = "linux")]
const CPU_BETA: f64 = 0.95;

/// Minimum interval between `/proc/stat` reads, so admission checks do not
/// turn into file I/O.
#[cfg(target_os = "linux")]
const REFRESH_INTERVAL_MICROS: u128 = 250_000;

#[cfg(target_os = "linux")]
#[derive(thiserror::Error, Debug)]
enum StatError {
    /// IO error reading `/proc/stat`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The aggregate cpu line was missing or unparsable.
    #[error("/proc/stat malformed")]
    Malformed,
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
/// Aggregate CPU utilization from `/proc/stat`.
///
/// Refresh is lazy: at most one read per 250ms, performed by whichever caller
/// arrives first past the deadline. Readings are smoothed with a moving
/// average and published through an atomic, so concurrent callers observe the
/// cached value without blocking. Sampling failures leave the cached value
/// standing.
pub struct ProcStat {
    /// Last published reading, per-mille.
    cached: AtomicU64,
    state: Mutex<SamplerState>,
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
struct SamplerState {
    last_refresh: Instant,
    prev_busy: u64,
    prev_total: u64,
    smoothed: f64,
}

#[cfg(target_os = "linux")]
impl ProcStat {
    /// Create a new instance of `ProcStat`, seeded with a first kernel
    /// counter snapshot.
    #[must_use]
    pub fn new() -> Self {
        let (busy, total) = read_stat().unwrap_or((0, 0));
        Self {
            cached: AtomicU64::new(0),
            state: Mutex::new(SamplerState {
                last_refresh: Instant::now(),
                prev_busy: busy,
                prev_total: total,
                smoothed: 0.0,
            }),
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcStat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl CpuMonitor for ProcStat {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn per_mille(&self) -> u64 {
        // A refresh already in progress on another thread means the cached
        // value is about as fresh as it gets: fall through to it.
        if let Ok(mut state) = self.state.try_lock() {
            if state.last_refresh.elapsed().as_micros() >= REFRESH_INTERVAL_MICROS {
                match read_stat() {
                    Ok((busy, total)) => {
                        let busy_delta = busy.saturating_sub(state.prev_busy);
                        let total_delta = total.saturating_sub(state.prev_total);
                        if total_delta > 0 {
                            let instant =
                                1_000.0 * (busy_delta as f64) / (total_delta as f64);
                            state.smoothed =
                                state.smoothed * CPU_BETA + instant * (1.0 - CPU_BETA);
                            self.cached.store(state.smoothed as u64, Ordering::Relaxed);
                        }
                        state.prev_busy = busy;
                        state.prev_total = total;
                    }
                    Err(err) => {
                        debug!("cpu refresh failed: {err}");
                    }
                }
                state.last_refresh = Instant::now();
            }
        }
        self.cached.load(Ordering::Relaxed)
    }
}

/// Read the aggregate kernel tick counters as `(busy, total)`.
#[cfg(target_os = "linux")]
fn read_stat() -> Result<(u64, u64), StatError> {
    let contents = std::fs::read_to_string("/proc/stat")?;
    parse_stat(&contents).ok_or(StatError::Malformed)
}

/// Parse the first line of `/proc/stat`. Idle and iowait ticks count as
/// not-busy; everything else is busy.
#[cfg(target_os = "linux")]
fn parse_stat(contents: &str) -> Option<(u64, u64)> {
    let line = contents.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }

    let ticks = fields
        .map(str::parse)
        .collect::<Result<Vec<u64>, _>>()
        .ok()?;
    if ticks.len() < 5 {
        return None;
    }

    let total: u64 = ticks.iter().sum();
    let idle = ticks[3] + ticks[4];
    Some((total.saturating_sub(idle), total))
}

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    use super::parse_stat;

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_aggregate_cpu_line() {
        let contents = "cpu  100 20 30 400 50 6 7 0 0 0\ncpu0 50 10 15 200 25 3 4 0 0 0\n";
        let (busy, total) = parse_stat(contents).expect("well-formed stat");
        assert_eq!(total, 613);
        // idle 400 + iowait 50 are not busy
        assert_eq!(busy, 163);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rejects_malformed_stat() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("intr 12345").is_none());
        assert!(parse_stat("cpu one two three four five").is_none());
        assert!(parse_stat("cpu 1 2 3").is_none());
    }
}
