//! Adaptive load shedding for request-serving processes.
//!
//! At admission time the shedder decides whether to accept or reject an
//! incoming request so the process avoids collapse under overload. The
//! decision combines recent observed throughput, recent observed response
//! latency, the number of requests currently in flight, and host CPU
//! utilization. Admission is O(1), lock-light, and safe to call from any
//! number of worker threads; the rolling measurements behind it advance and
//! expire lazily, with no background timer.
//!
//! An accepted request hands back a [`adaptive::Permit`]. Completing the
//! permit feeds the measurements the next decision draws on: [`pass`] records
//! the response time and counts toward throughput, [`fail`] only releases
//! the in-flight slot.
//!
//! [`pass`]: adaptive::Permit::pass
//! [`fail`]: adaptive::Permit::fail
//!
//! ```
//! use loadshed::{Config, Error, Shedder};
//!
//! let shedder = Shedder::new(Config::default())?;
//! match shedder.allow() {
//!     Ok(permit) => {
//!         // serve the request, then:
//!         permit.pass();
//!     }
//!     Err(Error::ServiceOverloaded) => {
//!         // reject, e.g. with HTTP 503
//!     }
//! }
//! # Ok::<(), loadshed::ConfigError>(())
//! ```

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unnecessary_to_owned)]
#![deny(clippy::float_cmp)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::rc_buffer)]
#![deny(clippy::redundant_allocation)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]

use std::num::{NonZeroU32, NonZeroU64};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

pub mod adaptive;
pub mod clock;
pub mod cpu;
mod window;

use clock::{Clock, RealClock};
use cpu::CpuMonitor;

/// Whether newly constructed shedders are live. Existing instances are
/// unaffected by changes.
static ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable shedding process-wide.
///
/// From this point on constructors return the inert [`Shedder::AllIn`]
/// variant, which admits unconditionally and measures nothing. Idempotent;
/// already-constructed shedders are unaffected. Intended for tests and for
/// wiring to a feature flag.
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst);
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of the shedding mechanism.
pub struct Config {
    /// Total span of the rolling measurement windows, in milliseconds.
    #[serde(default = "default_window_millis")]
    pub window_millis: NonZeroU64,
    /// Number of buckets the span is divided into.
    #[serde(default = "default_buckets")]
    pub buckets: NonZeroU32,
    /// CPU utilization trip point, in per-mille units (900 is 90%).
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: u64,
}

fn default_window_millis() -> NonZeroU64 {
    NonZeroU64::new(5_000).expect("constant is non-zero")
}

fn default_buckets() -> NonZeroU32 {
    NonZeroU32::new(50).expect("constant is non-zero")
}

fn default_cpu_threshold() -> u64 {
    900
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_millis: default_window_millis(),
            buckets: default_buckets(),
            cpu_threshold: default_cpu_threshold(),
        }
    }
}

/// Errors produced by [`Shedder::allow`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The process is overloaded; the request was shed.
    #[error("service overloaded")]
    ServiceOverloaded,
}

/// Errors produced when constructing a [`Shedder`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The window cannot be split into that many buckets without the bucket
    /// interval truncating to zero.
    #[error("window of {window_millis}ms cannot be split into {buckets} buckets")]
    ZeroBucketInterval {
        /// Configured window span in milliseconds.
        window_millis: u64,
        /// Configured bucket count.
        buckets: u32,
    },
    /// Per-mille is a closed 0..=1000 scale; a threshold above it can never
    /// trip.
    #[error("cpu threshold {threshold} exceeds 1000 per-mille")]
    CpuThreshold {
        /// The rejected threshold.
        threshold: u64,
    },
}

#[derive(Debug)]
/// The admission mechanism.
pub enum Shedder<C = RealClock> {
    /// Admission guarded by the adaptive engine.
    Adaptive(adaptive::Adaptive<C>),
    /// Admission always granted and nothing measured. What the constructors
    /// return once [`disable`] has been called.
    AllIn,
}

impl Shedder<RealClock> {
    /// Create a new shedder with the real clock and this platform's CPU
    /// monitor.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::with_cpu_monitor(config, cpu::default_monitor())
    }

    /// Create a new shedder reading CPU utilization from `cpu`.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn with_cpu_monitor(
        config: Config,
        cpu: Box<dyn CpuMonitor>,
    ) -> Result<Self, ConfigError> {
        if !ENABLED.load(Ordering::SeqCst) {
            return Ok(Shedder::AllIn);
        }

        Ok(Shedder::Adaptive(adaptive::Adaptive::with_clock(
            config,
            RealClock::default(),
            cpu,
        )?))
    }
}

impl<C> Shedder<C>
where
    C: Clock,
{
    /// Decide whether to admit a request.
    ///
    /// On admission the returned permit must be completed with exactly one
    /// of [`Permit::pass`] or [`Permit::fail`].
    ///
    /// [`Permit::pass`]: adaptive::Permit::pass
    /// [`Permit::fail`]: adaptive::Permit::fail
    ///
    /// # Errors
    ///
    /// [`Error::ServiceOverloaded`] when the request is shed. No other error
    /// is produced.
    pub fn allow(&self) -> Result<adaptive::Permit<C>, Error> {
        match self {
            Shedder::Adaptive(inner) => inner.allow(),
            Shedder::AllIn => Ok(adaptive::Permit::inert()),
        }
    }
}

impl<C> Clone for Shedder<C> {
    fn clone(&self) -> Self {
        match self {
            Shedder::Adaptive(inner) => Shedder::Adaptive(inner.clone()),
            Shedder::AllIn => Shedder::AllIn,
        }
    }
}
