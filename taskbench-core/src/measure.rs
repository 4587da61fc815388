//! Clock Sources
//!
//! The perf engine never reads time directly; it asks a [`Clock`] for the
//! current time in seconds. Distributed sessions swap in a
//! barrier-synchronized clock (see `comm::BarrierClock`) and unit tests use
//! [`ManualClock`] for deterministic readings.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of timestamps, in seconds from an arbitrary origin.
pub trait Clock: Send + Sync {
    /// Current reading in seconds
    fn now_seconds(&self) -> f64;
}

impl<F> Clock for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now_seconds(&self) -> f64 {
        self()
    }
}

/// Shared clock handle as stored in `PerfAttr` and `TaskRunner`
pub type SharedClock = Arc<dyn Clock>;

/// Monotonic wall clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    /// Clock whose zero is "now"
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }

    /// Shared handle to a fresh monotonic clock
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline(always)]
    fn now_seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Deterministic clock that only moves when told to.
///
/// Cloning shares the underlying reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock reading 0.0
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `seconds`
    pub fn advance(&self, seconds: f64) {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + seconds).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Jump to an absolute reading
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Interval measurement against any clock
pub struct Stopwatch<'a> {
    clock: &'a dyn Clock,
    start: f64,
}

impl<'a> Stopwatch<'a> {
    /// Start measuring now
    #[inline(always)]
    pub fn start(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            start: clock.now_seconds(),
        }
    }

    /// Seconds since `start`; negative if the clock went backwards
    #[inline(always)]
    pub fn elapsed_seconds(&self) -> f64 {
        self.clock.now_seconds() - self.start
    }
}
