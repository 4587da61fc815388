//! Perf Engine
//!
//! Drives a [`TaskRunner`] through repeated phases and times the interval
//! against the clock carried by [`PerfAttr`]. Two shapes are supported:
//!
//! - **Pipeline**: `iterations` full cycles, the timed window spans all of them
//! - **Run-only**: untimed setup, `iterations` consecutive `Run` calls timed,
//!   untimed teardown, optionally followed by an untimed correctness cycle
//!
//! There is no warm-up and no retry. The engine keeps no state between calls.

use crate::measure::{MonotonicClock, SharedClock, Stopwatch};
use crate::task::{Phase, Task, TaskError, TaskRunner, TestingMode};
use std::fmt;
use thiserror::Error;

/// Default repetitions per measurement
pub const DEFAULT_ITERATIONS: u64 = 5;

/// Default ceiling on a perf measurement before it is fatal
pub const DEFAULT_PERF_TIME_BUDGET_SECS: f64 = 10.0;

/// What the timed window covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfMode {
    /// Full Validate..PostProcess cycles
    Pipeline,
    /// `Run` calls only
    RunOnly,
}

impl PerfMode {
    /// Tag printed in statistic lines
    pub fn label(self) -> &'static str {
        match self {
            PerfMode::Pipeline => "pipeline",
            PerfMode::RunOnly => "task_run",
        }
    }
}

impl fmt::Display for PerfMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Measurement configuration
#[derive(Clone)]
pub struct PerfAttr {
    /// Repetitions inside the timed window (>= 1)
    pub iterations: u64,
    /// Time source
    pub clock: SharedClock,
}

impl PerfAttr {
    /// `iterations` repetitions against a monotonic clock
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            clock: MonotonicClock::shared(),
        }
    }

    /// Replace the clock (e.g. with a barrier-synchronized one)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn check(&self) -> Result<(), PerfError> {
        if self.iterations == 0 {
            return Err(PerfError::InvalidIterations);
        }
        Ok(())
    }
}

impl Default for PerfAttr {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

impl fmt::Debug for PerfAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfAttr")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Outcome of one measurement
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PerfResult {
    /// Total seconds inside the timed window, never negative
    pub elapsed_seconds: f64,
    /// What was timed
    pub mode: PerfMode,
    /// Repetitions inside the window
    pub iterations: u64,
}

impl PerfResult {
    /// Average seconds per repetition
    pub fn per_iteration_seconds(&self) -> f64 {
        self.elapsed_seconds / self.iterations.max(1) as f64
    }

    /// Whether the measurement stayed strictly under `budget_secs`
    pub fn within_budget(&self, budget_secs: f64) -> bool {
        self.elapsed_seconds < budget_secs
    }
}

/// Measurement failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PerfError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("validation rejected the task's buffers")]
    Rejected,

    #[error("{phase} reported failure during measurement")]
    PhaseFailed { phase: Phase },

    #[error("perf measurement needs at least one iteration")]
    InvalidIterations,
}

/// Measurement entry points
pub struct Perf;

impl Perf {
    /// Time `attr.iterations` full cycles
    pub fn measure_pipeline<T: Task>(
        runner: &mut TaskRunner<T>,
        attr: &PerfAttr,
    ) -> Result<PerfResult, PerfError> {
        attr.check()?;
        runner.set_mode(TestingMode::Perf);

        let watch = Stopwatch::start(attr.clock.as_ref());
        for _ in 0..attr.iterations {
            drive_cycle(runner)?;
        }
        let elapsed = watch.elapsed_seconds();

        Ok(PerfResult {
            elapsed_seconds: clamp_elapsed(elapsed),
            mode: PerfMode::Pipeline,
            iterations: attr.iterations,
        })
    }

    /// Time `attr.iterations` consecutive `Run` calls between an untimed
    /// setup and teardown
    pub fn measure_run_only<T: Task>(
        runner: &mut TaskRunner<T>,
        attr: &PerfAttr,
    ) -> Result<PerfResult, PerfError> {
        attr.check()?;
        runner.set_mode(TestingMode::Perf);

        if !runner.validate()? {
            return Err(PerfError::Rejected);
        }
        if !runner.pre_process()? {
            runner.abandon_cycle();
            return Err(PerfError::PhaseFailed {
                phase: Phase::PreProcess,
            });
        }

        let watch = Stopwatch::start(attr.clock.as_ref());
        for _ in 0..attr.iterations {
            if !runner.run()? {
                runner.abandon_cycle();
                return Err(PerfError::PhaseFailed { phase: Phase::Run });
            }
        }
        let elapsed = watch.elapsed_seconds();

        if !runner.post_process()? {
            return Err(PerfError::PhaseFailed {
                phase: Phase::PostProcess,
            });
        }

        Ok(PerfResult {
            elapsed_seconds: clamp_elapsed(elapsed),
            mode: PerfMode::RunOnly,
            iterations: attr.iterations,
        })
    }

    /// [`measure_run_only`](Self::measure_run_only) followed by one untimed
    /// full cycle, so the outputs left behind come from a clean pipeline.
    pub fn measure_run_only_checked<T: Task>(
        runner: &mut TaskRunner<T>,
        attr: &PerfAttr,
    ) -> Result<PerfResult, PerfError> {
        let result = Self::measure_run_only(runner, attr)?;
        drive_cycle(runner)?;
        Ok(result)
    }
}

fn drive_cycle<T: Task>(runner: &mut TaskRunner<T>) -> Result<(), PerfError> {
    if !runner.validate()? {
        return Err(PerfError::Rejected);
    }
    if !runner.pre_process()? {
        runner.abandon_cycle();
        return Err(PerfError::PhaseFailed {
            phase: Phase::PreProcess,
        });
    }
    if !runner.run()? {
        runner.abandon_cycle();
        return Err(PerfError::PhaseFailed { phase: Phase::Run });
    }
    // PostProcess closes the cycle whatever it returns
    if !runner.post_process()? {
        return Err(PerfError::PhaseFailed {
            phase: Phase::PostProcess,
        });
    }
    Ok(())
}

fn clamp_elapsed(elapsed: f64) -> f64 {
    if elapsed < 0.0 {
        tracing::warn!(elapsed, "clock went backwards during measurement, reporting 0");
        return 0.0;
    }
    elapsed
}

/// One printable statistic line: `<test_id>:<mode>:<seconds>`.
///
/// Over budget the seconds field reads `-1.0000000000`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Statistic {
    /// Test identity
    pub test_id: String,
    /// Measured mode
    pub mode: PerfMode,
    /// Elapsed seconds of the measurement
    pub seconds: f64,
    /// Budget the measurement was checked against
    pub budget_seconds: f64,
}

impl Statistic {
    /// Statistic for `result` checked against `budget_secs`
    pub fn new(test_id: impl Into<String>, result: &PerfResult, budget_secs: f64) -> Self {
        Self {
            test_id: test_id.into(),
            mode: result.mode,
            seconds: result.elapsed_seconds,
            budget_seconds: budget_secs,
        }
    }

    /// Whether the measurement is under budget
    pub fn within_budget(&self) -> bool {
        self.seconds < self.budget_seconds
    }

    /// Single-line diagnostic for an over-budget measurement
    pub fn budget_message(&self) -> String {
        format!(
            "Task execute time need to be: time < {} secs. Original time in secs: {:.10}",
            self.budget_seconds, self.seconds
        )
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.within_budget() { self.seconds } else { -1.0 };
        write!(f, "{}:{}:{:.10}", self.test_id, self.mode, shown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferContract;
    use crate::measure::ManualClock;
    use std::sync::Arc;

    /// Advances a shared manual clock by a fixed amount in every phase
    struct TickingTask {
        clock: ManualClock,
        per_phase: [f64; 4],
        fail_in: Option<Phase>,
    }

    impl TickingTask {
        fn new(clock: &ManualClock, per_phase: [f64; 4]) -> Self {
            Self {
                clock: clock.clone(),
                per_phase,
                fail_in: None,
            }
        }

        fn tick(&self, phase: Phase) -> bool {
            self.clock.advance(self.per_phase[phase.index()]);
            self.fail_in != Some(phase)
        }
    }

    impl Task for TickingTask {
        fn validate(&mut self, _data: &BufferContract) -> bool {
            self.tick(Phase::Validate)
        }
        fn pre_process(&mut self, _data: &mut BufferContract) -> bool {
            self.tick(Phase::PreProcess)
        }
        fn run(&mut self, _data: &mut BufferContract) -> bool {
            self.tick(Phase::Run)
        }
        fn post_process(&mut self, _data: &mut BufferContract) -> bool {
            self.tick(Phase::PostProcess)
        }
    }

    fn setup(per_phase: [f64; 4]) -> (ManualClock, TaskRunner<TickingTask>, PerfAttr) {
        let clock = ManualClock::new();
        let runner = TaskRunner::new(
            TickingTask::new(&clock, per_phase),
            BufferContract::new().into_shared(),
        );
        let attr = PerfAttr::new(4).with_clock(Arc::new(clock.clone()));
        (clock, runner, attr)
    }

    #[test]
    fn test_pipeline_times_every_phase() {
        let (_clock, mut runner, attr) = setup([0.5, 1.0, 2.0, 0.25]);
        let result = Perf::measure_pipeline(&mut runner, &attr).unwrap();

        assert_eq!(result.mode, PerfMode::Pipeline);
        assert_eq!(result.iterations, 4);
        assert!((result.elapsed_seconds - 4.0 * 3.75).abs() < 1e-9);
        assert!((result.per_iteration_seconds() - 3.75).abs() < 1e-9);
        assert_eq!(runner.ledger().completed_cycles(), 4);
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_run_only_excludes_setup_and_teardown() {
        let (_clock, mut runner, attr) = setup([100.0, 100.0, 0.5, 100.0]);
        let result = Perf::measure_run_only(&mut runner, &attr).unwrap();

        assert_eq!(result.mode, PerfMode::RunOnly);
        assert!((result.elapsed_seconds - 2.0).abs() < 1e-9);
        assert_eq!(runner.ledger().run_calls(), 4);
        assert_eq!(runner.ledger().completed_cycles(), 1);
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_checked_run_only_adds_untimed_cycle() {
        let (_clock, mut runner, attr) = setup([100.0, 100.0, 0.5, 100.0]);
        let result = Perf::measure_run_only_checked(&mut runner, &attr).unwrap();

        assert!((result.elapsed_seconds - 2.0).abs() < 1e-9);
        assert_eq!(runner.ledger().completed_cycles(), 2);
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_doubling_iterations_never_shrinks_elapsed() {
        let (_c1, mut short, attr_short) = setup([0.0, 0.0, 0.3, 0.0]);
        let (_c2, mut long, attr_long) = setup([0.0, 0.0, 0.3, 0.0]);
        let attr_long = PerfAttr {
            iterations: attr_short.iterations * 2,
            ..attr_long
        };

        let a = Perf::measure_pipeline(&mut short, &attr_short).unwrap();
        let b = Perf::measure_pipeline(&mut long, &attr_long).unwrap();
        assert!(b.elapsed_seconds >= a.elapsed_seconds);
        short.finish().unwrap();
        long.finish().unwrap();
    }

    #[test]
    fn test_backwards_clock_is_clamped() {
        let (_clock, mut runner, attr) = setup([0.0, 0.0, -1.0, 0.0]);
        let result = Perf::measure_run_only(&mut runner, &attr).unwrap();
        assert_eq!(result.elapsed_seconds, 0.0);
        runner.finish().unwrap();
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let (_clock, mut runner, attr) = setup([0.0; 4]);
        let attr = PerfAttr {
            iterations: 0,
            ..attr
        };
        assert_eq!(
            Perf::measure_pipeline(&mut runner, &attr),
            Err(PerfError::InvalidIterations)
        );
        // Nothing ran, so close the runner without the drop check
        assert!(runner.check_complete().is_err());
    }

    #[test]
    fn test_failed_run_aborts_measurement() {
        let clock = ManualClock::new();
        let mut task = TickingTask::new(&clock, [0.0; 4]);
        task.fail_in = Some(Phase::Run);
        let mut runner = TaskRunner::new(task, BufferContract::new().into_shared());
        let attr = PerfAttr::new(3).with_clock(Arc::new(clock));

        let err = Perf::measure_pipeline(&mut runner, &attr).unwrap_err();
        assert_eq!(err, PerfError::PhaseFailed { phase: Phase::Run });
        // The abandoned cycle leaves a well-formed ledger
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_rejected_validation() {
        let clock = ManualClock::new();
        let mut task = TickingTask::new(&clock, [0.0; 4]);
        task.fail_in = Some(Phase::Validate);
        let mut runner = TaskRunner::new(task, BufferContract::new().into_shared());
        let attr = PerfAttr::new(1).with_clock(Arc::new(clock));

        assert_eq!(
            Perf::measure_run_only(&mut runner, &attr),
            Err(PerfError::Rejected)
        );
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_perf_mode_disables_functional_budget() {
        let (_clock, mut runner, attr) = setup([0.0, 0.0, 50.0, 0.0]);
        let result = Perf::measure_pipeline(&mut runner, &attr).unwrap();
        assert_eq!(runner.mode(), TestingMode::Perf);
        assert!(result.elapsed_seconds > 1.0);
        runner.finish().unwrap();
    }

    #[test]
    fn test_statistic_line() {
        let result = PerfResult {
            elapsed_seconds: 0.125,
            mode: PerfMode::Pipeline,
            iterations: 5,
        };
        let stat = Statistic::new("sum_seq", &result, 10.0);
        assert!(stat.within_budget());
        assert_eq!(stat.to_string(), "sum_seq:pipeline:0.1250000000");
    }

    #[test]
    fn test_statistic_over_budget_prints_negative_one() {
        let result = PerfResult {
            elapsed_seconds: 10.0,
            mode: PerfMode::RunOnly,
            iterations: 5,
        };
        let stat = Statistic::new("sum_mp", &result, 10.0);
        assert!(!stat.within_budget());
        assert_eq!(stat.to_string(), "sum_mp:task_run:-1.0000000000");
        assert!(stat.budget_message().contains("10.0000000000"));
    }
}
