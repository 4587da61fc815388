//! Task Lifecycle
//!
//! A [`Task`] implements four phases over a [`BufferContract`]. Callers never
//! invoke those phases directly: they go through a [`TaskRunner`], which
//! records every call in a [`Ledger`] and rejects any call that breaks the
//! canonical order
//!
//! ```text
//! Validate -> PreProcess -> Run (1..n) -> PostProcess
//! ```
//!
//! Cycles may repeat. Violations are reported eagerly at the offending call
//! and again when the runner is torn down.

use crate::buffer::{BufferContract, SharedBuffers};
use crate::measure::{MonotonicClock, SharedClock};
use std::sync::{Arc, PoisonError};
use thiserror::Error;

/// Default ceiling for the PreProcess..PostProcess window of a functional test
pub const DEFAULT_TASK_TIME_BUDGET_SECS: f64 = 1.0;

/// One lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Shape and attribute checks
    Validate,
    /// Input preparation
    PreProcess,
    /// The measured computation
    Run,
    /// Output finalisation
    PostProcess,
}

impl Phase {
    /// Canonical order of one cycle
    pub const SEQUENCE: [Phase; 4] = [
        Phase::Validate,
        Phase::PreProcess,
        Phase::Run,
        Phase::PostProcess,
    ];

    /// Position of this phase within a cycle
    pub fn index(self) -> usize {
        self as usize
    }

    /// Phase name as printed in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Phase::Validate => "Validate",
            Phase::PreProcess => "PreProcess",
            Phase::Run => "Run",
            Phase::PostProcess => "PostProcess",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn phase_or_end(actual: &Option<Phase>) -> &'static str {
    actual.map(Phase::name).unwrap_or("<end of ledger>")
}

/// Lifecycle order violation.
///
/// `position` is the index in the current cycle (after collapsing repeated
/// `Run` calls) where the observed phase diverged from the canonical one.
/// `actual == None` means the ledger ended before `expected` was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "ORDER OF FUNCTIONS IS NOT RIGHT: at position {position} expected {expected}, got {}",
    phase_or_end(.actual)
)]
pub struct ProtocolError {
    /// Phase the canonical sequence requires here
    pub expected: Phase,
    /// Phase actually invoked (`None` at teardown)
    pub actual: Option<Phase>,
    /// Index within the current cycle
    pub position: usize,
}

/// Errors surfaced by `TaskRunner` phase calls
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("task execute time need to be < {budget_secs} secs, original time {elapsed_secs:.10} secs")]
    TimeBudgetExceeded { elapsed_secs: f64, budget_secs: f64 },
}

/// Ordered record of phase invocations, stored as the last phase seen plus
/// a position counter.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    last: Option<Phase>,
    position: usize,
    run_calls: u64,
    completed_cycles: u64,
    rejected_cycles: u64,
    touched: bool,
    violation: Option<ProtocolError>,
}

impl Ledger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase the next call must name (Run is also legal after Run)
    pub fn expected_next(&self) -> Phase {
        match self.last {
            None => Phase::Validate,
            Some(Phase::Validate) => Phase::PreProcess,
            Some(Phase::PreProcess) => Phase::Run,
            Some(Phase::Run) => Phase::PostProcess,
            // A completed cycle resets `last` to None
            Some(Phase::PostProcess) => Phase::Validate,
        }
    }

    /// Record `phase`, or report where it breaks the canonical order.
    ///
    /// A violation leaves the ledger untouched apart from remembering the
    /// first violation, which teardown reports again.
    pub fn record(&mut self, phase: Phase) -> Result<(), ProtocolError> {
        self.touched = true;

        if phase == Phase::Run && self.last == Some(Phase::Run) {
            self.run_calls += 1;
            return Ok(());
        }

        let expected = self.expected_next();
        if phase != expected {
            let error = ProtocolError {
                expected,
                actual: Some(phase),
                position: self.position,
            };
            self.violation.get_or_insert(error);
            return Err(error);
        }

        if phase == Phase::Run {
            self.run_calls += 1;
        }

        if phase == Phase::PostProcess {
            self.last = None;
            self.position = 0;
            self.completed_cycles += 1;
        } else {
            self.last = Some(phase);
            self.position += 1;
        }
        Ok(())
    }

    /// Close the current cycle without the remaining phases (validation
    /// said no, or a perf measurement gave up on a failed phase).
    pub(crate) fn close_rejected(&mut self) {
        self.last = None;
        self.position = 0;
        self.rejected_cycles += 1;
    }

    /// Whether the ledger describes complete, well-formed cycles only
    pub fn check_complete(&self) -> Result<(), ProtocolError> {
        if let Some(violation) = self.violation {
            return Err(violation);
        }
        if !self.touched || self.last.is_some() {
            return Err(ProtocolError {
                expected: self.expected_next(),
                actual: None,
                position: self.position,
            });
        }
        Ok(())
    }

    /// Forget everything (new data, fresh protocol)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Index within the current cycle
    pub fn position(&self) -> usize {
        self.position
    }

    /// Last phase of the open cycle
    pub fn last(&self) -> Option<Phase> {
        self.last
    }

    /// Cycles that reached PostProcess
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    /// Cycles closed by a failed validation
    pub fn rejected_cycles(&self) -> u64 {
        self.rejected_cycles
    }

    /// Total Run invocations, repeats included
    pub fn run_calls(&self) -> u64 {
        self.run_calls
    }
}

/// Family of parallel backend a task implementation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Plain sequential code
    Sequential,
    /// Explicit worker threads
    Threads,
    /// Work-stealing task scheduler
    TaskBased,
    /// Collective message exchange between ranks
    MessagePassing,
    /// Mixed backends
    Hybrid,
}

impl Backend {
    /// Short tag used in test identities and reports
    pub fn tag(self) -> &'static str {
        match self {
            Backend::Sequential => "seq",
            Backend::Threads => "threads",
            Backend::TaskBased => "tasks",
            Backend::MessagePassing => "mp",
            Backend::Hybrid => "all",
        }
    }
}

/// A concrete algorithm/backend pair.
///
/// Each phase returns its own success flag. `validate` only inspects the
/// contract; the other phases may mutate it in place.
pub trait Task: Send {
    /// Check that the contract suits this problem (e.g. output count)
    fn validate(&mut self, data: &BufferContract) -> bool;

    /// Prepare internal state from the inputs
    fn pre_process(&mut self, data: &mut BufferContract) -> bool;

    /// Compute
    fn run(&mut self, data: &mut BufferContract) -> bool;

    /// Write results to the outputs
    fn post_process(&mut self, data: &mut BufferContract) -> bool;

    /// Backend family, for reporting
    fn backend(&self) -> Backend {
        Backend::Sequential
    }

    /// Display name, for reporting
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Whether the runner enforces the functional time budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestingMode {
    /// Functional test: PreProcess..PostProcess must fit the task budget
    Functional,
    /// Performance test: timing is the perf engine's job
    Perf,
}

/// Protocol-checked front for a [`Task`]
pub struct TaskRunner<T: Task> {
    task: T,
    data: SharedBuffers,
    ledger: Ledger,
    mode: TestingMode,
    time_budget_secs: f64,
    clock: SharedClock,
    pre_process_stamp: Option<f64>,
    finished: bool,
}

impl<T: Task> TaskRunner<T> {
    /// Wrap `task` over `data` in functional mode with the default budget
    pub fn new(task: T, data: SharedBuffers) -> Self {
        Self {
            task,
            data,
            ledger: Ledger::new(),
            mode: TestingMode::Functional,
            time_budget_secs: DEFAULT_TASK_TIME_BUDGET_SECS,
            clock: Arc::new(MonotonicClock::new()),
            pre_process_stamp: None,
            finished: false,
        }
    }

    /// Override the functional time budget
    pub fn with_time_budget(mut self, budget_secs: f64) -> Self {
        self.time_budget_secs = budget_secs;
        self
    }

    /// Clock used for the functional time budget
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Swap the buffer contract; the ledger starts over
    pub fn set_data(&mut self, data: SharedBuffers) {
        self.data = data;
        self.ledger.reset();
        self.pre_process_stamp = None;
        self.finished = false;
    }

    /// Current buffer contract
    pub fn data(&self) -> &SharedBuffers {
        &self.data
    }

    /// Run `f` with the contract locked
    pub fn with_data<R>(&self, f: impl FnOnce(&BufferContract) -> R) -> R {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// The wrapped task
    pub fn task(&self) -> &T {
        &self.task
    }

    /// The wrapped task, mutable
    pub fn task_mut(&mut self) -> &mut T {
        &mut self.task
    }

    /// Execution ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Testing mode
    pub fn mode(&self) -> TestingMode {
        self.mode
    }

    /// Switch testing mode
    pub fn set_mode(&mut self, mode: TestingMode) {
        self.mode = mode;
    }

    /// Validate phase. `Ok(false)` closes the cycle: nothing downstream runs.
    pub fn validate(&mut self) -> Result<bool, TaskError> {
        self.ledger.record(Phase::Validate)?;
        let accepted = {
            let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            self.task.validate(&guard)
        };
        if !accepted {
            tracing::debug!(task = self.task.name(), "validation rejected the buffer contract");
            self.ledger.close_rejected();
        }
        Ok(accepted)
    }

    /// PreProcess phase
    pub fn pre_process(&mut self) -> Result<bool, TaskError> {
        self.ledger.record(Phase::PreProcess)?;
        if self.mode == TestingMode::Functional {
            self.pre_process_stamp = Some(self.clock.now_seconds());
        }
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.task.pre_process(&mut guard))
    }

    /// Run phase (may repeat)
    pub fn run(&mut self) -> Result<bool, TaskError> {
        self.ledger.record(Phase::Run)?;
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.task.run(&mut guard))
    }

    /// PostProcess phase; in functional mode also enforces the time budget
    pub fn post_process(&mut self) -> Result<bool, TaskError> {
        self.ledger.record(Phase::PostProcess)?;
        let ok = {
            let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            self.task.post_process(&mut guard)
        };

        if let (TestingMode::Functional, Some(start)) = (self.mode, self.pre_process_stamp.take()) {
            let elapsed_secs = self.clock.now_seconds() - start;
            if elapsed_secs >= self.time_budget_secs {
                return Err(TaskError::TimeBudgetExceeded {
                    elapsed_secs,
                    budget_secs: self.time_budget_secs,
                });
            }
            tracing::debug!(task = self.task.name(), elapsed_secs, "test time");
        }
        Ok(ok)
    }

    /// One full cycle. Stops at the first phase reporting failure and
    /// returns `Ok(false)`; the ledger stays well-formed either way.
    pub fn run_pipeline(&mut self) -> Result<bool, TaskError> {
        if !self.validate()? {
            return Ok(false);
        }
        if !self.pre_process()? {
            self.abandon_cycle();
            return Ok(false);
        }
        if !self.run()? {
            self.abandon_cycle();
            return Ok(false);
        }
        self.post_process()
    }

    pub(crate) fn abandon_cycle(&mut self) {
        self.ledger.close_rejected();
        self.pre_process_stamp = None;
    }

    /// Tear down explicitly, returning any protocol violation instead of
    /// panicking in `Drop`.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        self.finished = true;
        self.ledger.check_complete()
    }

    /// Like [`finish`](Self::finish) but keeps the runner around.
    pub fn check_complete(&mut self) -> Result<(), ProtocolError> {
        self.finished = true;
        self.ledger.check_complete()
    }
}

impl<T: Task> Drop for TaskRunner<T> {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        if let Err(violation) = self.ledger.check_complete() {
            panic!("{violation} (task {})", self.task.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferContract;
    use crate::measure::ManualClock;

    #[derive(Clone, Default)]
    struct SumTask {
        values: Vec<i64>,
        sum: i64,
    }

    impl Task for SumTask {
        fn validate(&mut self, data: &BufferContract) -> bool {
            data.output_counts() == [1]
        }

        fn pre_process(&mut self, data: &mut BufferContract) -> bool {
            match data.input::<i64>(0) {
                Ok(values) => {
                    self.values = values.to_vec();
                    true
                }
                Err(_) => false,
            }
        }

        fn run(&mut self, _data: &mut BufferContract) -> bool {
            self.sum = self.values.iter().sum();
            true
        }

        fn post_process(&mut self, data: &mut BufferContract) -> bool {
            match data.output_mut::<i64>(0) {
                Ok(out) => {
                    out[0] = self.sum;
                    true
                }
                Err(_) => false,
            }
        }
    }

    fn runner() -> TaskRunner<SumTask> {
        let data = BufferContract::new()
            .with_input(&[1i64, 2, 3])
            .with_output::<i64>(1)
            .into_shared();
        TaskRunner::new(SumTask::default(), data)
    }

    #[test]
    fn test_full_cycle_sums_into_output() {
        let mut runner = runner();
        assert!(runner.validate().unwrap());
        assert!(runner.pre_process().unwrap());
        assert!(runner.run().unwrap());
        assert!(runner.post_process().unwrap());

        runner.with_data(|data| assert_eq!(data.output::<i64>(0).unwrap(), &[6]));
        assert_eq!(runner.ledger().completed_cycles(), 1);
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_repeated_run_is_allowed() {
        let mut runner = runner();
        runner.validate().unwrap();
        runner.pre_process().unwrap();
        for _ in 0..5 {
            runner.run().unwrap();
        }
        runner.post_process().unwrap();
        assert_eq!(runner.ledger().run_calls(), 5);
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_skipping_run_is_reported_eagerly() {
        let mut runner = runner();
        runner.validate().unwrap();
        runner.pre_process().unwrap();
        let err = runner.post_process().unwrap_err();
        assert_eq!(
            err,
            TaskError::Protocol(ProtocolError {
                expected: Phase::Run,
                actual: Some(Phase::PostProcess),
                position: 2,
            })
        );
        // Teardown reports the same divergence
        assert_eq!(runner.check_complete().unwrap_err().position, 2);
    }

    #[test]
    fn test_pre_process_twice_is_an_error() {
        let mut runner = runner();
        runner.validate().unwrap();
        runner.pre_process().unwrap();
        let err = runner.pre_process().unwrap_err();
        assert!(matches!(
            err,
            TaskError::Protocol(ProtocolError {
                expected: Phase::Run,
                actual: Some(Phase::PreProcess),
                ..
            })
        ));
        let _ = runner.check_complete();
    }

    #[test]
    fn test_validate_twice_is_an_error() {
        let mut runner = runner();
        runner.validate().unwrap();
        assert!(runner.validate().is_err());
        let _ = runner.check_complete();
    }

    #[test]
    fn test_rejected_validation_closes_cycle() {
        let data = BufferContract::new()
            .with_input(&[1i64])
            .with_output::<i64>(2)
            .into_shared();
        let mut runner = TaskRunner::new(SumTask::default(), data);
        assert!(!runner.validate().unwrap());
        assert!(runner.pre_process().is_err());
        assert_eq!(runner.ledger().rejected_cycles(), 1);
        // The eager order error stays recorded for teardown
        assert!(runner.check_complete().is_err());
    }

    #[test]
    fn test_rejected_validation_alone_is_complete() {
        let data = BufferContract::new().into_shared();
        let mut runner = TaskRunner::new(SumTask::default(), data);
        assert!(!runner.validate().unwrap());
        assert!(runner.check_complete().is_ok());
    }

    #[test]
    fn test_untouched_runner_is_incomplete() {
        let mut runner = runner();
        let err = runner.check_complete().unwrap_err();
        assert_eq!(err.expected, Phase::Validate);
        assert_eq!(err.actual, None);
        assert_eq!(err.position, 0);
    }

    #[test]
    fn test_drop_with_incomplete_ledger_panics() {
        let result = std::panic::catch_unwind(|| {
            let mut runner = runner();
            runner.validate().unwrap();
        });
        let payload = result.unwrap_err();
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("ORDER OF FUNCTIONS IS NOT RIGHT"));
        assert!(message.contains("expected PreProcess"));
    }

    #[test]
    fn test_set_data_resets_ledger() {
        let mut runner = runner();
        runner.validate().unwrap();
        let fresh = BufferContract::new()
            .with_input(&[10i64, 20])
            .with_output::<i64>(1)
            .into_shared();
        runner.set_data(fresh);
        assert_eq!(runner.ledger().position(), 0);
        assert!(runner.run_pipeline().unwrap());
        runner.with_data(|data| assert_eq!(data.output::<i64>(0).unwrap(), &[30]));
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_functional_time_budget() {
        let clock = ManualClock::new();
        let mut runner = runner()
            .with_time_budget(1.0)
            .with_clock(Arc::new(clock.clone()));
        runner.validate().unwrap();
        runner.pre_process().unwrap();
        clock.advance(2.0);
        runner.run().unwrap();
        let err = runner.post_process().unwrap_err();
        assert!(matches!(err, TaskError::TimeBudgetExceeded { .. }));
        // The phase itself was recorded; the cycle is complete
        assert!(runner.check_complete().is_ok());
    }

    #[test]
    fn test_perf_mode_skips_time_budget() {
        let clock = ManualClock::new();
        let mut runner = runner()
            .with_time_budget(1.0)
            .with_clock(Arc::new(clock.clone()));
        runner.set_mode(TestingMode::Perf);
        runner.validate().unwrap();
        runner.pre_process().unwrap();
        clock.advance(5.0);
        runner.run().unwrap();
        assert!(runner.post_process().unwrap());
        assert!(runner.finish().is_ok());
    }

    #[test]
    fn test_second_cycle_after_post_process() {
        let mut runner = runner();
        assert!(runner.run_pipeline().unwrap());
        assert!(runner.run_pipeline().unwrap());
        assert_eq!(runner.ledger().completed_cycles(), 2);
        assert!(runner.finish().is_ok());
    }
}
