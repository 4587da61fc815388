//! Test Registry and Per-Test Context
//!
//! Tests are registered at link time as [`TestDef`]s and executed with a
//! [`TestContext`] that carries the session settings, the communicator and
//! the [`SessionControl`] deciding what a fatal condition does.

use crate::buffer::BufferContract;
use crate::comm::{BarrierClock, Communicator};
use crate::perf::{DEFAULT_PERF_TIME_BUDGET_SECS, PerfAttr, PerfResult, Statistic};
use crate::task::{DEFAULT_TASK_TIME_BUDGET_SECS, Task, TaskRunner};
use std::fmt;
use std::io::Write;
use std::panic::Location;
use std::str::FromStr;
use std::sync::Arc;

/// Every test passed
pub const EXIT_SUCCESS: i32 = 0;
/// At least one test failed
pub const EXIT_TESTS_FAILED: i32 = 1;
/// A perf measurement reached its time budget
pub const EXIT_PERF_BUDGET: i32 = 12;
/// A rank had unread messages after a test
pub const EXIT_MESSAGE_LEAK: i32 = 13;
/// The distributed runtime failed to start or shut down
pub const EXIT_RUNTIME_FAILURE: i32 = 14;

/// Kind of registered test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Correctness test
    Functional,
    /// Performance measurement
    Perf,
}

impl TestKind {
    /// Short label used by `--kind`
    pub fn label(self) -> &'static str {
        match self {
            TestKind::Functional => "func",
            TestKind::Perf => "perf",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "func" | "functional" => Ok(TestKind::Functional),
            "perf" | "performance" => Ok(TestKind::Perf),
            other => Err(format!("unknown test kind '{other}' (expected func or perf)")),
        }
    }
}

/// Test definition registered via `#[task_test]`
#[derive(Debug, Clone)]
pub struct TestDef {
    /// Suite (defaults to the defining module path)
    pub suite: &'static str,
    /// Test name within the suite
    pub name: &'static str,
    /// Functional or perf
    pub kind: TestKind,
    /// The test body
    pub runner_fn: fn(&mut TestContext),
    /// Source file path
    pub file: &'static str,
    /// Source line number
    pub line: u32,
    /// Module path
    pub module_path: &'static str,
}

impl TestDef {
    /// `suite.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.suite, self.name)
    }

    /// Owned identity of this test
    pub fn identity(&self) -> TestIdentity {
        TestIdentity {
            suite: self.suite.to_string(),
            name: self.name.to_string(),
            kind: self.kind,
        }
    }
}

/// Identity of the test currently executing
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TestIdentity {
    /// Suite name
    pub suite: String,
    /// Test name
    pub name: String,
    /// Kind
    pub kind: TestKind,
}

impl TestIdentity {
    /// `suite.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.suite, self.name)
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.suite, self.name)
    }
}

/// Resolved session settings every test can see
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HarnessSettings {
    /// Worker threads for thread and task backends
    pub num_threads: usize,
    /// Rank processes in the session
    pub num_processes: u32,
    /// Functional PreProcess..PostProcess ceiling, seconds
    pub task_time_budget_secs: f64,
    /// Perf measurement ceiling, seconds
    pub perf_time_budget_secs: f64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            num_threads: 1,
            num_processes: 1,
            task_time_budget_secs: DEFAULT_TASK_TIME_BUDGET_SECS,
            perf_time_budget_secs: DEFAULT_PERF_TIME_BUDGET_SECS,
        }
    }
}

/// A condition that ends the whole session, not just the current test
#[derive(Debug, Clone, PartialEq)]
pub enum FatalCondition {
    /// A perf measurement reached the budget
    PerfBudgetExceeded {
        /// Test that measured it
        test: String,
        /// The offending statistic
        statistic: Statistic,
    },
    /// Unread inbound message after a test
    MessageLeak {
        /// Test that just finished
        test: String,
        /// Rank holding the message
        rank: u32,
        /// Sender of the message
        source: u32,
        /// Tag of the message
        tag: i32,
    },
    /// A non-driver rank failed a test; the world stops so no rank waits
    /// on it forever
    RankFailure {
        /// Test that failed
        test: String,
        /// Rank it failed on
        rank: u32,
    },
    /// Distributed runtime failure
    Runtime {
        /// What failed
        detail: String,
    },
}

impl FatalCondition {
    /// Process exit code for this condition
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalCondition::PerfBudgetExceeded { .. } => EXIT_PERF_BUDGET,
            FatalCondition::MessageLeak { .. } => EXIT_MESSAGE_LEAK,
            FatalCondition::RankFailure { .. } => EXIT_TESTS_FAILED,
            FatalCondition::Runtime { .. } => EXIT_RUNTIME_FAILURE,
        }
    }
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCondition::PerfBudgetExceeded { test, statistic } => {
                write!(f, "[  FAILED  ] {test}: {}", statistic.budget_message())
            }
            FatalCondition::MessageLeak {
                test,
                rank,
                source,
                tag,
            } => write!(
                f,
                "[  PROCESS {rank}  ] [  FAILED  ] {test}: unread message from process {source} with tag {tag}"
            ),
            FatalCondition::RankFailure { test, rank } => {
                write!(f, "[  PROCESS {rank}  ] [  FAILED  ] {test}: aborting all processes")
            }
            FatalCondition::Runtime { detail } => {
                write!(f, "[  FAILED  ] distributed runtime: {detail}")
            }
        }
    }
}

/// Decides how a [`FatalCondition`] ends the session
pub trait SessionControl: Send + Sync {
    /// Never returns
    fn terminate(&self, condition: &FatalCondition) -> !;
}

/// Production control: diagnostic on stderr, then abort every rank
pub struct CommControl {
    comm: Arc<dyn Communicator>,
}

impl CommControl {
    /// Control that aborts through `comm`
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }
}

impl SessionControl for CommControl {
    fn terminate(&self, condition: &FatalCondition) -> ! {
        eprintln!("{condition}");
        self.comm.abort(condition.exit_code(), &condition.to_string())
    }
}

/// Control for in-process tests: unwinds with the condition as the panic
/// payload so the caller can `downcast_ref::<FatalCondition>()` it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindControl;

impl SessionControl for UnwindControl {
    fn terminate(&self, condition: &FatalCondition) -> ! {
        std::panic::panic_any(condition.clone())
    }
}

/// Outcome class of one assertion or event inside a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    /// Passing check
    Success,
    /// Failed check, the test continues
    NonFatalFailure,
    /// Failure that ended the test (panic)
    FatalFailure,
    /// Test skipped itself
    Skip,
}

/// One assertion or event recorded during a test
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestPartResult {
    /// Outcome class
    pub kind: PartKind,
    /// Human-readable message
    pub message: String,
    /// `file:line` of the check, when known
    pub location: Option<String>,
}

impl TestPartResult {
    /// Part with no location
    pub fn new(kind: PartKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    fn at(kind: PartKind, message: impl Into<String>, location: &Location<'_>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: Some(format!("{}:{}", location.file(), location.line())),
        }
    }

    /// Whether this part fails the test
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, PartKind::NonFatalFailure | PartKind::FatalFailure)
    }
}

/// Everything a test body needs: identity, settings, the communicator and
/// a place to record checks and statistics.
pub struct TestContext {
    identity: TestIdentity,
    settings: HarnessSettings,
    comm: Arc<dyn Communicator>,
    control: Arc<dyn SessionControl>,
    out: Box<dyn Write + Send>,
    parts: Vec<TestPartResult>,
    statistics: Vec<Statistic>,
}

impl TestContext {
    /// Context for one test execution
    pub fn new(
        identity: TestIdentity,
        settings: HarnessSettings,
        comm: Arc<dyn Communicator>,
        control: Arc<dyn SessionControl>,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            identity,
            settings,
            comm,
            control,
            out,
            parts: Vec::new(),
            statistics: Vec::new(),
        }
    }

    /// Identity of the running test
    pub fn identity(&self) -> &TestIdentity {
        &self.identity
    }

    /// Session settings
    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// This rank's communicator
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// This process's rank
    pub fn rank(&self) -> u32 {
        self.comm.rank()
    }

    /// Whether this rank owns user-visible output
    pub fn is_driver(&self) -> bool {
        self.comm.is_driver()
    }

    /// Runner over `data`, with the session's functional time budget
    pub fn runner<T: Task>(&self, task: T, data: BufferContract) -> TaskRunner<T> {
        TaskRunner::new(task, data.into_shared())
            .with_time_budget(self.settings.task_time_budget_secs)
    }

    /// Perf attributes; multi-rank sessions get a barrier-synchronized clock
    pub fn perf_attr(&self, iterations: u64) -> PerfAttr {
        let attr = PerfAttr::new(iterations);
        if self.comm.world_size() > 1 {
            attr.with_clock(Arc::new(BarrierClock::new(Arc::clone(&self.comm))))
        } else {
            attr
        }
    }

    /// Emit the statistic line for `result` (driver only).
    ///
    /// Reaching the perf budget is fatal: the line is printed with
    /// `-1.0000000000` and the session is terminated.
    pub fn print_statistic(&mut self, result: &PerfResult) -> Statistic {
        let test_id = self.identity.full_name();
        let statistic = Statistic::new(&test_id, result, self.settings.perf_time_budget_secs);

        if self.comm.is_driver() {
            if let Err(e) = writeln!(self.out, "{statistic}").and_then(|_| self.out.flush()) {
                tracing::warn!("failed to write statistic: {e}");
            }
        }
        self.statistics.push(statistic.clone());

        if !statistic.within_budget() {
            self.control.terminate(&FatalCondition::PerfBudgetExceeded {
                test: test_id,
                statistic,
            });
        }
        statistic
    }

    /// Record a non-fatal failure when `condition` is false
    #[track_caller]
    pub fn expect(&mut self, condition: bool, message: impl Into<String>) -> bool {
        let location = Location::caller();
        let kind = if condition {
            PartKind::Success
        } else {
            PartKind::NonFatalFailure
        };
        self.parts.push(TestPartResult::at(kind, message, location));
        condition
    }

    /// Record a non-fatal failure unless `result` is `Ok(true)`
    #[track_caller]
    pub fn expect_ok<E: fmt::Display>(&mut self, result: Result<bool, E>, what: &str) -> bool {
        let location = Location::caller();
        let part = match result {
            Ok(true) => TestPartResult::at(PartKind::Success, what, location),
            Ok(false) => TestPartResult::at(
                PartKind::NonFatalFailure,
                format!("{what} reported failure"),
                location,
            ),
            Err(e) => TestPartResult::at(PartKind::NonFatalFailure, format!("{what}: {e}"), location),
        };
        let ok = !part.is_failure();
        self.parts.push(part);
        ok
    }

    /// Record an unconditional non-fatal failure
    #[track_caller]
    pub fn fail(&mut self, message: impl Into<String>) {
        let location = Location::caller();
        self.parts
            .push(TestPartResult::at(PartKind::NonFatalFailure, message, location));
    }

    /// Mark the test as skipped
    #[track_caller]
    pub fn skip(&mut self, reason: impl Into<String>) {
        let location = Location::caller();
        self.parts.push(TestPartResult::at(PartKind::Skip, reason, location));
    }

    /// Record a part produced outside the test body (e.g. a caught panic)
    pub fn record(&mut self, part: TestPartResult) {
        self.parts.push(part);
    }

    /// Recorded parts so far
    pub fn parts(&self) -> &[TestPartResult] {
        &self.parts
    }

    /// Statistics printed so far
    pub fn statistics(&self) -> &[Statistic] {
        &self.statistics
    }

    /// Whether no failure has been recorded
    pub fn passed(&self) -> bool {
        !self.parts.iter().any(TestPartResult::is_failure)
    }

    /// Whether the test skipped itself without failing
    pub fn skipped(&self) -> bool {
        self.passed() && self.parts.iter().any(|p| p.kind == PartKind::Skip)
    }

    /// Consume into recorded parts and statistics
    pub fn into_outcome(self) -> (Vec<TestPartResult>, Vec<Statistic>) {
        (self.parts, self.statistics)
    }
}
