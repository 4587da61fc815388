#![warn(missing_docs)]
//! # taskbench
//!
//! Harness for benchmarking interchangeable implementations (sequential,
//! threaded, task-based, message-passing) of the same problem:
//! - **Lifecycle checking**: `TaskRunner` enforces
//!   `Validate -> PreProcess -> Run+ -> PostProcess` and reports the first
//!   out-of-order call with its position
//! - **Perf measurement**: whole-pipeline or run-only timing against an
//!   injectable clock, with a session-wide time budget
//! - **Multi-process sessions**: rank processes wired through a launcher,
//!   a leak check for unread messages after every test and failure output
//!   attributed to the rank that produced it
//!
//! ## Quick Start
//!
//! ```ignore
//! use taskbench::prelude::*;
//!
//! #[task_test(suite = "sum")]
//! fn sequential(ctx: &mut TestContext) {
//!     let data = BufferContract::new().with_input(&[1i32, 2, 3]).with_output::<i32>(1);
//!     let mut runner = ctx.runner(SumSeq::default(), data);
//!     ctx.expect_ok(runner.run_pipeline(), "pipeline");
//!     let total = runner.with_data(|d| d.output::<i32>(0).map(|o| o[0]));
//!     ctx.expect(total == Ok(6), "sum of [1, 2, 3]");
//!     ctx.expect_ok(runner.finish().map(|_| true), "ledger");
//! }
//!
//! fn main() {
//!     taskbench::run();
//! }
//! ```
//!
//! ## Perf Tests
//!
//! ```ignore
//! #[task_test(suite = "sum", kind = "perf")]
//! fn sequential_pipeline(ctx: &mut TestContext) {
//!     let mut runner = ctx.runner(SumSeq::default(), big_input());
//!     let result = Perf::measure_pipeline(&mut runner, &ctx.perf_attr(DEFAULT_ITERATIONS));
//!     ...
//!     ctx.print_statistic(&result);
//! }
//! ```

// Re-export core types
pub use taskbench_core::{
    Backend, BarrierClock, BufferContract, BufferError, Clock, CommControl, CommError,
    Communicator, CommunicatorExt, DEFAULT_ITERATIONS, DEFAULT_PERF_TIME_BUDGET_SECS,
    DEFAULT_TASK_TIME_BUDGET_SECS, EXIT_MESSAGE_LEAK, EXIT_PERF_BUDGET, EXIT_RUNTIME_FAILURE,
    EXIT_SUCCESS, EXIT_TESTS_FAILED, FatalCondition, HarnessSettings, Ledger, ManualClock,
    MonotonicClock, PartKind, Perf, PerfAttr, PerfError, PerfMode, PerfResult, Phase,
    ProtocolError, RawBuffer, SessionControl, SharedBuffers, SharedClock, Side, SoloComm,
    Statistic, Stopwatch, Task, TaskError, TaskRunner, TestContext, TestDef, TestIdentity,
    TestKind, TestPartResult, TestingMode, UnwindControl, comm,
};

// Re-export the registration macro
pub use taskbench_macros::task_test;

// Re-export session and reporting
pub use taskbench_cli::{Output, TestListener, TestSession, build_plan};
pub use taskbench_report::{SessionReport, SessionSummary, TestReport, TestStatus};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Backend, BufferContract, Communicator, CommunicatorExt, DEFAULT_ITERATIONS, Perf,
        PerfAttr, PerfResult, Task, TaskRunner, TestContext, task_test,
    };
}

/// Run the taskbench CLI harness and exit with its code.
///
/// Call this from the test binary's `main()`:
/// ```ignore
/// fn main() {
///     taskbench::run();
/// }
/// ```
pub use taskbench_cli::run;

/// Run the CLI with explicit arguments and return the exit code
pub use taskbench_cli::init;
