#![warn(missing_docs)]
//! taskbench Core - Task Lifecycle Runtime
//!
//! This crate provides the pieces every backend implementation shares:
//! - `BufferContract` raw input/output buffers with element counts
//! - `Task` and the protocol-checking `TaskRunner`
//! - `Perf` pipeline and run-only timing against a pluggable `Clock`
//! - `Communicator` implementations for single-process, threaded and
//!   launcher-driven multi-process sessions
//! - `TestDef` registration and the per-test `TestContext`

mod buffer;
pub mod comm;
mod context;
mod measure;
mod perf;
mod task;

pub use buffer::{BufferContract, BufferError, RawBuffer, SharedBuffers, Side};
pub use comm::{BarrierClock, CommError, Communicator, CommunicatorExt, ProbeStatus, RankContext, SoloComm};
pub use context::{
    CommControl, EXIT_MESSAGE_LEAK, EXIT_PERF_BUDGET, EXIT_RUNTIME_FAILURE, EXIT_SUCCESS,
    EXIT_TESTS_FAILED, FatalCondition, HarnessSettings, PartKind, SessionControl, TestContext,
    TestDef, TestIdentity, TestKind, TestPartResult, UnwindControl,
};
pub use measure::{Clock, ManualClock, MonotonicClock, SharedClock, Stopwatch};
pub use perf::{
    DEFAULT_ITERATIONS, DEFAULT_PERF_TIME_BUDGET_SECS, Perf, PerfAttr, PerfError, PerfMode,
    PerfResult, Statistic,
};
pub use task::{
    Backend, DEFAULT_TASK_TIME_BUDGET_SECS, Ledger, Phase, ProtocolError, Task, TaskError,
    TaskRunner, TestingMode,
};

// Collect all registered tests
inventory::collect!(TestDef);

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || for _ in inventory::iter::<TestDef> {};
