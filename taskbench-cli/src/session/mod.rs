//! Test Session
//!
//! Runs an ordered list of registered tests against one communicator.
//! Every test body executes under `catch_unwind`: a panic becomes a fatal
//! failure part of that test, while a [`FatalCondition`] payload (perf
//! budget, leak) is handed back to the session control and ends the run.
//!
//! ```text
//! TestDef ──▶ TestContext ──▶ body (caught) ──▶ parts ──▶ listeners
//!                                                          │
//!                          ResultPrinter / RankFailurePrinter, LeakDetector
//! ```

mod listeners;
mod output;

pub use listeners::{LeakDetector, RankFailurePrinter, ResultPrinter, TestListener};
pub use output::Output;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Instant;
use taskbench_core::comm::AbortRecord;
use taskbench_core::{
    Communicator, EXIT_SUCCESS, EXIT_TESTS_FAILED, FatalCondition, HarnessSettings, PartKind,
    SessionControl, TestContext, TestDef, TestPartResult,
};
use taskbench_report::{SessionSummary, TestReport};

/// One rank's pass over the plan
pub struct TestSession {
    comm: Arc<dyn Communicator>,
    control: Arc<dyn SessionControl>,
    settings: HarnessSettings,
    out: Output,
    listeners: Vec<Box<dyn TestListener>>,
    reports: Vec<TestReport>,
}

impl TestSession {
    /// Session with no listeners installed
    pub fn new(
        comm: Arc<dyn Communicator>,
        control: Arc<dyn SessionControl>,
        settings: HarnessSettings,
        out: Output,
    ) -> Self {
        Self {
            comm,
            control,
            settings,
            out,
            listeners: Vec::new(),
            reports: Vec::new(),
        }
    }

    /// Install the printer for this rank followed by the leak detector.
    ///
    /// Non-driver ranks only report failures unless `print_workers` is set,
    /// and abort the world on their first failed test either way.
    pub fn with_standard_listeners(mut self, print_workers: bool) -> Self {
        if self.comm.is_driver() {
            self.add_listener(ResultPrinter::new(self.out.clone()));
        } else {
            let printer = RankFailurePrinter::new(
                self.comm.rank(),
                self.out.clone(),
                Arc::clone(&self.control),
            );
            self.add_listener(printer.show_all(print_workers));
        }
        self.add_listener(LeakDetector::new(
            Arc::clone(&self.comm),
            Arc::clone(&self.control),
        ));
        self
    }

    /// Append a listener; listeners are notified in insertion order
    pub fn add_listener(&mut self, listener: impl TestListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Run `tests` in order and return the summary
    pub fn run(&mut self, tests: &[&TestDef]) -> SessionSummary {
        let start = Instant::now();
        let mut suites: Vec<_> = tests.iter().map(|t| t.suite).collect();
        suites.sort_unstable();
        suites.dedup();

        for listener in &mut self.listeners {
            listener.on_session_start(tests.len(), suites.len());
        }

        for def in tests {
            let report = self.run_one(def);
            self.reports.push(report);
        }

        let summary = SessionSummary::from_tests(&self.reports, start.elapsed());
        for listener in &mut self.listeners {
            listener.on_session_end(&summary);
        }
        summary
    }

    fn run_one(&mut self, def: &TestDef) -> TestReport {
        let identity = def.identity();
        tracing::debug!(test = %identity, rank = self.comm.rank(), "starting test");
        for listener in &mut self.listeners {
            listener.on_test_start(&identity);
        }

        let mut ctx = TestContext::new(
            identity.clone(),
            self.settings.clone(),
            Arc::clone(&self.comm),
            Arc::clone(&self.control),
            Box::new(self.out.clone()),
        );
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (def.runner_fn)(&mut ctx)));
        let duration = start.elapsed();

        if let Err(payload) = result {
            self.handle_panic(payload, def, &mut ctx);
        }

        let (parts, statistics) = ctx.into_outcome();
        for part in &parts {
            for listener in &mut self.listeners {
                listener.on_test_part_result(&identity, part);
            }
        }

        let report = TestReport::new(identity, self.comm.rank(), duration, parts, statistics);
        for listener in &mut self.listeners {
            listener.on_test_end(&report);
        }
        report
    }

    fn handle_panic(&self, payload: Box<dyn Any + Send>, def: &TestDef, ctx: &mut TestContext) {
        if let Some(condition) = payload.downcast_ref::<FatalCondition>() {
            self.control.terminate(condition);
        }
        if payload.is::<AbortRecord>() {
            resume_unwind(payload);
        }

        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        tracing::debug!(test = %def.full_name(), "test panicked: {message}");
        ctx.record(TestPartResult {
            kind: PartKind::FatalFailure,
            message: format!("test panicked: {message}"),
            location: Some(format!("{}:{}", def.file, def.line)),
        });
    }

    /// Reports of every test run so far
    pub fn reports(&self) -> &[TestReport] {
        &self.reports
    }

    /// Consume into the collected reports
    pub fn into_reports(self) -> Vec<TestReport> {
        self.reports
    }
}

/// Exit code for a finished session
pub fn exit_code(summary: &SessionSummary) -> i32 {
    if summary.has_failures() {
        EXIT_TESTS_FAILED
    } else {
        EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskbench_core::comm::LocalWorld;
    use taskbench_core::{
        CommControl, EXIT_MESSAGE_LEAK, EXIT_PERF_BUDGET, PerfMode, PerfResult, SoloComm, TestKind,
        UnwindControl,
    };

    fn def(name: &'static str, kind: TestKind, runner_fn: fn(&mut TestContext)) -> TestDef {
        TestDef {
            suite: "session",
            name,
            kind,
            runner_fn,
            file: "session.rs",
            line: 1,
            module_path: module_path!(),
        }
    }

    fn solo_session(settings: HarnessSettings) -> (TestSession, Output) {
        let out = Output::buffer();
        let session = TestSession::new(
            Arc::new(SoloComm::new()),
            Arc::new(UnwindControl),
            settings,
            out.clone(),
        )
        .with_standard_listeners(false);
        (session, out)
    }

    #[test]
    fn test_pass_fail_skip_and_panic() {
        let tests = [
            def("passes", TestKind::Functional, |ctx| {
                ctx.expect(1 + 2 + 3 == 6, "sum");
            }),
            def("fails", TestKind::Functional, |ctx| {
                ctx.expect(false, "expected 6");
            }),
            def("skips", TestKind::Functional, |ctx| ctx.skip("needs 4 processes")),
            def("panics", TestKind::Functional, |_| panic!("boom")),
        ];
        let plan: Vec<_> = tests.iter().collect();
        let (mut session, out) = solo_session(HarnessSettings::default());

        let summary = session.run(&plan);
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed_tests, vec!["session.fails", "session.panics"]);
        assert_eq!(exit_code(&summary), EXIT_TESTS_FAILED);

        let panicked = &session.reports()[3];
        assert_eq!(panicked.parts[0].kind, PartKind::FatalFailure);
        assert_eq!(panicked.parts[0].message, "test panicked: boom");

        let text = out.captured();
        assert!(text.contains("[       OK ] session.passes"));
        assert!(text.contains("[  SKIPPED ] session.skips"));
        assert!(text.contains("session.rs:1: Failure\ntest panicked: boom"));
    }

    #[test]
    fn test_all_passing_exit_code() {
        let tests = [def("ok", TestKind::Functional, |_| {})];
        let plan: Vec<_> = tests.iter().collect();
        let (mut session, _) = solo_session(HarnessSettings::default());
        assert_eq!(exit_code(&session.run(&plan)), EXIT_SUCCESS);
    }

    #[test]
    fn test_perf_budget_is_fatal() {
        let tests = [def("slow", TestKind::Perf, |ctx| {
            ctx.print_statistic(&PerfResult {
                elapsed_seconds: 2.0,
                mode: PerfMode::Pipeline,
                iterations: 5,
            });
            ctx.fail("unreachable");
        })];
        let plan: Vec<_> = tests.iter().collect();
        let settings = HarnessSettings {
            perf_time_budget_secs: 1.0,
            ..Default::default()
        };
        let (mut session, out) = solo_session(settings);

        let payload = catch_unwind(AssertUnwindSafe(|| session.run(&plan))).unwrap_err();
        let condition = payload.downcast_ref::<FatalCondition>().unwrap();
        assert_eq!(condition.exit_code(), EXIT_PERF_BUDGET);
        assert!(out.captured().contains("session.slow:pipeline:-1.0000000000"));
    }

    #[test]
    fn test_leak_aborts_world() {
        let tests = [def("leaky", TestKind::Functional, |ctx| {
            if ctx.rank() == 0 {
                ctx.comm().send(1, 5, &[0u8; 4]).unwrap();
            }
        })];
        let plan: Vec<&TestDef> = tests.iter().collect();

        let outcome = LocalWorld::run(2, |comm| {
            let control = Arc::new(CommControl::new(Arc::clone(&comm)));
            let mut session =
                TestSession::new(comm, control, HarnessSettings::default(), Output::buffer())
                    .with_standard_listeners(false);
            session.run(&plan)
        });

        let abort = outcome.abort.unwrap();
        assert_eq!(abort.code, EXIT_MESSAGE_LEAK);
        assert_eq!(abort.origin, 1);
        assert!(abort.reason.contains("unread message from process 0 with tag 5"));
    }

    fn world_outputs(size: usize) -> Vec<Output> {
        (0..size).map(|_| Output::buffer()).collect()
    }

    #[test]
    fn test_failure_attributed_to_rank() {
        let tests = [def("rank_one_fails", TestKind::Functional, |ctx| {
            let rank = ctx.rank();
            ctx.expect(rank != 1, "rank 1 disagrees");
        })];
        let plan: Vec<&TestDef> = tests.iter().collect();
        let outs = world_outputs(2);

        let outcome = LocalWorld::run(2, |comm| {
            let out = outs[comm.rank() as usize].clone();
            let control = Arc::new(CommControl::new(Arc::clone(&comm)));
            let mut session = TestSession::new(comm, control, HarnessSettings::default(), out)
                .with_standard_listeners(false);
            session.run(&plan)
        });

        let abort = outcome.abort.unwrap();
        assert_eq!(abort.code, EXIT_TESTS_FAILED);
        assert_eq!(abort.origin, 1);

        let driver_text = outs[0].captured();
        let worker_text = outs[1].captured();
        assert!(driver_text.contains("[       OK ] session.rank_one_fails"));
        assert!(worker_text.contains(" [  PROCESS 1  ] [  FAILED  ] session.rank_one_fails"));
        assert!(!worker_text.contains("[ RUN      ]"));
    }

    #[test]
    fn test_worker_failure_releases_blocked_driver() {
        let tests = [
            def("worker_dies_before_send", TestKind::Functional, |ctx| {
                if ctx.rank() == 1 {
                    panic!("worker failed before sending");
                }
                let got = ctx.comm().recv(Some(1), Some(3));
                ctx.expect(got.is_ok(), "payload from rank 1");
            }),
            def("never_reached", TestKind::Functional, |ctx| ctx.fail("ran after abort")),
        ];
        let plan: Vec<&TestDef> = tests.iter().collect();
        let outs = world_outputs(2);

        let outcome = LocalWorld::run(2, |comm| {
            let out = outs[comm.rank() as usize].clone();
            let control = Arc::new(CommControl::new(Arc::clone(&comm)));
            let mut session = TestSession::new(comm, control, HarnessSettings::default(), out)
                .with_standard_listeners(false);
            session.run(&plan)
        });

        let abort = outcome.abort.unwrap();
        assert_eq!(abort.code, EXIT_TESTS_FAILED);
        assert_eq!(abort.origin, 1);
        assert_eq!(
            abort.reason,
            "[  PROCESS 1  ] [  FAILED  ] session.worker_dies_before_send: aborting all processes"
        );
        assert!(outcome.results.iter().all(|r| r.is_err()));
        assert!(outs[1].captured().contains("test panicked: worker failed before sending"));
        assert!(!outs[0].captured().contains("never_reached"));
    }
}
