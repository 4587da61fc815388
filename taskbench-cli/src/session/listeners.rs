//! Session Listeners
//!
//! Hooks called by [`TestSession`](super::TestSession) around every test:
//! - `ResultPrinter`: gtest-style progress and summary
//! - `RankFailurePrinter`: failure-only printer for non-driver ranks
//! - `LeakDetector`: post-test probe for unread inbound messages

use super::output::Output;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use taskbench_core::{
    CommError, Communicator, FatalCondition, PartKind, SessionControl, TestIdentity,
    TestPartResult,
};
use taskbench_report::{SessionSummary, TestReport, TestStatus};

/// Observer of session events; every hook defaults to doing nothing
pub trait TestListener: Send {
    fn on_session_start(&mut self, _tests: usize, _suites: usize) {}
    fn on_test_start(&mut self, _test: &TestIdentity) {}
    fn on_test_part_result(&mut self, _test: &TestIdentity, _part: &TestPartResult) {}
    fn on_test_end(&mut self, _report: &TestReport) {}
    fn on_session_end(&mut self, _summary: &SessionSummary) {}
}

/// gtest-style terminal printer
pub struct ResultPrinter {
    out: Output,
}

impl ResultPrinter {
    pub fn new(out: Output) -> Self {
        Self { out }
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        if let Err(e) = self.out.write_fmt(args).and_then(|_| self.out.flush()) {
            tracing::warn!("failed to write session output: {e}");
        }
    }
}

impl TestListener for ResultPrinter {
    fn on_session_start(&mut self, tests: usize, suites: usize) {
        self.line(format_args!(
            "[==========] Running {tests} {} from {suites} test {}.\n",
            plural(tests, "test"),
            plural(suites, "suite"),
        ));
    }

    fn on_test_start(&mut self, test: &TestIdentity) {
        self.line(format_args!("[ RUN      ] {test}\n"));
    }

    fn on_test_part_result(&mut self, _test: &TestIdentity, part: &TestPartResult) {
        let label = match part.kind {
            PartKind::Success => return,
            PartKind::NonFatalFailure | PartKind::FatalFailure => "Failure",
            PartKind::Skip => "Skipped",
        };
        let location = part.location.as_deref().unwrap_or("unknown file");
        self.line(format_args!("{location}: {label}\n{}\n", part.message));
    }

    fn on_test_end(&mut self, report: &TestReport) {
        let tag = match report.status {
            TestStatus::Passed => "[       OK ]",
            TestStatus::Failed => "[  FAILED  ]",
            TestStatus::Skipped => "[  SKIPPED ]",
        };
        self.line(format_args!(
            "{tag} {} ({:.0} ms)\n",
            report.test, report.duration_ms
        ));
    }

    fn on_session_end(&mut self, summary: &SessionSummary) {
        self.line(format_args!(
            "[==========] {} {} ran. ({:.0} ms total)\n",
            summary.total_tests,
            plural(summary.total_tests, "test"),
            summary.total_duration_ms,
        ));
        self.line(format_args!(
            "[  PASSED  ] {} {}.\n",
            summary.passed,
            plural(summary.passed, "test")
        ));
        if summary.skipped > 0 {
            self.line(format_args!(
                "[  SKIPPED ] {} {}.\n",
                summary.skipped,
                plural(summary.skipped, "test")
            ));
        }
        if summary.failed > 0 {
            self.line(format_args!(
                "[  FAILED  ] {} {}, listed below:\n",
                summary.failed,
                plural(summary.failed, "test")
            ));
            for name in &summary.failed_tests {
                self.line(format_args!("[  FAILED  ] {name}\n"));
            }
        }
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

/// Printer for non-driver ranks: passing output is swallowed and every
/// failure line is prefixed with the rank.
///
/// A failed test stops the whole world through the session control, since
/// the driver or a peer may be blocked waiting on this rank.
pub struct RankFailurePrinter {
    rank: u32,
    out: Output,
    base: ResultPrinter,
    control: Arc<dyn SessionControl>,
    show_all: bool,
}

impl RankFailurePrinter {
    pub fn new(rank: u32, out: Output, control: Arc<dyn SessionControl>) -> Self {
        Self {
            rank,
            base: ResultPrinter::new(out.clone()),
            out,
            control,
            show_all: false,
        }
    }

    /// Also stream passing output unprefixed (`--print-workers`)
    pub fn show_all(mut self, show_all: bool) -> Self {
        self.show_all = show_all;
        self
    }

    fn prefix(&mut self) {
        if let Err(e) = write!(self.out, " [  PROCESS {}  ] ", self.rank) {
            tracing::warn!("failed to write session output: {e}");
        }
    }
}

impl TestListener for RankFailurePrinter {
    fn on_session_start(&mut self, tests: usize, suites: usize) {
        if self.show_all {
            self.base.on_session_start(tests, suites);
        }
    }

    fn on_test_start(&mut self, test: &TestIdentity) {
        if self.show_all {
            self.base.on_test_start(test);
        }
    }

    fn on_test_part_result(&mut self, test: &TestIdentity, part: &TestPartResult) {
        if !part.is_failure() {
            if self.show_all {
                self.base.on_test_part_result(test, part);
            }
            return;
        }
        self.prefix();
        self.base.on_test_part_result(test, part);
    }

    fn on_test_end(&mut self, report: &TestReport) {
        if !report.failed() {
            if self.show_all {
                self.base.on_test_end(report);
            }
            return;
        }
        self.prefix();
        self.base.on_test_end(report);
        self.control.terminate(&FatalCondition::RankFailure {
            test: report.test.full_name(),
            rank: self.rank,
        });
    }

    fn on_session_end(&mut self, summary: &SessionSummary) {
        if self.show_all {
            self.base.on_session_end(summary);
        }
    }
}

/// Ends the session when a rank still holds an unread message after a test
pub struct LeakDetector {
    comm: Arc<dyn Communicator>,
    control: Arc<dyn SessionControl>,
}

impl LeakDetector {
    pub fn new(comm: Arc<dyn Communicator>, control: Arc<dyn SessionControl>) -> Self {
        Self { comm, control }
    }

    fn sync(&self, test: &TestIdentity) {
        match self.comm.barrier() {
            Ok(()) => {}
            // Another rank already reported and aborted; leave with its code
            Err(CommError::Aborted { code }) => {
                tracing::debug!(test = %test, code, "world aborted during post-test barrier");
                self.comm.abort(code, &format!("world aborted with code {code}"))
            }
            Err(e) => self.control.terminate(&FatalCondition::Runtime {
                detail: format!("barrier after {test}: {e}"),
            }),
        }
    }
}

impl TestListener for LeakDetector {
    fn on_test_end(&mut self, report: &TestReport) {
        self.sync(&report.test);
        if let Some(probe) = self.comm.iprobe() {
            tracing::debug!(test = %report.test, source = probe.source, tag = probe.tag, "unread message");
            self.control.terminate(&FatalCondition::MessageLeak {
                test: report.test.full_name(),
                rank: self.comm.rank(),
                source: probe.source,
                tag: probe.tag,
            });
        }
        self.sync(&report.test);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::time::Duration;
    use taskbench_core::comm::{AbortRecord, LocalWorld};
    use taskbench_core::{SoloComm, TestKind, UnwindControl};

    fn identity() -> TestIdentity {
        TestIdentity {
            suite: "sum".to_string(),
            name: "mp".to_string(),
            kind: TestKind::Functional,
        }
    }

    fn report(parts: Vec<TestPartResult>) -> TestReport {
        TestReport::new(identity(), 0, Duration::from_millis(3), parts, vec![])
    }

    fn failure() -> TestPartResult {
        TestPartResult {
            kind: PartKind::NonFatalFailure,
            message: "expected 6, got 5".to_string(),
            location: Some("tests/sum.rs:12".to_string()),
        }
    }

    #[test]
    fn test_result_printer_gtest_lines() {
        let out = Output::buffer();
        let mut printer = ResultPrinter::new(out.clone());
        printer.on_session_start(1, 1);
        printer.on_test_start(&identity());
        printer.on_test_part_result(&identity(), &failure());
        let rep = report(vec![failure()]);
        printer.on_test_end(&rep);
        printer.on_session_end(&SessionSummary::from_tests(&[rep], Duration::ZERO));

        let text = out.captured();
        assert!(text.contains("[==========] Running 1 test from 1 test suite."));
        assert!(text.contains("[ RUN      ] sum.mp\n"));
        assert!(text.contains("tests/sum.rs:12: Failure\nexpected 6, got 5\n"));
        assert!(text.contains("[  FAILED  ] sum.mp (3 ms)"));
        assert!(text.contains("[  FAILED  ] 1 test, listed below:\n[  FAILED  ] sum.mp\n"));
    }

    #[test]
    fn test_rank_printer_swallows_passes() {
        let out = Output::buffer();
        let mut printer = RankFailurePrinter::new(2, out.clone(), Arc::new(UnwindControl));
        printer.on_session_start(1, 1);
        printer.on_test_start(&identity());
        printer.on_test_part_result(&identity(), &TestPartResult::new(PartKind::Success, "ok"));
        printer.on_test_part_result(&identity(), &TestPartResult::new(PartKind::Skip, "later"));
        printer.on_test_end(&report(vec![]));
        assert_eq!(out.captured(), "");
    }

    #[test]
    fn test_rank_printer_show_all_streams_passes() {
        let out = Output::buffer();
        let mut printer =
            RankFailurePrinter::new(2, out.clone(), Arc::new(UnwindControl)).show_all(true);
        printer.on_test_start(&identity());
        printer.on_test_end(&report(vec![]));

        let text = out.captured();
        assert!(text.contains("[ RUN      ] sum.mp\n"));
        assert!(text.contains("[       OK ] sum.mp (3 ms)"));
        assert!(!text.contains("PROCESS"));
    }

    #[test]
    fn test_rank_printer_prefixes_failures_and_stops_world() {
        let out = Output::buffer();
        let mut printer = RankFailurePrinter::new(2, out.clone(), Arc::new(UnwindControl));
        printer.on_test_part_result(&identity(), &failure());
        let payload = catch_unwind(AssertUnwindSafe(|| {
            printer.on_test_end(&report(vec![failure()]))
        }))
        .unwrap_err();

        let text = out.captured();
        assert!(text.starts_with(" [  PROCESS 2  ] tests/sum.rs:12: Failure\n"));
        assert!(text.contains(" [  PROCESS 2  ] [  FAILED  ] sum.mp (3 ms)"));

        let condition = payload.downcast_ref::<FatalCondition>().unwrap();
        assert_eq!(
            condition,
            &FatalCondition::RankFailure {
                test: "sum.mp".to_string(),
                rank: 2,
            }
        );
        assert_eq!(condition.exit_code(), taskbench_core::EXIT_TESTS_FAILED);
    }

    #[test]
    fn test_leak_detector_quiet_when_drained() {
        let comm: Arc<dyn Communicator> = Arc::new(SoloComm::new());
        let mut detector = LeakDetector::new(comm, Arc::new(UnwindControl));
        detector.on_test_end(&report(vec![]));
    }

    #[test]
    fn test_leak_detector_terminates_on_unread_message() {
        let comm: Arc<dyn Communicator> = Arc::new(SoloComm::new());
        comm.send(0, 7, &[1, 2, 3]).unwrap();
        let mut detector = LeakDetector::new(comm, Arc::new(UnwindControl));

        let payload = catch_unwind(AssertUnwindSafe(|| detector.on_test_end(&report(vec![]))))
            .unwrap_err();
        let condition = payload.downcast_ref::<FatalCondition>().unwrap();
        assert_eq!(
            condition,
            &FatalCondition::MessageLeak {
                test: "sum.mp".to_string(),
                rank: 0,
                source: 0,
                tag: 7,
            }
        );
        assert_eq!(condition.exit_code(), taskbench_core::EXIT_MESSAGE_LEAK);
    }

    #[test]
    fn test_leak_detector_follows_existing_abort() {
        let outcome = LocalWorld::run(2, |comm| {
            if comm.rank() == 1 {
                comm.abort(taskbench_core::EXIT_MESSAGE_LEAK, "leak on rank 1");
            }
            LeakDetector::new(comm, Arc::new(UnwindControl)).on_test_end(&report(vec![]));
        });

        let abort = outcome.abort.unwrap();
        assert_eq!(abort.code, taskbench_core::EXIT_MESSAGE_LEAK);
        assert_eq!(abort.origin, 1);

        // The driver leaves with the same code instead of a runtime failure
        let payload = outcome.results[0].as_ref().unwrap_err();
        assert!(!payload.is::<FatalCondition>());
        let record = payload.downcast_ref::<AbortRecord>().unwrap();
        assert_eq!(record.code, taskbench_core::EXIT_MESSAGE_LEAK);
        assert_eq!(record.origin, 0);
    }
}
