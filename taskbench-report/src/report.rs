//! Report Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskbench_core::{HarnessSettings, PartKind, Statistic, TestIdentity, TestPartResult};

/// Complete session report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub meta: ReportMeta,
    pub tests: Vec<TestReport>,
    pub summary: SessionSummary,
}

impl SessionReport {
    /// Assemble a report, computing the summary from `tests`
    pub fn new(meta: ReportMeta, tests: Vec<TestReport>, duration: Duration) -> Self {
        let summary = SessionSummary::from_tests(&tests, duration);
        Self {
            meta,
            tests,
            summary,
        }
    }

    /// Every perf record in plan order
    pub fn statistics(&self) -> impl Iterator<Item = &Statistic> {
        self.tests.iter().flat_map(|t| t.statistics.iter())
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    pub schema_version: u32,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub git_commit: Option<String>,
    pub system: SystemInfo,
    pub settings: HarnessSettings,
}

/// Host the session ran on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpu: String,
    pub cpu_cores: u32,
}

/// Test outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// One test as seen by the rank that ran it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub test: TestIdentity,
    pub rank: u32,
    pub status: TestStatus,
    pub duration_ms: f64,
    pub parts: Vec<TestPartResult>,
    pub statistics: Vec<Statistic>,
}

impl TestReport {
    /// Classify `parts`: any failure fails the test, otherwise a skip part skips it
    pub fn new(
        test: TestIdentity,
        rank: u32,
        duration: Duration,
        parts: Vec<TestPartResult>,
        statistics: Vec<Statistic>,
    ) -> Self {
        let status = if parts.iter().any(TestPartResult::is_failure) {
            TestStatus::Failed
        } else if parts.iter().any(|p| p.kind == PartKind::Skip) {
            TestStatus::Skipped
        } else {
            TestStatus::Passed
        };
        Self {
            test,
            rank,
            status,
            duration_ms: duration.as_secs_f64() * 1e3,
            parts,
            statistics,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == TestStatus::Failed
    }

    /// Failing parts only
    pub fn failures(&self) -> impl Iterator<Item = &TestPartResult> {
        self.parts.iter().filter(|p| p.is_failure())
    }
}

/// Report summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_tests: Vec<String>,
    pub total_duration_ms: f64,
}

impl SessionSummary {
    /// Count statuses in `tests`
    pub fn from_tests(tests: &[TestReport], duration: Duration) -> Self {
        let mut summary = SessionSummary {
            total_tests: tests.len(),
            total_duration_ms: duration.as_secs_f64() * 1e3,
            ..Default::default()
        };
        for test in tests {
            match test.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Failed => {
                    summary.failed += 1;
                    summary.failed_tests.push(test.test.full_name());
                }
            }
        }
        summary
    }

    /// Whether the session should exit with a failure code
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
