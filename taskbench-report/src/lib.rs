#![warn(missing_docs)]
//! taskbench Report - Session Reports
//!
//! Data model for what a session produced and the machine-readable
//! rendering of it:
//! - per-test status, recorded parts and perf statistics
//! - session summary and host metadata
//! - JSON output (schema versioned)

#[allow(missing_docs)]
mod report;

pub use report::{ReportMeta, SessionReport, SessionSummary, SystemInfo, TestReport, TestStatus};

/// Current JSON schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// gtest-style terminal output
    #[default]
    Human,
    /// Terminal output plus a JSON session report
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" | "text" => Ok(OutputFormat::Human),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

/// Generate a prettified JSON report.
pub fn generate_json_report(report: &SessionReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskbench_core::{HarnessSettings, PerfMode, PerfResult, Statistic, TestIdentity, TestKind};

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Human));
        assert!("html".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_json_report_shape() {
        let result = PerfResult {
            elapsed_seconds: 0.25,
            mode: PerfMode::RunOnly,
            iterations: 5,
        };
        let test = TestIdentity {
            suite: "sum".to_string(),
            name: "seq_perf".to_string(),
            kind: TestKind::Perf,
        };
        let statistic = Statistic::new(&test.full_name(), &result, 10.0);
        let meta = ReportMeta {
            schema_version: SCHEMA_VERSION,
            version: "0.1.0".to_string(),
            timestamp: chrono::Utc::now(),
            git_commit: None,
            system: SystemInfo {
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                cpu: "Unknown".to_string(),
                cpu_cores: 1,
            },
            settings: HarnessSettings::default(),
        };
        let report = SessionReport::new(
            meta,
            vec![TestReport::new(test, 0, Duration::ZERO, vec![], vec![statistic])],
            Duration::ZERO,
        );

        let json = generate_json_report(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["tests"][0]["status"], "passed");
        assert_eq!(value["tests"][0]["statistics"][0]["mode"], "run_only");
        assert_eq!(value["summary"]["total_tests"], 1);
        assert_eq!(report.statistics().count(), 1);
    }
}
