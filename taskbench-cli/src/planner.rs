//! Test Planner
//!
//! Builds the execution plan by filtering and ordering registered tests.
//!
//! Filtering options:
//! - Regex pattern matching on `suite.name`
//! - Test kind (functional or perf)
//!
//! Ordering: tests are sorted by suite, then name, so every rank of a
//! multi-process session walks the same sequence.

use taskbench_core::{TestDef, TestKind};

/// Execution plan for a session
pub struct ExecutionPlan<'a> {
    /// Ordered list of tests to run
    pub tests: Vec<&'a TestDef>,
}

impl ExecutionPlan<'_> {
    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Number of distinct suites in the plan
    pub fn suite_count(&self) -> usize {
        let mut suites: Vec<_> = self.tests.iter().map(|t| t.suite).collect();
        suites.dedup();
        suites.len()
    }
}

/// Build execution plan from registered tests
pub fn build_plan<'a>(
    tests: impl IntoIterator<Item = &'a TestDef>,
    filter: Option<&regex::Regex>,
    kind: Option<TestKind>,
) -> ExecutionPlan<'a> {
    let mut selected: Vec<_> = tests
        .into_iter()
        .filter(|t| filter.is_none_or(|re| re.is_match(&t.full_name())))
        .filter(|t| kind.is_none_or(|k| t.kind == k))
        .collect();

    selected.sort_by(|a, b| (a.suite, a.name).cmp(&(b.suite, b.name)));

    ExecutionPlan { tests: selected }
}
