//! Configuration loading from taskbench.toml
//!
//! Configuration can be specified in a `taskbench.toml` file in the project
//! root. The file is discovered by walking up from the current directory.
//! Environment variables override the file; command-line flags override both.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskbench_core::HarnessSettings;

/// File name searched for during discovery
pub const CONFIG_FILE_NAME: &str = "taskbench.toml";

/// Overrides `runner.num_threads`
pub const NUM_THREADS_ENV: &str = "TASKBENCH_NUM_THREADS";
/// Overrides `runner.num_processes`
pub const NUM_PROC_ENV: &str = "TASKBENCH_NUM_PROC";
/// Overrides `runner.task_time_budget`
pub const TASK_MAX_TIME_ENV: &str = "TASKBENCH_TASK_MAX_TIME";
/// Overrides `runner.perf_time_budget`
pub const PERF_MAX_TIME_ENV: &str = "TASKBENCH_PERF_MAX_TIME";

/// taskbench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskbenchConfig {
    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// How tests are executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Worker threads for thread and task backends
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Rank processes to launch
    #[serde(default = "default_num_processes")]
    pub num_processes: u32,
    /// Functional PreProcess..PostProcess ceiling (e.g., "1s")
    #[serde(default = "default_task_time_budget")]
    pub task_time_budget: String,
    /// Perf measurement ceiling (e.g., "10s")
    #[serde(default = "default_perf_time_budget")]
    pub perf_time_budget: String,
    /// Stream full output of non-driver ranks
    #[serde(default)]
    pub print_workers: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            num_processes: default_num_processes(),
            task_time_budget: default_task_time_budget(),
            perf_time_budget: default_perf_time_budget(),
            print_workers: false,
        }
    }
}

fn default_num_threads() -> usize {
    1
}
fn default_num_processes() -> u32 {
    1
}
fn default_task_time_budget() -> String {
    "1s".to_string()
}
fn default_perf_time_budget() -> String {
    "10s".to_string()
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format: "human" or "json"
    #[serde(default = "default_format")]
    pub format: String,
    /// Where the JSON report goes (stdout when unset)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            path: None,
        }
    }
}

fn default_format() -> String {
    "human".to_string()
}

impl TaskbenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> anyhow::Result<Option<Self>> {
        match std::env::current_dir() {
            Ok(dir) => Self::discover_from(dir),
            Err(_) => Ok(None),
        }
    }

    /// Walk up from `dir` looking for `taskbench.toml`
    pub fn discover_from(mut dir: PathBuf) -> anyhow::Result<Option<Self>> {
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                tracing::debug!(path = %config_path.display(), "loading configuration");
                return Self::load(&config_path).map(Some);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(value) = lookup(NUM_THREADS_ENV) {
            self.runner.num_threads = value
                .trim()
                .parse()
                .with_context(|| format!("invalid {NUM_THREADS_ENV}={value:?}"))?;
        }
        if let Some(value) = lookup(NUM_PROC_ENV) {
            self.runner.num_processes = value
                .trim()
                .parse()
                .with_context(|| format!("invalid {NUM_PROC_ENV}={value:?}"))?;
        }
        if let Some(value) = lookup(TASK_MAX_TIME_ENV) {
            self.runner.task_time_budget = value;
        }
        if let Some(value) = lookup(PERF_MAX_TIME_ENV) {
            self.runner.perf_time_budget = value;
        }
        Ok(())
    }

    /// Validate and convert into the settings tests see
    pub fn settings(&self) -> anyhow::Result<HarnessSettings> {
        let runner = &self.runner;
        if runner.num_threads == 0 {
            anyhow::bail!("num_threads must be at least 1");
        }
        if runner.num_processes == 0 {
            anyhow::bail!("num_processes must be at least 1");
        }
        let task = Self::parse_duration(&runner.task_time_budget)
            .context("runner.task_time_budget")?;
        let perf = Self::parse_duration(&runner.perf_time_budget)
            .context("runner.perf_time_budget")?;

        Ok(HarnessSettings {
            num_threads: runner.num_threads,
            num_processes: runner.num_processes,
            task_time_budget_secs: task as f64 / 1e9,
            perf_time_budget_secs: perf as f64 / 1e9,
        })
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# taskbench configuration

[runner]
# Worker threads for thread and task backends
num_threads = 1
# Rank processes to launch (1 = single process)
num_processes = 1
# Functional tests fail when PreProcess..PostProcess takes longer
task_time_budget = "1s"
# Perf measurements at or above this abort the session
perf_time_budget = "10s"
# Show full output of non-driver ranks
print_workers = false

[output]
# Default output format: human or json
format = "human"
# JSON report destination (uncomment to enable)
# path = "target/taskbench/report.json"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m") to nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if value < 0.0 {
            return Err(anyhow::anyhow!("Negative duration: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}
