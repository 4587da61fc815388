#![warn(missing_docs)]
//! taskbench CLI Library
//!
//! Command line, configuration, launcher and test session for taskbench
//! binaries. Call `taskbench::run()` (or `taskbench_cli::run()`) from
//! `main` to run every test registered with `#[task_test]`.
//!
//! # Example
//!
//! ```ignore
//! use taskbench::prelude::*;
//!
//! #[task_test(suite = "sum")]
//! fn sequential(ctx: &mut TestContext) {
//!     // build a BufferContract, drive a TaskRunner, check the output
//! }
//!
//! fn main() {
//!     taskbench::run();
//! }
//! ```
//!
//! A session with `--processes N` re-executes the binary N times as rank
//! workers connected through the launcher; otherwise tests run in-process
//! against a single-rank communicator.

mod config;
#[cfg(unix)]
#[allow(missing_docs)]
mod launcher;
mod metadata;
mod planner;
#[allow(missing_docs)]
mod session;

pub use config::*;
#[cfg(unix)]
pub use launcher::{LaunchError, Launcher, RANK_WORKER_FLAG};
pub use metadata::build_report_meta;
pub use planner::{ExecutionPlan, build_plan};
pub use session::{
    LeakDetector, Output, RankFailurePrinter, ResultPrinter, TestListener, TestSession, exit_code,
};

use anyhow::Context;
use clap::Parser;
use rayon::ThreadPoolBuilder;
use regex::Regex;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use taskbench_core::{
    CommControl, Communicator, EXIT_RUNTIME_FAILURE, EXIT_SUCCESS, HarnessSettings, SoloComm,
    TestDef, TestKind,
};
use taskbench_report::{OutputFormat, SessionReport, generate_json_report};

/// taskbench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "taskbench")]
#[command(author, version, about = "taskbench - task lifecycle and performance harness")]
pub struct Cli {
    /// Filter tests by regex over `suite.name`
    #[arg(default_value = ".*")]
    pub filter: String,

    /// Only run tests of this kind: func or perf
    #[arg(long)]
    pub kind: Option<TestKind>,

    /// List matching tests without running them
    #[arg(long)]
    pub list: bool,

    /// Show full output of non-driver ranks
    #[arg(long)]
    pub print_workers: bool,

    /// Number of rank processes (overrides config and environment)
    #[arg(long, short = 'p')]
    pub processes: Option<u32>,

    /// Worker threads for thread and task backends
    #[arg(long, short = 'j')]
    pub threads: Option<usize>,

    /// Output format: human or json
    #[arg(long)]
    pub format: Option<OutputFormat>,

    /// JSON report destination (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: run as a rank process (used by the launcher)
    #[arg(long = "rank-worker", hide = true)]
    pub rank_worker: bool,

    /// Internal: absorb cargo bench's --bench flag
    #[arg(long, hide = true)]
    pub bench: bool,
}

/// Run the taskbench CLI with the process arguments and exit.
pub fn run() -> ! {
    std::process::exit(init(std::env::args_os()))
}

/// Run the taskbench CLI with `args` (program name first) and return the
/// process exit code.
pub fn init<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };

    let filter = if cli.verbose {
        "taskbench=debug"
    } else {
        "taskbench=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let forwarded = args.into_iter().skip(1).collect();
    match run_with_cli(&cli, forwarded) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[  FAILED  ] taskbench: {e:#}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

/// Layer configuration: taskbench.toml, then environment, then CLI flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<TaskbenchConfig> {
    let mut config = TaskbenchConfig::discover()?.unwrap_or_default();
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(threads) = cli.threads {
        config.runner.num_threads = threads;
    }
    if let Some(processes) = cli.processes {
        config.runner.num_processes = processes;
    }
    if cli.print_workers {
        config.runner.print_workers = true;
    }
    if let Some(path) = &cli.output {
        config.output.path = Some(path.clone());
    }
    if let Some(format) = cli.format {
        config.output.format = match format {
            OutputFormat::Human => "human",
            OutputFormat::Json => "json",
        }
        .to_string();
    }
    Ok(config)
}

fn run_with_cli(cli: &Cli, forwarded: Vec<OsString>) -> anyhow::Result<i32> {
    let config = resolve_config(cli)?;
    let settings = config.settings()?;
    let format: OutputFormat = config
        .output
        .format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let filter = Regex::new(&cli.filter).with_context(|| format!("invalid filter {:?}", cli.filter))?;
    let all_tests: Vec<&TestDef> = inventory::iter::<TestDef>.into_iter().collect();
    let plan = build_plan(all_tests, Some(&filter), cli.kind);

    if cli.list {
        list_tests(&plan);
        return Ok(EXIT_SUCCESS);
    }

    if let Err(e) = ThreadPoolBuilder::new()
        .num_threads(settings.num_threads)
        .build_global()
    {
        tracing::debug!("global thread pool already configured: {e}");
    }

    if cli.rank_worker {
        return run_rank_worker(&plan, &settings, &config, format);
    }

    if settings.num_processes > 1 {
        return launch(settings.num_processes, forwarded);
    }

    let comm: Arc<dyn Communicator> = Arc::new(SoloComm::new());
    run_session(comm, &plan, &settings, &config, format)
}

#[cfg(unix)]
fn run_rank_worker(
    plan: &ExecutionPlan<'_>,
    settings: &HarnessSettings,
    config: &TaskbenchConfig,
    format: OutputFormat,
) -> anyhow::Result<i32> {
    use taskbench_core::comm::{ProcessComm, RankContext};

    let context = RankContext::from_env()?
        .context("--rank-worker used outside of a launched session")?;
    let process = Arc::new(ProcessComm::from_env(context)?);

    let comm: Arc<dyn Communicator> = process.clone();
    let code = run_session(comm, plan, settings, config, format)?;
    process
        .finalize(code)
        .context("finalizing the distributed runtime")?;
    Ok(code)
}

#[cfg(not(unix))]
fn run_rank_worker(
    _plan: &ExecutionPlan<'_>,
    _settings: &HarnessSettings,
    _config: &TaskbenchConfig,
    _format: OutputFormat,
) -> anyhow::Result<i32> {
    anyhow::bail!("rank workers require a unix host")
}

#[cfg(unix)]
fn launch(num_processes: u32, forwarded: Vec<OsString>) -> anyhow::Result<i32> {
    tracing::info!(num_processes, "launching rank processes");
    let code = Launcher::new(num_processes, forwarded)?.run()?;
    Ok(code)
}

#[cfg(not(unix))]
fn launch(_num_processes: u32, _forwarded: Vec<OsString>) -> anyhow::Result<i32> {
    anyhow::bail!("multi-process sessions require a unix host")
}

fn run_session(
    comm: Arc<dyn Communicator>,
    plan: &ExecutionPlan<'_>,
    settings: &HarnessSettings,
    config: &TaskbenchConfig,
    format: OutputFormat,
) -> anyhow::Result<i32> {
    if plan.is_empty() {
        if comm.is_driver() {
            println!("No tests matched.");
        }
        return Ok(EXIT_SUCCESS);
    }

    let start = Instant::now();
    let control = Arc::new(CommControl::new(Arc::clone(&comm)));
    let mut session = TestSession::new(
        Arc::clone(&comm),
        control,
        settings.clone(),
        Output::Stdout,
    )
    .with_standard_listeners(config.runner.print_workers);
    let summary = session.run(&plan.tests);

    if comm.is_driver() && format == OutputFormat::Json {
        let report = SessionReport::new(
            build_report_meta(settings),
            session.into_reports(),
            start.elapsed(),
        );
        write_report(&report, config.output.path.as_deref())?;
    }

    Ok(exit_code(&summary))
}

fn write_report(report: &SessionReport, path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let json = generate_json_report(report)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            println!("Report written to: {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn list_tests(plan: &ExecutionPlan<'_>) {
    println!("taskbench plan:");
    let mut suites: std::collections::BTreeMap<&str, Vec<&TestDef>> =
        std::collections::BTreeMap::new();
    for test in &plan.tests {
        suites.entry(test.suite).or_default().push(test);
    }
    for (suite, tests) in &suites {
        println!("├── suite: {}", suite);
        for test in tests {
            println!(
                "│   ├── {} [{}] ({}:{})",
                test.name, test.kind, test.file, test.line
            );
        }
    }
    println!("{} tests found.", plan.tests.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_session_flags() {
        let cli = Cli::try_parse_from([
            "taskbench",
            "^sum\\.",
            "--kind",
            "perf",
            "--processes",
            "4",
            "--format",
            "json",
            "--output",
            "report.json",
        ])
        .unwrap();
        assert_eq!(cli.filter, "^sum\\.");
        assert_eq!(cli.kind, Some(TestKind::Perf));
        assert_eq!(cli.processes, Some(4));
        assert_eq!(cli.format, Some(OutputFormat::Json));
        assert!(!cli.rank_worker);
    }

    #[test]
    fn test_rank_worker_flag_is_accepted() {
        let cli = Cli::try_parse_from(["taskbench", "--rank-worker", "--print-workers"]).unwrap();
        assert!(cli.rank_worker);
        assert!(cli.print_workers);
        assert_eq!(cli.filter, ".*");
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from(["taskbench", "--threads", "3", "--format", "json"]).unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.runner.num_threads, 3);
        assert_eq!(config.output.format, "json");
    }

    #[test]
    fn test_bad_flag_exit_code() {
        assert_eq!(init(["taskbench", "--no-such-flag"]), 2);
    }
}
