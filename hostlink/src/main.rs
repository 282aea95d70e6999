//! Command line runner.
//!
//! Launches the configured test host for a set of sources, drives one
//! discovery or run through it and prints progress to stdout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hostlink::core::types::{
    AttachmentSet, DiscoveryCriteria, TestCase, TestMessageLevel, TestOutcome,
    TestProcessStartInfo, TestResult, TestRunChangedEventArgs, TestRunCompleteEventArgs,
    TestRunCriteria,
};
use hostlink::events::{DiscoveryEventsHandler, RunEventsHandler, TestMessageEventHandler};
use hostlink::exit_codes;
use hostlink::io::config::{HostlinkConfig, load_config, write_config};
use hostlink::io::test_host::ProcessTestHost;
use hostlink::logging;
use hostlink::proxy::discovery::ProxyDiscoveryManager;
use hostlink::proxy::execution::ProxyExecutionManager;
use hostlink::proxy::operation::ProxyConfig;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "hostlink",
    version,
    about = "Discover and run tests through an out-of-process test host"
)]
struct Cli {
    /// Path to the runner config.
    #[arg(long, global = true, default_value = "hostlink.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// List the tests found in the given sources.
    Discover {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Run every test in the given sources.
    Run {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
}

/// How an operation ended, as seen by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed { failed: i64 },
    Aborted,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Self::Completed { failed: 0 } => exit_codes::OK,
            Self::Completed { .. } => exit_codes::TESTS_FAILED,
            Self::Aborted => exit_codes::ABORTED,
        }
    }
}

/// Prints operation events and records the single completion.
#[derive(Default)]
struct Console {
    outcome: Mutex<Option<Outcome>>,
    completed: Condvar,
}

impl Console {
    fn complete(&self, outcome: Outcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            slot.get_or_insert(outcome);
            self.completed.notify_all();
        }
    }

    fn wait(&self) -> Outcome {
        let Ok(mut slot) = self.outcome.lock() else {
            return Outcome::Aborted;
        };
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            slot = match self.completed.wait(slot) {
                Ok(slot) => slot,
                Err(_) => return Outcome::Aborted,
            };
        }
    }

    fn print_tests(tests: &[TestCase]) {
        for test in tests {
            println!("{}", test.fully_qualified_name);
        }
    }

    fn print_results(results: &[TestResult]) {
        for result in results {
            let label = match result.outcome {
                TestOutcome::Passed => "passed",
                TestOutcome::Failed => "FAILED",
                TestOutcome::Skipped => "skipped",
                TestOutcome::NotFound => "not found",
                TestOutcome::None => "none",
            };
            println!("{label:>9}  {}", result.test_case.fully_qualified_name);
            if let Some(message) = &result.error_message {
                println!("           {message}");
            }
        }
    }
}

impl TestMessageEventHandler for Console {
    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        eprintln!("[{level:?}] {message}");
    }

    fn handle_raw_message(&self, raw_message: &str) {
        debug!(raw = raw_message, "message");
    }
}

impl DiscoveryEventsHandler for Console {
    fn handle_discovered_tests(&self, discovered: Vec<TestCase>) {
        Self::print_tests(&discovered);
    }

    fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    ) {
        Self::print_tests(last_chunk.as_deref().unwrap_or_default());
        if is_aborted {
            println!("discovery aborted");
            self.complete(Outcome::Aborted);
        } else {
            println!("{total_tests} test(s) found");
            self.complete(Outcome::Completed { failed: 0 });
        }
    }
}

impl RunEventsHandler for Console {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        Self::print_results(args.new_test_results.as_deref().unwrap_or_default());
    }

    fn handle_test_run_complete(
        &self,
        complete_args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Option<Vec<AttachmentSet>>,
        _executor_uris: Option<Vec<String>>,
    ) {
        if let Some(chunk) = &last_chunk {
            Self::print_results(chunk.new_test_results.as_deref().unwrap_or_default());
        }
        for set in run_attachments.iter().flatten() {
            for attachment in &set.attachments {
                println!("attachment  {}", attachment.uri);
            }
        }
        if complete_args.is_aborted {
            println!(
                "run aborted: {}",
                complete_args.error.as_deref().unwrap_or("no reason given")
            );
            self.complete(Outcome::Aborted);
            return;
        }
        let stats = complete_args.test_run_statistics.unwrap_or_default();
        let failed = stats.count(TestOutcome::Failed);
        println!(
            "{} executed, {} passed, {} failed, {} skipped in {:.2}s",
            stats.executed_tests,
            stats.count(TestOutcome::Passed),
            failed,
            stats.count(TestOutcome::Skipped),
            complete_args.elapsed_time_in_running_tests.as_secs_f64()
        );
        self.complete(Outcome::Completed { failed });
    }

    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32> {
        bail!(
            "cannot attach a debugger to {} from the command line",
            start_info.file_name
        )
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Discover { sources } => cmd_discover(&cli.config, &sources),
        Command::Run { sources } => cmd_run(&cli.config, &sources),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &HostlinkConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_discover(config_path: &Path, sources: &[PathBuf]) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let sources = resolve_sources(sources)?;
    let console = Arc::new(Console::default());
    let manager = ProxyDiscoveryManager::new(
        Arc::new(ProcessTestHost::from_config(&cfg)),
        ProxyConfig::from_config(&cfg),
    );
    let started = manager.discover_tests(&DiscoveryCriteria::new(sources), console.clone());
    let outcome = console.wait();
    manager.close();
    started?;
    Ok(outcome.exit_code())
}

fn cmd_run(config_path: &Path, sources: &[PathBuf]) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let sources = resolve_sources(sources)?;
    let console = Arc::new(Console::default());
    let manager = ProxyExecutionManager::new(
        Arc::new(ProcessTestHost::from_config(&cfg)),
        ProxyConfig::from_config(&cfg),
    );
    let started = manager.start_test_run(&TestRunCriteria::from_sources(sources), console.clone());
    let outcome = console.wait();
    manager.close();
    started?;
    Ok(outcome.exit_code())
}

fn resolve_sources(sources: &[PathBuf]) -> Result<Vec<String>> {
    sources
        .iter()
        .map(|source| {
            let path = fs::canonicalize(source)
                .with_context(|| format!("resolve source {}", source.display()))?;
            Ok(path.display().to_string())
        })
        .collect()
}
