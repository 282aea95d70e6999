//! Reference test host.
//!
//! Connects back to the runner and serves discovery and execution requests for
//! plain-text sources holding one test per line:
//!
//! - `name` passes, `!name` fails, `~name` is skipped
//! - `crash: <text>` writes `<text>` to stderr and exits with status 1
//! - blank lines and `#` comments are ignored

use std::collections::BTreeSet;
use std::fs;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use hostlink::core::message::{Message, MessageType};
use hostlink::core::types::{
    DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestExecutionContext, TestMessageLevel,
    TestMessagePayload, TestOutcome, TestProcessStartInfo, TestResult, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCompletePayload, TestRunCriteriaWithSources,
    TestRunCriteriaWithTests, TestRunStatistics,
};
use hostlink::io::channel::DEFAULT_MAX_FRAME_BYTES;
use hostlink::io::client::TestHostClient;
use tracing::{debug, info};

const EXECUTOR_URI: &str = "executor://hostlink/reference";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hostlink-testhost", version, about = "Reference test host for hostlink")]
struct Cli {
    /// Runner port to connect to.
    #[arg(long)]
    port: u16,

    /// Process id of the runner.
    #[arg(long = "parentprocessid")]
    parent_process_id: Option<u32>,

    /// Port of the data collection process.
    #[arg(long = "datacollectionport")]
    data_collection_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Test { name: String, outcome: TestOutcome },
    Crash(String),
}

fn parse_source(text: &str) -> Vec<Line> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if let Some(text) = line.strip_prefix("crash:") {
                Line::Crash(text.trim().to_string())
            } else if let Some(name) = line.strip_prefix('!') {
                Line::Test {
                    name: name.trim().to_string(),
                    outcome: TestOutcome::Failed,
                }
            } else if let Some(name) = line.strip_prefix('~') {
                Line::Test {
                    name: name.trim().to_string(),
                    outcome: TestOutcome::Skipped,
                }
            } else {
                Line::Test {
                    name: line.to_string(),
                    outcome: TestOutcome::Passed,
                }
            }
        })
        .collect()
}

/// A test found in a source together with its scripted outcome.
struct ScriptedTest {
    case: TestCase,
    outcome: TestOutcome,
}

struct Host {
    client: TestHostClient,
    extensions: Vec<String>,
}

impl Host {
    fn log(&self, level: TestMessageLevel, message: impl Into<String>) -> Result<()> {
        self.client.send(
            MessageType::TestMessage,
            &TestMessagePayload {
                message_level: level,
                message: message.into(),
            },
        )
    }

    /// Load the tests of `source`, crashing the process on a crash line.
    fn load_source(&self, source: &str) -> Result<Vec<ScriptedTest>> {
        let text = match fs::read_to_string(source) {
            Ok(text) => text,
            Err(err) => {
                self.log(TestMessageLevel::Warning, format!("could not read source {source}: {err}"))?;
                return Ok(Vec::new());
            }
        };
        let mut tests = Vec::new();
        for line in parse_source(&text) {
            match line {
                Line::Test { name, outcome } => tests.push(ScriptedTest {
                    case: TestCase::new(name, EXECUTOR_URI, source),
                    outcome,
                }),
                Line::Crash(text) => {
                    eprintln!("{text}");
                    std::process::exit(1);
                }
            }
        }
        Ok(tests)
    }

    fn discover(&self, criteria: &DiscoveryCriteria) -> Result<()> {
        let mut found = Vec::new();
        for source in &criteria.sources {
            found.extend(self.load_source(source)?.into_iter().map(|test| test.case));
        }
        let total = found.len() as i64;
        let chunk_size = usize::try_from(criteria.frequency_of_discovered_tests_event)
            .unwrap_or(1)
            .max(1);
        let mut chunks: Vec<Vec<TestCase>> = found.chunks(chunk_size).map(<[TestCase]>::to_vec).collect();
        let last = chunks.pop();
        for chunk in chunks {
            self.client.send(MessageType::TestCasesFound, &chunk)?;
        }
        info!(total, "discovery finished");
        self.client.send(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: total,
                last_discovered_tests: last,
                is_aborted: false,
            },
        )
    }

    fn run(&self, tests: Vec<ScriptedTest>, context: &TestExecutionContext) -> Result<()> {
        if context.is_debug {
            self.attach_debugger()?;
        }

        let started = Instant::now();
        let chunk_size = usize::try_from(context.frequency_of_run_stats_change_event)
            .unwrap_or(1)
            .max(1);
        let mut all_results = Vec::new();
        let mut pending = Vec::new();
        for test in tests {
            let start_time = Utc::now();
            let mut result = TestResult::new(test.case, test.outcome);
            if test.outcome == TestOutcome::Failed {
                result.error_message = Some("scripted failure".to_string());
            }
            result.start_time = start_time;
            result.end_time = Utc::now();
            result.duration = (result.end_time - start_time).to_std().unwrap_or_default();
            pending.push(result);

            if pending.len() == chunk_size {
                all_results.extend(pending.iter().cloned());
                self.client.send(
                    MessageType::TestRunStatsChange,
                    &TestRunChangedEventArgs {
                        test_run_statistics: Some(TestRunStatistics::from_results(&all_results)),
                        new_test_results: Some(std::mem::take(&mut pending)),
                        active_tests: None,
                    },
                )?;
            }
        }
        all_results.extend(pending.iter().cloned());

        let statistics = TestRunStatistics::from_results(&all_results);
        info!(executed = statistics.executed_tests, "run finished");
        self.client.send(
            MessageType::ExecutionComplete,
            &TestRunCompletePayload {
                test_run_complete_args: Some(TestRunCompleteEventArgs {
                    test_run_statistics: Some(statistics.clone()),
                    is_canceled: false,
                    is_aborted: false,
                    error: None,
                    attachment_sets: None,
                    elapsed_time_in_running_tests: started.elapsed(),
                }),
                last_run_tests: Some(TestRunChangedEventArgs {
                    test_run_statistics: Some(statistics),
                    new_test_results: Some(pending),
                    active_tests: None,
                }),
                run_attachments: None,
                executor_uris: Some(vec![EXECUTOR_URI.to_string()]),
            },
        )
    }

    /// Ask the runner to start us under a debugger and wait for its answer.
    fn attach_debugger(&self) -> Result<()> {
        let exe = std::env::current_exe().context("locate test host executable")?;
        self.client.send(
            MessageType::LaunchAdapterProcessWithDebuggerAttached,
            &TestProcessStartInfo {
                file_name: exe.display().to_string(),
                arguments: "--debuggee".to_string(),
                working_directory: None,
                environment_variables: None,
            },
        )?;
        loop {
            let message = self
                .client
                .receive()?
                .context("runner hung up while launching debugger")?;
            if message.message_type == MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback {
                let pid: i32 = self.client.serializer().require_payload(&message)?;
                return self.log(
                    TestMessageLevel::Informational,
                    format!("debugger attached to process {pid}"),
                );
            }
            debug!(kind = %message.message_type, "ignoring message while waiting for debugger");
        }
    }

    fn run_sources(&self, criteria: &TestRunCriteriaWithSources) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut tests = Vec::new();
        for source in criteria.adapter_source_map.values().flatten() {
            if seen.insert(source.clone()) {
                tests.extend(self.load_source(source)?);
            }
        }
        self.run(tests, &criteria.test_execution_context)
    }

    fn run_tests(&self, criteria: &TestRunCriteriaWithTests) -> Result<()> {
        let mut tests = Vec::new();
        let sources: BTreeSet<&str> = criteria.tests.iter().map(|t| t.source.as_str()).collect();
        let mut scripted = Vec::new();
        for source in sources {
            scripted.extend(self.load_source(source)?);
        }
        for requested in &criteria.tests {
            let outcome = scripted
                .iter()
                .find(|test| {
                    test.case.source == requested.source
                        && test.case.fully_qualified_name == requested.fully_qualified_name
                })
                .map(|test| test.outcome)
                .unwrap_or(TestOutcome::NotFound);
            tests.push(ScriptedTest {
                case: requested.clone(),
                outcome,
            });
        }
        self.run(tests, &criteria.test_execution_context)
    }

    /// Handle one message; `false` ends the session.
    fn handle(&mut self, message: &Message) -> Result<bool> {
        let serializer = *self.client.serializer();
        match message.message_type {
            MessageType::DiscoveryInitialize | MessageType::ExecutionInitialize => {
                let extensions: Option<Vec<String>> = serializer.deserialize_payload(message)?;
                self.extensions = extensions.unwrap_or_default();
                debug!(extensions = self.extensions.len(), "initialized");
            }
            MessageType::StartDiscovery => self.discover(&serializer.require_payload(message)?)?,
            MessageType::StartTestExecutionWithSources => {
                self.run_sources(&serializer.require_payload(message)?)?;
            }
            MessageType::StartTestExecutionWithTests => {
                self.run_tests(&serializer.require_payload(message)?)?;
            }
            MessageType::CancelTestRun | MessageType::AbortTestRun => {
                debug!(kind = %message.message_type, "nothing running");
            }
            MessageType::SessionEnd => return Ok(false),
            other => bail!("unexpected message {other}"),
        }
        Ok(true)
    }
}

fn main() {
    hostlink::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    info!(
        port = cli.port,
        parent = ?cli.parent_process_id,
        data_collection_port = ?cli.data_collection_port,
        "test host starting"
    );
    let client = TestHostClient::connect(cli.port, CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_BYTES)?;
    let mut host = Host {
        client,
        extensions: Vec::new(),
    };
    while let Some(message) = host.client.receive()? {
        if !host.handle(&message)? {
            break;
        }
    }
    debug!("session ended");
    Ok(())
}
