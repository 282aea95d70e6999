//! Payload shapes exchanged with the test host.
//!
//! Property names are PascalCase on the wire. Optional collections stay
//! `Option` so that `null` and an empty list remain distinguishable, which the
//! abort path relies on.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::timespan;

/// Severity of a log message routed through the event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMessageLevel {
    Informational,
    Warning,
    Error,
}

/// Payload of `TestMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestMessagePayload {
    pub message_level: TestMessageLevel,
    pub message: String,
}

/// A single discovered test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub executor_uri: String,
    pub source: String,
    pub display_name: String,
    #[serde(default)]
    pub code_file_path: Option<String>,
    #[serde(default)]
    pub line_number: i32,
}

impl TestCase {
    pub fn new(
        fully_qualified_name: impl Into<String>,
        executor_uri: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            executor_uri: executor_uri.into(),
            source: source.into(),
            code_file_path: None,
            line_number: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TestOutcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

/// Result of executing one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stack_trace: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub computer_name: Option<String>,
    #[serde(with = "timespan")]
    pub duration: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TestResult {
    /// Result with `outcome`, zero duration and both timestamps set to now.
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            test_case,
            outcome,
            error_message: None,
            error_stack_trace: None,
            display_name: None,
            computer_name: None,
            duration: Duration::ZERO,
            start_time: now,
            end_time: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunStatistics {
    pub executed_tests: i64,
    #[serde(default)]
    pub stats: BTreeMap<TestOutcome, i64>,
}

impl TestRunStatistics {
    /// Tally `results` into per-outcome counts.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> Self {
        let mut stats = Self::default();
        for result in results {
            stats.executed_tests += 1;
            *stats.stats.entry(result.outcome).or_insert(0) += 1;
        }
        stats
    }

    pub fn count(&self, outcome: TestOutcome) -> i64 {
        self.stats.get(&outcome).copied().unwrap_or(0)
    }
}

/// Payload of `TestRunStatsChange`; also carried as the last chunk of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunChangedEventArgs {
    #[serde(default)]
    pub test_run_statistics: Option<TestRunStatistics>,
    #[serde(default)]
    pub new_test_results: Option<Vec<TestResult>>,
    #[serde(default)]
    pub active_tests: Option<Vec<TestCase>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UriDataAttachment {
    pub uri: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    #[serde(default)]
    pub attachments: Vec<UriDataAttachment>,
}

/// Completion arguments of a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompleteEventArgs {
    #[serde(default)]
    pub test_run_statistics: Option<TestRunStatistics>,
    pub is_canceled: bool,
    pub is_aborted: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attachment_sets: Option<Vec<AttachmentSet>>,
    #[serde(with = "timespan")]
    pub elapsed_time_in_running_tests: Duration,
}

impl TestRunCompleteEventArgs {
    /// Completion arguments for a run that ended abnormally.
    pub fn aborted(error: Option<String>) -> Self {
        Self {
            test_run_statistics: None,
            is_canceled: false,
            is_aborted: true,
            error,
            attachment_sets: None,
            elapsed_time_in_running_tests: Duration::ZERO,
        }
    }
}

/// Payload of `StartDiscovery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCriteria {
    pub sources: Vec<String>,
    pub frequency_of_discovered_tests_event: i64,
    #[serde(default)]
    pub run_settings: String,
    #[serde(default)]
    pub test_case_filter: Option<String>,
}

impl DiscoveryCriteria {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            frequency_of_discovered_tests_event: 10,
            run_settings: String::new(),
            test_case_filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestExecutionContext {
    pub frequency_of_run_stats_change_event: i64,
    pub in_isolation: bool,
    pub keep_alive: bool,
    pub is_debug: bool,
    #[serde(default)]
    pub test_case_filter: Option<String>,
}

impl Default for TestExecutionContext {
    fn default() -> Self {
        Self {
            frequency_of_run_stats_change_event: 10,
            in_isolation: true,
            keep_alive: false,
            is_debug: false,
            test_case_filter: None,
        }
    }
}

/// Payload of `StartTestExecutionWithSources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithSources {
    pub adapter_source_map: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub run_settings: String,
    pub test_execution_context: TestExecutionContext,
}

/// Payload of `StartTestExecutionWithTests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithTests {
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub run_settings: String,
    pub test_execution_context: TestExecutionContext,
}

/// Adapter map key used when sources are not tied to a specific adapter.
pub const NO_ADAPTER_KEY: &str = "_none_";

/// The two shapes a run can be started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRunCriteria {
    Sources(TestRunCriteriaWithSources),
    Tests(TestRunCriteriaWithTests),
}

impl TestRunCriteria {
    /// Run every test in `sources` with the default execution context.
    pub fn from_sources(sources: Vec<String>) -> Self {
        Self::Sources(TestRunCriteriaWithSources {
            adapter_source_map: BTreeMap::from([(NO_ADAPTER_KEY.to_string(), sources)]),
            run_settings: String::new(),
            test_execution_context: TestExecutionContext::default(),
        })
    }

    /// Sources this run touches, in first-seen order.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        let mut push = |source: &String| {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        };
        match self {
            Self::Sources(criteria) => criteria.adapter_source_map.values().flatten().for_each(&mut push),
            Self::Tests(criteria) => criteria.tests.iter().map(|test| &test.source).for_each(&mut push),
        }
        sources
    }

    pub fn execution_context(&self) -> &TestExecutionContext {
        match self {
            Self::Sources(criteria) => &criteria.test_execution_context,
            Self::Tests(criteria) => &criteria.test_execution_context,
        }
    }
}

/// How to start a process: used for the test host and debugger launches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestProcessStartInfo {
    pub file_name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_variables: Option<BTreeMap<String, String>>,
}

/// Payload of `DiscoveryComplete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompletePayload {
    pub total_tests: i64,
    #[serde(default)]
    pub last_discovered_tests: Option<Vec<TestCase>>,
    pub is_aborted: bool,
}

/// Payload of `ExecutionComplete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompletePayload {
    #[serde(default)]
    pub test_run_complete_args: Option<TestRunCompleteEventArgs>,
    #[serde(default)]
    pub last_run_tests: Option<TestRunChangedEventArgs>,
    #[serde(default)]
    pub run_attachments: Option<Vec<AttachmentSet>>,
    #[serde(default)]
    pub executor_uris: Option<Vec<String>>,
}
