//! Callback contracts through which operations report progress to the caller.
//!
//! For every received message `handle_raw_message` runs before the typed
//! callback derived from it. Handlers are invoked from the channel's read
//! thread and must not block on the session that called them.

use crate::core::types::{
    AttachmentSet, TestCase, TestMessageLevel, TestProcessStartInfo, TestRunChangedEventArgs,
    TestRunCompleteEventArgs,
};

/// Callbacks shared by discovery and run handlers.
pub trait TestMessageEventHandler: Send + Sync {
    fn handle_log_message(&self, level: TestMessageLevel, message: &str);

    /// The undecoded envelope text of a received (or synthesized) message.
    fn handle_raw_message(&self, raw_message: &str);
}

pub trait DiscoveryEventsHandler: TestMessageEventHandler {
    fn handle_discovered_tests(&self, discovered: Vec<TestCase>);

    /// `total_tests` is `-1` when discovery was aborted.
    fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    );
}

pub trait RunEventsHandler: TestMessageEventHandler {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs);

    fn handle_test_run_complete(
        &self,
        complete_args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Option<Vec<AttachmentSet>>,
        executor_uris: Option<Vec<String>>,
    );

    /// Launch `start_info` under a debugger and return the new process id.
    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> anyhow::Result<i32>;
}
