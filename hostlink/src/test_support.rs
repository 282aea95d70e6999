//! Test-only fakes and fixtures for driving sessions without real test hosts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::core::message::{Message, MessageType};
use crate::core::serializer::JsonDataSerializer;
use crate::core::types::{
    AttachmentSet, TestCase, TestMessageLevel, TestOutcome, TestProcessStartInfo, TestResult,
    TestRunChangedEventArgs, TestRunCompleteEventArgs,
};
use crate::error::CommunicationError;
use crate::events::{DiscoveryEventsHandler, RunEventsHandler, TestMessageEventHandler};
use crate::io::channel::{CommunicationChannel, DEFAULT_MAX_FRAME_BYTES, MessageCallback};
use crate::io::client::TestHostClient;
use crate::io::server::{CommunicationServer, ServerCallbacks};
use crate::io::test_host::{HostExitCallback, TestHostManager, TestRunnerConnectionInfo};

/// Channel that records sends and lets tests inject received messages.
#[derive(Default)]
pub struct FakeChannel {
    sent: Mutex<Vec<String>>,
    on_message: RwLock<Option<MessageCallback>>,
    fail_sends: AtomicBool,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Kinds of every sent envelope, in order.
    pub fn sent_kinds(&self) -> Vec<MessageType> {
        let serializer = JsonDataSerializer::new();
        self.sent()
            .iter()
            .map(|raw| serializer.deserialize_message(raw).expect("sent envelope").message_type)
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        self.on_message.read().expect("callback lock").is_some()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver `raw` to the subscriber as if it arrived from the peer.
    pub fn raise(&self, raw: &str) {
        let callback = self.on_message.read().expect("callback lock").clone();
        if let Some(callback) = callback {
            callback(raw);
        }
    }
}

impl CommunicationChannel for FakeChannel {
    fn send(&self, data: &str) -> Result<(), CommunicationError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CommunicationError::Send(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "fake channel closed",
            )));
        }
        self.sent.lock().expect("sent lock").push(data.to_string());
        Ok(())
    }

    fn set_message_received(&self, callback: Option<MessageCallback>) {
        *self.on_message.write().expect("callback lock") = callback;
    }
}

/// Server that hands out a [`FakeChannel`] instead of listening on a socket.
pub struct FakeServer {
    channel: Arc<FakeChannel>,
    connect_on_start: bool,
    callbacks: Mutex<Option<ServerCallbacks>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeServer {
    /// A server whose client connects as soon as it starts.
    pub fn new(channel: Arc<FakeChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            connect_on_start: true,
            callbacks: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    /// A server whose client only connects when [`Self::connect`] is called.
    pub fn without_client(channel: Arc<FakeChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            connect_on_start: false,
            callbacks: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn connect(&self) {
        let callbacks = self.callbacks.lock().expect("callbacks lock");
        let callbacks = callbacks.as_ref().expect("server started");
        (callbacks.on_connected)(Arc::clone(&self.channel) as Arc<dyn CommunicationChannel>);
    }

    pub fn disconnect(&self, err: Option<CommunicationError>) {
        let callbacks = self.callbacks.lock().expect("callbacks lock");
        let callbacks = callbacks.as_ref().expect("server started");
        (callbacks.on_disconnected)(err.as_ref());
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CommunicationServer for FakeServer {
    fn start(&self, callbacks: ServerCallbacks) -> Result<String, CommunicationError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.callbacks.lock().expect("callbacks lock") = Some(callbacks);
        if self.connect_on_start {
            self.connect();
        }
        Ok("12345".to_string())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a recording handler observed, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Log(TestMessageLevel, String),
    Raw(String),
    DiscoveredTests(Vec<TestCase>),
    DiscoveryComplete {
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    },
    StatsChange(TestRunChangedEventArgs),
    RunComplete {
        args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Option<Vec<AttachmentSet>>,
        executor_uris: Option<Vec<String>>,
    },
    LaunchDebugger(TestProcessStartInfo),
}

impl HandlerEvent {
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::DiscoveryComplete { .. } | Self::RunComplete { .. })
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<HandlerEvent>>,
    changed: Condvar,
}

impl EventLog {
    fn push(&self, event: HandlerEvent) {
        self.events.lock().expect("events lock").push(event);
        self.changed.notify_all();
    }

    fn snapshot(&self) -> Vec<HandlerEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn wait_for_completion(&self, timeout: Duration) -> bool {
        let events = self.events.lock().expect("events lock");
        let (events, _) = self
            .changed
            .wait_timeout_while(events, timeout, |events| {
                !events.iter().any(HandlerEvent::is_completion)
            })
            .expect("events lock");
        events.iter().any(HandlerEvent::is_completion)
    }
}

macro_rules! recording_accessors {
    () => {
        pub fn events(&self) -> Vec<HandlerEvent> {
            self.log.snapshot()
        }

        pub fn completions(&self) -> Vec<HandlerEvent> {
            self.events().into_iter().filter(HandlerEvent::is_completion).collect()
        }

        pub fn logs(&self) -> Vec<(TestMessageLevel, String)> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    HandlerEvent::Log(level, message) => Some((level, message)),
                    _ => None,
                })
                .collect()
        }

        pub fn raw_messages(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    HandlerEvent::Raw(raw) => Some(raw),
                    _ => None,
                })
                .collect()
        }

        /// Block until a completion callback arrives. Returns `false` on timeout.
        pub fn wait_for_completion(&self, timeout: Duration) -> bool {
            self.log.wait_for_completion(timeout)
        }
    };
}

/// Discovery handler that records every callback.
#[derive(Default)]
pub struct RecordingDiscoveryHandler {
    log: EventLog,
}

impl RecordingDiscoveryHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    recording_accessors!();

    pub fn discovered_tests(&self) -> Vec<TestCase> {
        self.events()
            .into_iter()
            .flat_map(|event| match event {
                HandlerEvent::DiscoveredTests(tests) => tests,
                HandlerEvent::DiscoveryComplete {
                    last_chunk: Some(tests),
                    ..
                } => tests,
                _ => Vec::new(),
            })
            .collect()
    }
}

impl TestMessageEventHandler for RecordingDiscoveryHandler {
    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.log.push(HandlerEvent::Log(level, message.to_string()));
    }

    fn handle_raw_message(&self, raw_message: &str) {
        self.log.push(HandlerEvent::Raw(raw_message.to_string()));
    }
}

impl DiscoveryEventsHandler for RecordingDiscoveryHandler {
    fn handle_discovered_tests(&self, discovered: Vec<TestCase>) {
        self.log.push(HandlerEvent::DiscoveredTests(discovered));
    }

    fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    ) {
        self.log.push(HandlerEvent::DiscoveryComplete {
            total_tests,
            last_chunk,
            is_aborted,
        });
    }
}

/// Run handler that records every callback and answers debugger launches with a fixed pid.
pub struct RecordingRunHandler {
    log: EventLog,
    debugger_pid: Option<i32>,
}

impl RecordingRunHandler {
    pub fn new() -> Arc<Self> {
        Self::with_debugger_pid(Some(4321))
    }

    /// `None` makes debugger launches fail.
    pub fn with_debugger_pid(debugger_pid: Option<i32>) -> Arc<Self> {
        Arc::new(Self {
            log: EventLog::default(),
            debugger_pid,
        })
    }

    recording_accessors!();

    /// Completion arguments of the (first) run completion.
    pub fn complete_args(&self) -> Option<TestRunCompleteEventArgs> {
        self.events().into_iter().find_map(|event| match event {
            HandlerEvent::RunComplete { args, .. } => Some(args),
            _ => None,
        })
    }

    /// Every result reported through stats changes and the last chunk.
    pub fn results(&self) -> Vec<TestResult> {
        self.events()
            .into_iter()
            .flat_map(|event| match event {
                HandlerEvent::StatsChange(args) => args.new_test_results.unwrap_or_default(),
                HandlerEvent::RunComplete {
                    last_chunk: Some(args),
                    ..
                } => args.new_test_results.unwrap_or_default(),
                _ => Vec::new(),
            })
            .collect()
    }
}

impl TestMessageEventHandler for RecordingRunHandler {
    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.log.push(HandlerEvent::Log(level, message.to_string()));
    }

    fn handle_raw_message(&self, raw_message: &str) {
        self.log.push(HandlerEvent::Raw(raw_message.to_string()));
    }
}

impl RunEventsHandler for RecordingRunHandler {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.log.push(HandlerEvent::StatsChange(args));
    }

    fn handle_test_run_complete(
        &self,
        complete_args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Option<Vec<AttachmentSet>>,
        executor_uris: Option<Vec<String>>,
    ) {
        self.log.push(HandlerEvent::RunComplete {
            args: complete_args,
            last_chunk,
            run_attachments,
            executor_uris,
        });
    }

    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> anyhow::Result<i32> {
        self.log.push(HandlerEvent::LaunchDebugger(start_info));
        self.debugger_pid
            .ok_or_else(|| anyhow::anyhow!("debugger is not available"))
    }
}

/// A deterministic test case from `source`.
pub fn test_case(name: &str, source: &str) -> TestCase {
    TestCase::new(name, "executor://hostlink/reference", source)
}

pub fn test_result(name: &str, source: &str, outcome: TestOutcome) -> TestResult {
    TestResult::new(test_case(name, source), outcome)
}

/// Write a reference test source (one test per line) and return its path.
pub fn write_test_source(dir: &Path, file_name: &str, lines: &[&str]) -> String {
    let path = dir.join(file_name);
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(&path, contents).expect("write test source");
    path.display().to_string()
}

/// A scratch directory for test sources.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Reacts to one message from the runner. Return `Ok(false)` to hang up.
pub type HostScript = Arc<dyn Fn(&TestHostClient, &Message) -> anyhow::Result<bool> + Send + Sync>;

pub fn host_script<F>(script: F) -> HostScript
where
    F: Fn(&TestHostClient, &Message) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(script)
}

/// [`TestHostManager`] whose "process" is a thread running a script.
pub struct ScriptedTestHost {
    script: HostScript,
    connects: bool,
    exit_stderr: Option<String>,
    extensions: Vec<String>,
    launches: Mutex<Vec<TestProcessStartInfo>>,
    cleanups: AtomicUsize,
}

impl ScriptedTestHost {
    pub fn new(script: HostScript) -> Self {
        Self {
            script,
            connects: true,
            exit_stderr: None,
            extensions: Vec::new(),
            launches: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
        }
    }

    /// A host that launches but never connects back.
    pub fn silent() -> Self {
        Self {
            connects: false,
            ..Self::new(host_script(|_, _| Ok(false)))
        }
    }

    /// Report `stderr` when the script hangs up.
    pub fn with_exit_stderr(mut self, stderr: &str) -> Self {
        self.exit_stderr = Some(stderr.to_string());
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(ToString::to_string).collect();
        self
    }

    pub fn launches(&self) -> Vec<TestProcessStartInfo> {
        self.launches.lock().expect("launches lock").clone()
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl TestHostManager for ScriptedTestHost {
    fn test_host_start_info(
        &self,
        sources: &[String],
        environment_variables: Option<BTreeMap<String, String>>,
        connection: &TestRunnerConnectionInfo,
    ) -> anyhow::Result<TestProcessStartInfo> {
        anyhow::ensure!(!sources.is_empty(), "at least one source is required");
        Ok(TestProcessStartInfo {
            file_name: "scripted-host".to_string(),
            arguments: format!(
                "--port {} --parentprocessid {}",
                connection.port, connection.parent_process_id
            ),
            working_directory: None,
            environment_variables,
        })
    }

    fn launch_test_host(
        &self,
        start_info: &TestProcessStartInfo,
        on_exit: HostExitCallback,
    ) -> anyhow::Result<u32> {
        self.launches.lock().expect("launches lock").push(start_info.clone());
        if !self.connects {
            return Ok(4242);
        }
        let port: u16 = start_info
            .arguments
            .split_whitespace()
            .skip_while(|arg| *arg != "--port")
            .nth(1)
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("no --port in {:?}", start_info.arguments))?;
        let script = Arc::clone(&self.script);
        let exit_stderr = self.exit_stderr.clone();
        thread::spawn(move || {
            if let Ok(client) = TestHostClient::connect(port, Duration::from_secs(5), DEFAULT_MAX_FRAME_BYTES) {
                while let Ok(Some(message)) = client.receive() {
                    if !matches!(script(&client, &message), Ok(true)) {
                        break;
                    }
                }
            }
            on_exit(exit_stderr);
        });
        Ok(4242)
    }

    fn test_platform_extensions(&self, _sources: &[String]) -> anyhow::Result<Vec<String>> {
        Ok(self.extensions.clone())
    }

    fn cleanup(&self) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
