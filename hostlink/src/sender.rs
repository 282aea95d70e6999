//! Runner-side session with one test host.
//!
//! A [`TestRequestSender`] owns the communication server, the channel to the
//! connected host and at most one in-flight operation. Messages arriving for
//! that operation are dispatched to its handler on the channel's read thread.
//!
//! ## Completion
//!
//! Every operation signals completion exactly once. Normal completion,
//! disconnect, process exit and dispatch faults all go through
//! [`OperationState::try_complete`]; whoever wins the compare-exchange delivers
//! the completion callback and everybody else backs off. An abnormal end always
//! produces, in order:
//!
//! 1. `handle_log_message(Error, reason)`
//! 2. the raw `TestMessage` envelope carrying that reason
//! 3. a raw synthetic completion envelope marked aborted
//! 4. the typed aborted completion

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::message::{Message, MessageType};
use crate::core::operation::{OperationKind, OperationState};
use crate::core::serializer::JsonDataSerializer;
use crate::core::types::{
    DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestMessageLevel, TestMessagePayload,
    TestProcessStartInfo, TestRunChangedEventArgs, TestRunCompleteEventArgs,
    TestRunCompletePayload, TestRunCriteria,
};
use crate::error::{CommunicationError, RequestError};
use crate::events::{DiscoveryEventsHandler, RunEventsHandler, TestMessageEventHandler};
use crate::io::channel::CommunicationChannel;
use crate::io::server::{CommunicationServer, ServerCallbacks, SocketServer};

/// Abort cause used when the host went away without a more specific error.
pub const HOST_UNREACHABLE: &str = "Unable to communicate with test host process.";

enum OperationHandler {
    Discovery(Arc<dyn DiscoveryEventsHandler>),
    Execution(Arc<dyn RunEventsHandler>),
}

impl OperationHandler {
    fn log(&self, level: TestMessageLevel, message: &str) {
        match self {
            Self::Discovery(handler) => handler.handle_log_message(level, message),
            Self::Execution(handler) => handler.handle_log_message(level, message),
        }
    }

    fn raw(&self, raw_message: &str) {
        match self {
            Self::Discovery(handler) => handler.handle_raw_message(raw_message),
            Self::Execution(handler) => handler.handle_raw_message(raw_message),
        }
    }
}

struct Operation {
    state: OperationState,
    handler: OperationHandler,
}

impl Operation {
    fn discovery(handler: Arc<dyn DiscoveryEventsHandler>) -> Self {
        Self {
            state: OperationState::new(OperationKind::Discovery),
            handler: OperationHandler::Discovery(handler),
        }
    }

    fn execution(handler: Arc<dyn RunEventsHandler>) -> Self {
        Self {
            state: OperationState::new(OperationKind::Execution),
            handler: OperationHandler::Execution(handler),
        }
    }
}

/// State shared with the server and channel callbacks.
struct SenderState {
    serializer: JsonDataSerializer,
    channel: Mutex<Option<Arc<dyn CommunicationChannel>>>,
    connected: Mutex<bool>,
    connected_signal: Condvar,
    operation: Mutex<Option<Arc<Operation>>>,
    client_exited: Mutex<bool>,
    client_exited_signal: Condvar,
    client_exit_wait: Mutex<Duration>,
}

impl SenderState {
    fn new() -> Self {
        Self {
            serializer: JsonDataSerializer::new(),
            channel: Mutex::new(None),
            connected: Mutex::new(false),
            connected_signal: Condvar::new(),
            operation: Mutex::new(None),
            client_exited: Mutex::new(false),
            client_exited_signal: Condvar::new(),
            client_exit_wait: Mutex::new(Duration::ZERO),
        }
    }

    fn channel(&self) -> Option<Arc<dyn CommunicationChannel>> {
        self.channel.lock().ok().and_then(|channel| channel.clone())
    }

    fn current_operation(&self) -> Option<Arc<Operation>> {
        self.operation.lock().ok().and_then(|op| op.clone())
    }

    fn on_connected(&self, channel: Arc<dyn CommunicationChannel>) {
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel);
        }
        if let Ok(mut connected) = self.connected.lock() {
            *connected = true;
        }
        self.connected_signal.notify_all();
        debug!("test host connection ready");
    }

    fn on_disconnected(&self, err: Option<&CommunicationError>) {
        let Some(operation) = self.current_operation() else {
            debug!("disconnected with no active operation");
            return;
        };
        if operation.state.is_completed() {
            return;
        }

        // Prefer the host's own stderr as the abort reason when its exit is imminent.
        let wait = self
            .client_exit_wait
            .lock()
            .map(|wait| *wait)
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            self.wait_for_client_exit(wait);
            if operation.state.is_completed() {
                return;
            }
        }

        let cause = match err {
            None | Some(CommunicationError::PeerClosed) => HOST_UNREACHABLE.to_string(),
            Some(err) => err.to_string(),
        };
        self.abort(&operation, &cause);
    }

    fn wait_for_client_exit(&self, timeout: Duration) {
        let Ok(exited) = self.client_exited.lock() else {
            return;
        };
        if let Err(err) = self
            .client_exited_signal
            .wait_timeout_while(exited, timeout, |exited| !*exited)
        {
            warn!(err = %err, "waiting for test host exit failed");
        }
    }

    fn on_message(&self, operation: &Operation, raw: &str) {
        if operation.state.is_completed() {
            debug!("operation already completed, dropping message");
            return;
        }
        debug!(raw_message = raw, "received message");

        // Raw first so raw-only listeners are never behind typed ones.
        operation.handler.raw(raw);

        if let Err(err) = self.dispatch(operation, raw) {
            self.abort(operation, &format!("{err:#}"));
        }
    }

    fn dispatch(&self, operation: &Operation, raw: &str) -> Result<()> {
        let message = self
            .serializer
            .deserialize_message(raw)
            .context("decode message envelope")?;
        match &operation.handler {
            OperationHandler::Discovery(handler) => {
                self.dispatch_discovery(operation, handler.as_ref(), &message)
            }
            OperationHandler::Execution(handler) => {
                self.dispatch_execution(operation, handler.as_ref(), &message)
            }
        }
    }

    fn dispatch_discovery(
        &self,
        operation: &Operation,
        handler: &dyn DiscoveryEventsHandler,
        message: &Message,
    ) -> Result<()> {
        match message.message_type {
            MessageType::TestCasesFound => {
                let tests: Vec<TestCase> = self.serializer.require_payload(message)?;
                handler.handle_discovered_tests(tests);
            }
            MessageType::DiscoveryComplete => {
                let payload: DiscoveryCompletePayload = self.serializer.require_payload(message)?;
                if operation.state.try_complete() {
                    info!(total_tests = payload.total_tests, aborted = payload.is_aborted, "discovery complete");
                    handler.handle_discovery_complete(
                        payload.total_tests,
                        payload.last_discovered_tests,
                        payload.is_aborted,
                    );
                }
            }
            MessageType::TestMessage => {
                let payload: TestMessagePayload = self.serializer.require_payload(message)?;
                handler.handle_log_message(payload.message_level, &payload.message);
            }
            other => bail!("unexpected message {other} during test discovery"),
        }
        Ok(())
    }

    fn dispatch_execution(
        &self,
        operation: &Operation,
        handler: &dyn RunEventsHandler,
        message: &Message,
    ) -> Result<()> {
        match message.message_type {
            MessageType::TestRunStatsChange => {
                let args: TestRunChangedEventArgs = self.serializer.require_payload(message)?;
                handler.handle_test_run_stats_change(args);
            }
            MessageType::ExecutionComplete => {
                let payload: TestRunCompletePayload = self.serializer.require_payload(message)?;
                let args = payload
                    .test_run_complete_args
                    .context("execution complete message carries no completion arguments")?;
                if operation.state.try_complete() {
                    info!(aborted = args.is_aborted, canceled = args.is_canceled, "test run complete");
                    handler.handle_test_run_complete(
                        args,
                        payload.last_run_tests,
                        payload.run_attachments,
                        payload.executor_uris,
                    );
                }
            }
            MessageType::TestMessage => {
                let payload: TestMessagePayload = self.serializer.require_payload(message)?;
                handler.handle_log_message(payload.message_level, &payload.message);
            }
            MessageType::LaunchAdapterProcessWithDebuggerAttached => {
                let start_info: TestProcessStartInfo = self.serializer.require_payload(message)?;
                let pid = handler
                    .launch_process_with_debugger_attached(start_info)
                    .context("launch process with debugger attached")?;
                let reply = self.serializer.serialize_payload(
                    MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback,
                    &pid,
                )?;
                let channel = self.channel().context("no channel to reply on")?;
                channel.send(&reply)?;
            }
            other => bail!("unexpected message {other} during test run"),
        }
        Ok(())
    }

    fn abort(&self, operation: &Operation, cause: &str) {
        if operation.state.try_complete() {
            self.complete_aborted(operation, cause);
        }
    }

    /// Emit the abort sequence. The caller must have won `try_complete`.
    fn complete_aborted(&self, operation: &Operation, cause: &str) {
        let reason = abort_reason(operation.state.kind(), cause);
        error!(kind = %operation.state.kind(), cause, "aborting operation");
        self.log_and_echo(&operation.handler, TestMessageLevel::Error, &reason);
        self.deliver_aborted(operation, reason, true);
    }

    /// Typed aborted completion, preceded by its raw echo when `echo` is set.
    fn deliver_aborted(&self, operation: &Operation, reason: String, echo: bool) {
        match &operation.handler {
            OperationHandler::Discovery(handler) => {
                if echo {
                    let payload = DiscoveryCompletePayload {
                        total_tests: -1,
                        last_discovered_tests: None,
                        is_aborted: true,
                    };
                    self.echo(handler.as_ref(), MessageType::DiscoveryComplete, &payload);
                }
                handler.handle_discovery_complete(-1, None, true);
            }
            OperationHandler::Execution(handler) => {
                let args = TestRunCompleteEventArgs::aborted(Some(reason));
                if echo {
                    let payload = TestRunCompletePayload {
                        test_run_complete_args: Some(args.clone()),
                        ..TestRunCompletePayload::default()
                    };
                    self.echo(handler.as_ref(), MessageType::ExecutionComplete, &payload);
                }
                handler.handle_test_run_complete(args, None, None, None);
            }
        }
    }

    fn log_and_echo(&self, handler: &OperationHandler, level: TestMessageLevel, message: &str) {
        handler.log(level, message);
        let payload = TestMessagePayload {
            message_level: level,
            message: message.to_string(),
        };
        match self.serializer.serialize_payload(MessageType::TestMessage, &payload) {
            Ok(raw) => handler.raw(&raw),
            Err(err) => warn!(err = %err, "failed to encode log message echo"),
        }
    }

    fn echo<H, T>(&self, handler: &H, kind: MessageType, payload: &T)
    where
        H: TestMessageEventHandler + ?Sized,
        T: Serialize,
    {
        match self.serializer.serialize_payload(kind, payload) {
            Ok(raw) => handler.handle_raw_message(&raw),
            Err(err) => warn!(err = %err, %kind, "failed to encode synthetic message"),
        }
    }
}

fn abort_reason(kind: OperationKind, cause: &str) -> String {
    match kind {
        OperationKind::Discovery => format!("The active test discovery was aborted. Reason: {cause}"),
        OperationKind::Execution => format!("The active test run was aborted. Reason: {cause}"),
    }
}

/// Drives discovery and execution requests against one test host.
pub struct TestRequestSender {
    server: Arc<dyn CommunicationServer>,
    state: Arc<SenderState>,
    disposed: AtomicBool,
}

impl Default for TestRequestSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRequestSender {
    pub fn new() -> Self {
        Self::with_server(Arc::new(SocketServer::default()))
    }

    pub fn with_server(server: Arc<dyn CommunicationServer>) -> Self {
        Self {
            server,
            state: Arc::new(SenderState::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// How long a disconnect waits for the host's exit report before aborting.
    ///
    /// Zero (the default) aborts immediately. Set this when a process exit
    /// callback is wired to [`Self::on_client_process_exit`] so crashes are
    /// reported with the host's stderr.
    pub fn set_client_exit_wait(&self, wait: Duration) {
        if let Ok(mut slot) = self.state.client_exit_wait.lock() {
            *slot = wait;
        }
    }

    /// Start listening for the test host; returns the port it must connect to.
    #[instrument(skip_all)]
    pub fn initialize_communication(&self) -> Result<u16, RequestError> {
        self.ensure_live()?;
        let connected = Arc::downgrade(&self.state);
        let disconnected = Weak::clone(&connected);
        let callbacks = ServerCallbacks {
            on_connected: Box::new(move |channel| {
                if let Some(state) = connected.upgrade() {
                    state.on_connected(channel);
                }
            }),
            on_disconnected: Box::new(move |err| {
                if let Some(state) = disconnected.upgrade() {
                    state.on_disconnected(err);
                }
            }),
        };

        let connection = self.server.start(callbacks)?;
        let port = connection
            .parse::<u16>()
            .map_err(|_| RequestError::InvalidConnectionString(connection.clone()))?;
        info!(port, "communication initialized");
        Ok(port)
    }

    /// Block until the host connects or `timeout` elapses.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let Ok(connected) = self.state.connected.lock() else {
            return false;
        };
        match self
            .state
            .connected_signal
            .wait_timeout_while(connected, timeout, |connected| !*connected)
        {
            Ok((connected, _)) => *connected,
            Err(_) => false,
        }
    }

    pub fn initialize_discovery(&self, extension_paths: &[String]) -> Result<(), RequestError> {
        self.send_payload(MessageType::DiscoveryInitialize, &extension_paths)
    }

    pub fn initialize_execution(&self, extension_paths: &[String]) -> Result<(), RequestError> {
        self.send_payload(MessageType::ExecutionInitialize, &extension_paths)
    }

    /// Start discovery. Returns once the request is sent; results arrive on `handler`.
    #[instrument(skip_all, fields(sources = criteria.sources.len()))]
    pub fn discover_tests(
        &self,
        criteria: &DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<(), RequestError> {
        self.ensure_live()?;
        if criteria.sources.is_empty() {
            return Err(RequestError::InvalidCriteria("discovery requires at least one source"));
        }
        let request = self
            .state
            .serializer
            .serialize_payload(MessageType::StartDiscovery, criteria)?;
        self.start_operation(Operation::discovery(handler), &request)
    }

    /// Start a run. Returns once the request is sent; results arrive on `handler`.
    #[instrument(skip_all)]
    pub fn start_test_run(
        &self,
        criteria: &TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<(), RequestError> {
        self.ensure_live()?;
        let serializer = &self.state.serializer;
        let request = match criteria {
            TestRunCriteria::Sources(criteria) => {
                if criteria.adapter_source_map.values().all(Vec::is_empty) {
                    return Err(RequestError::InvalidCriteria("test run requires at least one source"));
                }
                serializer.serialize_payload(MessageType::StartTestExecutionWithSources, criteria)?
            }
            TestRunCriteria::Tests(criteria) => {
                if criteria.tests.is_empty() {
                    return Err(RequestError::InvalidCriteria("test run requires at least one test"));
                }
                serializer.serialize_payload(MessageType::StartTestExecutionWithTests, criteria)?
            }
        };
        self.start_operation(Operation::execution(handler), &request)
    }

    pub fn send_test_run_cancel(&self) -> Result<(), RequestError> {
        debug!("sending cancel");
        self.send_signal(MessageType::CancelTestRun)
    }

    pub fn send_test_run_abort(&self) -> Result<(), RequestError> {
        debug!("sending abort");
        self.send_signal(MessageType::AbortTestRun)
    }

    /// Ask the host to shut down, unless the current operation already completed.
    pub fn end_session(&self) -> Result<(), RequestError> {
        if self
            .state
            .current_operation()
            .is_some_and(|operation| operation.state.is_completed())
        {
            debug!("operation complete, not sending session end");
            return Ok(());
        }
        if self.state.channel().is_none() {
            debug!("no test host connected, not sending session end");
            return Ok(());
        }
        self.send_signal(MessageType::SessionEnd)
    }

    /// Report that the host process exited with `stderr` as its captured error output.
    #[instrument(skip_all)]
    pub fn on_client_process_exit(&self, stderr: Option<&str>) {
        let stderr = stderr.filter(|text| !text.trim().is_empty());
        // Claim completion before waking a disconnect waiting on this exit.
        let operation = stderr
            .and_then(|_| self.state.current_operation())
            .filter(|operation| operation.state.try_complete());

        if let Ok(mut exited) = self.state.client_exited.lock() {
            *exited = true;
        }
        self.state.client_exited_signal.notify_all();

        let (Some(stderr), Some(operation)) = (stderr, operation) else {
            debug!("test host exit needs no action");
            return;
        };
        warn!(stderr, "test host exited with error output");
        // The stderr line is the user-visible report; the completion carries the reason.
        self.state
            .log_and_echo(&operation.handler, TestMessageLevel::Error, stderr);
        let reason = abort_reason(operation.state.kind(), stderr);
        self.state.deliver_aborted(&operation, reason, false);
    }

    /// Detach the current operation and stop the server. Idempotent.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut operation) = self.state.operation.lock() {
            operation.take();
        }
        if let Some(channel) = self.state.channel() {
            channel.set_message_received(None);
        }
        self.server.stop();
        info!("closing the connection");
    }

    pub fn dispose(&self) {
        self.close();
    }

    fn ensure_live(&self) -> Result<(), RequestError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RequestError::Disposed);
        }
        Ok(())
    }

    fn connected_channel(&self) -> Result<Arc<dyn CommunicationChannel>, RequestError> {
        self.ensure_live()?;
        self.state.channel().ok_or(RequestError::NotConnected)
    }

    fn start_operation(&self, operation: Operation, request: &str) -> Result<(), RequestError> {
        let channel = self.connected_channel()?;
        let operation = Arc::new(operation);
        {
            let mut current = self
                .state
                .operation
                .lock()
                .map_err(|_| RequestError::Disposed)?;
            if let Some(active) = current.as_ref()
                && !active.state.is_completed()
            {
                return Err(RequestError::OperationInProgress(active.state.kind()));
            }
            *current = Some(Arc::clone(&operation));
        }

        let state = Arc::downgrade(&self.state);
        let subscribed = Arc::clone(&operation);
        channel.set_message_received(Some(Arc::new(move |raw: &str| {
            if let Some(state) = state.upgrade() {
                state.on_message(&subscribed, raw);
            }
        })));

        info!(kind = %operation.state.kind(), "starting operation");
        if let Err(err) = channel.send(request) {
            self.state.abort(&operation, &err.to_string());
        }
        Ok(())
    }

    fn send_payload<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
    ) -> Result<(), RequestError> {
        let channel = self.connected_channel()?;
        let raw = self.state.serializer.serialize_payload(kind, payload)?;
        channel.send(&raw)?;
        Ok(())
    }

    fn send_signal(&self, kind: MessageType) -> Result<(), RequestError> {
        let channel = self.connected_channel()?;
        let raw = self.state.serializer.serialize_message(kind)?;
        channel.send(&raw)?;
        Ok(())
    }
}

impl Drop for TestRequestSender {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TestOutcome, TestRunCriteriaWithSources, TestRunStatistics};
    use crate::test_support::{
        FakeChannel, FakeServer, HandlerEvent, RecordingDiscoveryHandler, RecordingRunHandler,
        test_case, test_result,
    };
    use std::collections::BTreeMap;
    use std::thread;

    fn connected_sender() -> (TestRequestSender, Arc<FakeServer>, Arc<FakeChannel>) {
        let channel = FakeChannel::new();
        let server = FakeServer::new(Arc::clone(&channel));
        let sender = TestRequestSender::with_server(Arc::clone(&server) as Arc<dyn CommunicationServer>);
        assert_eq!(sender.initialize_communication().expect("initialize"), 12345);
        assert!(sender.wait_for_connection(Duration::ZERO));
        (sender, server, channel)
    }

    fn envelope<T: Serialize>(kind: MessageType, payload: &T) -> String {
        JsonDataSerializer::new()
            .serialize_payload(kind, payload)
            .expect("encode")
    }

    fn raw_kinds(raws: &[String]) -> Vec<MessageType> {
        let serializer = JsonDataSerializer::new();
        raws.iter()
            .map(|raw| serializer.deserialize_message(raw).expect("decode").message_type)
            .collect()
    }

    fn run_criteria() -> TestRunCriteria {
        TestRunCriteria::Sources(TestRunCriteriaWithSources {
            adapter_source_map: BTreeMap::from([(
                "_none_".to_string(),
                vec!["a.tests".to_string()],
            )]),
            run_settings: String::new(),
            test_execution_context: Default::default(),
        })
    }

    fn complete_payload(args: TestRunCompleteEventArgs) -> TestRunCompletePayload {
        TestRunCompletePayload {
            test_run_complete_args: Some(args),
            ..TestRunCompletePayload::default()
        }
    }

    fn normal_completion() -> TestRunCompleteEventArgs {
        TestRunCompleteEventArgs {
            test_run_statistics: Some(TestRunStatistics::default()),
            is_canceled: false,
            is_aborted: false,
            error: None,
            attachment_sets: None,
            elapsed_time_in_running_tests: Duration::from_millis(5),
        }
    }

    fn started_discovery() -> (TestRequestSender, Arc<FakeServer>, Arc<FakeChannel>, Arc<RecordingDiscoveryHandler>) {
        let (sender, server, channel) = connected_sender();
        let handler = RecordingDiscoveryHandler::new();
        sender
            .discover_tests(
                &DiscoveryCriteria::new(vec!["a.tests".to_string()]),
                Arc::clone(&handler) as Arc<dyn DiscoveryEventsHandler>,
            )
            .expect("discover");
        (sender, server, channel, handler)
    }

    fn started_run() -> (TestRequestSender, Arc<FakeServer>, Arc<FakeChannel>, Arc<RecordingRunHandler>) {
        let (sender, server, channel) = connected_sender();
        let handler = RecordingRunHandler::new();
        sender
            .start_test_run(&run_criteria(), Arc::clone(&handler) as Arc<dyn RunEventsHandler>)
            .expect("start run");
        (sender, server, channel, handler)
    }

    /// Found tests and the completion are delivered once, raw before typed;
    /// anything after completion is dropped.
    #[test]
    fn discovery_delivers_tests_then_single_completion() {
        let (_sender, _server, channel, handler) = started_discovery();
        assert_eq!(channel.sent_kinds(), vec![MessageType::StartDiscovery]);

        let found = vec![test_case("t1", "a.tests"), test_case("t2", "a.tests")];
        let found_raw = envelope(MessageType::TestCasesFound, &found);
        channel.raise(&found_raw);
        let complete_raw = envelope(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: 10,
                last_discovered_tests: None,
                is_aborted: true,
            },
        );
        channel.raise(&complete_raw);
        channel.raise(&found_raw);

        assert_eq!(
            handler.events(),
            vec![
                HandlerEvent::Raw(found_raw),
                HandlerEvent::DiscoveredTests(found),
                HandlerEvent::Raw(complete_raw),
                HandlerEvent::DiscoveryComplete {
                    total_tests: 10,
                    last_chunk: None,
                    is_aborted: true,
                },
            ]
        );
    }

    #[test]
    fn log_messages_reach_the_handler() {
        let (_sender, _server, channel, handler) = started_discovery();
        channel.raise(&envelope(
            MessageType::TestMessage,
            &TestMessagePayload {
                message_level: TestMessageLevel::Warning,
                message: "careful".to_string(),
            },
        ));
        assert_eq!(handler.logs(), vec![(TestMessageLevel::Warning, "careful".to_string())]);
        assert!(handler.completions().is_empty());
    }

    #[test]
    fn discovery_without_connection_is_rejected() {
        let channel = FakeChannel::new();
        let server = FakeServer::without_client(Arc::clone(&channel));
        let sender = TestRequestSender::with_server(server);
        sender.initialize_communication().expect("initialize");
        assert!(!sender.wait_for_connection(Duration::from_millis(10)));

        let err = sender
            .discover_tests(
                &DiscoveryCriteria::new(vec!["a.tests".to_string()]),
                RecordingDiscoveryHandler::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RequestError::NotConnected));
    }

    #[test]
    fn late_connection_wakes_waiter() {
        let channel = FakeChannel::new();
        let server = FakeServer::without_client(Arc::clone(&channel));
        let sender = TestRequestSender::with_server(Arc::clone(&server) as Arc<dyn CommunicationServer>);
        sender.initialize_communication().expect("initialize");
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                server.connect();
            });
            assert!(sender.wait_for_connection(Duration::from_secs(5)));
        });
    }

    #[test]
    fn empty_criteria_are_rejected() {
        let (sender, _server, channel) = connected_sender();
        let err = sender
            .discover_tests(&DiscoveryCriteria::new(Vec::new()), RecordingDiscoveryHandler::new())
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidCriteria(_)));

        let criteria = TestRunCriteria::Tests(crate::core::types::TestRunCriteriaWithTests {
            tests: Vec::new(),
            run_settings: String::new(),
            test_execution_context: Default::default(),
        });
        let err = sender
            .start_test_run(&criteria, RecordingRunHandler::new())
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidCriteria(_)));
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn second_operation_waits_for_completion_of_the_first() {
        let (sender, _server, channel, _handler) = started_discovery();
        let err = sender
            .start_test_run(&run_criteria(), RecordingRunHandler::new())
            .unwrap_err();
        assert!(matches!(err, RequestError::OperationInProgress(OperationKind::Discovery)));

        channel.raise(&envelope(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: 0,
                last_discovered_tests: None,
                is_aborted: false,
            },
        ));
        sender
            .start_test_run(&run_criteria(), RecordingRunHandler::new())
            .expect("run after discovery");
        assert_eq!(
            channel.sent_kinds(),
            vec![MessageType::StartDiscovery, MessageType::StartTestExecutionWithSources]
        );
    }

    #[test]
    fn run_with_explicit_tests_uses_tests_request() {
        let (sender, _server, channel) = connected_sender();
        let criteria = TestRunCriteria::Tests(crate::core::types::TestRunCriteriaWithTests {
            tests: vec![test_case("t1", "a.tests")],
            run_settings: String::new(),
            test_execution_context: Default::default(),
        });
        sender
            .start_test_run(&criteria, RecordingRunHandler::new())
            .expect("start");
        assert_eq!(channel.sent_kinds(), vec![MessageType::StartTestExecutionWithTests]);
    }

    #[test]
    fn run_reports_stats_and_completion() {
        let (_sender, _server, channel, handler) = started_run();
        let results = vec![test_result("t1", "a.tests", TestOutcome::Passed)];
        let stats = TestRunChangedEventArgs {
            test_run_statistics: Some(TestRunStatistics::from_results(&results)),
            new_test_results: Some(results.clone()),
            active_tests: None,
        };
        channel.raise(&envelope(MessageType::TestRunStatsChange, &stats));
        let mut payload = complete_payload(normal_completion());
        payload.executor_uris = Some(vec!["executor://hostlink/reference".to_string()]);
        channel.raise(&envelope(MessageType::ExecutionComplete, &payload));

        assert_eq!(handler.results(), results);
        assert_eq!(
            handler.completions(),
            vec![HandlerEvent::RunComplete {
                args: normal_completion(),
                last_chunk: None,
                run_attachments: None,
                executor_uris: Some(vec!["executor://hostlink/reference".to_string()]),
            }]
        );
    }

    /// The callback reply is on the wire before the next frame is dispatched.
    #[test]
    fn debugger_launch_is_answered_synchronously() {
        let (_sender, _server, channel, handler) = started_run();
        let start_info = TestProcessStartInfo {
            file_name: "adapter".to_string(),
            arguments: "--run".to_string(),
            ..TestProcessStartInfo::default()
        };
        channel.raise(&envelope(MessageType::LaunchAdapterProcessWithDebuggerAttached, &start_info));

        assert_eq!(
            channel.sent().last().cloned(),
            Some(envelope(MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback, &4321))
        );
        assert!(handler.events().contains(&HandlerEvent::LaunchDebugger(start_info)));
        assert!(handler.completions().is_empty());
    }

    #[test]
    fn failed_debugger_launch_aborts_run() {
        let (sender, _server, channel) = connected_sender();
        let handler = RecordingRunHandler::with_debugger_pid(None);
        sender
            .start_test_run(&run_criteria(), Arc::clone(&handler) as Arc<dyn RunEventsHandler>)
            .expect("start");
        channel.raise(&envelope(
            MessageType::LaunchAdapterProcessWithDebuggerAttached,
            &TestProcessStartInfo::default(),
        ));

        let args = handler.complete_args().expect("completion");
        assert!(args.is_aborted);
        assert!(args.error.expect("error").contains("debugger is not available"));
        assert_eq!(channel.sent_kinds(), vec![MessageType::StartTestExecutionWithSources]);
    }

    /// A frame that fails to decode produces the full abort sequence.
    #[test]
    fn decode_fault_aborts_run() {
        let (_sender, _server, channel, handler) = started_run();
        channel.raise("not json");

        let events = handler.events();
        assert_eq!(events.len(), 5, "{events:#?}");
        assert_eq!(events[0], HandlerEvent::Raw("not json".to_string()));
        let HandlerEvent::Log(TestMessageLevel::Error, reason) = &events[1] else {
            panic!("expected error log, got {:?}", events[1]);
        };
        assert!(reason.starts_with("The active test run was aborted. Reason: decode message envelope"));
        assert_eq!(
            raw_kinds(&handler.raw_messages()[1..]),
            vec![MessageType::TestMessage, MessageType::ExecutionComplete]
        );
        assert_eq!(
            events[4],
            HandlerEvent::RunComplete {
                args: TestRunCompleteEventArgs::aborted(Some(reason.clone())),
                last_chunk: None,
                run_attachments: None,
                executor_uris: None,
            }
        );
    }

    /// An out-of-range time span in a completion aborts the run instead of
    /// taking down the read thread.
    #[test]
    fn oversized_elapsed_time_aborts_run() {
        let (_sender, _server, channel, handler) = started_run();
        let mut raw: serde_json::Value = serde_json::from_str(&envelope(
            MessageType::ExecutionComplete,
            &complete_payload(normal_completion()),
        ))
        .expect("json");
        raw["Payload"]["TestRunCompleteArgs"]["ElapsedTimeInRunningTests"] =
            serde_json::Value::String("99999999999999999:00:00".to_string());
        channel.raise(&raw.to_string());

        let completions = handler.completions();
        assert_eq!(completions.len(), 1);
        let args = handler.complete_args().expect("completion");
        assert!(args.is_aborted);
        assert!(
            args.error
                .expect("error")
                .starts_with("The active test run was aborted. Reason: ")
        );
    }

    #[test]
    fn unexpected_kind_aborts_discovery() {
        let (_sender, _server, channel, handler) = started_discovery();
        channel.raise(&envelope(MessageType::TestRunStatsChange, &TestRunChangedEventArgs::default()));

        let logs = handler.logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].1.contains("unexpected message TestExecution.StatsChange"));
        assert_eq!(
            handler.completions(),
            vec![HandlerEvent::DiscoveryComplete {
                total_tests: -1,
                last_chunk: None,
                is_aborted: true,
            }]
        );
    }

    #[test]
    fn completion_without_arguments_aborts_run() {
        let (_sender, _server, channel, handler) = started_run();
        channel.raise(&envelope(MessageType::ExecutionComplete, &TestRunCompletePayload::default()));
        assert!(handler.complete_args().expect("completion").is_aborted);
    }

    #[test]
    fn process_exit_with_stderr_aborts_run() {
        let (sender, _server, _channel, handler) = started_run();
        sender.on_client_process_exit(Some("boom"));

        assert_eq!(handler.logs(), vec![(TestMessageLevel::Error, "boom".to_string())]);
        assert_eq!(
            handler.raw_messages(),
            vec![envelope(
                MessageType::TestMessage,
                &TestMessagePayload {
                    message_level: TestMessageLevel::Error,
                    message: "boom".to_string(),
                }
            )]
        );
        let completions = handler.completions();
        assert_eq!(completions.len(), 1);
        let HandlerEvent::RunComplete { args, last_chunk, run_attachments, executor_uris } = &completions[0] else {
            panic!("expected run completion");
        };
        assert!(args.is_aborted);
        assert_eq!(args.error.as_deref(), Some("The active test run was aborted. Reason: boom"));
        assert_eq!((last_chunk, run_attachments, executor_uris), (&None, &None, &None));
    }

    #[test]
    fn process_exit_without_stderr_is_ignored() {
        let (sender, _server, _channel, handler) = started_run();
        sender.on_client_process_exit(Some("  \n"));
        sender.on_client_process_exit(None);
        assert!(handler.events().is_empty());
    }

    #[test]
    fn process_exit_after_completion_is_ignored() {
        let (sender, _server, channel, handler) = started_run();
        channel.raise(&envelope(MessageType::ExecutionComplete, &complete_payload(normal_completion())));
        sender.on_client_process_exit(Some("late"));
        assert_eq!(handler.completions().len(), 1);
        assert!(handler.logs().is_empty());
    }

    #[test]
    fn disconnect_aborts_discovery() {
        let (_sender, server, _channel, handler) = started_discovery();
        server.disconnect(None);

        assert_eq!(
            handler.logs(),
            vec![(
                TestMessageLevel::Error,
                format!("The active test discovery was aborted. Reason: {HOST_UNREACHABLE}")
            )]
        );
        let raws = handler.raw_messages();
        assert_eq!(
            raws[1],
            envelope(
                MessageType::DiscoveryComplete,
                &DiscoveryCompletePayload {
                    total_tests: -1,
                    last_discovered_tests: None,
                    is_aborted: true,
                }
            )
        );
        assert_eq!(handler.completions().len(), 1);
    }

    #[test]
    fn disconnect_error_text_becomes_abort_cause() {
        let (_sender, server, _channel, handler) = started_run();
        server.disconnect(Some(CommunicationError::InvalidFrame("bad prefix".to_string())));
        let args = handler.complete_args().expect("completion");
        assert_eq!(
            args.error.as_deref(),
            Some("The active test run was aborted. Reason: invalid frame: bad prefix")
        );
    }

    #[test]
    fn disconnect_waits_for_exit_report() {
        let (sender, server, _channel, handler) = started_run();
        sender.set_client_exit_wait(Duration::from_secs(5));
        thread::scope(|scope| {
            scope.spawn(|| server.disconnect(Some(CommunicationError::PeerClosed)));
            thread::sleep(Duration::from_millis(20));
            sender.on_client_process_exit(Some("segfault"));
        });
        let args = handler.complete_args().expect("completion");
        assert_eq!(
            args.error.as_deref(),
            Some("The active test run was aborted. Reason: segfault")
        );
        assert_eq!(handler.completions().len(), 1);
    }

    #[test]
    fn disconnect_after_completion_is_ignored() {
        let (_sender, server, channel, handler) = started_discovery();
        channel.raise(&envelope(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: 1,
                last_discovered_tests: None,
                is_aborted: false,
            },
        ));
        server.disconnect(Some(CommunicationError::PeerClosed));
        assert_eq!(handler.completions().len(), 1);
        assert!(handler.logs().is_empty());
    }

    /// Completion, disconnect and process exit racing each other complete once.
    #[test]
    fn racing_triggers_complete_once() {
        for _ in 0..20 {
            let (sender, server, channel, handler) = started_run();
            let complete = envelope(MessageType::ExecutionComplete, &complete_payload(normal_completion()));
            thread::scope(|scope| {
                scope.spawn(|| channel.raise(&complete));
                scope.spawn(|| server.disconnect(Some(CommunicationError::PeerClosed)));
                scope.spawn(|| sender.on_client_process_exit(Some("crash")));
                scope.spawn(|| channel.raise("garbage"));
            });
            assert_eq!(handler.completions().len(), 1);
        }
    }

    #[test]
    fn end_session_is_suppressed_after_completion() {
        let (sender, _server, channel) = connected_sender();
        sender.end_session().expect("end before operation");
        assert_eq!(channel.sent_kinds(), vec![MessageType::SessionEnd]);

        let handler = RecordingDiscoveryHandler::new();
        sender
            .discover_tests(
                &DiscoveryCriteria::new(vec!["a.tests".to_string()]),
                Arc::clone(&handler) as Arc<dyn DiscoveryEventsHandler>,
            )
            .expect("discover");
        sender.end_session().expect("end mid operation");
        channel.raise(&envelope(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: 0,
                last_discovered_tests: None,
                is_aborted: false,
            },
        ));
        sender.end_session().expect("end after completion");
        assert_eq!(
            channel.sent_kinds(),
            vec![MessageType::SessionEnd, MessageType::StartDiscovery, MessageType::SessionEnd]
        );
    }

    #[test]
    fn cancel_and_abort_are_signals_that_do_not_complete() {
        let (sender, _server, channel, handler) = started_run();
        sender.send_test_run_cancel().expect("cancel");
        sender.send_test_run_abort().expect("abort");
        assert_eq!(
            channel.sent_kinds(),
            vec![
                MessageType::StartTestExecutionWithSources,
                MessageType::CancelTestRun,
                MessageType::AbortTestRun,
            ]
        );
        assert!(channel.sent()[1].ends_with(r#""Payload":null}"#));
        assert!(handler.completions().is_empty());
    }

    #[test]
    fn initialize_sends_extension_paths() {
        let (sender, _server, channel) = connected_sender();
        sender
            .initialize_discovery(&["a.TestAdapter.dll".to_string()])
            .expect("initialize discovery");
        sender.initialize_execution(&[]).expect("initialize execution");
        assert_eq!(
            channel.sent(),
            vec![
                r#"{"MessageType":"TestDiscovery.Initialize","Payload":["a.TestAdapter.dll"]}"#.to_string(),
                r#"{"MessageType":"TestExecution.Initialize","Payload":[]}"#.to_string(),
            ]
        );
    }

    /// A start request that cannot be sent aborts the registered operation.
    #[test]
    fn failed_start_request_aborts_operation() {
        let (sender, _server, channel) = connected_sender();
        channel.set_fail_sends(true);
        let handler = RecordingDiscoveryHandler::new();
        sender
            .discover_tests(
                &DiscoveryCriteria::new(vec!["a.tests".to_string()]),
                Arc::clone(&handler) as Arc<dyn DiscoveryEventsHandler>,
            )
            .expect("failure is reported through the handler");
        assert_eq!(handler.completions().len(), 1);
        assert!(handler.logs()[0].1.contains("fake channel closed"));

        let err = sender.send_test_run_cancel().unwrap_err();
        assert!(matches!(err, RequestError::Communication(CommunicationError::Send(_))));
    }

    #[test]
    fn close_is_idempotent_and_detaches_operation() {
        let (sender, server, channel, handler) = started_run();
        sender.close();
        sender.dispose();
        assert_eq!(server.stop_count(), 1);
        assert!(!channel.is_subscribed());

        channel.raise(&envelope(MessageType::ExecutionComplete, &complete_payload(normal_completion())));
        sender.on_client_process_exit(Some("late crash"));
        assert!(handler.events().is_empty());

        let err = sender
            .start_test_run(&run_criteria(), RecordingRunHandler::new())
            .unwrap_err();
        assert!(matches!(err, RequestError::Disposed));
        drop(sender);
        assert_eq!(server.stop_count(), 1);
    }

    #[test]
    fn drop_stops_server() {
        let (sender, server, _channel) = connected_sender();
        drop(sender);
        assert_eq!(server.stop_count(), 1);
    }
}
