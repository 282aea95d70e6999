//! Test runs with out-of-process data collectors attached.
//!
//! The data collector gets a say before the run starts (environment variables
//! and an events port for the test host) and after it ends (attachments). Any
//! fault on the data collection side is logged and the run goes on without it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, error, instrument};

use crate::core::message::MessageType;
use crate::core::serializer::JsonDataSerializer;
use crate::core::types::{
    AttachmentSet, TestMessageLevel, TestProcessStartInfo, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCompletePayload, TestRunCriteria,
};
use crate::events::{RunEventsHandler, TestMessageEventHandler};
use crate::io::test_host::TestHostManager;
use crate::proxy::execution::ProxyExecutionManager;
use crate::proxy::operation::ProxyConfig;

/// What the data collector needs the test host to know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataCollectionParameters {
    pub are_test_case_level_events_required: bool,
    pub environment_variables: BTreeMap<String, String>,
    pub data_collection_events_port: u16,
}

/// Runner-side handle on the data collection process.
pub trait ProxyDataCollectionManager: Send + Sync {
    fn initialize(&self) -> Result<()>;

    fn before_test_run_start(
        &self,
        reset_data_collectors: bool,
        is_run_starting_now: bool,
        handler: &dyn TestMessageEventHandler,
    ) -> Result<Option<DataCollectionParameters>>;

    /// Returns the attachments collected during the run.
    fn after_test_run_end(
        &self,
        is_canceled: bool,
        handler: &dyn TestMessageEventHandler,
    ) -> Result<Vec<AttachmentSet>>;
}

/// Keeps data collector messages until the run starts and they can be shown.
#[derive(Debug, Default)]
pub struct DataCollectionRunEventsHandler {
    messages: Mutex<Vec<String>>,
}

impl DataCollectionRunEventsHandler {
    pub fn exception_messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn take_messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }

    fn record(&self, message: String) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }
}

impl TestMessageEventHandler for DataCollectionRunEventsHandler {
    fn handle_log_message(&self, _level: TestMessageLevel, message: &str) {
        self.record(message.to_string());
    }

    fn handle_raw_message(&self, _raw_message: &str) {
        debug!("ignoring raw message from data collection");
    }
}

/// Run handler decorator that ends data collection when the run completes and
/// adds the collected attachments to the completion.
pub struct DataCollectionTestRunEventsHandler {
    inner: Arc<dyn RunEventsHandler>,
    data_collection: Arc<dyn ProxyDataCollectionManager>,
    serializer: JsonDataSerializer,
    ended: AtomicBool,
    attachments: Mutex<Option<Vec<AttachmentSet>>>,
}

impl DataCollectionTestRunEventsHandler {
    pub fn new(
        inner: Arc<dyn RunEventsHandler>,
        data_collection: Arc<dyn ProxyDataCollectionManager>,
    ) -> Self {
        Self {
            inner,
            data_collection,
            serializer: JsonDataSerializer::new(),
            ended: AtomicBool::new(false),
            attachments: Mutex::new(None),
        }
    }

    /// End data collection once; later calls return the same attachments.
    fn end_data_collection(&self, is_canceled: bool) -> Option<Vec<AttachmentSet>> {
        if !self.ended.swap(true, Ordering::AcqRel) {
            match self.data_collection.after_test_run_end(is_canceled, self) {
                Ok(attachments) => {
                    debug!(count = attachments.len(), "data collection ended");
                    if let Ok(mut slot) = self.attachments.lock() {
                        *slot = Some(attachments);
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(err = %message, "data collection failed at run end");
                    self.inner.handle_log_message(TestMessageLevel::Error, &message);
                }
            }
        }
        self.attachments.lock().ok().and_then(|slot| slot.clone())
    }

    fn with_attachments(&self, raw_message: &str) -> Result<Option<String>> {
        let message = self
            .serializer
            .deserialize_message(raw_message)
            .context("decode run message")?;
        if message.message_type != MessageType::ExecutionComplete {
            return Ok(None);
        }
        let mut payload: TestRunCompletePayload = self
            .serializer
            .require_payload(&message)
            .context("decode run completion")?;
        let is_canceled = payload
            .test_run_complete_args
            .as_ref()
            .is_some_and(|args| args.is_canceled);
        let Some(collected) = self.end_data_collection(is_canceled) else {
            return Ok(None);
        };
        payload.run_attachments = merge(payload.run_attachments.take(), collected);
        let raw = self
            .serializer
            .serialize_payload(MessageType::ExecutionComplete, &payload)
            .context("encode run completion")?;
        Ok(Some(raw))
    }
}

fn merge(
    existing: Option<Vec<AttachmentSet>>,
    collected: Vec<AttachmentSet>,
) -> Option<Vec<AttachmentSet>> {
    if collected.is_empty() {
        return existing;
    }
    let mut merged = existing.unwrap_or_default();
    merged.extend(collected);
    Some(merged)
}

impl TestMessageEventHandler for DataCollectionTestRunEventsHandler {
    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.inner.handle_log_message(level, message);
    }

    fn handle_raw_message(&self, raw_message: &str) {
        match self.with_attachments(raw_message) {
            Ok(Some(updated)) => self.inner.handle_raw_message(&updated),
            Ok(None) => self.inner.handle_raw_message(raw_message),
            Err(err) => {
                debug!(err = %format!("{err:#}"), "forwarding raw message unchanged");
                self.inner.handle_raw_message(raw_message);
            }
        }
    }
}

impl RunEventsHandler for DataCollectionTestRunEventsHandler {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.inner.handle_test_run_stats_change(args);
    }

    fn handle_test_run_complete(
        &self,
        complete_args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Option<Vec<AttachmentSet>>,
        executor_uris: Option<Vec<String>>,
    ) {
        let run_attachments = match self.end_data_collection(complete_args.is_canceled) {
            Some(collected) => merge(run_attachments, collected),
            None => run_attachments,
        };
        self.inner
            .handle_test_run_complete(complete_args, last_chunk, run_attachments, executor_uris);
    }

    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32> {
        self.inner.launch_process_with_debugger_attached(start_info)
    }
}

/// Add the data collector's environment and events port to the host start info.
pub fn apply_data_collection_parameters(
    mut start_info: TestProcessStartInfo,
    parameters: &DataCollectionParameters,
) -> TestProcessStartInfo {
    start_info
        .environment_variables
        .get_or_insert_with(BTreeMap::new)
        .extend(parameters.environment_variables.clone());
    start_info.arguments = format!(
        "{} --datacollectionport {}",
        start_info.arguments, parameters.data_collection_events_port
    )
    .trim_start()
    .to_string();
    start_info
}

/// [`ProxyExecutionManager`] that brackets the run with data collection.
pub struct ProxyExecutionManagerWithDataCollection {
    execution: ProxyExecutionManager,
    data_collection: Arc<dyn ProxyDataCollectionManager>,
    run_events: Arc<DataCollectionRunEventsHandler>,
    parameters: Arc<Mutex<Option<DataCollectionParameters>>>,
}

impl ProxyExecutionManagerWithDataCollection {
    pub fn new(
        host: Arc<dyn TestHostManager>,
        data_collection: Arc<dyn ProxyDataCollectionManager>,
        config: ProxyConfig,
    ) -> Self {
        Self::from_execution(ProxyExecutionManager::new(host, config), data_collection)
    }

    pub fn from_execution(
        execution: ProxyExecutionManager,
        data_collection: Arc<dyn ProxyDataCollectionManager>,
    ) -> Self {
        let parameters: Arc<Mutex<Option<DataCollectionParameters>>> = Arc::new(Mutex::new(None));
        let hook_parameters = Arc::clone(&parameters);
        let execution = execution.with_start_info_hook(Box::new(move |start_info| {
            match hook_parameters.lock().ok().and_then(|p| p.clone()) {
                Some(parameters) => apply_data_collection_parameters(start_info, &parameters),
                None => start_info,
            }
        }));
        Self {
            execution,
            data_collection,
            run_events: Arc::new(DataCollectionRunEventsHandler::default()),
            parameters,
        }
    }

    pub fn run_events(&self) -> &DataCollectionRunEventsHandler {
        &self.run_events
    }

    /// Start the data collector and let it prepare for the run.
    ///
    /// Only a failure to initialize the data collector is returned; a failure
    /// while preparing is recorded and the run proceeds without collection.
    #[instrument(skip_all)]
    pub fn initialize(&self) -> Result<()> {
        if let Err(err) = self.data_collection.initialize() {
            error!(err = %format!("{err:#}"), "failed to initialize data collection");
            return Err(err).context("initialize data collection");
        }

        match self
            .data_collection
            .before_test_run_start(true, true, self.run_events.as_ref())
        {
            Ok(Some(parameters)) => {
                debug!(port = parameters.data_collection_events_port, "data collection ready");
                if let Ok(mut slot) = self.parameters.lock() {
                    *slot = Some(parameters);
                }
            }
            Ok(None) => debug!("data collection needs no test host changes"),
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "data collection failed before run start, continuing without it");
                self.run_events.record(message);
                if let Err(err) = self
                    .data_collection
                    .after_test_run_end(true, self.run_events.as_ref())
                {
                    error!(err = %format!("{err:#}"), "failed to end data collection");
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn start_test_run(
        &self,
        criteria: &TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<u32> {
        let handler: Arc<dyn RunEventsHandler> = Arc::new(DataCollectionTestRunEventsHandler::new(
            handler,
            Arc::clone(&self.data_collection),
        ));
        for message in self.run_events.take_messages() {
            handler.handle_log_message(TestMessageLevel::Error, &message);
        }
        self.execution.start_test_run(criteria, handler)
    }

    /// Cancel the run; data collection is ended as canceled first.
    pub fn cancel(&self) -> Result<()> {
        let ended = self
            .data_collection
            .after_test_run_end(true, self.run_events.as_ref());
        if let Err(err) = &ended {
            error!(err = %format!("{err:#}"), "failed to end data collection on cancel");
        }
        self.execution.cancel()?;
        ended.map(|_| ()).context("end data collection")
    }

    pub fn abort(&self) -> Result<()> {
        self.execution.abort()
    }

    pub fn close(&self) {
        self.execution.close();
    }
}
