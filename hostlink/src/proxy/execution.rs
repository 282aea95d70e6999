use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, instrument};

use crate::core::operation::OperationKind;
use crate::core::types::{TestMessageLevel, TestRunCompleteEventArgs, TestRunCriteria};
use crate::events::RunEventsHandler;
use crate::io::test_host::TestHostManager;
use crate::proxy::operation::{ProxyConfig, ProxyOperationManager, StartInfoHook};
use crate::sender::TestRequestSender;

/// Runs tests in a freshly launched test host.
pub struct ProxyExecutionManager {
    operation: ProxyOperationManager,
    start_info_hook: Option<StartInfoHook>,
}

impl ProxyExecutionManager {
    pub fn new(host: Arc<dyn TestHostManager>, config: ProxyConfig) -> Self {
        Self {
            operation: ProxyOperationManager::new(host, config),
            start_info_hook: None,
        }
    }

    pub fn with_sender(
        sender: Arc<TestRequestSender>,
        host: Arc<dyn TestHostManager>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            operation: ProxyOperationManager::with_sender(sender, host, config),
            start_info_hook: None,
        }
    }

    /// Amend the host start info (arguments, environment) before launch.
    pub fn with_start_info_hook(mut self, hook: StartInfoHook) -> Self {
        self.start_info_hook = Some(hook);
        self
    }

    /// Launch the host and start the run; returns the host process id.
    ///
    /// A setup failure is also reported to `handler` as an aborted run.
    #[instrument(skip_all)]
    pub fn start_test_run(
        &self,
        criteria: &TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<u32> {
        let started = self
            .operation
            .setup_channel(
                &criteria.sources(),
                OperationKind::Execution,
                self.start_info_hook.as_ref(),
            )
            .and_then(|pid| {
                self.operation
                    .sender()
                    .start_test_run(criteria, Arc::clone(&handler))
                    .context("start test run")?;
                Ok(pid)
            });
        if let Err(err) = &started {
            let message = format!("{err:#}");
            error!(err = %message, "test run setup failed");
            handler.handle_log_message(TestMessageLevel::Error, &message);
            handler.handle_test_run_complete(
                TestRunCompleteEventArgs::aborted(Some(message)),
                None,
                None,
                None,
            );
        }
        started
    }

    pub fn cancel(&self) -> Result<()> {
        self.operation
            .sender()
            .send_test_run_cancel()
            .context("cancel test run")
    }

    pub fn abort(&self) -> Result<()> {
        self.operation
            .sender()
            .send_test_run_abort()
            .context("abort test run")
    }

    pub fn close(&self) {
        self.operation.close();
    }
}
