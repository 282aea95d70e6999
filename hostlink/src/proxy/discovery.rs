use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, instrument};

use crate::core::operation::OperationKind;
use crate::core::types::{DiscoveryCriteria, TestMessageLevel};
use crate::events::DiscoveryEventsHandler;
use crate::io::test_host::TestHostManager;
use crate::proxy::operation::{ProxyConfig, ProxyOperationManager};
use crate::sender::TestRequestSender;

/// Discovers tests in a freshly launched test host.
pub struct ProxyDiscoveryManager {
    operation: ProxyOperationManager,
}

impl ProxyDiscoveryManager {
    pub fn new(host: Arc<dyn TestHostManager>, config: ProxyConfig) -> Self {
        Self {
            operation: ProxyOperationManager::new(host, config),
        }
    }

    pub fn with_sender(
        sender: Arc<TestRequestSender>,
        host: Arc<dyn TestHostManager>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            operation: ProxyOperationManager::with_sender(sender, host, config),
        }
    }

    /// Launch the host and start discovery; returns the host process id.
    ///
    /// A setup failure is also reported to `handler` as an aborted discovery.
    #[instrument(skip_all, fields(sources = criteria.sources.len()))]
    pub fn discover_tests(
        &self,
        criteria: &DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<u32> {
        let started = self
            .operation
            .setup_channel(&criteria.sources, OperationKind::Discovery, None)
            .and_then(|pid| {
                self.operation
                    .sender()
                    .discover_tests(criteria, Arc::clone(&handler))
                    .context("start discovery")?;
                Ok(pid)
            });
        if let Err(err) = &started {
            let message = format!("{err:#}");
            error!(err = %message, "discovery setup failed");
            handler.handle_log_message(TestMessageLevel::Error, &message);
            handler.handle_discovery_complete(-1, None, true);
        }
        started
    }

    pub fn close(&self) {
        self.operation.close();
    }
}
