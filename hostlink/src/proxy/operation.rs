//! Setup shared by discovery and execution proxies: launch, connect, initialize.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::operation::OperationKind;
use crate::core::types::TestProcessStartInfo;
use crate::io::channel::DEFAULT_MAX_FRAME_BYTES;
use crate::io::config::HostlinkConfig;
use crate::io::server::SocketServer;
use crate::io::test_host::{TestHostManager, TestRunnerConnectionInfo};
use crate::sender::TestRequestSender;

/// Rewrites the test host start info right before launch.
pub type StartInfoHook = Box<dyn Fn(TestProcessStartInfo) -> TestProcessStartInfo + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// How long to wait for the launched host to connect.
    pub connection_timeout: Duration,
    /// How long a disconnect waits for the host's exit report.
    pub client_exit_wait: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(90),
            client_exit_wait: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ProxyConfig {
    pub fn from_config(cfg: &HostlinkConfig) -> Self {
        Self {
            connection_timeout: cfg.connection_timeout(),
            max_frame_bytes: cfg.max_frame_bytes,
            ..Self::default()
        }
    }
}

/// Owns one request sender and the test host behind it.
pub struct ProxyOperationManager {
    sender: Arc<TestRequestSender>,
    host: Arc<dyn TestHostManager>,
    config: ProxyConfig,
    host_pid: Mutex<Option<u32>>,
}

impl ProxyOperationManager {
    pub fn new(host: Arc<dyn TestHostManager>, config: ProxyConfig) -> Self {
        let sender = TestRequestSender::with_server(Arc::new(SocketServer::new(config.max_frame_bytes)));
        Self::with_sender(Arc::new(sender), host, config)
    }

    pub fn with_sender(
        sender: Arc<TestRequestSender>,
        host: Arc<dyn TestHostManager>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            sender,
            host,
            config,
            host_pid: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> &Arc<TestRequestSender> {
        &self.sender
    }

    /// Launch the host for `sources` and get it ready for `kind`.
    ///
    /// Returns the host process id. A second call reuses the running host.
    #[instrument(skip_all, fields(%kind, sources = sources.len()))]
    pub fn setup_channel(
        &self,
        sources: &[String],
        kind: OperationKind,
        start_info_hook: Option<&StartInfoHook>,
    ) -> Result<u32> {
        let mut host_pid = self
            .host_pid
            .lock()
            .map_err(|_| anyhow!("proxy state poisoned"))?;
        if let Some(pid) = *host_pid {
            debug!(pid, "reusing test host");
            return Ok(pid);
        }

        let port = self
            .sender
            .initialize_communication()
            .context("initialize communication")?;
        let connection = TestRunnerConnectionInfo {
            port,
            parent_process_id: std::process::id(),
        };
        let mut start_info = self
            .host
            .test_host_start_info(sources, None, &connection)
            .context("build test host start info")?;
        if let Some(hook) = start_info_hook {
            start_info = hook(start_info);
        }

        self.sender.set_client_exit_wait(self.config.client_exit_wait);
        let sender = Arc::downgrade(&self.sender);
        let pid = self
            .host
            .launch_test_host(
                &start_info,
                Box::new(move |stderr| {
                    if let Some(sender) = sender.upgrade() {
                        sender.on_client_process_exit(stderr.as_deref());
                    }
                }),
            )
            .context("launch test host")?;

        if !self.sender.wait_for_connection(self.config.connection_timeout) {
            self.abandon_host();
            bail!(
                "test host (pid {pid}) did not connect within {}s",
                self.config.connection_timeout.as_secs()
            );
        }

        let extensions = match self.initialize_host(sources, kind) {
            Ok(extensions) => extensions,
            Err(err) => {
                self.abandon_host();
                return Err(err);
            }
        };

        info!(pid, extensions, "test host ready");
        *host_pid = Some(pid);
        Ok(pid)
    }

    /// Send the adapter extensions to a connected host; returns how many were sent.
    fn initialize_host(&self, sources: &[String], kind: OperationKind) -> Result<usize> {
        let extensions = self
            .host
            .test_platform_extensions(sources)
            .context("find adapter extensions")?;
        match kind {
            OperationKind::Discovery => self.sender.initialize_discovery(&extensions),
            OperationKind::Execution => self.sender.initialize_execution(&extensions),
        }
        .context("initialize test host")?;
        Ok(extensions.len())
    }

    /// Tear down a launched host that never became ready.
    fn abandon_host(&self) {
        self.sender.close();
        if let Err(err) = self.host.cleanup() {
            warn!(err = %err, "failed to clean up test host");
        }
    }

    /// End the session, stop listening and terminate the host.
    pub fn close(&self) {
        if let Err(err) = self.sender.end_session() {
            warn!(err = %err, "failed to end session");
        }
        self.sender.close();
        if let Err(err) = self.host.cleanup() {
            warn!(err = %err, "failed to clean up test host");
        }
    }
}
