//! Locating and launching test host processes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::TestProcessStartInfo;
use crate::io::config::HostlinkConfig;
use crate::io::process::ManagedProcess;

/// Where a test host should connect back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestRunnerConnectionInfo {
    pub port: u16,
    pub parent_process_id: u32,
}

/// Receives the captured stderr once the test host exits.
pub type HostExitCallback = Box<dyn FnOnce(Option<String>) + Send>;

/// Launches test hosts for a set of sources.
pub trait TestHostManager: Send + Sync {
    fn test_host_start_info(
        &self,
        sources: &[String],
        environment_variables: Option<BTreeMap<String, String>>,
        connection: &TestRunnerConnectionInfo,
    ) -> Result<TestProcessStartInfo>;

    /// Start the host; returns its process id.
    fn launch_test_host(
        &self,
        start_info: &TestProcessStartInfo,
        on_exit: HostExitCallback,
    ) -> Result<u32>;

    /// Adapter extension paths the host should load for `sources`.
    fn test_platform_extensions(&self, sources: &[String]) -> Result<Vec<String>>;

    /// Terminate the launched host, if any.
    fn cleanup(&self) -> Result<()>;
}

/// [`TestHostManager`] that runs a local command.
#[derive(Debug)]
pub struct ProcessTestHost {
    command: Vec<String>,
    adapter_pattern: String,
    stderr_limit_bytes: usize,
    process: Mutex<Option<ManagedProcess>>,
}

impl ProcessTestHost {
    pub fn new(command: Vec<String>, adapter_pattern: impl Into<String>, stderr_limit_bytes: usize) -> Self {
        Self {
            command,
            adapter_pattern: adapter_pattern.into(),
            stderr_limit_bytes,
            process: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &HostlinkConfig) -> Self {
        Self::new(
            cfg.testhost.command.clone(),
            cfg.testhost.adapter_pattern.clone(),
            cfg.stderr_limit_bytes,
        )
    }
}

impl TestHostManager for ProcessTestHost {
    fn test_host_start_info(
        &self,
        sources: &[String],
        environment_variables: Option<BTreeMap<String, String>>,
        connection: &TestRunnerConnectionInfo,
    ) -> Result<TestProcessStartInfo> {
        let first = sources
            .first()
            .ok_or_else(|| anyhow!("at least one source is required to start a test host"))?;
        let (file_name, prefix_args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("test host command is empty"))?;

        let mut arguments: Vec<String> = prefix_args.to_vec();
        arguments.push("--port".to_string());
        arguments.push(connection.port.to_string());
        arguments.push("--parentprocessid".to_string());
        arguments.push(connection.parent_process_id.to_string());

        let working_directory = Path::new(first)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.display().to_string());

        Ok(TestProcessStartInfo {
            file_name: file_name.clone(),
            arguments: arguments.join(" "),
            working_directory,
            environment_variables,
        })
    }

    #[instrument(skip_all, fields(file_name = %start_info.file_name))]
    fn launch_test_host(
        &self,
        start_info: &TestProcessStartInfo,
        on_exit: HostExitCallback,
    ) -> Result<u32> {
        let mut cmd = Command::new(&start_info.file_name);
        cmd.args(start_info.arguments.split_whitespace());
        if let Some(dir) = &start_info.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(vars) = &start_info.environment_variables {
            cmd.envs(vars);
        }

        let process = ManagedProcess::spawn(
            cmd,
            self.stderr_limit_bytes,
            Box::new(move |exit| {
                debug!(exit_code = ?exit.status.and_then(|s| s.code()), "test host exited");
                on_exit(Some(exit.stderr));
            }),
        )
        .with_context(|| format!("launch test host {}", start_info.file_name))?;

        let pid = process.id();
        info!(pid, "test host launched");
        let mut slot = self
            .process
            .lock()
            .map_err(|_| anyhow!("test host state poisoned"))?;
        *slot = Some(process);
        Ok(pid)
    }

    fn test_platform_extensions(&self, sources: &[String]) -> Result<Vec<String>> {
        let dirs: BTreeSet<PathBuf> = sources
            .iter()
            .map(|source| match Path::new(source).parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            })
            .collect();

        let mut extensions = Vec::new();
        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
            };
            for entry in entries {
                let entry = entry.with_context(|| format!("list {}", dir.display()))?;
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                let matches = entry
                    .file_name()
                    .to_string_lossy()
                    .contains(&self.adapter_pattern);
                if is_file && matches {
                    extensions.push(entry.path().display().to_string());
                }
            }
        }
        extensions.sort();
        debug!(count = extensions.len(), "found adapter extensions");
        Ok(extensions)
    }

    fn cleanup(&self) -> Result<()> {
        let process = self
            .process
            .lock()
            .map_err(|_| anyhow!("test host state poisoned"))?
            .take();
        match process {
            Some(process) => process.terminate().context("terminate test host"),
            None => Ok(()),
        }
    }
}
