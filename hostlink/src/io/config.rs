//! Runner configuration (`hostlink.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::channel::DEFAULT_MAX_FRAME_BYTES;

/// Runner configuration (TOML).
///
/// Missing fields fall back to defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostlinkConfig {
    /// How long to wait for a launched test host to connect back.
    pub connection_timeout_secs: u64,

    /// Reject frames whose body exceeds this many bytes.
    pub max_frame_bytes: usize,

    /// Keep at most this many bytes of test host stderr.
    pub stderr_limit_bytes: usize,

    pub testhost: TestHostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestHostConfig {
    /// Command line prefix used to launch the test host (e.g. `["hostlink-testhost"]`).
    pub command: Vec<String>,

    /// Files next to the sources whose name contains this are adapter extensions.
    pub adapter_pattern: String,
}

impl Default for TestHostConfig {
    fn default() -> Self {
        Self {
            command: vec!["testhost".to_string()],
            adapter_pattern: ".TestAdapter.".to_string(),
        }
    }
}

impl Default for HostlinkConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 90,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            stderr_limit_bytes: 4096,
            testhost: TestHostConfig::default(),
        }
    }
}

impl HostlinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout_secs == 0 {
            return Err(anyhow!("connection_timeout_secs must be > 0"));
        }
        if self.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be > 0"));
        }
        if self.stderr_limit_bytes == 0 {
            return Err(anyhow!("stderr_limit_bytes must be > 0"));
        }
        if self.testhost.command.is_empty() || self.testhost.command[0].trim().is_empty() {
            return Err(anyhow!("testhost.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HostlinkConfig::default()`.
pub fn load_config(path: &Path) -> Result<HostlinkConfig> {
    if !path.exists() {
        let cfg = HostlinkConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HostlinkConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HostlinkConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
