//! Configuration system for profit.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PROFIT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/profit/config.toml
//!   3. ~/.config/profit/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::POLL_INTERVAL_SECS;
use crate::run::{DEFAULT_SHELL, HARDKILL_TIMEOUT_SECS};
use crate::wire::{CONNECT_TIMEOUT_SECS, KEEP_ALIVE_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfitConfig {
    pub runner: RunnerConfig,
    pub transport: TransportConfig,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend URL, e.g. `local://`, `ssh://user@host:22/scratch`, `slurm://host/scratch`.
    pub url: String,
    /// SSH identity file passed with `-i`.
    pub identity_file: Option<PathBuf>,
    /// Worker binary invoked on the far side of the SSH link.
    pub remote_command: String,
    /// Concurrent job slots on the run channel. 0 = worker's available parallelism.
    pub max_jobs: u32,
    /// Jobs bundled into one scheduler submission.
    pub batch_size: usize,
    /// Parallel channels in each transfer pool.
    pub transfer_channels: usize,
    /// Delete remote state after each batch.
    pub do_cleanup: bool,
    /// Extra scheduler header lines for queueing backends.
    pub header_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    /// Keep-alive cadence. 0 = disabled.
    pub keep_alive_secs: u64,
    /// Bound on each teardown step (batch terminate, channel close).
    pub close_timeout_secs: u64,
    /// Bound on waiting for a kill acknowledgement.
    pub kill_timeout_secs: u64,
    /// Bound on blocking cleanup calls.
    pub cleanup_timeout_secs: u64,
    /// Attempts per file request before the transfer fails.
    pub transfer_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub shell: String,
    pub hardkill_timeout_secs: u64,
    /// Parent of temporary transfer roots. Empty = system temp dir.
    pub work_dir: PathBuf,
    /// Directory holding the scheduler commands. Empty = search `PATH`.
    pub queue_bin_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Scheduler name (`pbspro`, `torque`, `slurm`, `sge`). None = detect.
    pub backend: Option<String>,
    pub poll_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url: "local://".to_string(),
            identity_file: None,
            remote_command: "profitd".to_string(),
            max_jobs: 0,
            batch_size: 8,
            transfer_channels: 3,
            do_cleanup: true,
            header_lines: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            keep_alive_secs: KEEP_ALIVE_SECS,
            close_timeout_secs: 120,
            kill_timeout_secs: 60,
            cleanup_timeout_secs: 60,
            transfer_retries: 3,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            hardkill_timeout_secs: HARDKILL_TIMEOUT_SECS,
            work_dir: PathBuf::new(),
            queue_bin_dir: PathBuf::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: None,
            poll_interval_secs: POLL_INTERVAL_SECS,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}

impl AgentConfig {
    /// Directory new temporary roots are created under.
    pub fn temp_parent(&self) -> PathBuf {
        if self.work_dir.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            self.work_dir.clone()
        }
    }

    /// Program path for scheduler command `name`.
    pub fn queue_command(&self, name: &str) -> PathBuf {
        if self.queue_bin_dir.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            self.queue_bin_dir.join(name)
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("profit")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ProfitConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    /// Load from an explicit file, still honouring env overrides.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ProfitConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PROFIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = ProfitConfig::default().to_toml()?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    /// Apply PROFIT_* overrides looked up through `var`.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>, slot: &mut T) {
            if let Some(p) = v.and_then(|v| v.parse().ok()) {
                *slot = p;
            }
        }
        fn flag(v: Option<String>, slot: &mut bool) {
            if let Some(v) = v {
                *slot = v == "true" || v == "1";
            }
        }

        if let Some(v) = var("PROFIT_RUNNER__URL") {
            self.runner.url = v;
        }
        if let Some(v) = var("PROFIT_RUNNER__IDENTITY_FILE") {
            self.runner.identity_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PROFIT_RUNNER__REMOTE_COMMAND") {
            self.runner.remote_command = v;
        }
        parse(var("PROFIT_RUNNER__MAX_JOBS"), &mut self.runner.max_jobs);
        parse(var("PROFIT_RUNNER__BATCH_SIZE"), &mut self.runner.batch_size);
        parse(var("PROFIT_RUNNER__TRANSFER_CHANNELS"), &mut self.runner.transfer_channels);
        flag(var("PROFIT_RUNNER__DO_CLEANUP"), &mut self.runner.do_cleanup);
        parse(var("PROFIT_TRANSPORT__KEEP_ALIVE_SECS"), &mut self.transport.keep_alive_secs);
        parse(var("PROFIT_TRANSPORT__CLOSE_TIMEOUT_SECS"), &mut self.transport.close_timeout_secs);
        parse(var("PROFIT_TRANSPORT__TRANSFER_RETRIES"), &mut self.transport.transfer_retries);
        if let Some(v) = var("PROFIT_AGENT__SHELL") {
            self.agent.shell = v;
        }
        parse(var("PROFIT_AGENT__HARDKILL_TIMEOUT_SECS"), &mut self.agent.hardkill_timeout_secs);
        if let Some(v) = var("PROFIT_AGENT__WORK_DIR") {
            self.agent.work_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PROFIT_AGENT__QUEUE_BIN_DIR") {
            self.agent.queue_bin_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PROFIT_QUEUE__BACKEND") {
            self.queue.backend = Some(v);
        }
        parse(var("PROFIT_QUEUE__POLL_INTERVAL_SECS"), &mut self.queue.poll_interval_secs);
    }
}
