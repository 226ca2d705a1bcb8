//! Purpose: Pipe configuration loaded from JSON with a default for every field.
//! Exports: `PipeConfig`, `PipeKind`, `RetryConfig`, `HdfsConfig`.
//! Role: Single source for backend choice, layout, rotation, framing and retry budgets.
//! Invariants: Unknown fields are rejected so typos surface as `Usage` errors.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Framing;
use crate::core::retry::{DEFAULT_TRANSIENT_EXCEPTIONS, RetryPolicy};
use crate::core::rotation::{DEFAULT_MAX_FILE_SIZE, RotationPolicy};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeKind {
    #[default]
    Hdfs,
    File,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeConfig {
    pub kind: PipeKind,
    pub base_dir: PathBuf,
    pub max_file_size: u64,
    pub framing: Framing,
    pub discovery_backoff_ms: u64,
    pub retry: RetryConfig,
    pub hdfs: HdfsConfig,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub budget_ms: u64,
    pub interval_ms: u64,
    pub close_budget_ms: u64,
    pub transient_exceptions: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HdfsConfig {
    pub namenode: String,
    pub user: Option<String>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            kind: PipeKind::default(),
            base_dir: PathBuf::from("/tmp/dfspipe"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            framing: Framing::default(),
            discovery_backoff_ms: 200,
            retry: RetryConfig::default(),
            hdfs: HdfsConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget_ms: 10_000,
            interval_ms: 100,
            close_budget_ms: 2_000,
            transient_exceptions: DEFAULT_TRANSIENT_EXCEPTIONS
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl Default for HdfsConfig {
    fn default() -> Self {
        Self {
            namenode: "http://localhost:9870".to_string(),
            user: None,
        }
    }
}

impl PipeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, Error> {
        let config: PipeConfig = serde_json::from_str(raw).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid config: {err}"))
                .with_hint("Check field names against `dfspipe --help`.")
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|err| Error::from_io(err, path))?;
        Self::from_json_str(&raw).map_err(|err| err.with_path(path))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_file_size == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_file_size must be positive"));
        }
        if self.retry.interval_ms == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("retry.interval_ms must be positive")
                .with_hint("Set retry.budget_ms to 0 to disable retries."));
        }
        Ok(())
    }

    pub fn metadata_policy(&self) -> RetryPolicy {
        self.retry.policy(self.retry.budget_ms)
    }

    pub fn close_policy(&self) -> RetryPolicy {
        self.retry.policy(self.retry.close_budget_ms)
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy::new(self.max_file_size)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_ms)
    }
}

impl RetryConfig {
    fn policy(&self, budget_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(budget_ms),
            Duration::from_millis(self.interval_ms),
        )
        .with_transient_exceptions(self.transient_exceptions.iter().cloned())
    }
}
