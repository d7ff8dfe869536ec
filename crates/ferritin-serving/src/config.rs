//! Serving configuration
//!
//! Every knob of the service, with its default. A config file is optional JSON
//! holding any subset of the fields below; command line flags are applied on top
//! and the result is validated once before anything is started.
//!
//! ```json
//! {
//!   "max_micro_batch_size": 8,
//!   "batch_policy": "split",
//!   "backend_timeout_ms": 30000,
//!   "max_in_flight": 1,
//!   "max_sequence_length": 1022,
//!   "reject_unknown_options": true,
//!   "cpu": false,
//!   "log_level": "info",
//!   "json_logs": false,
//!   "listen": "127.0.0.1:8080",
//!   "max_body_bytes": 67108864
//! }
//! ```
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

/// What to do with a batch larger than the micro-batch limit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchPolicy {
    /// Run sequential sub-batches and stitch the results back together.
    #[default]
    Split,
    /// Fail with `BatchTooLarge`.
    Reject,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ServingConfig {
    /// Largest number of rows sent to the backend in one call.
    #[validate(range(min = 1, max = 4096))]
    pub max_micro_batch_size: usize,
    pub batch_policy: BatchPolicy,
    /// Deadline for each backend call.
    #[validate(range(min = 1))]
    pub backend_timeout_ms: u64,
    /// Concurrent backend calls allowed.
    #[validate(range(min = 1, max = 1024))]
    pub max_in_flight: usize,
    /// Longest accepted sequence, in residues.
    #[validate(range(min = 1))]
    pub max_sequence_length: usize,
    pub reject_unknown_options: bool,
    pub cpu: bool,
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,
    pub json_logs: bool,
    pub listen: SocketAddr,
    #[validate(range(min = 1024))]
    pub max_body_bytes: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            max_micro_batch_size: 8,
            batch_policy: BatchPolicy::Split,
            backend_timeout_ms: 30_000,
            max_in_flight: 1,
            // 1024 positions minus <cls> and <eos>
            max_sequence_length: 1022,
            reject_unknown_options: true,
            cpu: false,
            log_level: "info".to_string(),
            json_logs: false,
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    EnvFilter::try_new(level)
        .map(|_| ())
        .map_err(|_| ValidationError::new("log_level"))
}

impl ServingConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, or the given file. Not yet validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}
