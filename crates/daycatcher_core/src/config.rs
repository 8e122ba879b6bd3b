//! Runtime configuration for the sync core.
//!
//! # Invariants
//! - Every field has a default; an empty JSON object is a valid config.
//! - Unknown keys are rejected so typos never pass silently.
//! - `validate` runs before any store is opened.

use crate::assets::engine::AssetSyncConfig;
use crate::repo::record_repo::MergePolicy;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_READINESS_GRACE_MS: u64 = 5_000;
const DEFAULT_MAX_PARALLEL_TRANSFERS: usize = 3;
const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_PERIODIC_RETRY_MS: u64 = 10 * 60 * 1_000;
const DEFAULT_CHANGE_COALESCE_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Directory holding one SQLite file per partition. `None` keeps both
    /// partitions in memory.
    pub store_dir: Option<PathBuf>,
    /// Absolute directory for media payload files.
    pub media_dir: PathBuf,
    /// Principal the local process acts as.
    pub principal_id: String,
    /// Fixed delay before `received` is marked ready. `None` waits for an
    /// explicit initial-import signal.
    pub readiness_grace_ms: Option<u64>,
    pub max_parallel_transfers: usize,
    pub cancel_grace_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// `None` disables the periodic retry timer.
    pub periodic_retry_interval_ms: Option<u64>,
    pub change_coalesce_ms: u64,
    pub merge_policy: MergePolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            media_dir: std::env::temp_dir().join("daycatcher-media"),
            principal_id: "local".to_string(),
            readiness_grace_ms: Some(DEFAULT_READINESS_GRACE_MS),
            max_parallel_transfers: DEFAULT_MAX_PARALLEL_TRANSFERS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            retry_backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
            periodic_retry_interval_ms: Some(DEFAULT_PERIODIC_RETRY_MS),
            change_coalesce_ms: DEFAULT_CHANGE_COALESCE_MS,
            merge_policy: MergePolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.media_dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                field: "media_dir",
                path: self.media_dir.clone(),
            });
        }
        if let Some(store_dir) = &self.store_dir {
            if !store_dir.is_absolute() {
                return Err(ConfigError::RelativePath {
                    field: "store_dir",
                    path: store_dir.clone(),
                });
            }
        }
        if self.principal_id.trim().is_empty() {
            return Err(ConfigError::EmptyPrincipal);
        }
        if self.max_parallel_transfers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_parallel_transfers",
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(ConfigError::OutOfRange {
                field: "retry_backoff_base_ms",
                message: format!(
                    "base {} exceeds max {}",
                    self.retry_backoff_base_ms, self.retry_backoff_max_ms
                ),
            });
        }
        if self.periodic_retry_interval_ms == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "periodic_retry_interval_ms",
                message: "must be positive when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn readiness_grace(&self) -> Option<Duration> {
        self.readiness_grace_ms.map(Duration::from_millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn periodic_retry_interval(&self) -> Option<Duration> {
        self.periodic_retry_interval_ms.map(Duration::from_millis)
    }

    pub fn change_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.change_coalesce_ms)
    }

    pub fn asset_sync(&self) -> AssetSyncConfig {
        AssetSyncConfig {
            media_root: self.media_dir.clone(),
            max_parallel_transfers: self.max_parallel_transfers,
            cancel_grace: self.cancel_grace(),
            retry_backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            retry_backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    RelativePath { field: &'static str, path: PathBuf },
    EmptyPrincipal,
    OutOfRange { field: &'static str, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "invalid config json: {message}"),
            Self::RelativePath { field, path } => {
                write!(f, "{field} must be an absolute path, got `{}`", path.display())
            }
            Self::EmptyPrincipal => write!(f, "principal_id must not be empty"),
            Self::OutOfRange { field, message } => write!(f, "{field} {message}"),
        }
    }
}

impl Error for ConfigError {}
