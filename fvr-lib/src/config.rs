use crate::{
    FvrError, FvrResult, DEFAULT_CHUNK_SIZE, DEFAULT_META_DB_FILE, DEFAULT_TMP_PATH, FVR_HOME_DIR,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub fn default_fvr_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(FVR_HOME_DIR)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Chunks are kept as files below `root`.
    Local {
        #[serde(alias = "path", alias = "root_path")]
        root: PathBuf,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: default_fvr_home().join("remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Max chunks of one file in flight at once.
    #[serde(alias = "concurrency")]
    pub fan_out: usize,
    /// Attempts per chunk, the first try included.
    #[serde(alias = "retry_limit")]
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Reuse the remote copy of a chunk already stored with the same hash.
    pub dedup: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            fan_out: 4,
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            dedup: true,
        }
    }
}

impl TransferConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay_ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Immutable process configuration, built once and handed to every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeverConfig {
    pub chunk_size: u64,
    #[serde(alias = "tmp_dir", alias = "temp_path")]
    pub tmp_path: PathBuf,
    #[serde(alias = "db_path", alias = "meta_path")]
    pub meta_db_path: PathBuf,
    pub backend: BackendConfig,
    pub transfer: TransferConfig,
}

impl Default for ForeverConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            tmp_path: PathBuf::from(DEFAULT_TMP_PATH),
            meta_db_path: default_fvr_home().join(DEFAULT_META_DB_FILE),
            backend: BackendConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl ForeverConfig {
    pub fn validate(&self) -> FvrResult<()> {
        if self.chunk_size == 0 {
            return Err(FvrError::InvalidParam("chunk_size must be > 0".to_string()));
        }
        if self.transfer.fan_out == 0 {
            return Err(FvrError::InvalidParam(
                "transfer.fan_out must be > 0".to_string(),
            ));
        }
        if self.transfer.max_attempts == 0 {
            return Err(FvrError::InvalidParam(
                "transfer.max_attempts must be > 0".to_string(),
            ));
        }
        if self.tmp_path.as_os_str().is_empty() {
            return Err(FvrError::InvalidParam("tmp_path is empty".to_string()));
        }
        Ok(())
    }

    pub fn from_json_str(content: &str) -> FvrResult<Self> {
        let config: ForeverConfig = serde_json::from_str(content)
            .map_err(|e| FvrError::InvalidParam(format!("parse config failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}
