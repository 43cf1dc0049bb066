//! Tunables for the synchronization engine.
//!
//! ```
//! use socialmap_engine::SyncConfig;
//!
//! let config = SyncConfig::from_json(r#"{ "namespace": "workshop", "settle_delay_ms": 50 }"#).unwrap();
//! assert_eq!(config.namespace, "workshop");
//! assert_eq!(config.max_update_retries, 3);
//! ```

use std::time::Duration;

use serde::Deserialize;
use socialmap_storage::DEFAULT_NAMESPACE;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncConfig {
    /// Prefix for every durable key.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Pause between a local create and its remote create, so the local
    /// write settles before it is read back.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Conditional-update retries after a version conflict.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
    /// Linear backoff unit between conflict retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Minimum age of the last full reconciliation before another runs.
    #[serde(default = "default_full_sync_window_secs")]
    pub full_sync_window_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_initial_sync_delay_ms")]
    pub initial_sync_delay_ms: u64,

    /// Reconnect attempts before the realtime channel gives up and enters
    /// offline mode.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,

    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_namespace() -> String { DEFAULT_NAMESPACE.to_string() }
fn default_settle_delay_ms() -> u64 { 100 }
fn default_max_update_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_full_sync_window_secs() -> u64 { 300 } // 5 minutes
fn default_poll_interval_secs() -> u64 { 30 }
fn default_initial_sync_delay_ms() -> u64 { 1000 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_delay_ms() -> u64 { 1000 }
fn default_reconnect_jitter_ms() -> u64 { 500 }
fn default_notification_capacity() -> usize { 256 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            settle_delay_ms: default_settle_delay_ms(),
            max_update_retries: default_max_update_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            full_sync_window_secs: default_full_sync_window_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            initial_sync_delay_ms: default_initial_sync_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.namespace.trim().is_empty() {
            return Err(EngineError::Config("namespace must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(EngineError::Config("poll_interval_secs must be positive".into()));
        }
        if self.notification_capacity == 0 {
            return Err(EngineError::Config("notification_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn full_sync_window(&self) -> Duration {
        Duration::from_secs(self.full_sync_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sync_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
