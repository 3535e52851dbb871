//! Engine and transport configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Application area sent when creating sessions.
    pub area: String,
    /// How long a search stays fresh after a remote round trip (seconds).
    pub refresh_interval_secs: u64,
    /// Maximum number of remembered searches.
    pub search_capacity: usize,
    /// Number of completed change requests kept for self-change suppression.
    pub change_history: usize,
    /// Sessions expiring within this window are torn down (seconds).
    pub session_grace_secs: u64,
    /// Quiet period after an invalidation before prefetching (ms).
    pub prefetch_debounce_ms: u64,
    /// Maximum concurrent prefetch refreshes.
    pub prefetch_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            area: "client".to_string(),
            refresh_interval_secs: 300,
            search_capacity: 1024,
            change_history: 32,
            session_grace_secs: 300,
            prefetch_debounce_ms: 500,
            prefetch_concurrency: 4,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration from JSON; missing keys take their defaults.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.search_capacity == 0 {
            return Err(SyncError::Config("search_capacity must be at least 1".into()));
        }
        if self.prefetch_concurrency == 0 {
            return Err(SyncError::Config(
                "prefetch_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session_grace_secs)
    }

    pub fn prefetch_debounce(&self) -> Duration {
        Duration::from_millis(self.prefetch_debounce_ms)
    }
}

/// Configuration for [`crate::HttpTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Path prefix of the object endpoints.
    pub data_path: String,
    /// Path prefix of the session endpoints.
    pub session_path: String,
    /// Request timeout (ms).
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            data_path: "/srv/data".to_string(),
            session_path: "/srv/session".to_string(),
            timeout_ms: 30_000,
        }
    }
}
