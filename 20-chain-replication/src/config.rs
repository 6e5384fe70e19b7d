//! Timeouts and retry tuning for a replicated table.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// Default bound on a single replica call.
///
/// Large enough that a few seconds of network delay at any hop only adds
/// latency instead of failing the write.
pub const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which a pending head copy is reported as abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning for a [`crate::table::ReplicatedTable`].
///
/// Can be loaded from JSON, e.g.
/// `{"hop_timeout_ms": 5000, "lock_timeout_ms": 20000, "etag_retries": 3}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    /// Per-hop timeout in milliseconds.
    pub hop_timeout_ms: u64,
    /// Age past which a pending head copy found by a writer is logged as
    /// abandoned rather than in flight. Either way the writer repairs it first.
    pub lock_timeout_ms: u64,
    /// Attempts a hop makes when its etag loses a race with repair.
    pub etag_retries: u32,
    /// Base delay before the repair worker retries a failed repair.
    pub repair_retry_ms: u64,
    /// Repairs the worker attempts per row before leaving it to the next read or write.
    pub repair_attempts: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            hop_timeout_ms: DEFAULT_HOP_TIMEOUT.as_millis() as u64,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            etag_retries: 3,
            repair_retry_ms: 1_000,
            repair_attempts: 5,
        }
    }
}

impl TableConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("invalid table config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.hop_timeout_ms > 0, "hop_timeout_ms must be positive");
        ensure!(self.etag_retries > 0, "etag_retries must be at least 1");
        Ok(())
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn repair_retry(&self) -> Duration {
        Duration::from_millis(self.repair_retry_ms)
    }
}
