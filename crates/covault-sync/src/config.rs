//! Sync and transport configuration.
//!
//! Durations are kept as milliseconds so configs read cleanly from JSON;
//! use the accessor methods for [`Duration`]s.

use std::time::Duration;

use covault_core::ChunkLimits;
use serde::{Deserialize, Serialize};

/// Sync Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How content sent to peers is chunked.
    pub peer_chunk_limits: ChunkLimits,
    /// How content read from storage is chunked.
    pub storage_chunk_limits: ChunkLimits,
    /// How many unsynced CoValues are resumed at once after a restart.
    pub resume_batch_size: usize,
    /// How often writes that storage refused are retried. 0 disables the
    /// timer; retries then happen only on the next change.
    pub persist_retry_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peer_chunk_limits: ChunkLimits::default(),
            storage_chunk_limits: ChunkLimits::default(),
            resume_batch_size: 10,
            persist_retry_interval_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn persist_retry_interval(&self) -> Option<Duration> {
        (self.persist_retry_interval_ms > 0)
            .then(|| Duration::from_millis(self.persist_retry_interval_ms))
    }
}

/// Peer transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Sends wait while the connection has more unacknowledged bytes than this.
    pub buffer_limit: usize,
    /// How often a waiting send re-checks the buffer.
    pub buffer_poll_interval_ms: u64,
    /// Upper bound for one batched frame.
    pub max_batch_bytes: usize,
    /// How long the sender waits for more messages before flushing a batch.
    pub batch_delay_ms: u64,
    /// Inactivity after which the peer counts as gone. 0 disables it.
    pub keepalive_timeout_ms: u64,
    /// Interval between outgoing pings. 0 disables them.
    pub ping_interval_ms: u64,
    /// Batch outgoing messages before the peer has shown it batches too.
    pub batching_by_default: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_limit: 100_000,
            buffer_poll_interval_ms: 10,
            max_batch_bytes: 25_000,
            batch_delay_ms: 5,
            keepalive_timeout_ms: 10_000,
            ping_interval_ms: 1_500,
            batching_by_default: true,
        }
    }
}

impl TransportConfig {
    pub fn buffer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_poll_interval_ms.max(1))
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn keepalive_timeout(&self) -> Option<Duration> {
        (self.keepalive_timeout_ms > 0).then(|| Duration::from_millis(self.keepalive_timeout_ms))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.buffer_limit, 100_000);
        assert_eq!(config.buffer_poll_interval(), Duration::from_millis(10));
        assert_eq!(config.max_batch_bytes, 25_000);
        assert_eq!(config.batch_delay(), Duration::from_millis(5));
        assert_eq!(config.keepalive_timeout(), Some(Duration::from_secs(10)));
        assert!(config.batching_by_default);
    }

    #[test]
    fn test_partial_json() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"keepalive_timeout_ms": 0, "batching_by_default": false}"#)
                .unwrap();
        assert_eq!(config.keepalive_timeout(), None);
        assert!(!config.batching_by_default);
        assert_eq!(config.max_batch_bytes, 25_000);

        let sync: SyncConfig =
            serde_json::from_str(r#"{"peer_chunk_limits": {"max_sessions": 4}}"#).unwrap();
        assert_eq!(sync.peer_chunk_limits.max_sessions, 4);
        assert_eq!(sync.peer_chunk_limits.max_bytes, ChunkLimits::default().max_bytes);
        assert_eq!(sync.persist_retry_interval(), Some(Duration::from_secs(1)));

        let sync: SyncConfig = serde_json::from_str(r#"{"persist_retry_interval_ms": 0}"#).unwrap();
        assert_eq!(sync.persist_retry_interval(), None);
    }
}
