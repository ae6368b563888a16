//! Replica configuration.

use std::io;
use std::time::Duration;

/// Tuning knobs for a single replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Log size threshold (bytes) that triggers compaction.
    pub max_log_bytes: u64,
    /// Chunk size for snapshot entries shipped through the log.
    pub snapshot_chunk_bytes: usize,
    /// Minimum randomized election timeout.
    pub election_timeout_min: Duration,
    /// Maximum randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval; must be strictly below the election minimum.
    pub heartbeat_interval: Duration,
    /// Upper bound on client session liveness.
    pub session_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_log_bytes: 4 * 1024 * 1024, // 4 MB
            snapshot_chunk_bytes: 4096,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            session_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplicaConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> io::Result<()> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "election timeout min exceeds max",
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "heartbeat interval must be below the minimum election timeout",
            ));
        }
        if self.snapshot_chunk_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "snapshot chunk size must be non-zero",
            ));
        }
        if self.session_timeout < self.election_timeout_max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "session timeout must cover at least one election timeout",
            ));
        }
        Ok(())
    }
}
