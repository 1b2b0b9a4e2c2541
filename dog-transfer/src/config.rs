use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BlobKind, LocationMode, TransferError, TransferResult};

/// Default chunk size for uploads (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Largest block the service accepts
pub const MAX_BLOCK_SIZE: usize = 100 * 1024 * 1024;
/// Largest single append the service accepts
pub const MAX_APPEND_BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// Page blob writes must be aligned to this
pub const PAGE_SIZE: usize = 512;
/// Largest number of blocks in one committed block list
pub const MAX_BLOCKS: u32 = 50_000;

/// Configuration for transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes buffered before a chunk is uploaded
    pub chunk_size: usize,

    /// Send a Content-MD5 with every chunk so the service verifies it
    pub transactional_md5: bool,

    /// Store the MD5 of the whole blob when a block list is committed
    pub store_blob_md5: bool,

    /// Where requests run and where reads may fail over to
    pub location_mode: LocationMode,

    /// Retry behavior for every command
    pub retry: RetryConfig,

    /// Upper bound for a single attempt, response body included
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,

    /// Upper bound for one operation across all attempts and delays
    #[serde(with = "humantime_serde")]
    pub maximum_execution_time: Option<Duration>,

    /// Guard appends with the append-position precondition (single writer only)
    pub append_position_precondition: bool,

    /// Reject downloads of blobs that carry no encryption metadata
    pub require_encryption: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            transactional_md5: false,
            store_blob_md5: true,
            location_mode: LocationMode::PrimaryOnly,
            retry: RetryConfig::default(),
            attempt_timeout: Some(Duration::from_secs(90)),
            maximum_execution_time: None,
            append_position_precondition: true,
            require_encryption: false,
        }
    }
}

/// Which backoff curve the default policy follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
    None,
}

/// Rules for the default retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,

    /// Retries after the first attempt
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries: 3,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from JSON; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> TransferResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.chunk_size == 0 {
            return Err(TransferError::invalid("Chunk size must be at least 1 byte"));
        }
        Ok(config)
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Enable per-chunk MD5 validation
    pub fn with_transactional_md5(mut self) -> Self {
        self.transactional_md5 = true;
        self
    }

    /// Disable storing the whole-blob MD5 on commit
    pub fn without_blob_md5(mut self) -> Self {
        self.store_blob_md5 = false;
        self
    }

    /// Set location mode
    pub fn with_location_mode(mut self, mode: LocationMode) -> Self {
        self.location_mode = mode;
        self
    }

    /// Set retry rules
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the overall execution time limit
    pub fn with_maximum_execution_time(mut self, limit: Duration) -> Self {
        self.maximum_execution_time = Some(limit);
        self
    }

    /// Drop the append-position precondition (required for multiple concurrent writers)
    pub fn without_append_precondition(mut self) -> Self {
        self.append_position_precondition = false;
        self
    }

    /// Refuse to download blobs that are not client-side encrypted
    pub fn require_encryption(mut self) -> Self {
        self.require_encryption = true;
        self
    }

    /// Check the chunk size against the limits of the given unit kind
    pub fn validate(&self, kind: BlobKind) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::invalid("Chunk size must be at least 1 byte"));
        }
        match kind {
            BlobKind::Block if self.chunk_size > MAX_BLOCK_SIZE => Err(TransferError::invalid(format!(
                "Chunk size {} exceeds the maximum block size {}",
                self.chunk_size, MAX_BLOCK_SIZE
            ))),
            BlobKind::Append if self.chunk_size > MAX_APPEND_BLOCK_SIZE => {
                Err(TransferError::invalid(format!(
                    "Chunk size {} exceeds the maximum append block size {}",
                    self.chunk_size, MAX_APPEND_BLOCK_SIZE
                )))
            }
            BlobKind::Page if self.chunk_size % PAGE_SIZE != 0 || self.chunk_size > MAX_APPEND_BLOCK_SIZE => {
                Err(TransferError::invalid(format!(
                    "Page chunk size {} must be a multiple of {} and at most {}",
                    self.chunk_size, PAGE_SIZE, MAX_APPEND_BLOCK_SIZE
                )))
            }
            _ => Ok(()),
        }
    }
}

impl RetryConfig {
    /// Create new retry rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear backoff
    pub fn linear(max_retries: u32, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set base and max delay
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_chunks_must_be_page_aligned() {
        let config = TransferConfig::new().with_chunk_size(1000);
        assert!(config.validate(BlobKind::Page).is_err());
        assert!(config.validate(BlobKind::Block).is_ok());
        assert!(TransferConfig::new().with_chunk_size(1024).validate(BlobKind::Page).is_ok());
    }

    #[test]
    fn append_chunks_are_capped() {
        let config = TransferConfig::new().with_chunk_size(MAX_APPEND_BLOCK_SIZE + 1);
        assert!(config.validate(BlobKind::Append).is_err());
        assert!(config.validate(BlobKind::Block).is_ok());
    }

    #[test]
    fn loads_from_json_with_humantime_durations() {
        let config = TransferConfig::from_json_str(
            r#"{
                "chunk_size": 65536,
                "location_mode": "PrimaryThenSecondary",
                "retry": { "strategy": "linear", "max_retries": 5, "base_delay": "250ms" },
                "attempt_timeout": "10s"
            }"#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.location_mode, LocationMode::PrimaryThenSecondary);
        assert_eq!(config.retry.strategy, RetryStrategy::Linear);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.attempt_timeout, Some(Duration::from_secs(10)));
        assert!(config.append_position_precondition);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(TransferConfig::from_json_str(r#"{ "chunk_size": 0 }"#).is_err());
    }
}
