use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{AttemptError, TransferError, TransferResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Which replica of the storage account a request goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageLocation {
    Primary,
    Secondary,
}

impl StorageLocation {
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Caller preference for where requests run and where retries fail over to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocationMode {
    #[default]
    PrimaryOnly,
    PrimaryThenSecondary,
    SecondaryOnly,
    SecondaryThenPrimary,
}

impl LocationMode {
    /// Location of the first attempt
    pub fn initial_location(self) -> StorageLocation {
        match self {
            Self::PrimaryOnly | Self::PrimaryThenSecondary => StorageLocation::Primary,
            Self::SecondaryOnly | Self::SecondaryThenPrimary => StorageLocation::Secondary,
        }
    }

    /// Location suggested for the attempt after one that ran at `current`
    pub fn next_location(self, current: StorageLocation) -> StorageLocation {
        match self {
            Self::PrimaryOnly => StorageLocation::Primary,
            Self::SecondaryOnly => StorageLocation::Secondary,
            Self::PrimaryThenSecondary | Self::SecondaryThenPrimary => current.other(),
        }
    }
}

/// Locations a particular command is allowed to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLocationMode {
    /// Writes and anything that must observe the latest state
    PrimaryOnly,
    SecondaryOnly,
    /// Read-only commands
    PrimaryOrSecondary,
}

impl CommandLocationMode {
    pub fn allows(self, location: StorageLocation) -> bool {
        match self {
            Self::PrimaryOnly => location == StorageLocation::Primary,
            Self::SecondaryOnly => location == StorageLocation::Secondary,
            Self::PrimaryOrSecondary => true,
        }
    }
}

/// Primary and optional secondary endpoint of one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub primary: Url,
    pub secondary: Option<Url>,
}

impl StorageUri {
    pub fn new(primary: Url) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Url) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Parse the primary (and optional secondary) endpoint from strings
    pub fn parse(primary: &str, secondary: Option<&str>) -> TransferResult<Self> {
        let primary = Url::parse(primary)
            .map_err(|e| TransferError::invalid(format!("Invalid primary uri {}: {}", primary, e)))?;
        let secondary = secondary
            .map(|s| {
                Url::parse(s)
                    .map_err(|e| TransferError::invalid(format!("Invalid secondary uri {}: {}", s, e)))
            })
            .transpose()?;
        Ok(Self { primary, secondary })
    }

    pub fn for_location(&self, location: StorageLocation) -> TransferResult<&Url> {
        match location {
            StorageLocation::Primary => Ok(&self.primary),
            StorageLocation::Secondary => self
                .secondary
                .as_ref()
                .ok_or_else(|| TransferError::invalid("No secondary endpoint configured")),
        }
    }
}

/// The three upload-unit kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobKind {
    Block,
    Page,
    Append,
}

impl BlobKind {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Block => "BlockBlob",
            Self::Page => "PageBlob",
            Self::Append => "AppendBlob",
        }
    }

    pub fn from_header_value(value: &str) -> Option<Self> {
        match value {
            "BlockBlob" => Some(Self::Block),
            "PageBlob" => Some(Self::Page),
            "AppendBlob" => Some(Self::Append),
            _ => None,
        }
    }
}

/// Byte range for partial content requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>, // None means "to end of blob"
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    /// Inclusive end offset, if the range is closed
    pub fn end_inclusive(&self) -> Option<u64> {
        self.length.map(|len| self.offset + len.saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    /// Range advanced past `consumed` bytes already delivered
    pub fn advance(&self, consumed: u64) -> Self {
        Self {
            offset: self.offset + consumed,
            length: self.length.map(|len| len.saturating_sub(consumed)),
        }
    }

    /// `bytes=start-end` header form
    pub fn header_value(&self) -> String {
        match self.end_inclusive() {
            Some(end) => format!("bytes={}-{}", self.offset, end),
            None => format!("bytes={}-", self.offset),
        }
    }
}

/// Service identifier of one uncommitted block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    /// Ids share the prefix and a zero-padded index so all ids have equal length
    pub fn for_index(prefix: &str, index: u32) -> Self {
        let raw = format!("{}-{:06}", prefix, index);
        Self(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind-specific identity of an uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkUnit {
    Block(BlockId),
    Page { start: u64, end_inclusive: u64 },
    Append { append_offset: u64 },
}

/// One successfully uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub offset: u64,
    pub length: u64,
    pub content_md5: Option<String>,
    pub unit: ChunkUnit,
}

/// Blob properties extracted from response headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub blob_kind: Option<BlobKind>,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub append_offset: Option<u64>,
    pub committed_block_count: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

/// Record of one attempt made by the executor
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub attempt: u32,
    pub location: StorageLocation,
    pub elapsed: Duration,
    pub status: Option<u16>,
    pub failure: Option<AttemptError>,
}

impl ExecutionAttempt {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Per-operation context: correlation id, cancellation and attempt history
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub client_request_id: String,
    pub cancellation: CancellationToken,
    pub started_at: Instant,
    pub attempts: Vec<ExecutionAttempt>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            client_request_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
            attempts: Vec::new(),
        }
    }

    pub fn with_client_request_id<S: Into<String>>(mut self, id: S) -> Self {
        self.client_request_id = id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Restart the execution clock
    pub fn reset_clock(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_attempt(&self) -> Option<&ExecutionAttempt> {
        self.attempts.last()
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_have_equal_length() {
        let first = BlockId::for_index("a1b2c3d4", 0);
        let later = BlockId::for_index("a1b2c3d4", 49_999);
        assert_eq!(first.as_str().len(), later.as_str().len());
        assert_ne!(first, later);
    }

    #[test]
    fn range_header_and_advance() {
        let range = ByteRange::new(10, Some(5));
        assert_eq!(range.header_value(), "bytes=10-14");
        assert_eq!(range.advance(3).header_value(), "bytes=13-14");
        assert_eq!(ByteRange::from_offset(7).header_value(), "bytes=7-");
    }

    #[test]
    fn location_mode_alternates() {
        let mode = LocationMode::PrimaryThenSecondary;
        assert_eq!(mode.initial_location(), StorageLocation::Primary);
        assert_eq!(mode.next_location(StorageLocation::Primary), StorageLocation::Secondary);
        assert_eq!(LocationMode::PrimaryOnly.next_location(StorageLocation::Primary), StorageLocation::Primary);
        assert!(!CommandLocationMode::PrimaryOnly.allows(StorageLocation::Secondary));
    }

    #[test]
    fn storage_uri_requires_secondary_for_secondary_location() {
        let uri = StorageUri::parse("https://acct.blob.example/c/b", None).unwrap();
        assert!(uri.for_location(StorageLocation::Secondary).is_err());
        assert!(uri.for_location(StorageLocation::Primary).is_ok());
    }
}
