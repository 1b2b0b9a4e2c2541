use chrono::{DateTime, Utc};

use crate::{BlobKind, BlobProperties, ChunkDescriptor, CipherRangeMapping};

/// Receipt returned after a write stream committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub kind: BlobKind,
    /// Bytes committed to the service (ciphertext bytes for encrypted uploads)
    pub size_bytes: u64,
    pub etag: Option<String>,
    /// Base64 MD5 of the committed content, when computed
    pub checksum: Option<String>,
    pub chunks: Vec<ChunkDescriptor>,
    pub committed_at: DateTime<Utc>,
}

impl TransferReceipt {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Range actually served for a partial download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

impl ResolvedRange {
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_full_content(&self) -> bool {
        self.start == 0 && self.end + 1 == self.total_size
    }
}

/// Result of a completed download
#[derive(Debug, Clone)]
pub struct DownloadReceipt {
    pub properties: BlobProperties,
    /// Bytes handed to the caller's sink
    pub bytes_written: u64,
    pub resolved_range: Option<ResolvedRange>,
    /// Set when the blob was decrypted on the way down
    pub cipher_mapping: Option<CipherRangeMapping>,
}

impl DownloadReceipt {
    pub fn was_decrypted(&self) -> bool {
        self.cipher_mapping.is_some()
    }
}
