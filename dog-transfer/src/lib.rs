//! # dog-transfer: Retryable streaming blob transfers
//!
//! `dog-transfer` moves bytes to and from a remote blob service over HTTP. Every
//! network call runs through one executor that retries, fails over between a
//! primary and a secondary endpoint, resumes interrupted downloads and replays
//! appends without duplicating data.
//!
//! ## Key Features
//!
//! - **Chunked write streams**: block, page and append blobs written from arbitrary-sized writes
//! - **Retry and failover**: pluggable retry policies, read failover to a secondary endpoint
//! - **Exactly-once appends**: lost append responses are resolved by re-reading the blob length
//! - **Resumable downloads**: interrupted bodies continue from the last byte delivered
//! - **Client-side encryption**: AES-256-CBC content keys wrapped by a key-encryption key
//! - **Range decryption**: plaintext ranges mapped onto the cipher blocks that cover them
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let service = Arc::new(MemoryBlobService::new());
//! let client = BlobClient::new(service.clone(), service.uri("photos/cat.jpg"), TransferConfig::default());
//!
//! // Upload through a chunked block writer
//! let mut writer = client.open_block_writer()?;
//! writer.write(b"Hello, world!").await?;
//! let receipt = writer.commit().await?;
//! assert_eq!(receipt.size_bytes, 13);
//!
//! // Download a range of it
//! let mut ctx = OperationContext::new();
//! let bytes = client
//!     .download_bytes(&DownloadOptions::new().with_range(7, Some(5)), &mut ctx)
//!     .await?;
//! assert_eq!(bytes, b"world");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────┐
//! │  BlobClient / streams   │  ← chunking, encryption, append offsets
//! ├─────────────────────────┤
//! │  Executor               │  ← retry, failover, timeouts, resume
//! ├─────────────────────────┤
//! │  HttpTransport          │  ← reqwest or the in-memory service
//! └─────────────────────────┘
//! ```
//!
//! Streams and downloads describe each network call as a [`StorageCommand`];
//! only the executor talks to the transport.

mod append;
mod cipher;
mod client;
mod command;
mod config;
mod encrypt_stream;
pub mod encryption;
mod error;
mod executor;
mod memory;
pub mod protocol;
mod receipt;
mod retry;
mod sink;
mod transport;
mod types;
mod write_stream;

#[cfg(feature = "tracing-basic")]
pub mod observability;

// Re-export main types for clean API
pub use append::{AppendOffsetState, AppendRecovery};
pub use cipher::{ciphertext_length, CbcEncryptor, CipherRangeMapping, DecryptingSink};
pub use client::{BlobClient, DownloadOptions};
pub use command::{AttemptContext, BodyDigest, RecoveryAction, ResponseParts, StorageCommand};
pub use config::{
    RetryConfig, RetryStrategy, TransferConfig, DEFAULT_CHUNK_SIZE, MAX_APPEND_BLOCK_SIZE, MAX_BLOCKS,
    MAX_BLOCK_SIZE, PAGE_SIZE,
};
pub use encrypt_stream::EncryptingWriteStream;
pub use encryption::{
    ContentKey, EncryptionData, EncryptionPolicy, KeyEncryptionKey, KeyResolver, StaticKeyResolver, SymmetricKey,
};
pub use error::{codes, AttemptError, ServiceFailure, TransferError, TransferResult, TransportError};
pub use executor::Executor;
pub use memory::{Fault, MemoryBlobService, Operation, RequestRecord, PRIMARY_HOST, SECONDARY_HOST};
pub use protocol::BlobHeaders;
pub use receipt::{DownloadReceipt, ResolvedRange, TransferReceipt};
pub use retry::{policy_from_config, ExponentialRetry, LinearRetry, NoRetry, RetryContext, RetryInfo, RetryPolicy};
pub use sink::{DownloadSink, WriterSink};
pub use transport::{HttpTransport, ReqwestTransport, TransportRequest, TransportResponse};
pub use types::{
    BlobKind, BlobProperties, BlockId, ByteRange, ByteStream, ChunkDescriptor, ChunkUnit, CommandLocationMode,
    ExecutionAttempt, LocationMode, OperationContext, StorageLocation, StorageUri,
};
pub use write_stream::{ChunkedWriteStream, StreamPhase, StreamState};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobClient, BlobHeaders, BlobKind, ByteRange, ChunkedWriteStream, DownloadOptions, EncryptionPolicy,
        MemoryBlobService, OperationContext, TransferConfig, TransferError, TransferReceipt, TransferResult,
    };
}
