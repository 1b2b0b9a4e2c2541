use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::StatusCode;
use md5::{Digest, Md5};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::append::{self, AppendOffsetState};
use crate::config::{MAX_BLOCKS, PAGE_SIZE};
use crate::protocol::{self, headers, BlobHeaders};
use crate::{
    BlobClient, BlobKind, BlockId, ChunkDescriptor, ChunkUnit, OperationContext, StorageCommand,
    TransferError, TransferReceipt, TransferResult,
};

/// Lifecycle of a write stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Accepting writes into the chunk buffer
    Buffering,
    /// A chunk command is in flight
    Uploading,
    /// Final flush and commit in progress
    Committing,
    /// Closed; the blob holds everything written
    Committed,
    /// A chunk or the commit failed; the stream is unusable
    Failed,
}

/// Accounting for one write stream
#[derive(Debug, Clone)]
pub struct StreamState {
    buffer: BytesMut,
    accepted: u64,
    committed: u64,
    descriptors: Vec<ChunkDescriptor>,
    phase: StreamPhase,
}

impl StreamState {
    fn new(chunk_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(chunk_size),
            accepted: 0,
            committed: 0,
            descriptors: Vec::new(),
            phase: StreamPhase::Buffering,
        }
    }

    /// Bytes handed to `write`
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Bytes acknowledged by the service
    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn descriptors(&self) -> &[ChunkDescriptor] {
        &self.descriptors
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }
}

/// Per-kind upload state
#[derive(Debug)]
enum UnitWriter {
    Block { prefix: String },
    Page { base_offset: u64 },
    Append { offsets: AppendOffsetState },
}

/// Slices written bytes into chunks and uploads each through the executor
///
/// A chunk is dispatched as soon as the buffer fills, and `write` returns only
/// after that upload finished, so at most one chunk is held in memory.
pub struct ChunkedWriteStream {
    client: BlobClient,
    kind: BlobKind,
    chunk_size: usize,
    unit: UnitWriter,
    state: StreamState,
    ctx: OperationContext,
    blob_headers: BlobHeaders,
    blob_hasher: Option<Md5>,
    etag: Option<String>,
}

impl ChunkedWriteStream {
    pub(crate) fn block(client: BlobClient) -> TransferResult<Self> {
        let prefix = Uuid::new_v4().simple().to_string();
        Self::new(client, BlobKind::Block, UnitWriter::Block { prefix })
    }

    pub(crate) fn page(client: BlobClient, base_offset: u64) -> TransferResult<Self> {
        if base_offset % PAGE_SIZE as u64 != 0 {
            return Err(TransferError::invalid(format!(
                "Page writes must start on a {}-byte boundary, got {}",
                PAGE_SIZE, base_offset
            )));
        }
        Self::new(client, BlobKind::Page, UnitWriter::Page { base_offset })
    }

    pub(crate) fn append(client: BlobClient, offsets: AppendOffsetState) -> TransferResult<Self> {
        Self::new(client, BlobKind::Append, UnitWriter::Append { offsets })
    }

    fn new(client: BlobClient, kind: BlobKind, unit: UnitWriter) -> TransferResult<Self> {
        let config = client.config();
        config.validate(kind)?;
        let chunk_size = config.chunk_size;
        let blob_hasher = (kind == BlobKind::Block && config.store_blob_md5).then(Md5::new);
        Ok(Self {
            kind,
            chunk_size,
            unit,
            state: StreamState::new(chunk_size),
            ctx: OperationContext::new(),
            blob_headers: BlobHeaders::default(),
            blob_hasher,
            etag: None,
            client,
        })
    }

    /// Use a caller-provided context for correlation and cancellation
    pub fn with_context(mut self, ctx: OperationContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.phase
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    /// Position the next append must start at
    pub fn append_offset(&self) -> Option<u64> {
        match &self.unit {
            UnitWriter::Append { offsets } => Some(offsets.last_offset),
            _ => None,
        }
    }

    /// Attach user metadata, sent when the block list is committed
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> TransferResult<()> {
        self.ensure_headers_mutable()?;
        self.blob_headers.metadata.insert(key.into(), value.into());
        Ok(())
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.blob_headers.metadata
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> TransferResult<()> {
        self.ensure_headers_mutable()?;
        self.blob_headers.content_type = Some(content_type.into());
        Ok(())
    }

    fn ensure_headers_mutable(&self) -> TransferResult<()> {
        if self.kind != BlobKind::Block {
            return Err(TransferError::unsupported(
                "Metadata for page and append blobs is set when the blob is created",
            ));
        }
        if !self.state.descriptors.is_empty() || self.state.phase != StreamPhase::Buffering {
            return Err(TransferError::state(
                "Metadata cannot change once a chunk has been dispatched",
            ));
        }
        Ok(())
    }

    /// Only a buffering stream accepts more work
    ///
    /// A stream left in `Uploading` or `Committing` had its future dropped
    /// mid-operation, so the in-flight chunk is gone and the stream is failed.
    fn ensure_writable(&mut self) -> TransferResult<()> {
        match self.state.phase {
            StreamPhase::Buffering => Ok(()),
            StreamPhase::Committed => Err(TransferError::state("Stream is already committed")),
            StreamPhase::Failed => Err(TransferError::state("Stream failed; no further writes are accepted")),
            StreamPhase::Uploading | StreamPhase::Committing => {
                warn!(phase = ?self.state.phase, "Previous stream operation was interrupted");
                self.state.phase = StreamPhase::Failed;
                Err(TransferError::state(
                    "Stream failed; a previous operation was interrupted before it completed",
                ))
            }
        }
    }

    /// Buffer `data`, uploading every chunk it completes
    pub async fn write(&mut self, mut data: &[u8]) -> TransferResult<()> {
        self.ensure_writable()?;
        while !data.is_empty() {
            let room = self.chunk_size - self.state.buffer.len();
            let take = room.min(data.len());
            self.state.buffer.extend_from_slice(&data[..take]);
            self.state.accepted += take as u64;
            data = &data[take..];

            if self.state.buffer.len() == self.chunk_size {
                let chunk = self.state.buffer.split().freeze();
                self.dispatch(chunk).await?;
            }
        }
        Ok(())
    }

    /// Upload the buffered partial chunk, if any
    ///
    /// For page blobs the buffered length must be a multiple of the page size.
    pub async fn flush(&mut self) -> TransferResult<()> {
        self.ensure_writable()?;
        self.flush_buffer().await
    }

    async fn flush_buffer(&mut self) -> TransferResult<()> {
        if self.state.buffer.is_empty() {
            return Ok(());
        }
        if self.kind == BlobKind::Page && self.state.buffer.len() % PAGE_SIZE != 0 {
            self.state.phase = StreamPhase::Failed;
            return Err(TransferError::invalid(format!(
                "Page blob data must be a multiple of {} bytes, {} bytes remain buffered",
                PAGE_SIZE,
                self.state.buffer.len()
            )));
        }
        let chunk = self.state.buffer.split().freeze();
        self.dispatch(chunk).await
    }

    /// Flush the final partial chunk and finalize the blob
    #[instrument(skip_all, fields(kind = ?self.kind, request_id = %self.ctx.client_request_id))]
    pub async fn commit(&mut self) -> TransferResult<TransferReceipt> {
        if self.state.phase == StreamPhase::Failed {
            return Err(TransferError::state("Cannot commit a failed stream"));
        }
        self.ensure_writable()?;
        self.flush_buffer().await?;
        self.state.phase = StreamPhase::Committing;

        let checksum = self
            .blob_hasher
            .take()
            .map(|hasher| protocol::encode_md5(&protocol::finish_md5(hasher)));

        if let UnitWriter::Block { .. } = &self.unit {
            let blocks: Vec<BlockId> = self
                .state
                .descriptors
                .iter()
                .filter_map(|d| match &d.unit {
                    ChunkUnit::Block(id) => Some(id.clone()),
                    _ => None,
                })
                .collect();
            let mut blob_headers = self.blob_headers.clone();
            blob_headers.content_md5 = checksum.clone();

            let command = StorageCommand::new(
                "put_block_list",
                self.client.uri().clone(),
                move |url, _| protocol::put_block_list(url, &blocks, &blob_headers),
                |parts, attempt| {
                    protocol::check_status(parts, attempt, &[StatusCode::CREATED])?;
                    Ok(parts.header(headers::ETAG).map(str::to_string))
                },
            );
            self.ctx.reset_clock();
            self.ctx.attempts.clear();
            match self.client.execute(command, &mut self.ctx).await {
                Ok(etag) => self.etag = etag,
                Err(err) => {
                    error!(error = %err, "Block list commit failed");
                    self.state.phase = StreamPhase::Failed;
                    return Err(err);
                }
            }
        }

        self.state.phase = StreamPhase::Committed;
        info!(
            bytes = self.state.committed,
            chunks = self.state.descriptors.len(),
            "Blob committed"
        );
        Ok(TransferReceipt {
            kind: self.kind,
            size_bytes: self.state.committed,
            etag: self.etag.clone(),
            checksum,
            chunks: self.state.descriptors.clone(),
            committed_at: Utc::now(),
        })
    }

    async fn dispatch(&mut self, chunk: Bytes) -> TransferResult<()> {
        self.state.phase = StreamPhase::Uploading;
        match self.upload_chunk(chunk).await {
            Ok(()) => {
                self.state.phase = StreamPhase::Buffering;
                Ok(())
            }
            Err(err) => {
                error!(offset = self.state.committed, error = %err, "Chunk upload failed");
                self.state.phase = StreamPhase::Failed;
                Err(err)
            }
        }
    }

    async fn upload_chunk(&mut self, chunk: Bytes) -> TransferResult<()> {
        let offset = self.state.committed;
        let length = chunk.len() as u64;
        let content_md5 = self
            .client
            .config()
            .transactional_md5
            .then(|| protocol::encode_md5(&protocol::md5_of(&chunk)));
        if let Some(hasher) = self.blob_hasher.as_mut() {
            hasher.update(&chunk);
        }
        debug!(offset, length, "Dispatching chunk");
        // History covers the current chunk only
        self.ctx.reset_clock();
        self.ctx.attempts.clear();

        let unit = match &mut self.unit {
            UnitWriter::Block { prefix } => {
                let index = self.state.descriptors.len() as u32;
                if index >= MAX_BLOCKS {
                    return Err(TransferError::invalid(format!(
                        "A block blob holds at most {} blocks",
                        MAX_BLOCKS
                    )));
                }
                let block_id = BlockId::for_index(prefix, index);
                let id = block_id.clone();
                let md5 = content_md5.clone();
                let command = StorageCommand::new(
                    "put_block",
                    self.client.uri().clone(),
                    move |url, _| protocol::put_block(url, &id, chunk.clone(), md5.as_deref()),
                    |parts, attempt| protocol::check_status(parts, attempt, &[StatusCode::CREATED]),
                );
                self.client.execute(command, &mut self.ctx).await?;
                ChunkUnit::Block(block_id)
            }
            UnitWriter::Page { base_offset } => {
                let start = *base_offset + offset;
                let md5 = content_md5.clone();
                let command = StorageCommand::new(
                    "put_page",
                    self.client.uri().clone(),
                    move |url, _| protocol::put_page(url, start, chunk.clone(), md5.as_deref()),
                    |parts, attempt| {
                        protocol::check_status(parts, attempt, &[StatusCode::CREATED])?;
                        Ok(parts.header(headers::ETAG).map(str::to_string))
                    },
                );
                self.etag = self.client.execute(command, &mut self.ctx).await?;
                ChunkUnit::Page {
                    start,
                    end_inclusive: start + length - 1,
                }
            }
            UnitWriter::Append { offsets } => {
                let outcome =
                    append::append_chunk(&self.client, offsets, chunk, content_md5.clone(), &mut self.ctx).await?;
                if outcome.replayed {
                    debug!(offset, "Append was applied by an earlier attempt");
                }
                if outcome.etag.is_some() {
                    self.etag = outcome.etag;
                }
                ChunkUnit::Append {
                    append_offset: outcome.append_offset,
                }
            }
        };

        self.state.committed += length;
        self.state.descriptors.push(ChunkDescriptor {
            offset,
            length,
            content_md5,
            unit,
        });
        Ok(())
    }
}

impl std::fmt::Debug for ChunkedWriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedWriteStream")
            .field("kind", &self.kind)
            .field("chunk_size", &self.chunk_size)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
