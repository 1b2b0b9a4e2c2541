use std::sync::Arc;

use futures_util::StreamExt;
use http::StatusCode;
use tracing::{info, instrument};

use crate::append::AppendOffsetState;
use crate::cipher::{CipherRangeMapping, DecryptingSink};
use crate::config::{MAX_APPEND_BLOCK_SIZE, PAGE_SIZE};
use crate::encryption::{EncryptionData, EncryptionPolicy};
use crate::protocol::{self, headers, BlobHeaders, ContentRange};
use crate::receipt::ResolvedRange;
use crate::retry::policy_from_config;
use crate::{
    codes, AttemptError, BlobKind, BlobProperties, ByteRange, ByteStream, ChunkedWriteStream,
    CommandLocationMode, DownloadReceipt, DownloadSink, EncryptingWriteStream, Executor, HttpTransport,
    OperationContext, RetryPolicy, StorageCommand, StorageUri, TransferConfig, TransferError,
    TransferReceipt, TransferResult,
};

/// Options for a download
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Plaintext range; `None` downloads the whole blob
    pub range: Option<ByteRange>,
    /// Verify MD5s the service reports against the received bytes
    pub validate_md5: bool,
    /// Keys for decrypting client-side encrypted blobs
    pub encryption: Option<EncryptionPolicy>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, offset: u64, length: Option<u64>) -> Self {
        self.range = Some(ByteRange::new(offset, length));
        self
    }

    pub fn validating_md5(mut self) -> Self {
        self.validate_md5 = true;
        self
    }

    pub fn with_encryption(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption = Some(policy);
        self
    }
}

/// Handle on one blob: runs every operation through a shared executor
#[derive(Clone)]
pub struct BlobClient {
    executor: Executor,
    uri: StorageUri,
    config: TransferConfig,
    policy: Arc<dyn RetryPolicy>,
}

impl BlobClient {
    pub fn new(transport: Arc<dyn HttpTransport>, uri: StorageUri, config: TransferConfig) -> Self {
        Self {
            executor: Executor::from_config(transport, &config),
            policy: policy_from_config(&config.retry),
            uri,
            config,
        }
    }

    /// Replace the retry policy built from the config
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn uri(&self) -> &StorageUri {
        &self.uri
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.policy.clone()
    }

    /// Run a command under this client's retry policy
    pub async fn execute<T: Send>(&self, command: StorageCommand<'_, T>, ctx: &mut OperationContext) -> TransferResult<T> {
        self.executor.execute(command, self.policy.as_ref(), ctx).await
    }

    pub async fn get_properties(&self, ctx: &mut OperationContext) -> TransferResult<BlobProperties> {
        let command = StorageCommand::new(
            "get_properties",
            self.uri.clone(),
            |url, _| protocol::get_properties(url),
            |parts, attempt| {
                protocol::check_status(parts, attempt, &[StatusCode::OK])?;
                Ok(protocol::parse_properties(&parts.headers))
            },
        )
        .with_location_mode(CommandLocationMode::PrimaryOrSecondary);
        self.execute(command, ctx).await
    }

    /// Block blob writer; the blob appears when the stream commits
    pub fn open_block_writer(&self) -> TransferResult<ChunkedWriteStream> {
        ChunkedWriteStream::block(self.clone())
    }

    /// Create (or reset) a page blob of `size` bytes
    pub async fn create_page_blob(&self, size: u64, blob: &BlobHeaders, ctx: &mut OperationContext) -> TransferResult<()> {
        if size % PAGE_SIZE as u64 != 0 {
            return Err(TransferError::invalid(format!(
                "Page blob size {} is not a multiple of {}",
                size, PAGE_SIZE
            )));
        }
        let blob = blob.clone();
        let command = StorageCommand::new(
            "create_page_blob",
            self.uri.clone(),
            move |url, _| protocol::create_page_blob(url, size, &blob),
            |parts, attempt| protocol::check_status(parts, attempt, &[StatusCode::CREATED]),
        );
        self.execute(command, ctx).await
    }

    /// Page writer starting at `base_offset` of an existing page blob
    pub fn open_page_writer(&self, base_offset: u64) -> TransferResult<ChunkedWriteStream> {
        ChunkedWriteStream::page(self.clone(), base_offset)
    }

    /// Create (or reset) an empty append blob
    pub async fn create_append_blob(&self, blob: &BlobHeaders, ctx: &mut OperationContext) -> TransferResult<()> {
        let blob = blob.clone();
        let command = StorageCommand::new(
            "create_append_blob",
            self.uri.clone(),
            move |url, _| protocol::create_append_blob(url, &blob),
            |parts, attempt| protocol::check_status(parts, attempt, &[StatusCode::CREATED]),
        );
        self.execute(command, ctx).await
    }

    /// Append writer positioned at the current end of an existing append blob
    pub async fn open_append_writer(&self) -> TransferResult<ChunkedWriteStream> {
        let mut ctx = OperationContext::new();
        let command = StorageCommand::new(
            "get_append_position",
            self.uri.clone(),
            |url, _| protocol::get_properties(url),
            |parts, attempt| {
                protocol::check_status(parts, attempt, &[StatusCode::OK])?;
                Ok(protocol::parse_properties(&parts.headers))
            },
        );
        let properties = self.execute(command, &mut ctx).await?;
        if properties.blob_kind != Some(BlobKind::Append) {
            return Err(TransferError::invalid(format!(
                "Blob is a {:?}, not an append blob",
                properties.blob_kind
            )));
        }
        let mut offsets = AppendOffsetState::new(properties.content_length);
        if !self.config.append_position_precondition {
            offsets = offsets.without_precondition();
        }
        Ok(ChunkedWriteStream::append(self.clone(), offsets)?.with_context(ctx))
    }

    /// Append writer with explicit position tracking
    pub fn append_writer(&self, offsets: AppendOffsetState) -> TransferResult<ChunkedWriteStream> {
        ChunkedWriteStream::append(self.clone(), offsets)
    }

    /// Encrypting block blob writer under a fresh content key
    pub async fn open_encrypted_writer(&self, policy: &EncryptionPolicy) -> TransferResult<EncryptingWriteStream> {
        let (content_key, data) = policy.seal_new_content_key().await?;
        EncryptingWriteStream::new(self.open_block_writer()?, &content_key, &data)
    }

    /// Upload a whole stream as a block blob
    #[instrument(skip_all, fields(blob = %self.uri.primary))]
    pub async fn upload_stream(&self, mut body: ByteStream) -> TransferResult<TransferReceipt> {
        let mut writer = self.open_block_writer()?;
        while let Some(chunk) = body.next().await {
            writer.write(&chunk?).await?;
        }
        writer.commit().await
    }

    /// Upload a whole stream as an encrypted block blob
    #[instrument(skip_all, fields(blob = %self.uri.primary))]
    pub async fn upload_encrypted_stream(
        &self,
        policy: &EncryptionPolicy,
        mut body: ByteStream,
    ) -> TransferResult<TransferReceipt> {
        let mut writer = self.open_encrypted_writer(policy).await?;
        while let Some(chunk) = body.next().await {
            writer.write(&chunk?).await?;
        }
        writer.commit().await
    }

    /// Stream a blob (or range) into `sink`, decrypting when the blob is encrypted
    ///
    /// Properties are read first so that every GET can be pinned to the
    /// blob's ETag; an interrupted body resumes where it stopped.
    #[instrument(skip_all, fields(blob = %self.uri.primary, request_id = %ctx.client_request_id))]
    pub async fn download_to(
        &self,
        sink: &mut dyn DownloadSink,
        options: &DownloadOptions,
        ctx: &mut OperationContext,
    ) -> TransferResult<DownloadReceipt> {
        if options.range.is_some_and(|r| r.is_empty()) {
            return Err(TransferError::invalid("Range length must be positive"));
        }
        ctx.reset_clock();
        let properties = self.get_properties(ctx).await?;

        let Some(data) = EncryptionData::from_metadata(&properties.metadata)? else {
            if self.config.require_encryption {
                return Err(TransferError::encryption(
                    "Blob carries no encryption metadata but encryption is required",
                ));
            }
            ctx.reset_clock();
            let fetched = self
                .fetch(sink, options.range, properties.etag.clone(), options.validate_md5, ctx)
                .await?;
            sink.finish().await?;
            info!(bytes = fetched.bytes_transferred, "Download complete");
            return Ok(DownloadReceipt {
                resolved_range: fetched.resolved(options.range),
                bytes_written: fetched.bytes_transferred,
                properties,
                cipher_mapping: None,
            });
        };

        let policy = options
            .encryption
            .as_ref()
            .ok_or_else(|| TransferError::encryption("Blob is encrypted but no key was supplied"))?;
        let content_key = policy.open_content_key(&data).await?;
        let mapping = CipherRangeMapping::compute(options.range, properties.content_length, true)?;

        let mut decrypting = DecryptingSink::new(sink, &content_key, &mapping);
        ctx.reset_clock();
        let fetched = self
            .fetch(&mut decrypting, mapping.expanded, properties.etag.clone(), options.validate_md5, ctx)
            .await?;
        decrypting
            .finish()
            .await
            .map_err(|e| TransferError::encryption(format!("Decryption failed: {}", e)))?;
        let bytes_written = decrypting.bytes_written();
        info!(
            ciphertext = fetched.bytes_transferred,
            plaintext = bytes_written,
            "Encrypted download complete"
        );
        Ok(DownloadReceipt {
            resolved_range: None,
            bytes_written,
            properties,
            cipher_mapping: Some(mapping),
        })
    }

    /// Download into memory
    pub async fn download_bytes(&self, options: &DownloadOptions, ctx: &mut OperationContext) -> TransferResult<Vec<u8>> {
        let mut out = Vec::new();
        self.download_to(&mut out, options, ctx).await?;
        Ok(out)
    }

    /// One resumable GET streaming into `sink`
    async fn fetch(
        &self,
        sink: &mut dyn DownloadSink,
        range: Option<ByteRange>,
        etag: Option<String>,
        validate_md5: bool,
        ctx: &mut OperationContext,
    ) -> TransferResult<FetchedBody> {
        let range_md5 = validate_md5
            && range
                .and_then(|r| r.length)
                .is_some_and(|len| len <= MAX_APPEND_BLOCK_SIZE as u64);

        let mut command = StorageCommand::new(
            "get_blob",
            self.uri.clone(),
            move |url, attempt| {
                let current = match range {
                    Some(r) => Some(r.advance(attempt.bytes_transferred)),
                    None if attempt.bytes_transferred > 0 => Some(ByteRange::from_offset(attempt.bytes_transferred)),
                    None => None,
                };
                let if_match = attempt.locked_etag.as_deref().or(etag.as_deref());
                protocol::get_blob(url, current, if_match, range_md5)
            },
            |parts, attempt| {
                protocol::check_status(parts, attempt, &[StatusCode::OK, StatusCode::PARTIAL_CONTENT])?;
                if attempt.locked_etag.is_none() {
                    attempt.locked_etag = parts.header(headers::ETAG).map(str::to_string);
                }
                Ok(FetchedBody {
                    content_range: parts
                        .header(headers::CONTENT_RANGE)
                        .and_then(protocol::parse_content_range),
                    content_md5: parts.header(headers::CONTENT_MD5).map(str::to_string),
                    bytes_transferred: 0,
                })
            },
        )
        .with_location_mode(CommandLocationMode::PrimaryOrSecondary)
        .with_destination(sink)
        .with_postprocess(move |body, digest, attempt| {
            body.bytes_transferred = attempt.bytes_transferred;
            let (Some(expected), Some(actual)) = (body.content_md5.as_deref(), digest.md5) else {
                return Ok(());
            };
            if validate_md5 && protocol::encode_md5(&actual) != expected {
                return Err(AttemptError::fatal_code(
                    codes::MD5_MISMATCH,
                    format!("Downloaded content MD5 {} does not match {}", protocol::encode_md5(&actual), expected),
                ));
            }
            Ok(())
        });
        if validate_md5 {
            command = command.hashing_body();
        }
        self.execute(command, ctx).await
    }
}

impl std::fmt::Debug for BlobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobClient")
            .field("uri", &self.uri)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What a GET delivered
#[derive(Debug, Clone)]
struct FetchedBody {
    content_range: Option<ContentRange>,
    content_md5: Option<String>,
    bytes_transferred: u64,
}

impl FetchedBody {
    fn resolved(&self, requested: Option<ByteRange>) -> Option<ResolvedRange> {
        let requested = requested?;
        let total = self.content_range.and_then(|r| r.total)?;
        if self.bytes_transferred == 0 {
            return None;
        }
        Some(ResolvedRange {
            start: requested.offset,
            end: requested.offset + self.bytes_transferred - 1,
            total_size: total,
        })
    }
}
