use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use dog_transfer::{
    codes, AppendOffsetState, BlobClient, BlobHeaders, BlobKind, DownloadOptions, DownloadSink, EncryptionPolicy, Fault, LocationMode,
    MemoryBlobService, Operation, OperationContext, RetryConfig, StorageLocation, StreamPhase, SymmetricKey,
    TransferConfig, TransferError, WriterSink,
};

/// Test factory functions
fn fast_config(chunk_size: usize) -> TransferConfig {
    TransferConfig::default()
        .with_chunk_size(chunk_size)
        .with_retry(RetryConfig::linear(3, Duration::from_millis(1)))
}

fn client_for(service: &Arc<MemoryBlobService>, path: &str, config: TransferConfig) -> BlobClient {
    BlobClient::new(service.clone(), service.uri(path), config)
}

fn test_policy() -> EncryptionPolicy {
    EncryptionPolicy::with_key(Arc::new(SymmetricKey::new("kek-1", [7u8; 32])))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn upload_block(client: &BlobClient, data: &[u8]) {
    let mut writer = client.open_block_writer().unwrap();
    writer.write(data).await.unwrap();
    writer.commit().await.unwrap();
}

/// A1. Block Upload Splits Into Fixed Chunks
#[tokio::test]
async fn test_block_upload_splits_into_fixed_chunks() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/letters", fast_config(4));

    // Arrange: one write larger than two chunks
    let mut writer = client.open_block_writer().unwrap();

    // Act
    writer.write(b"ABCDEFGHIJ").await.unwrap();
    let receipt = writer.commit().await.unwrap();

    // Assert: three blocks of 4, 4 and 2 bytes, one commit
    let lengths: Vec<u64> = receipt.chunks.iter().map(|c| c.length).collect();
    let offsets: Vec<u64> = receipt.chunks.iter().map(|c| c.offset).collect();
    assert_eq!(lengths, vec![4, 4, 2]);
    assert_eq!(offsets, vec![0, 4, 8]);
    assert_eq!(service.request_count(Operation::PutBlock), 3);
    assert_eq!(service.request_count(Operation::PutBlockList), 1);
    assert_eq!(service.blob_bytes("c/letters").unwrap(), b"ABCDEFGHIJ");
    assert_eq!(receipt.size_bytes, 10);
}

/// A2. Many Small Writes Coalesce
#[tokio::test]
async fn test_small_writes_coalesce() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/drip", fast_config(4));
    let mut writer = client.open_block_writer().unwrap();

    // Act: one byte at a time
    for byte in b"ABCDEFGHIJ" {
        writer.write(&[*byte]).await.unwrap();
    }
    assert_eq!(writer.state().buffered(), 2);
    writer.commit().await.unwrap();

    // Assert: same block layout as a single write
    assert_eq!(service.request_count(Operation::PutBlock), 3);
    assert_eq!(service.blob_bytes("c/drip").unwrap(), b"ABCDEFGHIJ");
}

/// A3. Empty Stream Commits An Empty Blob
#[tokio::test]
async fn test_empty_stream_commits_empty_blob() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/empty", fast_config(4));

    let mut writer = client.open_block_writer().unwrap();
    let receipt = writer.commit().await.unwrap();

    assert_eq!(receipt.chunk_count(), 0);
    assert_eq!(service.request_count(Operation::PutBlock), 0);
    assert_eq!(service.blob_bytes("c/empty").unwrap(), Vec::<u8>::new());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A4. Any Length Round-Trips Through Chunked Upload
    #[test]
    fn prop_block_upload_preserves_bytes(len in 0usize..70, split in 1usize..20) {
        tokio_test::block_on(async {
            let service = Arc::new(MemoryBlobService::new());
            let client = client_for(&service, "c/prop", fast_config(8));
            let data = pattern(len);

            let mut writer = client.open_block_writer().unwrap();
            for piece in data.chunks(split) {
                writer.write(piece).await.unwrap();
            }
            let receipt = writer.commit().await.unwrap();

            prop_assert_eq!(service.blob_bytes("c/prop").unwrap(), data);
            prop_assert_eq!(receipt.chunk_count(), len.div_ceil(8));
            prop_assert!(receipt.chunks.iter().all(|c| c.length == 8 || c.offset + c.length == len as u64));
            Ok(())
        })?;
    }
}

/// B1. Transient Failures Are Retried Without Duplicating Data
#[tokio::test]
async fn test_transient_failures_retry_without_duplicates() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/busy", fast_config(4));

    // Arrange: the second block hits two busy responses
    let mut writer = client.open_block_writer().unwrap();
    writer.write(b"ABCD").await.unwrap();
    service.inject_times(Operation::PutBlock, None, Fault::server_busy(), 2);

    // Act
    writer.write(b"EFGHIJ").await.unwrap();
    let retried = writer.context().attempts.len();
    writer.commit().await.unwrap();

    // Assert: content exactly once, extra requests only for the retried block
    assert_eq!(service.blob_bytes("c/busy").unwrap(), b"ABCDEFGHIJ");
    assert_eq!(service.request_count(Operation::PutBlock), 5);
    assert_eq!(retried, 3);
    assert_eq!(writer.context().attempts.len(), 1);
}

/// B2. Corrupted Chunk Fails The Stream
#[tokio::test]
async fn test_md5_mismatch_fails_stream() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/corrupt", fast_config(4).with_transactional_md5());

    // Arrange: flip a byte of the first block in transit
    service.inject(Operation::PutBlock, Fault::CorruptRequestBody);
    let mut writer = client.open_block_writer().unwrap();

    // Act
    let err = writer.write(b"ABCD").await.unwrap_err();

    // Assert: not retried, stream unusable
    assert_eq!(err.error_code(), Some(codes::MD5_MISMATCH));
    assert_eq!(service.request_count(Operation::PutBlock), 1);
    assert_eq!(writer.phase(), StreamPhase::Failed);
    assert!(matches!(writer.commit().await, Err(TransferError::State { .. })));
    assert!(service.blob_bytes("c/corrupt").is_none());
}

/// B3. Exhausted Retries Report Every Attempt
#[tokio::test]
async fn test_exhausted_retries_report_history() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/down", fast_config(4));
    service.inject_times(Operation::PutBlock, None, Fault::status(500), 10);

    let mut writer = client.open_block_writer().unwrap();
    let err = writer.write(b"ABCD").await.unwrap_err();

    let (attempts, history) = match err {
        TransferError::RetriesExhausted { attempts, history, .. } => (attempts, history),
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(attempts, 4);
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|a| a.status == Some(500)));
}

/// B4. Interrupted Write Cannot Be Committed
#[tokio::test]
async fn test_interrupted_write_fails_stream() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/dropped", fast_config(4));
    let mut writer = client.open_block_writer().unwrap();
    writer.write(b"ABCD").await.unwrap();

    // Arrange: the second block stalls long enough for the caller to give up
    service.inject(Operation::PutBlock, Fault::Delay(Duration::from_secs(2)));

    // Act: drop the write future mid-upload, then try to commit
    let timed_out = tokio::time::timeout(Duration::from_millis(50), writer.write(b"EFGH")).await;
    assert!(timed_out.is_err());
    let err = writer.commit().await.unwrap_err();

    // Assert: nothing is committed with a gap
    assert!(matches!(err, TransferError::State { .. }));
    assert_eq!(writer.phase(), StreamPhase::Failed);
    assert_eq!(service.request_count(Operation::PutBlockList), 0);
    assert!(service.blob_bytes("c/dropped").is_none());
    assert!(matches!(writer.write(b"IJ").await, Err(TransferError::State { .. })));
}

/// B5. Attempt History Stays Bounded Over Many Chunks
#[tokio::test]
async fn test_attempt_history_is_per_chunk() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/many", fast_config(1));
    let data = pattern(500);

    let mut writer = client.open_block_writer().unwrap();
    writer.write(&data).await.unwrap();

    // Only the last chunk's attempt is kept
    assert_eq!(writer.context().attempts.len(), 1);
    assert_eq!(writer.state().descriptors().len(), 500);

    writer.commit().await.unwrap();
    assert_eq!(writer.context().attempts.len(), 1);
    assert_eq!(service.blob_bytes("c/many").unwrap(), data);
}

/// C1. Page Blob Writes Land At Their Offsets
#[tokio::test]
async fn test_page_blob_writes_land_at_offsets() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/disk", fast_config(512));
    let mut ctx = OperationContext::new();
    client.create_page_blob(2048, &BlobHeaders::default(), &mut ctx).await.unwrap();

    // Act: write the middle two pages
    let mut writer = client.open_page_writer(512).unwrap();
    writer.write(&[0xAB; 1024]).await.unwrap();
    writer.commit().await.unwrap();

    // Assert
    let stored = service.blob_bytes("c/disk").unwrap();
    assert_eq!(stored.len(), 2048);
    assert!(stored[..512].iter().all(|b| *b == 0));
    assert!(stored[512..1536].iter().all(|b| *b == 0xAB));
    assert!(stored[1536..].iter().all(|b| *b == 0));
    assert_eq!(service.request_count(Operation::PutPage), 2);
}

/// C2. Unaligned Page Tail Is Rejected At Commit
#[tokio::test]
async fn test_unaligned_page_tail_rejected() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/disk2", fast_config(512));
    client
        .create_page_blob(1024, &BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();

    let mut writer = client.open_page_writer(0).unwrap();
    writer.write(&[1u8; 700]).await.unwrap();
    let err = writer.commit().await.unwrap_err();

    assert!(matches!(err, TransferError::Invalid { .. }));
    assert_eq!(service.request_count(Operation::PutPage), 1);
}

/// D1. Lost Append Response Is Not Replayed
#[tokio::test]
async fn test_lost_append_response_is_not_duplicated() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/log", fast_config(4));
    client
        .create_append_blob(&BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();

    // Arrange: the first append is applied but its response is lost
    service.inject(Operation::AppendBlock, Fault::DropResponse);
    let mut writer = client.open_append_writer().await.unwrap();

    // Act
    writer.write(b"ABCDEFGH").await.unwrap();
    let receipt = writer.commit().await.unwrap();

    // Assert: each block stored once, position read once
    assert_eq!(service.blob_bytes("c/log").unwrap(), b"ABCDEFGH");
    assert_eq!(receipt.size_bytes, 8);
    assert_eq!(writer.append_offset(), Some(8));
    assert_eq!(service.request_count(Operation::AppendBlock), 3);
    // one length read to open the writer, one during recovery
    assert_eq!(service.request_count(Operation::GetProperties), 2);
}

/// D2. Append That Never Arrived Is Resubmitted
#[tokio::test]
async fn test_unapplied_append_is_resubmitted() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/log2", fast_config(4));
    client
        .create_append_blob(&BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();
    service.inject(Operation::AppendBlock, Fault::Timeout);

    let mut writer = client.open_append_writer().await.unwrap();
    writer.write(b"WXYZ").await.unwrap();
    writer.commit().await.unwrap();

    assert_eq!(service.blob_bytes("c/log2").unwrap(), b"WXYZ");
    assert_eq!(service.request_count(Operation::AppendBlock), 2);
}

/// D3. Foreign Append Surfaces A Position Conflict
#[tokio::test]
async fn test_foreign_append_is_a_conflict() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/shared", fast_config(4));
    client
        .create_append_blob(&BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();

    // Arrange: two writers opened at the same position
    let mut first = client.open_append_writer().await.unwrap();
    let mut second = client.open_append_writer().await.unwrap();
    first.write(b"1111").await.unwrap();

    // Act
    let err = second.write(b"2222").await.unwrap_err();

    // Assert: the precondition protects the first writer's data
    assert_eq!(err.error_code(), Some(codes::APPEND_POSITION_CONDITION_NOT_MET));
    assert_eq!(service.blob_bytes("c/shared").unwrap(), b"1111");
}

/// D4. Precondition Opt-Out Appends Wherever The Blob Ends
#[tokio::test]
async fn test_append_without_precondition() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/loose", fast_config(4).without_append_precondition());
    client
        .create_append_blob(&BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();

    let mut first = client.open_append_writer().await.unwrap();
    let mut second = client.open_append_writer().await.unwrap();
    first.write(b"1111").await.unwrap();
    second.write(b"2222").await.unwrap();

    assert_eq!(service.blob_bytes("c/loose").unwrap(), b"11112222");
    assert_eq!(second.append_offset(), Some(8));
}

/// D5. Max-Size Condition Stops An Oversized Append
#[tokio::test]
async fn test_append_max_size_condition() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/capped", fast_config(4));
    client
        .create_append_blob(&BlobHeaders::default(), &mut OperationContext::new())
        .await
        .unwrap();

    let mut writer = client
        .append_writer(AppendOffsetState::new(0).with_max_size(6))
        .unwrap();
    writer.write(b"ABCD").await.unwrap();
    let err = writer.write(b"EFGH").await.unwrap_err();

    assert_eq!(err.error_code(), Some(codes::MAX_BLOB_SIZE_CONDITION_NOT_MET));
    assert_eq!(service.blob_bytes("c/capped").unwrap(), b"ABCD");
}

/// E1. Encrypted Upload Round-Trips
#[tokio::test]
async fn test_encrypted_round_trip() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/vault", fast_config(16));
    let policy = test_policy();
    let plaintext = pattern(45);

    // Act
    let mut writer = client.open_encrypted_writer(&policy).await.unwrap();
    writer.write(&plaintext).await.unwrap();
    let receipt = writer.commit().await.unwrap();

    // Assert: padded ciphertext at rest, plaintext on the way out
    assert_eq!(receipt.size_bytes, 48);
    assert_ne!(service.blob_bytes("c/vault").unwrap()[..45], plaintext[..]);
    let mut out = Vec::new();
    let download = client
        .download_to(
            &mut out,
            &DownloadOptions::new().with_encryption(policy),
            &mut OperationContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(out, plaintext);
    assert!(download.was_decrypted());
    assert_eq!(download.bytes_written, 45);
}

/// E2. Plaintext Ranges Decrypt From Covering Blocks
#[tokio::test]
async fn test_encrypted_ranges() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/ranges", fast_config(16));
    let policy = test_policy();
    let plaintext = pattern(45);
    let mut writer = client.open_encrypted_writer(&policy).await.unwrap();
    writer.write(&plaintext).await.unwrap();
    writer.commit().await.unwrap();

    let cases: [(u64, Option<u64>); 7] = [
        (5, Some(10)),
        (0, Some(1)),
        (16, Some(16)),
        (15, Some(2)),
        (30, None),
        (44, Some(1)),
        (40, Some(100)),
    ];
    for (offset, length) in cases {
        let options = DownloadOptions::new()
            .with_range(offset, length)
            .with_encryption(policy.clone());
        let out = client.download_bytes(&options, &mut OperationContext::new()).await.unwrap();
        let end = length.map_or(45, |l| (offset + l).min(45)) as usize;
        assert_eq!(out, plaintext[offset as usize..end], "range {offset} {length:?}");
    }
}

/// E3. Encrypted Empty Blob Decrypts To Nothing
#[tokio::test]
async fn test_encrypted_empty_blob() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/none", fast_config(16));
    let policy = test_policy();
    let mut writer = client.open_encrypted_writer(&policy).await.unwrap();
    writer.commit().await.unwrap();

    assert_eq!(service.blob_bytes("c/none").unwrap().len(), 16);
    let out = client
        .download_bytes(&DownloadOptions::new().with_encryption(policy), &mut OperationContext::new())
        .await
        .unwrap();
    assert!(out.is_empty());
}

/// E4. Wrong Key Cannot Open The Content Key
#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let service = Arc::new(MemoryBlobService::new());
    let client = client_for(&service, "c/locked", fast_config(16));
    let mut writer = client.open_encrypted_writer(&test_policy()).await.unwrap();
    writer.write(b"classified").await.unwrap();
    writer.commit().await.unwrap();

    let other = EncryptionPolicy::with_key(Arc::new(SymmetricKey::new("kek-1", [9u8; 32])));
    let err = client
        .download_bytes(&DownloadOptions::new().with_encryption(other), &mut OperationContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Encryption { .. }));
}

/// E5. Encrypted Download Resumes After A Truncated Body
#[tokio::test]
async fn test_encrypted_download_resumes() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(5));
    let client = client_for(&service, "c/sealed", fast_config(16));
    let policy = test_policy();
    let plaintext = pattern(45);
    let mut writer = client.open_encrypted_writer(&policy).await.unwrap();
    writer.write(&plaintext).await.unwrap();
    writer.commit().await.unwrap();

    // Arrange: cut the ciphertext mid-block
    service.inject(Operation::GetBlob, Fault::TruncateResponse { after: 21 });

    // Act
    let out = client
        .download_bytes(&DownloadOptions::new().with_encryption(policy), &mut OperationContext::new())
        .await
        .unwrap();

    // Assert: the held-back block survives the resume
    assert_eq!(out, plaintext);
    let gets = service
        .requests()
        .into_iter()
        .filter(|r| r.operation == Some(Operation::GetBlob))
        .count();
    assert_eq!(gets, 2);
}

/// E6. Encrypted Range Resumes Inside Its Covering Blocks
#[tokio::test]
async fn test_encrypted_ranged_download_resumes() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(5));
    let client = client_for(&service, "c/sealed-range", fast_config(16));
    let policy = test_policy();
    let plaintext = pattern(45);
    let mut writer = client.open_encrypted_writer(&policy).await.unwrap();
    writer.write(&plaintext).await.unwrap();
    writer.commit().await.unwrap();

    let cases: [(u64, u64, usize); 2] = [(20, 20, 21), (5, 10, 7)];
    for (offset, length, cut) in cases {
        service.inject(Operation::GetBlob, Fault::TruncateResponse { after: cut });
        let options = DownloadOptions::new()
            .with_range(offset, Some(length))
            .with_encryption(policy.clone());

        let out = client.download_bytes(&options, &mut OperationContext::new()).await.unwrap();

        let end = (offset + length) as usize;
        assert_eq!(out, plaintext[offset as usize..end], "range {offset}+{length}");
    }
}

/// F1. Truncated Download Resumes Where It Stopped
#[tokio::test]
async fn test_truncated_download_resumes() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(3));
    service.insert_blob("c/movie", BlobKind::Block, pattern(20), BTreeMap::new());
    let client = client_for(&service, "c/movie", fast_config(8));

    // Arrange: cut the first body after 7 bytes
    service.inject(Operation::GetBlob, Fault::TruncateResponse { after: 7 });

    // Act
    let out = client
        .download_bytes(&DownloadOptions::new(), &mut OperationContext::new())
        .await
        .unwrap();

    // Assert: no byte delivered twice, second GET asks for the rest
    assert_eq!(out, pattern(20));
    let ranges: Vec<Option<String>> = service
        .requests()
        .into_iter()
        .filter(|r| r.operation == Some(Operation::GetBlob))
        .map(|r| r.range)
        .collect();
    assert_eq!(ranges, vec![None, Some("bytes=7-".to_string())]);
}

/// F2. Resumed Ranged Download Stays Inside The Range
#[tokio::test]
async fn test_truncated_ranged_download_resumes() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(2));
    service.insert_blob("c/clip", BlobKind::Block, pattern(40), BTreeMap::new());
    let client = client_for(&service, "c/clip", fast_config(8));
    service.inject(Operation::GetBlob, Fault::TruncateResponse { after: 4 });

    let options = DownloadOptions::new().with_range(10, Some(12)).validating_md5();
    let out = client.download_bytes(&options, &mut OperationContext::new()).await.unwrap();

    assert_eq!(out, pattern(40)[10..22]);
    let last = service.requests().into_iter().rev().find(|r| r.operation == Some(Operation::GetBlob)).unwrap();
    assert_eq!(last.range.as_deref(), Some("bytes=14-21"));
}

/// F3. Download Streams Into Any AsyncWrite
#[tokio::test]
async fn test_download_into_async_writer() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(5));
    service.insert_blob("c/file", BlobKind::Block, pattern(33), BTreeMap::new());
    let client = client_for(&service, "c/file", fast_config(8));

    let mut sink = WriterSink::new(Vec::new());
    let receipt = client
        .download_to(&mut sink, &DownloadOptions::new().validating_md5(), &mut OperationContext::new())
        .await
        .unwrap();

    assert_eq!(receipt.bytes_written, 33);
    assert_eq!(sink.bytes_written(), 33);
    assert_eq!(sink.into_inner(), pattern(33));
}

/// Sink that overwrites the blob while the first body streams
struct MutatingSink {
    service: Arc<MemoryBlobService>,
    path: &'static str,
    received: Vec<u8>,
    mutated: bool,
}

#[async_trait]
impl DownloadSink for MutatingSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
        if !self.mutated {
            self.service.overwrite_blob(self.path, b"something else entirely".to_vec());
            self.mutated = true;
        }
        self.received.extend_from_slice(&chunk);
        Ok(())
    }
}

/// F4. Resume Refuses A Blob That Changed Underneath
#[tokio::test]
async fn test_resume_is_pinned_to_etag() {
    let service = Arc::new(MemoryBlobService::new().with_response_chunk_size(2));
    service.insert_blob("c/moving", BlobKind::Block, pattern(16), BTreeMap::new());
    let client = client_for(&service, "c/moving", fast_config(8));
    service.inject(Operation::GetBlob, Fault::TruncateResponse { after: 4 });

    let mut sink = MutatingSink {
        service: service.clone(),
        path: "c/moving",
        received: Vec::new(),
        mutated: false,
    };
    let err = client
        .download_to(&mut sink, &DownloadOptions::new(), &mut OperationContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), Some(codes::CONDITION_NOT_MET));
    assert_eq!(sink.received, pattern(16)[..4]);
}

/// G1. Reads Fail Over To The Secondary
#[tokio::test]
async fn test_reads_fail_over_to_secondary() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/geo", BlobKind::Block, b"replicated".to_vec(), BTreeMap::new());
    let config = fast_config(8).with_location_mode(LocationMode::PrimaryThenSecondary);
    let client = client_for(&service, "c/geo", config);
    service.inject_times(Operation::GetBlob, Some(StorageLocation::Primary), Fault::server_busy(), 1);

    let mut ctx = OperationContext::new();
    let out = client.download_bytes(&DownloadOptions::new(), &mut ctx).await.unwrap();

    assert_eq!(out, b"replicated");
    let last = ctx.last_attempt().unwrap();
    assert_eq!(last.location, StorageLocation::Secondary);
    assert!(last.succeeded());
}

/// G2. A Secondary Miss Pins Retries To The Primary
#[tokio::test]
async fn test_secondary_not_found_pins_primary() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/lag", BlobKind::Block, b"fresh".to_vec(), BTreeMap::new());
    let config = fast_config(8).with_location_mode(LocationMode::PrimaryThenSecondary);
    let client = client_for(&service, "c/lag", config);

    // Arrange: primary busy, secondary has not caught up yet
    service.inject_times(Operation::GetProperties, Some(StorageLocation::Primary), Fault::server_busy(), 1);
    service.inject_times(
        Operation::GetProperties,
        Some(StorageLocation::Secondary),
        Fault::Status {
            status: 404,
            code: Some(codes::BLOB_NOT_FOUND.to_string()),
        },
        5,
    );

    // Act
    let mut ctx = OperationContext::new();
    let properties = client.get_properties(&mut ctx).await.unwrap();

    // Assert: primary, secondary, then primary only
    assert_eq!(properties.content_length, 5);
    let locations: Vec<StorageLocation> = ctx.attempts.iter().map(|a| a.location).collect();
    assert_eq!(
        locations,
        vec![StorageLocation::Primary, StorageLocation::Secondary, StorageLocation::Primary]
    );
}

/// G3. Writes Never Reach The Secondary
#[tokio::test]
async fn test_writes_stay_on_primary() {
    let service = Arc::new(MemoryBlobService::new());
    let config = fast_config(4).with_location_mode(LocationMode::PrimaryThenSecondary);
    let client = client_for(&service, "c/w", config);
    service.inject(Operation::PutBlock, Fault::server_busy());

    upload_block(&client, b"ABCD").await;

    assert!(service
        .requests()
        .iter()
        .all(|r| r.location == StorageLocation::Primary));
}

/// H1. Cancelled Context Sends Nothing
#[tokio::test]
async fn test_cancelled_context_sends_nothing() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/x", BlobKind::Block, b"data".to_vec(), BTreeMap::new());
    let client = client_for(&service, "c/x", fast_config(8));
    let token = CancellationToken::new();
    token.cancel();

    let mut ctx = OperationContext::new().with_cancellation(token);
    let err = client.download_bytes(&DownloadOptions::new(), &mut ctx).await.unwrap_err();

    assert!(matches!(err, TransferError::Cancelled { attempts: 0 }));
    assert!(service.requests().is_empty());
}

/// H2. Cancellation Interrupts A Retry Delay
#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/slow", BlobKind::Block, b"data".to_vec(), BTreeMap::new());
    let config = TransferConfig::default().with_retry(RetryConfig::linear(5, Duration::from_secs(30)));
    let client = client_for(&service, "c/slow", config);
    service.inject_times(Operation::GetProperties, None, Fault::server_busy(), 10);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let mut ctx = OperationContext::new().with_cancellation(token);
    let started = std::time::Instant::now();
    let err = client.get_properties(&mut ctx).await.unwrap_err();

    assert!(matches!(err, TransferError::Cancelled { attempts: 1 }));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// I1. Slow Attempts Time Out And Retry
#[tokio::test]
async fn test_attempt_timeout_retries() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/t", BlobKind::Block, b"data".to_vec(), BTreeMap::new());
    let config = fast_config(8).with_attempt_timeout(Some(Duration::from_millis(50)));
    let client = client_for(&service, "c/t", config);
    service.inject(Operation::GetProperties, Fault::Delay(Duration::from_secs(5)));

    let mut ctx = OperationContext::new();
    let properties = client.get_properties(&mut ctx).await.unwrap();

    assert_eq!(properties.content_length, 4);
    assert_eq!(ctx.attempts.len(), 2);
    let first = ctx.attempts[0].failure.as_ref().unwrap();
    assert!(first.has_code(codes::OPERATION_TIMED_OUT));
}

/// I2. Maximum Execution Time Bounds All Retries
#[tokio::test]
async fn test_maximum_execution_time() {
    let service = Arc::new(MemoryBlobService::new());
    service.insert_blob("c/m", BlobKind::Block, b"data".to_vec(), BTreeMap::new());
    let config = TransferConfig::default()
        .with_retry(RetryConfig::linear(50, Duration::from_millis(20)))
        .with_maximum_execution_time(Duration::from_millis(100));
    let client = client_for(&service, "c/m", config);
    service.inject_times(Operation::GetProperties, None, Fault::server_busy(), 100);

    let err = client.get_properties(&mut OperationContext::new()).await.unwrap_err();

    assert!(matches!(err, TransferError::TimedOut { .. }));
    assert!(service.request_count(Operation::GetProperties) < 10);
}
