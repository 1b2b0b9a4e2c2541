//! Append-position protocol
//!
//! Every append carries the position the writer last observed. When an
//! attempt fails ambiguously the recovery action reads the blob length back:
//! unchanged means resubmit, advanced by exactly this block means the service
//! already applied it and the resubmission's precondition failure counts as
//! success. Anything else is another writer and ends the operation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{AttemptContext, RecoveryAction, ResponseParts};
use crate::protocol::{self, headers, AppendConditions};
use crate::{
    codes, AttemptError, BlobClient, CommandLocationMode, Executor, OperationContext, RetryPolicy,
    StorageCommand, StorageUri, TransferError, TransferResult,
};

/// Position tracking for a single append writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOffsetState {
    /// Length of the blob as last acknowledged by the service
    pub last_offset: u64,
    /// Send the append-position precondition with each append
    pub precondition: bool,
    /// Optional cap on the blob size
    pub max_size: Option<u64>,
}

impl AppendOffsetState {
    pub fn new(last_offset: u64) -> Self {
        Self {
            last_offset,
            precondition: true,
            max_size: None,
        }
    }

    pub fn without_precondition(mut self) -> Self {
        self.precondition = false;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    fn conditions(&self) -> AppendConditions {
        AppendConditions {
            append_position: self.precondition.then_some(self.last_offset),
            max_size: self.max_size,
        }
    }
}

/// Re-reads the blob length between append attempts
pub struct AppendRecovery {
    executor: Executor,
    uri: StorageUri,
    policy: Arc<dyn RetryPolicy>,
    client_request_id: String,
    cancellation: CancellationToken,
    expected: u64,
    length: u64,
}

impl AppendRecovery {
    fn new(client: &BlobClient, ctx: &OperationContext, expected: u64, length: u64) -> Self {
        Self {
            executor: client.executor().clone(),
            uri: client.uri().clone(),
            policy: client.retry_policy(),
            client_request_id: ctx.client_request_id.clone(),
            cancellation: ctx.cancellation.clone(),
            expected,
            length,
        }
    }
}

#[async_trait]
impl RecoveryAction for AppendRecovery {
    async fn recover(&mut self, failure: &AttemptError, attempt: &mut AttemptContext) -> TransferResult<()> {
        let mut ctx = OperationContext::new()
            .with_client_request_id(self.client_request_id.clone())
            .with_cancellation(self.cancellation.clone());
        let command = StorageCommand::new(
            "append_position_check",
            self.uri.clone(),
            |url, _| protocol::get_properties(url),
            |parts, attempt| {
                protocol::check_status(parts, attempt, &[StatusCode::OK])?;
                Ok(protocol::parse_properties(&parts.headers).content_length)
            },
        )
        .with_location_mode(CommandLocationMode::PrimaryOnly);
        let actual = self.executor.execute(command, self.policy.as_ref(), &mut ctx).await?;

        if actual == self.expected {
            debug!(offset = actual, %failure, "Append not applied, resubmitting");
            attempt.already_applied = false;
            Ok(())
        } else if actual == self.expected + self.length {
            warn!(offset = self.expected, length = self.length, "Append already applied by a failed attempt");
            attempt.already_applied = true;
            Ok(())
        } else {
            Err(TransferError::AppendConflict {
                expected: self.expected,
                actual,
            })
        }
    }
}

/// Append one block at the tracked position and advance it
///
/// Returns the offset the block landed at.
pub(crate) async fn append_chunk(
    client: &BlobClient,
    state: &mut AppendOffsetState,
    body: Bytes,
    content_md5: Option<String>,
    ctx: &mut OperationContext,
) -> TransferResult<AppendOutcome> {
    let expected = state.last_offset;
    let length = body.len() as u64;
    let conditions = state.conditions();

    let mut command = StorageCommand::new(
        "append_block",
        client.uri().clone(),
        move |url, _| protocol::append_block(url, body.clone(), content_md5.as_deref(), conditions),
        move |parts, attempt| append_response(parts, attempt, expected),
    );
    if state.precondition {
        command = command.with_recovery(AppendRecovery::new(client, ctx, expected, length));
    }

    let outcome = client.execute(command, ctx).await?;
    state.last_offset = outcome.append_offset + length;
    Ok(outcome)
}

/// What the service reported for an append
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppendOutcome {
    pub append_offset: u64,
    pub etag: Option<String>,
    /// The block was applied by an earlier attempt
    pub replayed: bool,
}

fn append_response(parts: &ResponseParts, attempt: &mut AttemptContext, expected: u64) -> Result<AppendOutcome, AttemptError> {
    if parts.status == StatusCode::PRECONDITION_FAILED && attempt.already_applied {
        let failure = protocol::classify_failure(parts.status, &parts.headers, &parts.body, attempt.location);
        if failure.has_code(codes::APPEND_POSITION_CONDITION_NOT_MET) {
            return Ok(AppendOutcome {
                append_offset: expected,
                etag: None,
                replayed: true,
            });
        }
        return Err(failure);
    }
    protocol::check_status(parts, attempt, &[StatusCode::CREATED])?;
    let append_offset = parts
        .header(headers::APPEND_OFFSET)
        .and_then(|v| v.parse().ok())
        .unwrap_or(expected);
    Ok(AppendOutcome {
        append_offset,
        etag: parts.header(headers::ETAG).map(str::to_string),
        replayed: false,
    })
}
