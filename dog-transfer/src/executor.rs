use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use md5::{Digest, Md5};
use tracing::{debug, error, instrument, warn};

use crate::command::{AttemptContext, BodyDigest, ResponseParts};
use crate::protocol::{self, headers};
use crate::{
    codes, AttemptError, CommandLocationMode, ExecutionAttempt, HttpTransport, LocationMode,
    OperationContext, RetryContext, RetryPolicy, StorageCommand, StorageLocation, TransferConfig,
    TransferError, TransferResult, TransportError, TransportResponse,
};

/// Runs storage commands to completion, applying retry policy, failover and recovery
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn HttpTransport>,
    location_mode: LocationMode,
    attempt_timeout: Option<Duration>,
    maximum_execution_time: Option<Duration>,
}

impl Executor {
    /// Create an executor with default settings
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::from_config(transport, &TransferConfig::default())
    }

    /// Create an executor honoring the location and timeout settings of `config`
    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &TransferConfig) -> Self {
        Self {
            transport,
            location_mode: config.location_mode,
            attempt_timeout: config.attempt_timeout,
            maximum_execution_time: config.maximum_execution_time,
        }
    }

    pub fn location_mode(&self) -> LocationMode {
        self.location_mode
    }

    /// Execute a command until it succeeds, fails fatally, is cancelled or the policy gives up
    #[instrument(skip_all, fields(command = command.name, request_id = %ctx.client_request_id))]
    pub async fn execute<'a, T: Send>(
        &self,
        mut command: StorageCommand<'a, T>,
        policy: &dyn RetryPolicy,
        ctx: &mut OperationContext,
    ) -> TransferResult<T> {
        let mut mode = self.location_mode;
        let mut location = initial_location(&command, mode)?;
        let mut attempt = AttemptContext::new(location);
        let mut retries = 0u32;
        let history_start = ctx.attempts.len();

        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(TransferError::Cancelled {
                    attempts: attempt.attempt,
                });
            }
            let remaining = self.remaining_time(ctx, attempt.attempt)?;

            attempt.attempt += 1;
            attempt.location = location;
            attempt.attempt_start_offset = attempt.bytes_transferred;
            attempt.status = None;
            debug!(attempt = attempt.attempt, %location, offset = attempt.bytes_transferred, "Starting attempt");

            let started = Instant::now();
            let limit = match (self.attempt_timeout, remaining) {
                (Some(a), Some(r)) => Some(a.min(r)),
                (a, r) => a.or(r),
            };
            let outcome = {
                let cancellation = ctx.cancellation.clone();
                let run = run_attempt(
                    self.transport.as_ref(),
                    &mut command,
                    &mut attempt,
                    &ctx.client_request_id,
                );
                let bounded = async {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                            Err(TransportError::Timeout(format!("Attempt exceeded {:?}", limit)).into())
                        }),
                        None => run.await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    result = bounded => Some(result),
                }
            };

            let Some(outcome) = outcome else {
                ctx.attempts.push(ExecutionAttempt {
                    attempt: attempt.attempt,
                    location,
                    elapsed: started.elapsed(),
                    status: attempt.status,
                    failure: Some(AttemptError::fatal("Cancelled")),
                });
                warn!(attempt = attempt.attempt, "Operation cancelled during attempt");
                return Err(TransferError::Cancelled {
                    attempts: attempt.attempt,
                });
            };

            ctx.attempts.push(ExecutionAttempt {
                attempt: attempt.attempt,
                location,
                elapsed: started.elapsed(),
                status: attempt.status,
                failure: outcome.as_ref().err().cloned(),
            });

            let failure = match outcome {
                Ok(value) => {
                    debug!(attempt = attempt.attempt, "Command succeeded");
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() {
                error!(attempt = attempt.attempt, %failure, "Command failed");
                return Err(TransferError::Request {
                    attempt: attempt.attempt,
                    failure,
                });
            }

            // The secondary may lag; a miss there says nothing about the primary
            if location == StorageLocation::Secondary && failure.detail().status == Some(404) {
                mode = LocationMode::PrimaryOnly;
            }

            let suggested = resolve_location(&command, mode.next_location(location));
            let retry_context = RetryContext {
                retry_count: retries,
                last_location: location,
                next_location: suggested,
                location_mode: mode,
                failure: &failure,
            };
            let Some(info) = policy.evaluate(&retry_context) else {
                error!(attempts = attempt.attempt, %failure, "Retries exhausted");
                return Err(TransferError::RetriesExhausted {
                    attempts: attempt.attempt,
                    last: failure,
                    history: ctx.attempts[history_start..].to_vec(),
                });
            };

            retries += 1;
            mode = info.updated_location_mode;
            location = resolve_location(&command, info.target_location);

            if let Some(recovery) = command.recovery.as_mut() {
                recovery.recover(&failure, &mut attempt).await?;
            }

            if let Some(limit) = self.maximum_execution_time {
                if ctx.elapsed() + info.delay >= limit {
                    return Err(TransferError::TimedOut {
                        limit,
                        attempts: attempt.attempt,
                    });
                }
            }

            warn!(
                attempt = attempt.attempt,
                next_location = %location,
                delay_ms = info.delay.as_millis() as u64,
                %failure,
                "Retrying command"
            );

            if !info.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancellation.cancelled() => {
                        return Err(TransferError::Cancelled { attempts: attempt.attempt });
                    }
                    _ = tokio::time::sleep(info.delay) => {}
                }
            }
        }
    }

    /// Time left under the maximum execution time, if one is set
    fn remaining_time(&self, ctx: &OperationContext, attempts: u32) -> TransferResult<Option<Duration>> {
        match self.maximum_execution_time {
            Some(limit) => {
                let elapsed = ctx.elapsed();
                if elapsed >= limit {
                    Err(TransferError::TimedOut { limit, attempts })
                } else {
                    Ok(Some(limit - elapsed))
                }
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("location_mode", &self.location_mode)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("maximum_execution_time", &self.maximum_execution_time)
            .finish()
    }
}

fn initial_location<T>(command: &StorageCommand<'_, T>, mode: LocationMode) -> TransferResult<StorageLocation> {
    let preferred = mode.initial_location();
    if command.location_mode.allows(preferred) && command.uri.for_location(preferred).is_ok() {
        return Ok(preferred);
    }
    match (mode, command.location_mode) {
        (LocationMode::SecondaryOnly, CommandLocationMode::PrimaryOnly) => Err(TransferError::invalid(format!(
            "Command {} can only run against the primary location",
            command.name
        ))),
        (LocationMode::SecondaryOnly, _) => Err(TransferError::invalid("No secondary endpoint configured")),
        (LocationMode::PrimaryOnly, CommandLocationMode::SecondaryOnly) => Err(TransferError::invalid(format!(
            "Command {} can only run against the secondary location",
            command.name
        ))),
        _ => Ok(resolve_location(command, preferred.other())),
    }
}

/// Clamp a desired location to what the command and its endpoints permit
fn resolve_location<T>(command: &StorageCommand<'_, T>, desired: StorageLocation) -> StorageLocation {
    if command.location_mode.allows(desired) && command.uri.for_location(desired).is_ok() {
        return desired;
    }
    match command.location_mode {
        CommandLocationMode::SecondaryOnly => StorageLocation::Secondary,
        _ => StorageLocation::Primary,
    }
}

async fn run_attempt<T>(
    transport: &dyn HttpTransport,
    command: &mut StorageCommand<'_, T>,
    attempt: &mut AttemptContext,
    client_request_id: &str,
) -> Result<T, AttemptError> {
    let url = command
        .uri
        .for_location(attempt.location)
        .map_err(|e| AttemptError::fatal(e.to_string()))?
        .clone();
    let mut request = (command.build_request)(&url, attempt).map_err(|e| AttemptError::fatal(e.to_string()))?;
    stamp_request(&mut request, client_request_id).map_err(|e| AttemptError::fatal(e.to_string()))?;

    let TransportResponse {
        status,
        headers,
        mut body,
    } = transport.send(request).await?;
    attempt.status = Some(status.as_u16());

    let mut hasher = command.hash_body.then(Md5::new);
    let mut length = 0u64;

    let streaming = status.is_success() && command.destination.is_some();
    let parts = if streaming {
        ResponseParts {
            status,
            headers,
            body: Bytes::new(),
        }
    } else {
        let mut collected = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(truncated_body)?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            length += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
        }
        ResponseParts {
            status,
            headers,
            body: collected.freeze(),
        }
    };

    let mut value = (command.preprocess)(&parts, attempt)?;

    if streaming {
        if let Some(destination) = command.destination.as_mut() {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(truncated_body)?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                length += chunk.len() as u64;
                destination
                    .write_chunk(chunk.clone())
                    .await
                    .map_err(|e| AttemptError::fatal(format!("Destination write failed: {}", e)))?;
                attempt.bytes_transferred += chunk.len() as u64;
            }
        }
    }

    if let Some(postprocess) = command.postprocess.as_ref() {
        let digest = BodyDigest {
            length,
            md5: hasher.map(protocol::finish_md5),
        };
        postprocess(&mut value, &digest, attempt)?;
    }

    Ok(value)
}

fn stamp_request(request: &mut crate::TransportRequest, client_request_id: &str) -> TransferResult<()> {
    request.insert_header(headers::VERSION, protocol::STORAGE_VERSION)?;
    request.insert_header(headers::DATE, protocol::http_date(chrono::Utc::now()))?;
    request.insert_header(headers::CLIENT_REQUEST_ID, client_request_id)
}

fn truncated_body(err: std::io::Error) -> AttemptError {
    AttemptError::Retryable(crate::ServiceFailure {
        status: None,
        error_code: Some(codes::TRUNCATED_BODY.to_string()),
        message: format!("Response body interrupted: {}", err),
    })
}
