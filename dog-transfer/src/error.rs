use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::ExecutionAttempt;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Service error codes the engine reacts to
pub mod codes {
    pub const MD5_MISMATCH: &str = "Md5Mismatch";
    pub const APPEND_POSITION_CONDITION_NOT_MET: &str = "AppendPositionConditionNotMet";
    pub const MAX_BLOB_SIZE_CONDITION_NOT_MET: &str = "MaxBlobSizeConditionNotMet";
    pub const CONDITION_NOT_MET: &str = "ConditionNotMet";
    pub const BLOB_NOT_FOUND: &str = "BlobNotFound";
    pub const INVALID_RANGE: &str = "InvalidRange";
    pub const INVALID_BLOCK_LIST: &str = "InvalidBlockList";
    pub const INVALID_PAGE_RANGE: &str = "InvalidPageRange";
    pub const INVALID_BLOB_TYPE: &str = "InvalidBlobType";
    pub const TRUNCATED_BODY: &str = "TruncatedBody";
    pub const OPERATION_TIMED_OUT: &str = "OperationTimedOut";
}

/// Errors surfaced to callers of the transfer engine
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Request failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: AttemptError,
        history: Vec<ExecutionAttempt>,
    },

    #[error("Request failed on attempt {attempt}: {failure}")]
    Request { attempt: u32, failure: AttemptError },

    #[error("Operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("Operation exceeded its maximum execution time of {limit:?} after {attempts} attempt(s)")]
    TimedOut { limit: Duration, attempts: u32 },

    #[error("Invalid stream state: {message}")]
    State { message: String },

    #[error("Append position conflict: expected {expected}, service reports {actual}")]
    AppendConflict { expected: u64, actual: u64 },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Operation not supported: {message}")]
    Unsupported { message: String },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl TransferError {
    /// Create a stream state error
    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// The failure of the last attempt, if the error came from the service
    pub fn last_failure(&self) -> Option<&AttemptError> {
        match self {
            Self::RetriesExhausted { last, .. } => Some(last),
            Self::Request { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Number of attempts made before the operation gave up
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. }
            | Self::Cancelled { attempts }
            | Self::TimedOut { attempts, .. } => Some(*attempts),
            Self::Request { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// Service error code of the last attempt, when there was one
    pub fn error_code(&self) -> Option<&str> {
        self.last_failure()
            .and_then(|failure| failure.detail().error_code.as_deref())
    }

    /// HTTP status of the last attempt, when there was one
    pub fn status(&self) -> Option<u16> {
        self.last_failure().and_then(|failure| failure.detail().status)
    }
}

/// What went wrong during one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub message: String,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.error_code) {
            (Some(status), Some(code)) => write!(f, "{} ({}): {}", status, code, self.message),
            (Some(status), None) => write!(f, "{}: {}", status, self.message),
            (None, Some(code)) => write!(f, "{}: {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

/// Attempt outcome classification - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Transient failure - the executor consults the retry policy
    #[error("Retryable error: {0}")]
    Retryable(ServiceFailure),

    /// Permanent failure - ends the operation immediately
    #[error("Fatal error: {0}")]
    Fatal(ServiceFailure),
}

impl AttemptError {
    /// Create a retryable error without a status
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(ServiceFailure {
            status: None,
            error_code: None,
            message: msg.into(),
        })
    }

    /// Create a fatal error without a status
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(ServiceFailure {
            status: None,
            error_code: None,
            message: msg.into(),
        })
    }

    /// Create a fatal error carrying a service error code
    pub fn fatal_code(code: &str, msg: impl Into<String>) -> Self {
        Self::Fatal(ServiceFailure {
            status: None,
            error_code: Some(code.to_string()),
            message: msg.into(),
        })
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the failure details
    pub fn detail(&self) -> &ServiceFailure {
        match self {
            Self::Retryable(detail) | Self::Fatal(detail) => detail,
        }
    }

    /// Whether the service reported the given error code
    pub fn has_code(&self, code: &str) -> bool {
        self.detail().error_code.as_deref() == Some(code)
    }
}

/// Failure of the HTTP collaborator before a response arrived
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        let code = match err {
            TransportError::Timeout(_) => Some(codes::OPERATION_TIMED_OUT.to_string()),
            _ => None,
        };
        Self::Retryable(ServiceFailure {
            status: None,
            error_code: code,
            message: err.to_string(),
        })
    }
}
