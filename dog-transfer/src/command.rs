use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::{
    AttemptError, CommandLocationMode, DownloadSink, StorageLocation, StorageUri, TransferResult,
    TransportRequest,
};

/// Progress threaded from one attempt of a command to the next
///
/// The executor owns this value; request builders read it, preprocessors and
/// recovery actions may update it. The command itself never changes between
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number
    pub attempt: u32,
    pub location: StorageLocation,
    /// Body bytes delivered to the destination across all attempts
    pub bytes_transferred: u64,
    /// `bytes_transferred` when the current attempt started
    pub attempt_start_offset: u64,
    /// Status of the current attempt's response, once received
    pub status: Option<u16>,
    /// ETag pinned by the first response of a resumable read
    pub locked_etag: Option<String>,
    /// Set by recovery when the service already holds the effect of a previous attempt
    pub already_applied: bool,
}

impl AttemptContext {
    pub fn new(location: StorageLocation) -> Self {
        Self {
            attempt: 0,
            location,
            bytes_transferred: 0,
            attempt_start_offset: 0,
            status: None,
            locked_etag: None,
            already_applied: false,
        }
    }

    /// Whether this attempt continues a body a previous attempt started
    pub fn is_resumed(&self) -> bool {
        self.attempt_start_offset > 0
    }
}

/// Response handed to a preprocessor
///
/// For commands with a destination the body streams to the destination and
/// `body` is empty; otherwise it holds the complete response body.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseParts {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Length and optional MD5 of the body bytes received during one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDigest {
    pub length: u64,
    pub md5: Option<[u8; 16]>,
}

/// Builds the request for the current attempt
pub type RequestBuilder<'a> =
    Box<dyn Fn(&Url, &AttemptContext) -> TransferResult<TransportRequest> + Send + Sync + 'a>;

/// Turns a raw response into a result or a classified failure
pub type Preprocessor<'a, T> =
    Box<dyn Fn(&ResponseParts, &mut AttemptContext) -> Result<T, AttemptError> + Send + Sync + 'a>;

/// Integrity checks once the whole body has been read
pub type Postprocessor<'a, T> =
    Box<dyn Fn(&mut T, &BodyDigest, &AttemptContext) -> Result<(), AttemptError> + Send + Sync + 'a>;

/// Repositions a command's input before the executor retries it
#[async_trait]
pub trait RecoveryAction: Send {
    async fn recover(&mut self, failure: &AttemptError, attempt: &mut AttemptContext) -> TransferResult<()>;
}

/// One logical network operation, consumed by a single `Executor::execute`
pub struct StorageCommand<'a, T> {
    pub(crate) name: &'static str,
    pub(crate) uri: StorageUri,
    pub(crate) location_mode: CommandLocationMode,
    pub(crate) build_request: RequestBuilder<'a>,
    pub(crate) preprocess: Preprocessor<'a, T>,
    pub(crate) postprocess: Option<Postprocessor<'a, T>>,
    pub(crate) recovery: Option<Box<dyn RecoveryAction + 'a>>,
    pub(crate) destination: Option<&'a mut dyn DownloadSink>,
    pub(crate) hash_body: bool,
}

impl<'a, T> StorageCommand<'a, T> {
    /// Create a primary-only command
    pub fn new<B, P>(name: &'static str, uri: StorageUri, build_request: B, preprocess: P) -> Self
    where
        B: Fn(&Url, &AttemptContext) -> TransferResult<TransportRequest> + Send + Sync + 'a,
        P: Fn(&ResponseParts, &mut AttemptContext) -> Result<T, AttemptError> + Send + Sync + 'a,
    {
        Self {
            name,
            uri,
            location_mode: CommandLocationMode::PrimaryOnly,
            build_request: Box::new(build_request),
            preprocess: Box::new(preprocess),
            postprocess: None,
            recovery: None,
            destination: None,
            hash_body: false,
        }
    }

    /// Allow the command to run against other locations (read-only commands)
    pub fn with_location_mode(mut self, mode: CommandLocationMode) -> Self {
        self.location_mode = mode;
        self
    }

    pub fn with_postprocess<F>(mut self, postprocess: F) -> Self
    where
        F: Fn(&mut T, &BodyDigest, &AttemptContext) -> Result<(), AttemptError> + Send + Sync + 'a,
    {
        self.postprocess = Some(Box::new(postprocess));
        self
    }

    pub fn with_recovery<R: RecoveryAction + 'a>(mut self, recovery: R) -> Self {
        self.recovery = Some(Box::new(recovery));
        self
    }

    /// Stream the success body into `destination` instead of buffering it
    pub fn with_destination(mut self, destination: &'a mut dyn DownloadSink) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Compute an MD5 over the body bytes of every attempt
    pub fn hashing_body(mut self) -> Self {
        self.hash_body = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the response body itself is the payload
    pub fn streams_body(&self) -> bool {
        self.destination.is_some()
    }
}

impl<T> std::fmt::Debug for StorageCommand<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCommand")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .field("location_mode", &self.location_mode)
            .field("streams_body", &self.destination.is_some())
            .field("has_recovery", &self.recovery.is_some())
            .finish()
    }
}
