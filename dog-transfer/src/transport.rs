use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use url::Url;

use crate::{ByteStream, TransferError, TransferResult, TransportError};

/// Fully formed outgoing request for one attempt
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header, rejecting values that are not valid header text
    pub fn with_header(mut self, name: &str, value: impl AsRef<str>) -> TransferResult<Self> {
        self.insert_header(name, value)?;
        Ok(self)
    }

    pub fn insert_header(&mut self, name: &str, value: impl AsRef<str>) -> TransferResult<()> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransferError::invalid(format!("Invalid header name {}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value.as_ref())
            .map_err(|e| TransferError::invalid(format!("Invalid value for header {}: {}", name, e)))?;
        self.headers.insert(header_name, header_value);
        Ok(())
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a query parameter, decoded
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Raw response: status and headers up front, body as a stream
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl TransportResponse {
    /// Response whose whole body is already in memory
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let stream = futures_util::stream::once(async move { Ok(body) });
        Self {
            status,
            headers,
            body: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// The HTTP client collaborator
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request; the executor owns retries, timeouts and cancellation
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// `HttpTransport` backed by a reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));

        Ok(TransportResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
