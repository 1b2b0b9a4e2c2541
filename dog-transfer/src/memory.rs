//! In-memory blob service for tests and local development
//!
//! Speaks the same wire protocol as the request factory, over a primary and a
//! secondary host backed by one store, and can inject faults per operation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use crate::config::{MAX_APPEND_BLOCK_SIZE, PAGE_SIZE};
use crate::protocol::{self, headers};
use crate::{
    codes, BlobKind, HttpTransport, StorageLocation, StorageUri, TransportError, TransportRequest,
    TransportResponse,
};

pub const PRIMARY_HOST: &str = "primary.blob.test";
pub const SECONDARY_HOST: &str = "secondary.blob.test";

/// Service operations, as recognized from method and `comp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateBlob,
    PutBlock,
    PutBlockList,
    PutPage,
    AppendBlock,
    GetBlob,
    GetProperties,
}

/// Misbehavior injected into one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status without touching the store
    Status { status: u16, code: Option<String> },
    /// Fail before the request reaches the store
    Timeout,
    /// Apply the request, then lose the response
    DropResponse,
    /// Flip the first body byte in transit
    CorruptRequestBody,
    /// Cut the response body off after this many bytes
    TruncateResponse { after: usize },
    /// Hold the request before answering
    Delay(Duration),
}

impl Fault {
    pub fn status(status: u16) -> Self {
        Self::Status { status, code: None }
    }

    pub fn server_busy() -> Self {
        Self::Status {
            status: 503,
            code: Some("ServerBusy".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledFault {
    operation: Operation,
    location: Option<StorageLocation>,
    fault: Fault,
    remaining: u32,
}

/// One request as seen by the service
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub operation: Option<Operation>,
    pub location: StorageLocation,
    pub method: Method,
    pub path: String,
    pub client_request_id: Option<String>,
    pub range: Option<String>,
    pub status: Option<u16>,
    pub fault: Option<Fault>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    kind: BlobKind,
    /// Uncommitted block blobs are invisible to reads
    committed: bool,
    data: Vec<u8>,
    uncommitted: HashMap<String, Bytes>,
    committed_blocks: HashMap<String, Bytes>,
    block_count: u32,
    metadata: BTreeMap<String, String>,
    content_type: Option<String>,
    content_md5: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl StoredBlob {
    fn new(kind: BlobKind, etag: String) -> Self {
        Self {
            kind,
            committed: false,
            data: Vec::new(),
            uncommitted: HashMap::new(),
            committed_blocks: HashMap::new(),
            block_count: 0,
            metadata: BTreeMap::new(),
            content_type: None,
            content_md5: None,
            etag,
            last_modified: Utc::now(),
        }
    }
}

#[derive(Default)]
struct ServiceState {
    blobs: HashMap<String, StoredBlob>,
    etag_counter: u64,
    faults: Vec<ScheduledFault>,
    log: Vec<RequestRecord>,
}

impl ServiceState {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("\"0x8D{:012X}\"", self.etag_counter)
    }
}

struct ServiceResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ServiceResponse {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn error(status: StatusCode, code: &str) -> Self {
        let mut response = Self::new(status);
        set_header(&mut response.headers, headers::ERROR_CODE, code);
        response.body = Bytes::from(format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
            code,
            status.canonical_reason().unwrap_or("Error")
        ));
        response
    }

    fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }
}

fn set_header(map: &mut HeaderMap, name: &'static str, value: impl AsRef<str>) {
    if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
        map.insert(HeaderName::from_static(name), value);
    }
}

/// Blob service held entirely in memory
pub struct MemoryBlobService {
    state: RwLock<ServiceState>,
    primary: Url,
    secondary: Url,
    response_chunk_size: usize,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServiceState::default()),
            primary: endpoint(PRIMARY_HOST),
            secondary: endpoint(SECONDARY_HOST),
            response_chunk_size: 64 * 1024,
        }
    }

    /// Split response bodies into chunks of this size
    pub fn with_response_chunk_size(mut self, size: usize) -> Self {
        self.response_chunk_size = size.max(1);
        self
    }

    /// Primary and secondary endpoints of the blob at `path`
    pub fn uri(&self, path: &str) -> StorageUri {
        let mut primary = self.primary.clone();
        primary.set_path(path);
        let mut secondary = self.secondary.clone();
        secondary.set_path(path);
        StorageUri::new(primary).with_secondary(secondary)
    }

    /// Inject `fault` into the next request for `operation`
    pub fn inject(&self, operation: Operation, fault: Fault) {
        self.inject_times(operation, None, fault, 1);
    }

    /// Inject `fault` into the next `times` requests for `operation` at `location`
    pub fn inject_times(&self, operation: Operation, location: Option<StorageLocation>, fault: Fault, times: u32) {
        self.state.write().faults.push(ScheduledFault {
            operation,
            location,
            fault,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.state.write().faults.clear();
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.read().log.clone()
    }

    pub fn request_count(&self, operation: Operation) -> usize {
        self.state
            .read()
            .log
            .iter()
            .filter(|r| r.operation == Some(operation))
            .count()
    }

    /// Committed content of a blob
    pub fn blob_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.committed(path, |blob| blob.data.clone())
    }

    pub fn blob_metadata(&self, path: &str) -> Option<BTreeMap<String, String>> {
        self.committed(path, |blob| blob.metadata.clone())
    }

    pub fn blob_content_md5(&self, path: &str) -> Option<String> {
        self.committed(path, |blob| blob.content_md5.clone()).flatten()
    }

    pub fn uncommitted_block_count(&self, path: &str) -> usize {
        self.state
            .read()
            .blobs
            .get(path)
            .map(|blob| blob.uncommitted.len())
            .unwrap_or(0)
    }

    /// Seed a committed blob directly
    pub fn insert_blob(&self, path: &str, kind: BlobKind, data: Vec<u8>, metadata: BTreeMap<String, String>) {
        let mut state = self.state.write();
        let mut blob = StoredBlob::new(kind, state.next_etag());
        blob.committed = true;
        blob.content_md5 = (kind == BlobKind::Block).then(|| protocol::encode_md5(&protocol::md5_of(&data)));
        blob.data = data;
        blob.metadata = metadata;
        state.blobs.insert(path.to_string(), blob);
    }

    /// Change a blob's content behind the writer's back
    pub fn overwrite_blob(&self, path: &str, data: Vec<u8>) {
        let mut state = self.state.write();
        let etag = state.next_etag();
        if let Some(blob) = state.blobs.get_mut(path) {
            blob.data = data;
            blob.content_md5 = None;
            blob.etag = etag;
            blob.last_modified = Utc::now();
        }
    }

    fn committed<T>(&self, path: &str, read: impl FnOnce(&StoredBlob) -> T) -> Option<T> {
        self.state
            .read()
            .blobs
            .get(path)
            .filter(|blob| blob.committed)
            .map(read)
    }

    fn take_fault(&self, operation: Operation, location: StorageLocation) -> Option<Fault> {
        let mut state = self.state.write();
        let index = state.faults.iter().position(|f| {
            f.operation == operation && f.location.map_or(true, |l| l == location) && f.remaining > 0
        })?;
        let scheduled = &mut state.faults[index];
        scheduled.remaining -= 1;
        let fault = scheduled.fault.clone();
        if scheduled.remaining == 0 {
            state.faults.remove(index);
        }
        Some(fault)
    }

    fn record(&self, request: &TransportRequest, operation: Option<Operation>, location: StorageLocation, status: Option<u16>, fault: Option<Fault>) {
        self.state.write().log.push(RequestRecord {
            operation,
            location,
            method: request.method.clone(),
            path: blob_path(&request.url),
            client_request_id: request.header(headers::CLIENT_REQUEST_ID).map(str::to_string),
            range: request.header(headers::RANGE).map(str::to_string),
            status,
            fault,
        });
    }

    fn body_stream(&self, body: Bytes, truncate_after: Option<usize>) -> crate::ByteStream {
        let chunk_size = self.response_chunk_size;
        let stream = async_stream::stream! {
            let limit = truncate_after.unwrap_or(body.len()).min(body.len());
            let mut offset = 0;
            while offset < limit {
                let end = (offset + chunk_size).min(limit);
                yield Ok(body.slice(offset..end));
                offset = end;
            }
            if truncate_after.is_some_and(|after| after < body.len()) {
                yield Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "Connection reset while streaming the response body",
                ));
            }
        };
        Box::pin(stream)
    }

    fn handle(&self, operation: Operation, path: &str, request: &TransportRequest) -> ServiceResponse {
        if request.header(headers::VERSION).is_none() {
            return ServiceResponse::error(StatusCode::BAD_REQUEST, "MissingRequiredHeader");
        }
        if let Some(expected) = request.header(headers::CONTENT_MD5) {
            if matches!(operation, Operation::PutBlock | Operation::PutPage | Operation::AppendBlock)
                && expected != protocol::encode_md5(&protocol::md5_of(&request.body))
            {
                return ServiceResponse::error(StatusCode::BAD_REQUEST, codes::MD5_MISMATCH);
            }
        }

        let mut state = self.state.write();
        match operation {
            Operation::CreateBlob => create_blob(&mut state, path, request),
            Operation::PutBlock => put_block(&mut state, path, request),
            Operation::PutBlockList => put_block_list(&mut state, path, request),
            Operation::PutPage => put_page(&mut state, path, request),
            Operation::AppendBlock => append_block(&mut state, path, request),
            Operation::GetBlob => get_blob(&state, path, request),
            Operation::GetProperties => get_properties(&state, path),
        }
    }
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::new()
    }
}

fn endpoint(host: &str) -> Url {
    Url::parse(&format!("https://{}/", host)).expect("static endpoint is a valid url")
}

fn blob_path(url: &Url) -> String {
    url.path().trim_start_matches('/').to_string()
}

fn classify_operation(request: &TransportRequest) -> Option<Operation> {
    match request.method {
        Method::HEAD => Some(Operation::GetProperties),
        Method::GET => Some(Operation::GetBlob),
        Method::PUT => match request.query("comp").as_deref() {
            Some("block") => Some(Operation::PutBlock),
            Some("blocklist") => Some(Operation::PutBlockList),
            Some("page") => Some(Operation::PutPage),
            Some("appendblock") => Some(Operation::AppendBlock),
            None if request.header(headers::BLOB_TYPE).is_some() => Some(Operation::CreateBlob),
            _ => None,
        },
        _ => None,
    }
}

fn request_metadata(request: &TransportRequest) -> BTreeMap<String, String> {
    request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(headers::META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn written(blob: &StoredBlob) -> ServiceResponse {
    ServiceResponse::new(StatusCode::CREATED)
        .header(headers::ETAG, &blob.etag)
        .header(headers::LAST_MODIFIED, protocol::http_date(blob.last_modified))
}

fn property_headers(blob: &StoredBlob, mut response: ServiceResponse) -> ServiceResponse {
    response = response
        .header(headers::ETAG, &blob.etag)
        .header(headers::LAST_MODIFIED, protocol::http_date(blob.last_modified))
        .header(headers::BLOB_TYPE, blob.kind.header_value())
        .header(
            headers::CONTENT_TYPE,
            blob.content_type.as_deref().unwrap_or("application/octet-stream"),
        );
    if blob.kind == BlobKind::Append {
        response = response.header(headers::COMMITTED_BLOCK_COUNT, blob.block_count.to_string());
    }
    for (key, value) in &blob.metadata {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(format!("{}{}", headers::META_PREFIX, key).as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers.insert(name, value);
        }
    }
    response
}

fn readable<'s>(state: &'s ServiceState, path: &str) -> Result<&'s StoredBlob, ServiceResponse> {
    state
        .blobs
        .get(path)
        .filter(|blob| blob.committed)
        .ok_or_else(|| ServiceResponse::error(StatusCode::NOT_FOUND, codes::BLOB_NOT_FOUND))
}

fn writable<'s>(state: &'s mut ServiceState, path: &str, kind: BlobKind) -> Result<&'s mut StoredBlob, ServiceResponse> {
    match state.blobs.get_mut(path) {
        Some(blob) if blob.committed && blob.kind == kind => Ok(blob),
        Some(blob) if blob.committed => Err(ServiceResponse::error(StatusCode::CONFLICT, codes::INVALID_BLOB_TYPE)),
        _ => Err(ServiceResponse::error(StatusCode::NOT_FOUND, codes::BLOB_NOT_FOUND)),
    }
}

fn create_blob(state: &mut ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let Some(kind) = request.header(headers::BLOB_TYPE).and_then(BlobKind::from_header_value) else {
        return ServiceResponse::error(StatusCode::BAD_REQUEST, "InvalidHeaderValue");
    };
    let data = match kind {
        BlobKind::Page => {
            let size = request
                .header(headers::BLOB_CONTENT_LENGTH)
                .and_then(|v| v.parse::<usize>().ok());
            match size {
                Some(size) if size % PAGE_SIZE == 0 => vec![0u8; size],
                _ => return ServiceResponse::error(StatusCode::BAD_REQUEST, "InvalidHeaderValue"),
            }
        }
        BlobKind::Append => Vec::new(),
        BlobKind::Block => request.body.to_vec(),
    };
    let mut blob = StoredBlob::new(kind, state.next_etag());
    blob.committed = true;
    blob.data = data;
    blob.metadata = request_metadata(request);
    blob.content_type = request.header(headers::BLOB_CONTENT_TYPE).map(str::to_string);
    blob.content_md5 = request.header(headers::BLOB_CONTENT_MD5).map(str::to_string);
    let response = written(&blob);
    state.blobs.insert(path.to_string(), blob);
    response
}

fn put_block(state: &mut ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let Some(block_id) = request.query("blockid") else {
        return ServiceResponse::error(StatusCode::BAD_REQUEST, "InvalidQueryParameterValue");
    };
    let etag = state.next_etag();
    let blob = state
        .blobs
        .entry(path.to_string())
        .or_insert_with(|| StoredBlob::new(BlobKind::Block, etag));
    if blob.committed && blob.kind != BlobKind::Block {
        return ServiceResponse::error(StatusCode::CONFLICT, codes::INVALID_BLOB_TYPE);
    }
    blob.uncommitted.insert(block_id, request.body.clone());
    ServiceResponse::new(StatusCode::CREATED)
}

fn put_block_list(state: &mut ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let ids = match std::str::from_utf8(&request.body)
        .ok()
        .and_then(protocol::parse_block_list_xml)
    {
        Some(ids) => ids,
        None => return ServiceResponse::error(StatusCode::BAD_REQUEST, "InvalidXmlDocument"),
    };
    let etag = state.next_etag();
    let blob = state
        .blobs
        .entry(path.to_string())
        .or_insert_with(|| StoredBlob::new(BlobKind::Block, etag.clone()));
    if blob.committed && blob.kind != BlobKind::Block {
        return ServiceResponse::error(StatusCode::CONFLICT, codes::INVALID_BLOB_TYPE);
    }

    let mut data = Vec::new();
    let mut blocks = HashMap::new();
    for id in &ids {
        let Some(block) = blob.uncommitted.get(id).or_else(|| blob.committed_blocks.get(id)) else {
            return ServiceResponse::error(StatusCode::BAD_REQUEST, codes::INVALID_BLOCK_LIST);
        };
        data.extend_from_slice(block);
        blocks.insert(id.clone(), block.clone());
    }

    blob.kind = BlobKind::Block;
    blob.committed = true;
    blob.data = data;
    blob.committed_blocks = blocks;
    blob.block_count = ids.len() as u32;
    blob.uncommitted.clear();
    blob.metadata = request_metadata(request);
    blob.content_type = request.header(headers::BLOB_CONTENT_TYPE).map(str::to_string);
    blob.content_md5 = request.header(headers::BLOB_CONTENT_MD5).map(str::to_string);
    blob.etag = etag;
    blob.last_modified = Utc::now();
    written(blob)
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let span = value.strip_prefix("bytes=")?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse().ok()?;
    let end = match end {
        "" => None,
        e => Some(e.parse().ok()?),
    };
    Some((start, end))
}

fn put_page(state: &mut ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let etag = state.next_etag();
    let blob = match writable(state, path, BlobKind::Page) {
        Ok(blob) => blob,
        Err(response) => return response,
    };
    let page = PAGE_SIZE as u64;
    let range = request.header(headers::RANGE).and_then(parse_range);
    let (start, end) = match range {
        Some((start, Some(end)))
            if start % page == 0
                && (end + 1) % page == 0
                && end + 1 - start == request.body.len() as u64
                && end < blob.data.len() as u64 =>
        {
            (start as usize, end as usize)
        }
        _ => return ServiceResponse::error(StatusCode::RANGE_NOT_SATISFIABLE, codes::INVALID_PAGE_RANGE),
    };
    blob.data[start..=end].copy_from_slice(&request.body);
    blob.etag = etag;
    blob.last_modified = Utc::now();
    written(blob)
}

fn append_block(state: &mut ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let etag = state.next_etag();
    let blob = match writable(state, path, BlobKind::Append) {
        Ok(blob) => blob,
        Err(response) => return response,
    };
    let length = blob.data.len() as u64;
    if let Some(position) = request.header(headers::APPEND_POSITION).and_then(|v| v.parse::<u64>().ok()) {
        if position != length {
            return ServiceResponse::error(StatusCode::PRECONDITION_FAILED, codes::APPEND_POSITION_CONDITION_NOT_MET);
        }
    }
    if let Some(max_size) = request.header(headers::MAX_SIZE).and_then(|v| v.parse::<u64>().ok()) {
        if length + request.body.len() as u64 > max_size {
            return ServiceResponse::error(StatusCode::PRECONDITION_FAILED, codes::MAX_BLOB_SIZE_CONDITION_NOT_MET);
        }
    }
    if request.body.len() > MAX_APPEND_BLOCK_SIZE {
        return ServiceResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "RequestBodyTooLarge");
    }
    blob.data.extend_from_slice(&request.body);
    blob.block_count += 1;
    blob.etag = etag;
    blob.last_modified = Utc::now();
    written(blob)
        .header(headers::APPEND_OFFSET, length.to_string())
        .header(headers::COMMITTED_BLOCK_COUNT, blob.block_count.to_string())
}

fn get_blob(state: &ServiceState, path: &str, request: &TransportRequest) -> ServiceResponse {
    let blob = match readable(state, path) {
        Ok(blob) => blob,
        Err(response) => return response,
    };
    if let Some(expected) = request.header(headers::IF_MATCH) {
        if expected != "*" && expected != blob.etag {
            return ServiceResponse::error(StatusCode::PRECONDITION_FAILED, codes::CONDITION_NOT_MET);
        }
    }
    let total = blob.data.len() as u64;
    let range = request
        .header(headers::RANGE)
        .or_else(|| request.header("range"))
        .and_then(parse_range);

    let Some((start, end)) = range else {
        let mut response = property_headers(blob, ServiceResponse::new(StatusCode::OK))
            .header(headers::CONTENT_LENGTH, total.to_string());
        if let Some(md5) = &blob.content_md5 {
            response = response.header(headers::CONTENT_MD5, md5);
        }
        response.body = Bytes::copy_from_slice(&blob.data);
        return response;
    };

    if start >= total {
        return ServiceResponse::error(StatusCode::RANGE_NOT_SATISFIABLE, codes::INVALID_RANGE)
            .header(headers::CONTENT_RANGE, format!("bytes */{}", total));
    }
    let end = end.unwrap_or(total - 1).min(total - 1);
    let slice = &blob.data[start as usize..=end as usize];
    let mut response = property_headers(blob, ServiceResponse::new(StatusCode::PARTIAL_CONTENT))
        .header(headers::CONTENT_LENGTH, slice.len().to_string())
        .header(headers::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total));
    if request.header(headers::RANGE_GET_CONTENT_MD5) == Some("true") {
        if slice.len() > MAX_APPEND_BLOCK_SIZE {
            return ServiceResponse::error(StatusCode::BAD_REQUEST, "OutOfRangeInput");
        }
        response = response.header(headers::CONTENT_MD5, protocol::encode_md5(&protocol::md5_of(slice)));
    }
    if let Some(md5) = &blob.content_md5 {
        response = response.header(headers::BLOB_CONTENT_MD5, md5);
    }
    response.body = Bytes::copy_from_slice(slice);
    response
}

fn get_properties(state: &ServiceState, path: &str) -> ServiceResponse {
    let blob = match readable(state, path) {
        Ok(blob) => blob,
        Err(mut response) => {
            response.body = Bytes::new();
            return response;
        }
    };
    let mut response = property_headers(blob, ServiceResponse::new(StatusCode::OK))
        .header(headers::CONTENT_LENGTH, blob.data.len().to_string());
    if let Some(md5) = &blob.content_md5 {
        response = response.header(headers::CONTENT_MD5, md5);
    }
    response
}

#[async_trait]
impl HttpTransport for MemoryBlobService {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let location = match request.url.host_str() {
            Some(SECONDARY_HOST) => StorageLocation::Secondary,
            _ => StorageLocation::Primary,
        };
        let path = blob_path(&request.url);
        let operation = classify_operation(&request);
        let fault = operation.and_then(|op| self.take_fault(op, location));
        debug!(?operation, %location, path = %path, ?fault, "Memory service request");

        let mut request = request;
        match &fault {
            Some(Fault::Timeout) => {
                self.record(&request, operation, location, None, fault.clone());
                return Err(TransportError::Timeout("Injected timeout".to_string()));
            }
            Some(Fault::Status { status, code }) => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let response = match code {
                    Some(code) => ServiceResponse::error(status, code),
                    None => ServiceResponse::new(status),
                };
                self.record(&request, operation, location, Some(status.as_u16()), fault.clone());
                return Ok(TransportResponse::from_bytes(response.status, response.headers, response.body));
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(*delay).await,
            Some(Fault::CorruptRequestBody) => {
                let mut body = request.body.to_vec();
                if let Some(first) = body.first_mut() {
                    *first ^= 0xff;
                }
                request.body = Bytes::from(body);
            }
            _ => {}
        }

        let response = match operation {
            Some(operation) => self.handle(operation, &path, &request),
            None => ServiceResponse::error(StatusCode::BAD_REQUEST, "UnsupportedHttpVerb"),
        };
        self.record(&request, operation, location, Some(response.status.as_u16()), fault.clone());

        let body = if request.method == Method::HEAD {
            Bytes::new()
        } else {
            response.body
        };
        match fault {
            Some(Fault::DropResponse) => Err(TransportError::Reset(
                "Connection dropped after the request was applied".to_string(),
            )),
            Some(Fault::TruncateResponse { after }) => Ok(TransportResponse {
                status: response.status,
                headers: response.headers,
                body: self.body_stream(body, Some(after)),
            }),
            _ => Ok(TransportResponse {
                status: response.status,
                headers: response.headers,
                body: self.body_stream(body, None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn stamped(request: TransportRequest) -> TransportRequest {
        request.with_header(headers::VERSION, protocol::STORAGE_VERSION).unwrap()
    }

    async fn collect(response: TransportResponse) -> (StatusCode, Vec<u8>) {
        let status = response.status;
        let mut body = Vec::new();
        let mut stream = response.body;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        (status, body)
    }

    #[tokio::test]
    async fn uncommitted_blocks_are_invisible() {
        let service = MemoryBlobService::new();
        let uri = service.uri("c/b");
        let id = crate::BlockId::for_index("x", 0);
        let put = stamped(protocol::put_block(&uri.primary, &id, Bytes::from_static(b"abc"), None).unwrap());
        let response = service.send(put).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);

        let head = stamped(protocol::get_properties(&uri.primary).unwrap());
        assert_eq!(service.send(head).await.unwrap().status, StatusCode::NOT_FOUND);
        assert_eq!(service.uncommitted_block_count("c/b"), 1);
    }

    #[tokio::test]
    async fn ranged_get_reports_content_range() {
        let service = MemoryBlobService::new().with_response_chunk_size(3);
        service.insert_blob("c/b", BlobKind::Block, b"0123456789".to_vec(), BTreeMap::new());
        let uri = service.uri("c/b");
        let get = stamped(protocol::get_blob(&uri.primary, Some(crate::ByteRange::new(2, Some(5))), None, true).unwrap());
        let response = service.send(get).await.unwrap();
        assert_eq!(
            response.headers.get(headers::CONTENT_RANGE).unwrap(),
            "bytes 2-6/10"
        );
        assert!(response.headers.get(headers::CONTENT_MD5).is_some());
        let (status, body) = collect(response).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, b"23456");
    }

    #[tokio::test]
    async fn truncated_response_ends_with_error() {
        let service = MemoryBlobService::new().with_response_chunk_size(4);
        service.insert_blob("c/b", BlobKind::Block, vec![1u8; 10], BTreeMap::new());
        service.inject(Operation::GetBlob, Fault::TruncateResponse { after: 6 });
        let get = stamped(protocol::get_blob(&service.uri("c/b").primary, None, None, false).unwrap());
        let mut body = service.send(get).await.unwrap().body;
        let mut received = 0;
        let mut failed = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => received += chunk.len(),
                Err(_) => failed = true,
            }
        }
        assert_eq!(received, 6);
        assert!(failed);
    }

    #[tokio::test]
    async fn faults_are_scoped_to_location() {
        let service = MemoryBlobService::new();
        service.insert_blob("c/b", BlobKind::Block, b"x".to_vec(), BTreeMap::new());
        service.inject_times(Operation::GetProperties, Some(StorageLocation::Secondary), Fault::status(404), 1);
        let uri = service.uri("c/b");

        let primary = stamped(protocol::get_properties(&uri.primary).unwrap());
        assert_eq!(service.send(primary).await.unwrap().status, StatusCode::OK);
        let secondary = stamped(protocol::get_properties(uri.secondary.as_ref().unwrap()).unwrap());
        assert_eq!(service.send(secondary).await.unwrap().status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requests_without_version_are_rejected() {
        let service = MemoryBlobService::new();
        let head = protocol::get_properties(&service.uri("c/b").primary).unwrap();
        let response = service.send(head).await.unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }
}
