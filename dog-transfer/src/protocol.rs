//! Request factory and response parser for the blob REST surface
//!
//! Builders return fully formed requests minus the per-attempt stamps
//! (version, date, client request id), which the executor adds.

use std::collections::BTreeMap;

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use md5::{Digest, Md5};
use url::Url;

use crate::command::{AttemptContext, ResponseParts};
use crate::{
    AttemptError, BlobKind, BlobProperties, BlockId, ByteRange, ServiceFailure, StorageLocation,
    TransferResult, TransportRequest,
};

/// REST API version sent with every request
pub const STORAGE_VERSION: &str = "2019-02-02";

pub mod headers {
    pub const VERSION: &str = "x-ms-version";
    pub const DATE: &str = "x-ms-date";
    pub const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
    pub const ERROR_CODE: &str = "x-ms-error-code";
    pub const BLOB_TYPE: &str = "x-ms-blob-type";
    pub const BLOB_CONTENT_LENGTH: &str = "x-ms-blob-content-length";
    pub const BLOB_CONTENT_TYPE: &str = "x-ms-blob-content-type";
    pub const BLOB_CONTENT_MD5: &str = "x-ms-blob-content-md5";
    pub const RANGE: &str = "x-ms-range";
    pub const RANGE_GET_CONTENT_MD5: &str = "x-ms-range-get-content-md5";
    pub const PAGE_WRITE: &str = "x-ms-page-write";
    pub const APPEND_POSITION: &str = "x-ms-blob-condition-appendpos";
    pub const MAX_SIZE: &str = "x-ms-blob-condition-maxsize";
    pub const APPEND_OFFSET: &str = "x-ms-blob-append-offset";
    pub const COMMITTED_BLOCK_COUNT: &str = "x-ms-blob-committed-block-count";
    pub const META_PREFIX: &str = "x-ms-meta-";
    pub const CONTENT_MD5: &str = "content-md5";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_RANGE: &str = "content-range";
    pub const ETAG: &str = "etag";
    pub const IF_MATCH: &str = "if-match";
    pub const LAST_MODIFIED: &str = "last-modified";
}

/// Headers describing the blob as a whole, sent on create and commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobHeaders {
    pub content_type: Option<String>,
    /// Base64 MD5 of the complete blob
    pub content_md5: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl BlobHeaders {
    fn apply(&self, mut request: TransportRequest) -> TransferResult<TransportRequest> {
        if let Some(content_type) = &self.content_type {
            request.insert_header(headers::BLOB_CONTENT_TYPE, content_type)?;
        }
        if let Some(md5) = &self.content_md5 {
            request.insert_header(headers::BLOB_CONTENT_MD5, md5)?;
        }
        for (key, value) in &self.metadata {
            request.insert_header(&format!("{}{}", headers::META_PREFIX, key), value)?;
        }
        Ok(request)
    }
}

/// Preconditions carried by an append
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendConditions {
    pub append_position: Option<u64>,
    pub max_size: Option<u64>,
}

fn with_comp(url: &Url, comp: &str) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("comp", comp);
    url
}

fn with_optional_md5(request: TransportRequest, md5: Option<&str>) -> TransferResult<TransportRequest> {
    match md5 {
        Some(md5) => request.with_header(headers::CONTENT_MD5, md5),
        None => Ok(request),
    }
}

pub fn put_block(url: &Url, block_id: &BlockId, body: Bytes, md5: Option<&str>) -> TransferResult<TransportRequest> {
    let mut url = with_comp(url, "block");
    url.query_pairs_mut().append_pair("blockid", block_id.as_str());
    let request = TransportRequest::new(Method::PUT, url)
        .with_header(headers::CONTENT_LENGTH, body.len().to_string())?
        .with_body(body);
    with_optional_md5(request, md5)
}

pub fn put_block_list(url: &Url, blocks: &[BlockId], blob: &BlobHeaders) -> TransferResult<TransportRequest> {
    let body = Bytes::from(block_list_xml(blocks));
    let request = TransportRequest::new(Method::PUT, with_comp(url, "blocklist"))
        .with_header(headers::CONTENT_TYPE, "application/xml")?
        .with_header(headers::CONTENT_LENGTH, body.len().to_string())?
        .with_body(body);
    blob.apply(request)
}

pub fn create_page_blob(url: &Url, size: u64, blob: &BlobHeaders) -> TransferResult<TransportRequest> {
    let request = TransportRequest::new(Method::PUT, url.clone())
        .with_header(headers::BLOB_TYPE, BlobKind::Page.header_value())?
        .with_header(headers::BLOB_CONTENT_LENGTH, size.to_string())?
        .with_header(headers::CONTENT_LENGTH, "0")?;
    blob.apply(request)
}

pub fn put_page(url: &Url, offset: u64, body: Bytes, md5: Option<&str>) -> TransferResult<TransportRequest> {
    let range = ByteRange::new(offset, Some(body.len() as u64));
    let request = TransportRequest::new(Method::PUT, with_comp(url, "page"))
        .with_header(headers::PAGE_WRITE, "update")?
        .with_header(headers::RANGE, range.header_value())?
        .with_header(headers::CONTENT_LENGTH, body.len().to_string())?
        .with_body(body);
    with_optional_md5(request, md5)
}

pub fn create_append_blob(url: &Url, blob: &BlobHeaders) -> TransferResult<TransportRequest> {
    let request = TransportRequest::new(Method::PUT, url.clone())
        .with_header(headers::BLOB_TYPE, BlobKind::Append.header_value())?
        .with_header(headers::CONTENT_LENGTH, "0")?;
    blob.apply(request)
}

pub fn append_block(
    url: &Url,
    body: Bytes,
    md5: Option<&str>,
    conditions: AppendConditions,
) -> TransferResult<TransportRequest> {
    let mut request = TransportRequest::new(Method::PUT, with_comp(url, "appendblock"))
        .with_header(headers::CONTENT_LENGTH, body.len().to_string())?
        .with_body(body);
    if let Some(position) = conditions.append_position {
        request.insert_header(headers::APPEND_POSITION, position.to_string())?;
    }
    if let Some(max_size) = conditions.max_size {
        request.insert_header(headers::MAX_SIZE, max_size.to_string())?;
    }
    with_optional_md5(request, md5)
}

/// GET of the whole blob or a range, optionally pinned to an ETag
pub fn get_blob(
    url: &Url,
    range: Option<ByteRange>,
    if_match: Option<&str>,
    range_md5: bool,
) -> TransferResult<TransportRequest> {
    let mut request = TransportRequest::new(Method::GET, url.clone());
    if let Some(range) = range {
        request.insert_header(headers::RANGE, range.header_value())?;
        if range_md5 {
            request.insert_header(headers::RANGE_GET_CONTENT_MD5, "true")?;
        }
    }
    if let Some(etag) = if_match {
        request.insert_header(headers::IF_MATCH, etag)?;
    }
    Ok(request)
}

pub fn get_properties(url: &Url) -> TransferResult<TransportRequest> {
    Ok(TransportRequest::new(Method::HEAD, url.clone()))
}

/// `<BlockList>` body committing `blocks` in order
pub fn block_list_xml(blocks: &[BlockId]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for block in blocks {
        xml.push_str("<Latest>");
        xml.push_str(&xml_escape(block.as_str()));
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Block ids named in a `<BlockList>` body, in order
pub fn parse_block_list_xml(xml: &str) -> Option<Vec<String>> {
    let start = xml.find("<BlockList>")? + "<BlockList>".len();
    let end = xml.find("</BlockList>")?;
    let mut rest = xml.get(start..end)?;
    let mut ids = Vec::new();
    while let Some(open) = rest.find('<') {
        let close = rest[open..].find('>')? + open;
        let tag = &rest[open + 1..close];
        if !matches!(tag, "Latest" | "Committed" | "Uncommitted") {
            return None;
        }
        let closing = format!("</{}>", tag);
        let value_end = rest[close..].find(&closing)? + close;
        ids.push(xml_unescape(&rest[close + 1..value_end]));
        rest = &rest[value_end + closing.len()..];
    }
    Some(ids)
}

/// Escape text for an XML element body
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(text: &str) -> String {
    // `&amp;` last so an escaped entity is not decoded twice
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Classify a non-success response
pub fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &[u8], location: StorageLocation) -> AttemptError {
    let error_code = headers
        .get(headers::ERROR_CODE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| error_code_from_body(body));
    let failure = ServiceFailure {
        status: Some(status.as_u16()),
        error_code,
        message: status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string(),
    };
    if is_retryable_status(status, location) {
        AttemptError::Retryable(failure)
    } else {
        AttemptError::Fatal(failure)
    }
}

/// 408, 5xx other than 501/505, and a 404 from the secondary
pub fn is_retryable_status(status: StatusCode, location: StorageLocation) -> bool {
    match status.as_u16() {
        408 => true,
        501 | 505 => false,
        500..=599 => true,
        404 => location == StorageLocation::Secondary,
        _ => false,
    }
}

fn error_code_from_body(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let start = text.find("<Code>")? + "<Code>".len();
    let end = text[start..].find("</Code>")? + start;
    Some(text[start..end].to_string())
}

/// Accept one of `expected`, classify anything else
pub fn check_status(parts: &ResponseParts, attempt: &AttemptContext, expected: &[StatusCode]) -> Result<(), AttemptError> {
    if expected.contains(&parts.status) {
        Ok(())
    } else {
        Err(classify_failure(parts.status, &parts.headers, &parts.body, attempt.location))
    }
}

/// Properties carried by the headers of a HEAD or GET response
pub fn parse_properties(headers: &HeaderMap) -> BlobProperties {
    let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let number = |name: &str| text(name).and_then(|v| v.parse::<u64>().ok());

    let content_length = text(headers::CONTENT_RANGE)
        .and_then(parse_content_range)
        .and_then(|range| range.total)
        .or_else(|| number(headers::CONTENT_LENGTH))
        .unwrap_or(0);

    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(headers::META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    BlobProperties {
        blob_kind: text(headers::BLOB_TYPE).and_then(BlobKind::from_header_value),
        content_length,
        content_type: text(headers::CONTENT_TYPE).map(str::to_string),
        content_md5: text(headers::BLOB_CONTENT_MD5)
            .or_else(|| text(headers::CONTENT_MD5))
            .map(str::to_string),
        etag: text(headers::ETAG).map(str::to_string),
        last_modified: text(headers::LAST_MODIFIED)
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        append_offset: number(headers::APPEND_OFFSET),
        committed_block_count: number(headers::COMMITTED_BLOCK_COUNT).map(|n| n as u32),
        metadata,
    }
}

/// Parsed `Content-Range: bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end_inclusive: u64,
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let total = match total {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange {
        start: start.parse().ok()?,
        end_inclusive: end.parse().ok()?,
        total,
    })
}

/// RFC 1123 date as used by `x-ms-date`
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn finish_md5(hasher: Md5) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn md5_of(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    finish_md5(hasher)
}

/// Base64 form used by `Content-MD5`
pub fn encode_md5(digest: &[u8; 16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}
