//! Parsed responses and the accumulated result handed back to callers.

use log::warn;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, LINK};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::http::RawResponse;

/// Body of one response, parsed according to its content type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
    Empty,
}

impl ResponseBody {
    pub fn from_bytes(headers: &HeaderMap, body: Vec<u8>) -> Self {
        if body.is_empty() {
            return ResponseBody::Empty;
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("json") {
            match serde_json::from_slice(&body) {
                Ok(value) => ResponseBody::Json(value),
                Err(e) => {
                    warn!("JSON parsing failed for response ({}), keeping raw bytes", e);
                    ResponseBody::Bytes(body)
                }
            }
        } else if content_type.starts_with("text/") {
            match String::from_utf8(body) {
                Ok(text) => ResponseBody::Text(text),
                Err(e) => ResponseBody::Bytes(e.into_bytes()),
            }
        } else {
            ResponseBody::Bytes(body)
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Lossy textual rendering.
    pub fn to_text(&self) -> String {
        match self {
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            ResponseBody::Empty => String::new(),
        }
    }
}

/// One transport round trip. Consumed by the executor within the
/// iteration that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePage {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl ResponsePage {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json(status: StatusCode, body: Value) -> Self {
        Self::new(status, HeaderMap::new(), ResponseBody::Json(body))
    }

    pub fn from_raw(raw: RawResponse) -> Self {
        let body = ResponseBody::from_bytes(&raw.headers, raw.body);
        Self::new(raw.status, raw.headers, body)
    }

    /// Relations from the `Link` header, e.g. `next` -> URL.
    pub fn links(&self) -> HashMap<String, String> {
        let mut links = HashMap::new();
        for value in self.headers.get_all(LINK) {
            if let Ok(value) = value.to_str() {
                links.extend(parse_link_header(value));
            }
        }
        links
    }
}

/// Parses an RFC 8288 `Link` header value into `rel -> url` pairs.
pub fn parse_link_header(value: &str) -> HashMap<String, String> {
    let mut links = HashMap::new();

    for link in value.split(',') {
        let mut parts = link.split(';');
        let Some(url) = parts.next() else { continue };
        let url = url.trim().trim_start_matches('<').trim_end_matches('>').trim();
        if url.is_empty() {
            continue;
        }

        for param in parts {
            let Some((key, rel)) = param.split_once('=') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("rel") {
                continue;
            }
            for rel in rel.trim().trim_matches('"').split_whitespace() {
                links.insert(rel.to_ascii_lowercase(), url.to_string());
            }
        }
    }

    links
}

/// What a logical call returns.
///
/// `paginated_responses` and `paginated_results` are populated only when
/// more than one page was fetched; a single-page call has the same shape
/// with both left empty.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Body of the first page.
    pub data: ResponseBody,
    pub paginated_responses: Vec<ResponseBody>,
    pub paginated_results: Vec<Value>,
    pub pages_fetched: usize,
}

impl AccumulatedResult {
    pub fn is_paginated(&self) -> bool {
        self.pages_fetched > 1
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        match &self.data {
            ResponseBody::Json(value) => Ok(T::deserialize(value)?),
            ResponseBody::Text(text) => Ok(serde_json::from_str(text)?),
            ResponseBody::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            ResponseBody::Empty => Ok(serde_json::from_value(Value::Null)?),
        }
    }

    pub fn results_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, ApiError> {
        self.paginated_results
            .iter()
            .map(|item| T::deserialize(item).map_err(ApiError::from))
            .collect()
    }
}

/// Collects pages in fetch order.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    first: Option<(StatusCode, HeaderMap, ResponseBody)>,
    responses: Vec<ResponseBody>,
    results: Vec<Value>,
    limit: Option<usize>,
}

impl Accumulator {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, page: ResponsePage, items: Vec<Value>) {
        if self.first.is_none() {
            self.first = Some((page.status, page.headers, page.body.clone()));
        }
        self.responses.push(page.body);
        self.results.extend(items);
    }

    pub(crate) fn pages(&self) -> usize {
        self.responses.len()
    }

    pub(crate) fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.results.len() >= limit)
    }

    pub(crate) fn finish(self) -> AccumulatedResult {
        let pages_fetched = self.responses.len();
        let (status, headers, data) = self
            .first
            .unwrap_or((StatusCode::OK, HeaderMap::new(), ResponseBody::Empty));

        let (paginated_responses, mut paginated_results) = if pages_fetched > 1 {
            (self.responses, self.results)
        } else {
            (Vec::new(), Vec::new())
        };
        if let Some(limit) = self.limit {
            paginated_results.truncate(limit);
        }

        AccumulatedResult {
            status,
            headers,
            data,
            paginated_responses,
            paginated_results,
            pages_fetched,
        }
    }
}
