//! Description of one HTTP call, built per call and per page.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    /// Path relative to the client's base URL, or an absolute URL.
    pub target: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Allow retries even when the method is not idempotent.
    pub retry_unsafe: bool,
    /// Overrides whether pagination is walked; defaults to GET only.
    pub paginate: Option<bool>,
    /// Stop accumulating once this many result items were gathered.
    pub result_limit: Option<usize>,
}

impl RequestSpec {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
            retry_unsafe: false,
            paginate: None,
            result_limit: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a header from strings, validating both parts.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, ApiError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InvalidRequest(format!("header '{}': {}", name, e)))?;
        Ok(self.header(name, value))
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn bytes(mut self, body: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes(body);
        self
    }

    pub fn retry_unsafe(mut self, enabled: bool) -> Self {
        self.retry_unsafe = enabled;
        self
    }

    pub fn paginate(mut self, enabled: bool) -> Self {
        self.paginate = Some(enabled);
        self
    }

    pub fn result_limit(mut self, limit: usize) -> Self {
        self.result_limit = Some(limit);
        self
    }

    /// Replaces every occurrence of `key` with a single `key=value` pair.
    pub fn set_query(&mut self, key: &str, value: impl Into<String>) {
        self.query.retain(|(k, _)| k != key);
        self.query.push((key.to_string(), value.into()));
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
        )
    }

    pub fn should_paginate(&self) -> bool {
        self.paginate.unwrap_or(self.method == Method::GET)
    }

    /// Absolute targets are used verbatim; relative ones are appended to
    /// the base URL's path.
    pub fn resolve_url(&self, base: &Url) -> Result<Url, ApiError> {
        if let Ok(url) = Url::parse(&self.target) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(url);
            }
        }

        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            self.target.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| ApiError::InvalidRequest(format!("target '{}': {}", self.target, e)))
    }
}
