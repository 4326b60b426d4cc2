//! Transport boundary: one request in, status/headers/body out.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, USER_AGENT};
use reqwest::{Client, Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::request::RequestBody;

/// A fully resolved, authenticated request ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError>;
}

/// Builds transports for the session manager.
#[cfg_attr(test, mockall::automock)]
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Transport backed by a reqwest `Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        debug!("{} {} with query {:?}...", request.method, request.url, request.query);

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Bytes(bytes) => builder.body(bytes),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(classify_transport_error)?
            .to_vec();

        debug!("Received HTTP {} ({} bytes)", status, body.len());
        Ok(RawResponse::new(status, headers, body))
    }
}

/// Builds one reqwest-backed transport per session from the config.
pub struct ReqwestTransportFactory {
    config: Arc<ClientConfig>,
}

impl ReqwestTransportFactory {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let mut headers = self
            .config
            .header_map()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        headers.remove(USER_AGENT);

        let mut builder = Client::builder()
            .user_agent(self.config.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(!self.config.verify_ssl);
        if let Some(timeout) = self.config.timeout() {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        debug!("Created HTTP client for {}", self.config.base_url);
        Ok(Arc::new(ReqwestTransport::new(client)))
    }
}

/// Maps a reqwest failure onto the transport taxonomy.
pub fn classify_transport_error(error: reqwest::Error) -> TransportError {
    let message = error_chain(&error);

    if is_context_torn_down(&message) {
        return TransportError::ContextTornDown(message);
    }
    if error.is_timeout() {
        return TransportError::Timeout(message);
    }
    if error.is_connect() || looks_like_connection_error(&message) {
        return TransportError::Connect(message);
    }
    TransportError::Other(message)
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// hyper reports these when the runtime driving the connection was dropped.
fn is_context_torn_down(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("dispatch task is gone")
        || message.contains("runtime dropped the dispatch task")
        || message.contains("runtime is shutting down")
}

fn looks_like_connection_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("connection")
        || message.contains("reset")
        || message.contains("broken pipe")
        || message.contains("dns")
        || message.contains("resolve")
}
