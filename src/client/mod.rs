//! The API client: configuration plus collaborators, and the entry points
//! for logical calls.

mod executor;

use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{self, AuthStrategy};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::http::{ReqwestTransportFactory, RetryPolicy, SessionManager, TransportFactory};
use crate::pagination::PaginationSettings;
use crate::request::RequestSpec;
use crate::response::AccumulatedResult;
use crate::runtime::{Sleeper, TokioSleeper};

/// Cheap to clone; clones share the session, credentials and config.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ClientConfig>,
    base_url: Url,
    default_headers: HeaderMap,
    auth: Arc<dyn AuthStrategy>,
    session: SessionManager,
    retry: RetryPolicy,
    pagination: PaginationSettings,
    sleeper: Arc<dyn Sleeper>,
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    auth: Option<Arc<dyn AuthStrategy>>,
    factory: Option<Arc<dyn TransportFactory>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    retry: Option<RetryPolicy>,
}

impl ApiClientBuilder {
    /// Overrides the strategy derived from `config.auth`.
    pub fn auth(mut self, auth: Arc<dyn AuthStrategy>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let auth = match self.auth {
            Some(auth) => auth,
            None => auth::from_config(&config)?,
        };
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(ReqwestTransportFactory::new(Arc::clone(&config))));

        let inner = Inner {
            base_url: config.parsed_base_url()?,
            default_headers: config.header_map()?,
            auth,
            session: SessionManager::new(factory),
            retry: self
                .retry
                .unwrap_or_else(|| RetryPolicy::from_config(&config)),
            pagination: config.pagination.clone(),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            config,
        };

        Ok(ApiClient {
            inner: Arc::new(inner),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            auth: None,
            factory: None,
            sleeper: None,
            retry: None,
        }
    }

    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }

    /// Runs one logical call: authenticate, send, retry, paginate.
    #[tracing::instrument(skip(self, spec), fields(method = %spec.method, target = %spec.target))]
    pub async fn execute(&self, spec: RequestSpec) -> Result<AccumulatedResult, ApiError> {
        executor::LogicalCall::new(&self.inner, spec).run().await
    }

    pub async fn get(&self, path: &str) -> Result<AccumulatedResult, ApiError> {
        self.execute(RequestSpec::get(path)).await
    }

    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<AccumulatedResult, ApiError> {
        let spec = query
            .iter()
            .fold(RequestSpec::get(path), |spec, (k, v)| spec.query(*k, *v));
        self.execute(spec).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> Result<AccumulatedResult, ApiError> {
        self.execute(RequestSpec::post(path).json(body)).await
    }

    pub async fn request(&self, method: Method, path: &str) -> Result<AccumulatedResult, ApiError> {
        self.execute(RequestSpec::new(method, path)).await
    }
}
