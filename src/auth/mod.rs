//! Authentication strategies.
//!
//! A strategy augments each outgoing request and, when the server rejects
//! a credential with 401, may refresh it once. Static strategies cannot
//! refresh and report that as an authentication error.

mod oauth2;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{AuthSettings, ClientConfig, ConfigError};
use crate::error::ApiError;
use crate::request::RequestSpec;

pub use oauth2::{OAuth2Auth, TokenEndpoint, TokenRefresher, TokenResponse};

#[cfg(test)]
pub use oauth2::MockTokenRefresher;

/// Token material held by a strategy. `generation` increases on every
/// refresh so concurrent callers can tell whether a refresh already
/// happened.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<SystemTime>,
    pub generation: u64,
}

impl AuthCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refresh_token: None,
            expires_at: None,
            generation: 0,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A lifetime too long to represent leaves the credential without an
    /// expiry.
    pub fn expires_in(mut self, lifetime: Duration) -> Self {
        self.expires_at = expiry_after(lifetime);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= SystemTime::now())
    }
}

pub(crate) fn expiry_after(lifetime: Duration) -> Option<SystemTime> {
    SystemTime::now().checked_add(lifetime)
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("token", &mask(&self.token))
            .field("refresh_token", &self.refresh_token.as_deref().map(mask))
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Keeps the first and last few characters of a secret for diagnostics.
pub(crate) fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Adds credentials to `request`. Returns the generation of the
    /// credential that was applied.
    async fn apply(&self, request: &mut RequestSpec) -> Result<u64, ApiError>;

    /// Replaces the credential of generation `stale_generation`. If a newer
    /// credential already exists it is returned without refreshing again.
    async fn refresh(&self, stale_generation: u64) -> Result<AuthCredential, ApiError>;
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| ApiError::InvalidRequest(format!("credential is not a valid header value: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

fn not_refreshable(kind: &str) -> ApiError {
    ApiError::Authentication(format!(
        "server rejected the credentials and {} credentials cannot be refreshed",
        kind
    ))
}

/// Sends requests unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthStrategy for NoAuth {
    async fn apply(&self, _request: &mut RequestSpec) -> Result<u64, ApiError> {
        Ok(0)
    }

    async fn refresh(&self, _stale_generation: u64) -> Result<AuthCredential, ApiError> {
        Err(ApiError::Authentication(
            "server requires authentication but none is configured".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiKeyPlacement {
    Header(HeaderName),
    Query(String),
}

/// Static API key sent in a header or a query parameter.
#[derive(Clone)]
pub struct ApiKeyAuth {
    key: String,
    placement: ApiKeyPlacement,
}

impl ApiKeyAuth {
    pub const DEFAULT_HEADER: &'static str = "x-api-key";

    pub fn header(key: impl Into<String>, header: HeaderName) -> Self {
        Self {
            key: key.into(),
            placement: ApiKeyPlacement::Header(header),
        }
    }

    pub fn query(key: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            placement: ApiKeyPlacement::Query(param.into()),
        }
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyAuth {
    async fn apply(&self, request: &mut RequestSpec) -> Result<u64, ApiError> {
        match &self.placement {
            ApiKeyPlacement::Header(name) => {
                request.headers.insert(name.clone(), header_value(&self.key)?);
            }
            ApiKeyPlacement::Query(param) => request.set_query(param, self.key.clone()),
        }
        Ok(0)
    }

    async fn refresh(&self, _stale_generation: u64) -> Result<AuthCredential, ApiError> {
        Err(not_refreshable("API key"))
    }
}

/// HTTP basic authentication.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn encoded(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    async fn apply(&self, request: &mut RequestSpec) -> Result<u64, ApiError> {
        let value = header_value(&format!("Basic {}", self.encoded()))?;
        request.headers.insert(AUTHORIZATION, value);
        Ok(0)
    }

    async fn refresh(&self, _stale_generation: u64) -> Result<AuthCredential, ApiError> {
        Err(not_refreshable("basic"))
    }
}

/// Static token in a configurable header, optionally prefixed
/// (`Authorization: Bearer <token>`).
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
    header_name: HeaderName,
    prefix: Option<String>,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>, header_name: HeaderName, prefix: Option<String>) -> Self {
        Self {
            token: token.into(),
            header_name,
            prefix,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(token, AUTHORIZATION, Some("Bearer".to_string()))
    }
}

#[async_trait]
impl AuthStrategy for TokenAuth {
    async fn apply(&self, request: &mut RequestSpec) -> Result<u64, ApiError> {
        let value = match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{} {}", prefix, self.token),
            _ => self.token.clone(),
        };
        request
            .headers
            .insert(self.header_name.clone(), header_value(&value)?);
        Ok(0)
    }

    async fn refresh(&self, _stale_generation: u64) -> Result<AuthCredential, ApiError> {
        Err(not_refreshable("static token"))
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ConfigError::Invalid(format!("auth header '{}': {}", name, e)))
}

/// Builds the strategy selected by `config.auth`. The OAuth2 token
/// endpoint shares the config's TLS, user agent and timeout settings.
pub fn from_config(config: &ClientConfig) -> Result<Arc<dyn AuthStrategy>, ConfigError> {
    let settings = &config.auth;
    let strategy: Arc<dyn AuthStrategy> = match settings {
        AuthSettings::None => Arc::new(NoAuth),
        AuthSettings::ApiKey {
            key,
            header,
            query_param,
        } => match query_param {
            Some(param) => Arc::new(ApiKeyAuth::query(key.clone(), param.clone())),
            None => {
                let header = header.as_deref().unwrap_or(ApiKeyAuth::DEFAULT_HEADER);
                Arc::new(ApiKeyAuth::header(key.clone(), parse_header_name(header)?))
            }
        },
        AuthSettings::Basic { username, password } => {
            Arc::new(BasicAuth::new(username.clone(), password.clone()))
        }
        AuthSettings::Token {
            token,
            header_name,
            prefix,
        } => Arc::new(TokenAuth::new(
            token.clone(),
            parse_header_name(header_name)?,
            prefix.clone(),
        )),
        AuthSettings::Bearer { token } => Arc::new(TokenAuth::bearer(token.clone())),
        AuthSettings::OAuth2 {
            access_token,
            refresh_token,
            token_url,
            client_id,
            client_secret,
            expires_in_seconds,
        } => {
            let mut credential = AuthCredential::new(access_token.clone());
            if let Some(refresh_token) = refresh_token {
                credential = credential.with_refresh_token(refresh_token.clone());
            }
            if let Some(seconds) = expires_in_seconds {
                credential = credential.expires_in(Duration::from_secs(*seconds));
            }
            let endpoint = TokenEndpoint::from_config(token_url.clone(), config)?
                .with_client_credentials(client_id.clone(), client_secret.clone());
            Arc::new(OAuth2Auth::new(credential, Arc::new(endpoint)))
        }
    };

    debug!("Using {} authentication", settings_kind(settings));
    Ok(strategy)
}

fn settings_kind(settings: &AuthSettings) -> &'static str {
    match settings {
        AuthSettings::None => "no",
        AuthSettings::ApiKey { .. } => "API key",
        AuthSettings::Basic { .. } => "basic",
        AuthSettings::Token { .. } => "token",
        AuthSettings::Bearer { .. } => "bearer token",
        AuthSettings::OAuth2 { .. } => "OAuth2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_auth_leaves_request_untouched() {
        let mut request = RequestSpec::get("/");
        NoAuth.apply(&mut request).await.unwrap();
        assert!(request.headers.is_empty());
        assert!(request.query.is_empty());
        assert!(matches!(NoAuth.refresh(0).await, Err(ApiError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_api_key_in_header() {
        let auth = ApiKeyAuth::header("secret-key", HeaderName::from_static("x-api-key"));
        let mut request = RequestSpec::get("/");
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers["x-api-key"], "secret-key");
        assert!(request.headers["x-api-key"].is_sensitive());
    }

    #[tokio::test]
    async fn test_api_key_in_query() {
        let auth = ApiKeyAuth::query("secret-key", "api_key");
        let mut request = RequestSpec::get("/").query("api_key", "old");
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.query, vec![("api_key".to_string(), "secret-key".to_string())]);
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let auth = BasicAuth::new("dummy_user", "dummy_pass");
        let mut request = RequestSpec::get("/");
        auth.apply(&mut request).await.unwrap();
        // base64("dummy_user:dummy_pass")
        assert_eq!(
            request.headers[AUTHORIZATION],
            "Basic ZHVtbXlfdXNlcjpkdW1teV9wYXNz"
        );
        assert!(matches!(auth.refresh(0).await, Err(ApiError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let auth = TokenAuth::bearer("dummy_bearer_token");
        let mut request = RequestSpec::get("/");
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers[AUTHORIZATION], "Bearer dummy_bearer_token");
    }

    #[tokio::test]
    async fn test_token_without_prefix() {
        let auth = TokenAuth::new("raw", HeaderName::from_static("x-token"), None);
        let mut request = RequestSpec::get("/");
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers["x-token"], "raw");
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected() {
        let auth = TokenAuth::bearer("bad\ntoken");
        let mut request = RequestSpec::get("/");
        assert!(matches!(
            auth.apply(&mut request).await,
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_credential_expiry() {
        let credential = AuthCredential::new("t");
        assert!(!credential.is_expired());

        let expired = AuthCredential::new("t").with_expiry(SystemTime::now() - Duration::from_secs(1));
        assert!(expired.is_expired());

        let fresh = AuthCredential::new("t").expires_in(Duration::from_secs(3600));
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_unrepresentable_lifetime_means_no_expiry() {
        let credential = AuthCredential::new("t").expires_in(Duration::from_secs(u64::MAX));
        assert_eq!(credential.expires_at, None);
        assert!(!credential.is_expired());
    }

    #[tokio::test]
    async fn test_huge_configured_lifetime_does_not_panic() {
        let config = ClientConfig::new("https://api.example.com").with_auth(AuthSettings::OAuth2 {
            access_token: "access".into(),
            refresh_token: None,
            token_url: "https://auth.example.com/token".into(),
            client_id: None,
            client_secret: None,
            expires_in_seconds: Some(u64::MAX),
        });
        let auth = from_config(&config).unwrap();
        let mut request = RequestSpec::get("/");
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers[AUTHORIZATION], "Bearer access");
    }

    #[test]
    fn test_credential_debug_masks_secrets() {
        let credential =
            AuthCredential::new("abcd1234567890wxyz").with_refresh_token("short");
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("abcd*********wxyz"));
        assert!(!rendered.contains("1234567890"));
        assert!(!rendered.contains("short"));
    }

    #[tokio::test]
    async fn test_from_config_builds_each_strategy() {
        let mut request = RequestSpec::get("/");
        let auth = from_config(&ClientConfig::new("https://api.example.com").with_auth(
            AuthSettings::ApiKey {
                key: "k".into(),
                header: None,
                query_param: None,
            },
        ))
        .unwrap();
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers["x-api-key"], "k");

        let mut request = RequestSpec::get("/");
        let auth = from_config(&ClientConfig::new("https://api.example.com").with_auth(
            AuthSettings::Token {
                token: "t".into(),
                header_name: "X-Auth".into(),
                prefix: Some("Token".into()),
            },
        ))
        .unwrap();
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers["x-auth"], "Token t");

        let mut request = RequestSpec::get("/");
        let auth = from_config(&ClientConfig::new("https://api.example.com").with_auth(
            AuthSettings::OAuth2 {
                access_token: "access".into(),
                refresh_token: Some("refresh".into()),
                token_url: "https://auth.example.com/token".into(),
                client_id: None,
                client_secret: None,
                expires_in_seconds: Some(3600),
            },
        ))
        .unwrap();
        auth.apply(&mut request).await.unwrap();
        assert_eq!(request.headers[AUTHORIZATION], "Bearer access");
    }

    #[test]
    fn test_from_config_rejects_bad_header_name() {
        let result = from_config(&ClientConfig::new("https://api.example.com").with_auth(
            AuthSettings::Token {
                token: "t".into(),
                header_name: "bad header".into(),
                prefix: None,
            },
        ));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
