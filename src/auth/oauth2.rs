//! OAuth2 bearer tokens with refresh.

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{AuthCredential, AuthStrategy, expiry_after, header_value, mask};
use crate::config::{ClientConfig, ConfigError};
use crate::error::ApiError;
use crate::request::RequestSpec;

/// Token endpoint reply (RFC 6749 §5.1).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Obtains a new access token for the current credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &AuthCredential) -> Result<TokenResponse, ApiError>;
}

/// Performs the `refresh_token` grant against a token URL.
pub struct TokenEndpoint {
    client: Client,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl TokenEndpoint {
    /// Applies the config's user agent, TLS verification and timeout. The
    /// API's default headers are not sent to the token URL.
    pub fn from_config(
        token_url: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self, ConfigError> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(!config.verify_ssl);
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("token endpoint client: {}", e)))?;
        Ok(Self::with_client(client, token_url))
    }

    pub fn with_client(client: Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: None,
            client_secret: None,
        }
    }

    pub fn with_client_credentials(
        mut self,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        self.client_id = client_id;
        self.client_secret = client_secret;
        self
    }
}

#[async_trait]
impl TokenRefresher for TokenEndpoint {
    #[tracing::instrument(skip(self, current))]
    async fn refresh(&self, current: &AuthCredential) -> Result<TokenResponse, ApiError> {
        let refresh_token = current.refresh_token.as_deref().ok_or_else(|| {
            ApiError::Authentication("no refresh token available".to_string())
        })?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = self.client_id.as_deref() {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = self.client_secret.as_deref() {
            form.push(("client_secret", client_secret));
        }

        debug!("Refreshing access token at {}...", self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ApiError::Authentication(format!("token refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Authentication(format!(
                "token endpoint returned HTTP {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ApiError::Authentication(format!("invalid token response: {}", e)))
    }
}

/// Bearer token that is refreshed on 401 or when it has expired.
///
/// Refreshes are serialized; a caller whose credential was already
/// replaced by a concurrent refresh receives the new credential instead of
/// triggering a second refresh, which could otherwise invalidate the
/// freshly issued token.
pub struct OAuth2Auth {
    credential: RwLock<AuthCredential>,
    refresh_lock: Mutex<()>,
    refresher: Arc<dyn TokenRefresher>,
}

impl OAuth2Auth {
    pub fn new(credential: AuthCredential, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            credential: RwLock::new(credential),
            refresh_lock: Mutex::new(()),
            refresher,
        }
    }

    pub async fn credential(&self) -> AuthCredential {
        self.credential.read().await.clone()
    }
}

#[async_trait]
impl AuthStrategy for OAuth2Auth {
    async fn apply(&self, request: &mut RequestSpec) -> Result<u64, ApiError> {
        let mut credential = self.credential().await;
        if credential.is_expired() {
            debug!("Access token generation {} expired", credential.generation);
            credential = self.refresh(credential.generation).await?;
        }

        let value = header_value(&format!("Bearer {}", credential.token))?;
        request.headers.insert(AUTHORIZATION, value);
        Ok(credential.generation)
    }

    async fn refresh(&self, stale_generation: u64) -> Result<AuthCredential, ApiError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.credential().await;
        if current.generation != stale_generation {
            debug!(
                "Credential generation {} already refreshed to {}",
                stale_generation, current.generation
            );
            return Ok(current);
        }

        let response = self.refresher.refresh(&current).await.map_err(|e| {
            error!("Token refresh failed: {}", e);
            match e {
                ApiError::Authentication(_) => e,
                other => ApiError::Authentication(other.to_string()),
            }
        })?;

        if let Some(token_type) = response.token_type.as_deref() {
            if !token_type.eq_ignore_ascii_case("bearer") {
                warn!("Token endpoint issued a '{}' token; sending it as Bearer", token_type);
            }
        }

        let next = AuthCredential {
            token: response.access_token,
            refresh_token: response.refresh_token.or(current.refresh_token),
            expires_at: response
                .expires_in
                .and_then(|seconds| expiry_after(Duration::from_secs(seconds))),
            generation: current.generation + 1,
        };
        debug!(
            "Refreshed access token {} (generation {})",
            mask(&next.token),
            next.generation
        );

        *self.credential.write().await = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn endpoint_config() -> ClientConfig {
        ClientConfig::new("https://api.example.com")
    }

    fn token(access: &str) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
        }
    }

    #[tokio::test]
    async fn test_apply_uses_current_token() {
        let auth = OAuth2Auth::new(
            AuthCredential::new("dummy_oauth_token"),
            Arc::new(MockTokenRefresher::new()),
        );
        let mut request = RequestSpec::get("/");
        let generation = auth.apply(&mut request).await.unwrap();

        assert_eq!(generation, 0);
        assert_eq!(request.headers[AUTHORIZATION], "Bearer dummy_oauth_token");
    }

    #[tokio::test]
    async fn test_refresh_replaces_credential_and_keeps_refresh_token() {
        let mut refresher = MockTokenRefresher::new();
        refresher
            .expect_refresh()
            .withf(|current| current.refresh_token.as_deref() == Some("r1"))
            .times(1)
            .returning(|_| Ok(token("new-access")));

        let auth = OAuth2Auth::new(
            AuthCredential::new("old-access").with_refresh_token("r1"),
            Arc::new(refresher),
        );
        let refreshed = auth.refresh(0).await.unwrap();

        assert_eq!(refreshed.token, "new-access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
        assert_eq!(refreshed.generation, 1);
        assert!(!refreshed.is_expired());
        assert_eq!(auth.credential().await, refreshed);
    }

    #[tokio::test]
    async fn test_unrepresentable_expires_in_means_no_expiry() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| {
            Ok(TokenResponse {
                expires_in: Some(u64::MAX),
                ..token("long-lived")
            })
        });
        let auth = OAuth2Auth::new(AuthCredential::new("old"), Arc::new(refresher));

        let refreshed = auth.refresh(0).await.unwrap();
        assert_eq!(refreshed.token, "long-lived");
        assert_eq!(refreshed.expires_at, None);
        assert_eq!(refreshed.generation, 1);
    }

    #[tokio::test]
    async fn test_token_endpoint_sends_configured_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("user-agent", "wedgie-test/1.0")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "a2"}"#)
            .create_async()
            .await;

        let mut config = endpoint_config();
        config.user_agent = "wedgie-test/1.0".to_string();
        let endpoint = TokenEndpoint::from_config(format!("{}/token", server.url()), &config).unwrap();
        let response = endpoint
            .refresh(&AuthCredential::new("a1").with_refresh_token("r1"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.access_token, "a2");
        assert_eq!(response.expires_in, None);
    }

    #[tokio::test]
    async fn test_stale_refresh_is_coalesced() {
        let mut refresher = MockTokenRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Ok(token("new-access")));
        let auth = OAuth2Auth::new(AuthCredential::new("old"), Arc::new(refresher));

        let first = auth.refresh(0).await.unwrap();
        let second = auth.refresh(0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.generation, 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_call_endpoint_once() {
        struct SlowRefresher {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl TokenRefresher for SlowRefresher {
            async fn refresh(&self, _current: &AuthCredential) -> Result<TokenResponse, ApiError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(token("fresh"))
            }
        }

        let refresher = Arc::new(SlowRefresher {
            calls: AtomicUsize::new(0),
        });
        let auth = Arc::new(OAuth2Auth::new(AuthCredential::new("old"), refresher.clone()));

        let tasks = (0..8).map(|_| {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { auth.refresh(0).await })
        });
        let results = futures_util::future::join_all(tasks).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap().token, "fresh");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshed_before_apply() {
        let mut refresher = MockTokenRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Ok(token("renewed")));
        let auth = OAuth2Auth::new(
            AuthCredential::new("expired")
                .with_expiry(SystemTime::now() - Duration::from_secs(5)),
            Arc::new(refresher),
        );

        let mut request = RequestSpec::get("/");
        let generation = auth.apply(&mut request).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(request.headers[AUTHORIZATION], "Bearer renewed");
    }

    #[tokio::test]
    async fn test_refresh_failure_is_authentication_error() {
        let mut refresher = MockTokenRefresher::new();
        refresher
            .expect_refresh()
            .returning(|_| Err(ApiError::Authentication("invalid_grant".into())));
        let auth = OAuth2Auth::new(AuthCredential::new("old"), Arc::new(refresher));

        let err = auth.refresh(0).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(msg) if msg.contains("invalid_grant")));
        assert_eq!(auth.credential().await.token, "old");
    }

    #[tokio::test]
    async fn test_token_endpoint_refresh_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "app".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "a2", "refresh_token": "r2", "expires_in": 60, "token_type": "bearer"}"#)
            .create_async()
            .await;

        let endpoint = TokenEndpoint::from_config(format!("{}/token", server.url()), &endpoint_config())
            .unwrap()
            .with_client_credentials(Some("app".into()), None);
        let response = endpoint
            .refresh(&AuthCredential::new("a1").with_refresh_token("r1"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.access_token, "a2");
        assert_eq!(response.refresh_token.as_deref(), Some("r2"));
        assert_eq!(response.expires_in, Some(60));
    }

    #[tokio::test]
    async fn test_token_endpoint_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let endpoint =
            TokenEndpoint::from_config(format!("{}/token", server.url()), &endpoint_config())
                .unwrap();
        let err = endpoint
            .refresh(&AuthCredential::new("a1").with_refresh_token("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Authentication(msg) if msg.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_token_endpoint_requires_refresh_token() {
        let endpoint = TokenEndpoint::with_client(Client::new(), "http://127.0.0.1:9/token");
        let err = endpoint.refresh(&AuthCredential::new("a1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }
}
