pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod pagination;
pub mod request;
pub mod response;
pub mod runtime;

pub use auth::{
    ApiKeyAuth, AuthCredential, AuthStrategy, BasicAuth, NoAuth, OAuth2Auth, TokenAuth,
    TokenEndpoint, TokenRefresher,
};
pub use client::{ApiClient, ApiClientBuilder};
pub use config::{AuthSettings, ClientConfig, ConfigError};
pub use error::{ApiError, TransportError};
pub use http::{RetryPolicy, SessionManager, Transport, TransportFactory};
pub use pagination::{PaginationSettings, PaginationStrategy};
pub use request::{RequestBody, RequestSpec};
pub use response::{AccumulatedResult, ResponseBody, ResponsePage};
pub use runtime::{Sleeper, TokioSleeper};
