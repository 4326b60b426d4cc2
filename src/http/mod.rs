//! HTTP plumbing: transport boundary, retry policy and session lifecycle.

mod retry;
mod session;
mod transport;

pub use retry::{MAX_RETRY_AFTER, Outcome, RetryDecision, RetryPolicy, parse_retry_after};
pub use session::{SessionManager, TransportHandle};
pub use transport::{
    RawResponse, ReqwestTransport, ReqwestTransportFactory, Transport, TransportFactory,
    TransportRequest, classify_transport_error,
};

#[cfg(test)]
pub use transport::{MockTransport, MockTransportFactory};
