//! One logical call, driven as an explicit state machine.
//!
//! ```text
//! Authenticating -> Sending -> { PaginationCheck, RetryWait, ReauthPending, fatal }
//! RetryWait      -> Sending
//! ReauthPending  -> Authenticating
//! PaginationCheck -> { Authenticating (next page), Done }
//! ```
//!
//! The only suspension points are the transport round trip, the backoff
//! sleep and the credential refresh.

use log::{debug, error, warn};
use reqwest::StatusCode;
use std::time::Duration;

use super::Inner;
use crate::error::{ApiError, TransportError};
use crate::http::{Outcome, RawResponse, RetryDecision, TransportRequest, parse_retry_after};
use crate::request::RequestSpec;
use crate::response::{AccumulatedResult, Accumulator, ResponsePage};

enum CallState {
    /// Credentials are applied to the pending page request.
    Authenticating,
    Sending(TransportRequest),
    RetryWait {
        delay: Duration,
        request: TransportRequest,
    },
    /// A 401 was seen and no refresh has been tried yet.
    ReauthPending,
    PaginationCheck(ResponsePage),
    Done(AccumulatedResult),
}

pub(super) struct LogicalCall<'a> {
    inner: &'a Inner,
    /// The current page request, before authentication.
    request: RequestSpec,
    paginate: bool,
    accumulator: Accumulator,
    /// Attempts made for the current page.
    attempt: u32,
    auth_generation: u64,
    refreshed: bool,
    rebuilt: bool,
}

impl<'a> LogicalCall<'a> {
    pub(super) fn new(inner: &'a Inner, mut request: RequestSpec) -> Self {
        let paginate = request.should_paginate() && inner.pagination.is_enabled();
        if paginate {
            inner.pagination.prepare_first(&mut request);
        }
        let accumulator = Accumulator::new(request.result_limit);

        Self {
            inner,
            request,
            paginate,
            accumulator,
            attempt: 0,
            auth_generation: 0,
            refreshed: false,
            rebuilt: false,
        }
    }

    pub(super) async fn run(mut self) -> Result<AccumulatedResult, ApiError> {
        let mut state = CallState::Authenticating;
        loop {
            state = match state {
                CallState::Authenticating => self.authenticate().await?,
                CallState::Sending(request) => self.send(request).await?,
                CallState::RetryWait { delay, request } => {
                    self.inner.sleeper.sleep(delay).await;
                    CallState::Sending(request)
                }
                CallState::ReauthPending => self.reauthenticate().await?,
                CallState::PaginationCheck(page) => self.check_page(page)?,
                CallState::Done(result) => return Ok(result),
            };
        }
    }

    async fn authenticate(&mut self) -> Result<CallState, ApiError> {
        let mut spec = self.request.clone();
        self.auth_generation = self.inner.auth.apply(&mut spec).await?;

        let url = spec.resolve_url(&self.inner.base_url)?;
        let mut headers = spec.headers;
        for (name, value) in self.inner.default_headers.iter() {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        Ok(CallState::Sending(TransportRequest {
            method: spec.method,
            url,
            headers,
            query: spec.query,
            body: spec.body,
            timeout: self.inner.config.timeout(),
        }))
    }

    async fn send(&mut self, request: TransportRequest) -> Result<CallState, ApiError> {
        let handle = self
            .inner
            .session
            .get_client()
            .map_err(|e| self.session_failure(&request, e))?;

        self.attempt += 1;
        debug!(
            "{} {} (attempt {}, transport generation {})",
            request.method, request.url, self.attempt, handle.generation
        );

        match handle.transport.send(request.clone()).await {
            Ok(raw) => self.on_response(raw, request),
            Err(TransportError::ContextTornDown(message)) if !self.rebuilt => {
                warn!(
                    "{} {}: transport torn down ({}); rebuilding",
                    request.method, request.url, message
                );
                self.rebuilt = true;
                // The request never left; this round does not count.
                self.attempt -= 1;
                self.inner
                    .session
                    .replace(&handle)
                    .map_err(|e| self.session_failure(&request, e))?;
                Ok(CallState::Sending(request))
            }
            Err(e) => self.on_transport_error(e, request),
        }
    }

    fn on_response(
        &mut self,
        raw: RawResponse,
        request: TransportRequest,
    ) -> Result<CallState, ApiError> {
        let status = raw.status;

        if status == StatusCode::UNAUTHORIZED {
            if !self.refreshed {
                // The refresh-retry sits outside the attempt budget.
                self.attempt -= 1;
                return Ok(CallState::ReauthPending);
            }
            error!(
                "{} {}: HTTP 401 again after refreshing credentials (attempt {})",
                request.method, request.url, self.attempt
            );
            return Err(ApiError::Authentication(format!(
                "{} rejected the refreshed credentials",
                request.url
            )));
        }

        if !status.is_client_error() && !status.is_server_error() {
            return Ok(CallState::PaginationCheck(ResponsePage::from_raw(raw)));
        }

        let outcome = Outcome::from_status(status, &raw.headers);
        match self.decide(&outcome) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "{} {}: HTTP {} on attempt {}/{}; retrying in {:?}",
                    request.method,
                    request.url,
                    status,
                    self.attempt,
                    self.inner.retry.max_attempts(),
                    delay
                );
                Ok(CallState::RetryWait { delay, request })
            }
            RetryDecision::Stop => {
                error!(
                    "{} {}: giving up with HTTP {} after {} attempt(s)",
                    request.method, request.url, status, self.attempt
                );
                Err(self.status_failure(raw))
            }
        }
    }

    fn on_transport_error(
        &mut self,
        e: TransportError,
        request: TransportRequest,
    ) -> Result<CallState, ApiError> {
        let decision = match e {
            // A second teardown in one call is not retried.
            TransportError::ContextTornDown(_) => RetryDecision::Stop,
            _ => self.decide(&Outcome::from_transport_error(&e)),
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "{} {}: {} on attempt {}/{}; retrying in {:?}",
                    request.method,
                    request.url,
                    e,
                    self.attempt,
                    self.inner.retry.max_attempts(),
                    delay
                );
                Ok(CallState::RetryWait { delay, request })
            }
            RetryDecision::Stop => {
                error!(
                    "{} {}: giving up after {} attempt(s): {}",
                    request.method, request.url, self.attempt, e
                );
                Err(self.transport_failure(e))
            }
        }
    }

    async fn reauthenticate(&mut self) -> Result<CallState, ApiError> {
        self.refreshed = true;
        warn!(
            "HTTP 401 for {}; refreshing credentials (generation {})",
            self.request.target, self.auth_generation
        );

        if let Err(e) = self.inner.auth.refresh(self.auth_generation).await {
            error!(
                "{}: HTTP 401 on attempt {} and credential refresh failed: {}",
                self.request.target,
                self.attempt + 1,
                e
            );
            return Err(match e {
                ApiError::Authentication(_) => e,
                other => ApiError::Authentication(other.to_string()),
            });
        }
        Ok(CallState::Authenticating)
    }

    fn check_page(&mut self, page: ResponsePage) -> Result<CallState, ApiError> {
        if !self.paginate {
            self.accumulator.push(page, Vec::new());
            return Ok(CallState::Done(self.finish()));
        }

        let inner = self.inner;
        let pagination = &inner.pagination;
        let next = pagination.results(&page).and_then(|items| {
            let next = pagination.next_request(&page, &self.request, &inner.base_url, items.len())?;
            Ok((items, next))
        });
        let (items, next) = match next {
            Ok(found) => found,
            Err(e) => return Err(self.with_partial(e)),
        };

        debug!(
            "Page {} yielded {} result(s)",
            self.accumulator.pages() + 1,
            items.len()
        );
        self.accumulator.push(page, items);

        if self.accumulator.limit_reached() {
            debug!("Result limit reached after {} page(s)", self.accumulator.pages());
            return Ok(CallState::Done(self.finish()));
        }
        if self.accumulator.pages() >= pagination.max_pages {
            warn!(
                "Stopping pagination of {} at the {} page limit",
                self.request.target, pagination.max_pages
            );
            return Ok(CallState::Done(self.finish()));
        }

        match next {
            Some(request) => {
                self.request = request;
                self.attempt = 0;
                Ok(CallState::Authenticating)
            }
            None => Ok(CallState::Done(self.finish())),
        }
    }

    fn finish(&mut self) -> AccumulatedResult {
        std::mem::take(&mut self.accumulator).finish()
    }

    /// Attaches the pages gathered so far; the malformed page is left out.
    fn with_partial(&mut self, e: ApiError) -> ApiError {
        error!(
            "Pagination of {} failed on page {} (attempt {}): {}",
            self.request.target,
            self.accumulator.pages() + 1,
            self.attempt,
            e
        );
        match e {
            ApiError::Pagination { message, .. } => {
                let partial = (self.accumulator.pages() > 0)
                    .then(|| Box::new(std::mem::take(&mut self.accumulator).finish()));
                ApiError::Pagination { message, partial }
            }
            other => other,
        }
    }

    fn decide(&self, outcome: &Outcome) -> RetryDecision {
        let retry_allowed = self.request.retry_unsafe
            || !self.inner.config.retry_idempotent_only
            || self.request.is_idempotent();
        if !retry_allowed {
            debug!("{} is not idempotent; not retrying", self.request.method);
            return RetryDecision::Stop;
        }
        self.inner.retry.should_retry(self.attempt, outcome)
    }

    /// The session could not supply a transport, so nothing was sent.
    fn session_failure(&self, request: &TransportRequest, e: TransportError) -> ApiError {
        error!(
            "{} {}: no transport available after {} attempt(s): {}",
            request.method, request.url, self.attempt, e
        );
        self.transport_failure(e)
    }

    fn transport_failure(&self, source: TransportError) -> ApiError {
        ApiError::Transport {
            source,
            attempts: self.attempt,
        }
    }

    fn status_failure(&self, raw: RawResponse) -> ApiError {
        let status = raw.status;
        if status == StatusCode::TOO_MANY_REQUESTS {
            ApiError::RateLimit {
                attempts: self.attempt,
                retry_after: parse_retry_after(&raw.headers),
            }
        } else if status.is_server_error() {
            ApiError::Server {
                status,
                attempts: self.attempt,
            }
        } else {
            ApiError::Client {
                status,
                body: String::from_utf8_lossy(&raw.body).into_owned(),
            }
        }
    }
}
