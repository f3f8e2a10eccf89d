use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use http::{HeaderMap, Method};
use rand::RngExt;
use tracing::warn;

use crate::error::{Error, TransportErrorKind};
use crate::handler::Handler;
use crate::options::RequestOptions;
use crate::request::Request;
use crate::response::Response;
use crate::util::redact_uri_for_logs;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub type DelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// Decides whether a finished attempt is tried again.
///
/// `retries` counts the retries already made, so it is 0 after the first
/// attempt. Exactly one of `response` and `error` is set.
pub trait RetryDecider: Send + Sync {
    fn should_retry(
        &self,
        retries: usize,
        request: &Request,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool;
}

impl<F> RetryDecider for F
where
    F: Fn(usize, &Request, Option<&Response>, Option<&Error>) -> bool + Send + Sync,
{
    fn should_retry(
        &self,
        retries: usize,
        request: &Request,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        self(retries, request, response, error)
    }
}

/// Hard cap on retries, applied before the decider is asked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryLimit {
    /// The decider alone decides.
    #[default]
    Unbounded,
    /// At most this many retries.
    Max(usize),
}

impl RetryLimit {
    fn allows(self, retries: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Max(max) => retries < max,
        }
    }
}

/// `2^(retries-1)` milliseconds; no wait before the first attempt.
pub fn exponential_delay(retries: usize) -> Duration {
    if retries == 0 {
        return Duration::ZERO;
    }
    let exponent = (retries - 1).min(63) as u32;
    Duration::from_millis(1_u64 << exponent)
}

pub struct RetryMiddleware {
    next: Handler,
    decider: Arc<dyn RetryDecider>,
    delay: DelayFn,
    limit: RetryLimit,
}

impl RetryMiddleware {
    pub fn new(
        next: Handler,
        decider: Arc<dyn RetryDecider>,
        delay: DelayFn,
        limit: RetryLimit,
    ) -> Self {
        Self {
            next,
            decider,
            delay,
            limit,
        }
    }

    pub fn into_handler(self) -> Handler {
        let middleware = Arc::new(self);
        Handler::new(move |request, options| {
            let middleware = Arc::clone(&middleware);
            async move { middleware.call(request, options).await }.boxed()
        })
    }

    /// Sends until the outcome is accepted. Each retry bumps
    /// `options.retries` and sets `options.delay` for the transport bridge.
    pub async fn call(
        &self,
        request: Request,
        mut options: RequestOptions,
    ) -> Result<Response, Error> {
        loop {
            let outcome = self.next.call(request.clone(), options.clone()).await;
            if let Err(error) = &outcome
                && error.is_machine_fault()
            {
                return outcome;
            }
            if !self.limit.allows(options.retries) {
                return outcome;
            }
            let (response, error) = match &outcome {
                Ok(response) => (Some(response), None),
                Err(error) => (None, Some(error)),
            };
            if !self
                .decider
                .should_retry(options.retries, &request, response, error)
            {
                return outcome;
            }

            options.retries += 1;
            let delay = (self.delay)(options.retries);
            options.delay = Some(delay);
            warn!(
                method = %request.method(),
                uri = %redact_uri_for_logs(&request.url()),
                retries = options.retries,
                delay_ms = delay.as_millis() as u64,
                status = response.map(Response::status_code),
                error = error.map(tracing::field::display),
                "retrying request"
            );
        }
    }
}

/// Status/transport-based retry rules with capped, jittered exponential
/// backoff. Only idempotent requests (or ones carrying an
/// `idempotency-key` header) are retried.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_on_timeout: bool,
    retry_on_response_body_read_error: bool,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            jitter_ratio: 0.0,
            ..Self::standard()
        }
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retry_on_timeout: true,
            retry_on_response_body_read_error: true,
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn retry_on_response_body_read_error(mut self, retry: bool) -> Self {
        self.retry_on_response_body_read_error = retry;
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    fn is_retryable_error(&self, error: &Error) -> bool {
        match error {
            Error::Transport { kind, .. } => self.retryable_transport_error_kinds.contains(kind),
            Error::Timeout { .. } => self.retry_on_timeout,
            Error::ReadBody { .. } => self.retry_on_response_body_read_error,
            other => other
                .status()
                .is_some_and(|status| self.is_retryable_status(status)),
        }
    }

    pub fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryDecider for RetryPolicy {
    fn should_retry(
        &self,
        retries: usize,
        request: &Request,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        if retries + 1 >= self.max_attempts {
            return false;
        }
        if !request_supports_retry(request.method(), request.headers()) {
            return false;
        }
        match (response, error) {
            (Some(response), _) => self.is_retryable_status(response.status_code()),
            (None, Some(error)) => self.is_retryable_error(error),
            (None, None) => false,
        }
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
    ]
    .into_iter()
    .collect()
}

pub(crate) fn request_supports_retry(method: &Method, headers: &HeaderMap) -> bool {
    is_method_idempotent(method) || headers.get(IDEMPOTENCY_KEY_HEADER).is_some()
}

fn is_method_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}
