//! Standard handler-stack middleware.
//!
//! Each constructor returns a [`Middleware`], a function from the next
//! [`Handler`] to a new one. Middleware keeps the `(request, options) ->
//! future<response>` shape and may rewrite the request on the way in or the
//! outcome on the way out.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use http::Version;
use http::header::{CONTENT_LENGTH, COOKIE, EXPECT, HeaderValue, TRANSFER_ENCODING};
use tracing::{info, warn};

use crate::error::Error;
use crate::formatter::MessageFormatter;
use crate::handler::Handler;
use crate::options::RequestOptions;
use crate::redirect::RedirectMiddleware;
use crate::request::Request;
use crate::response::Response;
use crate::retry::{
    DelayFn, RetryDecider, RetryLimit, RetryMiddleware, RetryPolicy, exponential_delay,
};
use crate::util::{lock_unpoisoned, truncate_body};

/// Wraps the next handler into a new one.
#[derive(Clone)]
pub struct Middleware(Arc<dyn Fn(Handler) -> Handler + Send + Sync>);

impl Middleware {
    pub fn new<F>(middleware: F) -> Self
    where
        F: Fn(Handler) -> Handler + Send + Sync + 'static,
    {
        Self(Arc::new(middleware))
    }

    pub fn wrap(&self, next: Handler) -> Handler {
        (self.0)(next)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Middleware")
    }
}

/// Adds the `Cookie` header from `options.cookies` and stores the response's
/// `Set-Cookie` headers back into it. A no-op without a store.
pub fn cookies() -> Middleware {
    Middleware::new(|next| {
        Handler::new(move |mut request, options| {
            let Some(store) = options.cookies.clone() else {
                return next.call(request, options);
            };
            if let Some(value) = store.cookie_header(&request) {
                request.set_header(COOKIE, value);
            }
            let next = next.clone();
            async move {
                let response = next.call(request.clone(), options).await?;
                store.extract_cookies(&request, &response);
                Ok(response)
            }
            .boxed()
        })
    })
}

/// Turns 4xx responses into [`Error::ClientStatus`] and 5xx responses into
/// [`Error::ServerStatus`] when `options.http_errors` is set.
pub fn http_errors() -> Middleware {
    Middleware::new(|next| {
        Handler::new(move |request, options| {
            if !options.http_errors {
                return next.call(request, options);
            }
            let next = next.clone();
            async move {
                let method = request.method().clone();
                let uri = request.url();
                let response = next.call(request, options).await?;
                let status = response.status_code();
                if status < 400 {
                    return Ok(response);
                }
                let body = truncate_body(response.body());
                let response = Box::new(response);
                Err(if status > 499 {
                    Error::ServerStatus {
                        status,
                        method,
                        uri,
                        body,
                        response,
                    }
                } else {
                    Error::ClientStatus {
                        status,
                        method,
                        uri,
                        body,
                        response,
                    }
                })
            }
            .boxed()
        })
    })
}

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub request: Request,
    pub response: Option<Response>,
    pub error: Option<Error>,
    pub options: RequestOptions,
}

/// Shared container filled by [`history`].
#[derive(Clone, Default)]
pub struct History(Arc<Mutex<Vec<HistoryEntry>>>);

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        lock_unpoisoned(&self.0).clone()
    }

    pub fn last(&self) -> Option<HistoryEntry> {
        lock_unpoisoned(&self.0).last().cloned()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.0).clear();
    }

    fn record(&self, entry: HistoryEntry) {
        lock_unpoisoned(&self.0).push(entry);
    }
}

impl fmt::Debug for History {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("History")
            .field("entries", &self.len())
            .finish()
    }
}

/// Records every transfer passing through, successful or not.
pub fn history(container: &History) -> Middleware {
    let container = container.clone();
    Middleware::new(move |next| {
        let container = container.clone();
        Handler::new(move |request, options| {
            let next = next.clone();
            let container = container.clone();
            async move {
                let outcome = next.call(request.clone(), options.clone()).await;
                let (response, error) = match &outcome {
                    Ok(response) => (Some(response.clone()), None),
                    Err(error) => (None, Some(error.clone())),
                };
                container.record(HistoryEntry {
                    request,
                    response,
                    error,
                    options,
                });
                outcome
            }
            .boxed()
        })
    })
}

/// Observes each call: `before` ahead of forwarding, `after` once the
/// outcome is known. Neither can alter the transfer.
pub fn tap<B, A>(before: B, after: A) -> Middleware
where
    B: Fn(&Request, &RequestOptions) + Send + Sync + 'static,
    A: Fn(&Request, &RequestOptions, &Result<Response, Error>) + Send + Sync + 'static,
{
    let before = Arc::new(before);
    let after = Arc::new(after);
    Middleware::new(move |next| {
        let before = Arc::clone(&before);
        let after = Arc::clone(&after);
        Handler::new(move |request, options| {
            before(&request, &options);
            let next = next.clone();
            let after = Arc::clone(&after);
            async move {
                let outcome = next.call(request.clone(), options.clone()).await;
                after(&request, &options, &outcome);
                outcome
            }
            .boxed()
        })
    })
}

/// Logs each transfer through `tracing`: `info` for responses, `warn` for
/// failures.
pub fn log(formatter: MessageFormatter) -> Middleware {
    let formatter = Arc::new(formatter);
    Middleware::new(move |next| {
        let formatter = Arc::clone(&formatter);
        Handler::new(move |request, options| {
            let next = next.clone();
            let formatter = Arc::clone(&formatter);
            async move {
                let outcome = next.call(request.clone(), options).await;
                match &outcome {
                    Ok(response) => {
                        let line = formatter.format(&request, Some(response), None);
                        info!(status = response.status_code(), "{line}");
                    }
                    Err(error) => {
                        let line = formatter.format(&request, error.response(), Some(error));
                        warn!(code = error.code().as_str(), "{line}");
                    }
                }
                outcome
            }
            .boxed()
        })
    })
}

/// Adds `Content-Length` for non-empty bodies and `Expect: 100-Continue`
/// according to `options.expect` on HTTP/1.1. Headers already present win.
pub fn prepare_body() -> Middleware {
    Middleware::new(|next| {
        Handler::new(move |mut request, options| {
            let len = request.body().len();
            if len > 0
                && !request.has_header(CONTENT_LENGTH.as_str())
                && !request.has_header(TRANSFER_ENCODING.as_str())
            {
                request.set_header(CONTENT_LENGTH, HeaderValue::from(len));
            }
            if request.version() == Version::HTTP_11
                && !request.has_header(EXPECT.as_str())
                && options.expect.applies(len)
            {
                request.set_header(EXPECT, HeaderValue::from_static("100-Continue"));
            }
            next.call(request, options)
        })
    })
}

pub fn map_request<F>(map: F) -> Middleware
where
    F: Fn(Request) -> Request + Send + Sync + 'static,
{
    let map = Arc::new(map);
    Middleware::new(move |next| {
        let map = Arc::clone(&map);
        Handler::new(move |request, options| next.call(map(request), options))
    })
}

pub fn map_response<F>(map: F) -> Middleware
where
    F: Fn(Response) -> Response + Send + Sync + 'static,
{
    let map = Arc::new(map);
    Middleware::new(move |next| {
        let map = Arc::clone(&map);
        Handler::new(move |request, options| {
            let map = Arc::clone(&map);
            next.call(request, options)
                .map(move |outcome| outcome.map(|response| map(response)))
                .boxed()
        })
    })
}

/// Follows redirects as configured by `options.allow_redirects`.
pub fn redirect() -> Middleware {
    Middleware::new(|next| RedirectMiddleware::new(next).into_handler())
}

/// Retries while `decider` agrees, waiting `2^(retries-1)` ms between
/// attempts. The only ceiling is the decider itself.
pub fn retry<F>(decider: F) -> Middleware
where
    F: Fn(usize, &Request, Option<&Response>, Option<&Error>) -> bool + Send + Sync + 'static,
{
    retry_with(decider, exponential_delay, RetryLimit::Unbounded)
}

pub fn retry_with<F, D>(decider: F, delay: D, limit: RetryLimit) -> Middleware
where
    F: Fn(usize, &Request, Option<&Response>, Option<&Error>) -> bool + Send + Sync + 'static,
    D: Fn(usize) -> Duration + Send + Sync + 'static,
{
    retry_decider(Arc::new(decider), Arc::new(delay), limit)
}

pub fn retry_decider(
    decider: Arc<dyn RetryDecider>,
    delay: DelayFn,
    limit: RetryLimit,
) -> Middleware {
    Middleware::new(move |next| {
        RetryMiddleware::new(next, Arc::clone(&decider), Arc::clone(&delay), limit).into_handler()
    })
}

/// Retries with a [`RetryPolicy`]: its attempt budget, retryable statuses
/// and transport failures, and jittered backoff.
pub fn retry_policy(policy: RetryPolicy) -> Middleware {
    let limit = RetryLimit::Max(policy.configured_max_attempts().saturating_sub(1));
    let delay_policy = policy.clone();
    retry_decider(
        Arc::new(policy),
        Arc::new(move |retries| delay_policy.backoff_for_retry(retries)),
        limit,
    )
}
