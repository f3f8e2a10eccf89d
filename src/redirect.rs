use std::sync::Arc;

use futures_util::FutureExt;
use http::header::{HOST, HeaderValue, REFERER};
use http::{HeaderName, Method};
use tracing::debug;

use crate::error::Error;
use crate::handler::{Handler, ResponseFuture};
use crate::options::RequestOptions;
use crate::request::Request;
use crate::response::Response;
use crate::util::{
    parse_header_value, redact_uri_for_logs, redirect_location, resolve_redirect_uri,
    same_origin, sanitize_headers_for_redirect, strip_user_info,
};

pub const REDIRECT_HISTORY_HEADER: &str = "x-redirect-history";
pub const REDIRECT_STATUS_HISTORY_HEADER: &str = "x-redirect-status-history";

/// Re-issues requests answered with a 3xx and a `Location` header.
///
/// Hop count, original scheme and original request live in the per-call
/// options, so each hop re-enters the same middleware with its own state.
pub struct RedirectMiddleware {
    next: Handler,
}

impl RedirectMiddleware {
    pub fn new(next: Handler) -> Self {
        Self { next }
    }

    pub fn into_handler(self) -> Handler {
        let middleware = Arc::new(self);
        Handler::new(move |request, options| Arc::clone(&middleware).call(request, options))
    }

    pub fn call(self: Arc<Self>, request: Request, options: RequestOptions) -> ResponseFuture {
        if !options.allow_redirects.is_enabled() {
            return self.next.call(request, options);
        }
        async move {
            let response = self.next.call(request.clone(), options.clone()).await?;
            self.check_redirect(request, options, response).await
        }
        .boxed()
    }

    async fn check_redirect(
        self: Arc<Self>,
        request: Request,
        mut options: RequestOptions,
        response: Response,
    ) -> Result<Response, Error> {
        let status = response.status_code();
        if !(300..400).contains(&status) || redirect_location(response.headers()).is_none() {
            return Ok(with_tracking_headers(response, &options));
        }

        guard_max(&request, &mut options, &response)?;
        let next_request = modify_request(&request, &options, &response)?;

        if let Some(callback) = options.allow_redirects.redirect_callback() {
            callback(&request, &response, next_request.uri());
        }
        if options.allow_redirects.tracks_redirects() {
            options.redirect.history.push(next_request.url());
            options.redirect.status_history.push(status);
        }
        debug!(
            status,
            hop = options.redirect.count,
            method = %next_request.method(),
            from = %redact_uri_for_logs(&request.url()),
            to = %redact_uri_for_logs(&next_request.url()),
            "following redirect"
        );

        // The hop is a new send, not a retry of the original one.
        options.delay = None;
        self.call(next_request, options).await
    }
}

fn guard_max(
    request: &Request,
    options: &mut RequestOptions,
    response: &Response,
) -> Result<(), Error> {
    let max_redirects = options.allow_redirects.max_redirects();
    let state = &mut options.redirect;
    state.count += 1;
    if state.origin.is_none() {
        state.scheme = Some(request.scheme().to_owned());
        state.origin = Some(request.clone());
    }
    if state.count <= max_redirects {
        return Ok(());
    }

    let origin = state.origin.as_ref().unwrap_or(request);
    Err(Error::TooManyRedirects {
        max_redirects,
        method: origin.method().clone(),
        uri: origin.url(),
        response: Box::new(response.clone()),
    })
}

/// Builds the request for the next hop of `request` answered by `response`.
///
/// 303, and 301/302 on a request with a body outside strict mode, turn the
/// request into a bodiless GET. The Location is resolved against the current
/// URI, and its scheme must be one of the allowed protocols.
pub fn modify_request(
    request: &Request,
    options: &RequestOptions,
    response: &Response,
) -> Result<Request, Error> {
    let config = &options.allow_redirects;
    let status = response.status_code();
    let location = redirect_location(response.headers()).unwrap_or_default();

    let next_uri = resolve_redirect_uri(request.uri(), &location).ok_or_else(|| {
        Error::InvalidRedirectLocation {
            location: location.clone(),
            method: request.method().clone(),
            uri: request.url(),
        }
    })?;
    let next_scheme = next_uri.scheme_str().unwrap_or_default();
    if !config.allows_protocol(next_scheme) {
        return Err(Error::RedirectProtocol {
            location: next_uri.to_string(),
            allowed: config.allowed_protocols().join(", "),
            method: request.method().clone(),
            uri: request.url(),
            response: Box::new(response.clone()),
        });
    }

    let mut next = request.clone();
    let downgrade = status == 303 || (status <= 302 && request.has_body() && !config.is_strict());
    let method_changed_to_get = downgrade && request.method() != Method::GET;
    if downgrade {
        next.set_method(Method::GET);
        next.set_body(bytes::Bytes::new());
    }

    let leaves_https = request.scheme().eq_ignore_ascii_case("https")
        && !next_scheme.eq_ignore_ascii_case("https");
    if config.adds_referer() && !leaves_https {
        let referer = strip_user_info(request.uri());
        next.set_header(REFERER, parse_header_value(REFERER.as_str(), &referer)?);
    } else {
        next.remove_header(REFERER.as_str());
    }

    let same_origin_redirect = same_origin(request.uri(), &next_uri);
    sanitize_headers_for_redirect(
        next.headers_mut(),
        method_changed_to_get,
        same_origin_redirect,
    );
    if !same_origin_redirect {
        next.remove_header(HOST.as_str());
    }
    next.set_uri(next_uri);
    Ok(next)
}

fn with_tracking_headers(mut response: Response, options: &RequestOptions) -> Response {
    let state = &options.redirect;
    if !options.allow_redirects.tracks_redirects() || state.history.is_empty() {
        return response;
    }
    let headers = response.headers_mut();
    for uri in &state.history {
        if let Ok(value) = HeaderValue::from_str(uri) {
            headers.append(HeaderName::from_static(REDIRECT_HISTORY_HEADER), value);
        }
    }
    for status in &state.status_history {
        headers.append(
            HeaderName::from_static(REDIRECT_STATUS_HISTORY_HEADER),
            HeaderValue::from(*status),
        );
    }
    response
}
