//! Translation between [`Transaction`]s and the flat wire records a
//! [`crate::handler::Transport`] consumes and produces.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::Error;
use crate::lifecycle::TransferListener;
use crate::options::{Progress, ProgressCallback, RequestOptions};
use crate::request::Request;
use crate::response::Response;
use crate::transaction::{TransferState, Transaction};

/// Request record handed to a transport.
#[derive(Clone)]
pub struct WireRequest {
    pub method: Method,
    pub scheme: String,
    pub url: String,
    /// Path component only.
    pub uri: String,
    pub query_string: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub version: Version,
    pub client: RequestOptions,
    pub future: bool,
    pub progress: Option<ProgressCallback>,
}

impl WireRequest {
    pub fn report_progress(&self, progress: Progress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

impl fmt::Debug for WireRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WireRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("version", &self.version)
            .field("future", &self.future)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Response record produced by a transport.
#[derive(Clone, Debug, Default)]
pub struct WireResponse {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub version: Option<Version>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub effective_url: Option<String>,
    pub error: Option<Error>,
    pub transfer_info: BTreeMap<String, String>,
}

impl WireResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn from_error(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        Self {
            status: Some(response.status_code()),
            reason: Some(response.reason_phrase().to_owned()),
            version: Some(response.version()),
            headers: response.headers().clone(),
            body: response.body().clone(),
            effective_url: response.effective_url().map(ToOwned::to_owned),
            error: None,
            transfer_info: BTreeMap::new(),
        }
    }
}

/// Flattens `request` without attaching any callbacks.
pub fn create_wire_request(request: &Request, options: &RequestOptions) -> WireRequest {
    WireRequest {
        method: request.method().clone(),
        scheme: request.scheme().to_owned(),
        url: request.url(),
        uri: request.path().to_owned(),
        query_string: request.query().map(ToOwned::to_owned),
        headers: request.headers().clone(),
        body: request.body().clone(),
        version: request.version(),
        client: options.clone(),
        future: options.future,
        progress: None,
    }
}

/// Clears any stale exception, flattens the request and wires progress
/// reporting when at least one listener asks for it.
pub fn prepare_wire_request(
    trans: &mut Transaction,
    options: &RequestOptions,
    listeners: &[Arc<dyn TransferListener>],
) -> WireRequest {
    trans.exception = None;
    let mut wire = create_wire_request(&trans.request, options);

    let interested = listeners
        .iter()
        .filter(|listener| listener.wants_progress())
        .cloned()
        .collect::<Vec<_>>();
    if !interested.is_empty() {
        let request = trans.request.clone();
        wire.progress = Some(Arc::new(move |progress| {
            for listener in &interested {
                listener.on_progress(&request, progress);
            }
        }));
    }
    wire
}

/// Folds a transport result into `trans` and returns the state the
/// lifecycle continues with.
pub fn complete_wire_response(trans: &mut Transaction, wire: WireResponse) -> TransferState {
    if let Some(status) = wire.status {
        match response_from_wire(status, &wire) {
            Ok(response) => trans.response = Some(response),
            Err(error) => {
                trans.exception = Some(error);
                return TransferState::Error;
            }
        }
    }

    if let Some(error) = wire.error {
        trans.exception = Some(error.normalize(&trans.request));
        return TransferState::Error;
    }

    if trans.response.is_none() {
        trans.exception = Some(Error::TransportContract {
            method: trans.request.method().clone(),
            uri: trans.request.url(),
        });
        return TransferState::Error;
    }

    TransferState::Complete
}

fn response_from_wire(status: u16, wire: &WireResponse) -> Result<Response, Error> {
    let status = StatusCode::from_u16(status)
        .map_err(|_| Error::other(format!("transport returned invalid status code {status}")))?;
    let mut response = Response::from_parts(status, wire.headers.clone(), wire.body.clone());
    if let Some(version) = wire.version {
        response = response.with_version(version);
    }
    if let Some(reason) = &wire.reason {
        response = response.with_reason(reason.clone());
    }
    if let Some(effective_url) = &wire.effective_url {
        response.set_effective_url(effective_url.clone());
    }
    Ok(response)
}

/// Rebuilds a [`Request`] from a wire record. `url` wins; otherwise the URL
/// is assembled from the scheme, `Host` header, path and query string.
pub fn request_from_wire(wire: &WireRequest) -> Result<Request, Error> {
    let url = if wire.url.is_empty() {
        let host = wire
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::InvalidUri {
                uri: wire.uri.clone(),
            })?;
        let scheme = if wire.scheme.is_empty() {
            "http"
        } else {
            wire.scheme.as_str()
        };
        let mut url = format!("{scheme}://{host}{}", wire.uri);
        if let Some(query) = wire.query_string.as_deref().filter(|query| !query.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    } else {
        wire.url.clone()
    };

    let uri = url
        .parse::<Uri>()
        .map_err(|_| Error::InvalidUri { uri: url.clone() })?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(Error::InvalidUri { uri: url });
    }

    let mut request = Request::new(wire.method.clone(), uri)
        .with_body(wire.body.clone())
        .with_version(wire.version);
    *request.headers_mut() = wire.headers.clone();
    Ok(request)
}
