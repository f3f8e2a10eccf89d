use std::sync::Arc;

use http::Method;
use thiserror::Error;

use crate::request::Request;
use crate::response::Response;

pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Faults of the state machine itself. These are never routed through an
/// `error` state and never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    #[error("invalid state: {state}")]
    InvalidState { state: String },
    #[error(
        "too many state transitions were encountered ({max}); listeners are likely in an infinite loop"
    )]
    TooManyTransitions { max: usize },
    #[error("invalid intercept state transition from {state}")]
    MissingIntercept { state: String },
    #[error("invalid error state: no error is attached to the transaction")]
    MissingError,
    #[error("invalid complete state: no response is attached to the transaction")]
    MissingResponse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    StateMachine,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    Transport,
    Timeout,
    TransportContract,
    Request,
    ClientStatus,
    ServerStatus,
    TooManyRedirects,
    RedirectProtocol,
    InvalidRedirectLocation,
    MissingHandler,
    MiddlewareNotFound,
    MockQueueEmpty,
    ReadBody,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateMachine => "state_machine",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::TransportContract => "transport_contract",
            Self::Request => "request",
            Self::ClientStatus => "client_status",
            Self::ServerStatus => "server_status",
            Self::TooManyRedirects => "too_many_redirects",
            Self::RedirectProtocol => "redirect_protocol",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::MissingHandler => "missing_handler",
            Self::MiddlewareNotFound => "middleware_not_found",
            Self::MockQueueEmpty => "mock_queue_empty",
            Self::ReadBody => "read_body",
            Self::Deserialize => "deserialize",
        }
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("state machine fault: {0}")]
    State(#[from] StateError),
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: Arc<http::Error>,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error(
        "transport returned neither a status nor an error for {method} {uri}; this is a transport bug"
    )]
    TransportContract { method: Method, uri: String },
    #[error("{message} for {method} {uri}")]
    Request {
        message: String,
        method: Method,
        uri: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("{message}")]
    Other { message: String },
    #[error("client error: {status} for {method} {uri}: {body}")]
    ClientStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
        response: Box<Response>,
    },
    #[error("server error: {status} for {method} {uri}: {body}")]
    ServerStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
        response: Box<Response>,
    },
    #[error("will not follow more than {max_redirects} redirects for {method} {uri}")]
    TooManyRedirects {
        max_redirects: usize,
        method: Method,
        uri: String,
        response: Box<Response>,
    },
    #[error(
        "redirect url {location} does not use one of the allowed redirect protocols ({allowed}) for {method} {uri}"
    )]
    RedirectProtocol {
        location: String,
        allowed: String,
        method: Method,
        uri: String,
        response: Box<Response>,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("no handler has been specified")]
    MissingHandler,
    #[error("middleware not found: {name}")]
    MiddlewareNotFound { name: String },
    #[error("mock transport queue is empty")]
    MockQueueEmpty,
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: SharedError,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
}

impl Error {
    /// Free-form failure raised by listeners or callbacks that do not know
    /// which request they belong to yet.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    pub fn request(request: &Request, message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
            method: request.method().clone(),
            uri: request.url(),
            source: None,
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::State(_) => ErrorCode::StateMachine,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::TransportContract { .. } => ErrorCode::TransportContract,
            Self::Request { .. } | Self::Other { .. } => ErrorCode::Request,
            Self::ClientStatus { .. } => ErrorCode::ClientStatus,
            Self::ServerStatus { .. } => ErrorCode::ServerStatus,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::RedirectProtocol { .. } => ErrorCode::RedirectProtocol,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::MissingHandler => ErrorCode::MissingHandler,
            Self::MiddlewareNotFound { .. } => ErrorCode::MiddlewareNotFound,
            Self::MockQueueEmpty => ErrorCode::MockQueueEmpty,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    pub const fn is_machine_fault(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// Response attached to the failure, when the failure was caused by one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::ClientStatus { response, .. }
            | Self::ServerStatus { response, .. }
            | Self::TooManyRedirects { response, .. }
            | Self::RedirectProtocol { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(Response::status_code)
    }

    /// Binds request-less failures to `request` so every failure leaving the
    /// lifecycle names the request it belongs to.
    pub fn normalize(self, request: &Request) -> Self {
        match self {
            Self::Other { message } => Self::Request {
                message,
                method: request.method().clone(),
                uri: request.url(),
                source: None,
            },
            other => other,
        }
    }
}
