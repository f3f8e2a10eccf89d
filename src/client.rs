use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tracing::{Instrument, debug, info_span};

use crate::config::{ClientConfig, ClientProfile};
use crate::cookie::{CookieJar, CookieStore};
use crate::error::Error;
use crate::fsm::DEFAULT_MAX_TRANSITIONS;
use crate::handler::{Handler, ResponseFuture, Transport};
use crate::lifecycle::{RequestFsm, TransferListener};
use crate::middleware::{self, Middleware};
use crate::options::{ExpectContinue, RedirectConfig, RequestOptions};
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::stack::HandlerStack;
use crate::util::{
    merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs, resolve_uri,
    validate_base_url,
};

const DEFAULT_CLIENT_NAME: &str = "reqflow";

pub struct ClientBuilder {
    client_name: String,
    base_url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    handler_stack: Option<HandlerStack>,
    default_headers: HeaderMap,
    options: RequestOptions,
    cookies: bool,
    listeners: Vec<Arc<dyn TransferListener>>,
    max_transitions: usize,
    retry_policy: Option<RetryPolicy>,
    middleware: Vec<(Middleware, String)>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            base_url: None,
            transport: None,
            handler_stack: None,
            default_headers: HeaderMap::new(),
            options: RequestOptions::default(),
            cookies: false,
            listeners: Vec::new(),
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            retry_policy: None,
            middleware: Vec::new(),
        }
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Relative request paths are joined onto this URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the default middleware. A stack without a handler gets the
    /// lifecycle machine over the configured transport.
    pub fn handler_stack(mut self, handler_stack: HandlerStack) -> Self {
        self.handler_stack = Some(handler_stack);
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.options.allow_redirects = defaults.redirects;
        self.options.http_errors = defaults.http_errors;
        self.options.expect = defaults.expect;
        self.cookies = defaults.cookies;
        self.max_transitions = defaults.max_transitions;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn allow_redirects(mut self, redirects: impl Into<RedirectConfig>) -> Self {
        self.options.allow_redirects = redirects.into();
        self
    }

    pub fn http_errors(mut self, http_errors: bool) -> Self {
        self.options.http_errors = http_errors;
        self
    }

    pub fn expect(mut self, expect: ExpectContinue) -> Self {
        self.options.expect = expect;
        self
    }

    /// Keeps cookies in a client-wide in-memory jar.
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.cookies = enabled;
        if !enabled {
            self.options.cookies = None;
        }
        self
    }

    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookies = true;
        self.options.cookies = Some(store);
        self
    }

    pub fn listener(self, listener: impl TransferListener + 'static) -> Self {
        self.listener_arc(Arc::new(listener))
    }

    pub fn listener_arc(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions.max(1);
        self
    }

    /// Adds a `retry` layer driven by `policy`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Adds `middleware` as the innermost layer so far.
    pub fn middleware(mut self, middleware: Middleware, name: impl Into<String>) -> Self {
        self.middleware.push((middleware, name.into()));
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        if let Some(base_url) = &self.base_url {
            validate_base_url(base_url)?;
        }

        let mut options = self.options;
        if self.cookies && options.cookies.is_none() {
            options.cookies = Some(Arc::new(CookieJar::new()));
        }

        let needs_terminal = self
            .handler_stack
            .as_ref()
            .is_none_or(|stack| !stack.has_handler());
        let terminal = if needs_terminal {
            let transport = match self.transport {
                Some(transport) => transport,
                None => default_transport()?,
            };
            let machine = self
                .listeners
                .into_iter()
                .fold(RequestFsm::from_arc(transport), RequestFsm::listener_arc)
                .max_transitions(self.max_transitions);
            Some(machine.into_handler())
        } else {
            None
        };

        let mut stack = match (self.handler_stack, terminal) {
            (Some(mut stack), Some(terminal)) => {
                stack.set_handler(terminal);
                stack
            }
            (Some(stack), None) => stack,
            (None, Some(terminal)) => HandlerStack::create(terminal),
            (None, None) => return Err(Error::MissingHandler),
        };
        if let Some(policy) = self.retry_policy {
            stack.push(middleware::retry_policy(policy), "retry");
        }
        for (middleware, name) in self.middleware {
            stack.push(middleware, name);
        }

        let handler = stack.resolve()?;
        debug!(
            client = %self.client_name,
            layers = stack.len(),
            "client built"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                client_name: self.client_name,
                handler,
                config: ClientConfig {
                    base_url: self.base_url,
                    default_headers: self.default_headers,
                    default_options: options,
                    max_transitions: self.max_transitions,
                },
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("client_name", &self.client_name)
            .field("base_url", &self.base_url)
            .field("transport", &self.transport.is_some())
            .field("handler_stack", &self.handler_stack)
            .field("options", &self.options)
            .field("listeners", &self.listeners.len())
            .field("max_transitions", &self.max_transitions)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::handler::hyper::HyperTransport::new()))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Err(Error::MissingHandler)
}

struct ClientInner {
    client_name: String,
    handler: Handler,
    config: ClientConfig,
}

/// Sends requests through a resolved handler stack.
///
/// Cloning is cheap; clones share the stack, default headers, default
/// options and cookie store.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub fn default_options(&self) -> RequestOptions {
        self.inner.config.default_options.clone()
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn head(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    /// Request for `uri`, resolved against the base URL when one is set,
    /// carrying the client's default headers.
    pub fn create_request(&self, method: Method, uri: &str) -> crate::Result<Request> {
        let config = &self.inner.config;
        let mut request = match &config.base_url {
            Some(base_url) => Request::new(method, resolve_uri(base_url, uri)?),
            None => Request::try_new(method, uri)?,
        };
        let headers = merge_headers(&config.default_headers, request.headers());
        *request.headers_mut() = headers;
        Ok(request)
    }

    pub async fn send(&self, request: Request) -> crate::Result<Response> {
        self.send_with(request, self.default_options()).await
    }

    pub async fn send_with(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        self.dispatch(request, options).await
    }

    /// Starts the transfer and returns its future without awaiting it.
    pub fn send_async(&self, request: Request) -> ResponseFuture {
        self.send_async_with(request, self.default_options())
    }

    pub fn send_async_with(&self, request: Request, mut options: RequestOptions) -> ResponseFuture {
        options.future = true;
        self.dispatch(request, options)
    }

    fn dispatch(&self, request: Request, mut options: RequestOptions) -> ResponseFuture {
        options.client = Some(self.clone());
        let span = info_span!(
            "reqflow.send",
            client = %self.inner.client_name,
            method = %request.method(),
            uri = %redact_uri_for_logs(&request.url()),
            future = options.future
        );
        self.inner
            .handler
            .call(request, options)
            .instrument(span)
            .boxed()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
