//! Handler plumbing: the `(request, options) -> future<response>` shape every
//! middleware layer shares, and the [`Transport`] seam below it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::bridge::{WireRequest, WireResponse};
use crate::error::Error;
use crate::lifecycle::RequestFsm;
use crate::options::RequestOptions;
use crate::request::Request;
use crate::response::Response;

#[cfg(feature = "hyper-transport")]
pub mod hyper;
pub mod mock;

pub type ResponseFuture = BoxFuture<'static, Result<Response, Error>>;

/// Lowest layer: performs the exchange described by a wire request.
///
/// A transport must resolve to a [`WireResponse`] carrying a status, an
/// error, or both. Anything else is reported as a transport contract fault.
pub trait Transport: Send + Sync {
    fn send(&self, request: WireRequest) -> BoxFuture<'static, WireResponse>;
}

impl<F, Fut> Transport for F
where
    F: Fn(WireRequest) -> Fut + Send + Sync,
    Fut: Future<Output = WireResponse> + Send + 'static,
{
    fn send(&self, request: WireRequest) -> BoxFuture<'static, WireResponse> {
        self(request).boxed()
    }
}

/// A composed send function.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Request, RequestOptions) -> ResponseFuture + Send + Sync>);

impl Handler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Request, RequestOptions) -> ResponseFuture + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    /// Terminal handler that drives each request through the lifecycle
    /// machine over `transport`.
    pub fn from_transport(transport: impl Transport + 'static) -> Self {
        RequestFsm::new(transport).into_handler()
    }

    pub fn call(&self, request: Request, options: RequestOptions) -> ResponseFuture {
        (self.0)(request, options)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Handler")
    }
}
