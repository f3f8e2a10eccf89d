use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::Uri;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::bridge::{WireRequest, WireResponse};
use crate::error::Error;
use crate::handler::Transport;
use crate::options::Progress;
use crate::util::{classify_transport_error, redact_uri_for_logs};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Plain-HTTP transport over the hyper-util pooled client.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Option<Duration>,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    connect_timeout: Duration,
    timeout: Option<Duration>,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: None,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

impl HyperTransportBuilder {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Bound on one exchange, body included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn build(self) -> HyperTransport {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build(connector);
        HyperTransport {
            client,
            timeout: self.timeout,
        }
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: WireRequest) -> BoxFuture<'static, WireResponse> {
        let client = self.client.clone();
        let timeout = self.timeout;
        async move {
            let exchange = exchange(client, &request);
            let outcome = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout {
                        timeout_ms: timeout.as_millis(),
                        method: request.method.clone(),
                        uri: request.url.clone(),
                    }),
                },
                None => exchange.await,
            };
            match outcome {
                Ok(wire) => {
                    let downloaded = wire.body.len() as u64;
                    let uploaded = request.body.len() as u64;
                    request.report_progress(Progress {
                        download_total: downloaded,
                        downloaded,
                        upload_total: uploaded,
                        uploaded,
                    });
                    wire
                }
                Err(error) => WireResponse::from_error(error),
            }
        }
        .boxed()
    }
}

async fn exchange(
    client: Client<HttpConnector, Full<Bytes>>,
    request: &WireRequest,
) -> Result<WireResponse, Error> {
    let uri = request
        .url
        .parse::<Uri>()
        .map_err(|_| Error::InvalidUri {
            uri: request.url.clone(),
        })?;
    let mut builder = http::Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .version(request.version);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    let http_request = builder
        .body(Full::new(request.body.clone()))
        .map_err(|source| Error::RequestBuild {
            source: Arc::new(source),
        })?;

    debug!(
        method = %request.method,
        uri = %redact_uri_for_logs(&request.url),
        "sending request"
    );
    let response = client
        .request(http_request)
        .await
        .map_err(|source| Error::Transport {
            kind: classify_transport_error(&source),
            method: request.method.clone(),
            uri: request.url.clone(),
            source: Arc::new(source),
        })?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|source| Error::ReadBody {
            source: Arc::new(source),
        })?
        .to_bytes();

    Ok(WireResponse {
        status: Some(parts.status.as_u16()),
        reason: parts.status.canonical_reason().map(ToOwned::to_owned),
        version: Some(parts.version),
        headers: parts.headers,
        body,
        effective_url: Some(request.url.clone()),
        error: None,
        transfer_info: Default::default(),
    })
}
