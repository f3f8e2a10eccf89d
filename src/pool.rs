//! Bounded concurrent dispatch over a lazy sequence of requests.
//!
//! A [`Pool`] pulls items from its iterator only while fewer than the
//! configured number of transfers are outstanding, so the source can be
//! arbitrarily long. Outcomes are reported together with the index of the
//! item that produced them.

use std::collections::BTreeMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tracing::debug;

use crate::client::Client;
use crate::error::Error;
use crate::handler::ResponseFuture;
use crate::options::RequestOptions;
use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

pub const DEFAULT_CONCURRENCY: usize = 25;

type FulfilledFn = Box<dyn FnMut(Response, usize) + Send>;
type RejectedFn = Box<dyn FnMut(Error, usize) + Send>;
type CallFn = Box<dyn FnOnce(RequestOptions) -> ResponseFuture + Send>;

/// One element of a pool's source.
pub enum PoolItem {
    /// Sent through the pool's client.
    Request(Request),
    /// Invoked with the pool's options; returns its own response future.
    Call(CallFn),
}

impl PoolItem {
    pub fn call<F>(call: F) -> Self
    where
        F: FnOnce(RequestOptions) -> ResponseFuture + Send + 'static,
    {
        Self::Call(Box::new(call))
    }
}

impl From<Request> for PoolItem {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl fmt::Debug for PoolItem {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(request) => formatter.debug_tuple("Request").field(request).finish(),
            Self::Call(_) => formatter.write_str("Call"),
        }
    }
}

/// Maximum number of outstanding transfers.
#[derive(Clone)]
pub enum PoolSize {
    Fixed(usize),
    /// Called once per fill with the pending count; the pool then tops up
    /// to the returned size.
    Dynamic(Arc<dyn Fn(usize) -> usize + Send + Sync>),
}

impl PoolSize {
    pub fn dynamic<F>(size: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(size))
    }

    /// Never below one, so a drained pool always makes progress.
    pub fn capacity(&self, pending: usize) -> usize {
        match self {
            Self::Fixed(size) => *size,
            Self::Dynamic(size) => size(pending),
        }
        .max(1)
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        Self::Fixed(DEFAULT_CONCURRENCY)
    }
}

impl From<usize> for PoolSize {
    fn from(size: usize) -> Self {
        Self::Fixed(size)
    }
}

impl fmt::Debug for PoolSize {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => formatter.debug_tuple("Fixed").field(size).finish(),
            Self::Dynamic(_) => formatter.write_str("Dynamic"),
        }
    }
}

#[derive(Default)]
pub struct PoolConfig {
    size: PoolSize,
    options: Option<RequestOptions>,
    fulfilled: Option<FulfilledFn>,
    rejected: Option<RejectedFn>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(self, concurrency: usize) -> Self {
        self.size(PoolSize::Fixed(concurrency))
    }

    pub fn size(mut self, size: impl Into<PoolSize>) -> Self {
        self.size = size.into();
        self
    }

    /// Options for every transfer; the client's defaults otherwise.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn fulfilled<F>(mut self, fulfilled: F) -> Self
    where
        F: FnMut(Response, usize) + Send + 'static,
    {
        self.fulfilled = Some(Box::new(fulfilled));
        self
    }

    pub fn rejected<F>(mut self, rejected: F) -> Self
    where
        F: FnMut(Error, usize) + Send + 'static,
    {
        self.rejected = Some(Box::new(rejected));
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PoolConfig")
            .field("size", &self.size)
            .field("options", &self.options)
            .field("fulfilled", &self.fulfilled.is_some())
            .field("rejected", &self.rejected.is_some())
            .finish()
    }
}

pub struct Pool {
    client: Client,
    items: Box<dyn Iterator<Item = PoolItem> + Send>,
    config: PoolConfig,
}

impl Pool {
    pub fn new<I>(client: &Client, items: I, config: PoolConfig) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PoolItem> + 'static,
        I::IntoIter: Send + 'static,
    {
        Self {
            client: client.clone(),
            items: Box::new(items.into_iter().map(Into::into)),
            config,
        }
    }

    /// Sends every item and resolves once the source is exhausted and no
    /// transfer is pending. Per-item failures go to the rejected callback.
    pub async fn run(self) {
        let Self {
            client,
            mut items,
            mut config,
        } = self;
        let options = config
            .options
            .take()
            .unwrap_or_else(|| client.default_options());

        let mut pending = FuturesUnordered::new();
        let mut next_index = 0_usize;
        let mut exhausted = false;

        loop {
            let limit = config.size.capacity(pending.len());
            while !exhausted && pending.len() < limit {
                let Some(item) = items.next() else {
                    exhausted = true;
                    break;
                };
                let index = next_index;
                next_index += 1;
                let future = dispatch(&client, item, &options);
                pending.push(future.map(move |outcome| (index, outcome)));
            }
            debug!(pending = pending.len(), sent = next_index, exhausted, "pool filled");

            let Some((index, outcome)) = pending.next().await else {
                break;
            };
            debug!(index, ok = outcome.is_ok(), "pool transfer settled");
            match outcome {
                Ok(response) => {
                    if let Some(fulfilled) = config.fulfilled.as_mut() {
                        fulfilled(response, index);
                    }
                }
                Err(error) => {
                    if let Some(rejected) = config.rejected.as_mut() {
                        rejected(error, index);
                    }
                }
            }
        }
        debug!(sent = next_index, "pool drained");
    }

    /// Runs the pool and returns every outcome in source order.
    pub async fn batch<I>(
        client: &Client,
        items: I,
        mut config: PoolConfig,
    ) -> Vec<Result<Response, Error>>
    where
        I: IntoIterator,
        I::Item: Into<PoolItem> + 'static,
        I::IntoIter: Send + 'static,
    {
        let results: Arc<Mutex<BTreeMap<usize, Result<Response, Error>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        let mut user_fulfilled = config.fulfilled.take();
        let sink = Arc::clone(&results);
        config.fulfilled = Some(Box::new(move |response: Response, index: usize| {
            if let Some(fulfilled) = user_fulfilled.as_mut() {
                fulfilled(response.clone(), index);
            }
            lock_unpoisoned(&sink).insert(index, Ok(response));
        }));

        let mut user_rejected = config.rejected.take();
        let sink = Arc::clone(&results);
        config.rejected = Some(Box::new(move |error: Error, index: usize| {
            if let Some(rejected) = user_rejected.as_mut() {
                rejected(error.clone(), index);
            }
            lock_unpoisoned(&sink).insert(index, Err(error));
        }));

        Self::new(client, items, config).run().await;

        let mut results = lock_unpoisoned(&results);
        std::mem::take(&mut *results).into_values().collect()
    }

    /// Sends every item and waits for all of them, discarding outcomes not
    /// observed by the callbacks.
    pub async fn send<I>(client: &Client, items: I, config: PoolConfig)
    where
        I: IntoIterator,
        I::Item: Into<PoolItem> + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::new(client, items, config).run().await;
    }
}

impl IntoFuture for Pool {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        self.run().boxed()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Pool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn dispatch(client: &Client, item: PoolItem, options: &RequestOptions) -> ResponseFuture {
    match item {
        PoolItem::Request(request) => client.send_async_with(request, options.clone()),
        PoolItem::Call(call) => {
            let mut options = options.clone();
            options.client = Some(client.clone());
            call(options)
        }
    }
}
