//! `reqflow` is an HTTP client built around an explicit request lifecycle and a
//! composable handler stack.
//!
//! A request travels outermost-first through the [`HandlerStack`]
//! middleware (status errors, redirects, cookies, body preparation, retries)
//! down to a terminal handler that drives a [`Transaction`] through the
//! `before → send → complete → end` lifecycle over a [`Transport`].
//! [`Pool`] sends many requests with bounded concurrency.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Client, RedirectConfig, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .allow_redirects(RedirectConfig::limited(3))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_attempts(3)
//!                 .base_backoff(Duration::from_millis(100)),
//!         )
//!         .try_build()?;
//!
//!     let item: Item = client.get("/v1/items/42").send_json().await?;
//!     println!("item id={}", item.id);
//!     Ok(())
//! }
//! ```

pub mod bridge;
mod client;
mod config;
mod cookie;
mod error;
mod formatter;
mod fsm;
pub mod handler;
mod lifecycle;
pub mod middleware;
mod options;
mod pool;
mod redirect;
mod request;
mod response;
mod retry;
mod stack;
mod transaction;
mod util;

pub use crate::bridge::{WireRequest, WireResponse};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{ClientConfig, ClientProfile, ProfileDefaults};
pub use crate::cookie::{CookieJar, CookieStore};
pub use crate::error::{Error, ErrorCode, StateError, TransportErrorKind};
pub use crate::formatter::MessageFormatter;
pub use crate::fsm::{DEFAULT_MAX_TRANSITIONS, Fsm, StateSpec, Transition};
#[cfg(feature = "hyper-transport")]
pub use crate::handler::hyper::{HyperTransport, HyperTransportBuilder};
pub use crate::handler::mock::{MockReply, MockTransport};
pub use crate::handler::{Handler, ResponseFuture, Transport};
pub use crate::lifecycle::{RequestFsm, TransferListener};
pub use crate::middleware::{History, HistoryEntry, Middleware};
pub use crate::options::{ExpectContinue, Progress, RedirectConfig, RequestOptions};
pub use crate::pool::{DEFAULT_CONCURRENCY, Pool, PoolConfig, PoolItem, PoolSize};
pub use crate::redirect::{
    REDIRECT_HISTORY_HEADER, REDIRECT_STATUS_HISTORY_HEADER, RedirectMiddleware, modify_request,
};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::Response;
pub use crate::retry::{
    IDEMPOTENCY_KEY_HEADER, RetryDecider, RetryLimit, RetryMiddleware, RetryPolicy,
    exponential_delay,
};
pub use crate::stack::HandlerStack;
pub use crate::transaction::{Transaction, TransferState};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientBuilder, ClientProfile, CookieJar, Error, ErrorCode, ExpectContinue,
        HandlerStack, Middleware, MockReply, MockTransport, Pool, PoolConfig, PoolItem, PoolSize,
        RedirectConfig, Request, RequestOptions, Response, Result, RetryLimit, RetryPolicy,
        TransferListener, Transaction, TransferState,
    };
}

#[cfg(test)]
mod tests;
