use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::bridge::{WireRequest, WireResponse};
use crate::error::Error;
use crate::handler::Transport;
use crate::options::{Progress, RequestOptions};
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// One queued answer of a [`MockTransport`].
pub enum MockReply {
    Response(Response),
    Wire(WireResponse),
    Error(Error),
    Fn(Box<dyn FnOnce(&WireRequest) -> MockReply + Send>),
}

impl MockReply {
    pub fn from_fn<F>(reply: F) -> Self
    where
        F: FnOnce(&WireRequest) -> MockReply + Send + 'static,
    {
        Self::Fn(Box::new(reply))
    }

    fn resolve(self, request: &WireRequest) -> WireResponse {
        match self {
            Self::Response(response) => response.into(),
            Self::Wire(wire) => wire,
            Self::Error(error) => WireResponse::from_error(error),
            Self::Fn(reply) => reply(request).resolve(request),
        }
    }
}

impl From<Response> for MockReply {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<WireResponse> for MockReply {
    fn from(wire: WireResponse) -> Self {
        Self::Wire(wire)
    }
}

impl From<Error> for MockReply {
    fn from(error: Error) -> Self {
        Self::Error(error)
    }
}

impl fmt::Debug for MockReply {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => formatter.debug_tuple("Response").field(response).finish(),
            Self::Wire(wire) => formatter.debug_tuple("Wire").field(wire).finish(),
            Self::Error(error) => formatter.debug_tuple("Error").field(error).finish(),
            Self::Fn(_) => formatter.write_str("Fn"),
        }
    }
}

#[derive(Default)]
struct MockState {
    queue: Mutex<VecDeque<MockReply>>,
    last_request: Mutex<Option<WireRequest>>,
    calls: AtomicUsize,
}

/// Transport answering from a FIFO queue. Clones share the queue, so a test
/// keeps one handle for inspection while the client owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        let mock = Self::default();
        mock.append(replies);
        mock
    }

    pub fn append<I, R>(&self, replies: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        lock_unpoisoned(&self.state.queue).extend(replies.into_iter().map(Into::into));
    }

    pub fn push(&self, reply: impl Into<MockReply>) {
        lock_unpoisoned(&self.state.queue).push_back(reply.into());
    }

    /// Replies still queued.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<WireRequest> {
        lock_unpoisoned(&self.state.last_request).clone()
    }

    pub fn last_options(&self) -> Option<RequestOptions> {
        self.last_request().map(|request| request.client)
    }
}

impl Transport for MockTransport {
    fn send(&self, request: WireRequest) -> BoxFuture<'static, WireResponse> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let reply = lock_unpoisoned(&self.state.queue).pop_front();
        let wire = match reply {
            Some(reply) => reply.resolve(&request),
            None => WireResponse::from_error(Error::MockQueueEmpty),
        };
        if wire.status.is_some() {
            let downloaded = wire.body.len() as u64;
            let uploaded = request.body.len() as u64;
            request.report_progress(Progress {
                download_total: downloaded,
                downloaded,
                upload_total: uploaded,
                uploaded,
            });
        }
        *lock_unpoisoned(&self.state.last_request) = Some(request);
        async move { wire }.boxed()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MockTransport")
            .field("queued", &self.len())
            .field("calls", &self.calls())
            .finish()
    }
}
