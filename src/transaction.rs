use std::borrow::Cow;
use std::fmt;

use crate::client::Client;
use crate::error::{Error, StateError};
use crate::request::Request;
use crate::response::Response;

/// Lifecycle state label. The six request states are fixed; `Named` covers
/// user-declared states of a generic [`crate::fsm::Fsm`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    Before,
    Send,
    Complete,
    Error,
    Retry,
    End,
    Named(Cow<'static, str>),
}

impl TransferState {
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        match name.as_ref() {
            "before" => Self::Before,
            "send" => Self::Send,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "retry" => Self::Retry,
            "end" => Self::End,
            _ => Self::Named(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Before => "before",
            Self::Send => "send",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::End => "end",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl From<&'static str> for TransferState {
    fn from(name: &'static str) -> Self {
        Self::named(name)
    }
}

impl From<String> for TransferState {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// One logical send: the request, its outcome so far and where the
/// lifecycle currently stands.
pub struct Transaction {
    pub request: Request,
    pub response: Option<Response>,
    pub exception: Option<Error>,
    pub state: Option<TransferState>,
    client: Option<Client>,
    transition_count: usize,
}

impl Transaction {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: None,
            exception: None,
            state: None,
            client: None,
            transition_count: 0,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    pub fn state(&self) -> Option<&TransferState> {
        self.state.as_ref()
    }

    /// Completes the transaction out of band. From an error listener this
    /// recovers the send with `response`.
    pub fn intercept(&mut self, response: Response) {
        self.response = Some(response);
        self.exception = None;
    }

    /// Asks the lifecycle to re-enter `before` once the current listener
    /// returns.
    pub fn retry(&mut self) {
        self.state = Some(TransferState::Retry);
        self.exception = None;
    }

    pub fn transition_count(&self) -> usize {
        self.transition_count
    }

    pub(crate) fn reset_transitions(&mut self) {
        self.transition_count = 0;
    }

    pub(crate) fn count_transition(&mut self, max: usize) -> Result<(), StateError> {
        self.transition_count += 1;
        if self.transition_count > max {
            return Err(StateError::TooManyTransitions { max });
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Transaction")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("exception", &self.exception)
            .field("state", &self.state)
            .field("transition_count", &self.transition_count)
            .finish()
    }
}
