use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::debug;

use crate::bridge::{complete_wire_response, prepare_wire_request};
use crate::error::{Error, StateError};
use crate::fsm::DEFAULT_MAX_TRANSITIONS;
use crate::handler::{Handler, Transport};
use crate::options::{Progress, RequestOptions};
use crate::request::Request;
use crate::response::Response;
use crate::transaction::{TransferState, Transaction};
use crate::util::redact_uri_for_logs;

/// Observer of the request lifecycle.
///
/// Returning an error from `on_before` or `on_complete` routes the transfer
/// to the error state. An error from `on_error` replaces the current
/// exception and ends the transfer. `on_error` recovers a transfer by
/// calling [`Transaction::intercept`] and asks for another attempt with
/// [`Transaction::retry`].
pub trait TransferListener: Send + Sync {
    fn on_before(&self, _trans: &mut Transaction) -> Result<(), Error> {
        Ok(())
    }

    fn on_complete(&self, _trans: &mut Transaction) -> Result<(), Error> {
        Ok(())
    }

    fn on_error(&self, _trans: &mut Transaction) -> Result<(), Error> {
        Ok(())
    }

    fn on_end(&self, _trans: &mut Transaction) -> Result<(), Error> {
        Ok(())
    }

    /// Progress callbacks are only wired into the transport when some
    /// listener returns true here.
    fn wants_progress(&self) -> bool {
        false
    }

    fn on_progress(&self, _request: &Request, _progress: Progress) {}
}

/// The six-state request lifecycle: `before → send → complete → end`, with
/// `error` and `retry` as the alternate branches. Every path leaves through
/// `end`, which is the only place a failure is returned.
#[derive(Clone)]
pub struct RequestFsm {
    transport: Arc<dyn Transport>,
    listeners: Vec<Arc<dyn TransferListener>>,
    max_transitions: usize,
}

impl RequestFsm {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listeners: Vec::new(),
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    pub fn listener(self, listener: impl TransferListener + 'static) -> Self {
        self.listener_arc(Arc::new(listener))
    }

    pub fn listener_arc(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    /// Drives `trans` to `end` and hands back its response.
    pub async fn run(
        &self,
        trans: &mut Transaction,
        options: &RequestOptions,
    ) -> Result<Response, Error> {
        self.run_until(trans, options, None).await?;
        trans
            .response
            .clone()
            .ok_or_else(|| StateError::MissingResponse.into())
    }

    /// Drives `trans` until `stop` is reached (exclusive) or the transfer
    /// finishes at `end`.
    pub async fn run_until(
        &self,
        trans: &mut Transaction,
        options: &RequestOptions,
        stop: Option<&TransferState>,
    ) -> Result<(), Error> {
        trans.reset_transitions();
        let mut state = trans
            .state
            .get_or_insert(TransferState::Before)
            .clone();
        // A retry delay covers the first send of this run only.
        let mut pending_delay = options.delay;

        loop {
            if stop == Some(&state) {
                return Ok(());
            }
            trans.count_transition(self.max_transitions)?;
            debug!(
                state = %state,
                method = %trans.request.method(),
                uri = %redact_uri_for_logs(&trans.request.url()),
                transitions = trans.transition_count(),
                "request transition"
            );

            let next = match state {
                TransferState::Before => match self.emit(&TransferState::Before, trans) {
                    Err(fault) if fault.is_machine_fault() => return Err(fault),
                    Err(error) => {
                        trans.exception = Some(error);
                        TransferState::Error
                    }
                    Ok(()) if trans.response.is_some() => TransferState::Complete,
                    Ok(()) => TransferState::Send,
                },
                TransferState::Send => {
                    let wire = prepare_wire_request(trans, options, &self.listeners);
                    if let Some(delay) = pending_delay.take().filter(|delay| !delay.is_zero()) {
                        tokio::time::sleep(delay).await;
                    }
                    let wire_response = self.transport.send(wire).await;
                    complete_wire_response(trans, wire_response)
                }
                TransferState::Complete => {
                    let url = trans.request.url();
                    let Some(response) = trans.response.as_mut() else {
                        return Err(StateError::MissingResponse.into());
                    };
                    response.set_effective_url(url);
                    match self.emit(&TransferState::Complete, trans) {
                        Err(fault) if fault.is_machine_fault() => return Err(fault),
                        Err(error) => {
                            trans.exception = Some(error);
                            TransferState::Error
                        }
                        Ok(()) if trans.state == Some(TransferState::Retry) => {
                            TransferState::Retry
                        }
                        Ok(()) => TransferState::End,
                    }
                }
                TransferState::Error => {
                    let Some(exception) = trans.exception.take() else {
                        return Err(StateError::MissingError.into());
                    };
                    trans.exception = Some(exception.normalize(&trans.request));
                    match self.emit(&TransferState::Error, trans) {
                        Err(fault) if fault.is_machine_fault() => return Err(fault),
                        Err(error) => {
                            trans.exception = Some(error.normalize(&trans.request));
                            TransferState::End
                        }
                        Ok(()) if trans.state == Some(TransferState::Retry) => {
                            TransferState::Retry
                        }
                        Ok(()) if trans.exception.is_some() => TransferState::End,
                        Ok(()) => TransferState::Complete,
                    }
                }
                TransferState::Retry => {
                    trans.response = None;
                    trans.exception = None;
                    TransferState::Before
                }
                TransferState::End => {
                    match self.emit(&TransferState::End, trans) {
                        Err(fault) if fault.is_machine_fault() => return Err(fault),
                        Err(error) => trans.exception = Some(error.normalize(&trans.request)),
                        Ok(()) => {}
                    }
                    return match &trans.exception {
                        Some(error) => Err(error.clone()),
                        None => Ok(()),
                    };
                }
                TransferState::Named(name) => {
                    return Err(StateError::InvalidState {
                        state: name.into_owned(),
                    }
                    .into());
                }
            };

            trans.state = Some(next.clone());
            state = next;
        }
    }

    /// Calls each listener for `state` until one of them settles the event:
    /// a response in `before`, a retry in `complete`, a recovery or retry in
    /// `error`.
    fn emit(&self, state: &TransferState, trans: &mut Transaction) -> Result<(), Error> {
        for listener in &self.listeners {
            match state {
                TransferState::Before => {
                    listener.on_before(trans)?;
                    if trans.response.is_some() {
                        break;
                    }
                }
                TransferState::Complete => {
                    listener.on_complete(trans)?;
                    if trans.state == Some(TransferState::Retry) {
                        break;
                    }
                }
                TransferState::Error => {
                    listener.on_error(trans)?;
                    if trans.exception.is_none() || trans.state == Some(TransferState::Retry) {
                        break;
                    }
                }
                TransferState::End => listener.on_end(trans)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Terminal [`Handler`] running one fresh transaction per call.
    pub fn into_handler(self) -> Handler {
        let machine = Arc::new(self);
        Handler::new(move |request, options| {
            let machine = Arc::clone(&machine);
            async move {
                let mut trans = Transaction::new(request);
                if let Some(client) = options.client.clone() {
                    trans = trans.with_client(client);
                }
                machine.run(&mut trans, &options).await
            }
            .boxed()
        })
    }
}

impl fmt::Debug for RequestFsm {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestFsm")
            .field("listeners", &self.listeners.len())
            .field("max_transitions", &self.max_transitions)
            .finish()
    }
}
