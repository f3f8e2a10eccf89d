use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, StateError};
use crate::transaction::{TransferState, Transaction};

pub const DEFAULT_MAX_TRANSITIONS: usize = 200;

/// Callable run on entering a state. `Ok(true)` signals interception.
pub type Transition = Arc<dyn Fn(&mut Transaction) -> Result<bool, Error> + Send + Sync>;

/// One row of the state table.
#[derive(Clone, Default)]
pub struct StateSpec {
    transition: Option<Transition>,
    success: Option<TransferState>,
    intercept: Option<TransferState>,
    error: Option<TransferState>,
}

impl StateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition<F>(mut self, transition: F) -> Self
    where
        F: Fn(&mut Transaction) -> Result<bool, Error> + Send + Sync + 'static,
    {
        self.transition = Some(Arc::new(transition));
        self
    }

    pub fn success(mut self, state: impl Into<TransferState>) -> Self {
        self.success = Some(state.into());
        self
    }

    pub fn intercept(mut self, state: impl Into<TransferState>) -> Self {
        self.intercept = Some(state.into());
        self
    }

    pub fn error(mut self, state: impl Into<TransferState>) -> Self {
        self.error = Some(state.into());
        self
    }
}

impl fmt::Debug for StateSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StateSpec")
            .field("transition", &self.transition.is_some())
            .field("success", &self.success)
            .field("intercept", &self.intercept)
            .field("error", &self.error)
            .finish()
    }
}

/// Table-driven state machine over a [`Transaction`].
///
/// States are data: each declares what runs on entry and where to go on
/// success, interception or failure. Failures of a transition are stored on
/// the transaction and routed to the state's `error` target; machine faults
/// ([`StateError`]) always escape `run` untouched.
#[derive(Clone, Debug)]
pub struct Fsm {
    initial: TransferState,
    states: HashMap<TransferState, StateSpec>,
    max_transitions: usize,
}

impl Fsm {
    pub fn new<I, S>(initial: impl Into<TransferState>, states: I) -> Self
    where
        I: IntoIterator<Item = (S, StateSpec)>,
        S: Into<TransferState>,
    {
        Self {
            initial: initial.into(),
            states: states
                .into_iter()
                .map(|(name, spec)| (name.into(), spec))
                .collect(),
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    pub fn max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    /// Drives `trans` until `stop` is reached or a state without a `success`
    /// target finishes. An exception still attached at that point is
    /// returned as the error.
    pub fn run(&self, trans: &mut Transaction, stop: Option<&TransferState>) -> Result<(), Error> {
        trans.reset_transitions();
        let mut state = trans
            .state
            .get_or_insert_with(|| self.initial.clone())
            .clone();

        loop {
            if stop == Some(&state) {
                return Ok(());
            }

            let Some(spec) = self.states.get(&state) else {
                return Err(StateError::InvalidState {
                    state: state.to_string(),
                }
                .into());
            };
            trans.count_transition(self.max_transitions)?;
            debug!(state = %state, transitions = trans.transition_count(), "fsm transition");

            let outcome = match &spec.transition {
                Some(transition) => transition(trans),
                None => Ok(false),
            };
            let next = match outcome {
                Ok(true) => match &spec.intercept {
                    Some(intercept) => Some(intercept.clone()),
                    None => {
                        return Err(StateError::MissingIntercept {
                            state: state.to_string(),
                        }
                        .into());
                    }
                },
                Ok(false) => spec.success.clone(),
                Err(error) if error.is_machine_fault() => return Err(error),
                Err(error) => {
                    trans.exception = Some(error.clone());
                    match &spec.error {
                        Some(target) => Some(target.clone()),
                        None => return Err(error),
                    }
                }
            };

            match next {
                Some(next) => {
                    trans.state = Some(next.clone());
                    state = next;
                }
                None => {
                    return match &trans.exception {
                        Some(error) => Err(error.clone()),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}
