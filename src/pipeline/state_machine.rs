//! The client transport lifecycle state machine.
//!
//! Single source of truth for whether a lifecycle operation is legal
//! right now. All mutations of the state go through
//! [`ClientTransportStateMachine::move_next`]; anything outside the fixed
//! transition table fails deterministically.

use thiserror::Error;

/// Low-level lifecycle state of the client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTransportState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Input alphabet of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    OpenStart,
    OpenSuccess,
    OpenFailure,
    CloseStart,
    CloseComplete,
    ConnectionLost,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid client transport state transition {from:?} --{action:?}--> {to:?}")]
pub struct InvalidTransition {
    pub from: ClientTransportState,
    pub action: StateAction,
    pub to: ClientTransportState,
}

impl From<InvalidTransition> for crate::error::IotHubError {
    fn from(error: InvalidTransition) -> Self {
        crate::error::IotHubError::invalid_state(error.to_string()).with_source(error)
    }
}

#[derive(Debug)]
pub struct ClientTransportStateMachine {
    state: ClientTransportState,
}

impl ClientTransportStateMachine {
    pub fn new() -> Self {
        ClientTransportStateMachine {
            state: ClientTransportState::Closed,
        }
    }

    pub fn state(&self) -> ClientTransportState {
        self.state
    }

    /// Advances the machine, or fails if `(state, action, target)` is not
    /// in the transition table.
    pub fn move_next(
        &mut self,
        action: StateAction,
        target: ClientTransportState,
    ) -> Result<ClientTransportState, InvalidTransition> {
        match Self::next(self.state, action) {
            Some(next) if next == target => {
                self.state = next;
                Ok(next)
            }
            _ => Err(InvalidTransition {
                from: self.state,
                action,
                to: target,
            }),
        }
    }

    fn next(from: ClientTransportState, action: StateAction) -> Option<ClientTransportState> {
        use ClientTransportState::*;
        use StateAction::*;
        match (from, action) {
            (Closed, OpenStart) => Some(Opening),
            (Opening, OpenSuccess) => Some(Open),
            (Opening, OpenFailure) => Some(Closed),
            (Opening, CloseStart) => Some(Closing),
            (Open, CloseStart) => Some(Closing),
            (Open, ConnectionLost) => Some(Opening),
            (Closing, CloseComplete) => Some(Closed),
            _ => None,
        }
    }
}

impl Default for ClientTransportStateMachine {
    fn default() -> Self {
        ClientTransportStateMachine::new()
    }
}
