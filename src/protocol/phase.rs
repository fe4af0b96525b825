//! Activation phase
//!
//! A Setup request must finish before any Work traffic is legal. Cancelling the
//! Setup drops back to `Inactive`; completing it activates the session.

use super::{Command, ProtocolError, ResponseStatus};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Phase {
    #[default]
    Inactive,
    Activating,
    Active,
}

impl Phase {
    /// Whether a request for `command` may be accepted in this phase.
    pub fn admits_request(self, command: Command) -> bool {
        match command {
            Command::Setup => self == Phase::Inactive,
            Command::Work => self == Phase::Active,
        }
    }

    /// Whether a response for `command` may be emitted in this phase.
    pub fn admits_response(self, command: Command) -> bool {
        match command {
            Command::Setup => self == Phase::Activating,
            Command::Work => self == Phase::Active,
        }
    }

    /// Phase after accepting a request for `command`.
    pub fn on_request(self, command: Command) -> Result<Phase, ProtocolError> {
        if !self.admits_request(command) {
            return Err(ProtocolError::OutOfPhase {
                command,
                phase: self,
            });
        }
        Ok(match command {
            Command::Setup => Phase::Activating,
            Command::Work => self,
        })
    }

    /// Phase after a response for `command` with `status`.
    pub fn on_response(self, command: Command, status: ResponseStatus) -> Phase {
        match (command, status) {
            (Command::Setup, ResponseStatus::Completed) => Phase::Active,
            (Command::Setup, ResponseStatus::Cancelled) => Phase::Inactive,
            (Command::Work, _) => self,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Inactive => write!(f, "Inactive"),
            Phase::Activating => write!(f, "Activating"),
            Phase::Active => write!(f, "Active"),
        }
    }
}
