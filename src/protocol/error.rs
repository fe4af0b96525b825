//! Protocol errors
//!
//! Domain rejections (`InvalidCreditCount`, `DuplicateId`, `OutOfPhase`, `Busy`)
//! leave shared state untouched and are reported straight back to the caller.
//! Fatal errors halt the session that hit them.

use super::{Command, Phase, RequestId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A request asked for zero (or fewer) credits.
    #[error("invalid credit count {credits} for request {id}")]
    InvalidCreditCount { id: RequestId, credits: i64 },

    /// The id is already outstanding or is not in the credit window.
    #[error("request id {0} is outstanding or outside the credit window")]
    DuplicateId(RequestId),

    /// The window and the grant bookkeeping drifted apart.
    #[error("identifier {0} unavailable: credit window out of sync")]
    IdentifierUnavailable(RequestId),

    #[error("reset refused: {outstanding} request(s) still outstanding")]
    Busy { outstanding: usize },

    #[error("{command} request not allowed while phase is {phase}")]
    OutOfPhase { command: Command, phase: Phase },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("malformed action: {0}")]
    MalformedAction(String),

    /// Session halted after an earlier fatal error.
    #[error("session halted: {cause}")]
    Halted { cause: String },
}

impl ProtocolError {
    /// Fatal errors end the session; everything else is a recoverable rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::IdentifierUnavailable(_)
                | ProtocolError::UnknownAction(_)
                | ProtocolError::Halted { .. }
        )
    }
}
