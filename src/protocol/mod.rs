//! Credit-flow protocol core
//!
//! Pure bookkeeping shared by the concurrent server and the sequential model:
//!
//! - `window`: the credit window of usable request identifiers
//! - `registry`: outstanding requests and their cancellation mode
//! - `grant`: how many credits a resolved request hands back
//! - `phase`: the Setup activation handshake gating Work traffic
//! - `action`: the wire-level action vocabulary and its text form
//!
//! Nothing in here is synchronized. The server wraps these types in a single
//! lock; the model clones them freely.

pub mod action;
pub mod error;
pub mod grant;
pub mod phase;
pub mod registry;
pub mod window;

pub use action::ProtocolAction;
pub use error::ProtocolError;
pub use grant::{
    FullGrant, GrantContext, GrantMode, GrantPolicy, RandomGrant, ScriptedGrant, StarvationGuard,
};
pub use phase::Phase;
pub use registry::{RegistryEntry, RequestRegistry};
pub use window::CreditWindow;

use std::fmt;

/// Identifier naming one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const INITIAL: RequestId = RequestId(0);

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(v: u64) -> Self {
        RequestId(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    Setup,
    Work,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Setup => write!(f, "Setup"),
            Command::Work => write!(f, "Work"),
        }
    }
}

/// Whether a cancel has been issued against an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelMode {
    Sent,
    CancelRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseStatus {
    Completed,
    Cancelled,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Completed => write!(f, "Completed"),
            ResponseStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// An accepted request awaiting its single response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingRequest {
    pub id: RequestId,
    pub command: Command,
    pub requested_credits: u32,
    pub cancel_mode: CancelMode,
}

impl PendingRequest {
    pub fn new(id: RequestId, command: Command, requested_credits: u32) -> Self {
        debug_assert!(requested_credits > 0, "accepted request with zero credits");
        PendingRequest {
            id,
            command,
            requested_credits,
            cancel_mode: CancelMode::Sent,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_mode == CancelMode::CancelRequested
    }
}

/// Outcome delivered to observers, exactly once per accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: RequestId,
    pub command: Command,
    pub granted_credits: u32,
    pub status: ResponseStatus,
    /// Acceptance sequence of the request this answers. Unique for the
    /// lifetime of a server, even when ids are re-issued after a reset.
    pub sequence: u64,
}

impl Response {
    /// The wire action this response corresponds to.
    pub fn to_action(&self) -> ProtocolAction {
        match self.command {
            Command::Setup => ProtocolAction::ResSetup {
                id: self.id,
                granted: self.granted_credits,
                status: self.status,
            },
            Command::Work => ProtocolAction::ResWork {
                id: self.id,
                granted: self.granted_credits,
                status: self.status,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_maps_to_wire_action() {
        let response = Response {
            id: RequestId(4),
            command: Command::Work,
            granted_credits: 1,
            status: ResponseStatus::Cancelled,
            sequence: 9,
        };
        assert_eq!(
            response.to_action(),
            ProtocolAction::ResWork {
                id: RequestId(4),
                granted: 1,
                status: ResponseStatus::Cancelled,
            }
        );
    }

    #[test]
    fn test_new_pending_request_is_sent() {
        let pending = PendingRequest::new(RequestId(0), Command::Setup, 3);
        assert_eq!(pending.cancel_mode, CancelMode::Sent);
        assert!(!pending.is_cancel_requested());
    }
}
