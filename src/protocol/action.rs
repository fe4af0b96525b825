//! Action vocabulary
//!
//! The actions exchanged between a caller and the server, in the form used by
//! both the model and any external driver. The text form is
//! `Name(arg, arg, ...)`, e.g. `ReqSetup(0,3)` or `ResWork(4,1,Cancelled)`.

use super::{Command, ProtocolError, RequestId, ResponseStatus};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolAction {
    ReqSetup {
        id: RequestId,
        credits: u32,
    },
    ReqWork {
        id: RequestId,
        credits: u32,
    },
    Cancel {
        id: RequestId,
    },
    ResSetup {
        id: RequestId,
        granted: u32,
        status: ResponseStatus,
    },
    ResWork {
        id: RequestId,
        granted: u32,
        status: ResponseStatus,
    },
    /// Return an idle server to its startup state.
    Reset,
}

impl ProtocolAction {
    pub fn request(command: Command, id: RequestId, credits: u32) -> Self {
        match command {
            Command::Setup => ProtocolAction::ReqSetup { id, credits },
            Command::Work => ProtocolAction::ReqWork { id, credits },
        }
    }

    pub fn response(
        command: Command,
        id: RequestId,
        granted: u32,
        status: ResponseStatus,
    ) -> Self {
        match command {
            Command::Setup => ProtocolAction::ResSetup {
                id,
                granted,
                status,
            },
            Command::Work => ProtocolAction::ResWork {
                id,
                granted,
                status,
            },
        }
    }

    /// Caller-to-server actions.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolAction::ReqSetup { .. }
                | ProtocolAction::ReqWork { .. }
                | ProtocolAction::Cancel { .. }
                | ProtocolAction::Reset
        )
    }

    pub fn id(&self) -> Option<RequestId> {
        match *self {
            ProtocolAction::ReqSetup { id, .. }
            | ProtocolAction::ReqWork { id, .. }
            | ProtocolAction::Cancel { id }
            | ProtocolAction::ResSetup { id, .. }
            | ProtocolAction::ResWork { id, .. } => Some(id),
            ProtocolAction::Reset => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolAction::ReqSetup { .. } => "ReqSetup",
            ProtocolAction::ReqWork { .. } => "ReqWork",
            ProtocolAction::Cancel { .. } => "Cancel",
            ProtocolAction::ResSetup { .. } => "ResSetup",
            ProtocolAction::ResWork { .. } => "ResWork",
            ProtocolAction::Reset => "Reset",
        }
    }
}

impl fmt::Display for ProtocolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolAction::ReqSetup { id, credits } | ProtocolAction::ReqWork { id, credits } => {
                write!(f, "{}({},{})", self.name(), id, credits)
            }
            ProtocolAction::Cancel { id } => write!(f, "Cancel({})", id),
            ProtocolAction::ResSetup {
                id,
                granted,
                status,
            }
            | ProtocolAction::ResWork {
                id,
                granted,
                status,
            } => write!(f, "{}({},{},{})", self.name(), id, granted, status),
            ProtocolAction::Reset => write!(f, "Reset"),
        }
    }
}

impl FromStr for ProtocolAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (name, args) = match text.find('(') {
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| ProtocolError::MalformedAction(text.to_string()))?;
                (text[..open].trim(), split_args(inner))
            }
            None => (text, Vec::new()),
        };

        let malformed = || ProtocolError::MalformedAction(text.to_string());

        match name {
            "ReqSetup" | "ReqWork" => {
                let [id, credits] = args[..] else {
                    return Err(malformed());
                };
                let id = parse_id(id).ok_or_else(malformed)?;
                let credits = parse_credits(id, credits).ok_or_else(malformed)??;
                let command = if name == "ReqSetup" {
                    Command::Setup
                } else {
                    Command::Work
                };
                Ok(ProtocolAction::request(command, id, credits))
            }
            "Cancel" => {
                let [id] = args[..] else {
                    return Err(malformed());
                };
                Ok(ProtocolAction::Cancel {
                    id: parse_id(id).ok_or_else(malformed)?,
                })
            }
            "ResSetup" | "ResWork" => {
                let [id, granted, status] = args[..] else {
                    return Err(malformed());
                };
                let id = parse_id(id).ok_or_else(malformed)?;
                let granted = granted.parse::<u32>().map_err(|_| malformed())?;
                let status = parse_status(status).ok_or_else(malformed)?;
                let command = if name == "ResSetup" {
                    Command::Setup
                } else {
                    Command::Work
                };
                Ok(ProtocolAction::response(command, id, granted, status))
            }
            "Reset" if args.is_empty() => Ok(ProtocolAction::Reset),
            "Reset" => Err(malformed()),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

fn split_args(inner: &str) -> Vec<&str> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    inner.split(',').map(str::trim).collect()
}

fn parse_id(s: &str) -> Option<RequestId> {
    s.parse::<u64>().ok().map(RequestId)
}

/// Outer `None` for text that is not a number at all; inner error for a
/// number that is not a valid credit count.
fn parse_credits(id: RequestId, s: &str) -> Option<Result<u32, ProtocolError>> {
    let credits = s.parse::<i64>().ok()?;
    if credits <= 0 {
        return Some(Err(ProtocolError::InvalidCreditCount { id, credits }));
    }
    Some(u32::try_from(credits).map_err(|_| ProtocolError::MalformedAction(s.to_string())))
}

fn parse_status(s: &str) -> Option<ResponseStatus> {
    match s {
        "Completed" => Some(ResponseStatus::Completed),
        "Cancelled" => Some(ResponseStatus::Cancelled),
        _ => None,
    }
}
