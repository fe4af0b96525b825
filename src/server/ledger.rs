//! Ledger: the one piece of shared mutable state
//!
//! Window, registry, phase and grant policy live together behind a single
//! lock so that accept, cancel-mark and resolve-plus-grant each happen as one
//! critical section. The high-water mark for fresh ids moves only in here.

use crate::protocol::{
    Command, CreditWindow, GrantContext, GrantPolicy, PendingRequest, Phase, ProtocolAction,
    ProtocolError, RegistryEntry, RequestId, RequestRegistry, Response, ResponseStatus,
};
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub window: BTreeSet<RequestId>,
    pub max_issued_id: u64,
    pub outstanding: Vec<PendingRequest>,
    pub phase: Phase,
    pub halted: bool,
}

impl LedgerSnapshot {
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn is_starved(&self) -> bool {
        self.outstanding.is_empty() && self.window.is_empty()
    }
}

pub struct Ledger {
    window: CreditWindow,
    registry: RequestRegistry,
    phase: Phase,
    policy: Box<dyn GrantPolicy>,
    journal: Option<Vec<ProtocolAction>>,
    fault: Option<String>,
}

impl Ledger {
    pub fn new(policy: Box<dyn GrantPolicy>, journal: bool) -> Self {
        Ledger {
            window: CreditWindow::new(),
            registry: RequestRegistry::new(),
            phase: Phase::Inactive,
            policy,
            journal: journal.then(Vec::new),
            fault: None,
        }
    }

    /// Accept a Setup or Work request, consuming `id` from the window.
    pub fn accept(
        &mut self,
        command: Command,
        id: RequestId,
        credits: u32,
    ) -> Result<RegistryEntry, ProtocolError> {
        self.check_live()?;

        if credits == 0 {
            return Err(ProtocolError::InvalidCreditCount { id, credits: 0 });
        }
        let next_phase = self.phase.on_request(command)?;
        if self.registry.contains(id) || !self.window.contains(id) {
            return Err(ProtocolError::DuplicateId(id));
        }

        if let Err(e) = self.window.take(id) {
            return Err(self.halt(e));
        }
        let entry = self.registry.accept(id, command, credits)?;
        self.phase = next_phase;
        self.record(ProtocolAction::request(command, id, credits));

        debug!(
            %id,
            %command,
            credits,
            sequence = entry.sequence,
            window = self.window.len(),
            "request accepted"
        );
        Ok(entry)
    }

    /// Flag `id` as cancel-requested. `None` when nothing is outstanding under it.
    pub fn mark_cancel_requested(&mut self, id: RequestId) -> Result<Option<u64>, ProtocolError> {
        self.check_live()?;
        let sequence = self.registry.mark_cancel_requested(id);
        self.record(ProtocolAction::Cancel { id });
        Ok(sequence)
    }

    /// Resolve the request claimed by `(id, sequence)`, grant its credits and
    /// build the response. `Ok(None)` means another path already resolved it.
    pub fn settle(
        &mut self,
        id: RequestId,
        sequence: u64,
        status: ResponseStatus,
    ) -> Result<Option<Response>, ProtocolError> {
        self.check_live()?;

        let Some(entry) = self.registry.resolve_sequence(id, sequence) else {
            return Ok(None);
        };
        let request = entry.request;
        debug_assert!(
            status == ResponseStatus::Completed || request.is_cancel_requested(),
            "cancelled outcome for request {} without a cancel",
            id
        );

        let ctx = GrantContext {
            window_len: self.window.len(),
            outstanding: self.registry.len(),
        };
        let mut granted = self.policy.grant(&request, ctx);
        if granted > request.requested_credits {
            warn!(
                %id,
                granted,
                requested = request.requested_credits,
                policy = self.policy.name(),
                "grant policy over-granted, clamping to requested credits"
            );
            granted = request.requested_credits;
        }

        let issued = match self.window.grant(granted) {
            Ok(issued) => issued,
            Err(e) => return Err(self.halt(e)),
        };
        self.phase = self.phase.on_response(request.command, status);
        self.record(ProtocolAction::response(request.command, id, granted, status));

        debug!(
            %id,
            command = %request.command,
            %status,
            granted,
            issued = ?issued,
            phase = %self.phase,
            "request resolved"
        );

        Ok(Some(Response {
            id,
            command: request.command,
            granted_credits: granted,
            status,
            sequence: entry.sequence,
        }))
    }

    /// Return to the startup state. Refused while anything is outstanding.
    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.check_live()?;
        if !self.registry.is_empty() {
            return Err(ProtocolError::Busy {
                outstanding: self.registry.len(),
            });
        }
        self.window.reset();
        self.phase = Phase::Inactive;
        self.record(ProtocolAction::Reset);
        debug!("ledger reset to idle");
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            window: self.window.iter().collect(),
            max_issued_id: self.window.max_issued_id(),
            outstanding: self.registry.iter().cloned().collect(),
            phase: self.phase,
            halted: self.fault.is_some(),
        }
    }

    pub fn take_journal(&mut self) -> Vec<ProtocolAction> {
        match self.journal.as_mut() {
            Some(journal) => std::mem::take(journal),
            None => Vec::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.registry.len()
    }

    pub fn is_halted(&self) -> bool {
        self.fault.is_some()
    }

    fn record(&mut self, action: ProtocolAction) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(action);
        }
    }

    fn check_live(&self) -> Result<(), ProtocolError> {
        match &self.fault {
            Some(cause) => Err(ProtocolError::Halted {
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Latch a fatal error; every later call fails with `Halted`.
    fn halt(&mut self, e: ProtocolError) -> ProtocolError {
        error!(error = %e, "fatal ledger inconsistency, halting session");
        self.fault = Some(e.to_string());
        e
    }
}
