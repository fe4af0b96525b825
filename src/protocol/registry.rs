//! Request registry
//!
//! Maps each outstanding id to its pending request. `resolve` is the single
//! check-and-remove that decides which of the completion and cancellation
//! paths produces the response; the loser finds the entry gone.

use super::{CancelMode, Command, PendingRequest, ProtocolError, RequestId};
use std::collections::BTreeMap;

/// A registered request and the acceptance sequence that claims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub request: PendingRequest,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestRegistry {
    entries: BTreeMap<RequestId, RegistryEntry>,
    next_sequence: u64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request.
    pub fn accept(
        &mut self,
        id: RequestId,
        command: Command,
        requested_credits: u32,
    ) -> Result<RegistryEntry, ProtocolError> {
        if requested_credits == 0 {
            return Err(ProtocolError::InvalidCreditCount { id, credits: 0 });
        }
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateId(id));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let entry = RegistryEntry {
            request: PendingRequest::new(id, command, requested_credits),
            sequence,
        };
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }

    /// Flag an outstanding request as cancel-requested. Returns the entry's
    /// sequence, or `None` if nothing is outstanding under `id`.
    pub fn mark_cancel_requested(&mut self, id: RequestId) -> Option<u64> {
        let entry = self.entries.get_mut(&id)?;
        entry.request.cancel_mode = CancelMode::CancelRequested;
        Some(entry.sequence)
    }

    /// Remove and return the entry for `id`, whatever its sequence.
    pub fn resolve(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.entries.remove(&id).map(|entry| entry.request)
    }

    /// Remove the entry for `id` only if it still belongs to `sequence`.
    pub fn resolve_sequence(&mut self, id: RequestId, sequence: u64) -> Option<RegistryEntry> {
        match self.entries.get(&id) {
            Some(entry) if entry.sequence == sequence => self.entries.remove(&id),
            _ => None,
        }
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        self.entries.get(&id).map(|entry| &entry.request)
    }

    #[inline]
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> + '_ {
        self.entries.values().map(|entry| &entry.request)
    }

    /// Next sequence number that `accept` will hand out.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
