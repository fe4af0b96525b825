//! Credit window
//!
//! The set of request ids a caller may use next, plus the high-water mark used
//! to number freshly granted ids. Ids are never re-issued: every grant numbers
//! its ids strictly above `max_issued_id`.

use super::{ProtocolError, RequestId};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CreditWindow {
    available: BTreeSet<RequestId>,
    max_issued_id: u64,
}

impl CreditWindow {
    /// Window seeded with the single id `0`.
    pub fn new() -> Self {
        let mut available = BTreeSet::new();
        available.insert(RequestId::INITIAL);
        CreditWindow {
            available,
            max_issued_id: RequestId::INITIAL.as_u64(),
        }
    }

    #[inline]
    pub fn contains(&self, id: RequestId) -> bool {
        self.available.contains(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.available.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.available.iter().copied()
    }

    pub fn max_issued_id(&self) -> u64 {
        self.max_issued_id
    }

    /// Remove `id` from the window.
    pub fn take(&mut self, id: RequestId) -> Result<(), ProtocolError> {
        if self.available.remove(&id) {
            Ok(())
        } else {
            Err(ProtocolError::IdentifierUnavailable(id))
        }
    }

    /// Issue `n` fresh ids above the high-water mark and advance it.
    pub fn grant(&mut self, n: u32) -> Result<Vec<RequestId>, ProtocolError> {
        let mut issued = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let next = self
                .max_issued_id
                .checked_add(1)
                .ok_or(ProtocolError::IdentifierUnavailable(RequestId(u64::MAX)))?;
            let id = RequestId(next);
            if !self.available.insert(id) {
                return Err(ProtocolError::IdentifierUnavailable(id));
            }
            self.max_issued_id = next;
            issued.push(id);
        }
        Ok(issued)
    }

    /// Back to the startup state `{0}`.
    pub fn reset(&mut self) {
        *self = CreditWindow::new();
    }
}

impl Default for CreditWindow {
    fn default() -> Self {
        Self::new()
    }
}
