//! Credit grant policies
//!
//! A policy picks how many credits a resolved request hands back, anywhere in
//! `[0, requested_credits]`. `RandomGrant` models a server under resource
//! pressure and can return 0 even when that leaves the caller with no usable
//! id and nothing outstanding. `StarvationGuard` closes that gap by granting
//! at least one credit in exactly that situation.

use super::{PendingRequest, ProtocolAction, RequestId};
use crate::simulator::DeterministicRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Ledger state visible to a policy at grant time. Counts are taken after the
/// resolved request has left the registry and before new ids are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantContext {
    pub window_len: usize,
    pub outstanding: usize,
}

impl GrantContext {
    /// Granting nothing here would leave the caller unable to issue anything.
    pub fn would_starve(&self) -> bool {
        self.window_len == 0 && self.outstanding == 0
    }
}

pub trait GrantPolicy: Send {
    fn grant(&mut self, request: &PendingRequest, ctx: GrantContext) -> u32;

    fn name(&self) -> &'static str;
}

/// Always grants everything requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullGrant;

impl GrantPolicy for FullGrant {
    fn grant(&mut self, request: &PendingRequest, _ctx: GrantContext) -> u32 {
        request.requested_credits
    }

    fn name(&self) -> &'static str {
        "full"
    }
}

/// Uniform over `[0, requested_credits]`.
pub struct RandomGrant {
    rng: DeterministicRng,
}

impl RandomGrant {
    pub fn new(seed: u64) -> Self {
        RandomGrant {
            rng: DeterministicRng::new(seed),
        }
    }
}

impl GrantPolicy for RandomGrant {
    fn grant(&mut self, request: &PendingRequest, _ctx: GrantContext) -> u32 {
        self.rng
            .gen_range_inclusive(0, u64::from(request.requested_credits)) as u32
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Raises a zero grant to one when it would otherwise starve the caller.
pub struct StarvationGuard<P> {
    inner: P,
}

impl<P: GrantPolicy> StarvationGuard<P> {
    pub fn new(inner: P) -> Self {
        StarvationGuard { inner }
    }
}

impl<P: GrantPolicy> GrantPolicy for StarvationGuard<P> {
    fn grant(&mut self, request: &PendingRequest, ctx: GrantContext) -> u32 {
        let granted = self.inner.grant(request, ctx);
        if granted == 0 && ctx.would_starve() {
            debug!(
                id = %request.id,
                policy = self.inner.name(),
                "zero grant would starve caller, granting one credit"
            );
            1
        } else {
            granted
        }
    }

    fn name(&self) -> &'static str {
        "clamped"
    }
}

/// Grants taken from a recorded trace, so a replayed server issues the same
/// ids the trace did. Each id's grants are consumed in trace order, which keeps
/// ids reused after a reset apart. Requests the trace never answered get
/// everything they asked for.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGrant {
    script: BTreeMap<RequestId, VecDeque<u32>>,
}

impl ScriptedGrant {
    pub fn from_trace<'a, I>(trace: I) -> Self
    where
        I: IntoIterator<Item = &'a ProtocolAction>,
    {
        let mut script: BTreeMap<RequestId, VecDeque<u32>> = BTreeMap::new();
        for action in trace {
            if let ProtocolAction::ResSetup { id, granted, .. }
            | ProtocolAction::ResWork { id, granted, .. } = *action
            {
                script.entry(id).or_default().push_back(granted);
            }
        }
        ScriptedGrant { script }
    }

    /// Grants not yet handed out.
    pub fn remaining(&self) -> usize {
        self.script.values().map(VecDeque::len).sum()
    }
}

impl GrantPolicy for ScriptedGrant {
    fn grant(&mut self, request: &PendingRequest, _ctx: GrantContext) -> u32 {
        match self.script.get_mut(&request.id).and_then(VecDeque::pop_front) {
            Some(granted) => granted,
            None => {
                debug!(id = %request.id, "no scripted grant, granting in full");
                request.requested_credits
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Policy selection from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantMode {
    /// Grant every requested credit.
    Full,
    /// Uniform random grant, zero included, no starvation guard.
    Random,
    /// Uniform random grant behind a starvation guard.
    Clamped,
}

impl Default for GrantMode {
    fn default() -> Self {
        GrantMode::Clamped
    }
}

impl GrantMode {
    pub fn build(self, seed: u64) -> Box<dyn GrantPolicy> {
        match self {
            GrantMode::Full => Box::new(FullGrant),
            GrantMode::Random => Box::new(RandomGrant::new(seed)),
            GrantMode::Clamped => Box::new(StarvationGuard::new(RandomGrant::new(seed))),
        }
    }

    /// Whether this mode guarantees a non-empty window whenever nothing is outstanding.
    pub fn guards_starvation(self) -> bool {
        match self {
            GrantMode::Full | GrantMode::Clamped => true,
            GrantMode::Random => false,
        }
    }
}

impl std::str::FromStr for GrantMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(GrantMode::Full),
            "random" => Ok(GrantMode::Random),
            "clamped" => Ok(GrantMode::Clamped),
            other => Err(format!("unknown grant mode '{}'", other)),
        }
    }
}
