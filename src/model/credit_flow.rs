//! Stateright model of the credit-flow protocol
//!
//! State is the credit window, the registry of outstanding requests, the
//! activation phase and the most recent response. Actions are the wire
//! vocabulary; `is_enabled` is the enabling-predicate table and `apply` the
//! transition function. The checker and the conformance monitor both go
//! through these two functions.

use crate::protocol::{
    CancelMode, Command, CreditWindow, GrantMode, PendingRequest, Phase, ProtocolAction,
    RequestId, ResponseStatus,
};
use stateright::{Model, Property};
use std::collections::BTreeMap;

/// Summary of the most recent response, kept for the credit-bound property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LastResponse {
    pub granted: u32,
    pub requested: u32,
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolState {
    pub window: CreditWindow,
    pub registry: BTreeMap<RequestId, PendingRequest>,
    pub phase: Phase,
    pub last_response: Option<LastResponse>,
}

impl ProtocolState {
    pub fn new() -> Self {
        ProtocolState {
            window: CreditWindow::new(),
            registry: BTreeMap::new(),
            phase: Phase::Inactive,
            last_response: None,
        }
    }

    /// Resolving `id` with no grant would leave nothing usable and nothing outstanding.
    fn would_starve_resolving(&self, id: RequestId) -> bool {
        self.window.is_empty() && self.registry.len() == 1 && self.registry.contains_key(&id)
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct CreditFlowModel {
    /// Largest credit count a generated request asks for
    pub max_credits: u32,
    /// Exploration stops past this high-water mark
    pub max_issued_id: u64,
    /// Whether responses must avoid starving the caller
    pub starvation_guard: bool,
}

impl CreditFlowModel {
    pub fn new() -> Self {
        CreditFlowModel {
            max_credits: 2,
            max_issued_id: 4,
            starvation_guard: true,
        }
    }

    /// The unguarded reference behaviour, zero grants allowed anywhere.
    pub fn faithful() -> Self {
        CreditFlowModel {
            starvation_guard: false,
            ..Self::new()
        }
    }

    pub fn with_bounds(max_credits: u32, max_issued_id: u64) -> Self {
        CreditFlowModel {
            max_credits,
            max_issued_id,
            ..Self::new()
        }
    }

    /// Model matching a server running with `mode`.
    pub fn for_mode(mode: GrantMode) -> Self {
        CreditFlowModel {
            starvation_guard: mode.guards_starvation(),
            ..Self::new()
        }
    }

    /// Enabling-predicate table over the current state.
    pub fn is_enabled(&self, state: &ProtocolState, action: &ProtocolAction) -> bool {
        match *action {
            ProtocolAction::ReqSetup { id, credits } => {
                request_enabled(state, Command::Setup, id, credits)
            }
            ProtocolAction::ReqWork { id, credits } => {
                request_enabled(state, Command::Work, id, credits)
            }
            ProtocolAction::Cancel { .. } => true,
            ProtocolAction::ResSetup {
                id,
                granted,
                status,
            } => self.response_enabled(state, Command::Setup, id, granted, status),
            ProtocolAction::ResWork {
                id,
                granted,
                status,
            } => self.response_enabled(state, Command::Work, id, granted, status),
            ProtocolAction::Reset => state.registry.is_empty(),
        }
    }

    fn response_enabled(
        &self,
        state: &ProtocolState,
        command: Command,
        id: RequestId,
        granted: u32,
        status: ResponseStatus,
    ) -> bool {
        let Some(pending) = state.registry.get(&id) else {
            return false;
        };
        pending.command == command
            && state.phase.admits_response(command)
            && granted <= pending.requested_credits
            && (status == ResponseStatus::Completed || pending.is_cancel_requested())
            && (!self.starvation_guard || granted > 0 || !state.would_starve_resolving(id))
    }

    /// Apply `action`, or `None` if it is not enabled.
    pub fn apply(&self, state: &ProtocolState, action: &ProtocolAction) -> Option<ProtocolState> {
        if !self.is_enabled(state, action) {
            return None;
        }
        let mut next = state.clone();

        match *action {
            ProtocolAction::ReqSetup { id, credits } => {
                accept(&mut next, Command::Setup, id, credits)?
            }
            ProtocolAction::ReqWork { id, credits } => {
                accept(&mut next, Command::Work, id, credits)?
            }
            ProtocolAction::Cancel { id } => {
                if let Some(pending) = next.registry.get_mut(&id) {
                    pending.cancel_mode = CancelMode::CancelRequested;
                }
            }
            ProtocolAction::ResSetup {
                id,
                granted,
                status,
            }
            | ProtocolAction::ResWork {
                id,
                granted,
                status,
            } => {
                let pending = next.registry.remove(&id)?;
                next.window.grant(granted).ok()?;
                next.phase = next.phase.on_response(pending.command, status);
                next.last_response = Some(LastResponse {
                    granted,
                    requested: pending.requested_credits,
                    status,
                });
            }
            ProtocolAction::Reset => {
                next = ProtocolState::new();
            }
        }

        Some(next)
    }

    /// Names of the invariants this model guarantees that `state` violates.
    pub fn broken_invariants(&self, state: &ProtocolState) -> Vec<&'static str> {
        let mut broken = Vec::new();
        if !window_registry_disjoint(state) {
            broken.push("window and registry disjoint");
        }
        if !credits_positive(state) {
            broken.push("requested credits positive");
        }
        if !granted_within_requested(state) {
            broken.push("granted within requested");
        }
        if !ids_within_high_water_mark(state) {
            broken.push("ids within high-water mark");
        }
        if !phase_consistent(state) {
            broken.push("phase consistent");
        }
        if self.starvation_guard && !no_starvation(state) {
            broken.push("no starvation");
        }
        broken
    }
}

impl Default for CreditFlowModel {
    fn default() -> Self {
        Self::new()
    }
}

fn request_enabled(state: &ProtocolState, command: Command, id: RequestId, credits: u32) -> bool {
    credits > 0
        && state.phase.admits_request(command)
        && state.window.contains(id)
        && !state.registry.contains_key(&id)
}

fn accept(state: &mut ProtocolState, command: Command, id: RequestId, credits: u32) -> Option<()> {
    state.window.take(id).ok()?;
    state.phase = state.phase.on_request(command).ok()?;
    state
        .registry
        .insert(id, PendingRequest::new(id, command, credits));
    Some(())
}

fn window_registry_disjoint(state: &ProtocolState) -> bool {
    state.registry.keys().all(|id| !state.window.contains(*id))
}

fn credits_positive(state: &ProtocolState) -> bool {
    state.registry.values().all(|p| p.requested_credits > 0)
}

fn granted_within_requested(state: &ProtocolState) -> bool {
    state
        .last_response
        .map_or(true, |last| last.granted <= last.requested)
}

fn ids_within_high_water_mark(state: &ProtocolState) -> bool {
    let max = state.window.max_issued_id();
    state.window.iter().all(|id| id.0 <= max) && state.registry.keys().all(|id| id.0 <= max)
}

fn phase_consistent(state: &ProtocolState) -> bool {
    let setups = state
        .registry
        .values()
        .filter(|p| p.command == Command::Setup)
        .count();
    let works = state.registry.len() - setups;
    match state.phase {
        Phase::Inactive => state.registry.is_empty(),
        Phase::Activating => setups == 1 && works == 0,
        Phase::Active => setups == 0,
    }
}

fn no_starvation(state: &ProtocolState) -> bool {
    !state.registry.is_empty() || !state.window.is_empty()
}

impl Model for CreditFlowModel {
    type State = ProtocolState;
    type Action = ProtocolAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![ProtocolState::new()]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        // Requests from the window
        for id in state.window.iter() {
            for credits in 1..=self.max_credits {
                for action in [
                    ProtocolAction::ReqSetup { id, credits },
                    ProtocolAction::ReqWork { id, credits },
                ] {
                    if self.is_enabled(state, &action) {
                        actions.push(action);
                    }
                }
            }
        }

        for pending in state.registry.values() {
            let id = pending.id;
            // A repeated cancel is a self-loop, so only the first is generated
            if !pending.is_cancel_requested() {
                actions.push(ProtocolAction::Cancel { id });
            }
            for granted in 0..=pending.requested_credits {
                for status in [ResponseStatus::Completed, ResponseStatus::Cancelled] {
                    let action = ProtocolAction::response(pending.command, id, granted, status);
                    if self.is_enabled(state, &action) {
                        actions.push(action);
                    }
                }
            }
        }

        if state.registry.is_empty() && *state != ProtocolState::new() {
            actions.push(ProtocolAction::Reset);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        self.apply(state, &action)
    }

    fn within_boundary(&self, state: &Self::State) -> bool {
        state.window.max_issued_id() <= self.max_issued_id
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("window and registry disjoint", |_, state: &ProtocolState| {
                window_registry_disjoint(state)
            }),
            Property::always("requested credits positive", |_, state: &ProtocolState| {
                credits_positive(state)
            }),
            Property::always("granted within requested", |_, state: &ProtocolState| {
                granted_within_requested(state)
            }),
            Property::always("ids within high-water mark", |_, state: &ProtocolState| {
                ids_within_high_water_mark(state)
            }),
            Property::always("phase consistent", |_, state: &ProtocolState| {
                phase_consistent(state)
            }),
            Property::always("no starvation", |_, state: &ProtocolState| no_starvation(state)),
            Property::sometimes("session activated", |_, state: &ProtocolState| {
                state.phase == Phase::Active
            }),
            Property::sometimes("cancellation resolved", |_, state: &ProtocolState| {
                matches!(
                    state.last_response,
                    Some(LastResponse {
                        status: ResponseStatus::Cancelled,
                        ..
                    })
                )
            }),
            Property::sometimes("window grows", |_, state: &ProtocolState| state.window.len() >= 2),
        ]
    }
}
