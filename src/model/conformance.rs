//! Conformance monitor
//!
//! Drives `CreditFlowModel` one observed action at a time. Every action the
//! implementation performed must be enabled in the model at that point, and
//! the model must agree with the implementation's ledger when compared.

use super::credit_flow::{CreditFlowModel, ProtocolState};
use crate::protocol::ProtocolAction;
use crate::server::LedgerSnapshot;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConformanceViolation {
    #[error("step {step}: {action} is not enabled in model state {state}")]
    NotEnabled {
        step: usize,
        action: ProtocolAction,
        state: String,
    },
    #[error("step {step}: invariant '{invariant}' broken after {action}")]
    InvariantBroken {
        step: usize,
        action: ProtocolAction,
        invariant: &'static str,
    },
    #[error("state mismatch after {steps} steps: {detail}")]
    StateMismatch { steps: usize, detail: String },
}

pub struct ConformanceMonitor {
    model: CreditFlowModel,
    state: ProtocolState,
    steps: usize,
}

impl ConformanceMonitor {
    pub fn new(model: CreditFlowModel) -> Self {
        ConformanceMonitor {
            model,
            state: ProtocolState::new(),
            steps: 0,
        }
    }

    /// Apply one observed action.
    pub fn step(&mut self, action: &ProtocolAction) -> Result<(), ConformanceViolation> {
        let step = self.steps;
        let next = self
            .model
            .apply(&self.state, action)
            .ok_or_else(|| ConformanceViolation::NotEnabled {
                step,
                action: *action,
                state: format!("{:?}", self.state),
            })?;

        if let Some(invariant) = self.model.broken_invariants(&next).into_iter().next() {
            return Err(ConformanceViolation::InvariantBroken {
                step,
                action: *action,
                invariant,
            });
        }

        trace!(step, %action, "conformance step");
        self.state = next;
        self.steps += 1;
        Ok(())
    }

    /// Apply a whole trace, stopping at the first violation.
    pub fn replay<'a, I>(&mut self, actions: I) -> Result<(), ConformanceViolation>
    where
        I: IntoIterator<Item = &'a ProtocolAction>,
    {
        for action in actions {
            self.step(action)?;
        }
        Ok(())
    }

    /// Compare the model against an implementation snapshot.
    pub fn check_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ConformanceViolation> {
        let mismatch = |detail: String| ConformanceViolation::StateMismatch {
            steps: self.steps,
            detail,
        };

        let model_window: Vec<_> = self.state.window.iter().collect();
        let impl_window: Vec<_> = snapshot.window.iter().copied().collect();
        if model_window != impl_window {
            return Err(mismatch(format!(
                "window: model {:?}, server {:?}",
                model_window, impl_window
            )));
        }
        if self.state.window.max_issued_id() != snapshot.max_issued_id {
            return Err(mismatch(format!(
                "max issued id: model {}, server {}",
                self.state.window.max_issued_id(),
                snapshot.max_issued_id
            )));
        }
        let model_outstanding: Vec<_> = self.state.registry.values().cloned().collect();
        if model_outstanding != snapshot.outstanding {
            return Err(mismatch(format!(
                "outstanding: model {:?}, server {:?}",
                model_outstanding, snapshot.outstanding
            )));
        }
        if self.state.phase != snapshot.phase {
            return Err(mismatch(format!(
                "phase: model {}, server {}",
                self.state.phase, snapshot.phase
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Phase, RequestId, ResponseStatus};

    fn parse(lines: &[&str]) -> Vec<ProtocolAction> {
        lines.iter().map(|l| l.parse().unwrap()).collect()
    }

    #[test]
    fn test_legal_trace_replays() {
        let trace = parse(&[
            "ReqSetup(0,2)",
            "Cancel(7)",
            "ResSetup(0,2,Completed)",
            "ReqWork(1,1)",
            "ReqWork(2,2)",
            "Cancel(2)",
            "ResWork(2,0,Cancelled)",
            "ResWork(1,1,Completed)",
            "Reset",
        ]);
        let mut monitor = ConformanceMonitor::new(CreditFlowModel::new());
        monitor.replay(&trace).unwrap();
        assert_eq!(monitor.steps(), trace.len());
        assert_eq!(monitor.state().phase, Phase::Inactive);
        assert!(monitor.state().window.contains(RequestId(0)));
    }

    #[test]
    fn test_duplicate_response_rejected() {
        let trace = parse(&["ReqSetup(0,1)", "ResSetup(0,1,Completed)"]);
        let mut monitor = ConformanceMonitor::new(CreditFlowModel::new());
        monitor.replay(&trace).unwrap();

        let err = monitor
            .step(&ProtocolAction::ResSetup {
                id: RequestId(0),
                granted: 1,
                status: ResponseStatus::Cancelled,
            })
            .unwrap_err();
        assert!(matches!(err, ConformanceViolation::NotEnabled { step: 2, .. }));
    }

    #[test]
    fn test_work_before_activation_rejected() {
        let mut monitor = ConformanceMonitor::new(CreditFlowModel::new());
        monitor.step(&"ReqSetup(0,2)".parse().unwrap()).unwrap();
        let err = monitor.step(&"ReqWork(0,1)".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ConformanceViolation::NotEnabled { .. }));
    }

    #[test]
    fn test_snapshot_mismatch_reported() {
        let monitor = ConformanceMonitor::new(CreditFlowModel::new());
        let snapshot = LedgerSnapshot {
            window: [RequestId(1)].into_iter().collect(),
            max_issued_id: 1,
            outstanding: Vec::new(),
            phase: Phase::Inactive,
            halted: false,
        };
        let err = monitor.check_snapshot(&snapshot).unwrap_err();
        assert!(matches!(err, ConformanceViolation::StateMismatch { .. }));
    }
}
