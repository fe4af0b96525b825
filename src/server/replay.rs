//! Trace replay against a live server
//!
//! Feeds the caller-side actions of a recorded trace to a fresh server. Each
//! request is held back until the server has delivered as many responses as
//! the trace had at that point, and grants come from the trace through
//! `ScriptedGrant`, so the server issues the same ids the trace used.
//!
//! Cancellation races are timing-dependent. A response whose status differs
//! from the trace is tolerated when the trace cancelled that request; any other
//! mismatch, and any request the live server refuses, fails the replay.

use super::{ChannelObserver, CreditServer};
use crate::config::ServerConfig;
use crate::model::{ConformanceMonitor, ConformanceViolation, CreditFlowModel};
use crate::protocol::{
    ProtocolAction, ProtocolError, RequestId, Response, ResponseStatus, ScriptedGrant,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Longest wait for a response the trace says is coming.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Responses keyed by reset epoch and id. Ids are unique within an epoch.
type ResponseKey = (usize, RequestId);

#[derive(Debug)]
pub struct ReplayReport {
    /// Caller-side actions the live server accepted
    pub submitted: usize,
    /// First request the live server refused; driving stops there
    pub rejected: Option<(ProtocolAction, ProtocolError)>,
    /// Cancelled requests whose race settled the other way live
    pub race_flips: usize,
    pub divergences: Vec<String>,
    pub conformance: Option<ConformanceViolation>,
    /// Live journal, in ledger order
    pub journal: Vec<ProtocolAction>,
}

impl ReplayReport {
    pub fn is_success(&self) -> bool {
        self.rejected.is_none() && self.divergences.is_empty() && self.conformance.is_none()
    }
}

pub struct TraceReplayer {
    config: ServerConfig,
    stall_timeout: Duration,
}

impl TraceReplayer {
    /// Journaling is forced on; the report is built from the live journal.
    pub fn new(mut config: ServerConfig) -> Self {
        config.journal = true;
        TraceReplayer {
            config,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Drive a fresh server through `trace`. `Err` only for fatal protocol errors.
    pub async fn run(&self, trace: &[ProtocolAction]) -> Result<ReplayReport, ProtocolError> {
        let policy = ScriptedGrant::from_trace(trace);
        let server = CreditServer::with_policy(self.config.clone(), Box::new(policy));
        let (observer, mut rx) = ChannelObserver::new();
        server.register_observer(Arc::new(observer));

        let mut report = ReplayReport {
            submitted: 0,
            rejected: None,
            race_flips: 0,
            divergences: Vec::new(),
            conformance: None,
            journal: Vec::new(),
        };
        let mut answered_in_trace = 0;
        let mut delivered = 0;

        for action in trace {
            if !action.is_request() {
                answered_in_trace += 1;
                continue;
            }
            if !self
                .await_responses(&mut rx, &mut delivered, answered_in_trace)
                .await
            {
                report.divergences.push(format!(
                    "stalled before {}: {} of {} responses delivered",
                    action, delivered, answered_in_trace
                ));
                break;
            }
            match server.submit(*action) {
                Ok(submission) => {
                    debug!(%action, ?submission, "replayed");
                    report.submitted += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(%action, error = %e, "live server refused a request the trace accepted");
                    report.rejected = Some((*action, e));
                    break;
                }
            }
        }

        if tokio::time::timeout(self.stall_timeout, server.wait_idle())
            .await
            .is_err()
        {
            report.divergences.push(format!(
                "{} requests still outstanding after drain",
                server.outstanding()
            ));
        }
        report.journal = server.take_journal();

        if report.is_success() {
            compare_responses(trace, &mut report);
        }

        let model = CreditFlowModel::for_mode(self.config.grant.mode);
        let mut monitor = ConformanceMonitor::new(model);
        let verdict = monitor
            .replay(&report.journal)
            .and_then(|()| monitor.check_snapshot(&server.snapshot()));
        if let Err(violation) = verdict {
            report.conformance = Some(violation);
        }

        info!(
            submitted = report.submitted,
            journal = report.journal.len(),
            race_flips = report.race_flips,
            success = report.is_success(),
            "trace replay finished"
        );
        Ok(report)
    }

    async fn await_responses(
        &self,
        rx: &mut UnboundedReceiver<Response>,
        delivered: &mut usize,
        target: usize,
    ) -> bool {
        while *delivered < target {
            match tokio::time::timeout(self.stall_timeout, rx.recv()).await {
                Ok(Some(_)) => *delivered += 1,
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }
}

fn responses_by_request(
    actions: &[ProtocolAction],
) -> (BTreeMap<ResponseKey, (u32, ResponseStatus)>, BTreeSet<ResponseKey>) {
    let mut responses = BTreeMap::new();
    let mut cancels = BTreeSet::new();
    let mut epoch = 0;
    for action in actions {
        match *action {
            ProtocolAction::Reset => epoch += 1,
            ProtocolAction::Cancel { id } => {
                cancels.insert((epoch, id));
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
                responses.insert((epoch, id), (granted, status));
            }
            ProtocolAction::ReqSetup { .. } | ProtocolAction::ReqWork { .. } => {}
        }
    }
    (responses, cancels)
}

/// Every response in the trace must have a live counterpart with the same
/// grant. Extra live responses answer requests the trace left outstanding.
fn compare_responses(trace: &[ProtocolAction], report: &mut ReplayReport) {
    let (expected, cancels) = responses_by_request(trace);
    let (live, _) = responses_by_request(&report.journal);

    for (key, &(granted, status)) in &expected {
        let (epoch, id) = *key;
        let Some(&(live_granted, live_status)) = live.get(key) else {
            report
                .divergences
                .push(format!("no live response for {} (epoch {})", id, epoch));
            continue;
        };
        if live_granted != granted {
            report.divergences.push(format!(
                "{} (epoch {}) granted {} live, {} in trace",
                id, epoch, live_granted, granted
            ));
        }
        if live_status != status {
            if cancels.contains(key) {
                debug!(%id, epoch, %status, %live_status, "cancellation race settled differently");
                report.race_flips += 1;
            } else {
                report.divergences.push(format!(
                    "{} (epoch {}) {} live, {} in trace",
                    id, epoch, live_status, status
                ));
            }
        }
    }
}
