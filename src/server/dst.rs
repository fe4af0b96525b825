//! Deterministic Simulation Testing for the credit-flow server
//!
//! Runs the real server on a paused, single-threaded Tokio runtime, so the
//! only source of interleaving is the seeded latency model and the driver's
//! own seeded choices. Given the same seed, a run takes the same path.
//!
//! ## Checks per run
//!
//! - Exactly one response per accepted request (keyed by acceptance sequence)
//! - Granted credits never exceed the credits requested at acceptance
//! - Rejected requests leave the ledger untouched
//! - `Busy` exactly when something is outstanding
//! - No starvation, when the grant policy guards against it
//! - The ledger journal replays through `ConformanceMonitor`, and the model's
//!   final state matches the server's
//!
//! ## Usage
//!
//! ```rust,ignore
//! for seed in 0..100 {
//!     let mut harness = ProtocolDSTHarness::new(ProtocolDSTConfig::new(seed));
//!     let result = harness.run();
//!     assert!(result.is_success(), "{}", result.summary());
//! }
//! ```

use super::{CreditServer, Submission};
use crate::config::{GrantConfig, LatencyConfig, ServerConfig};
use crate::model::{ConformanceMonitor, CreditFlowModel};
use crate::protocol::{
    GrantMode, Phase, ProtocolAction, ProtocolError, RequestId, Response, ResponseStatus,
};
use crate::simulator::DeterministicRng;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for protocol DST
#[derive(Debug, Clone)]
pub struct ProtocolDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Driver steps per run
    pub steps: usize,
    pub grant_mode: GrantMode,
    /// Largest credit count the driver asks for
    pub max_credits: u32,
    pub cancel_prob: f64,
    pub reset_prob: f64,
    /// Probability of a deliberately invalid request
    pub invalid_prob: f64,
    /// Upper bound on the driver's pause between steps
    pub max_pause: Duration,
    pub latency: LatencyConfig,
}

impl Default for ProtocolDSTConfig {
    fn default() -> Self {
        ProtocolDSTConfig {
            seed: 0,
            steps: 200,
            grant_mode: GrantMode::Clamped,
            max_credits: 3,
            cancel_prob: 0.25,
            reset_prob: 0.05,
            invalid_prob: 0.1,
            max_pause: Duration::from_millis(10),
            latency: LatencyConfig::test(),
        }
    }
}

impl ProtocolDSTConfig {
    pub fn new(seed: u64) -> Self {
        ProtocolDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Cancels on most steps, with cancellation faster than service on average
    pub fn cancel_heavy(seed: u64) -> Self {
        ProtocolDSTConfig {
            seed,
            cancel_prob: 0.6,
            latency: LatencyConfig {
                work_min: Duration::from_millis(5),
                work_max: Duration::from_millis(30),
                cancel_min: Duration::from_millis(1),
                cancel_max: Duration::from_millis(15),
            },
            ..Default::default()
        }
    }

    /// Unguarded random grants: starvation is expected and recovered by reset
    pub fn faithful(seed: u64) -> Self {
        ProtocolDSTConfig {
            seed,
            grant_mode: GrantMode::Random,
            ..Default::default()
        }
    }

    /// Every request granted in full, small pauses, lots of concurrency
    pub fn full_grant(seed: u64) -> Self {
        ProtocolDSTConfig {
            seed,
            grant_mode: GrantMode::Full,
            max_credits: 2,
            cancel_prob: 0.2,
            reset_prob: 0.02,
            max_pause: Duration::from_millis(3),
            ..Default::default()
        }
    }
}

/// Result of a protocol DST run
#[derive(Debug, Clone, Default)]
pub struct ProtocolDSTResult {
    pub seed: u64,
    pub steps: usize,
    pub accepted: u64,
    pub expected_rejections: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub cancels_issued: u64,
    pub resets: u64,
    pub busy_resets: u64,
    pub starvations: u64,
    pub max_outstanding: usize,
    pub journal_len: usize,
    pub invariant_violations: Vec<String>,
}

impl ProtocolDSTResult {
    pub fn new(seed: u64) -> Self {
        ProtocolDSTResult {
            seed,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    fn violation(&mut self, message: String) {
        self.invariant_violations.push(message);
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Seed {}: {} steps, {} accepted, {} completed, {} cancelled, {} cancels, \
             {} resets ({} busy), {} rejections, {} starvations, max outstanding {}, journal {}",
            self.seed,
            self.steps,
            self.accepted,
            self.completed,
            self.cancelled,
            self.cancels_issued,
            self.resets,
            self.busy_resets,
            self.expected_rejections,
            self.starvations,
            self.max_outstanding,
            self.journal_len,
        );
        for v in self.invariant_violations.iter().take(5) {
            summary.push_str(&format!("\n  VIOLATION: {}", v));
        }
        summary
    }
}

/// Protocol DST harness
pub struct ProtocolDSTHarness {
    config: ProtocolDSTConfig,
    rng: DeterministicRng,
}

impl ProtocolDSTHarness {
    pub fn new(config: ProtocolDSTConfig) -> Self {
        let rng = DeterministicRng::new(config.seed);
        ProtocolDSTHarness { config, rng }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(ProtocolDSTConfig::new(seed))
    }

    /// Run one scenario to completion on a fresh paused runtime.
    pub fn run(&mut self) -> ProtocolDSTResult {
        let mut result = ProtocolDSTResult::new(self.config.seed);
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                result.violation(format!("failed to build runtime: {}", e));
                return result;
            }
        };
        runtime.block_on(self.drive(&mut result));
        result
    }

    async fn drive(&mut self, result: &mut ProtocolDSTResult) {
        let server_config = ServerConfig {
            seed: self.rng.next_u64(),
            journal: true,
            grant: GrantConfig {
                mode: self.config.grant_mode,
            },
            latency: self.config.latency.clone(),
        };
        let server = CreditServer::new(server_config);

        let responses: Arc<Mutex<Vec<Response>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&responses);
        server.register_observer(Arc::new(move |r: &Response| sink.lock().push(r.clone())));

        // sequence -> (id, requested credits)
        let mut accepted: BTreeMap<u64, (RequestId, u32)> = BTreeMap::new();

        for _ in 0..self.config.steps {
            result.steps += 1;
            self.step(&server, &mut accepted, result);
            if server.is_halted() {
                result.violation("server halted after fatal error".to_string());
                break;
            }
            result.max_outstanding = result.max_outstanding.max(server.outstanding());

            let pause = self
                .rng
                .gen_range_inclusive(0, self.config.max_pause.as_micros() as u64);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }

        if tokio::time::timeout(Duration::from_secs(60), server.wait_idle())
            .await
            .is_err()
        {
            result.violation(format!(
                "server did not drain: {} request(s) still outstanding",
                server.outstanding()
            ));
            return;
        }

        let responses = responses.lock().clone();
        self.check_responses(&accepted, &responses, result);
        self.check_conformance(&server, responses.len(), result);

        let stats = server.stats();
        result.completed = stats.completed;
        result.cancelled = stats.cancelled;
        if stats.responses() != responses.len() as u64 {
            result.violation(format!(
                "stats count {} responses, observer saw {}",
                stats.responses(),
                responses.len()
            ));
        }
    }

    fn step(
        &mut self,
        server: &CreditServer,
        accepted: &mut BTreeMap<u64, (RequestId, u32)>,
        result: &mut ProtocolDSTResult,
    ) {
        let snap = server.snapshot();

        if snap.is_starved() {
            result.starvations += 1;
            if self.config.grant_mode.guards_starvation() {
                result.violation(format!(
                    "starved: empty window and nothing outstanding under {:?} grants",
                    self.config.grant_mode
                ));
            }
            // Reset is the only way forward
            self.reset(server, true, result);
            return;
        }

        if self.rng.gen_bool(self.config.invalid_prob) {
            self.invalid_request(server, result);
            return;
        }

        if self.rng.gen_bool(self.config.cancel_prob) {
            let target = match self.rng.choose(&snap.outstanding) {
                Some(pending) if self.rng.gen_bool(0.8) => pending.id,
                _ => RequestId(self.rng.gen_range_inclusive(0, snap.max_issued_id + 2)),
            };
            match server.cancel(target) {
                Ok(_) => result.cancels_issued += 1,
                Err(e) => result.violation(format!("cancel({}) failed: {}", target, e)),
            }
            return;
        }

        if self.rng.gen_bool(self.config.reset_prob) {
            self.reset(server, snap.is_idle(), result);
            return;
        }

        let window: Vec<RequestId> = snap.window.iter().copied().collect();
        let Some(&id) = self.rng.choose(&window) else {
            return;
        };
        let credits = self.rng.gen_range_inclusive(1, u64::from(self.config.max_credits)) as u32;
        let action = match snap.phase {
            Phase::Inactive => ProtocolAction::ReqSetup { id, credits },
            Phase::Active => ProtocolAction::ReqWork { id, credits },
            // Setup in flight, nothing is legal yet
            Phase::Activating => return,
        };

        match server.submit(action) {
            Ok(Submission::Accepted { sequence, .. }) => {
                result.accepted += 1;
                if accepted.insert(sequence, (id, credits)).is_some() {
                    result.violation(format!("sequence {} handed out twice", sequence));
                }
            }
            Ok(other) => result.violation(format!("{} answered with {:?}", action, other)),
            Err(e) => result.violation(format!("legal {} rejected: {}", action, e)),
        }
    }

    fn invalid_request(&mut self, server: &CreditServer, result: &mut ProtocolDSTResult) {
        let before = server.snapshot();
        let (action, expect_credit_error) = if self.rng.gen_bool(0.5) || before.window.is_empty() {
            // Id beyond anything issued
            let id = RequestId(before.max_issued_id + 1 + self.rng.gen_range(0, 3));
            (ProtocolAction::ReqSetup { id, credits: 1 }, false)
        } else {
            let id = *before.window.iter().next().unwrap_or(&RequestId(0));
            (ProtocolAction::ReqWork { id, credits: 0 }, true)
        };

        match server.submit(action) {
            Err(ProtocolError::InvalidCreditCount { .. }) if expect_credit_error => {}
            Err(ProtocolError::DuplicateId(_)) | Err(ProtocolError::OutOfPhase { .. })
                if !expect_credit_error => {}
            other => {
                result.violation(format!("invalid {} answered with {:?}", action, other));
                return;
            }
        }
        result.expected_rejections += 1;

        if server.snapshot() != before {
            result.violation(format!("rejected {} changed the ledger", action));
        }
    }

    fn reset(&mut self, server: &CreditServer, idle: bool, result: &mut ProtocolDSTResult) {
        match (server.reset(), idle) {
            (Ok(()), true) => result.resets += 1,
            (Err(ProtocolError::Busy { .. }), false) => result.busy_resets += 1,
            (outcome, _) => result.violation(format!(
                "reset with idle={} answered with {:?}",
                idle, outcome
            )),
        }
    }

    fn check_responses(
        &self,
        accepted: &BTreeMap<u64, (RequestId, u32)>,
        responses: &[Response],
        result: &mut ProtocolDSTResult,
    ) {
        let mut seen: BTreeMap<u64, usize> = BTreeMap::new();
        for response in responses {
            *seen.entry(response.sequence).or_insert(0) += 1;

            match accepted.get(&response.sequence) {
                Some(&(id, requested)) => {
                    if id != response.id {
                        result.violation(format!(
                            "response for sequence {} names id {}, accepted as {}",
                            response.sequence, response.id, id
                        ));
                    }
                    if response.granted_credits > requested {
                        result.violation(format!(
                            "response {} granted {} of {} requested credits",
                            response.id, response.granted_credits, requested
                        ));
                    }
                }
                None => result.violation(format!(
                    "response for unknown sequence {} (id {})",
                    response.sequence, response.id
                )),
            }
        }

        for (sequence, (id, _)) in accepted {
            match seen.get(sequence).copied().unwrap_or(0) {
                1 => {}
                0 => result.violation(format!(
                    "request {} (sequence {}) never answered",
                    id, sequence
                )),
                n => result.violation(format!(
                    "request {} (sequence {}) answered {} times",
                    id, sequence, n
                )),
            }
        }
    }

    fn check_conformance(
        &self,
        server: &CreditServer,
        response_count: usize,
        result: &mut ProtocolDSTResult,
    ) {
        let journal = server.take_journal();
        result.journal_len = journal.len();

        let journaled_responses = journal.iter().filter(|a| !a.is_request()).count();
        if journaled_responses != response_count {
            result.violation(format!(
                "journal holds {} responses, observer saw {}",
                journaled_responses, response_count
            ));
        }
        let cancelled_in_journal = journal
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    ProtocolAction::ResSetup { status: ResponseStatus::Cancelled, .. }
                        | ProtocolAction::ResWork { status: ResponseStatus::Cancelled, .. }
                )
            })
            .count();
        if cancelled_in_journal > 0 && result.cancels_issued == 0 {
            result.violation("cancelled responses without any cancel issued".to_string());
        }

        let mut monitor =
            ConformanceMonitor::new(CreditFlowModel::for_mode(self.config.grant_mode));
        if let Err(e) = monitor.replay(&journal) {
            result.violation(format!("conformance: {}", e));
            return;
        }
        if let Err(e) = monitor.check_snapshot(&server.snapshot()) {
            result.violation(format!("conformance: {}", e));
        }
    }
}

/// Run `count` seeds starting at `start_seed`, building each config with `make_config`
pub fn run_protocol_dst_batch<F>(
    start_seed: u64,
    count: usize,
    make_config: F,
) -> Vec<ProtocolDSTResult>
where
    F: Fn(u64) -> ProtocolDSTConfig,
{
    (0..count as u64)
        .map(|i| {
            let mut harness = ProtocolDSTHarness::new(make_config(start_seed + i));
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_protocol_dst_batch(results: &[ProtocolDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;

    let accepted: u64 = results.iter().map(|r| r.accepted).sum();
    let completed: u64 = results.iter().map(|r| r.completed).sum();
    let cancelled: u64 = results.iter().map(|r| r.cancelled).sum();
    let starvations: u64 = results.iter().map(|r| r.starvations).sum();

    let mut summary = format!(
        "Protocol DST Batch: {}/{} passed ({} failed)\n\
         Accepted: {}, Completed: {}, Cancelled: {}, Starvations: {}",
        passed, total, failed, accepted, completed, cancelled, starvations
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("\n{}", r.summary()));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_dst_single_seed() {
        let mut harness = ProtocolDSTHarness::with_seed(42);
        let result = harness.run();
        assert!(result.is_success(), "{}", result.summary());
        assert!(result.accepted > 0);
        assert_eq!(result.completed + result.cancelled, result.accepted);
    }

    #[test]
    fn test_protocol_dst_deterministic_replay() {
        let a = ProtocolDSTHarness::with_seed(7).run();
        let b = ProtocolDSTHarness::with_seed(7).run();
        assert_eq!(a.summary(), b.summary());
    }

    #[test]
    fn test_protocol_dst_small_batch() {
        let results = run_protocol_dst_batch(0, 10, ProtocolDSTConfig::new);
        let summary = summarize_protocol_dst_batch(&results);
        assert!(summary.contains("10/10 passed"), "{}", summary);
    }
}
