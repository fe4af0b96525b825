//! Credit-flow server
//!
//! Accepts Setup and Work requests, serves each on its own task with a random
//! service delay, and lets any outstanding request be cancelled. Every
//! accepted request gets exactly one response, Completed or Cancelled,
//! carrying the credits granted back to the caller.
//!
//! ## Architecture
//!
//! ```text
//!              submit()                       ┌────────────────┐
//! caller ──► accept / mark cancel ──► Ledger ◄─┤ worker task    │ (Completed)
//!                 (one lock)        (window,   ├────────────────┤
//!                                   registry,  │ cancel task    │ (Cancelled)
//!                                   policy)    └───────┬────────┘
//!                                                      ▼
//!                                          observers.on_response()
//! ```
//!
//! Both tasks resolve through the same sequence-checked claim on the
//! registry entry; the loser is a no-op.
//!
//! Requests spawn Tokio tasks, so `submit` and its shorthands must be called
//! from within a Tokio runtime.

mod cancel;
mod dispatcher;
#[cfg(feature = "simulation")]
pub mod dst;
pub mod latency;
pub mod ledger;
pub mod observer;
pub mod replay;
pub mod stats;

#[cfg(feature = "simulation")]
pub use dst::{
    run_protocol_dst_batch, summarize_protocol_dst_batch, ProtocolDSTConfig, ProtocolDSTHarness,
    ProtocolDSTResult,
};
pub use latency::LatencyModel;
pub use ledger::{Ledger, LedgerSnapshot};
pub use observer::{ChannelObserver, ResponseObserver};
pub use replay::{ReplayReport, TraceReplayer};
pub use stats::{ServerStats, StatsSnapshot};

use crate::config::ServerConfig;
use crate::protocol::{
    Command, GrantPolicy, ProtocolAction, ProtocolError, RequestId, Response, ResponseStatus,
};
use crate::simulator::DeterministicRng;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a successful `submit` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted { id: RequestId, sequence: u64 },
    /// `outstanding` is false when there was nothing to cancel.
    CancelIssued { id: RequestId, outstanding: bool },
    Reset,
}

pub(crate) struct Shared {
    ledger: Mutex<Ledger>,
    latency: Mutex<LatencyModel>,
    observers: RwLock<Vec<Arc<dyn ResponseObserver>>>,
    /// Accepted requests whose response has not reached every observer yet
    undelivered_tx: watch::Sender<usize>,
    pub(crate) stats: ServerStats,
}

impl Shared {
    /// Resolve `(id, sequence)` with `status`. `None` if it was already resolved.
    pub(crate) fn settle(
        &self,
        id: RequestId,
        sequence: u64,
        status: ResponseStatus,
    ) -> Option<Response> {
        let result = self.ledger.lock().settle(id, sequence, status);
        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(%id, sequence, %status, error = %e, "resolution abandoned");
                // A halted ledger answers nothing further
                self.undelivered_tx.send_replace(0);
                None
            }
        }
    }

    /// Hand `response` to every observer, then count it as delivered.
    pub(crate) fn publish(&self, response: &Response) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_response(response);
        }
        self.undelivered_tx
            .send_modify(|undelivered| *undelivered = undelivered.saturating_sub(1));
    }
}

#[derive(Clone)]
pub struct CreditServer {
    shared: Arc<Shared>,
}

impl CreditServer {
    pub fn new(config: ServerConfig) -> Self {
        let mut root = DeterministicRng::new(config.seed);
        let policy = config.grant.mode.build(root.next_u64());
        Self::build(config, policy, root)
    }

    /// Server with a caller-supplied grant policy.
    pub fn with_policy(config: ServerConfig, policy: Box<dyn GrantPolicy>) -> Self {
        let mut root = DeterministicRng::new(config.seed);
        // Keep the latency stream identical to `new` for the same seed
        let _ = root.next_u64();
        Self::build(config, policy, root)
    }

    fn build(
        config: ServerConfig,
        policy: Box<dyn GrantPolicy>,
        mut root: DeterministicRng,
    ) -> Self {
        info!(
            seed = config.seed,
            policy = policy.name(),
            journal = config.journal,
            "credit server created"
        );
        let latency = LatencyModel::new(config.latency.clone(), root.fork());
        let (undelivered_tx, _) = watch::channel(0);
        CreditServer {
            shared: Arc::new(Shared {
                ledger: Mutex::new(Ledger::new(policy, config.journal)),
                latency: Mutex::new(latency),
                observers: RwLock::new(Vec::new()),
                undelivered_tx,
                stats: ServerStats::default(),
            }),
        }
    }

    /// Register a callback invoked once per produced response.
    pub fn register_observer(&self, observer: Arc<dyn ResponseObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Submit a caller-side action: `ReqSetup`, `ReqWork`, `Cancel` or `Reset`.
    pub fn submit(&self, action: ProtocolAction) -> Result<Submission, ProtocolError> {
        let result = match action {
            ProtocolAction::ReqSetup { id, credits } => self.request(Command::Setup, id, credits),
            ProtocolAction::ReqWork { id, credits } => self.request(Command::Work, id, credits),
            ProtocolAction::Cancel { id } => self.cancel(id),
            ProtocolAction::Reset => self.reset().map(|()| Submission::Reset),
            ProtocolAction::ResSetup { .. } | ProtocolAction::ResWork { .. } => {
                Err(ProtocolError::MalformedAction(format!(
                    "{} is a server response, not a request",
                    action
                )))
            }
        };
        if result.is_err() {
            self.shared.stats.record_rejected();
        }
        result
    }

    /// Parse one action in text form and submit it.
    pub fn submit_str(&self, line: &str) -> Result<Submission, ProtocolError> {
        let action: ProtocolAction = line.parse()?;
        self.submit(action)
    }

    pub fn request_setup(&self, id: RequestId, credits: u32) -> Result<Submission, ProtocolError> {
        self.submit(ProtocolAction::ReqSetup { id, credits })
    }

    pub fn request_work(&self, id: RequestId, credits: u32) -> Result<Submission, ProtocolError> {
        self.submit(ProtocolAction::ReqWork { id, credits })
    }

    fn request(
        &self,
        command: Command,
        id: RequestId,
        credits: u32,
    ) -> Result<Submission, ProtocolError> {
        let entry = {
            let mut ledger = self.shared.ledger.lock();
            let entry = ledger.accept(command, id, credits);
            if entry.is_ok() {
                self.shared.undelivered_tx.send_modify(|undelivered| *undelivered += 1);
            }
            entry
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(%id, %command, credits, error = %e, "request rejected");
                return Err(e);
            }
        };

        self.shared.stats.record_accepted();
        let sequence = entry.sequence;
        let delay = self.shared.latency.lock().work_delay();
        dispatcher::dispatch(Arc::clone(&self.shared), entry, delay);
        Ok(Submission::Accepted { id, sequence })
    }

    /// Best-effort cancel. Always accepted; a no-op when `id` is not outstanding.
    pub fn cancel(&self, id: RequestId) -> Result<Submission, ProtocolError> {
        let sequence = self.shared.ledger.lock().mark_cancel_requested(id)?;
        match sequence {
            Some(sequence) => {
                let delay = self.shared.latency.lock().cancel_delay();
                debug!(%id, sequence, ?delay, "cancellation started");
                cancel::spawn_cancellation(Arc::clone(&self.shared), id, sequence, delay);
                Ok(Submission::CancelIssued {
                    id,
                    outstanding: true,
                })
            }
            None => {
                debug!(%id, "cancel for request that is not outstanding");
                self.shared.stats.record_cancel_noop();
                Ok(Submission::CancelIssued {
                    id,
                    outstanding: false,
                })
            }
        }
    }

    /// Return to idle. Fails with `Busy` while requests are outstanding.
    pub fn reset(&self) -> Result<(), ProtocolError> {
        self.shared.ledger.lock().reset()?;
        self.shared.stats.record_reset();
        info!("server reset to idle");
        Ok(())
    }

    /// Wait until every accepted request has been answered and its response
    /// handed to all registered observers.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.undelivered_tx.subscribe();
        // Sender lives in `shared`, which we hold, so this cannot fail
        let _ = rx.wait_for(|undelivered| *undelivered == 0).await;
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.shared.ledger.lock().snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Actions applied so far, in ledger order. Empty unless journaling is on.
    pub fn take_journal(&self) -> Vec<ProtocolAction> {
        self.shared.ledger.lock().take_journal()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.ledger.lock().outstanding()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.ledger.lock().is_halted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatencyConfig;
    use crate::protocol::{FullGrant, GrantMode, Phase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn collecting(server: &CreditServer) -> Arc<Mutex<Vec<Response>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.register_observer(Arc::new(move |r: &Response| sink.lock().push(r.clone())));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_then_work() {
        let server = CreditServer::new(ServerConfig::deterministic());
        let seen = collecting(&server);

        server.request_setup(RequestId(0), 2).unwrap();
        server.wait_idle().await;
        assert_eq!(server.snapshot().phase, Phase::Active);

        server.request_work(RequestId(1), 1).unwrap();
        server.request_work(RequestId(2), 1).unwrap();
        server.wait_idle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r.status == ResponseStatus::Completed));
        assert_eq!(server.stats().completed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_idle_covers_observer_delivery() {
        let config = ServerConfig {
            latency: LatencyConfig::fixed(Duration::from_millis(1), Duration::from_millis(1)),
            ..ServerConfig::deterministic()
        };
        let server = CreditServer::new(config);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        server.register_observer(Arc::new(move |_: &Response| {
            // Slow observer, resolution finishes well before delivery
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        server.request_setup(RequestId(0), 8).unwrap();
        server.wait_idle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        for id in 1..=8 {
            server.request_work(RequestId(id), 1).unwrap();
        }
        server.wait_idle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 9);
        assert_eq!(server.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_action_rejected_as_request() {
        let server = CreditServer::new(ServerConfig::deterministic());
        let err = server.submit_str("ResSetup(0,1,Completed)").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedAction(_)));
        assert_eq!(server.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_silent() {
        let server = CreditServer::new(ServerConfig::deterministic());
        let seen = collecting(&server);

        server.request_setup(RequestId(0), 1).unwrap();
        server.wait_idle().await;
        assert_eq!(
            server.cancel(RequestId(0)).unwrap(),
            Submission::CancelIssued {
                id: RequestId(0),
                outstanding: false
            }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(server.stats().cancel_noops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_observer_receives_response() {
        let server =
            CreditServer::new(ServerConfig::test(3).with_grant_mode(GrantMode::Full));
        let (observer, mut rx) = ChannelObserver::new();
        server.register_observer(Arc::new(observer));

        server.request_setup(RequestId(0), 4).unwrap();
        let response = rx.recv().await.unwrap();
        assert_eq!(response.id, RequestId(0));
        assert_eq!(response.granted_credits, 4);
        assert_eq!(response.sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_same_outcomes() {
        async fn run(seed: u64) -> Vec<ProtocolAction> {
            let server = CreditServer::new(ServerConfig::test(seed));
            server.request_setup(RequestId(0), 3).unwrap();
            server.wait_idle().await;
            let window: Vec<_> = server.snapshot().window.into_iter().collect();
            for id in window {
                let _ = server.request_work(id, 2);
                if id.0 % 2 == 0 {
                    server.cancel(id).unwrap();
                }
            }
            server.wait_idle().await;
            server.take_journal()
        }

        assert_eq!(run(11).await, run(11).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_policy_keeps_latency_stream() {
        async fn run(server: CreditServer) -> Vec<ProtocolAction> {
            server.request_setup(RequestId(0), 4).unwrap();
            server.wait_idle().await;
            for id in 1..=4 {
                server.request_work(RequestId(id), 1).unwrap();
                if id % 2 == 1 {
                    server.cancel(RequestId(id)).unwrap();
                }
            }
            server.wait_idle().await;
            server.take_journal()
        }

        let config = ServerConfig::test(21).with_grant_mode(GrantMode::Full);
        let built = run(CreditServer::new(config.clone())).await;
        let supplied = run(CreditServer::with_policy(config, Box::new(FullGrant))).await;
        assert_eq!(built, supplied);
    }
}
