//! Cancellation coordinator
//!
//! A cancel marks the request and races the worker to resolve it after a
//! propagation delay. Whoever resolves first produces the only response; the
//! other side finds the entry gone and does nothing.

use super::Shared;
use crate::protocol::{RequestId, ResponseStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub(crate) fn spawn_cancellation(
    shared: Arc<Shared>,
    id: RequestId,
    sequence: u64,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        match shared.settle(id, sequence, ResponseStatus::Cancelled) {
            Some(response) => {
                shared.stats.record_cancelled();
                shared.publish(&response);
            }
            None => {
                trace!(%id, sequence, "cancellation lost the race, request already resolved");
                shared.stats.record_cancel_noop();
            }
        }
    });
}
