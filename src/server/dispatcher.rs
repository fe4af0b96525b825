//! Worker dispatcher
//!
//! One task per accepted request. After its service delay the worker tries to
//! resolve the request; if a cancellation got there first it stands down.

use super::Shared;
use crate::protocol::{RegistryEntry, ResponseStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub(crate) fn dispatch(shared: Arc<Shared>, entry: RegistryEntry, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let id = entry.request.id;
        match shared.settle(id, entry.sequence, ResponseStatus::Completed) {
            Some(response) => {
                shared.stats.record_completed();
                shared.publish(&response);
            }
            None => {
                trace!(
                    %id,
                    sequence = entry.sequence,
                    "worker stands down, request already resolved"
                );
                shared.stats.record_worker_standdown();
            }
        }
    });
}
