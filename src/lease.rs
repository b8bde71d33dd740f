use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::{ClaimWindow, WorkStore};
use crate::types::{Stage, WorkItem};

/// Implements the claim/expire contract on top of the work store.
///
/// An item is claimable when it is pending in the requested stage and either
/// unassigned or its lease is older than `lease_timeout`. Each claim is a
/// single guarded update; losing a race to another claimer is silent.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: WorkStore,
    lease_timeout: Duration,
}

impl LeaseManager {
    pub fn new(store: WorkStore, lease_timeout: Duration) -> Self {
        Self {
            store,
            lease_timeout,
        }
    }

    /// Claim up to `limit` items for `worker_id`.
    ///
    /// `retry_timeout` is the policy cool-down: an item re-queued by the retry
    /// policy less than `retry_timeout` ago is not eligible. Returns only the
    /// items actually won. A store failure yields an empty batch.
    pub async fn claim(
        &self,
        stage: Stage,
        limit: usize,
        worker_id: &str,
        retry_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<WorkItem> {
        if limit == 0 {
            return Vec::new();
        }
        let window = ClaimWindow {
            now,
            lease_timeout: self.lease_timeout,
            retry_timeout,
        };
        let worker_id = worker_id.to_string();
        let result = self
            .store
            .blocking(move |store| claim_batch(store, stage, limit, &worker_id, &window))
            .await;

        match result {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(stage = %stage, error = %e, "claim failed, treating as no work");
                Vec::new()
            }
        }
    }

    /// Clear the lease after the outcome has been persisted. Idempotent.
    pub async fn release(
        &self,
        item_id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let worker_id = worker_id.to_string();
        self.store
            .blocking(move |store| store.release(item_id, &worker_id, now))
            .await
    }
}

fn claim_batch(
    store: &WorkStore,
    stage: Stage,
    limit: usize,
    worker_id: &str,
    window: &ClaimWindow,
) -> Result<Vec<WorkItem>, StoreError> {
    let candidates = store.claimable_ids(stage, limit, window)?;
    let mut won = Vec::with_capacity(candidates.len());
    for id in candidates {
        match store.claim_item(id, stage, worker_id, window) {
            Ok(Some(item)) => won.push(item),
            Ok(None) => {
                tracing::debug!(stage = %stage, item_id = id, "lost claim race, skipping");
            }
            // Busy rows count as lost races.
            Err(e) if e.is_retryable() => {
                tracing::debug!(stage = %stage, item_id = id, error = %e, "claim contention, skipping");
            }
            Err(e) if won.is_empty() => return Err(e),
            Err(e) => {
                tracing::warn!(stage = %stage, item_id = id, error = %e, "claim failed mid-batch");
                break;
            }
        }
    }
    Ok(won)
}
