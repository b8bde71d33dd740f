use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::store::WorkStore;
use crate::types::WorkItem;

/// Finds items whose lease outlived the stuck threshold, and failed items that
/// still have retry budget, and returns them to the claimable pool.
///
/// Resets are not throttled by the retry cool-down: a reset item is claimable
/// on the next poll.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: WorkStore,
}

impl Reconciler {
    pub fn new(store: WorkStore) -> Self {
        Self { store }
    }

    pub async fn detect(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, StoreError> {
        self.store
            .blocking(move |store| {
                let settings = store.retry_settings()?;
                let cutoff = i64::try_from(settings.stuck_threshold_minutes)
                    .ok()
                    .and_then(chrono::Duration::try_minutes)
                    .and_then(|threshold| now.checked_sub_signed(threshold))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                store.find_stuck(cutoff, settings.max_retry_attempts)
            })
            .await
    }

    /// Reset items returned by [`detect`](Self::detect). An item whose row
    /// changed since detection (finished, or leased again) is left alone.
    /// Returns the ids actually reset.
    pub async fn reset(&self, items: &[WorkItem]) -> Result<Vec<i64>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let detected = items.to_vec();
        let reset = self
            .store
            .blocking(move |store| store.reset_detected(&detected))
            .await?;
        if reset.len() < items.len() {
            tracing::debug!(
                skipped = items.len() - reset.len(),
                "items changed since detection, not reset"
            );
        }
        log_reset(&reset);
        Ok(reset)
    }

    /// Operator reset: return `ids` to the pool regardless of lease state.
    pub async fn reset_ids(&self, ids: Vec<i64>) -> Result<Vec<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reset = self
            .store
            .blocking(move |store| store.reset_items(&ids))
            .await?;
        log_reset(&reset);
        Ok(reset)
    }

    /// Detect and reset in one pass.
    pub async fn reset_stuck(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let stuck = self.detect(now).await?;
        if stuck.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = stuck.len(), "stuck items detected");
        self.reset(&stuck).await
    }

    /// Periodic pass until `cancel` fires. Store errors are logged and retried next tick.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.reset_stuck(Utc::now()).await {
                tracing::warn!(error = %e, "reconcile pass failed");
            }
        }
        tracing::info!("reconciler stopped");
    }
}

fn log_reset(ids: &[i64]) {
    for id in ids {
        tracing::info!(item_id = *id, "item reset to pending");
    }
}
