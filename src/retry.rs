use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::WorkStore;

/// What the retry policy did with a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending with the incremented count, subject to the cool-down.
    Requeue { retry_count: u32 },
    /// Terminal failed status; needs a manual or reconciler reset.
    DeadLetter { retry_count: u32 },
}

/// Pure decision: requeue while `current + 1 <= max`, dead-letter afterwards.
///
/// An item that always fails is therefore attempted `max + 1` times.
pub fn decide(current_retry_count: u32, max_retry_attempts: u32) -> RetryDecision {
    let retry_count = current_retry_count.saturating_add(1);
    if retry_count <= max_retry_attempts {
        RetryDecision::Requeue { retry_count }
    } else {
        RetryDecision::DeadLetter { retry_count }
    }
}

/// Applies [`decide`] against the stored settings and persists the result.
///
/// Holds no in-memory retry state: everything comes from the item row and the
/// settings table, so decisions survive restarts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    store: WorkStore,
}

impl RetryPolicy {
    pub fn new(store: WorkStore) -> Self {
        Self { store }
    }

    pub async fn on_failure(
        &self,
        item_id: i64,
        worker_id: &str,
        current_retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, StoreError> {
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        let (decision, applied) = self
            .store
            .blocking(move |store| {
                let settings = store.retry_settings()?;
                let decision = decide(current_retry_count, settings.max_retry_attempts);
                let applied = match decision {
                    RetryDecision::Requeue { retry_count } => {
                        store.requeue_for_retry(item_id, &worker_id, retry_count, &error, now)?
                    }
                    RetryDecision::DeadLetter { retry_count } => {
                        store.mark_failed(item_id, &worker_id, retry_count, &error, now)?
                    }
                };
                Ok((decision, applied))
            })
            .await?;

        if !applied {
            tracing::warn!(item_id, "lease lost before failure could be recorded");
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_requeues_within_budget() {
        assert_eq!(decide(0, 3), RetryDecision::Requeue { retry_count: 1 });
        assert_eq!(decide(2, 3), RetryDecision::Requeue { retry_count: 3 });
    }

    #[test]
    fn decide_dead_letters_when_budget_exhausted() {
        assert_eq!(decide(3, 3), RetryDecision::DeadLetter { retry_count: 4 });
        assert_eq!(decide(0, 0), RetryDecision::DeadLetter { retry_count: 1 });
    }
}
