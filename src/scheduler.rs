use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::executor::{AgentExecutor, ContextBuilder, ExecutionOutcome};
use crate::lease::LeaseManager;
use crate::metrics::MetricsCollector;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::WorkStore;
use crate::transition;
use crate::types::{FallbackEvent, Stage, StageConfig, WorkItem};

/// What a single poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Paused,
    /// Every worker slot is occupied.
    NoSlots,
    /// Nothing claimable.
    Idle,
    /// Settings could not be read; the cycle was skipped.
    StoreUnavailable,
    /// A batch was claimed and fully processed.
    Processed { succeeded: usize, failed: usize },
}

// --- In-flight accounting ---

/// Decrements the owning scheduler's in-flight count on drop.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn instance_tag() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}.{}.{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        seq
    )
}

// --- Item processing ---

/// Runs one claimed item through context, executor, and outcome persistence.
struct ItemProcessor<E> {
    stage: Stage,
    store: WorkStore,
    leases: LeaseManager,
    retry: RetryPolicy,
    context: ContextBuilder,
    metrics: MetricsCollector,
    executor: Arc<E>,
}

impl<E> Clone for ItemProcessor<E> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            store: self.store.clone(),
            leases: self.leases.clone(),
            retry: self.retry.clone(),
            context: self.context.clone(),
            metrics: self.metrics.clone(),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<E: AgentExecutor + 'static> ItemProcessor<E> {
    /// Returns whether the executor reported success.
    ///
    /// `settled` is set once outcome handling begins, so a later panic is not
    /// recorded a second time.
    async fn process(&self, item: WorkItem, worker_id: &str, settled: &AtomicBool) -> bool {
        let stage = self.stage;
        let started = Instant::now();
        tracing::debug!(stage = %stage, item_id = item.id, worker_id, "dispatching item");

        let result = match self.context.build(item.id, stage).await {
            Ok(context) => self.executor.execute(&item, &context).await,
            Err(e) => Err(format!("Failed to build stage context: {}", e)),
        };
        let duration = started.elapsed();
        let now = Utc::now();
        settled.store(true, Ordering::SeqCst);

        match result {
            Ok(outcome) if outcome.success => {
                if let Some(declared) = outcome.next_stage {
                    if let Err(e) = transition::validate_declared_stage(declared) {
                        self.fail(&item, worker_id, &e, outcome.usage_units, duration, now)
                            .await;
                        return false;
                    }
                }
                self.complete(&item, worker_id, outcome, duration, now).await;
                true
            }
            Ok(outcome) => {
                let error = outcome.error_message();
                self.fail(&item, worker_id, &error, outcome.usage_units, duration, now)
                    .await;
                false
            }
            Err(error) => {
                self.fail(&item, worker_id, &error, 0, duration, now).await;
                false
            }
        }
    }

    async fn complete(
        &self,
        item: &WorkItem,
        worker_id: &str,
        outcome: ExecutionOutcome,
        duration: Duration,
        now: DateTime<Utc>,
    ) {
        let stage = self.stage;
        let item_id = item.id;
        let next = transition::resolve(stage, &outcome);
        self.metrics.record(stage, true, duration, outcome.usage_units);

        let (payload, fallback) = match outcome.payload {
            Some(payload) => (payload, None),
            None => {
                let reason = "success reported without a result payload".to_string();
                let payload = serde_json::json!({
                    "fallback": true,
                    "reason": reason,
                    "next_stage": next,
                    "writes_succeeded": outcome.writes_succeeded,
                    "writes_failed": outcome.writes_failed,
                });
                let event = FallbackEvent {
                    item_id,
                    stage,
                    reason,
                    successful_writes: outcome.writes_succeeded,
                    failed_writes: outcome.writes_failed,
                    created_at: now,
                };
                (payload, Some(event))
            }
        };
        if fallback.is_some() {
            tracing::warn!(stage = %stage, item_id, "no result payload, synthesizing fallback result");
        }

        let owner = worker_id.to_string();
        let persisted = self
            .store
            .blocking(move |store| {
                store.append_result(item_id, stage, &payload, true, None, duration, now)?;
                if let Some(event) = &fallback {
                    store.record_fallback(event)?;
                }
                store.apply_transition(item_id, &owner, next, now)
            })
            .await;

        match persisted {
            Ok(true) => {
                tracing::info!(stage = %stage, item_id, next_stage = %next, "item advanced");
            }
            Ok(false) => {
                tracing::warn!(stage = %stage, item_id, "lease lost before transition could be applied");
            }
            Err(e) => {
                tracing::error!(stage = %stage, item_id, error = %e, "failed to persist outcome");
            }
        }
        self.release(item_id, worker_id).await;
    }

    async fn fail(
        &self,
        item: &WorkItem,
        worker_id: &str,
        error: &str,
        usage_units: u64,
        duration: Duration,
        now: DateTime<Utc>,
    ) {
        let stage = self.stage;
        let item_id = item.id;
        self.metrics.record(stage, false, duration, usage_units);

        match self
            .retry
            .on_failure(item_id, worker_id, item.retry_count, error, now)
            .await
        {
            Ok(RetryDecision::Requeue { retry_count }) => {
                tracing::info!(stage = %stage, item_id, retry_count, error, "item requeued for retry");
            }
            Ok(RetryDecision::DeadLetter { retry_count }) => {
                tracing::warn!(stage = %stage, item_id, retry_count, error, "retries exhausted, item failed");
            }
            Err(e) => {
                tracing::error!(stage = %stage, item_id, error = %e, "failed to apply retry policy");
            }
        }

        let error_text = error.to_string();
        let payload = serde_json::json!({ "error": error_text });
        let appended = self
            .store
            .blocking(move |store| {
                store.append_result(
                    item_id,
                    stage,
                    &payload,
                    false,
                    Some(&error_text),
                    duration,
                    now,
                )
            })
            .await;
        if let Err(e) = appended {
            tracing::error!(stage = %stage, item_id, error = %e, "failed to record processing result");
        }
        self.release(item_id, worker_id).await;
    }

    /// Handle an item whose task aborted. Runs the failure path only if the
    /// outcome was not already being recorded; otherwise just drops the lease.
    async fn recover_aborted(&self, item: &WorkItem, worker_id: &str, settled: bool, error: &str) {
        if settled {
            tracing::error!(stage = %self.stage, item_id = item.id, error, "task aborted after outcome was recorded");
            self.release(item.id, worker_id).await;
        } else {
            self.fail(item, worker_id, error, 0, Duration::ZERO, Utc::now())
                .await;
        }
    }

    async fn release(&self, item_id: i64, worker_id: &str) {
        if let Err(e) = self.leases.release(item_id, worker_id, Utc::now()).await {
            tracing::warn!(stage = %self.stage, item_id, error = %e, "lease release failed");
        }
    }
}

// --- Stage scheduler ---

/// Poll/claim/dispatch loop for one stage.
///
/// Each cycle re-reads the stage's config row and the retry settings, claims
/// up to the free worker slots, runs the batch concurrently and waits for all
/// of it before the next cycle. Stopping cancels the inter-poll sleep only;
/// a batch in progress always drains.
pub struct StageScheduler<E> {
    stage: Stage,
    store: WorkStore,
    leases: LeaseManager,
    processor: ItemProcessor<E>,
    defaults: StageConfig,
    instance: String,
    next_worker: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl<E: AgentExecutor + 'static> StageScheduler<E> {
    /// `defaults` is used when the store has no config row for `stage`.
    pub fn new(
        stage: Stage,
        store: WorkStore,
        executor: Arc<E>,
        metrics: MetricsCollector,
        lease_timeout: Duration,
        defaults: StageConfig,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), lease_timeout);
        let processor = ItemProcessor {
            stage,
            store: store.clone(),
            leases: leases.clone(),
            retry: RetryPolicy::new(store.clone()),
            context: ContextBuilder::new(store.clone()),
            metrics,
            executor,
        };
        Self {
            stage,
            store,
            leases,
            processor,
            defaults,
            instance: instance_tag(),
            next_worker: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Items currently being processed by this scheduler.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A handle to the in-flight count that outlives borrows of the scheduler.
    pub fn in_flight_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    fn next_worker_id(&self) -> String {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        format!("{}-worker-{}@{}", self.stage, n, self.instance)
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(stage = %self.stage, "stage scheduler started");
        let mut poll_count: u64 = 0;

        while !cancel.is_cancelled() {
            poll_count += 1;
            let (outcome, poll_interval) = self.run_cycle().await;
            tracing::debug!(stage = %self.stage, poll_count, ?outcome, "poll cycle finished");

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!(stage = %self.stage, "stage scheduler stopped");
    }

    /// One full cycle. Returns what happened and how long to sleep before the next.
    pub async fn run_cycle(&self) -> (CycleOutcome, Duration) {
        let stage = self.stage;
        let snapshot = self
            .store
            .blocking(move |store| Ok((store.stage_config(stage)?, store.retry_settings()?)))
            .await;

        let (config, settings) = match snapshot {
            Ok((config, settings)) => (config.unwrap_or_else(|| self.defaults.clone()), settings),
            Err(e) => {
                tracing::warn!(stage = %stage, error = %e, "settings unavailable, skipping cycle");
                return (
                    CycleOutcome::StoreUnavailable,
                    poll_interval(self.defaults.poll_interval_secs),
                );
            }
        };
        let sleep = poll_interval(config.poll_interval_secs);

        if config.is_paused {
            tracing::debug!(stage = %stage, "stage paused");
            return (CycleOutcome::Paused, sleep);
        }

        let free_slots = (config.max_concurrent as usize).saturating_sub(self.in_flight());
        if free_slots == 0 {
            return (CycleOutcome::NoSlots, sleep);
        }

        let worker_id = self.next_worker_id();
        let items = self
            .leases
            .claim(
                stage,
                free_slots,
                &worker_id,
                Duration::from_secs(settings.retry_timeout_seconds),
                Utc::now(),
            )
            .await;
        if items.is_empty() {
            return (CycleOutcome::Idle, sleep);
        }

        tracing::info!(stage = %stage, count = items.len(), free_slots, %worker_id, "claimed batch");
        let (succeeded, failed) = self.dispatch(items, &worker_id).await;
        tracing::info!(stage = %stage, succeeded, failed, "batch complete");

        (CycleOutcome::Processed { succeeded, failed }, sleep)
    }

    /// Process every item concurrently and wait for all of them.
    async fn dispatch(&self, items: Vec<WorkItem>, worker_id: &str) -> (usize, usize) {
        let mut join_set: JoinSet<bool> = JoinSet::new();

        for item in items {
            let guard = InFlightGuard::acquire(&self.in_flight);
            let processor = self.processor.clone();
            let worker_id = worker_id.to_string();

            join_set.spawn(async move {
                let _guard = guard;
                let inner = processor.clone();
                let inner_item = item.clone();
                let inner_worker = worker_id.clone();
                let settled = Arc::new(AtomicBool::new(false));
                let inner_settled = Arc::clone(&settled);
                let handle = tokio::spawn(async move {
                    inner
                        .process(inner_item, &inner_worker, &inner_settled)
                        .await
                });

                match handle.await {
                    Ok(success) => success,
                    Err(e) => {
                        let error = format!("Agent task aborted: {}", e);
                        processor
                            .recover_aborted(
                                &item,
                                &worker_id,
                                settled.load(Ordering::SeqCst),
                                &error,
                            )
                            .await;
                        false
                    }
                }
            });
        }

        let mut succeeded = 0;
        let mut failed = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(stage = %self.stage, error = %e, "task join error");
                }
            }
        }
        (succeeded, failed)
    }
}

fn poll_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
