#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use stage_golem::agent::MockAgentExecutor;
use stage_golem::config::StageGolemConfig;
use stage_golem::control;
use stage_golem::executor::ExecutionOutcome;
use stage_golem::metrics::MetricsCollector;
use stage_golem::scheduler::StageScheduler;
use stage_golem::store::{ClaimWindow, WorkStore};
use stage_golem::types::{NewWorkItem, RetrySettingsUpdate, Stage, StageConfig, WorkItem};

pub const LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Fixed reference time: 2026-02-10T00:00:00Z.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap()
}

/// `base_time()` shifted by `secs` seconds.
pub fn at(secs: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::seconds(secs)
}

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Opens a fresh store in a temp dir, seeded from the default config.
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub fn setup_store() -> (TempDir, WorkStore) {
    let dir = TempDir::new().unwrap();
    let store = WorkStore::open(&dir.path().join("queue.db")).unwrap();
    control::initialize(&store, &StageGolemConfig::default()).unwrap();
    (dir, store)
}

/// Like `setup_store`, with the policy cool-down disabled so requeued items
/// are immediately claimable again.
pub fn setup_store_without_cooldown() -> (TempDir, WorkStore) {
    let (dir, store) = setup_store();
    store
        .update_retry_settings(&RetrySettingsUpdate {
            retry_timeout_seconds: Some(0),
            ..Default::default()
        })
        .unwrap();
    (dir, store)
}

/// Inserts a pending item in `stage` created at `base_time()`.
pub fn add_item(store: &WorkStore, external_id: &str, stage: Stage) -> i64 {
    add_item_with_priority(store, external_id, stage, 5, base_time())
}

pub fn add_item_with_priority(
    store: &WorkStore,
    external_id: &str,
    stage: Stage,
    priority: i64,
    created_at: DateTime<Utc>,
) -> i64 {
    let mut item = NewWorkItem::new(external_id, &format!("Test item {}", external_id));
    item.stage = stage;
    item.priority = priority;
    store.insert_item(&item, created_at).unwrap()
}

pub fn window(now: DateTime<Utc>) -> ClaimWindow {
    ClaimWindow {
        now,
        lease_timeout: LEASE_TIMEOUT,
        retry_timeout: Duration::from_secs(300),
    }
}

/// Leases an item to `worker_id` as of `now`, bypassing the scheduler.
pub fn lease_item(store: &WorkStore, id: i64, worker_id: &str, now: DateTime<Utc>) -> WorkItem {
    let item = store.get_item(id).unwrap();
    store
        .claim_item(id, item.stage, worker_id, &window(now))
        .unwrap()
        .expect("item should be claimable")
}

pub fn stage_config(stage: Stage, max_concurrent: u32) -> StageConfig {
    StageConfig {
        stage,
        poll_interval_secs: 1,
        max_concurrent,
        is_paused: false,
    }
}

/// A scheduler for `stage` driven by `executor`, with a fresh metrics collector.
pub fn make_scheduler(
    store: &WorkStore,
    stage: Stage,
    executor: MockAgentExecutor,
) -> (
    StageScheduler<MockAgentExecutor>,
    Arc<MockAgentExecutor>,
    MetricsCollector,
) {
    let executor = Arc::new(executor);
    let metrics = MetricsCollector::default();
    let scheduler = StageScheduler::new(
        stage,
        store.clone(),
        Arc::clone(&executor),
        metrics.clone(),
        LEASE_TIMEOUT,
        stage_config(stage, 4),
    );
    (scheduler, executor, metrics)
}

pub fn success(payload: serde_json::Value) -> Result<ExecutionOutcome, String> {
    Ok(ExecutionOutcome::succeeded(payload))
}

pub fn failure(error: &str) -> Result<ExecutionOutcome, String> {
    Ok(ExecutionOutcome::failed(error))
}
