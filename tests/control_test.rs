mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stage_golem::agent::MockAgentExecutor;
use stage_golem::config::StageGolemConfig;
use stage_golem::control::{validate_settings_update, QueueManager, QueueOptions};
use stage_golem::store::WorkStore;
use stage_golem::types::*;

use common::{add_item, at, lease_item, setup_store};

fn manager(store: &WorkStore) -> QueueManager<MockAgentExecutor> {
    let executors: BTreeMap<Stage, Arc<MockAgentExecutor>> = Stage::ACTIVE
        .iter()
        .map(|&stage| (stage, Arc::new(MockAgentExecutor::default())))
        .collect();
    QueueManager::new(
        store.clone(),
        executors,
        QueueOptions::from_config(&StageGolemConfig::default()),
    )
}

fn force_failed(store: &WorkStore, id: i64, stage: &str) {
    let conn = rusqlite::Connection::open(store.path()).unwrap();
    conn.execute(
        "UPDATE work_items SET stage = ?1, status = 'failed', retry_count = 4 WHERE id = ?2",
        rusqlite::params![stage, id],
    )
    .unwrap();
}

// --- Lifecycle ---

#[tokio::test]
async fn start_and_stop() {
    let (_dir, store) = setup_store();
    let mut queue = manager(&store);
    assert!(!queue.is_running());

    queue.start().unwrap();
    assert!(queue.is_running());
    assert!(queue.start().unwrap_err().contains("already running"));

    tokio::time::timeout(Duration::from_secs(10), queue.stop())
        .await
        .expect("stop should complete");
    assert!(!queue.is_running());

    queue.stop().await;
}

#[tokio::test]
async fn start_with_unschedulable_stage_spawns_nothing() {
    let (_dir, store) = setup_store();
    store.update_stage_limits(Stage::Triage, 1, 4).unwrap();
    let executor = Arc::new(MockAgentExecutor::default());
    let mut executors = BTreeMap::new();
    executors.insert(Stage::Triage, Arc::clone(&executor));
    executors.insert(Stage::PostQueue, Arc::new(MockAgentExecutor::default()));
    let mut queue = QueueManager::new(
        store.clone(),
        executors,
        QueueOptions::from_config(&StageGolemConfig::default()),
    );

    let err = queue.start().unwrap_err();
    assert!(err.contains("post_queue"), "unexpected error: {}", err);
    assert!(!queue.is_running());

    let id = add_item(&store, "untouched", Stage::Triage);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let item = store.get_item(id).unwrap();
    assert_eq!(item.stage, Stage::Triage);
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn running_queue_moves_item_through_pipeline() {
    let (_dir, store) = setup_store();
    for stage in Stage::ACTIVE {
        let config = store.stage_config(stage).unwrap().unwrap();
        store
            .update_stage_limits(stage, 1, config.max_concurrent)
            .unwrap();
    }
    let mut queue = manager(&store);
    let id = queue
        .add_item(NewWorkItem::new("t3_pipeline", "Lifetimes in async closures"))
        .await
        .unwrap();

    queue.start().unwrap();
    let reached = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if store.get_item(id).unwrap().stage == Stage::PostQueue {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    queue.stop().await;
    assert!(reached.is_ok(), "item did not reach post_queue");

    let history = queue.history(id).await.unwrap();
    let stages: Vec<Stage> = history.iter().map(|r| r.stage).collect();
    assert_eq!(stages, Stage::ACTIVE.to_vec());
    assert!(history.iter().all(|r| r.success));

    let status = queue.status().await.unwrap();
    assert_eq!(status.metrics[&Stage::Editorial].metrics.succeeded, 1);
    assert_eq!(status.stats[&Stage::PostQueue][&ItemStatus::Pending], 1);
}

// --- Pause / resume ---

#[tokio::test]
async fn pause_and_resume_toggle_stored_flag() {
    let (_dir, store) = setup_store();
    let queue = manager(&store);

    queue.pause(Stage::Research).await.unwrap();
    assert!(store.stage_config(Stage::Research).unwrap().unwrap().is_paused);

    queue.resume(Stage::Research).await.unwrap();
    assert!(!store.stage_config(Stage::Research).unwrap().unwrap().is_paused);
}

#[tokio::test]
async fn pause_rejects_non_active_stage() {
    let (_dir, store) = setup_store();
    let err = manager(&store).pause(Stage::PostQueue).await.unwrap_err();
    assert!(err.contains("post_queue"), "unexpected error: {}", err);
}

#[tokio::test]
async fn pause_before_init_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = WorkStore::open(&dir.path().join("uninit.db")).unwrap();
    let err = manager(&store).pause(Stage::Triage).await.unwrap_err();
    assert!(err.contains("run init first"), "unexpected error: {}", err);
}

// --- Status ---

#[tokio::test]
async fn status_reports_configs_counts_and_settings() {
    let (_dir, store) = setup_store();
    add_item(&store, "a", Stage::Triage);
    add_item(&store, "b", Stage::Triage);
    add_item(&store, "c", Stage::Research);
    let queue = manager(&store);
    queue.pause(Stage::Response).await.unwrap();

    let status = queue.status().await.unwrap();
    assert!(!status.running);
    assert_eq!(status.stages.len(), 4);

    let response = status.stages.iter().find(|s| s.stage == Stage::Response).unwrap();
    assert!(response.is_paused);
    assert!(response.has_worker);
    assert_eq!(response.in_flight, 0);

    let triage = &status.stages[0];
    assert_eq!(triage.stage, Stage::Triage);
    assert_eq!(triage.poll_interval_secs, 5);
    assert_eq!(triage.max_concurrent, 4);

    assert_eq!(status.stats[&Stage::Triage][&ItemStatus::Pending], 2);
    assert_eq!(status.stats[&Stage::Research][&ItemStatus::Pending], 1);
    assert_eq!(status.settings, RetrySettings::default());
    assert!(status.metrics.is_empty());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["stages"][0]["stage"], "triage");
}

// --- Reset ---

#[tokio::test]
async fn reset_item_revives_dead_lettered_item() {
    let (_dir, store) = setup_store();
    let id = add_item(&store, "a", Stage::Triage);
    force_failed(&store, id, "response");
    let queue = manager(&store);

    queue.reset_item(id).await.unwrap();

    let item = store.get_item(id).unwrap();
    assert_eq!(item.stage, Stage::Response);
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 5);
}

#[tokio::test]
async fn reset_item_errors() {
    let (_dir, store) = setup_store();
    let queue = manager(&store);

    let err = queue.reset_item(404).await.unwrap_err();
    assert!(err.contains("404"), "unexpected error: {}", err);

    let id = add_item(&store, "done", Stage::Completed);
    let err = queue.reset_item(id).await.unwrap_err();
    assert!(err.contains("cannot be reset"), "unexpected error: {}", err);
}

#[tokio::test]
async fn reset_stuck_uses_wall_clock() {
    let (_dir, store) = setup_store();
    let id = add_item(&store, "a", Stage::Editorial);
    lease_item(&store, id, "crashed-worker", at(0));

    let reset = manager(&store).reset_stuck().await.unwrap();
    assert_eq!(reset, vec![id]);
}

// --- Settings and metrics ---

#[tokio::test]
async fn update_retry_settings_validates_and_persists() {
    let (_dir, store) = setup_store();
    let queue = manager(&store);

    let err = queue
        .update_retry_settings(RetrySettingsUpdate::default())
        .await
        .unwrap_err();
    assert_eq!(err, "No settings to update");

    let settings = queue
        .update_retry_settings(RetrySettingsUpdate {
            max_retry_attempts: Some(6),
            stuck_threshold_minutes: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(settings.max_retry_attempts, 6);
    assert_eq!(settings.stuck_threshold_minutes, 10);
    assert_eq!(store.retry_settings().unwrap(), settings);
}

#[test]
fn zero_stuck_threshold_is_rejected() {
    let update = RetrySettingsUpdate {
        stuck_threshold_minutes: Some(0),
        ..Default::default()
    };
    assert!(validate_settings_update(&update).is_err());
}

#[tokio::test]
async fn reset_metrics_clears_counters() {
    let (_dir, store) = setup_store();
    let queue = manager(&store);
    queue
        .metrics()
        .record(Stage::Triage, true, Duration::from_secs(1), 10);
    queue
        .metrics()
        .record(Stage::Research, true, Duration::from_secs(1), 10);

    queue.reset_metrics(Some(Stage::Triage));
    assert_eq!(queue.metrics().stage(Stage::Triage).attempted, 0);
    assert_eq!(queue.metrics().stage(Stage::Research).attempted, 1);

    queue.reset_metrics(None);
    assert!(queue.metrics().snapshot().is_empty());
}

#[tokio::test]
async fn history_of_missing_item_is_an_error() {
    let (_dir, store) = setup_store();
    let err = manager(&store).history(12).await.unwrap_err();
    assert!(matches!(err, stage_golem::error::StoreError::ItemNotFound(12)));
}
