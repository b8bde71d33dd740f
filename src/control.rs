use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StageGolemConfig;
use crate::error::StoreError;
use crate::executor::AgentExecutor;
use crate::metrics::{MetricsCollector, StageMetricsReport};
use crate::reconciler::Reconciler;
use crate::scheduler::StageScheduler;
use crate::store::WorkStore;
use crate::types::{
    NewWorkItem, ProcessingResult, QueueStats, RetrySettings, RetrySettingsUpdate, Stage,
    StageConfig,
};

/// Create the schema and seed stage configs and retry settings from `config`.
///
/// Rows that already exist are kept, so re-running is harmless and operator
/// changes made through the control plane survive.
pub fn initialize(store: &WorkStore, config: &StageGolemConfig) -> Result<(), StoreError> {
    let stage_configs: Vec<StageConfig> = config
        .all_stage_settings()
        .iter()
        .map(|s| s.to_stage_config())
        .collect();
    store.seed_stage_configs(&stage_configs)?;
    store.seed_retry_settings(&config.retry)?;
    Ok(())
}

/// Runtime knobs for a [`QueueManager`] that are not stored in the database.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub lease_timeout: Duration,
    /// `None` disables the periodic reconciler.
    pub reconcile_interval: Option<Duration>,
    /// Used when a stage has no config row.
    pub stage_defaults: BTreeMap<Stage, StageConfig>,
    pub unit_costs: std::collections::HashMap<Stage, f64>,
}

impl QueueOptions {
    pub fn from_config(config: &StageGolemConfig) -> Self {
        let reconcile_interval = match config.queue.reconcile_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            lease_timeout: config.queue.lease_timeout(),
            reconcile_interval,
            stage_defaults: config
                .all_stage_settings()
                .iter()
                .map(|s| (s.stage, s.to_stage_config()))
                .collect(),
            unit_costs: config.unit_costs(),
        }
    }
}

/// Per-stage row of the status report.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StageStatus {
    pub stage: Stage,
    pub is_paused: bool,
    pub poll_interval_secs: u64,
    pub max_concurrent: u32,
    pub in_flight: usize,
    pub has_worker: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct QueueStatus {
    pub running: bool,
    pub stages: Vec<StageStatus>,
    pub stats: QueueStats,
    pub settings: RetrySettings,
    pub metrics: BTreeMap<Stage, StageMetricsReport>,
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    in_flight: BTreeMap<Stage, Arc<AtomicUsize>>,
}

/// Control surface over the stage schedulers and the shared store.
pub struct QueueManager<E> {
    store: WorkStore,
    executors: BTreeMap<Stage, Arc<E>>,
    options: QueueOptions,
    metrics: MetricsCollector,
    reconciler: Reconciler,
    running: Option<Running>,
}

impl<E: AgentExecutor + 'static> QueueManager<E> {
    /// `executors` maps each stage to serve onto its executor. Stages without
    /// one get no scheduler.
    pub fn new(store: WorkStore, executors: BTreeMap<Stage, Arc<E>>, options: QueueOptions) -> Self {
        let metrics = MetricsCollector::new(options.unit_costs.clone());
        let reconciler = Reconciler::new(store.clone());
        Self {
            store,
            executors,
            options,
            metrics,
            reconciler,
            running: None,
        }
    }

    pub fn store(&self) -> &WorkStore {
        &self.store
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn a scheduler per configured stage, plus the reconciler.
    pub fn start(&mut self) -> Result<(), String> {
        if self.running.is_some() {
            return Err("Queue is already running".to_string());
        }

        // Nothing is spawned unless every stage is schedulable.
        if let Some(stage) = self.executors.keys().find(|stage| !stage.is_active()) {
            return Err(format!("Stage '{}' has no scheduler", stage));
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        let mut in_flight = BTreeMap::new();

        for (&stage, executor) in &self.executors {
            let defaults = self
                .options
                .stage_defaults
                .get(&stage)
                .cloned()
                .unwrap_or(StageConfig {
                    stage,
                    poll_interval_secs: 10,
                    max_concurrent: 1,
                    is_paused: false,
                });
            let scheduler = StageScheduler::new(
                stage,
                self.store.clone(),
                Arc::clone(executor),
                self.metrics.clone(),
                self.options.lease_timeout,
                defaults,
            );
            in_flight.insert(stage, scheduler.in_flight_handle());
            let token = cancel.child_token();
            handles.push(tokio::spawn(async move { scheduler.run(token).await }));
        }

        if let Some(interval) = self.options.reconcile_interval {
            let reconciler = self.reconciler.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(async move { reconciler.run(interval, token).await }));
        }

        tracing::info!(stages = self.executors.len(), "queue started");
        self.running = Some(Running {
            cancel,
            handles,
            in_flight,
        });
        Ok(())
    }

    /// Stop claiming and wait for in-flight batches to drain. No-op when stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler task ended abnormally");
            }
        }
        tracing::info!("queue stopped");
    }

    pub async fn pause(&self, stage: Stage) -> Result<(), String> {
        self.set_paused(stage, true).await
    }

    pub async fn resume(&self, stage: Stage) -> Result<(), String> {
        self.set_paused(stage, false).await
    }

    async fn set_paused(&self, stage: Stage, paused: bool) -> Result<(), String> {
        if !stage.is_active() {
            return Err(format!("Stage '{}' has no scheduler", stage));
        }
        let updated = self
            .store
            .blocking(move |store| store.set_paused(stage, paused))
            .await?;
        if !updated {
            return Err(format!("Stage '{}' is not configured; run init first", stage));
        }
        tracing::info!(stage = %stage, paused, "stage pause state changed");
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueStatus, StoreError> {
        let (configs, stats, settings) = self
            .store
            .blocking(|store| {
                Ok((
                    store.stage_configs()?,
                    store.queue_stats()?,
                    store.retry_settings()?,
                ))
            })
            .await?;

        let stages = Stage::ACTIVE
            .iter()
            .map(|&stage| {
                let config = configs
                    .iter()
                    .find(|c| c.stage == stage)
                    .cloned()
                    .or_else(|| self.options.stage_defaults.get(&stage).cloned());
                let in_flight = self
                    .running
                    .as_ref()
                    .and_then(|r| r.in_flight.get(&stage))
                    .map(|count| count.load(Ordering::SeqCst))
                    .unwrap_or(0);
                StageStatus {
                    stage,
                    is_paused: config.as_ref().map(|c| c.is_paused).unwrap_or(false),
                    poll_interval_secs: config.as_ref().map(|c| c.poll_interval_secs).unwrap_or(0),
                    max_concurrent: config.as_ref().map(|c| c.max_concurrent).unwrap_or(0),
                    in_flight,
                    has_worker: self.executors.contains_key(&stage),
                }
            })
            .collect();

        Ok(QueueStatus {
            running: self.is_running(),
            stages,
            stats,
            settings,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Manually return one item to the claimable pool.
    pub async fn reset_item(&self, item_id: i64) -> Result<(), String> {
        let item = self
            .store
            .blocking(move |store| store.get_item(item_id))
            .await?;
        let reset = self.reconciler.reset_ids(vec![item_id]).await?;
        if reset.is_empty() {
            return Err(format!(
                "Item {} is in stage '{}' and cannot be reset",
                item_id, item.stage
            ));
        }
        Ok(())
    }

    pub async fn reset_stuck(&self) -> Result<Vec<i64>, StoreError> {
        self.reconciler.reset_stuck(Utc::now()).await
    }

    pub async fn update_retry_settings(
        &self,
        update: RetrySettingsUpdate,
    ) -> Result<RetrySettings, String> {
        validate_settings_update(&update)?;
        let settings = self
            .store
            .blocking(move |store| store.update_retry_settings(&update))
            .await?;
        tracing::info!(?settings, "retry settings updated");
        Ok(settings)
    }

    /// Reset metrics for one stage, or all stages when `stage` is `None`.
    pub fn reset_metrics(&self, stage: Option<Stage>) {
        self.metrics.reset(stage);
    }

    pub async fn add_item(&self, item: NewWorkItem) -> Result<i64, StoreError> {
        self.store
            .blocking(move |store| store.insert_item(&item, Utc::now()))
            .await
    }

    pub async fn history(&self, item_id: i64) -> Result<Vec<ProcessingResult>, StoreError> {
        self.store
            .blocking(move |store| {
                store.get_item(item_id)?;
                store.results_for_item(item_id)
            })
            .await
    }
}

pub fn validate_settings_update(update: &RetrySettingsUpdate) -> Result<(), String> {
    if update.is_empty() {
        return Err("No settings to update".to_string());
    }
    if update.stuck_threshold_minutes == Some(0) {
        return Err("stuck_threshold_minutes must be >= 1".to_string());
    }
    Ok(())
}
