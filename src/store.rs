use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::types::{
    parse_item_status, parse_stage, FallbackEvent, ItemStatus, NewWorkItem, ProcessingResult,
    QueueStats, RetrySettings, RetrySettingsUpdate, Stage, StageConfig, WorkItem,
};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const SETTING_RETRY_TIMEOUT: &str = "retry_timeout_seconds";
pub const SETTING_MAX_RETRY_ATTEMPTS: &str = "max_retry_attempts";
pub const SETTING_STUCK_THRESHOLD: &str = "stuck_threshold_minutes";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    author TEXT NOT NULL DEFAULT '',
    stage TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    assigned_to TEXT,
    assigned_at INTEGER,
    lease_started_at INTEGER,
    processed_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_retry_at INTEGER,
    last_error TEXT,
    priority INTEGER NOT NULL DEFAULT 5,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_claim
    ON work_items (stage, status, priority DESC, created_at);

CREATE TABLE IF NOT EXISTS processing_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES work_items(id),
    stage TEXT NOT NULL,
    payload TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processing_results_item
    ON processing_results (item_id, stage, created_at);

CREATE TABLE IF NOT EXISTS stage_config (
    stage TEXT PRIMARY KEY,
    poll_interval_secs INTEGER NOT NULL,
    max_concurrent INTEGER NOT NULL,
    is_paused INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS queue_settings (
    setting_key TEXT PRIMARY KEY,
    setting_value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fallback_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    reason TEXT NOT NULL,
    successful_writes INTEGER NOT NULL DEFAULT 0,
    failed_writes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
";

const ITEM_COLUMNS: &str = "id, external_id, title, author, stage, status, assigned_to, \
     assigned_at, lease_started_at, processed_at, retry_count, last_retry_at, last_error, \
     priority, metadata, created_at";

const RESULT_COLUMNS: &str = "id, item_id, stage, payload, success, error, duration_ms, created_at";

/// Eligibility predicate shared by candidate selection and the guarded claim
/// update. Parameters: stage, lease cutoff, retry cutoff.
const CLAIMABLE: &str = "stage = ?1 AND status = 'pending' \
     AND (assigned_to IS NULL OR assigned_at <= ?2) \
     AND (last_retry_at IS NULL OR last_retry_at <= ?3)";

/// Stages the stats report covers.
const STATS_STAGES: &str = "('triage', 'research', 'response', 'editorial', 'post_queue')";

/// Stages whose items may be returned to the claimable pool.
const RESETTABLE_STAGES: &str = "('triage', 'research', 'response', 'editorial')";

// --- Time helpers ---

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// --- Claim window ---

/// The time bounds a claim is evaluated against.
///
/// An item is claimable when its lease (if any) started at or before
/// `now - lease_timeout` and its last policy retry (if any) happened at or
/// before `now - retry_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimWindow {
    pub now: DateTime<Utc>,
    pub lease_timeout: Duration,
    pub retry_timeout: Duration,
}

impl ClaimWindow {
    fn lease_cutoff(&self) -> i64 {
        to_millis(self.now).saturating_sub(duration_millis(self.lease_timeout))
    }

    fn retry_cutoff(&self) -> i64 {
        to_millis(self.now).saturating_sub(duration_millis(self.retry_timeout))
    }
}

// --- Raw row decoding ---

struct RawItem {
    id: i64,
    external_id: String,
    title: String,
    author: String,
    stage: String,
    status: String,
    assigned_to: Option<String>,
    assigned_at: Option<i64>,
    lease_started_at: Option<i64>,
    processed_at: Option<i64>,
    retry_count: i64,
    last_retry_at: Option<i64>,
    last_error: Option<String>,
    priority: i64,
    metadata: String,
    created_at: i64,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            external_id: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            stage: row.get(4)?,
            status: row.get(5)?,
            assigned_to: row.get(6)?,
            assigned_at: row.get(7)?,
            lease_started_at: row.get(8)?,
            processed_at: row.get(9)?,
            retry_count: row.get(10)?,
            last_retry_at: row.get(11)?,
            last_error: row.get(12)?,
            priority: row.get(13)?,
            metadata: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn into_item(self) -> Result<WorkItem, StoreError> {
        let metadata = match serde_json::from_str::<serde_json::Value>(&self.metadata)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "item {} metadata is not an object: {}",
                    self.id, other
                )))
            }
        };
        Ok(WorkItem {
            id: self.id,
            external_id: self.external_id,
            title: self.title,
            author: self.author,
            stage: parse_stage(&self.stage).map_err(StoreError::Corrupt)?,
            status: parse_item_status(&self.status).map_err(StoreError::Corrupt)?,
            assigned_to: self.assigned_to,
            assigned_at: opt_from_millis(self.assigned_at)?,
            lease_started_at: opt_from_millis(self.lease_started_at)?,
            processed_at: opt_from_millis(self.processed_at)?,
            retry_count: u32::try_from(self.retry_count).map_err(|_| {
                StoreError::Corrupt(format!(
                    "item {} retry_count out of range: {}",
                    self.id, self.retry_count
                ))
            })?,
            last_retry_at: opt_from_millis(self.last_retry_at)?,
            last_error: self.last_error,
            priority: self.priority,
            metadata,
            created_at: from_millis(self.created_at)?,
        })
    }
}

struct RawResult {
    id: i64,
    item_id: i64,
    stage: String,
    payload: String,
    success: bool,
    error: Option<String>,
    duration_ms: i64,
    created_at: i64,
}

impl RawResult {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: row.get(1)?,
            stage: row.get(2)?,
            payload: row.get(3)?,
            success: row.get(4)?,
            error: row.get(5)?,
            duration_ms: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_result(self) -> Result<ProcessingResult, StoreError> {
        Ok(ProcessingResult {
            id: self.id,
            item_id: self.item_id,
            stage: parse_stage(&self.stage).map_err(StoreError::Corrupt)?,
            payload: serde_json::from_str(&self.payload)?,
            success: self.success,
            error: self.error,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
            created_at: from_millis(self.created_at)?,
        })
    }
}

fn collect_items(raws: Vec<RawItem>) -> Result<Vec<WorkItem>, StoreError> {
    raws.into_iter().map(RawItem::into_item).collect()
}

// --- WorkStore ---

/// SQLite-backed owner of all persisted queue state.
///
/// Holds only the database path: every operation opens a short-lived
/// connection, so nothing is held open across an executor call. Row-level
/// atomicity of conditional `UPDATE ... RETURNING` statements is the only
/// mutual-exclusion mechanism between claimers.
#[derive(Debug, Clone)]
pub struct WorkStore {
    path: PathBuf,
}

impl WorkStore {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            path: path.to_path_buf(),
        };
        let conn = store.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|source| StoreError::Open {
            path: self.path.clone(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run a synchronous store operation on the blocking thread pool.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&WorkStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .unwrap_or_else(|e| Err(StoreError::Internal(format!("spawn_blocking panicked: {}", e))))
    }

    // --- Seeding ---

    /// Insert stage configs that are not yet present. Existing rows win.
    pub fn seed_stage_configs(&self, configs: &[StageConfig]) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for config in configs {
            tx.execute(
                "INSERT OR IGNORE INTO stage_config (stage, poll_interval_secs, max_concurrent, is_paused)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    config.stage.as_str(),
                    config.poll_interval_secs as i64,
                    config.max_concurrent as i64,
                    config.is_paused
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert retry settings that are not yet present. Existing rows win.
    pub fn seed_retry_settings(&self, settings: &RetrySettings) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for (key, value) in settings_pairs(settings) {
            tx.execute(
                "INSERT OR IGNORE INTO queue_settings (setting_key, setting_value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- Items ---

    pub fn insert_item(&self, item: &NewWorkItem, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let metadata = serde_json::to_string(&item.metadata)?;
        let id = conn.query_row(
            "INSERT INTO work_items (external_id, title, author, stage, status, priority, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)
             RETURNING id",
            params![
                item.external_id,
                item.title,
                item.author,
                item.stage.as_str(),
                item.priority,
                metadata,
                to_millis(now)
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_item(&self, id: i64) -> Result<WorkItem, StoreError> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM work_items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                RawItem::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_item(),
            None => Err(StoreError::ItemNotFound(id)),
        }
    }

    // --- Claim protocol ---

    /// Ids of claimable items in `stage`, highest priority first, then oldest.
    pub fn claimable_ids(
        &self,
        stage: Stage,
        limit: usize,
        window: &ClaimWindow,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM work_items WHERE {}
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT ?4",
            CLAIMABLE
        ))?;
        let ids = stmt
            .query_map(
                params![
                    stage.as_str(),
                    window.lease_cutoff(),
                    window.retry_cutoff(),
                    limit as i64
                ],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Atomically lease one item to `worker_id`.
    ///
    /// The update is guarded by the same predicate used for selection, so a
    /// concurrent claimer that already won the row makes this return `None`.
    pub fn claim_item(
        &self,
        id: i64,
        stage: Stage,
        worker_id: &str,
        window: &ClaimWindow,
    ) -> Result<Option<WorkItem>, StoreError> {
        let conn = self.connect()?;
        let now = to_millis(window.now);
        let raw = conn
            .query_row(
                &format!(
                    "UPDATE work_items
                     SET status = 'processing', assigned_to = ?4, assigned_at = ?5, lease_started_at = ?5
                     WHERE id = ?6 AND {}
                     RETURNING {}",
                    CLAIMABLE, ITEM_COLUMNS
                ),
                params![
                    stage.as_str(),
                    window.lease_cutoff(),
                    window.retry_cutoff(),
                    worker_id,
                    now,
                    id
                ],
                RawItem::from_row,
            )
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    /// Clear the lease and stamp `processed_at`. Carries no status change.
    ///
    /// A lease that has since passed to another worker is left untouched.
    pub fn release(&self, id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE work_items
             SET assigned_to = NULL, assigned_at = NULL, processed_at = ?1
             WHERE id = ?2 AND (assigned_to IS NULL OR assigned_to = ?3)",
            params![to_millis(now), id, worker_id],
        )?;
        Ok(())
    }

    // --- Outcome writes (fenced on the lease holder) ---

    /// Move an item to `next`. Returns false if `worker_id` no longer holds the lease.
    pub fn apply_transition(
        &self,
        id: i64,
        worker_id: &str,
        next: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE work_items
             SET stage = ?1, status = ?2, assigned_to = NULL, assigned_at = NULL,
                 lease_started_at = NULL, processed_at = ?3
             WHERE id = ?4 AND assigned_to = ?5",
            params![
                next.as_str(),
                next.entry_status().as_str(),
                to_millis(now),
                id,
                worker_id
            ],
        )?;
        Ok(changed > 0)
    }

    /// Re-queue after a failure, stamping `last_retry_at` so the claim
    /// predicate enforces the cool-down.
    pub fn requeue_for_retry(
        &self,
        id: i64,
        worker_id: &str,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.write_failure(id, worker_id, ItemStatus::Pending, retry_count, error, Some(now), now)
    }

    /// Dead-letter: terminal failed status with the final count and error.
    pub fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.write_failure(id, worker_id, ItemStatus::Failed, retry_count, error, None, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_failure(
        &self,
        id: i64,
        worker_id: &str,
        status: ItemStatus,
        retry_count: u32,
        error: &str,
        last_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE work_items
             SET status = ?1, retry_count = ?2, last_error = ?3,
                 last_retry_at = COALESCE(?4, last_retry_at),
                 assigned_to = NULL, assigned_at = NULL, lease_started_at = NULL,
                 processed_at = ?5
             WHERE id = ?6 AND assigned_to = ?7",
            params![
                status.as_str(),
                retry_count as i64,
                error,
                last_retry_at.map(to_millis),
                to_millis(now),
                id,
                worker_id
            ],
        )?;
        Ok(changed > 0)
    }

    // --- Reconciliation ---

    /// Items leased before `lease_cutoff` that are still processing, plus
    /// failed items whose retry count is below `max_retry_attempts`.
    pub fn find_stuck(
        &self,
        lease_cutoff: DateTime<Utc>,
        max_retry_attempts: u32,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM work_items
             WHERE stage IN {}
               AND ((status = 'processing' AND assigned_at IS NOT NULL AND assigned_at < ?1)
                    OR (status = 'failed' AND retry_count < ?2))
             ORDER BY id",
            ITEM_COLUMNS, RESETTABLE_STAGES
        ))?;
        let raws = stmt
            .query_map(
                params![to_millis(lease_cutoff), max_retry_attempts as i64],
                RawItem::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        collect_items(raws)
    }

    /// Return items to the claimable pool immediately, whatever their state.
    /// Used for operator resets.
    ///
    /// Clears the lease and `last_retry_at`, sets status to pending and
    /// increments the retry count. Items in non-active stages are left alone.
    /// Returns the ids actually reset.
    pub fn reset_items(&self, ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut reset = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE work_items
                 SET status = 'pending', assigned_to = NULL, assigned_at = NULL,
                     lease_started_at = NULL, last_retry_at = NULL,
                     retry_count = retry_count + 1
                 WHERE id = ?1 AND stage IN {}",
                RESETTABLE_STAGES
            ))?;
            for &id in ids {
                if stmt.execute(params![id])? > 0 {
                    reset.push(id);
                }
            }
        }
        tx.commit()?;
        Ok(reset)
    }

    /// Reset items found by [`find_stuck`](Self::find_stuck), but only if each
    /// row is still in the state it was detected in.
    ///
    /// A row that finished its stage or was leased again since detection is
    /// skipped. Returns the ids actually reset.
    pub fn reset_detected(&self, items: &[WorkItem]) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut reset = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE work_items
                 SET status = 'pending', assigned_to = NULL, assigned_at = NULL,
                     lease_started_at = NULL, last_retry_at = NULL,
                     retry_count = retry_count + 1
                 WHERE id = ?1 AND stage = ?2 AND status = ?3
                   AND assigned_to IS ?4 AND assigned_at IS ?5 AND retry_count = ?6
                   AND stage IN {}",
                RESETTABLE_STAGES
            ))?;
            for item in items {
                let changed = stmt.execute(params![
                    item.id,
                    item.stage.as_str(),
                    item.status.as_str(),
                    item.assigned_to,
                    item.assigned_at.map(to_millis),
                    item.retry_count as i64
                ])?;
                if changed > 0 {
                    reset.push(item.id);
                }
            }
        }
        tx.commit()?;
        Ok(reset)
    }

    // --- Settings ---

    /// Read retry settings, falling back to defaults for missing or
    /// unparseable keys.
    pub fn retry_settings(&self) -> Result<RetrySettings, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT setting_key, setting_value FROM queue_settings")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut settings = RetrySettings::default();
        for (key, value) in pairs {
            match key.as_str() {
                SETTING_RETRY_TIMEOUT => {
                    if let Ok(v) = value.trim().parse() {
                        settings.retry_timeout_seconds = v;
                    }
                }
                SETTING_MAX_RETRY_ATTEMPTS => {
                    if let Ok(v) = value.trim().parse() {
                        settings.max_retry_attempts = v;
                    }
                }
                SETTING_STUCK_THRESHOLD => {
                    if let Ok(v) = value.trim().parse() {
                        settings.stuck_threshold_minutes = v;
                    }
                }
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Apply a partial update and return the resulting settings.
    pub fn update_retry_settings(
        &self,
        update: &RetrySettingsUpdate,
    ) -> Result<RetrySettings, StoreError> {
        {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            let changes = [
                (SETTING_RETRY_TIMEOUT, update.retry_timeout_seconds.map(|v| v.to_string())),
                (SETTING_MAX_RETRY_ATTEMPTS, update.max_retry_attempts.map(|v| v.to_string())),
                (SETTING_STUCK_THRESHOLD, update.stuck_threshold_minutes.map(|v| v.to_string())),
            ];
            for (key, value) in changes {
                if let Some(value) = value {
                    tx.execute(
                        "INSERT INTO queue_settings (setting_key, setting_value) VALUES (?1, ?2)
                         ON CONFLICT(setting_key) DO UPDATE SET setting_value = excluded.setting_value",
                        params![key, value],
                    )?;
                }
            }
            tx.commit()?;
        }
        self.retry_settings()
    }

    pub fn stage_config(&self, stage: Stage) -> Result<Option<StageConfig>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT poll_interval_secs, max_concurrent, is_paused FROM stage_config WHERE stage = ?1",
                params![stage.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(poll, max, paused)| StageConfig {
            stage,
            poll_interval_secs: u64::try_from(poll).unwrap_or(0),
            max_concurrent: u32::try_from(max).unwrap_or(0),
            is_paused: paused,
        }))
    }

    pub fn stage_configs(&self) -> Result<Vec<StageConfig>, StoreError> {
        let mut configs = Vec::new();
        for stage in Stage::ACTIVE {
            if let Some(config) = self.stage_config(stage)? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    /// Set the paused flag. Returns false if the stage has no config row.
    pub fn set_paused(&self, stage: Stage, paused: bool) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE stage_config SET is_paused = ?1 WHERE stage = ?2",
            params![paused, stage.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite a stage's poll interval and concurrency ceiling, keeping its paused flag.
    pub fn update_stage_limits(
        &self,
        stage: Stage,
        poll_interval_secs: u64,
        max_concurrent: u32,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO stage_config (stage, poll_interval_secs, max_concurrent, is_paused)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(stage) DO UPDATE SET
                 poll_interval_secs = excluded.poll_interval_secs,
                 max_concurrent = excluded.max_concurrent",
            params![stage.as_str(), poll_interval_secs as i64, max_concurrent as i64],
        )?;
        Ok(())
    }

    // --- Results log ---

    #[allow(clippy::too_many_arguments)]
    pub fn append_result(
        &self,
        item_id: i64,
        stage: Stage,
        payload: &serde_json::Value,
        success: bool,
        error: Option<&str>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let id = conn.query_row(
            "INSERT INTO processing_results (item_id, stage, payload, success, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING id",
            params![
                item_id,
                stage.as_str(),
                serde_json::to_string(payload)?,
                success,
                error,
                duration_millis(duration),
                to_millis(now)
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Most recent result for an item at a stage, successful or not.
    pub fn latest_result(
        &self,
        item_id: i64,
        stage: Stage,
    ) -> Result<Option<ProcessingResult>, StoreError> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM processing_results
                     WHERE item_id = ?1 AND stage = ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                    RESULT_COLUMNS
                ),
                params![item_id, stage.as_str()],
                RawResult::from_row,
            )
            .optional()?;
        raw.map(RawResult::into_result).transpose()
    }

    /// Full processing history for an item, oldest first.
    pub fn results_for_item(&self, item_id: i64) -> Result<Vec<ProcessingResult>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM processing_results WHERE item_id = ?1 ORDER BY created_at ASC, id ASC",
            RESULT_COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![item_id], RawResult::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawResult::into_result).collect()
    }

    // --- Fallback events ---

    pub fn record_fallback(&self, event: &FallbackEvent) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let id = conn.query_row(
            "INSERT INTO fallback_events (item_id, stage, reason, successful_writes, failed_writes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id",
            params![
                event.item_id,
                event.stage.as_str(),
                event.reason,
                event.successful_writes as i64,
                event.failed_writes as i64,
                to_millis(event.created_at)
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Fallback events for an item, for post-hoc analysis only.
    pub fn fallback_events(&self, item_id: i64) -> Result<Vec<FallbackEvent>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT stage, reason, successful_writes, failed_writes, created_at
             FROM fallback_events WHERE item_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![item_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(stage, reason, ok, failed, created_at)| {
                Ok(FallbackEvent {
                    item_id,
                    stage: parse_stage(&stage).map_err(StoreError::Corrupt)?,
                    reason,
                    successful_writes: u32::try_from(ok).unwrap_or(0),
                    failed_writes: u32::try_from(failed).unwrap_or(0),
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }

    // --- Stats ---

    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT stage, status, COUNT(*) FROM work_items
             WHERE stage IN {}
             GROUP BY stage, status
             ORDER BY stage, status",
            STATS_STAGES
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::new();
        for (stage, status, count) in rows {
            let stage = parse_stage(&stage).map_err(StoreError::Corrupt)?;
            let status = parse_item_status(&status).map_err(StoreError::Corrupt)?;
            stats
                .entry(stage)
                .or_default()
                .insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn settings_pairs(settings: &RetrySettings) -> [(&'static str, String); 3] {
    [
        (SETTING_RETRY_TIMEOUT, settings.retry_timeout_seconds.to_string()),
        (SETTING_MAX_RETRY_ATTEMPTS, settings.max_retry_attempts.to_string()),
        (SETTING_STUCK_THRESHOLD, settings.stuck_threshold_minutes.to_string()),
    ]
}
