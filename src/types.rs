use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

/// A named step in the fixed pipeline.
///
/// Only the four active stages (triage, research, response, editorial) have a
/// scheduler. `PostQueue` is a hand-off point for an external poster, and the
/// remaining variants are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Triage,
    Research,
    Response,
    Editorial,
    PostQueue,
    Completed,
    Rejected,
    Failed,
}

impl Stage {
    /// Stages serviced by a worker pool, in pipeline order.
    pub const ACTIVE: [Stage; 4] = [
        Stage::Triage,
        Stage::Research,
        Stage::Response,
        Stage::Editorial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Triage => "triage",
            Stage::Research => "research",
            Stage::Response => "response",
            Stage::Editorial => "editorial",
            Stage::PostQueue => "post_queue",
            Stage::Completed => "completed",
            Stage::Rejected => "rejected",
            Stage::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        Stage::ACTIVE.contains(self)
    }

    /// Status an item gets when it moves into this stage.
    pub fn entry_status(&self) -> ItemStatus {
        match self {
            Stage::Completed => ItemStatus::Completed,
            Stage::Rejected => ItemStatus::Rejected,
            Stage::Failed => ItemStatus::Failed,
            _ => ItemStatus::Pending,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_stage(s: &str) -> Result<Stage, String> {
    match s.to_lowercase().as_str() {
        "triage" => Ok(Stage::Triage),
        "research" => Ok(Stage::Research),
        "response" => Ok(Stage::Response),
        "editorial" => Ok(Stage::Editorial),
        "post_queue" => Ok(Stage::PostQueue),
        "completed" => Ok(Stage::Completed),
        "rejected" => Ok(Stage::Rejected),
        "failed" => Ok(Stage::Failed),
        _ => Err(format!(
            "Invalid stage '{}': expected triage, research, response, editorial, post_queue, completed, rejected, or failed",
            s
        )),
    }
}

/// Parse a stage that has a worker pool. Used by pause/resume and config.
pub fn parse_active_stage(s: &str) -> Result<Stage, String> {
    let stage = parse_stage(s)?;
    if !stage.is_active() {
        return Err(format!(
            "Stage '{}' has no scheduler: expected triage, research, response, or editorial",
            stage
        ));
    }
    Ok(stage)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_item_status(s: &str) -> Result<ItemStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(ItemStatus::Pending),
        "processing" => Ok(ItemStatus::Processing),
        "completed" => Ok(ItemStatus::Completed),
        "failed" => Ok(ItemStatus::Failed),
        "rejected" => Ok(ItemStatus::Rejected),
        _ => Err(format!(
            "Invalid status '{}': expected pending, processing, completed, failed, or rejected",
            s
        )),
    }
}

// --- Structs ---

/// The unit of work moved through the pipeline.
///
/// Invariants maintained by the store:
/// - `status == Processing` implies `assigned_to` and `assigned_at` are set
/// - `status == Pending` implies `assigned_to` is empty
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub stage: Stage,
    pub status: ItemStatus,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub lease_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub priority: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when an item enters the queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NewWorkItem {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_entry_stage")]
    pub stage: Stage,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_entry_stage() -> Stage {
    Stage::Triage
}

fn default_priority() -> i64 {
    5
}

impl NewWorkItem {
    pub fn new(external_id: &str, title: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            title: title.to_string(),
            author: String::new(),
            stage: default_entry_stage(),
            priority: default_priority(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Per-stage scheduling knobs, re-read on every poll.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StageConfig {
    pub stage: Stage,
    pub poll_interval_secs: u64,
    pub max_concurrent: u32,
    pub is_paused: bool,
}

/// Process-wide retry knobs. The store is authoritative; values are re-read
/// each poll cycle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub retry_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub stuck_threshold_minutes: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_timeout_seconds: 300,
            max_retry_attempts: 3,
            stuck_threshold_minutes: 30,
        }
    }
}

/// Partial update applied by the control plane. `None` leaves a value unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RetrySettingsUpdate {
    pub retry_timeout_seconds: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    pub stuck_threshold_minutes: Option<u64>,
}

impl RetrySettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.retry_timeout_seconds.is_none()
            && self.max_retry_attempts.is_none()
            && self.stuck_threshold_minutes.is_none()
    }
}

/// Append-only audit record, one per processing attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProcessingResult {
    pub id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub payload: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Diagnostic record written when a result had to be synthesized.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FallbackEvent {
    pub item_id: i64,
    pub stage: Stage,
    pub reason: String,
    pub successful_writes: u32,
    pub failed_writes: u32,
    pub created_at: DateTime<Utc>,
}

/// Item counts grouped by stage, then status.
pub type QueueStats = BTreeMap<Stage, BTreeMap<ItemStatus, u64>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_parse() {
        for stage in [
            Stage::Triage,
            Stage::Research,
            Stage::Response,
            Stage::Editorial,
            Stage::PostQueue,
            Stage::Completed,
            Stage::Rejected,
            Stage::Failed,
        ] {
            assert_eq!(parse_stage(stage.as_str()).unwrap(), stage);
        }
        assert!(parse_stage("bogus").is_err());
    }

    #[test]
    fn active_stage_parse_rejects_terminal_stages() {
        assert_eq!(parse_active_stage("Research").unwrap(), Stage::Research);
        assert!(parse_active_stage("post_queue").is_err());
        assert!(parse_active_stage("completed").is_err());
    }

    #[test]
    fn entry_status_matches_stage_kind() {
        assert_eq!(Stage::Research.entry_status(), ItemStatus::Pending);
        assert_eq!(Stage::PostQueue.entry_status(), ItemStatus::Pending);
        assert_eq!(Stage::Completed.entry_status(), ItemStatus::Completed);
        assert_eq!(Stage::Rejected.entry_status(), ItemStatus::Rejected);
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::PostQueue).unwrap();
        assert_eq!(json, "\"post_queue\"");
    }
}
