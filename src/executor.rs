use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::WorkStore;
use crate::types::{Stage, WorkItem};

// --- Outcome ---

/// Outcome class used to look up the default next stage.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    #[default]
    Success,
    Reject,
    Unverifiable,
    /// Any class the executor reports that this crate does not know about.
    #[serde(other)]
    Other,
}

/// What an agent executor reports back for one processing attempt.
///
/// Executors serialize this as JSON (the CLI variant writes it to a result
/// file, the HTTP variant returns it as the response body).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub outcome: OutcomeClass,
    /// Explicit next stage chosen by the executor; overrides the default table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<Stage>,
    /// Usage units (e.g. tokens) consumed, priced by the metrics collector.
    #[serde(default)]
    pub usage_units: u64,
    /// Stage result written to the audit log. `None` on a successful outcome
    /// means the completion payload never arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Partial write counts reported by the executor's own tool calls.
    #[serde(default)]
    pub writes_succeeded: u32,
    #[serde(default)]
    pub writes_failed: u32,
}

impl ExecutionOutcome {
    pub fn succeeded(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn with_outcome(mut self, outcome: OutcomeClass) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_next_stage(mut self, stage: Stage) -> Self {
        self.next_stage = Some(stage);
        self
    }

    pub fn with_usage(mut self, units: u64) -> Self {
        self.usage_units = units;
        self
    }

    /// Error text for a failed outcome, with a generic message when the
    /// executor gave none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Agent processing failed".to_string())
    }
}

// --- Context ---

/// Prior stage results keyed as `<stage>_result`.
pub type StageContext = BTreeMap<String, serde_json::Value>;

/// Everything an executor receives for one attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionRequest {
    pub stage: Stage,
    pub item: WorkItem,
    pub context: StageContext,
}

/// Stages whose results feed into `stage`.
pub fn context_dependencies(stage: Stage) -> &'static [Stage] {
    match stage {
        Stage::Research => &[Stage::Triage],
        Stage::Response => &[Stage::Triage, Stage::Research],
        Stage::Editorial => &[Stage::Triage, Stage::Research, Stage::Response],
        _ => &[],
    }
}

pub fn context_key(stage: Stage) -> String {
    format!("{}_result", stage)
}

/// Builds stage context from the processing-result log.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    store: WorkStore,
}

impl ContextBuilder {
    pub fn new(store: WorkStore) -> Self {
        Self { store }
    }

    /// Latest result payload for each dependency of `stage`. Dependencies with
    /// no recorded result are omitted.
    pub async fn build(&self, item_id: i64, stage: Stage) -> Result<StageContext, StoreError> {
        self.store
            .blocking(move |store| {
                let mut context = StageContext::new();
                for &dep in context_dependencies(stage) {
                    if let Some(result) = store.latest_result(item_id, dep)? {
                        context.insert(context_key(dep), result.payload);
                    }
                }
                Ok(context)
            })
            .await
    }
}

// --- Executor capability ---

/// The external processing capability invoked for each claimed item.
///
/// The scheduler treats calls as opaque, slow, and fallible. An `Err` is a
/// transient executor failure and goes through the retry policy, exactly like
/// an `Ok` outcome with `success == false`.
pub trait AgentExecutor: Send + Sync {
    fn execute(
        &self,
        item: &WorkItem,
        context: &StageContext,
    ) -> impl std::future::Future<Output = Result<ExecutionOutcome, String>> + Send;
}
