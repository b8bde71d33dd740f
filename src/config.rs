use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{parse_active_stage, RetrySettings, Stage, StageConfig};

pub const CONFIG_FILE_NAME: &str = "stage-golem.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StageGolemConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    /// Seed values only; once `init` has written them the store is authoritative.
    pub retry: RetrySettings,
    /// Per-stage overrides keyed by stage name.
    pub stages: HashMap<String, StageOverrides>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Age after which an unfinished lease no longer blocks a claim.
    pub lease_timeout_secs: u64,
    /// How often the stuck-item reconciler runs. 0 disables it.
    pub reconcile_interval_secs: u64,
}

/// How a stage's agent executor is reached.
#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    #[default]
    Mock,
    Cli {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        model: Option<String>,
    },
}

/// Optional per-stage settings as written in the config file.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StageOverrides {
    pub poll_interval_secs: Option<u64>,
    pub max_concurrent: Option<u32>,
    pub unit_cost: Option<f64>,
    pub timeout_secs: Option<u64>,
    pub executor: Option<ExecutorConfig>,
}

/// Fully resolved settings for one stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSettings {
    pub stage: Stage,
    pub poll_interval_secs: u64,
    pub max_concurrent: u32,
    pub unit_cost: f64,
    pub timeout_secs: u64,
    pub executor: ExecutorConfig,
}

impl StageSettings {
    /// Built-in defaults, tuned to each stage's typical agent latency.
    pub fn defaults_for(stage: Stage) -> Self {
        let (poll_interval_secs, max_concurrent, unit_cost, timeout_secs) = match stage {
            Stage::Triage => (5, 4, 0.0001, 120),
            Stage::Research => (15, 2, 0.001, 600),
            Stage::Response => (10, 2, 0.001, 300),
            Stage::Editorial => (5, 3, 0.0001, 180),
            _ => (10, 1, 0.0, 300),
        };
        Self {
            stage,
            poll_interval_secs,
            max_concurrent,
            unit_cost,
            timeout_secs,
            executor: ExecutorConfig::Mock,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The row `init` seeds into the `stage_config` table.
    pub fn to_stage_config(&self) -> StageConfig {
        StageConfig {
            stage: self.stage,
            poll_interval_secs: self.poll_interval_secs,
            max_concurrent: self.max_concurrent,
            is_paused: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "stage-golem.db".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 300,
            reconcile_interval_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

impl StageGolemConfig {
    /// Resolve a stage's settings: config overrides on top of built-in defaults.
    pub fn stage_settings(&self, stage: Stage) -> StageSettings {
        let mut settings = StageSettings::defaults_for(stage);
        if let Some(overrides) = self.stages.get(stage.as_str()) {
            if let Some(v) = overrides.poll_interval_secs {
                settings.poll_interval_secs = v;
            }
            if let Some(v) = overrides.max_concurrent {
                settings.max_concurrent = v;
            }
            if let Some(v) = overrides.unit_cost {
                settings.unit_cost = v;
            }
            if let Some(v) = overrides.timeout_secs {
                settings.timeout_secs = v;
            }
            if let Some(v) = &overrides.executor {
                settings.executor = v.clone();
            }
        }
        settings
    }

    /// Settings for every active stage, in pipeline order.
    pub fn all_stage_settings(&self) -> Vec<StageSettings> {
        Stage::ACTIVE
            .iter()
            .map(|&stage| self.stage_settings(stage))
            .collect()
    }

    pub fn unit_costs(&self) -> HashMap<Stage, f64> {
        self.all_stage_settings()
            .into_iter()
            .map(|s| (s.stage, s.unit_cost))
            .collect()
    }
}

pub fn validate(config: &StageGolemConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.store.path.trim().is_empty() {
        errors.push("store.path must not be empty".to_string());
    }

    if config.queue.lease_timeout_secs < 1 {
        errors.push("queue.lease_timeout_secs must be >= 1".to_string());
    }

    if config.retry.stuck_threshold_minutes < 1 {
        errors.push("retry.stuck_threshold_minutes must be >= 1".to_string());
    }

    let mut stage_names: Vec<&String> = config.stages.keys().collect();
    stage_names.sort();
    for name in stage_names {
        if let Err(e) = parse_active_stage(name) {
            errors.push(format!("stages.{}: {}", name, e));
        }
    }

    for settings in config.all_stage_settings() {
        let stage = settings.stage;
        if settings.max_concurrent < 1 {
            errors.push(format!("stages.{}: max_concurrent must be >= 1", stage));
        }
        if settings.poll_interval_secs < 1 {
            errors.push(format!("stages.{}: poll_interval_secs must be >= 1", stage));
        }
        if settings.timeout_secs < 1 {
            errors.push(format!("stages.{}: timeout_secs must be >= 1", stage));
        }
        if !settings.unit_cost.is_finite() || settings.unit_cost < 0.0 {
            errors.push(format!("stages.{}: unit_cost must be a non-negative number", stage));
        }
        match &settings.executor {
            ExecutorConfig::Mock => {}
            ExecutorConfig::Cli { program, .. } => {
                if program.trim().is_empty() {
                    errors.push(format!("stages.{}: executor.program must not be empty", stage));
                }
            }
            ExecutorConfig::Http { endpoint, .. } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    errors.push(format!(
                        "stages.{}: executor.endpoint must start with http:// or https://",
                        stage
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load `stage-golem.toml` from `project_root`, or defaults if it is absent.
pub fn load_config(project_root: &Path) -> Result<StageGolemConfig, String> {
    let config_path = project_root.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        return Ok(StageGolemConfig::default());
    }

    load_config_from(&config_path)
}

/// Load and validate a config file at an explicit path.
pub fn load_config_from(config_path: &Path) -> Result<StageGolemConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: StageGolemConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
