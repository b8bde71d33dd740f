use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use stage_golem::agent::{
    backends_from_config, install_signal_handlers, is_shutdown_requested, kill_all_children,
    AgentBackend,
};
use stage_golem::config::{self, StageGolemConfig};
use stage_golem::control::{self, QueueManager, QueueOptions};
use stage_golem::log::{self, parse_log_level};
use stage_golem::store::WorkStore;
use stage_golem::types::{parse_active_stage, ItemStatus, NewWorkItem, RetrySettingsUpdate, Stage};

/// Directory under the config base holding CLI agent request/result files.
const AGENT_WORK_DIR: &str = ".stage-golem/agent";

#[derive(Parser)]
#[command(name = "stage-golem", about = "Staged work-queue scheduler")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/stage-golem.toml).
    /// When specified, the store path resolves from the config file's parent directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and seed stage and retry settings
    Init,
    /// Run every stage scheduler until interrupted
    Run,
    /// Show queue counts, stage states, and retry settings
    Status,
    /// Stop claiming new items in a stage
    Pause { stage: String },
    /// Resume claiming in a paused stage
    Resume { stage: String },
    /// Return one item to the claimable pool
    Reset { item_id: i64 },
    /// Reset every stuck or retryable failed item
    ResetStuck,
    /// Show or update retry settings
    Settings {
        #[arg(long)]
        retry_timeout_seconds: Option<u64>,
        #[arg(long)]
        max_retry_attempts: Option<u32>,
        #[arg(long)]
        stuck_threshold_minutes: Option<u64>,
    },
    /// Add a pending item to the triage stage
    Add {
        external_id: String,
        title: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long, default_value = "5")]
        priority: i64,
    },
    /// Show the processing history of an item
    History { item_id: i64 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => log::init(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;
    let config_base = match &cli.config {
        Some(p) => p.parent().unwrap_or(Path::new(".")).to_path_buf(),
        None => root.to_path_buf(),
    };

    let result = match load(root, cli.config.as_deref()) {
        Err(e) => Err(e),
        Ok(config) => match cli.command {
            Commands::Init => handle_init(&config_base, &config),
            Commands::Run => handle_run(&config_base, config).await,
            Commands::Status => handle_status(&config_base, &config).await,
            Commands::Pause { stage } => handle_pause(&config_base, &config, &stage, true).await,
            Commands::Resume { stage } => handle_pause(&config_base, &config, &stage, false).await,
            Commands::Reset { item_id } => handle_reset(&config_base, &config, item_id).await,
            Commands::ResetStuck => handle_reset_stuck(&config_base, &config).await,
            Commands::Settings {
                retry_timeout_seconds,
                max_retry_attempts,
                stuck_threshold_minutes,
            } => {
                let update = RetrySettingsUpdate {
                    retry_timeout_seconds,
                    max_retry_attempts,
                    stuck_threshold_minutes,
                };
                handle_settings(&config_base, &config, update).await
            }
            Commands::Add {
                external_id,
                title,
                author,
                priority,
            } => {
                let mut item = NewWorkItem::new(&external_id, &title);
                item.author = author;
                item.priority = priority;
                handle_add(&config_base, &config, item).await
            }
            Commands::History { item_id } => handle_history(&config_base, &config, item_id).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load(root: &Path, config_path: Option<&Path>) -> Result<StageGolemConfig, String> {
    match config_path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(root),
    }
}

fn resolve_store_path(config_base: &Path, config: &StageGolemConfig) -> PathBuf {
    config_base.join(&config.store.path)
}

fn open_store(config_base: &Path, config: &StageGolemConfig) -> Result<WorkStore, String> {
    let path = resolve_store_path(config_base, config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    Ok(WorkStore::open(&path)?)
}

fn manager(
    config_base: &Path,
    config: &StageGolemConfig,
) -> Result<QueueManager<AgentBackend>, String> {
    let store = open_store(config_base, config)?;
    let backends = backends_from_config(config, &config_base.join(AGENT_WORK_DIR));
    Ok(QueueManager::new(
        store,
        backends,
        QueueOptions::from_config(config),
    ))
}

fn handle_init(config_base: &Path, config: &StageGolemConfig) -> Result<(), String> {
    let store = open_store(config_base, config)?;
    control::initialize(&store, config)?;
    println!("Initialized store at {}", store.path().display());
    Ok(())
}

async fn handle_run(config_base: &Path, config: StageGolemConfig) -> Result<(), String> {
    install_signal_handlers()?;

    let mut queue = manager(config_base, &config)?;
    control::initialize(queue.store(), &config)?;
    queue.start()?;
    println!("Queue running. Press Ctrl-C to stop.");

    while !is_shutdown_requested() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("Shutting down, waiting for in-flight items...");
    queue.stop().await;
    kill_all_children();

    let status = queue.status().await?;
    for (stage, report) in &status.metrics {
        println!(
            "{:<10} attempted={} succeeded={} failed={} avg={:.2}s cost={:.4}",
            stage.as_str(),
            report.metrics.attempted,
            report.metrics.succeeded,
            report.metrics.failed,
            report.average_processing_secs,
            report.metrics.total_cost
        );
    }
    Ok(())
}

async fn handle_status(config_base: &Path, config: &StageGolemConfig) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    let status = queue.status().await?;

    println!(
        "{:<12} {:<8} {:<6} {:<8} {:<8} {:<10} {:<8}",
        "STAGE", "PAUSED", "POLL", "WORKERS", "PENDING", "PROCESSING", "FAILED"
    );
    println!("{}", "-".repeat(66));
    for stage_status in &status.stages {
        let counts = status.stats.get(&stage_status.stage);
        let count = |s: ItemStatus| counts.and_then(|c| c.get(&s)).copied().unwrap_or(0);
        println!(
            "{:<12} {:<8} {:<6} {:<8} {:<8} {:<10} {:<8}",
            stage_status.stage.as_str(),
            if stage_status.is_paused { "yes" } else { "no" },
            format!("{}s", stage_status.poll_interval_secs),
            stage_status.max_concurrent,
            count(ItemStatus::Pending),
            count(ItemStatus::Processing),
            count(ItemStatus::Failed),
        );
    }

    let post_queue: u64 = status
        .stats
        .get(&Stage::PostQueue)
        .map(|c| c.values().sum())
        .unwrap_or(0);
    println!("\npost_queue: {} item(s)", post_queue);
    println!(
        "retry: timeout={}s max_attempts={} stuck_threshold={}m",
        status.settings.retry_timeout_seconds,
        status.settings.max_retry_attempts,
        status.settings.stuck_threshold_minutes
    );
    Ok(())
}

async fn handle_pause(
    config_base: &Path,
    config: &StageGolemConfig,
    stage: &str,
    paused: bool,
) -> Result<(), String> {
    let stage = parse_active_stage(stage)?;
    let queue = manager(config_base, config)?;
    if paused {
        queue.pause(stage).await?;
        println!("Paused {}", stage);
    } else {
        queue.resume(stage).await?;
        println!("Resumed {}", stage);
    }
    Ok(())
}

async fn handle_reset(
    config_base: &Path,
    config: &StageGolemConfig,
    item_id: i64,
) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    queue.reset_item(item_id).await?;
    println!("Reset item {}", item_id);
    Ok(())
}

async fn handle_reset_stuck(config_base: &Path, config: &StageGolemConfig) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    let reset = queue.reset_stuck().await?;
    if reset.is_empty() {
        println!("No stuck items.");
    } else {
        let ids: Vec<String> = reset.iter().map(|id| id.to_string()).collect();
        println!("Reset {} item(s): {}", reset.len(), ids.join(", "));
    }
    Ok(())
}

async fn handle_settings(
    config_base: &Path,
    config: &StageGolemConfig,
    update: RetrySettingsUpdate,
) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    let settings = if update.is_empty() {
        queue.status().await?.settings
    } else {
        queue.update_retry_settings(update).await?
    };
    println!("retry_timeout_seconds = {}", settings.retry_timeout_seconds);
    println!("max_retry_attempts = {}", settings.max_retry_attempts);
    println!("stuck_threshold_minutes = {}", settings.stuck_threshold_minutes);
    Ok(())
}

async fn handle_add(
    config_base: &Path,
    config: &StageGolemConfig,
    item: NewWorkItem,
) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    let external_id = item.external_id.clone();
    let id = queue.add_item(item).await?;
    println!("Added item {} ({})", id, external_id);
    Ok(())
}

async fn handle_history(
    config_base: &Path,
    config: &StageGolemConfig,
    item_id: i64,
) -> Result<(), String> {
    let queue = manager(config_base, config)?;
    let results = queue.history(item_id).await?;
    if results.is_empty() {
        println!("No processing results for item {}.", item_id);
        return Ok(());
    }
    for result in &results {
        let outcome = if result.success { "ok" } else { "failed" };
        println!(
            "{} {:<10} {:<7} {:>6}ms {}",
            result.created_at.format("%Y-%m-%d %H:%M:%S"),
            result.stage.as_str(),
            outcome,
            result.duration_ms,
            result.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
