use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use serde::Serialize;

use crate::config::{ExecutorConfig, StageGolemConfig, StageSettings};
use crate::executor::{AgentExecutor, ExecutionOutcome, ExecutionRequest, StageContext};
use crate::types::{Stage, WorkItem};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered PGIDs, waits for the grace period,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    tracing::info!(count = pgids.len(), "terminating agent subprocesses");
    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- CLI executor ---

/// Runs an external program per item.
///
/// The program is invoked as `<program> <args...> <request.json> <result.json>`.
/// It reads the [`ExecutionRequest`] from the first path and must write an
/// [`ExecutionOutcome`] to the second before exiting.
#[derive(Debug, Clone)]
pub struct CliAgentExecutor {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub work_dir: PathBuf,
}

impl CliAgentExecutor {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration, work_dir: PathBuf) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout,
            work_dir,
        }
    }

    fn exchange_paths(&self, item: &WorkItem) -> (PathBuf, PathBuf) {
        static NONCE: AtomicU64 = AtomicU64::new(0);
        let n = NONCE.fetch_add(1, Ordering::Relaxed);
        let base = format!("{}-{}-{}-{}", item.stage, item.id, std::process::id(), n);
        (
            self.work_dir.join(format!("{}.request.json", base)),
            self.work_dir.join(format!("{}.result.json", base)),
        )
    }
}

impl AgentExecutor for CliAgentExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
        context: &StageContext,
    ) -> Result<ExecutionOutcome, String> {
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            format!(
                "Failed to create agent work dir {}: {}",
                self.work_dir.display(),
                e
            )
        })?;

        let (request_path, result_path) = self.exchange_paths(item);
        let request = ExecutionRequest {
            stage: item.stage,
            item: item.clone(),
            context: context.clone(),
        };
        let body = serde_json::to_vec_pretty(&request)
            .map_err(|e| format!("Failed to serialize request: {}", e))?;
        tokio::fs::write(&request_path, body).await.map_err(|e| {
            format!(
                "Failed to write request file {}: {}",
                request_path.display(),
                e
            )
        })?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).arg(&request_path).arg(&result_path);
        let result = run_subprocess_agent(cmd, &result_path, self.timeout).await;

        if let Err(e) = tokio::fs::remove_file(&request_path).await {
            tracing::debug!(path = %request_path.display(), error = %e, "request file cleanup failed");
        }
        result
    }
}

/// Spawn a subprocess agent, enforce timeout, read result file.
///
/// The caller configures the `Command` (program, args, env); this function handles
/// process group isolation, timeout, and result parsing.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    result_path: &Path,
    timeout: Duration,
) -> Result<ExecutionOutcome, String> {
    // Unconditional delete avoids a TOCTOU on the stale check.
    match tokio::fs::remove_file(result_path).await {
        Ok(()) => tracing::warn!(path = %result_path.display(), "stale result file deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!(
                "Failed to remove stale result file {}: {}",
                result_path.display(),
                e
            ))
        }
    }

    // stdin MUST be null: with setpgid the child is in a background process group,
    // and any attempt to read from the terminal would cause SIGTTIN (silent stop).
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    tracing::debug!(pid = child_pid, timeout_secs = timeout.as_secs(), "agent subprocess spawned");

    register_child(pgid);

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    match wait_result {
        Err(_) => {
            tracing::debug!(pid = child_pid, "agent timed out, killing process group");
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            Err(format!(
                "Agent timed out after {} seconds",
                timeout.as_secs()
            ))
        }
        Ok(wait_result) => {
            let exit_status =
                wait_result.map_err(|e| format!("Error waiting for subprocess: {}", e))?;
            tracing::debug!(pid = child_pid, code = ?exit_status.code(), "agent subprocess exited");

            unregister_child(pgid);

            let outcome = read_result_file(result_path).await;

            match (exit_status.success(), outcome) {
                (true, Ok(outcome)) => {
                    cleanup_result_file(result_path).await;
                    Ok(outcome)
                }
                (false, Ok(outcome)) => {
                    tracing::warn!(
                        code = ?exit_status.code(),
                        "agent exited with non-zero status but produced a valid result"
                    );
                    cleanup_result_file(result_path).await;
                    Ok(outcome)
                }
                (_, Err(e)) => {
                    let exit_info = if exit_status.success() {
                        "zero exit".to_string()
                    } else {
                        format!("exit code {:?}", exit_status.code())
                    };
                    Err(format!("Agent failed ({}): {}", exit_info, e))
                }
            }
        }
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending a signal
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| tracing::warn!(error = %e, "kill_process_group task panicked"));
}

/// Read and decode an execution outcome JSON file.
pub async fn read_result_file(path: &Path) -> Result<ExecutionOutcome, String> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("Result file not found: {}", path.display())
        } else {
            format!("Failed to read result file {}: {}", path.display(), e)
        }
    })?;

    serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse result JSON from {}: {}", path.display(), e))
}

async fn cleanup_result_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to clean up result file");
    }
}

// --- HTTP executor ---

#[derive(Serialize)]
struct HttpRequestBody<'a> {
    #[serde(flatten)]
    request: &'a ExecutionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// POSTs the [`ExecutionRequest`] as JSON and decodes the response body as an
/// [`ExecutionOutcome`]. Transport errors and non-2xx responses are executor failures.
#[derive(Debug, Clone)]
pub struct HttpAgentExecutor {
    client: reqwest::Client,
    pub endpoint: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl HttpAgentExecutor {
    pub fn new(endpoint: &str, model: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            model,
            timeout,
        }
    }
}

impl AgentExecutor for HttpAgentExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
        context: &StageContext,
    ) -> Result<ExecutionOutcome, String> {
        let request = ExecutionRequest {
            stage: item.stage,
            item: item.clone(),
            context: context.clone(),
        };
        let body = HttpRequestBody {
            request: &request,
            model: self.model.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("Agent timed out after {} seconds", self.timeout.as_secs())
                } else {
                    format!("Agent request to {} failed: {}", self.endpoint, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!(
                "Agent endpoint returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            ));
        }

        response
            .json::<ExecutionOutcome>()
            .await
            .map_err(|e| format!("Failed to decode agent response: {}", e))
    }
}

// --- Mock executor ---

/// Scripted executor for smoke runs and tests.
///
/// Returns results from the configured sequence in order. Once the sequence is
/// exhausted every call returns the fallback outcome, or a synthetic success
/// payload when no fallback was set.
#[derive(Debug, Default)]
pub struct MockAgentExecutor {
    results: tokio::sync::Mutex<Vec<Result<ExecutionOutcome, String>>>,
    fallback: Option<Result<ExecutionOutcome, String>>,
    delay: Duration,
    calls: AtomicUsize,
    seen: tokio::sync::Mutex<Vec<(i64, StageContext)>>,
}

impl MockAgentExecutor {
    /// Create a mock that returns `results` in order (first call gets first result).
    pub fn new(results: Vec<Result<ExecutionOutcome, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            ..Default::default()
        }
    }

    /// A mock that returns `result` on every call.
    pub fn always(result: Result<ExecutionOutcome, String>) -> Self {
        Self::new(Vec::new()).with_fallback(result)
    }

    pub fn with_fallback(mut self, result: Result<ExecutionOutcome, String>) -> Self {
        self.fallback = Some(result);
        self
    }

    /// Sleep for `delay` before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Item ids and contexts received so far, in call order.
    pub async fn seen(&self) -> Vec<(i64, StageContext)> {
        self.seen.lock().await.clone()
    }
}

impl AgentExecutor for MockAgentExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
        context: &StageContext,
    ) -> Result<ExecutionOutcome, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push((item.id, context.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.results.lock().await.pop();
        match (scripted, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => Ok(ExecutionOutcome::succeeded(serde_json::json!({
                "executor": "mock",
                "stage": item.stage,
                "item_id": item.id,
            }))),
        }
    }
}

// --- Config-selected backend ---

/// The executor variant configured for a stage.
///
/// The scheduler only sees [`AgentExecutor`]; which transport is behind it is
/// decided here from [`ExecutorConfig`].
#[derive(Debug)]
pub enum AgentBackend {
    Cli(CliAgentExecutor),
    Http(HttpAgentExecutor),
    Mock(MockAgentExecutor),
}

impl AgentBackend {
    /// Build the backend for one stage. `work_dir` holds CLI request/result files.
    pub fn from_settings(settings: &StageSettings, work_dir: &Path) -> Self {
        match &settings.executor {
            ExecutorConfig::Mock => AgentBackend::Mock(MockAgentExecutor::default()),
            ExecutorConfig::Cli { program, args } => AgentBackend::Cli(CliAgentExecutor::new(
                program,
                args.clone(),
                settings.timeout(),
                work_dir.to_path_buf(),
            )),
            ExecutorConfig::Http { endpoint, model } => AgentBackend::Http(
                HttpAgentExecutor::new(endpoint, model.clone(), settings.timeout()),
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentBackend::Cli(_) => "cli",
            AgentBackend::Http(_) => "http",
            AgentBackend::Mock(_) => "mock",
        }
    }
}

impl AgentExecutor for AgentBackend {
    async fn execute(
        &self,
        item: &WorkItem,
        context: &StageContext,
    ) -> Result<ExecutionOutcome, String> {
        match self {
            AgentBackend::Cli(executor) => executor.execute(item, context).await,
            AgentBackend::Http(executor) => executor.execute(item, context).await,
            AgentBackend::Mock(executor) => executor.execute(item, context).await,
        }
    }
}

/// One backend per active stage, as configured.
pub fn backends_from_config(
    config: &StageGolemConfig,
    work_dir: &Path,
) -> BTreeMap<Stage, Arc<AgentBackend>> {
    config
        .all_stage_settings()
        .iter()
        .map(|settings| {
            (
                settings.stage,
                Arc::new(AgentBackend::from_settings(settings, work_dir)),
            )
        })
        .collect()
}
