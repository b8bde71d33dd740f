mod common;

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use stage_golem::agent::{
    backends_from_config, read_result_file, run_subprocess_agent, AgentBackend, CliAgentExecutor,
    HttpAgentExecutor, MockAgentExecutor,
};
use stage_golem::config::{ExecutorConfig, StageGolemConfig, StageOverrides, StageSettings};
use stage_golem::executor::{AgentExecutor, ExecutionOutcome, OutcomeClass, StageContext};
use stage_golem::types::*;

use common::{add_item, fixtures_dir, setup_store};

fn fixture(name: &str) -> String {
    fixtures_dir().join(name).to_string_lossy().into_owned()
}

fn bash_command(script: &str, request: &Path, result: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg(fixture(script)).arg(request).arg(result);
    cmd
}

fn sample_item() -> WorkItem {
    let (_dir, store) = setup_store();
    let id = add_item(&store, "t3_sample", Stage::Research);
    store.get_item(id).unwrap()
}

// --- Result file ---

#[tokio::test]
async fn read_result_file_decodes_outcome() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("result.json");
    std::fs::write(
        &path,
        r#"{"success": true, "outcome": "unverifiable", "usage_units": 7, "payload": {"claims": 0}}"#,
    )
    .unwrap();

    let outcome = read_result_file(&path).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.outcome, OutcomeClass::Unverifiable);
    assert_eq!(outcome.usage_units, 7);
    assert_eq!(outcome.payload.unwrap()["claims"], 0);
}

#[tokio::test]
async fn read_result_file_missing() {
    let dir = TempDir::new().unwrap();
    let err = read_result_file(&dir.path().join("absent.json"))
        .await
        .unwrap_err();
    assert!(err.contains("not found"), "unexpected error: {}", err);
}

#[tokio::test]
async fn read_result_file_invalid_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("result.json");
    std::fs::write(&path, "{ nope").unwrap();
    let err = read_result_file(&path).await.unwrap_err();
    assert!(err.contains("parse"), "unexpected error: {}", err);
}

// --- Subprocess runner ---

#[tokio::test]
async fn subprocess_success_returns_outcome_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, r#"{"hello": "agent"}"#).unwrap();

    let outcome = run_subprocess_agent(
        bash_command("mock_agent_success.sh", &request, &result),
        &result,
        Duration::from_secs(10),
    )
    .await
    .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.usage_units, 42);
    assert_eq!(outcome.payload.unwrap()["request"]["hello"], "agent");
    assert!(!result.exists());
}

#[tokio::test]
async fn subprocess_without_result_reports_exit_code() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, "{}").unwrap();

    let err = run_subprocess_agent(
        bash_command("mock_agent_fail.sh", &request, &result),
        &result,
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();
    assert!(err.contains("exit code"), "unexpected error: {}", err);
}

#[tokio::test]
async fn subprocess_timeout_is_an_error() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, "{}").unwrap();

    let err = run_subprocess_agent(
        bash_command("mock_agent_timeout.sh", &request, &result),
        &result,
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();
    assert!(err.contains("timed out"), "unexpected error: {}", err);
}

#[tokio::test]
async fn subprocess_bad_json_is_an_error() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, "{}").unwrap();

    let err = run_subprocess_agent(
        bash_command("mock_agent_bad_json.sh", &request, &result),
        &result,
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();
    assert!(err.contains("parse"), "unexpected error: {}", err);
}

#[tokio::test]
async fn subprocess_nonzero_exit_with_valid_result_is_accepted() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, "{}").unwrap();

    let outcome = run_subprocess_agent(
        bash_command("mock_agent_reject.sh", &request, &result),
        &result,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(outcome.outcome, OutcomeClass::Reject);
}

#[tokio::test]
async fn stale_result_file_is_removed_before_spawn() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("req.json");
    let result = dir.path().join("res.json");
    std::fs::write(&request, "{}").unwrap();
    std::fs::write(&result, r#"{"success": true, "payload": {"stale": true}}"#).unwrap();

    let err = run_subprocess_agent(
        bash_command("mock_agent_fail.sh", &request, &result),
        &result,
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();
    assert!(err.contains("not found"), "unexpected error: {}", err);
}

// --- CLI executor ---

#[tokio::test]
async fn cli_executor_sends_item_and_context() {
    let work = TempDir::new().unwrap();
    let item = sample_item();
    let mut context = StageContext::new();
    context.insert("triage_result".to_string(), serde_json::json!({"relevant": true}));

    let executor = CliAgentExecutor::new(
        "bash",
        vec![fixture("mock_agent_success.sh")],
        Duration::from_secs(10),
        work.path().join("agent"),
    );
    let outcome = executor.execute(&item, &context).await.unwrap();

    let request = &outcome.payload.unwrap()["request"];
    assert_eq!(request["stage"], "research");
    assert_eq!(request["item"]["id"], item.id);
    assert_eq!(request["item"]["external_id"], "t3_sample");
    assert_eq!(request["context"]["triage_result"]["relevant"], true);

    let leftovers = std::fs::read_dir(work.path().join("agent")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn cli_executor_missing_program_is_an_error() {
    let work = TempDir::new().unwrap();
    let executor = CliAgentExecutor::new(
        "/nonexistent/agent-binary",
        Vec::new(),
        Duration::from_secs(5),
        work.path().to_path_buf(),
    );
    let err = executor
        .execute(&sample_item(), &StageContext::new())
        .await
        .unwrap_err();
    assert!(err.contains("spawn"), "unexpected error: {}", err);
}

// --- HTTP executor ---

#[tokio::test]
async fn http_executor_unreachable_endpoint_is_an_error() {
    let executor = HttpAgentExecutor::new("http://127.0.0.1:1/agent", None, Duration::from_secs(5));
    let err = executor
        .execute(&sample_item(), &StageContext::new())
        .await
        .unwrap_err();
    assert!(err.contains("127.0.0.1:1"), "unexpected error: {}", err);
}

// --- Mock executor ---

#[tokio::test]
async fn mock_returns_script_then_fallback() {
    let item = sample_item();
    let mock = MockAgentExecutor::new(vec![
        Ok(ExecutionOutcome::failed("first")),
        Err("second".to_string()),
    ])
    .with_fallback(Ok(ExecutionOutcome::failed("after")));
    let context = StageContext::new();

    assert_eq!(
        mock.execute(&item, &context).await.unwrap().error.as_deref(),
        Some("first")
    );
    assert_eq!(mock.execute(&item, &context).await.unwrap_err(), "second");
    assert_eq!(
        mock.execute(&item, &context).await.unwrap().error.as_deref(),
        Some("after")
    );
    assert_eq!(mock.calls(), 3);
}

#[tokio::test]
async fn unscripted_mock_succeeds_with_synthetic_payload() {
    let item = sample_item();
    let outcome = MockAgentExecutor::default()
        .execute(&item, &StageContext::new())
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.next_stage.is_none());
    let payload = outcome.payload.unwrap();
    assert_eq!(payload["executor"], "mock");
    assert_eq!(payload["item_id"], item.id);
}

// --- Backend selection ---

#[test]
fn backend_follows_stage_executor_config() {
    let dir = TempDir::new().unwrap();

    let mock = AgentBackend::from_settings(&StageSettings::defaults_for(Stage::Triage), dir.path());
    assert_eq!(mock.kind(), "mock");

    let mut settings = StageSettings::defaults_for(Stage::Research);
    settings.executor = ExecutorConfig::Cli {
        program: "research-agent".to_string(),
        args: vec!["--fast".to_string()],
    };
    match AgentBackend::from_settings(&settings, dir.path()) {
        AgentBackend::Cli(cli) => {
            assert_eq!(cli.program, "research-agent");
            assert_eq!(cli.args, vec!["--fast".to_string()]);
            assert_eq!(cli.timeout, Duration::from_secs(600));
            assert_eq!(cli.work_dir, dir.path());
        }
        other => panic!("expected cli backend, got {}", other.kind()),
    }

    settings.executor = ExecutorConfig::Http {
        endpoint: "https://agents.internal/respond".to_string(),
        model: Some("large".to_string()),
    };
    match AgentBackend::from_settings(&settings, dir.path()) {
        AgentBackend::Http(http) => {
            assert_eq!(http.endpoint, "https://agents.internal/respond");
            assert_eq!(http.model.as_deref(), Some("large"));
        }
        other => panic!("expected http backend, got {}", other.kind()),
    }
}

#[test]
fn backends_cover_every_active_stage() {
    let dir = TempDir::new().unwrap();
    let mut config = StageGolemConfig::default();
    config.stages.insert(
        "editorial".to_string(),
        StageOverrides {
            executor: Some(ExecutorConfig::Http {
                endpoint: "http://localhost:8080".to_string(),
                model: None,
            }),
            ..Default::default()
        },
    );

    let backends = backends_from_config(&config, dir.path());
    let stages: Vec<Stage> = backends.keys().copied().collect();
    assert_eq!(stages, Stage::ACTIVE.to_vec());
    assert_eq!(backends[&Stage::Triage].kind(), "mock");
    assert_eq!(backends[&Stage::Editorial].kind(), "http");
}
