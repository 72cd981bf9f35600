use std::io::Write;
use std::time::Duration;

use serde_json::json;

use inkflow_agent::{generator_fn, AgentLoopConfig, Generation, RefineLoop, RefineState};
use inkflow_core::config::{AppConfig, CheckpointBackend};
use inkflow_core::error::InkflowError;
use inkflow_graph::{CheckpointStore, RunOptions, SqliteCheckpointStore};
use inkflow_test_utils::ScriptedValidator;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
recursion_limit = 40
run_timeout_secs = 300

[agent]
max_model_calls = 6
parallel_tools = false
tool_timeout_secs = 15

[refine]
max_retries = 5

[checkpoint]
backend = "sqlite"
path = "/var/lib/inkflow/runs.db"

[log]
filter = "inkflow=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.recursion_limit, 40);
    assert_eq!(config.run_timeout(), Some(Duration::from_secs(300)));
    assert_eq!(config.agent.max_model_calls, 6);
    assert!(!config.agent.parallel_tools);
    assert_eq!(config.refine.max_retries, 5);
    assert_eq!(config.checkpoint.backend, CheckpointBackend::Sqlite);
    assert_eq!(config.checkpoint.path, "/var/lib/inkflow/runs.db");
    assert_eq!(config.log.filter, "inkflow=debug");
}

#[test]
fn test_config_feeds_run_and_agent_options() {
    let config = AppConfig::parse(
        r#"
[engine]
recursion_limit = 12
run_timeout_secs = 30

[agent]
tool_timeout_secs = 5
"#,
    )
    .unwrap();

    let options = RunOptions::from_config(&config).unwrap();
    assert_eq!(options.recursion_limit, 12);
    assert_eq!(options.timeout, Some(Duration::from_secs(30)));

    let agent = AgentLoopConfig::from_config(&config.agent);
    assert_eq!(agent.tool_timeout_secs, Some(5));
    assert_eq!(agent.max_model_calls, 10);
    assert!(agent.parallel_tools);
}

#[tokio::test]
async fn test_sqlite_backend_persists_run_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runs.db");
    let config = AppConfig::parse(&format!(
        "[checkpoint]\nbackend = \"sqlite\"\npath = \"{}\"\n",
        db.display()
    ))
    .unwrap();

    let generator = generator_fn(|_s: RefineState| async { Ok::<_, InkflowError>(Generation::new("draft")) });
    let outcome = RefineLoop::new(generator, ScriptedValidator::rejecting(0))
        .run(
            json!("story"),
            RunOptions::from_config(&config).unwrap().with_run_id("persisted"),
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let reopened = SqliteCheckpointStore::open(&db).unwrap();
    let nodes: Vec<String> = reopened
        .list("persisted")
        .unwrap()
        .into_iter()
        .map(|r| r.node)
        .collect();
    assert_eq!(nodes, vec!["generate", "validate"]);
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("INKFLOW_TEST_DB_PATH", "/tmp/inkflow-env.db");
    let config = AppConfig::parse(
        r#"
[checkpoint]
backend = "sqlite"
path = "${INKFLOW_TEST_DB_PATH}"
"#,
    )
    .unwrap();
    assert_eq!(config.checkpoint.path, "/tmp/inkflow-env.db");
}

#[test]
fn test_load_or_default_without_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.engine.recursion_limit, 25);
    assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
    assert_eq!(config.run_timeout(), None);
}

#[test]
fn test_unknown_backend_is_rejected() {
    let err = AppConfig::parse("[checkpoint]\nbackend = \"redis\"\n").unwrap_err();
    assert!(matches!(err, InkflowError::Config(_)));
}
