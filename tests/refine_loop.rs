use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use inkflow_agent::{
    generator_fn, Generation, JsonShapeValidator, ModelGenerator, ModelJudgeValidator, RefineLoop,
    RefineState, RefineStatus,
};
use inkflow_core::config::AppConfig;
use inkflow_core::error::{InkflowError, Result};
use inkflow_core::event::{EventKind, EventSink};
use inkflow_graph::{CheckpointStore, MemoryCheckpointStore, RunOptions};
use inkflow_test_utils::{text_reply, ScriptedModel, ScriptedValidator};

fn numbered(state: RefineState) -> BoxFuture<'static, Result<Generation>> {
    Box::pin(async move { Ok(Generation::new(format!("candidate {}", state.attempts + 1))) })
}

#[tokio::test]
async fn test_accepts_third_candidate_within_ceiling() {
    let validator = ScriptedValidator::rejecting(2);
    let outcome = RefineLoop::new(generator_fn(numbered), validator.clone())
        .with_max_retries(3)
        .run(json!({"story": "reset password"}), RunOptions::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(
        outcome.path,
        vec!["generate", "validate", "generate", "validate", "generate", "validate"]
    );
    let state = outcome.state;
    assert_eq!(state.attempts, 3);
    assert_eq!(state.retries, 2);
    assert_eq!(state.status, RefineStatus::Validated);
    assert_eq!(state.artifact, Some(Value::String("candidate 3".into())));
    assert_eq!(state.last_error, None);
    assert_eq!(
        validator.seen(),
        vec!["candidate 1", "candidate 2", "candidate 3"]
    );
}

#[tokio::test]
async fn test_ceiling_ends_loop_without_artifact() {
    let outcome = RefineLoop::new(generator_fn(numbered), ScriptedValidator::always_rejecting())
        .with_max_retries(3)
        .run(Value::Null, RunOptions::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    let state = outcome.state;
    assert_eq!(state.attempts, 3);
    assert_eq!(state.retries, 3);
    assert_eq!(state.status, RefineStatus::Exhausted);
    assert_eq!(state.artifact, None);
    assert_eq!(state.last_error.as_deref(), Some("attempt 3 rejected"));
}

#[tokio::test]
async fn test_generator_error_fails_the_run() {
    let generator = generator_fn(|_s: RefineState| -> BoxFuture<'static, Result<Generation>> {
        Box::pin(async { Err(InkflowError::Model("quota exceeded".into())) })
    });
    let outcome = RefineLoop::new(generator, ScriptedValidator::rejecting(0))
        .run(Value::Null, RunOptions::new())
        .await
        .unwrap();

    match outcome.error() {
        Some(InkflowError::NodeFailed { node, source }) => {
            assert_eq!(node, "generate");
            assert!(matches!(**source, InkflowError::Model(_)));
        }
        other => panic!("expected node failure, got {:?}", other),
    }
    assert_eq!(outcome.state.attempts, 0);
}

#[tokio::test]
async fn test_model_generator_with_shape_validator() {
    let model = ScriptedModel::new(vec![
        text_reply("Sure! Here are some test cases."),
        text_reply("```json\n{\"title\": \"Reset\", \"cases\": [{\"name\": \"happy path\"}]\n```"),
    ]);
    let generator = ModelGenerator::new(Arc::new(model.clone()), "Return test cases as JSON.");
    let validator = JsonShapeValidator::new().require("title").require("cases");

    let config = AppConfig::parse("[refine]\nmax_retries = 2\n").unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let (sink, mut events) = EventSink::channel();
    let outcome = RefineLoop::new(generator, validator)
        .with_config(&config.refine)
        .run(
            json!({"story": "As a user I want to reset my password"}),
            RunOptions::new()
                .with_run_id("refine-1")
                .with_checkpoints(store.clone())
                .with_events(sink),
        )
        .await
        .unwrap();

    let state = outcome.into_result().unwrap();
    assert_eq!(state.status, RefineStatus::Validated);
    assert_eq!(
        state.artifact,
        Some(json!({"title": "Reset", "cases": [{"name": "happy path"}]}))
    );
    assert_eq!(state.replies().count(), 2);
    assert!(model.calls()[1]
        .last()
        .unwrap()
        .text()
        .contains("not valid JSON"));

    assert_eq!(store.list("refine-1").unwrap().len(), 4);
    let mut changed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventKind::StepCompleted { changed: fields, .. } = event.kind {
            changed.push(fields);
        }
    }
    assert_eq!(changed.len(), 4);
    assert!(changed[1].contains(&"last_error".to_string()));
}

#[tokio::test]
async fn test_judge_feedback_reaches_generator() {
    let writer = ScriptedModel::new(vec![
        text_reply("Users can reset passwords."),
        text_reply("As a locked-out user I want to reset my password so that I can sign in."),
    ]);
    let reviewer = ScriptedModel::new(vec![
        text_reply(r#"{"approved": false, "feedback": "Name the persona and the benefit."}"#),
        text_reply(r#"{"approved": true}"#),
    ]);
    let outcome = RefineLoop::new(
        ModelGenerator::new(Arc::new(writer.clone()), "Write one user story."),
        ModelJudgeValidator::new(Arc::new(reviewer), "Stories follow As a / I want / so that."),
    )
    .run(json!("password reset"), RunOptions::new())
    .await
    .unwrap();

    let state = outcome.into_result().unwrap();
    assert_eq!(state.attempts, 2);
    assert_eq!(
        state.artifact,
        Some(json!(
            "As a locked-out user I want to reset my password so that I can sign in."
        ))
    );
    let retry_prompt = writer.calls()[1].last().unwrap().text();
    assert!(retry_prompt.contains("Name the persona and the benefit."));
}
