use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::warn;

use inkflow_core::error::Result;
use inkflow_core::traits::{ModelClient, Validation, Validator};
use inkflow_core::types::ChatMessage;

use crate::output_validator::OutputCleaner;

/// Validator that asks a model to review the candidate.
///
/// The model must answer with `{"approved": bool, "feedback": "..."}`.
/// An answer that cannot be parsed counts as a rejection.
pub struct ModelJudgeValidator {
    model: Arc<dyn ModelClient>,
    criteria: String,
}

impl ModelJudgeValidator {
    pub fn new(model: Arc<dyn ModelClient>, criteria: impl Into<String>) -> Self {
        Self {
            model,
            criteria: criteria.into(),
        }
    }

    fn prompt(&self, candidate: &str) -> String {
        format!(
            r#"You are reviewing generated content before it is saved.

Review criteria:
{}

Content:
{}

Respond with ONLY valid JSON:
{{
  "approved": true | false,
  "feedback": "what must change (only if not approved)"
}}"#,
            self.criteria, candidate
        )
    }
}

impl Validator for ModelJudgeValidator {
    fn validate(&self, candidate: String) -> BoxFuture<'_, Result<Validation>> {
        Box::pin(async move {
            let messages = vec![ChatMessage::user(self.prompt(&candidate))];
            let response = self.model.invoke(messages, &[]).await?;
            Ok(parse_review(&response.message.text(), candidate))
        })
    }
}

/// Response from the reviewing model.
#[derive(Deserialize)]
struct ReviewResponse {
    approved: bool,
    #[serde(default)]
    feedback: String,
}

/// Turn the reviewer's answer into a verdict on `candidate`.
///
/// Approved candidates become JSON artifacts when they parse as JSON and
/// string artifacts otherwise.
fn parse_review(response: &str, candidate: String) -> Validation {
    match OutputCleaner::parse_json(extract_json(response))
        .and_then(serde_json::from_value::<ReviewResponse>)
    {
        Ok(review) if review.approved => {
            let artifact = OutputCleaner::parse_json(&candidate)
                .unwrap_or(serde_json::Value::String(candidate));
            Validation::Valid(artifact)
        }
        Ok(review) => Validation::invalid(if review.feedback.is_empty() {
            "Reviewer rejected the content without feedback.".to_string()
        } else {
            review.feedback
        }),
        Err(e) => {
            warn!(error = %e, response = %response, "Failed to parse review response");
            Validation::invalid("Review response was not valid JSON; revise and resubmit.")
        }
    }
}

/// Extract the outermost JSON object from a response with surrounding prose.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.contains("```") {
        return trimmed;
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkflow_test_utils::{text_reply, ScriptedModel};
    use serde_json::json;

    #[test]
    fn test_approved_json_candidate() {
        let verdict = parse_review(r#"{"approved": true}"#, r#"{"cases": []}"#.to_string());
        assert_eq!(verdict, Validation::Valid(json!({"cases": []})));
    }

    #[test]
    fn test_approved_text_candidate() {
        let verdict = parse_review(
            "Sure! {\"approved\": true, \"feedback\": \"\"} Hope that helps.",
            "As a user I want to reset my password".to_string(),
        );
        assert_eq!(
            verdict,
            Validation::Valid(json!("As a user I want to reset my password"))
        );
    }

    #[test]
    fn test_rejection_carries_feedback() {
        let verdict = parse_review(
            "```json\n{\"approved\": false, \"feedback\": \"Add acceptance criteria\"}\n```",
            "draft".to_string(),
        );
        assert_eq!(verdict, Validation::invalid("Add acceptance criteria"));
    }

    #[test]
    fn test_garbage_counts_as_rejection() {
        let verdict = parse_review("looks fine to me", "draft".to_string());
        assert!(!verdict.is_valid());
    }

    #[tokio::test]
    async fn test_judge_sends_criteria_and_candidate() {
        let model = ScriptedModel::new(vec![text_reply(r#"{"approved": false, "feedback": "too vague"}"#)]);
        let judge = ModelJudgeValidator::new(Arc::new(model.clone()), "Every story needs a persona.");
        let verdict = judge.validate("Build login".into()).await.unwrap();
        assert_eq!(verdict, Validation::invalid("too vague"));

        let sent = model.calls()[0][0].text();
        assert!(sent.contains("Every story needs a persona."));
        assert!(sent.contains("Build login"));
    }
}
