use futures::future::BoxFuture;
use tracing::debug;

use inkflow_core::error::Result;
use inkflow_core::traits::{Validation, Validator};

/// Checks that a candidate is a JSON object with the expected shape.
///
/// Candidates are repaired heuristically first (code fences stripped,
/// unclosed braces balanced), so a model answer wrapped in markdown still
/// validates. The repaired, parsed object becomes the artifact.
#[derive(Debug, Clone)]
pub struct JsonShapeValidator {
    /// Keys that must be present in the object.
    pub required_keys: Vec<String>,
    /// Maximum allowed candidate length (characters).
    pub max_length: usize,
}

impl JsonShapeValidator {
    /// No required keys, 100K max length.
    pub fn new() -> Self {
        Self {
            required_keys: vec![],
            max_length: 100_000,
        }
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Validate the candidate; all issues are reported together.
    pub fn check(&self, candidate: &str) -> Validation {
        let mut issues = Vec::new();

        if candidate.chars().count() > self.max_length {
            issues.push(format!(
                "Output exceeds max length: {} > {}",
                candidate.chars().count(),
                self.max_length
            ));
        }

        let repaired = OutputCleaner::heuristic_repair(candidate);
        let value = match serde_json::from_str::<serde_json::Value>(&repaired) {
            Ok(val) => {
                if let Some(obj) = val.as_object() {
                    for key in &self.required_keys {
                        if !obj.contains_key(key) {
                            issues.push(format!("Missing required key: '{}'", key));
                        }
                    }
                } else {
                    issues.push("Expected JSON object but got non-object".to_string());
                }
                Some(val)
            }
            Err(e) => {
                issues.push(format!("Output is not valid JSON: {}", e));
                None
            }
        };

        match value {
            Some(val) if issues.is_empty() => Validation::Valid(val),
            _ => {
                debug!(issues = issues.len(), "Candidate rejected");
                Validation::invalid(issues.join("; "))
            }
        }
    }
}

impl Default for JsonShapeValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for JsonShapeValidator {
    fn validate(&self, candidate: String) -> BoxFuture<'_, Result<Validation>> {
        let verdict = self.check(&candidate);
        Box::pin(async move { Ok(verdict) })
    }
}

/// Validator backed by a synchronous closure.
pub struct FnValidator<F> {
    f: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&str) -> std::result::Result<serde_json::Value, String> + Send + Sync + 'static,
{
    /// `Ok(artifact)` accepts, `Err(reason)` rejects.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&str) -> std::result::Result<serde_json::Value, String> + Send + Sync + 'static,
{
    fn validate(&self, candidate: String) -> BoxFuture<'_, Result<Validation>> {
        let verdict = match (self.f)(&candidate) {
            Ok(value) => Validation::Valid(value),
            Err(reason) => Validation::Invalid { reason },
        };
        Box::pin(async move { Ok(verdict) })
    }
}

/// Heuristic repair of malformed model output.
pub struct OutputCleaner;

impl OutputCleaner {
    /// - Strips markdown code fences
    /// - Balances JSON braces
    /// - Trims whitespace
    pub fn heuristic_repair(output: &str) -> String {
        let result = strip_code_fences(output).trim().to_string();

        if result.starts_with('{') || result.starts_with('[') {
            balance_braces(&result)
        } else {
            result
        }
    }

    /// Repair, then parse as JSON.
    pub fn parse_json(output: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&Self::heuristic_repair(output))
    }
}

/// Extract content from markdown code fences.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Balance JSON braces/brackets by appending missing closers.
///
/// Closers are appended in reverse opening order, so `{"a": [1` becomes
/// `{"a": [1]}`.
fn balance_braces(text: &str) -> String {
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    result.extend(open.into_iter().rev());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_object_with_required_keys() {
        let validator = JsonShapeValidator::new().require("title").require("steps");
        let verdict = validator.check(r#"{"title": "Login", "steps": ["open", "submit"]}"#);
        assert_eq!(
            verdict,
            Validation::Valid(json!({"title": "Login", "steps": ["open", "submit"]}))
        );
    }

    #[test]
    fn test_missing_key_reason() {
        let validator = JsonShapeValidator::new().require("title").require("steps");
        match validator.check(r#"{"title": "Login"}"#) {
            Validation::Invalid { reason } => assert!(reason.contains("'steps'")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_fenced_and_truncated_output_is_repaired() {
        let validator = JsonShapeValidator::new().require("cases");
        let verdict = validator.check("```json\n{\"cases\": [{\"id\": 1}\n```");
        assert_eq!(verdict, Validation::Valid(json!({"cases": [{"id": 1}]})));
    }

    #[test]
    fn test_non_object_rejected() {
        let verdict = JsonShapeValidator::new().check("[1, 2]");
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_max_length() {
        let verdict = JsonShapeValidator::new()
            .with_max_length(5)
            .check(r#"{"a": 1}"#);
        match verdict {
            Validation::Invalid { reason } => assert!(reason.contains("max length")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_not_json() {
        match JsonShapeValidator::new().check("Here are your test cases!") {
            Validation::Invalid { reason } => assert!(reason.contains("not valid JSON")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_balance_nested_order() {
        assert_eq!(balance_braces(r#"{"a": [1, {"b": 2"#), r#"{"a": [1, {"b": 2}]}"#);
        assert_eq!(balance_braces(r#"{"a": "x}"#), r#"{"a": "x}"}"#);
    }

    #[test]
    fn test_strip_fence_with_language_tag() {
        assert_eq!(strip_code_fences("```text\nhello\n```"), "hello");
        assert_eq!(strip_code_fences("no fences"), "no fences");
    }

    #[tokio::test]
    async fn test_fn_validator() {
        let validator = FnValidator::new(|c: &str| {
            if c.contains("Given") {
                Ok(json!(c))
            } else {
                Err("missing Given clause".to_string())
            }
        });
        assert!(validator
            .validate("Given a user".into())
            .await
            .unwrap()
            .is_valid());
        assert_eq!(
            validator.validate("When".into()).await.unwrap(),
            Validation::invalid("missing Given clause")
        );
    }
}
