//! LLM-backed answer validation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{
    CompletionRequest, Credentials, LlmProvider, RawVerdict, ValidationError, ValidationProvider,
    ValidationRequest,
};

const VALIDATOR_PROMPT: &str = "\
You review answers written by a tutor for a young learner. Score the answer \
from 0.0 to 1.0 against these criteria:
1. Factual consistency with the subject matter.
2. Appropriate for the learner's grade level.
3. Text and visual content do not contradict each other.
4. Concrete examples come before abstract rules.
5. Any visual matches what the text describes.

Reply with a single JSON object:
{\"confidence_score\": <number>, \"issues\": [<string>], \"required_fixes\": [<string>]}";

/// Asks a chat model for a JSON verdict.
pub struct LlmValidator {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    model: String,
}

impl LlmValidator {
    pub fn new(provider: Arc<dyn LlmProvider>, credentials: Credentials, model: String) -> Self {
        Self {
            provider,
            credentials,
            model,
        }
    }
}

/// Extract a verdict from model output, tolerating code fences and prose.
pub fn parse_verdict(raw: &str) -> Result<RawVerdict, ValidationError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => return Err(ValidationError::Unparseable(truncate(raw))),
    };
    let verdict: RawVerdict = serde_json::from_str(body)
        .map_err(|e| ValidationError::Unparseable(format!("{e}: {}", truncate(body))))?;
    if !(0.0..=1.0).contains(&verdict.confidence_score) {
        return Err(ValidationError::Unparseable(format!(
            "confidence_score {} is outside 0.0..=1.0",
            verdict.confidence_score
        )));
    }
    Ok(verdict)
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}

#[async_trait]
impl ValidationProvider for LlmValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<RawVerdict, ValidationError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| ValidationError::Provider(e.into()))?;
        let completion = CompletionRequest {
            model: self.model.clone(),
            messages: vec![json!({ "role": "user", "content": payload })],
            max_tokens: 512,
            temperature: Some(0.0),
            tools: None,
            system: Some(VALIDATOR_PROMPT.to_string()),
            json_response: true,
        };

        let text = self
            .provider
            .complete(&completion, &self.credentials)
            .await
            .map_err(ValidationError::Provider)?;

        debug!(
            responder = %request.responder_id,
            attempt = request.attempt,
            response_len = text.len(),
            "Validation response received"
        );
        parse_verdict(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let v = parse_verdict(r#"{"confidence_score":0.85,"issues":[],"required_fixes":[]}"#)
            .unwrap();
        assert_eq!(v.confidence_score, 0.85);
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"confidence_score\": 0.4, \"issues\": [\"too abstract\"], \"required_fixes\": [\"add an example\"]}\n```";
        let v = parse_verdict(raw).unwrap();
        assert_eq!(v.issues, vec!["too abstract"]);
        assert_eq!(v.required_fixes, vec!["add an example"]);
    }

    #[test]
    fn test_parse_out_of_range_score_is_unparseable() {
        for raw in [
            r#"{"confidence_score":85,"issues":[],"required_fixes":[]}"#,
            r#"{"confidence_score":-0.1}"#,
        ] {
            assert!(matches!(parse_verdict(raw), Err(ValidationError::Unparseable(_))));
        }
        assert_eq!(parse_verdict(r#"{"confidence_score":1.0}"#).unwrap().confidence_score, 1.0);
    }

    #[test]
    fn test_parse_missing_score_is_unparseable() {
        assert!(matches!(
            parse_verdict(r#"{"issues":[]}"#),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            parse_verdict("looks fine to me"),
            Err(ValidationError::Unparseable(_))
        ));
    }
}
