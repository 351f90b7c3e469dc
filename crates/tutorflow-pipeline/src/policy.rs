//! Selection policies: who answers when no responder is active.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use tutorflow_core::session::TurnRecord;
use tutorflow_core::types::{Responder, RoutingDecision, RoutingReason};
use tutorflow_providers::{CompletionRequest, Credentials, LlmProvider};

/// What a policy may look at besides the turn text.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    /// Responders that can be selected, in registry order.
    pub responders: Vec<Arc<Responder>>,
    /// Recent turns of the session, oldest first.
    pub history: Vec<TurnRecord>,
    pub default_responder: String,
}

/// Strategy that picks a responder (or answers directly) for a turn.
#[async_trait]
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, turn: &str, context: &SelectionContext) -> anyhow::Result<RoutingDecision>;
}

// --- LLM policy ---

const POLICY_PROMPT: &str = "You route a learner's message to the best tutor. \
Reply with one JSON object: {\"responder\": <tutor id or null>, \"reason\": <short string>, \
\"handoff_message\": <one friendly sentence introducing the tutor, or null>, \
\"reply\": <your own short answer when no tutor is needed, or null>}. \
Pick a tutor for anything that needs teaching; answer directly only for greetings or small talk \
that needs no tutor.";

/// Asks a model for a JSON routing decision.
pub struct LlmSelectionPolicy {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    model: String,
}

impl LlmSelectionPolicy {
    pub fn new(provider: Arc<dyn LlmProvider>, credentials: Credentials, model: String) -> Self {
        Self {
            provider,
            credentials,
            model,
        }
    }
}

/// Render the responder list and the turn into the policy's user message.
pub fn build_policy_message(turn: &str, context: &SelectionContext) -> String {
    let mut message = String::from("Tutors:\n");
    for responder in &context.responders {
        message.push_str(&format!(
            "- {}: {} ({})\n",
            responder.id, responder.description, responder.capability
        ));
    }
    if !context.history.is_empty() {
        message.push_str("\nRecent conversation:\n");
        for record in &context.history {
            message.push_str(&format!("Learner: {}\n", record.user_text));
            if !record.reply_text.is_empty() {
                message.push_str(&format!("Tutor: {}\n", record.reply_text));
            }
        }
    }
    message.push_str(&format!("\nLearner message: {turn}\n"));
    message
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    responder: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    handoff_message: Option<String>,
    #[serde(default)]
    reply: Option<String>,
}

/// Parse a model's routing answer. Anything without a responder or a reply is an error.
pub fn parse_policy_decision(raw: &str) -> anyhow::Result<RoutingDecision> {
    let body = match (raw.find('{'), raw.rfind('}')) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => anyhow::bail!("no JSON object in policy response"),
    };
    let decision: RawDecision = serde_json::from_str(body)?;
    if let Some(reason) = &decision.reason {
        debug!(reason = %reason, "Policy rationale");
    }

    let responder = decision.responder.filter(|r| !r.trim().is_empty());
    let reply = decision.reply.filter(|r| !r.trim().is_empty());
    match (responder, reply) {
        (Some(id), _) => Ok(
            RoutingDecision::to_responder(id.trim(), RoutingReason::Selected)
                .with_handoff_message(decision.handoff_message),
        ),
        (None, Some(reply)) => Ok(RoutingDecision::direct(reply)),
        (None, None) => anyhow::bail!("policy response names neither a responder nor a reply"),
    }
}

#[async_trait]
impl SelectionPolicy for LlmSelectionPolicy {
    fn name(&self) -> &str {
        "llm"
    }

    async fn decide(&self, turn: &str, context: &SelectionContext) -> anyhow::Result<RoutingDecision> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![json!({ "role": "user", "content": build_policy_message(turn, context) })],
            max_tokens: 300,
            temperature: Some(0.0),
            tools: None,
            system: Some(POLICY_PROMPT.to_string()),
            json_response: true,
        };
        let text = self.provider.complete(&request, &self.credentials).await?;
        parse_policy_decision(&text)
    }
}

// --- Keyword policy ---

/// Deterministic policy: the responder whose keywords and capability best
/// match the turn wins; ties go to registry order; no match selects the
/// default responder.
#[derive(Debug, Default)]
pub struct KeywordPolicy;

fn score(responder: &Responder, turn: &str) -> usize {
    let words: Vec<&str> = turn
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let hits = |term: &str| {
        let term = term.to_lowercase();
        if term.contains(' ') {
            usize::from(turn.contains(&term))
        } else {
            words.iter().filter(|w| **w == term).count()
        }
    };
    responder.keywords.iter().map(|k| hits(k.as_str())).sum::<usize>()
        + hits(responder.capability.as_str())
}

#[async_trait]
impl SelectionPolicy for KeywordPolicy {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn decide(&self, turn: &str, context: &SelectionContext) -> anyhow::Result<RoutingDecision> {
        let turn = turn.to_lowercase();
        let mut best: Option<(&Arc<Responder>, usize)> = None;
        for responder in &context.responders {
            let s = score(responder, &turn);
            if s > 0 && best.is_none_or(|(_, top)| s > top) {
                best = Some((responder, s));
            }
        }

        let (id, name) = match best {
            Some((responder, _)) => (responder.id.clone(), responder.name.clone()),
            None => {
                let id = context.default_responder.clone();
                let name = context
                    .responders
                    .iter()
                    .find(|r| r.id == id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                (id, name)
            }
        };
        let who = if name.is_empty() { id.clone() } else { name };
        Ok(RoutingDecision::to_responder(id, RoutingReason::Selected)
            .with_handoff_message(Some(format!("{who} will help you with this."))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorflow_core::types::{QualityTier, RouteTarget};

    fn responder(id: &str, capability: &str, keywords: &[&str]) -> Arc<Responder> {
        Arc::new(Responder {
            id: id.into(),
            name: format!("{id} tutor"),
            description: format!("Teaches {capability}"),
            capability: capability.into(),
            tier: QualityTier::Standard,
            system_prompt: String::new(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            file_path: Default::default(),
        })
    }

    fn context() -> SelectionContext {
        SelectionContext {
            responders: vec![
                responder("fractions", "fractions", &["half", "quarter", "denominator"]),
                responder("geometry", "geometry", &["triangle", "angle", "area"]),
                responder("general", "general", &[]),
            ],
            history: vec![],
            default_responder: "general".into(),
        }
    }

    #[test]
    fn test_parse_responder_decision() {
        let d = parse_policy_decision(
            r#"{"responder":"fractions","reason":"math","handoff_message":"Meet the fractions tutor!"}"#,
        )
        .unwrap();
        assert_eq!(d.responder_id(), Some("fractions"));
        assert_eq!(d.reason, RoutingReason::Selected);
        assert_eq!(d.handoff_message.as_deref(), Some("Meet the fractions tutor!"));
    }

    #[test]
    fn test_parse_direct_reply() {
        let d = parse_policy_decision("```json\n{\"responder\": null, \"reply\": \"Hi there!\"}\n```").unwrap();
        assert_eq!(
            d.target,
            RouteTarget::Direct {
                reply: "Hi there!".into()
            }
        );
        assert_eq!(d.reason, RoutingReason::Direct);
    }

    #[test]
    fn test_parse_rejects_empty_or_garbage() {
        assert!(parse_policy_decision("I think fractions").is_err());
        assert!(parse_policy_decision(r#"{"responder":"  ","reply":""}"#).is_err());
        assert!(parse_policy_decision(r#"{"responder": 7}"#).is_err());
    }

    #[test]
    fn test_policy_message_lists_responders() {
        let message = build_policy_message("What is a half?", &context());
        assert!(message.contains("- fractions: Teaches fractions (fractions)"));
        assert!(message.ends_with("Learner message: What is a half?\n"));
    }

    #[tokio::test]
    async fn test_keyword_policy_picks_best_match() {
        let d = KeywordPolicy
            .decide("What is the area of a triangle?", &context())
            .await
            .unwrap();
        assert_eq!(d.responder_id(), Some("geometry"));
        assert!(d.handoff_message.unwrap().contains("geometry tutor"));
    }

    #[tokio::test]
    async fn test_keyword_policy_defaults_without_match() {
        let d = KeywordPolicy.decide("Hello", &context()).await.unwrap();
        assert_eq!(d.responder_id(), Some("general"));
        assert_eq!(d.reason, RoutingReason::Selected);
    }

    #[tokio::test]
    async fn test_keyword_policy_matches_whole_words() {
        // "behalf" must not count as "half"
        let d = KeywordPolicy.decide("On behalf of my class", &context()).await.unwrap();
        assert_eq!(d.responder_id(), Some("general"));
    }
}
