use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Output-quality tier of a responder; selects the model/latency tradeoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Fast,
    #[default]
    Standard,
    Premium,
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Standard => f.write_str("standard"),
            Self::Premium => f.write_str("premium"),
        }
    }
}

/// A named specialist that can answer a turn.
///
/// Loaded once from the responder directory and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Responder {
    /// Unique responder id, used as the routing key.
    pub id: String,

    /// Display name (defaults to the id).
    #[serde(default)]
    pub name: String,

    /// Short description shown to the selection policy.
    #[serde(default)]
    pub description: String,

    /// Capability tag, e.g. the subject domain ("fractions", "assessment").
    pub capability: String,

    #[serde(default)]
    pub tier: QualityTier,

    /// System instruction payload sent with every generation request.
    #[serde(default)]
    pub system_prompt: String,

    /// Keywords used by the deterministic keyword policy.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Path to the source YAML file.
    #[serde(skip)]
    pub file_path: PathBuf,
}

impl Responder {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// A contiguous, boundary-detected span of generated text.
///
/// `sequence_index` is the sole ordering key for downstream reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentenceUnit {
    pub sequence_index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One synthesis job per sentence unit. State only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisJob {
    pub sequence_index: usize,
    pub source_text: String,
    pub state: SynthesisState,
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
    pub attempts: u32,
}

impl SynthesisJob {
    pub fn pending(unit: &SentenceUnit) -> Self {
        Self {
            sequence_index: unit.sequence_index,
            source_text: unit.text.clone(),
            state: SynthesisState::Pending,
            audio: None,
            attempts: 0,
        }
    }

    /// Advance to `next`. Backward transitions are ignored and reported as `false`.
    pub fn advance(&mut self, next: SynthesisState) -> bool {
        use SynthesisState::*;
        let allowed = matches!(
            (self.state, next),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }
}

/// Quality verdict for one validation attempt.
///
/// Produced fresh per attempt; a new attempt produces a new verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub approved: bool,
    pub confidence_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
}

/// Default acceptance threshold for `confidence_score`.
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.80;

impl ValidationVerdict {
    /// Build a verdict applying the acceptance rule `score >= threshold`.
    pub fn evaluate(
        confidence_score: f64,
        issues: Vec<String>,
        required_fixes: Vec<String>,
        threshold: f64,
    ) -> Self {
        let confidence_score = confidence_score.clamp(0.0, 1.0);
        Self {
            approved: confidence_score >= threshold,
            confidence_score,
            issues,
            required_fixes,
        }
    }
}

/// Why the router picked the responder for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    /// The selection policy chose the responder.
    Selected,
    /// The already-active responder answers without re-running selection.
    FastPath,
    /// A completion signal forced the assessment responder.
    Assessment,
    /// The previous responder handed control over.
    Handoff,
    /// The selection policy answered the turn itself.
    Direct,
    /// Selection failed; the configured default responder was used.
    Fallback,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::FastPath => "fast_path",
            Self::Assessment => "assessment",
            Self::Handoff => "handoff",
            Self::Direct => "direct",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who answers a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteTarget {
    Responder { id: String },
    /// The selection policy answered directly with this reply.
    Direct { reply: String },
}

/// Output of routing; consumed once to update session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub reason: RoutingReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_message: Option<String>,
}

impl RoutingDecision {
    pub fn to_responder(id: impl Into<String>, reason: RoutingReason) -> Self {
        Self {
            target: RouteTarget::Responder { id: id.into() },
            reason,
            handoff_message: None,
        }
    }

    pub fn direct(reply: impl Into<String>) -> Self {
        Self {
            target: RouteTarget::Direct {
                reply: reply.into(),
            },
            reason: RoutingReason::Direct,
            handoff_message: None,
        }
    }

    pub fn with_handoff_message(mut self, message: Option<String>) -> Self {
        self.handoff_message = message.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn responder_id(&self) -> Option<&str> {
        match &self.target {
            RouteTarget::Responder { id } => Some(id),
            RouteTarget::Direct { .. } => None,
        }
    }
}

/// Control signal attached to a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "target", rename_all = "snake_case")]
pub enum TurnSignal {
    #[default]
    Continue,
    /// The responder finished its lesson; assessment comes next.
    Complete,
    /// Transfer control to another responder.
    HandoffTo(String),
}

/// Structured fields available once a generation stream ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub display_text: String,
    pub audio_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub signal: TurnSignal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_threshold_boundary() {
        let at = ValidationVerdict::evaluate(0.80, vec![], vec![], DEFAULT_APPROVAL_THRESHOLD);
        assert!(at.approved);

        let below = ValidationVerdict::evaluate(0.79, vec![], vec![], DEFAULT_APPROVAL_THRESHOLD);
        assert!(!below.approved);
    }

    #[test]
    fn test_verdict_clamps_score() {
        let v = ValidationVerdict::evaluate(1.7, vec![], vec![], 0.8);
        assert_eq!(v.confidence_score, 1.0);
        assert!(v.approved);
    }

    #[test]
    fn test_job_transitions_only_forward() {
        let unit = SentenceUnit {
            sequence_index: 0,
            text: "Hi.".into(),
        };
        let mut job = SynthesisJob::pending(&unit);
        assert!(job.advance(SynthesisState::Running));
        assert!(!job.advance(SynthesisState::Pending));
        assert!(job.advance(SynthesisState::Succeeded));
        assert!(!job.advance(SynthesisState::Running));
        assert_eq!(job.state, SynthesisState::Succeeded);
    }

    #[test]
    fn test_turn_signal_serde() {
        let json = serde_json::to_value(TurnSignal::HandoffTo("geometry".into())).unwrap();
        assert_eq!(json["signal"], "handoff_to");
        assert_eq!(json["target"], "geometry");

        let back: TurnSignal = serde_json::from_value(json).unwrap();
        assert_eq!(back, TurnSignal::HandoffTo("geometry".into()));
    }

    #[test]
    fn test_routing_decision_handoff_message_filters_blank() {
        let d = RoutingDecision::to_responder("r1", RoutingReason::Selected)
            .with_handoff_message(Some("   ".into()));
        assert!(d.handoff_message.is_none());
        assert_eq!(d.responder_id(), Some("r1"));
    }
}
