//! Validation gate and the bounded regeneration loop.
//!
//! A draft moves `Drafted -> Validating -> {Approved, Rejected}`. A rejected
//! draft is regenerated with the verdict's fixes until the attempt cap, after
//! which the best draft is delivered with a disclaimer. Timeouts, provider
//! errors and unparseable verdicts force approval; the gate never withholds
//! an answer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use tutorflow_core::config::ValidationConfig;
use tutorflow_core::protocol::{FailSafeReason, ValidationOutcome};
use tutorflow_core::types::ValidationVerdict;
use tutorflow_providers::{ValidationError, ValidationProvider, ValidationRequest};

/// Generation attempts per turn can never exceed this, whatever the config says.
pub const MAX_ATTEMPTS: u32 = 2;

/// Result of validating one draft.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    Approved(ValidationVerdict),
    Rejected(ValidationVerdict),
    /// Approval forced without a usable verdict.
    FailSafe(FailSafeReason),
}

pub struct ValidationGate {
    provider: Option<Arc<dyn ValidationProvider>>,
    enabled: bool,
    threshold: f64,
    timeout: Duration,
    max_attempts: u32,
}

impl ValidationGate {
    pub fn new(provider: Option<Arc<dyn ValidationProvider>>, config: &ValidationConfig) -> Self {
        Self {
            enabled: config.enabled && provider.is_some(),
            provider,
            threshold: config.threshold,
            timeout: Duration::from_millis(config.timeout_ms),
            max_attempts: config.max_attempts.clamp(1, MAX_ATTEMPTS),
        }
    }

    /// A gate that skips validation entirely.
    pub fn disabled() -> Self {
        Self::new(None, &ValidationConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Validate one draft under the hard deadline.
    pub async fn evaluate(&self, request: &ValidationRequest) -> GateResult {
        let Some(provider) = self.provider.as_ref().filter(|_| self.enabled) else {
            return GateResult::FailSafe(FailSafeReason::Error);
        };

        let outcome = match tokio::time::timeout(self.timeout, provider.validate(request)).await {
            Err(_) | Ok(Err(ValidationError::Timeout)) => Err((FailSafeReason::Timeout, None)),
            Ok(Err(ValidationError::Provider(e))) => Err((FailSafeReason::Error, Some(format!("{e:#}")))),
            Ok(Err(ValidationError::Unparseable(detail))) => {
                Err((FailSafeReason::Unparseable, Some(detail)))
            }
            Ok(Ok(raw)) if !(0.0..=1.0).contains(&raw.confidence_score) => Err((
                FailSafeReason::Unparseable,
                Some(format!("confidence_score {} is outside 0.0..=1.0", raw.confidence_score)),
            )),
            Ok(Ok(raw)) => Ok(ValidationVerdict::evaluate(
                raw.confidence_score,
                raw.issues,
                raw.required_fixes,
                self.threshold,
            )),
        };

        match outcome {
            Ok(verdict) if verdict.approved => {
                info!(
                    responder = %request.responder_id,
                    attempt = request.attempt,
                    confidence = verdict.confidence_score,
                    "Answer approved"
                );
                crate::metrics::record_approval();
                GateResult::Approved(verdict)
            }
            Ok(verdict) => {
                info!(
                    responder = %request.responder_id,
                    attempt = request.attempt,
                    confidence = verdict.confidence_score,
                    issues = verdict.issues.len(),
                    "Answer rejected"
                );
                GateResult::Rejected(verdict)
            }
            Err((reason, detail)) => {
                warn!(
                    fail_safe = reason.as_str(),
                    responder = %request.responder_id,
                    attempt = request.attempt,
                    timeout_ms = self.timeout.as_millis() as u64,
                    detail = detail.as_deref().unwrap_or(""),
                    "Validation unavailable, forcing approval"
                );
                crate::metrics::record_fail_safe(reason);
                GateResult::FailSafe(reason)
            }
        }
    }
}

/// What the turn should do after a gate result.
#[derive(Debug)]
pub enum LoopStep<D> {
    /// Deliver this draft.
    Deliver { draft: D, outcome: ValidationOutcome },
    /// Generate a new draft with these fixes.
    Regenerate { required_fixes: Vec<String> },
}

/// Tracks the drafts and verdicts of one turn.
#[derive(Debug)]
pub struct RegenerationLoop<D> {
    max_attempts: u32,
    attempts: u32,
    rejected: Vec<(ValidationVerdict, D)>,
    verdicts: Vec<ValidationVerdict>,
}

impl<D> RegenerationLoop<D> {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            attempts: 0,
            rejected: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    /// Drafts validated so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Every genuine verdict, in attempt order.
    pub fn verdicts(&self) -> &[ValidationVerdict] {
        &self.verdicts
    }

    /// Feed the gate result for the latest draft.
    pub fn record(&mut self, result: GateResult, draft: D) -> LoopStep<D> {
        self.attempts += 1;
        let attempts = self.attempts;
        match result {
            GateResult::Approved(verdict) => {
                let confidence = verdict.confidence_score;
                self.verdicts.push(verdict);
                LoopStep::Deliver {
                    draft,
                    outcome: ValidationOutcome::Approved {
                        attempts,
                        confidence,
                    },
                }
            }
            GateResult::FailSafe(reason) => LoopStep::Deliver {
                draft,
                outcome: ValidationOutcome::FailSafe { attempts, reason },
            },
            GateResult::Rejected(verdict) => {
                self.verdicts.push(verdict.clone());
                if attempts < self.max_attempts {
                    let required_fixes = if verdict.required_fixes.is_empty() {
                        verdict.issues.clone()
                    } else {
                        verdict.required_fixes.clone()
                    };
                    self.rejected.push((verdict, draft));
                    crate::metrics::record_regeneration();
                    LoopStep::Regenerate { required_fixes }
                } else {
                    self.deliver_best((verdict, draft))
                }
            }
        }
    }

    /// Stop regenerating and deliver the best rejected draft with a disclaimer.
    ///
    /// Returns `None` if no draft was rejected yet.
    pub fn give_up(&mut self) -> Option<LoopStep<D>> {
        let latest = self.rejected.pop()?;
        Some(self.deliver_best(latest))
    }

    fn deliver_best(&mut self, latest: (ValidationVerdict, D)) -> LoopStep<D> {
        self.rejected.push(latest);
        let mut best = self.rejected.len() - 1;
        // Scan newest first so later drafts win ties.
        for i in (0..self.rejected.len()).rev() {
            if self.rejected[i].0.confidence_score > self.rejected[best].0.confidence_score {
                best = i;
            }
        }
        let (verdict, draft) = self.rejected.swap_remove(best);
        self.rejected.clear();

        warn!(
            review = true,
            attempts = self.attempts,
            confidence = verdict.confidence_score,
            "Regeneration exhausted, delivering with disclaimer"
        );
        crate::metrics::record_disclaimer();
        LoopStep::Deliver {
            draft,
            outcome: ValidationOutcome::DeliveredWithDisclaimer {
                attempts: self.attempts,
                confidence: verdict.confidence_score,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tutorflow_providers::RawVerdict;

    enum Behavior {
        Score(f64),
        Sleep(Duration),
        Fail,
        Garbage,
    }

    struct ScriptedValidator(Behavior);

    #[async_trait]
    impl ValidationProvider for ScriptedValidator {
        async fn validate(&self, _request: &ValidationRequest) -> Result<RawVerdict, ValidationError> {
            match &self.0 {
                Behavior::Score(score) => Ok(RawVerdict {
                    confidence_score: *score,
                    issues: vec!["too abstract".into()],
                    required_fixes: vec![],
                }),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(RawVerdict {
                        confidence_score: 1.0,
                        issues: vec![],
                        required_fixes: vec![],
                    })
                }
                Behavior::Fail => Err(ValidationError::Provider(anyhow::anyhow!("503"))),
                Behavior::Garbage => Err(ValidationError::Unparseable("<html>".into())),
            }
        }
    }

    fn gate(behavior: Behavior) -> ValidationGate {
        ValidationGate::new(
            Some(Arc::new(ScriptedValidator(behavior))),
            &ValidationConfig::default(),
        )
    }

    fn request() -> ValidationRequest {
        ValidationRequest {
            responder_id: "fractions".into(),
            capability: "fractions".into(),
            user_text: "What is a half?".into(),
            display_text: "A half is one of two equal parts.".into(),
            audio_text: "A half is one of two equal parts.".into(),
            visual_payload: None,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        assert!(matches!(
            gate(Behavior::Score(0.80)).evaluate(&request()).await,
            GateResult::Approved(_)
        ));
        assert!(matches!(
            gate(Behavior::Score(0.79)).evaluate(&request()).await,
            GateResult::Rejected(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_approval_within_deadline() {
        let gate = gate(Behavior::Sleep(Duration::from_secs(60)));
        let started = tokio::time::Instant::now();
        let result = gate.evaluate(&request()).await;
        let elapsed = started.elapsed();

        assert_eq!(result, GateResult::FailSafe(FailSafeReason::Timeout));
        assert!(elapsed >= gate.timeout());
        assert!(elapsed < gate.timeout() + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_error_and_garbage_force_approval() {
        assert_eq!(
            gate(Behavior::Fail).evaluate(&request()).await,
            GateResult::FailSafe(FailSafeReason::Error)
        );
        assert_eq!(
            gate(Behavior::Garbage).evaluate(&request()).await,
            GateResult::FailSafe(FailSafeReason::Unparseable)
        );
        assert_eq!(
            gate(Behavior::Score(f64::NAN)).evaluate(&request()).await,
            GateResult::FailSafe(FailSafeReason::Unparseable)
        );
    }

    #[tokio::test]
    async fn test_percentage_score_is_not_an_approval() {
        assert_eq!(
            gate(Behavior::Score(85.0)).evaluate(&request()).await,
            GateResult::FailSafe(FailSafeReason::Unparseable)
        );
    }

    #[test]
    fn test_disabled_gate() {
        assert!(!ValidationGate::disabled().is_enabled());
        let config = ValidationConfig {
            max_attempts: 9,
            ..ValidationConfig::default()
        };
        let gate = ValidationGate::new(Some(Arc::new(ScriptedValidator(Behavior::Fail))), &config);
        assert_eq!(gate.max_attempts(), MAX_ATTEMPTS);
    }

    fn verdict(score: f64) -> ValidationVerdict {
        ValidationVerdict::evaluate(score, vec!["issue".into()], vec![], 0.8)
    }

    #[test]
    fn test_one_regeneration_then_disclaimer() {
        let mut turn = RegenerationLoop::new(2);

        let step = turn.record(GateResult::Rejected(verdict(0.6)), "first");
        let LoopStep::Regenerate { required_fixes } = step else {
            panic!("expected regeneration");
        };
        // issues stand in for missing fixes
        assert_eq!(required_fixes, vec!["issue".to_string()]);

        let step = turn.record(GateResult::Rejected(verdict(0.5)), "second");
        let LoopStep::Deliver { draft, outcome } = step else {
            panic!("expected delivery");
        };
        assert_eq!(draft, "first");
        assert!(outcome.disclaimer());
        assert_eq!(
            outcome,
            ValidationOutcome::DeliveredWithDisclaimer {
                attempts: 2,
                confidence: 0.6
            }
        );
        assert_eq!(turn.verdicts().len(), 2);
    }

    #[test]
    fn test_best_draft_latest_wins_ties() {
        let mut turn = RegenerationLoop::new(2);
        turn.record(GateResult::Rejected(verdict(0.7)), "first");
        let LoopStep::Deliver { draft, .. } = turn.record(GateResult::Rejected(verdict(0.7)), "second")
        else {
            panic!("expected delivery");
        };
        assert_eq!(draft, "second");
    }

    #[test]
    fn test_approval_after_regeneration() {
        let mut turn = RegenerationLoop::new(2);
        turn.record(GateResult::Rejected(verdict(0.4)), "first");
        let LoopStep::Deliver { draft, outcome } =
            turn.record(GateResult::Approved(verdict(0.9)), "second")
        else {
            panic!("expected delivery");
        };
        assert_eq!(draft, "second");
        assert_eq!(
            outcome,
            ValidationOutcome::Approved {
                attempts: 2,
                confidence: 0.9
            }
        );
    }

    #[test]
    fn test_fail_safe_is_not_an_approval() {
        let mut turn = RegenerationLoop::new(2);
        let LoopStep::Deliver { outcome, .. } =
            turn.record(GateResult::FailSafe(FailSafeReason::Timeout), "only")
        else {
            panic!("expected delivery");
        };
        assert_eq!(outcome.label(), "fail_safe");
        assert!(turn.verdicts().is_empty());
    }

    #[test]
    fn test_give_up_without_rejection() {
        let mut turn: RegenerationLoop<&str> = RegenerationLoop::new(2);
        assert!(turn.give_up().is_none());
    }
}
