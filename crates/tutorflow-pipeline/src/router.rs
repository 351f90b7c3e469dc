//! Session router: decides per turn who answers, and how the session's
//! router state moves once the answer is known.
//!
//! The selection policy only runs when no responder owns the session. An
//! active responder keeps the session (fast path) until its answer carries a
//! completion or handoff signal; those move control without consulting the
//! policy either.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tutorflow_core::registry::{ResponderCatalog, ResponderRegistry};
use tutorflow_core::session::{RouterState, SessionState};
use tutorflow_core::types::{RoutingDecision, RoutingReason, TurnSignal};

use crate::policy::{SelectionContext, SelectionPolicy};

pub struct SessionRouter {
    catalog: Arc<ResponderCatalog>,
    policy: Arc<dyn SelectionPolicy>,
    default_responder: String,
    assessment_responder: String,
    policy_timeout: Duration,
}

impl SessionRouter {
    pub fn new(
        catalog: Arc<ResponderCatalog>,
        policy: Arc<dyn SelectionPolicy>,
        default_responder: String,
        assessment_responder: String,
        policy_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            policy,
            default_responder,
            assessment_responder,
            policy_timeout,
        }
    }

    pub fn assessment_responder(&self) -> &str {
        &self.assessment_responder
    }

    /// Pick who answers `turn`. Runs the selection policy at most once.
    pub async fn route(&self, turn: &str, state: &SessionState) -> RoutingDecision {
        let registry = self.catalog.current();

        let decision = match &state.router {
            RouterState::ResponderActive {
                responder,
                handed_off_from,
            } if registry.contains(responder) => {
                let reason = if handed_off_from.is_some() {
                    RoutingReason::Handoff
                } else {
                    RoutingReason::FastPath
                };
                RoutingDecision::to_responder(responder.as_str(), reason)
            }
            RouterState::AwaitingAssessment { responder } if registry.contains(responder) => {
                RoutingDecision::to_responder(responder.as_str(), RoutingReason::Assessment)
            }
            stale @ (RouterState::ResponderActive { .. } | RouterState::AwaitingAssessment { .. }) => {
                warn!(
                    session_id = %state.session_id,
                    responder = stale.active_responder().unwrap_or_default(),
                    "Active responder no longer registered, selecting again"
                );
                self.select(turn, state, &registry).await
            }
            RouterState::NoActiveResponder => self.select(turn, state, &registry).await,
        };

        debug!(
            session_id = %state.session_id,
            state = state.router.name(),
            reason = %decision.reason,
            responder = decision.responder_id().unwrap_or("-"),
            "Routed turn"
        );
        crate::metrics::record_routing(decision.reason);
        decision
    }

    async fn select(
        &self,
        turn: &str,
        state: &SessionState,
        registry: &ResponderRegistry,
    ) -> RoutingDecision {
        let context = SelectionContext {
            responders: registry.all(),
            history: state.history.iter().cloned().collect(),
            default_responder: self.default_responder.clone(),
        };

        crate::metrics::record_policy_call(self.policy.name());
        let result = tokio::time::timeout(self.policy_timeout, self.policy.decide(turn, &context)).await;

        match result {
            Ok(Ok(decision)) => match decision.responder_id() {
                Some(id) if !registry.contains(id) => {
                    warn!(
                        session_id = %state.session_id,
                        policy = self.policy.name(),
                        responder = id,
                        "Policy chose an unknown responder, using fallback"
                    );
                    self.fallback()
                }
                _ => decision,
            },
            Ok(Err(e)) => {
                warn!(
                    session_id = %state.session_id,
                    policy = self.policy.name(),
                    error = %e,
                    "Selection policy failed, using fallback"
                );
                self.fallback()
            }
            Err(_) => {
                warn!(
                    session_id = %state.session_id,
                    policy = self.policy.name(),
                    timeout_ms = self.policy_timeout.as_millis() as u64,
                    "Selection policy timed out, using fallback"
                );
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> RoutingDecision {
        RoutingDecision::to_responder(self.default_responder.as_str(), RoutingReason::Fallback)
    }

    /// Router state after a delivered turn.
    ///
    /// Pure: the caller stores the result once delivery content is final.
    pub fn advance(&self, decision: &RoutingDecision, signal: &TurnSignal) -> RouterState {
        let Some(current) = decision.responder_id() else {
            // The policy answered directly; nobody owns the session yet.
            return RouterState::NoActiveResponder;
        };
        let registry = self.catalog.current();

        match signal {
            TurnSignal::Continue => RouterState::active(current),
            TurnSignal::Complete if current == self.assessment_responder => {
                info!(responder = current, "Assessment complete, session released");
                RouterState::NoActiveResponder
            }
            TurnSignal::Complete => {
                if registry.contains(&self.assessment_responder) {
                    info!(
                        responder = current,
                        assessor = %self.assessment_responder,
                        "Lesson complete, assessment next"
                    );
                    RouterState::AwaitingAssessment {
                        responder: self.assessment_responder.clone(),
                    }
                } else {
                    warn!(
                        assessor = %self.assessment_responder,
                        "Assessment responder not registered, session released"
                    );
                    RouterState::NoActiveResponder
                }
            }
            TurnSignal::HandoffTo(target) if target != current && registry.contains(target) => {
                info!(from = current, to = %target, "Responder handoff");
                RouterState::ResponderActive {
                    responder: target.clone(),
                    handed_off_from: Some(current.to_string()),
                }
            }
            TurnSignal::HandoffTo(target) => {
                warn!(
                    responder = current,
                    target = %target,
                    "Ignoring handoff to unknown or same responder"
                );
                RouterState::active(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tutorflow_core::registry::ResponderRegistry;
    use tutorflow_core::types::{QualityTier, Responder, RouteTarget};

    fn responder(id: &str) -> Responder {
        Responder {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            capability: id.into(),
            tier: QualityTier::Fast,
            system_prompt: String::new(),
            keywords: vec![],
            file_path: Default::default(),
        }
    }

    fn catalog() -> Arc<ResponderCatalog> {
        Arc::new(ResponderCatalog::fixed(ResponderRegistry::from_responders(
            ["general", "fractions", "geometry", "assessment"].map(responder),
        )))
    }

    enum Script {
        Pick(&'static str),
        Fail,
        Hang,
    }

    struct CountingPolicy {
        script: Script,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SelectionPolicy for CountingPolicy {
        fn name(&self) -> &str {
            "counting"
        }

        async fn decide(&self, _turn: &str, _context: &SelectionContext) -> anyhow::Result<RoutingDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Pick(id) => Ok(RoutingDecision::to_responder(id, RoutingReason::Selected)),
                Script::Fail => anyhow::bail!("policy unavailable"),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn router(script: Script) -> (SessionRouter, Arc<CountingPolicy>) {
        let policy = Arc::new(CountingPolicy {
            script,
            calls: AtomicUsize::new(0),
        });
        let router = SessionRouter::new(
            catalog(),
            policy.clone(),
            "general".into(),
            "assessment".into(),
            Duration::from_secs(5),
        );
        (router, policy)
    }

    fn session(router: RouterState) -> SessionState {
        let mut state = SessionState::new("s1");
        state.router = router;
        state
    }

    #[tokio::test]
    async fn test_no_active_responder_runs_policy() {
        let (router, policy) = router(Script::Pick("fractions"));
        let d = router.route("What is a half?", &session(RouterState::NoActiveResponder)).await;
        assert_eq!(d.responder_id(), Some("fractions"));
        assert_eq!(d.reason, RoutingReason::Selected);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_responder_fast_path() {
        let (router, policy) = router(Script::Pick("geometry"));
        let d = router
            .route("I don't know", &session(RouterState::active("fractions")))
            .await;
        assert_eq!(d.responder_id(), Some("fractions"));
        assert_eq!(d.reason, RoutingReason::FastPath);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_awaiting_assessment_forces_assessor() {
        let (router, policy) = router(Script::Pick("geometry"));
        let state = session(RouterState::AwaitingAssessment {
            responder: "assessment".into(),
        });
        let d = router.route("ok", &state).await;
        assert_eq!(d.responder_id(), Some("assessment"));
        assert_eq!(d.reason, RoutingReason::Assessment);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_turn_after_handoff() {
        let (router, policy) = router(Script::Pick("general"));
        let state = session(RouterState::ResponderActive {
            responder: "geometry".into(),
            handed_off_from: Some("fractions".into()),
        });
        let d = router.route("ok", &state).await;
        assert_eq!(d.responder_id(), Some("geometry"));
        assert_eq!(d.reason, RoutingReason::Handoff);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_policy_failure_falls_back() {
        let (router, _) = router(Script::Fail);
        let d = router.route("hi", &session(RouterState::NoActiveResponder)).await;
        assert_eq!(d.responder_id(), Some("general"));
        assert_eq!(d.reason, RoutingReason::Fallback);
    }

    #[tokio::test]
    async fn test_unknown_policy_choice_falls_back() {
        let (router, _) = router(Script::Pick("astronomy"));
        let d = router.route("stars?", &session(RouterState::NoActiveResponder)).await;
        assert_eq!(d.reason, RoutingReason::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_timeout_falls_back() {
        let (router, policy) = router(Script::Hang);
        let d = router.route("hi", &session(RouterState::NoActiveResponder)).await;
        assert_eq!(d.reason, RoutingReason::Fallback);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_responder_reselects() {
        let (router, policy) = router(Script::Pick("geometry"));
        let d = router
            .route("hi", &session(RouterState::active("retired")))
            .await;
        assert_eq!(d.responder_id(), Some("geometry"));
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_advance_transitions() {
        let (router, _) = router(Script::Fail);
        let fractions = RoutingDecision::to_responder("fractions", RoutingReason::FastPath);

        assert_eq!(
            router.advance(&fractions, &TurnSignal::Continue),
            RouterState::active("fractions")
        );
        assert_eq!(
            router.advance(&fractions, &TurnSignal::Complete),
            RouterState::AwaitingAssessment {
                responder: "assessment".into()
            }
        );
        assert_eq!(
            router.advance(&fractions, &TurnSignal::HandoffTo("geometry".into())),
            RouterState::ResponderActive {
                responder: "geometry".into(),
                handed_off_from: Some("fractions".into()),
            }
        );
        assert_eq!(
            router.advance(&fractions, &TurnSignal::HandoffTo("nobody".into())),
            RouterState::active("fractions")
        );
    }

    #[test]
    fn test_assessor_completion_releases_session() {
        let (router, _) = router(Script::Fail);
        let assessor = RoutingDecision::to_responder("assessment", RoutingReason::Assessment);
        assert_eq!(
            router.advance(&assessor, &TurnSignal::Complete),
            RouterState::NoActiveResponder
        );
        assert_eq!(
            router.advance(&assessor, &TurnSignal::Continue),
            RouterState::active("assessment")
        );
    }

    #[test]
    fn test_direct_reply_keeps_no_active_responder() {
        let (router, _) = router(Script::Fail);
        let direct = RoutingDecision::direct("Hello!");
        assert!(matches!(direct.target, RouteTarget::Direct { .. }));
        assert_eq!(
            router.advance(&direct, &TurnSignal::Complete),
            RouterState::NoActiveResponder
        );
    }
}
