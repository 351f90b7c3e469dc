//! Session model: router state, rolling history and the store abstraction.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{RoutingReason, ValidationVerdict};

/// Router state machine for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouterState {
    #[default]
    NoActiveResponder,
    ResponderActive {
        responder: String,
        /// Responder that handed control over, if this one was reached via handoff.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handed_off_from: Option<String>,
    },
    /// The previous responder completed its lesson; `responder` is the assessor.
    AwaitingAssessment { responder: String },
}

impl RouterState {
    pub fn active(responder: impl Into<String>) -> Self {
        Self::ResponderActive {
            responder: responder.into(),
            handed_off_from: None,
        }
    }

    /// The responder that owns the next turn, if any.
    pub fn active_responder(&self) -> Option<&str> {
        match self {
            Self::NoActiveResponder => None,
            Self::ResponderActive { responder, .. } => Some(responder),
            Self::AwaitingAssessment { responder } => Some(responder),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoActiveResponder => "no_active_responder",
            Self::ResponderActive { .. } => "responder_active",
            Self::AwaitingAssessment { .. } => "awaiting_assessment",
        }
    }
}

/// One completed turn kept in the rolling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub user_text: String,
    /// `None` when the selection policy answered directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    pub reply_text: String,
    pub reason: RoutingReason,
    pub timestamp: DateTime<Utc>,
}

/// A turn delivered with a disclaimer, kept for offline review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub session_id: String,
    pub turn_id: String,
    pub responder: String,
    pub delivered_text: String,
    pub verdicts: Vec<ValidationVerdict>,
    pub timestamp: DateTime<Utc>,
}

/// Per-session state, exclusively owned by the session's turn pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub router: RouterState,
    #[serde(default)]
    pub history: VecDeque<TurnRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            router: RouterState::NoActiveResponder,
            history: VecDeque::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn active_responder(&self) -> Option<&str> {
        self.router.active_responder()
    }

    /// Append a turn, evicting the oldest entries beyond `limit`.
    pub fn push_turn(&mut self, record: TurnRecord, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
        self.updated_at = Utc::now();
    }
}

/// Persistence for session state, turn logs and review records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session's state, if it exists.
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// Persist the complete session state.
    async fn save(&self, state: &SessionState) -> Result<()>;

    /// The responder currently active for a session.
    async fn active_responder(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self
            .load(session_id)
            .await?
            .and_then(|s| s.active_responder().map(str::to_string)))
    }

    /// Append a routing outcome to the session's turn log.
    async fn record_turn(
        &self,
        session_id: &str,
        responder: Option<&str>,
        reason: RoutingReason,
    ) -> Result<()>;

    /// Record a disclaimer delivery for offline review.
    async fn record_review(&self, review: &ReviewRecord) -> Result<()>;

    /// Delete a session and its logs.
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Entry in a session's append-only turn log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnLogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    pub reason: RoutingReason,
    pub timestamp: DateTime<Utc>,
}

/// In-memory store for tests and stateless deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: tokio::sync::Mutex<std::collections::HashMap<String, SessionState>>,
    turns: tokio::sync::Mutex<std::collections::HashMap<String, Vec<TurnLogEntry>>>,
    reviews: tokio::sync::Mutex<Vec<ReviewRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turn_log(&self, session_id: &str) -> Vec<TurnLogEntry> {
        self.turns
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn reviews(&self) -> Vec<ReviewRecord> {
        self.reviews.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn record_turn(
        &self,
        session_id: &str,
        responder: Option<&str>,
        reason: RoutingReason,
    ) -> Result<()> {
        self.turns
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(TurnLogEntry {
                responder: responder.map(str::to_string),
                reason,
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn record_review(&self, review: &ReviewRecord) -> Result<()> {
        self.reviews.lock().await.push(review.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().await.remove(session_id);
        self.turns.lock().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> TurnRecord {
        TurnRecord {
            turn_id: format!("t{n}"),
            user_text: format!("question {n}"),
            responder: Some("fractions".into()),
            reply_text: "answer".into(),
            reason: RoutingReason::FastPath,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut state = SessionState::new("s1");
        for n in 0..5 {
            state.push_turn(record(n), 3);
        }
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history.front().unwrap().turn_id, "t2");
        assert_eq!(state.history.back().unwrap().turn_id, "t4");
    }

    #[test]
    fn test_router_state_active_responder() {
        assert_eq!(RouterState::NoActiveResponder.active_responder(), None);
        assert_eq!(RouterState::active("r1").active_responder(), Some("r1"));
        let awaiting = RouterState::AwaitingAssessment {
            responder: "quiz".into(),
        };
        assert_eq!(awaiting.active_responder(), Some("quiz"));
    }

    #[test]
    fn test_router_state_serde() {
        let state = RouterState::ResponderActive {
            responder: "geometry".into(),
            handed_off_from: Some("fractions".into()),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "responder_active");
        assert_eq!(json["handed_off_from"], "fractions");
        let back: RouterState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        let mut state = SessionState::new("s1");
        state.router = RouterState::active("fractions");
        store.save(&state).await.unwrap();

        assert_eq!(
            store.active_responder("s1").await.unwrap().as_deref(),
            Some("fractions")
        );
        assert!(store.active_responder("missing").await.unwrap().is_none());

        store
            .record_turn("s1", Some("fractions"), RoutingReason::Selected)
            .await
            .unwrap();
        assert_eq!(store.turn_log("s1").await.len(), 1);

        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.turn_log("s1").await.is_empty());
    }
}
