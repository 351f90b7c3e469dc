//! JSONL-based session store.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TutorError};
use crate::session::{ReviewRecord, SessionState, SessionStore, TurnLogEntry};
use crate::types::RoutingReason;

/// File-based session store.
///
/// Layout:
/// - `<base>/sessions.json`: array of `SessionState`
/// - `<base>/turns/<session_id>.jsonl`: one routing outcome per line
/// - `<base>/reviews.jsonl`: disclaimer deliveries awaiting offline review
pub struct JsonlSessionStore {
    base: PathBuf,
    // Serializes read-modify-write cycles on the index.
    index_lock: Mutex<()>,
}

impl JsonlSessionStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            index_lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("sessions.json")
    }

    fn turns_dir(&self) -> PathBuf {
        self.base.join("turns")
    }

    fn turns_path(&self, session_id: &str) -> PathBuf {
        self.turns_dir().join(format!("{}.jsonl", file_stem(session_id)))
    }

    fn reviews_path(&self) -> PathBuf {
        self.base.join("reviews.jsonl")
    }

    async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        tokio::fs::create_dir_all(self.turns_dir()).await?;
        Ok(())
    }

    async fn load_index(&self) -> Result<Vec<SessionState>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let states: Vec<SessionState> = serde_json::from_str(&data)?;
        Ok(states)
    }

    async fn save_index(&self, states: &[SessionState]) -> Result<()> {
        self.ensure_dirs().await?;
        let data = serde_json::to_string_pretty(states)?;
        let path = self.index_path();
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_line(&self, path: PathBuf, line: String) -> Result<()> {
        self.ensure_dirs().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Read a session's turn log.
    pub async fn turn_log(&self, session_id: &str) -> Result<Vec<TurnLogEntry>> {
        let path = self.turns_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: TurnLogEntry = serde_json::from_str(line)
                .map_err(|e| TutorError::Session(format!("corrupt turn log line: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// List all stored sessions.
    pub async fn list(&self) -> Result<Vec<SessionState>> {
        self.load_index().await
    }
}

/// Session ids come from clients. Filename-safe ids are used as they are;
/// any other id is `~` plus its URL-safe base64, so distinct ids never share
/// a file.
fn file_stem(session_id: &str) -> String {
    let safe = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        session_id.to_string()
    } else {
        format!("~{}", URL_SAFE_NO_PAD.encode(session_id))
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let states = self.load_index().await?;
        let state = states.into_iter().find(|s| s.session_id == session_id);
        if let Some(state) = &state {
            debug!(
                session_id,
                router = state.router.name(),
                history = state.history.len(),
                "Loaded session"
            );
        }
        Ok(state)
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut states = self.load_index().await?;
        if let Some(existing) = states
            .iter_mut()
            .find(|s| s.session_id == state.session_id)
        {
            *existing = state.clone();
        } else {
            states.push(state.clone());
        }
        self.save_index(&states).await?;
        debug!(session_id = %state.session_id, "Saved session");
        Ok(())
    }

    async fn record_turn(
        &self,
        session_id: &str,
        responder: Option<&str>,
        reason: RoutingReason,
    ) -> Result<()> {
        let entry = TurnLogEntry {
            responder: responder.map(str::to_string),
            reason,
            timestamp: Utc::now(),
        };
        let line = serde_json::to_string(&entry)?;
        self.append_line(self.turns_path(session_id), line).await
    }

    async fn record_review(&self, review: &ReviewRecord) -> Result<()> {
        let line = serde_json::to_string(review)?;
        self.append_line(self.reviews_path(), line).await?;
        debug!(
            session_id = %review.session_id,
            turn_id = %review.turn_id,
            "Recorded turn for offline review"
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut states = self.load_index().await?;
        states.retain(|s| s.session_id != session_id);
        self.save_index(&states).await?;

        let path = self.turns_path(session_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }

        debug!(session_id, "Deleted session");
        Ok(())
    }
}
