//! Provider abstraction.
//!
//! [`LlmProvider`] streams raw chat completions from an OpenAI-compatible API.
//! The pipeline talks to three narrower seams built on top of it:
//! [`GenerationProvider`] (responder answers as a fragment stream),
//! [`SynthesisProvider`] (text to audio bytes) and [`ValidationProvider`]
//! (quality verdicts).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use tutorflow_core::session::TurnRecord;
use tutorflow_core::types::{GenerationOutcome, Responder};

pub mod elevenlabs;
pub mod failover;
pub mod generator;
pub mod openai;
pub mod signal;
pub mod sse;
pub mod validator;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// Local endpoints (e.g. Ollama) that take no key.
    #[serde(rename = "none")]
    None,
}

impl Credentials {
    pub fn from_key(key: Option<String>) -> Self {
        match key {
            Some(api_key) => Self::ApiKey { api_key },
            None => Self::None,
        }
    }
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub tools: Option<Vec<serde_json::Value>>,
    pub system: Option<String>,
    /// Ask for a JSON object response.
    #[serde(default)]
    pub json_response: bool,
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub tool_use: Option<ToolUseChunk>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseChunk {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai").
    fn id(&self) -> &str;

    /// Format tool definitions for this provider's API.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value>;

    /// Stream a chat completion.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream>;

    /// Run a completion to the end and return its text.
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<String> {
        let mut stream = self.stream(request, credentials).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(delta) = chunk?.delta {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}

// --- Generation ---

/// Everything a responder needs to answer one turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub responder: Arc<Responder>,
    pub user_text: String,
    /// Recent turns, oldest first.
    pub history: Vec<TurnRecord>,
    /// Fixes demanded by a rejected validation verdict.
    pub required_fixes: Vec<String>,
    /// Message left by the responder that handed control over.
    pub handoff_context: Option<String>,
}

/// One item of a generation stream.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// Incremental display text.
    Delta(String),
    /// Structured fields, yielded once as the last item.
    Finished(GenerationOutcome),
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = anyhow::Result<GenerationEvent>> + Send>>;

/// Produces a responder's answer as an incremental stream.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GenerationStream>;
}

// --- Synthesis ---

/// Converts a bounded text chunk into audio bytes.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    /// Maximum characters accepted per request.
    fn max_chars(&self) -> usize;

    /// Audio container/codec label of the returned bytes.
    fn format(&self) -> &str {
        "mp3"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}

// --- Validation ---

/// The assembled answer plus the context a validator needs.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRequest {
    pub responder_id: String,
    pub capability: String,
    pub user_text: String,
    pub display_text: String,
    pub audio_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_payload: Option<serde_json::Value>,
    pub attempt: u32,
}

/// Verdict as returned by a validation provider, before the acceptance rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVerdict {
    pub confidence_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("validation timed out")]
    Timeout,

    #[error("validation provider failed: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("unparseable verdict: {0}")]
    Unparseable(String),
}

/// Checks an assembled answer for quality.
#[async_trait]
pub trait ValidationProvider: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<RawVerdict, ValidationError>;
}
