//! Responder generation on top of an [`LlmProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::debug;

use tutorflow_core::config::TierModels;
use tutorflow_core::types::QualityTier;

use crate::signal::{control_tools, outcome_from_parts};
use crate::{
    ChunkStream, CompletionRequest, Credentials, GenerationEvent, GenerationProvider,
    GenerationRequest, GenerationStream, LlmProvider, ToolUseChunk,
};

/// Streams responder answers from a chat-completions model chosen by tier.
pub struct LlmGenerator {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    models: TierModels,
    max_tokens: u32,
    temperature: Option<f64>,
}

impl LlmGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        models: TierModels,
        max_tokens: u32,
        temperature: Option<f64>,
    ) -> Self {
        Self {
            provider,
            credentials,
            models,
            max_tokens,
            temperature,
        }
    }

    fn model_for(&self, tier: QualityTier) -> &str {
        match tier {
            QualityTier::Fast => &self.models.fast,
            QualityTier::Standard => &self.models.standard,
            QualityTier::Premium => &self.models.premium,
        }
    }
}

/// Assemble the system prompt for one generation attempt.
pub fn build_system_prompt(request: &GenerationRequest) -> String {
    let mut system = request.responder.system_prompt.trim().to_string();
    if let Some(context) = &request.handoff_context {
        system.push_str("\n\nYou are taking over from another responder, who said: ");
        system.push_str(context);
    }
    if !request.required_fixes.is_empty() {
        system.push_str("\n\nYour previous draft was rejected. Rewrite it and fix:\n");
        for fix in &request.required_fixes {
            system.push_str("- ");
            system.push_str(fix);
            system.push('\n');
        }
    }
    system
}

/// Chat messages: recent history then the current turn.
pub fn build_messages(request: &GenerationRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);
    for turn in &request.history {
        messages.push(json!({ "role": "user", "content": turn.user_text }));
        if !turn.reply_text.is_empty() {
            messages.push(json!({ "role": "assistant", "content": turn.reply_text }));
        }
    }
    messages.push(json!({ "role": "user", "content": request.user_text }));
    messages
}

struct GenState {
    chunks: ChunkStream,
    text: String,
    tool_calls: Vec<ToolUseChunk>,
    finished: bool,
}

#[async_trait]
impl GenerationProvider for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GenerationStream> {
        let model = self.model_for(request.responder.tier).to_string();
        let completion = CompletionRequest {
            model: model.clone(),
            messages: build_messages(request),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: Some(self.provider.format_tools(&control_tools())),
            system: Some(build_system_prompt(request)),
            json_response: false,
        };

        debug!(
            responder = %request.responder.id,
            model = %model,
            fixes = request.required_fixes.len(),
            "Starting generation"
        );

        let chunks = self.provider.stream(&completion, &self.credentials).await?;

        let stream = futures::stream::unfold(
            GenState {
                chunks,
                text: String::new(),
                tool_calls: Vec::new(),
                finished: false,
            },
            |mut state| async move {
                if state.finished {
                    return None;
                }
                loop {
                    match state.chunks.next().await {
                        Some(Ok(chunk)) => {
                            if let Some(tool) = chunk.tool_use {
                                state.tool_calls.push(tool);
                            }
                            if let Some(delta) = chunk.delta {
                                state.text.push_str(&delta);
                                return Some((Ok(GenerationEvent::Delta(delta)), state));
                            }
                        }
                        Some(Err(e)) => {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                        None => {
                            state.finished = true;
                            let outcome = outcome_from_parts(
                                std::mem::take(&mut state.text),
                                &state.tool_calls,
                            );
                            return Some((Ok(GenerationEvent::Finished(outcome)), state));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
