//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via `/v1/chat/completions`. Also
//! serves OpenRouter, Ollama and any other OpenAI-compatible endpoint.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use crate::sse::{parse_sse_stream, SseEvent};
use crate::{
    ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider,
    ToolDefinition, ToolUseChunk,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style; determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(id: &str, base_url: Option<&str>, default: &str, api_style: ApiStyle) -> Self {
        Self {
            base_url: base_url.unwrap_or(default).trim_end_matches('/').to_string(),
            api_style,
            provider_id: id.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::with_style("openai", base_url, OPENAI_BASE_URL, ApiStyle::OpenAi)
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::with_style("openrouter", base_url, OPENROUTER_BASE_URL, ApiStyle::OpenRouter)
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::with_style("ollama", base_url, OLLAMA_BASE_URL, ApiStyle::Ollama)
    }

    /// Build a provider from a configured endpoint id.
    pub fn from_config(id: &str, base_url: Option<&str>) -> Self {
        match id {
            "openrouter" => Self::openrouter(base_url),
            "ollama" => Self::ollama(base_url),
            other => Self::with_style(other, base_url, OPENAI_BASE_URL, ApiStyle::OpenAi),
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Turns SSE `data:` payloads into completion chunks.
///
/// Tool call fragments are accumulated and released once, in index order,
/// when the model finishes or the stream ends.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    tool_calls: Vec<ToolCallAccumulator>,
    done: bool,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode one SSE data payload.
    pub fn decode(&mut self, data: &str) -> Vec<CompletionChunk> {
        let data = data.trim();
        // OpenAI terminates with "data: [DONE]"
        if data == "[DONE]" {
            self.done = true;
            return self.drain_tool_calls(None);
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data, "Failed to parse OpenAI chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        // Usage (sent with stream_options.include_usage)
        if let Some(usage) = chunk.usage {
            out.push(CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: Some(usage.prompt_tokens),
                    output_tokens: Some(usage.completion_tokens),
                }),
                ..CompletionChunk::default()
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return out;
        };

        if let Some(tc_deltas) = choice.delta.tool_calls {
            for tc in tc_deltas {
                if self.tool_calls.len() <= tc.index {
                    self.tool_calls
                        .resize_with(tc.index + 1, ToolCallAccumulator::default);
                }
                let acc = &mut self.tool_calls[tc.index];
                if let Some(id) = tc.id {
                    acc.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        acc.name = name;
                    }
                    if let Some(args) = f.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                out.push(CompletionChunk {
                    delta: Some(content),
                    ..CompletionChunk::default()
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            out.extend(self.drain_tool_calls(Some(reason)));
        }

        out
    }

    /// Release accumulated tool calls; the stop reason rides on the last chunk.
    fn drain_tool_calls(&mut self, stop_reason: Option<String>) -> Vec<CompletionChunk> {
        let mut out: Vec<CompletionChunk> = self
            .tool_calls
            .drain(..)
            .filter(|tc| !tc.name.is_empty())
            .map(|tc| CompletionChunk {
                tool_use: Some(ToolUseChunk {
                    id: tc.id,
                    name: tc.name,
                    input_json: tc.arguments,
                }),
                ..CompletionChunk::default()
            })
            .collect();
        if let Some(reason) = stop_reason {
            match out.last_mut() {
                Some(last) => last.stop_reason = Some(reason),
                None => out.push(CompletionChunk {
                    stop_reason: Some(reason),
                    ..CompletionChunk::default()
                }),
            }
        }
        out
    }
}

struct OpenAiChunkState {
    sse: std::pin::Pin<Box<dyn futures::Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    decoder: ChunkDecoder,
    ready: VecDeque<CompletionChunk>,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => Some(api_key.clone()),
            Credentials::None if self.api_style == ApiStyle::Ollama => None,
            Credentials::None => {
                anyhow::bail!("Provider '{}' requires an API key", self.provider_id)
            }
        };

        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().cloned());

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            response_format: request
                .json_response
                .then(|| json!({ "type": "json_object" })),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://github.com/Clemens865/tutorflow");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let chunk_stream = futures::stream::unfold(
            OpenAiChunkState {
                sse: Box::pin(parse_sse_stream(response)),
                decoder: ChunkDecoder::new(),
                ready: VecDeque::new(),
            },
            |mut state| async move {
                loop {
                    if let Some(chunk) = state.ready.pop_front() {
                        return Some((Ok(chunk), state));
                    }
                    if state.decoder.is_done() {
                        return None;
                    }
                    match state.sse.next().await {
                        Some(Ok(event)) => {
                            let chunks = state.decoder.decode(&event.data);
                            state.ready.extend(chunks);
                        }
                        Some(Err(e)) => return Some((Err(e), state)),
                        None => {
                            // Stream closed without [DONE]; flush pending tool calls.
                            let chunks = state.decoder.decode("[DONE]");
                            state.ready.extend(chunks);
                        }
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}
