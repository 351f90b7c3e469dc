//! Failover provider: wraps multiple providers in priority order.
//!
//! If opening a stream fails (rate limit, auth failure, network), the next
//! provider is tried. Errors after a stream has started are not retried.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{ChunkStream, CompletionRequest, Credentials, LlmProvider, ToolDefinition};

pub struct FailoverProvider {
    providers: Vec<(Arc<dyn LlmProvider>, Credentials)>,
    label: String,
}

impl FailoverProvider {
    /// The first provider is primary; others are fallbacks.
    pub fn new(label: String, providers: Vec<(Arc<dyn LlmProvider>, Credentials)>) -> Self {
        Self { providers, label }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        self.providers
            .first()
            .map(|(p, _)| p.format_tools(tools))
            .unwrap_or_default()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let mut last_error = None;

        for (i, (provider, creds)) in self.providers.iter().enumerate() {
            match provider.stream(request, creds).await {
                Ok(stream) => {
                    if i > 0 {
                        info!(provider = provider.id(), attempt = i + 1, "Failover succeeded");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(provider = provider.id(), attempt = i + 1, %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No providers configured in failover")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompletionChunk;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    struct Scripted {
        id: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        fn format_tools(&self, _tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
            Vec::new()
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} is down", self.id);
            }
            let chunk = CompletionChunk {
                delta: Some(self.id.to_string()),
                ..CompletionChunk::default()
            };
            Ok(Box::pin(tokio_stream::iter(vec![Ok(chunk)])))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: 10,
            temperature: None,
            tools: None,
            system: None,
            json_response: false,
        }
    }

    fn scripted(id: &'static str, fail: bool) -> Arc<Scripted> {
        Arc::new(Scripted {
            id,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let primary = scripted("primary", true);
        let backup = scripted("backup", false);
        let failover = FailoverProvider::new(
            "chain".into(),
            vec![
                (primary.clone() as Arc<dyn LlmProvider>, Credentials::None),
                (backup.clone() as Arc<dyn LlmProvider>, Credentials::None),
            ],
        );

        let mut stream = failover.stream(&request(), &Credentials::None).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta.as_deref(), Some("backup"));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let failover = FailoverProvider::new(
            "chain".into(),
            vec![
                (scripted("a", true) as Arc<dyn LlmProvider>, Credentials::None),
                (scripted("b", true) as Arc<dyn LlmProvider>, Credentials::None),
            ],
        );
        let err = failover
            .stream(&request(), &Credentials::None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("b is down"));
    }

    #[tokio::test]
    async fn test_complete_collects_text() {
        let failover = FailoverProvider::new(
            "chain".into(),
            vec![(scripted("only", false) as Arc<dyn LlmProvider>, Credentials::None)],
        );
        let text = failover.complete(&request(), &Credentials::None).await.unwrap();
        assert_eq!(text, "only");
    }

    #[tokio::test]
    async fn test_empty_failover_errors() {
        let failover = FailoverProvider::new("empty".into(), vec![]);
        assert!(failover.is_empty());
        assert!(failover.stream(&request(), &Credentials::None).await.is_err());
    }
}
