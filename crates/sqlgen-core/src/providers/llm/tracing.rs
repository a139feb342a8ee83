use crate::model::LlmResponse;
use crate::providers::llm::{ChatTurn, LlmClient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// Wraps every request in a `llm.request` span carrying provider, model,
/// token usage, latency and failure details.
pub struct TracingLlmClient {
    inner: Arc<dyn LlmClient>,
    purpose: &'static str,
}

impl TracingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, purpose: &'static str) -> Self {
        Self { inner, purpose }
    }

    async fn traced<F>(&self, call: F) -> anyhow::Result<LlmResponse>
    where
        F: std::future::Future<Output = anyhow::Result<LlmResponse>> + Send,
    {
        let span = info_span!(
            "llm.request",
            "llm.provider" = self.inner.provider_name(),
            "llm.purpose" = self.purpose,
            "llm.model" = tracing::field::Empty,
            "llm.usage.input_tokens" = tracing::field::Empty,
            "llm.usage.output_tokens" = tracing::field::Empty,
            "llm.cached" = tracing::field::Empty,
            "llm.latency_ms" = tracing::field::Empty,
            "error" = tracing::field::Empty,
            "error.message" = tracing::field::Empty
        );

        async move {
            let start = std::time::Instant::now();
            let result = call.await;
            let span = tracing::Span::current();
            span.record("llm.latency_ms", start.elapsed().as_millis() as u64);

            match &result {
                Ok(resp) => {
                    span.record("llm.model", resp.model.as_str());
                    span.record("llm.cached", resp.cached);

                    if let Some(usage) = resp.meta.get("usage") {
                        if let Some(i) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
                            span.record("llm.usage.input_tokens", i);
                        }
                        if let Some(o) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
                            span.record("llm.usage.output_tokens", o);
                        }
                    }
                }
                Err(e) => {
                    span.record("error", true);
                    span.record("error.message", e.to_string().as_str());
                    tracing::debug!(error = %e, "llm request failed");
                }
            }

            result
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl LlmClient for TracingLlmClient {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        self.traced(self.inner.complete(prompt, context)).await
    }

    async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<LlmResponse> {
        self.traced(self.inner.chat(turns)).await
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}
