use super::{ChatTurn, LlmClient};
use crate::fingerprint;
use crate::model::LlmResponse;
use crate::storage::Store;
use async_trait::async_trait;
use std::sync::Arc;

/// Serves repeated requests from the run cache. Only successful responses
/// are stored.
pub struct CachingLlmClient {
    inner: Arc<dyn LlmClient>,
    store: Store,
    temperature: f32,
    max_tokens: u32,
}

impl CachingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, store: Store, temperature: f32, max_tokens: u32) -> Self {
        Self {
            inner,
            store,
            temperature,
            max_tokens,
        }
    }

    fn key(&self, prompt: &str, turns: Option<&[(String, String)]>) -> String {
        fingerprint::compute(
            self.inner.provider_name(),
            &self.inner.model_id(),
            self.temperature,
            self.max_tokens,
            prompt,
            turns,
        )
        .hex
    }

    async fn lookup_or<F>(&self, key: String, call: F) -> anyhow::Result<LlmResponse>
    where
        F: std::future::Future<Output = anyhow::Result<LlmResponse>> + Send,
    {
        match self.store.cache_get(&key) {
            Ok(Some(hit)) => {
                tracing::debug!(key = %key, "llm cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "llm cache read failed"),
        }
        let resp = call.await?;
        if let Err(e) = self.store.cache_put(&key, &resp) {
            tracing::warn!(error = %e, "llm cache write failed");
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmClient for CachingLlmClient {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        let turns: Option<Vec<(String, String)>> = context.map(|c| {
            c.iter()
                .map(|s| ("system".to_string(), s.clone()))
                .collect()
        });
        let key = self.key(prompt, turns.as_deref());
        self.lookup_or(key, self.inner.complete(prompt, context)).await
    }

    async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<LlmResponse> {
        let flat: Vec<(String, String)> = turns
            .iter()
            .map(|t| (t.role.as_str().to_string(), t.content.clone()))
            .collect();
        let key = self.key("", Some(&flat));
        self.lookup_or(key, self.inner.chat(turns)).await
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}
