use super::Embedder;
use crate::errors::RunError;
use crate::providers::llm::retry::KeyRing;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct OpenAIEmbedder {
    pub model: String,
    pub base_url: String,
    pub client: reqwest::Client,
    keys: Arc<KeyRing>,
}

impl OpenAIEmbedder {
    pub fn new(model: String, keys: Arc<KeyRing>) -> Self {
        Self {
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            keys,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let api_key = self
            .keys
            .current()
            .ok_or_else(|| RunError::config_parse(None, "no API key configured for embeddings"))?;
        let body = json!({
            "input": text,
            "model": self.model,
            "encoding_format": "float"
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RunError::network("openai", e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(RunError::provider_status(status.as_u16(), "openai", error_text).into());
        }
        let json: serde_json::Value = resp.json().await?;

        // Parse data[0].embedding
        let vec = json
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("OpenAI API response missing embedding field"))?;

        let floats: Vec<f32> = vec
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();

        Ok(floats)
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}
