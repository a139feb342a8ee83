use super::retry::KeyRing;
use super::{ChatTurn, LlmClient};
use crate::errors::RunError;
use crate::model::LlmResponse;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Vendors that speak the OpenAI chat-completions wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibleVendor {
    OpenAi,
    DeepSeek,
    DashScope,
}

impl CompatibleVendor {
    pub fn name(self) -> &'static str {
        match self {
            CompatibleVendor::OpenAi => "openai",
            CompatibleVendor::DeepSeek => "deepseek",
            CompatibleVendor::DashScope => "dashscope",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            CompatibleVendor::OpenAi => "https://api.openai.com/v1",
            CompatibleVendor::DeepSeek => "https://api.deepseek.com/v1",
            CompatibleVendor::DashScope => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }

    /// Comma separated multi-key variable first, then the single-key one.
    pub fn key_env_vars(self) -> (&'static str, &'static str) {
        match self {
            CompatibleVendor::OpenAi => ("OPENAI_API_KEYS", "OPENAI_API_KEY"),
            CompatibleVendor::DeepSeek => ("DEEPSEEK_API_KEYS", "DEEPSEEK_API_KEY"),
            CompatibleVendor::DashScope => ("DASHSCOPE_API_KEYS", "DASHSCOPE_API_KEY"),
        }
    }
}

pub struct OpenAIClient {
    pub vendor: CompatibleVendor,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub client: reqwest::Client,
    keys: Arc<KeyRing>,
}

impl OpenAIClient {
    pub fn new(
        vendor: CompatibleVendor,
        model: String,
        keys: Arc<KeyRing>,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            vendor,
            base_url: vendor.default_base_url().to_string(),
            model,
            temperature,
            max_tokens,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            keys,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn keys(&self) -> Arc<KeyRing> {
        self.keys.clone()
    }

    async fn send(&self, messages: Vec<serde_json::Value>) -> anyhow::Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let provider = self.vendor.name();
        let api_key = self.keys.current().ok_or_else(|| {
            RunError::config_parse(None, format!("no API key configured for {provider}"))
        })?;

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RunError::new(
                        crate::errors::RunErrorKind::ProviderTimeout,
                        format!("{provider} request timeout: {e}"),
                    )
                    .with_provider(provider)
                } else {
                    RunError::network(provider, e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(RunError::provider_status(status.as_u16(), provider, error_text).into());
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RunError::malformed(format!("{provider} returned invalid JSON: {e}")))?;

        // Parse choices[0].message.content
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RunError::malformed(format!("{provider} API response missing content")))?
            .to_string();

        let usage = json.get("usage").map(|u| {
            json!({
                "input_tokens": u.get("prompt_tokens").cloned().unwrap_or_default(),
                "output_tokens": u.get("completion_tokens").cloned().unwrap_or_default(),
            })
        });

        Ok(LlmResponse {
            text,
            provider: provider.to_string(),
            model: self.model.clone(),
            cached: false,
            meta: json!({ "usage": usage }),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        let mut messages = Vec::new();
        for system in context.unwrap_or_default() {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        self.send(messages).await
    }

    async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<LlmResponse> {
        let messages = turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content }))
            .collect();
        self.send(messages).await
    }

    fn provider_name(&self) -> &'static str {
        self.vendor.name()
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}
