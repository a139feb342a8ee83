use super::LlmClient;
use crate::model::LlmResponse;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

fn response(text: String, model: &str) -> LlmResponse {
    LlmResponse {
        text,
        provider: "fake".to_string(),
        model: model.to_string(),
        cached: false,
        meta: serde_json::json!({}),
    }
}

/// Always answers with the same text.
#[derive(Debug)]
pub struct FakeClient {
    model: String,
    fixed_response: Option<String>,
}

impl FakeClient {
    pub fn new(model: String) -> Self {
        Self {
            model,
            fixed_response: None,
        }
    }

    pub fn with_response(mut self, response: String) -> Self {
        self.fixed_response = Some(response);
        self
    }
}

#[async_trait]
impl LlmClient for FakeClient {
    async fn complete(
        &self,
        _prompt: &str,
        _context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        let text = self
            .fixed_response
            .clone()
            .unwrap_or_else(|| "SELECT 1".to_string());
        Ok(response(text, &self.model))
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

type ReplyFn = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

/// Answers by calling a closure with the prompt.
pub struct FnClient {
    model: String,
    reply: Box<ReplyFn>,
}

impl FnClient {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            model: "fn".to_string(),
            reply: Box::new(reply),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl LlmClient for FnClient {
    async fn complete(
        &self,
        prompt: &str,
        _context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        let text = (self.reply)(prompt)?;
        Ok(response(text, &self.model))
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

/// Replays a fixed sequence of replies; errors once the script runs out.
#[derive(Debug)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(
        &self,
        prompt: &str,
        _context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted client poisoned"))?
            .pop_front();
        match next {
            Some(text) => Ok(response(text, "scripted")),
            None => anyhow::bail!("scripted client has no replies left"),
        }
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn model_id(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let client = ScriptedClient::new(["a", "b"]);
        assert_eq!(client.complete("p1", None).await.unwrap().text, "a");
        assert_eq!(client.complete("p2", None).await.unwrap().text, "b");
        assert!(client.complete("p3", None).await.is_err());
        assert_eq!(client.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn fn_client_sees_prompt() {
        let client = FnClient::new(|p| Ok(p.to_uppercase()));
        assert_eq!(client.complete("select", None).await.unwrap().text, "SELECT");
    }
}
