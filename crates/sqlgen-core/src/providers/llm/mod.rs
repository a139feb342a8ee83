use crate::model::LlmResponse;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod fake;
pub mod openai;
pub mod retry;
pub mod tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Text generation backend. `context` entries are sent as system messages.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse>;

    /// Multi-turn request. The default folds the conversation into one prompt.
    async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<LlmResponse> {
        let system: Vec<String> = turns
            .iter()
            .filter(|t| t.role == Role::System)
            .map(|t| t.content.clone())
            .collect();
        let prompt = turns
            .iter()
            .filter(|t| t.role != Role::System)
            .map(|t| format!("{}: {}", t.role.as_str(), t.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let context = (!system.is_empty()).then_some(system.as_slice());
        self.complete(&prompt, context).await
    }

    fn provider_name(&self) -> &'static str;

    fn model_id(&self) -> String {
        String::new()
    }
}
