use crate::config::{EmbedderConfig, EmbedderKind, LlmConfig, ProviderKind, RunConfig};
use crate::errors::PipelineError;
use crate::providers::embedder::hashing::HashingEmbedder;
use crate::providers::embedder::openai::OpenAIEmbedder;
use crate::providers::embedder::{CachingEmbedder, Embedder};
use crate::providers::llm::cache::CachingLlmClient;
use crate::providers::llm::fake::FakeClient;
use crate::providers::llm::openai::{CompatibleVendor, OpenAIClient};
use crate::providers::llm::retry::{KeyRing, RetryPolicy, RetryingClient};
use crate::providers::llm::tracing::TracingLlmClient;
use crate::providers::llm::LlmClient;
use crate::storage::Store;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Builds the wrapped client stack `tracing → cache → retry → provider`.
/// Key rings are shared per provider so every client rotates the same list.
pub struct ClientFactory {
    endpoints: BTreeMap<String, String>,
    retry: RetryPolicy,
    store: Option<Store>,
    rings: Mutex<HashMap<ProviderKind, Arc<KeyRing>>>,
}

fn vendor(kind: ProviderKind) -> Option<CompatibleVendor> {
    match kind {
        ProviderKind::Openai => Some(CompatibleVendor::OpenAi),
        ProviderKind::Deepseek => Some(CompatibleVendor::DeepSeek),
        ProviderKind::Dashscope => Some(CompatibleVendor::DashScope),
        ProviderKind::Fake => None,
    }
}

impl ClientFactory {
    pub fn new(retry: RetryPolicy, store: Option<Store>) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            retry,
            store,
            rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &RunConfig, store: Option<Store>) -> Self {
        let mut f = Self::new(cfg.retry.policy(), store);
        f.endpoints = cfg.endpoints.clone();
        f
    }

    /// Installs an explicit key list, bypassing the environment.
    pub fn with_keys(self, kind: ProviderKind, keys: Vec<String>) -> Self {
        if let Ok(mut rings) = self.rings.lock() {
            rings.insert(kind, Arc::new(KeyRing::new(keys)));
        }
        self
    }

    pub fn key_ring(&self, kind: ProviderKind) -> Option<Arc<KeyRing>> {
        let vendor = vendor(kind)?;
        let mut rings = self.rings.lock().ok()?;
        let ring = rings.entry(kind).or_insert_with(|| {
            let (multi, single) = vendor.key_env_vars();
            Arc::new(KeyRing::from_env(multi, single))
        });
        Some(ring.clone())
    }

    pub fn build(
        &self,
        llm: &LlmConfig,
        purpose: &'static str,
    ) -> Result<Arc<dyn LlmClient>, PipelineError> {
        let kind = llm.model.provider();
        let (base, keys): (Arc<dyn LlmClient>, Option<Arc<KeyRing>>) = match vendor(kind) {
            None => {
                let fake: Arc<dyn LlmClient> =
                    Arc::new(FakeClient::new(llm.model.name().to_string()));
                (fake, None)
            }
            Some(vendor) => {
                let keys = self.key_ring(kind).filter(|k| !k.is_empty()).ok_or_else(|| {
                    let (multi, single) = vendor.key_env_vars();
                    PipelineError::Config(format!(
                        "no API key for {}: set {single} or {multi}",
                        kind.as_str()
                    ))
                })?;
                let mut client = OpenAIClient::new(
                    vendor,
                    llm.model.name().to_string(),
                    keys.clone(),
                    llm.temperature,
                    llm.max_tokens,
                );
                if let Some(url) = self.endpoints.get(kind.as_str()) {
                    client = client.with_base_url(url.clone());
                }
                let client: Arc<dyn LlmClient> = Arc::new(client);
                (client, Some(keys))
            }
        };

        let mut client: Arc<dyn LlmClient> =
            Arc::new(RetryingClient::new(base, keys, self.retry.clone()));
        if let Some(store) = &self.store {
            client = Arc::new(CachingLlmClient::new(
                client,
                store.clone(),
                llm.temperature,
                llm.max_tokens,
            ));
        }
        Ok(Arc::new(TracingLlmClient::new(client, purpose)))
    }

    pub fn embedder(&self, cfg: &EmbedderConfig) -> Result<Arc<dyn Embedder>, PipelineError> {
        let base: Arc<dyn Embedder> = match cfg.provider {
            EmbedderKind::Hashing => return Ok(Arc::new(HashingEmbedder::new(cfg.dims))),
            EmbedderKind::Openai => {
                let keys = self
                    .key_ring(ProviderKind::Openai)
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        PipelineError::Config(
                            "no API key for openai embeddings: set OPENAI_API_KEY".into(),
                        )
                    })?;
                let mut e = OpenAIEmbedder::new(cfg.model.clone(), keys);
                if let Some(url) = self.endpoints.get("openai") {
                    e = e.with_base_url(url.clone());
                }
                Arc::new(e)
            }
        };
        Ok(match &self.store {
            Some(store) => Arc::new(CachingEmbedder::new(base, store.clone())),
            None => base,
        })
    }
}
