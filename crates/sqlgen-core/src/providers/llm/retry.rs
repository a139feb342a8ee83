use super::{ChatTurn, LlmClient};
use crate::errors::is_quota_exhausted;
use crate::model::LlmResponse;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// API keys used round-robin. Starts at a random index so parallel runs
/// sharing a key list spread their load.
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<String>,
    idx: Mutex<usize>,
}

impl KeyRing {
    pub fn new(keys: Vec<String>) -> Self {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let start = if keys.len() > 1 {
            rand::thread_rng().gen_range(0..keys.len())
        } else {
            0
        };
        Self {
            keys,
            idx: Mutex::new(start),
        }
    }

    /// Reads `multi_var` (comma separated) and falls back to `single_var`.
    pub fn from_env(multi_var: &str, single_var: &str) -> Self {
        if let Ok(list) = std::env::var(multi_var) {
            let keys: Vec<String> = list.split(',').map(str::to_string).collect();
            let ring = Self::new(keys);
            if !ring.is_empty() {
                return ring;
            }
        }
        Self::new(std::env::var(single_var).map(|k| vec![k]).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.idx.lock().map(|g| *g).unwrap_or(0);
        self.keys.get(idx % self.keys.len()).cloned()
    }

    /// Advances to the next key and returns its index.
    pub fn rotate(&self) -> usize {
        if self.keys.is_empty() {
            return 0;
        }
        match self.idx.lock() {
            Ok(mut g) => {
                *g = (*g + 1) % self.keys.len();
                *g
            }
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep after every key in the ring has hit its quota.
    pub backoff: Duration,
    /// `None` retries quota errors until they clear.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

/// Runs `op` and retries quota errors according to `policy`, rotating
/// through `keys` between attempts. Other errors are returned as is.
pub async fn with_quota_retries<T, F, Fut>(
    policy: &RetryPolicy,
    keys: Option<&KeyRing>,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let ring_len = keys.map(|k| k.len()).unwrap_or(0).max(1);
    let mut retries: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_quota_exhausted(&e) => {
                if policy.max_retries.is_some_and(|max| retries >= max) {
                    return Err(e);
                }
                retries += 1;
                if let Some(keys) = keys {
                    let idx = keys.rotate();
                    tracing::warn!(key_index = idx, retries, "quota exhausted, rotating API key");
                }
                if retries as usize % ring_len == 0 {
                    tracing::warn!(
                        backoff_ms = policy.backoff.as_millis() as u64,
                        "all API keys exhausted, backing off"
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    keys: Option<Arc<KeyRing>>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LlmClient>, keys: Option<Arc<KeyRing>>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            keys,
            policy,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&[String]>,
    ) -> anyhow::Result<LlmResponse> {
        with_quota_retries(&self.policy, self.keys.as_deref(), || {
            self.inner.complete(prompt, context)
        })
        .await
    }

    async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<LlmResponse> {
        with_quota_retries(&self.policy, self.keys.as_deref(), || self.inner.chat(turns)).await
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}
