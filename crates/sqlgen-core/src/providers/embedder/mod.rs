use crate::fingerprint::embedding_key;
use crate::storage::Store;
use async_trait::async_trait;
use std::sync::Arc;

pub mod hashing;
pub mod openai;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn name(&self) -> &'static str;
    fn model_id(&self) -> String;
}

/// Reuses vectors from the run cache keyed by model and text.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    store: Store,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, store: Store) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let model = self.inner.model_id();
        let key = embedding_key(&model, text);
        if let Some((_, vec)) = self.store.get_embedding(&key)? {
            return Ok(vec);
        }
        let vec = self.inner.embed(text).await?;
        self.store.put_embedding(&key, &model, &vec)?;
        Ok(vec)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Embedder for Counting {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32])
        }
        fn name(&self) -> &'static str {
            "counting"
        }
        fn model_id(&self) -> String {
            "counting-1".into()
        }
    }

    #[tokio::test]
    async fn cached_vectors_skip_the_backend() {
        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let emb = CachingEmbedder::new(inner.clone(), Store::memory().unwrap());
        assert_eq!(emb.embed("abc").await.unwrap(), vec![3.0]);
        assert_eq!(emb.embed("abc").await.unwrap(), vec![3.0]);
        assert_eq!(emb.embed("abcd").await.unwrap(), vec![4.0]);
        assert_eq!(inner.0.load(Ordering::SeqCst), 2);
    }
}
