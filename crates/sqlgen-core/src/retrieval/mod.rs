//! In-process vector collections: embed once, persist as JSON under the
//! index directory, answer top-k cosine queries.

use crate::providers::embedder::Embedder;
use crate::storage::files::write_atomic_sync;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod descriptions;
pub mod few_shot;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for i in 0..n {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// A document before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSpec {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    #[serde(flatten)]
    doc: DocumentSpec,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorCollection {
    pub name: String,
    pub model_id: String,
    documents: Vec<StoredDocument>,
}

impl VectorCollection {
    pub async fn build(
        name: &str,
        docs: Vec<DocumentSpec>,
        embedder: &dyn Embedder,
    ) -> anyhow::Result<Self> {
        let mut documents = Vec::with_capacity(docs.len());
        for doc in docs {
            let vector = embedder.embed(&doc.text).await?;
            documents.push(StoredDocument { doc, vector });
        }
        Ok(Self {
            name: name.to_string(),
            model_id: embedder.model_id(),
            documents,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Top `k` by cosine similarity; ties keep insertion order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: impl Fn(&DocumentSpec) -> bool,
    ) -> Vec<Hit> {
        let mut scored: Vec<(usize, f32)> = self
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| filter(&d.doc))
            .map(|(i, d)| (i, cosine(query, &d.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| {
                let d = &self.documents[i].doc;
                Hit {
                    id: d.id.clone(),
                    text: d.text.clone(),
                    metadata: d.metadata.clone(),
                    score,
                }
            })
            .collect()
    }
}

/// Query text → nearest items with metadata.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn query(&self, text: &str, k: usize) -> anyhow::Result<Vec<Hit>>;
}

pub struct EmbeddedCollection {
    pub collection: Arc<VectorCollection>,
    embedder: Arc<dyn Embedder>,
}

impl EmbeddedCollection {
    pub fn new(collection: Arc<VectorCollection>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            collection,
            embedder,
        }
    }

    pub async fn query_filtered(
        &self,
        text: &str,
        k: usize,
        filter: impl Fn(&DocumentSpec) -> bool + Send,
    ) -> anyhow::Result<Vec<Hit>> {
        let v = self.embedder.embed(text).await?;
        Ok(self.collection.search(&v, k, filter))
    }
}

#[async_trait]
impl Retriever for EmbeddedCollection {
    async fn query(&self, text: &str, k: usize) -> anyhow::Result<Vec<Hit>> {
        self.query_filtered(text, k, |_| true).await
    }
}

/// Named collections built on first use, then read-only. With an index
/// directory, collections are persisted as `<dir>/<name>.json` and reloaded
/// when the embedding model matches.
pub struct CollectionRegistry {
    dir: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    collections: Mutex<HashMap<String, Arc<VectorCollection>>>,
}

impl CollectionRegistry {
    pub fn new(dir: Option<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            dir,
            embedder,
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{name}.json")))
    }

    /// Returns the collection called `name`, loading or building it with
    /// `docs` when it is not resident yet. Concurrent callers wait for the
    /// first build.
    pub async fn get_or_build<F>(&self, name: &str, docs: F) -> anyhow::Result<EmbeddedCollection>
    where
        F: FnOnce() -> anyhow::Result<Vec<DocumentSpec>> + Send,
    {
        let mut map = self.collections.lock().await;
        if let Some(c) = map.get(name) {
            return Ok(EmbeddedCollection::new(c.clone(), self.embedder.clone()));
        }

        let model_id = self.embedder.model_id();
        if let Some(path) = self.path(name).filter(|p| p.exists()) {
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<VectorCollection>(&raw)?))
            {
                Ok(c) if c.model_id == model_id => {
                    tracing::debug!(collection = name, docs = c.len(), "loaded vector collection");
                    let c = Arc::new(c);
                    map.insert(name.to_string(), c.clone());
                    return Ok(EmbeddedCollection::new(c, self.embedder.clone()));
                }
                Ok(c) => tracing::info!(
                    collection = name,
                    stored = %c.model_id,
                    current = %model_id,
                    "embedding model changed, rebuilding collection"
                ),
                Err(e) => tracing::warn!(
                    collection = name,
                    error = %e,
                    "unreadable collection, rebuilding"
                ),
            }
        }

        let docs = docs()?;
        tracing::info!(collection = name, docs = docs.len(), "building vector collection");
        let c = VectorCollection::build(name, docs, self.embedder.as_ref()).await?;
        if let Some(path) = self.path(name) {
            write_atomic_sync(&path, serde_json::to_string(&c)?.as_bytes())?;
        }
        let c = Arc::new(c);
        map.insert(name.to_string(), c.clone());
        Ok(EmbeddedCollection::new(c, self.embedder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::embedder::hashing::HashingEmbedder;

    fn docs() -> Vec<DocumentSpec> {
        ["customer name", "order date", "warehouse city"]
            .iter()
            .enumerate()
            .map(|(i, t)| DocumentSpec {
                id: i.to_string(),
                text: t.to_string(),
                metadata: Metadata::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn nearest_document_comes_first() {
        let reg = CollectionRegistry::new(None, Arc::new(HashingEmbedder::default()));
        let c = reg.get_or_build("t", || Ok(docs())).await.unwrap();
        let hits = c.query("names of customers", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "customer name");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn persisted_collections_are_reloaded_without_building() {
        let dir = tempfile::tempdir().unwrap();
        let emb: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        {
            let reg = CollectionRegistry::new(Some(dir.path().to_path_buf()), emb.clone());
            reg.get_or_build("shop_column_descriptions", || Ok(docs()))
                .await
                .unwrap();
        }
        assert!(dir.path().join("shop_column_descriptions.json").exists());
        let reg = CollectionRegistry::new(Some(dir.path().to_path_buf()), emb);
        let c = reg
            .get_or_build("shop_column_descriptions", || anyhow::bail!("must not rebuild"))
            .await
            .unwrap();
        assert_eq!(c.collection.len(), 3);
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
