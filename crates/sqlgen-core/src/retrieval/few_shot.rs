use super::{CollectionRegistry, DocumentSpec, EmbeddedCollection, Hit, Metadata};
use crate::model::Question;
use crate::schema::PrunedSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SAMPLES_COLLECTION: &str = "unmasked_data_samples";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
    pub db_id: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub schema_used: Option<PrunedSchema>,
}

impl FewShotExample {
    fn from_hit(hit: Hit) -> Option<Self> {
        let get = |k: &str| {
            hit.metadata
                .get(k)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let sql = get("sql");
        if sql.trim().is_empty() {
            return None;
        }
        let schema_used = hit
            .metadata
            .get("schema_used")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Some(Self {
            question: hit.text,
            sql,
            db_id: get("db_id"),
            evidence: get("evidence"),
            schema_used,
        })
    }
}

/// Training questions with gold SQL become one document each. Records
/// without SQL are skipped.
pub fn sample_documents(samples: &[Question]) -> Vec<DocumentSpec> {
    samples
        .iter()
        .filter_map(|q| {
            let sql = q.sql.as_deref().filter(|s| !s.trim().is_empty())?;
            let mut metadata = Metadata::new();
            metadata.insert("sql".into(), sql.into());
            metadata.insert("db_id".into(), q.db_id.clone().into());
            metadata.insert("evidence".into(), q.evidence.clone().into());
            metadata.insert(
                "schema_used".into(),
                serde_json::to_value(&q.schema_used).unwrap_or_default(),
            );
            Some(DocumentSpec {
                id: q.question_id.to_string(),
                text: q.question.clone(),
                metadata,
            })
        })
        .collect()
}

/// Nearest-question lookup over the training split.
pub struct FewShotStore {
    collection: EmbeddedCollection,
}

impl FewShotStore {
    pub async fn open(registry: &CollectionRegistry, samples_path: &Path) -> anyhow::Result<Self> {
        let path = samples_path.to_path_buf();
        let collection = registry
            .get_or_build(SAMPLES_COLLECTION, move || {
                let samples = Question::load_all(&path)?;
                Ok(sample_documents(&samples))
            })
            .await?;
        Ok(Self { collection })
    }

    pub fn from_collection(collection: EmbeddedCollection) -> Self {
        Self { collection }
    }

    pub fn len(&self) -> usize {
        self.collection.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` nearest examples, never including one whose question text is
    /// identical to `question`.
    pub async fn top_k(&self, question: &str, k: usize) -> anyhow::Result<Vec<FewShotExample>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let target = question.trim().to_string();
        let hits = self
            .collection
            .query_filtered(question, k, move |d| d.text.trim() != target)
            .await?;
        Ok(hits.into_iter().filter_map(FewShotExample::from_hit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::embedder::hashing::HashingEmbedder;
    use std::sync::Arc;

    fn q(id: i64, text: &str, sql: Option<&str>) -> Question {
        serde_json::from_value(serde_json::json!({
            "question_id": id,
            "db_id": "library",
            "question": text,
            "evidence": "",
            "SQL": sql,
        }))
        .unwrap()
    }

    async fn store(samples: Vec<Question>) -> FewShotStore {
        let reg = CollectionRegistry::new(None, Arc::new(HashingEmbedder::default()));
        let c = reg
            .get_or_build(SAMPLES_COLLECTION, || Ok(sample_documents(&samples)))
            .await
            .unwrap();
        FewShotStore::from_collection(c)
    }

    #[tokio::test]
    async fn exact_question_is_excluded() {
        let s = store(vec![
            q(1, "How many books are there?", Some("SELECT count(*) FROM book")),
            q(2, "How many authors are there?", Some("SELECT count(*) FROM author")),
            q(3, "List book titles", Some("SELECT title FROM book")),
        ])
        .await;
        let shots = s.top_k("How many books are there?", 2).await.unwrap();
        assert_eq!(shots.len(), 2);
        assert!(shots.iter().all(|e| e.question != "How many books are there?"));
        assert_eq!(shots[0].sql, "SELECT count(*) FROM author");
    }

    #[tokio::test]
    async fn records_without_sql_are_not_indexed() {
        let s = store(vec![q(1, "a", None), q(2, "b", Some("SELECT 1"))]).await;
        assert_eq!(s.len(), 1);
        assert!(s.top_k("b", 0).await.unwrap().is_empty());
    }
}
