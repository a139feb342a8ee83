use super::{CollectionRegistry, DocumentSpec, EmbeddedCollection, Metadata, Retriever};
use crate::schema::{PrunedSchema, Schema};

pub fn collection_name(db_id: &str) -> String {
    format!("{db_id}_column_descriptions")
}

/// One document per column: `"<table> <column>: <description>"`.
pub fn column_documents(schema: &Schema) -> Vec<DocumentSpec> {
    schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let table = &schema.tables[col.table].name;
            let mut metadata = Metadata::new();
            metadata.insert("table".into(), table.clone().into());
            metadata.insert("column".into(), col.name.clone().into());
            let text = if col.description.is_empty() {
                format!("{table} {}", col.name)
            } else {
                format!("{table} {}: {}", col.name, col.description)
            };
            DocumentSpec {
                id: i.to_string(),
                text,
                metadata,
            }
        })
        .collect()
}

/// Keyword → columns whose descriptions are semantically close.
pub struct DescriptionRetriever {
    collection: EmbeddedCollection,
}

impl DescriptionRetriever {
    pub async fn open(registry: &CollectionRegistry, schema: &Schema) -> anyhow::Result<Self> {
        let collection = registry
            .get_or_build(&collection_name(&schema.db_id), || Ok(column_documents(schema)))
            .await?;
        Ok(Self { collection })
    }

    /// Top `k` columns per keyword, accumulated in hit order.
    pub async fn lookup(&self, keywords: &[String], k: usize) -> anyhow::Result<PrunedSchema> {
        let mut out = PrunedSchema::new();
        for keyword in keywords {
            for hit in self.collection.query(keyword, k).await? {
                let table = hit.metadata.get("table").and_then(|v| v.as_str());
                let column = hit.metadata.get("column").and_then(|v| v.as_str());
                if let (Some(t), Some(c)) = (table, column) {
                    out.push_column(t, c);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::embedder::hashing::HashingEmbedder;
    use crate::schema::test_support::library_schema;
    use std::sync::Arc;

    #[test]
    fn documents_carry_table_and_column() {
        let docs = column_documents(&library_schema());
        let name = docs
            .iter()
            .find(|d| d.metadata["column"] == "name")
            .unwrap();
        assert_eq!(name.text, "author name: full name of the author");
        assert_eq!(name.metadata["table"], "author");
    }

    #[tokio::test]
    async fn keywords_pull_matching_columns() {
        let schema = library_schema();
        let reg = CollectionRegistry::new(None, Arc::new(HashingEmbedder::default()));
        let r = DescriptionRetriever::open(&reg, &schema).await.unwrap();
        let linked = r.lookup(&["title".to_string()], 1).await.unwrap();
        assert!(linked.contains_column("book", "title"));
        assert_eq!(linked.len(), 1);
    }
}
