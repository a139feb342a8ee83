//! Schema linking: question → the tables and columns a query will need.

use crate::providers::llm::LlmClient;
use crate::retrieval::descriptions::DescriptionRetriever;
use crate::retrieval::CollectionRegistry;
use crate::schema::{format_schema, PrunedSchema, Schema, SchemaFormat};
use std::sync::Arc;

pub mod keywords;
pub mod lsh;
pub mod values;

use keywords::KeywordExtractor;
use values::ValueMatcher;

/// Seeding parameters for value and description matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineArgs {
    pub value_top_k: usize,
    pub description_top_k: usize,
}

impl Default for PipelineArgs {
    fn default() -> Self {
        Self {
            value_top_k: 5,
            description_top_k: 5,
        }
    }
}

pub fn selector_prompt(schema_text: &str, question: &str, evidence: &str) -> String {
    let evidence = if evidence.trim().is_empty() {
        "None"
    } else {
        evidence.trim()
    };
    format!(
        "You are a database expert. Given the database schema, a question and a hint, select \
         every table and column needed to write the SQL query that answers the question. \
         Include the columns used to join, filter, group and order.\n\n\
         {schema_text}\n\n\
         【Question】\n{question}\n\
         【Evidence】\n{evidence}\n\n\
         Reply with a JSON object only, in this form:\n\
         {{\"tables\": {{\"<table>\": {{\"<column>\": \"<why it is needed>\"}}}}}}"
    )
}

fn strip_fences(reply: &str) -> &str {
    let t = reply.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

/// Parses `{"tables": {t: {c: reason}}}`, also accepting `{t: [c]}` with or
/// without the `tables` wrapper. `None` when the reply is not such an object.
pub fn parse_selection(reply: &str) -> Option<PrunedSchema> {
    let body = strip_fences(reply);
    let (open, close) = (body.find('{')?, body.rfind('}')?);
    if close < open {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&body[open..=close]).ok()?;
    let tables = match value.get("tables") {
        Some(inner) => inner.as_object()?,
        None => value.as_object()?,
    };
    let mut out = PrunedSchema::new();
    for (table, cols) in tables {
        let columns: Vec<String> = match cols {
            serde_json::Value::Object(m) => m.keys().cloned().collect(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            serde_json::Value::Null => Vec::new(),
            _ => return None,
        };
        out.push_table(table, columns);
    }
    Some(out)
}

pub struct SchemaLinker {
    llm: Arc<dyn LlmClient>,
    keywords: KeywordExtractor,
    values: Option<Arc<dyn ValueMatcher>>,
    registry: Option<Arc<CollectionRegistry>>,
    max_parse_retries: u32,
}

impl SchemaLinker {
    pub fn new(llm: Arc<dyn LlmClient>, keywords: KeywordExtractor) -> Self {
        Self {
            llm,
            keywords,
            values: None,
            registry: None,
            max_parse_retries: 3,
        }
    }

    /// Enables seeding from value and description matches.
    pub fn with_pipeline(
        mut self,
        values: Arc<dyn ValueMatcher>,
        registry: Arc<CollectionRegistry>,
    ) -> Self {
        self.values = Some(values);
        self.registry = Some(registry);
        self
    }

    pub fn with_max_parse_retries(mut self, n: u32) -> Self {
        self.max_parse_retries = n.max(1);
        self
    }

    /// Keywords → value and description hits (with `pipeline`) → selector
    /// prompt → canonical pruned schema. Unparseable replies are retried;
    /// after the last attempt the seed (or the full schema) is returned.
    pub async fn link(
        &self,
        schema: &Schema,
        question: &str,
        evidence: &str,
        pipeline: Option<&PipelineArgs>,
    ) -> anyhow::Result<PrunedSchema> {
        let seed = match pipeline {
            Some(args) => {
                let keywords = self.keywords.extract(question, evidence).await;
                tracing::debug!(db_id = %schema.db_id, keywords = ?keywords, "linking keywords");
                Some(self.seed(schema, &keywords, args).await?)
            }
            None => None,
        };
        let seed = seed.filter(|s| !s.is_empty());
        let schema_text = format_schema(schema, seed.as_ref(), SchemaFormat::MSchema);
        let base_prompt = selector_prompt(&schema_text, question, evidence);

        for attempt in 1..=self.max_parse_retries {
            let prompt = if attempt == 1 {
                base_prompt.clone()
            } else {
                format!(
                    "{base_prompt}\n\nAttempt {attempt}: the previous reply was not valid JSON. \
                     Return the JSON object only."
                )
            };
            let reply = match self.llm.complete(&prompt, None).await {
                Ok(r) => r.text,
                Err(e) => {
                    tracing::warn!(
                        component = "schema_linker",
                        attempt,
                        error = %e,
                        "selector call failed"
                    );
                    continue;
                }
            };
            match parse_selection(&reply).map(|p| p.canonicalize(schema)) {
                Some(linked) if !linked.is_empty() => return Ok(linked),
                _ => tracing::warn!(
                    component = "schema_linker",
                    attempt,
                    db_id = %schema.db_id,
                    "unusable schema selection"
                ),
            }
        }

        tracing::warn!(
            component = "schema_linker",
            db_id = %schema.db_id,
            "falling back to seed schema"
        );
        Ok(match seed {
            Some(s) => s.canonicalize(schema),
            None => schema.full_selection(),
        })
    }

    async fn seed(
        &self,
        schema: &Schema,
        keywords: &[String],
        args: &PipelineArgs,
    ) -> anyhow::Result<PrunedSchema> {
        let mut seed = PrunedSchema::new();
        if let Some(values) = &self.values {
            seed = seed.union(&values.lookup(&schema.db_id, keywords, args.value_top_k).await);
        }
        if let Some(registry) = &self.registry {
            let retriever = DescriptionRetriever::open(registry, schema).await?;
            seed = seed.union(&retriever.lookup(keywords, args.description_top_k).await?);
        }
        Ok(seed.canonicalize(schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::embedder::hashing::HashingEmbedder;
    use crate::providers::llm::fake::ScriptedClient;
    use crate::schema::test_support::library_schema;
    use async_trait::async_trait;

    struct FixedValues(PrunedSchema);

    #[async_trait]
    impl ValueMatcher for FixedValues {
        async fn lookup(&self, _db: &str, _kw: &[String], _k: usize) -> PrunedSchema {
            self.0.clone()
        }
    }

    #[test]
    fn selection_formats() {
        let fenced = "```json\n{\"tables\": {\"book\": {\"title\": \"asked\"}}}\n```";
        let p = parse_selection(fenced).unwrap();
        assert_eq!(p.columns("book").unwrap(), ["title"]);
        let p = parse_selection("{\"author\": [\"name\"]}").unwrap();
        assert_eq!(p.columns("author").unwrap(), ["name"]);
        assert!(parse_selection("not json").is_none());
        assert!(parse_selection("{\"tables\": 3}").is_none());
    }

    #[tokio::test]
    async fn unknown_names_are_dropped_and_casing_fixed() {
        let llm = Arc::new(ScriptedClient::new([
            "{\"tables\": {\"BOOK\": {\"Title\": \"\", \"isbn\": \"\"}, \"shelf\": {\"x\": \"\"}}}",
        ]));
        let linker = SchemaLinker::new(llm, KeywordExtractor::rule_based());
        let linked = linker
            .link(&library_schema(), "Titles?", "", None)
            .await
            .unwrap();
        assert_eq!(linked.table_names(), vec!["book"]);
        assert_eq!(linked.columns("book").unwrap(), ["title"]);
    }

    #[tokio::test]
    async fn malformed_replies_are_retried_then_fall_back_to_the_seed() {
        let llm = Arc::new(ScriptedClient::new(["nope", "still nope", "{broken"]));
        let mut seeded = PrunedSchema::new();
        seeded.push_column("author", "name");
        let registry =
            Arc::new(CollectionRegistry::new(None, Arc::new(HashingEmbedder::default())));
        let linker = SchemaLinker::new(llm.clone(), KeywordExtractor::rule_based())
            .with_pipeline(Arc::new(FixedValues(seeded)), registry);
        let args = PipelineArgs {
            value_top_k: 5,
            description_top_k: 1,
        };
        let linked = linker
            .link(&library_schema(), "Who wrote it?", "", Some(&args))
            .await
            .unwrap();
        assert_eq!(llm.prompts().len(), 3);
        assert!(llm.prompts()[0].contains("【DB_ID】 library"));
        assert!(linked.contains_column("author", "name"));
    }

    #[tokio::test]
    async fn no_seed_falls_back_to_the_full_schema() {
        let llm = Arc::new(ScriptedClient::new(Vec::<String>::new()));
        let linker =
            SchemaLinker::new(llm, KeywordExtractor::rule_based()).with_max_parse_retries(2);
        let linked = linker.link(&library_schema(), "q", "", None).await.unwrap();
        assert_eq!(linked, library_schema().full_selection());
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let llm = Arc::new(ScriptedClient::new(["oops", "{\"author\": {\"name\": \"\"}}"]));
        let linker = SchemaLinker::new(llm.clone(), KeywordExtractor::rule_based());
        let linked = linker.link(&library_schema(), "q", "", None).await.unwrap();
        assert_eq!(linked.columns("author").unwrap(), ["name"]);
        assert!(llm.prompts()[1].contains("Attempt 2"));
    }
}
