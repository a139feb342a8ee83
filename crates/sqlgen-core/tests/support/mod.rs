//! Fixtures shared by the end-to-end tests: a toy dataset on disk, YAML run
//! files and prompt-scripted clients.
#![allow(dead_code)]

use rusqlite::Connection;
use sqlgen_core::config::LlmConfig;
use sqlgen_core::errors::PipelineError;
use sqlgen_core::providers::embedder::hashing::HashingEmbedder;
use sqlgen_core::providers::llm::fake::FnClient;
use sqlgen_core::providers::llm::LlmClient;
use sqlgen_core::{Orchestrator, RunConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn create_db(root: &Path, db_id: &str, ddl: &str) {
    let dir = root.join("dev_databases").join(db_id);
    std::fs::create_dir_all(&dir).unwrap();
    let conn = Connection::open(dir.join(format!("{db_id}.sqlite"))).unwrap();
    conn.execute_batch(ddl).unwrap();
}

/// `toy`: t(id, name) holding (1,'a'), (2,'b').
pub fn toy_db(root: &Path) {
    create_db(
        root,
        "toy",
        "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO t VALUES (1, 'a'), (2, 'b');",
    );
}

pub fn write_questions(root: &Path, questions: serde_json::Value) {
    std::fs::write(root.join("dev.json"), questions.to_string()).unwrap();
}

/// One toy question per `(id, text)`, gold `SELECT name FROM t`.
pub fn toy_questions(root: &Path, items: &[(i64, &str)]) {
    let qs: Vec<serde_json::Value> = items
        .iter()
        .map(|(id, text)| {
            serde_json::json!({
                "question_id": id, "db_id": "toy", "question": text,
                "evidence": "", "SQL": "SELECT name FROM t", "difficulty": "simple"
            })
        })
        .collect();
    write_questions(root, serde_json::Value::Array(qs));
}

/// A generator entry; `improve` is inserted verbatim (`null` disables it).
pub fn generator(config_id: u32, model: &str, format: &str, prune: bool, improve: &str) -> String {
    format!(
        "  - config_id: {config_id}
    model: [fake, {model}]
    temperature: 0.0
    max_tokens: 256
    prompt_config: {{ type: code_repr, shots: 0, format_type: {format} }}
    prune_schema: {prune}
    add_evidence: true
    improve: {improve}
"
    )
}

pub fn run_config(root: &Path, output: &str, generators: &[String], extra: &str) -> RunConfig {
    let raw = format!(
        "questions: dev.json
dataset:
  dataset_dir: dev_databases
output:
  output_dir: {output}
  preprocessed_dir: pre
  index_dir: idx
concurrency:
  question_workers: 2
  candidate_workers: 2
retry:
  backoff_ms: 1
  max_retries: 0
generators:
{}{extra}",
        generators.concat()
    );
    RunConfig::from_yaml_str(&raw, root).unwrap()
}

/// Every role gets the client returned by `route` for its model name.
pub fn orchestrator<F>(cfg: RunConfig, route: F) -> Orchestrator
where
    F: Fn(&str, &'static str) -> Arc<dyn LlmClient>,
{
    type Resolved = Result<Arc<dyn LlmClient>, PipelineError>;
    let resolve =
        |llm: &LlmConfig, role: &'static str| -> Resolved { Ok(route(llm.model.name(), role)) };
    Orchestrator::build(cfg, &resolve, Arc::new(HashingEmbedder::default())).unwrap()
}

/// Client that records every prompt it receives.
pub fn recording<F>(log: Arc<Mutex<Vec<String>>>, reply: F) -> Arc<dyn LlmClient>
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
{
    Arc::new(FnClient::new(move |prompt| {
        log.lock().unwrap().push(prompt.to_string());
        reply(prompt)
    }))
}

pub fn read_json(path: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("{} unreadable: {e}", path.display()));
    serde_json::from_str(&raw).unwrap()
}

pub fn predictions(root: &Path, output: &str) -> BTreeMap<String, String> {
    let raw = std::fs::read_to_string(root.join(output).join("predict_dev.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

/// Rows of `sql` on `db_id` as strings, sorted.
pub fn rows(root: &Path, db_id: &str, sql: &str) -> Vec<Vec<String>> {
    let path = root.join("dev_databases").join(db_id).join(format!("{db_id}.sqlite"));
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let n = stmt.column_count();
    let mut out: Vec<Vec<String>> = stmt
        .query_map([], |r| {
            (0..n)
                .map(|i| {
                    let v: rusqlite::types::Value = r.get(i)?;
                    Ok(format!("{v:?}"))
                })
                .collect()
        })
        .unwrap()
        .map(Result::unwrap)
        .collect();
    out.sort();
    out
}
