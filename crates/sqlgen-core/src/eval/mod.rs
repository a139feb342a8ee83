//! Execution accuracy of a predictions file, and schema-linking recall.

use crate::model::{PredictionRecord, Question};
use crate::schema::{PrunedSchema, SchemaStore};
use crate::sql::refs::referenced_schema;
use crate::sql::runner::{set_equal, ExecutionResult, Row, SqlRunner};
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DIFFICULTIES: [&str; 3] = ["simple", "moderate", "challenging"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Bucket {
    pub correct: usize,
    pub count: usize,
}

impl Bucket {
    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionResult {
    pub question_id: i64,
    pub db_id: String,
    pub difficulty: Option<String>,
    pub correct: bool,
    /// Predicted SQL missing from the predictions file.
    pub missing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LinkingRecall {
    pub questions: usize,
    pub table_recall: f64,
    pub column_recall: f64,
    /// Questions whose linked schema covers every gold column.
    pub exact_cover: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    /// `simple`, `moderate`, `challenging` and `total`.
    pub buckets: BTreeMap<String, Bucket>,
    pub results: Vec<QuestionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linking: Option<LinkingRecall>,
}

impl EvalReport {
    pub fn total(&self) -> Bucket {
        self.buckets.get("total").copied().unwrap_or_default()
    }

    pub fn render_table(&self) -> String {
        let mut out = String::from("difficulty    count  correct  accuracy\n");
        for name in DIFFICULTIES.iter().copied().chain(std::iter::once("total")) {
            let b = self.buckets.get(name).copied().unwrap_or_default();
            out.push_str(&format!(
                "{name:<12} {:>6} {:>8} {:>8.2}%\n",
                b.count,
                b.correct,
                b.accuracy() * 100.0
            ));
        }
        if let Some(l) = &self.linking {
            out.push_str(&format!(
                "linking recall over {} questions: tables {:.2}%, columns {:.2}%, full cover {}\n",
                l.questions,
                l.table_recall * 100.0,
                l.column_recall * 100.0,
                l.exact_cover
            ));
        }
        out
    }
}

/// Reads a predictions file: JSON object of stringified question id to a
/// prediction line.
pub fn load_predictions(path: &Path) -> anyhow::Result<BTreeMap<i64, PredictionRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read predictions {}", path.display()))?;
    let map: BTreeMap<String, String> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse predictions {}", path.display()))?;
    let mut out = BTreeMap::new();
    for (k, line) in map {
        let id: i64 = k
            .parse()
            .with_context(|| format!("prediction key {k:?} is not a question id"))?;
        match PredictionRecord::parse(&line) {
            Some(rec) => {
                out.insert(id, rec);
            }
            None => tracing::warn!(question_id = id, "malformed prediction line"),
        }
    }
    Ok(out)
}

fn lower_pairs(p: &PrunedSchema) -> (HashSet<String>, HashSet<(String, String)>) {
    let mut tables = HashSet::new();
    let mut columns = HashSet::new();
    for (t, cols) in p.iter() {
        tables.insert(t.to_lowercase());
        for c in cols {
            columns.insert((t.to_lowercase(), c.to_lowercase()));
        }
    }
    (tables, columns)
}

/// Mean per-question recall of `runtime_schema_used` against `schema_used`,
/// over questions carrying both.
pub fn linking_recall(questions: &[Question]) -> Option<LinkingRecall> {
    let mut recall = LinkingRecall::default();
    let (mut table_sum, mut column_sum) = (0.0, 0.0);
    for q in questions {
        let (Some(gold), Some(linked)) = (&q.schema_used, &q.runtime_schema_used) else {
            continue;
        };
        let (gold_t, gold_c) = lower_pairs(gold);
        if gold_t.is_empty() {
            continue;
        }
        let (linked_t, linked_c) = lower_pairs(linked);
        recall.questions += 1;
        table_sum += gold_t.intersection(&linked_t).count() as f64 / gold_t.len() as f64;
        if gold_c.is_empty() {
            column_sum += 1.0;
            recall.exact_cover += 1;
        } else {
            let hit = gold_c.intersection(&linked_c).count();
            column_sum += hit as f64 / gold_c.len() as f64;
            if hit == gold_c.len() {
                recall.exact_cover += 1;
            }
        }
    }
    if recall.questions == 0 {
        return None;
    }
    recall.table_recall = table_sum / recall.questions as f64;
    recall.column_recall = column_sum / recall.questions as f64;
    Some(recall)
}

/// Fills `schema_used` from each question's gold SQL. Questions without SQL
/// or whose database cannot be loaded are left untouched.
pub fn derive_schema_used(questions: &mut [Question], store: &SchemaStore) -> usize {
    let mut filled = 0;
    for q in questions.iter_mut() {
        let Some(sql) = q.sql.as_deref() else { continue };
        match store.get_schema(&q.db_id) {
            Ok(schema) => {
                q.schema_used = Some(referenced_schema(sql, &schema));
                filled += 1;
            }
            Err(e) => {
                tracing::warn!(question_id = q.question_id, error = %e, "cannot derive schema_used")
            }
        }
    }
    filled
}

pub struct Evaluator {
    runner: Arc<dyn SqlRunner>,
    timeout: Duration,
    workers: usize,
}

impl Evaluator {
    pub fn new(runner: Arc<dyn SqlRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            workers: 8,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// A timed-out query counts as an empty result; an error never matches.
    async fn rows(
        runner: &dyn SqlRunner,
        db_id: &str,
        sql: &str,
        timeout: Duration,
    ) -> Option<Vec<Row>> {
        match runner.execute(db_id, sql, timeout).await {
            ExecutionResult::Rows(rs) => Some(rs.rows),
            ExecutionResult::Timeout => Some(Vec::new()),
            ExecutionResult::Error(_) => None,
        }
    }

    pub async fn evaluate(
        &self,
        questions: &[Question],
        predictions: &BTreeMap<i64, PredictionRecord>,
    ) -> anyhow::Result<EvalReport> {
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();
        for q in questions {
            let Some(gold) = q.sql.clone() else {
                tracing::warn!(question_id = q.question_id, "no gold SQL, not evaluated");
                continue;
            };
            let predicted = predictions.get(&q.question_id).map(|p| p.sql.clone());
            let permit = sem.clone().acquire_owned().await?;
            let runner = self.runner.clone();
            let timeout = self.timeout;
            let (question_id, db_id) = (q.question_id, q.db_id.clone());
            let difficulty = q.difficulty.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let correct = match &predicted {
                    Some(sql) => {
                        let pred = Self::rows(runner.as_ref(), &db_id, sql, timeout).await;
                        let gold = Self::rows(runner.as_ref(), &db_id, &gold, timeout).await;
                        match (pred, gold) {
                            (Some(p), Some(g)) => set_equal(&p, &g),
                            _ => false,
                        }
                    }
                    None => false,
                };
                QuestionResult {
                    question_id,
                    db_id,
                    difficulty,
                    correct,
                    missing: predicted.is_none(),
                }
            });
        }

        let mut results = Vec::new();
        while let Some(res) = join_set.join_next().await {
            results.push(res.context("evaluation task failed")?);
        }
        results.sort_by_key(|r| r.question_id);

        let mut buckets: BTreeMap<String, Bucket> = DIFFICULTIES
            .iter()
            .chain(std::iter::once(&"total"))
            .map(|d| (d.to_string(), Bucket::default()))
            .collect();
        for r in &results {
            let names = [r.difficulty.as_deref().map(str::to_lowercase), Some("total".to_string())];
            for name in names.into_iter().flatten() {
                if let Some(b) = buckets.get_mut(&name) {
                    b.count += 1;
                    if r.correct {
                        b.correct += 1;
                    }
                }
            }
        }
        Ok(EvalReport {
            buckets,
            results,
            linking: linking_recall(questions),
        })
    }
}
