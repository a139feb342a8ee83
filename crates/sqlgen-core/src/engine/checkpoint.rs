//! Run ledger: everything a run persists, and what a resumed run reads back.

use crate::config::{GeneratorConfig, OutputLayout};
use crate::errors::PipelineError;
use crate::model::{GoldRecord, PredictionRecord, Question, Selection};
use crate::storage::files::{append_line, write_atomic};
use crate::storage::now_rfc3339ish;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbState {
    InProgress,
    Completed,
    Skipped,
}

/// Correctness of one question's candidates against its gold SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionStats {
    pub correct_configs: Vec<u32>,
    pub selected_config: u32,
    pub selected_correct: bool,
}

/// Per-database selection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    pub correct_generated: BTreeMap<u32, u64>,
    pub config_selected: BTreeMap<u32, u64>,
    pub correct_selected: u64,
    /// Questions where at least one candidate was correct.
    pub any_correct: u64,
}

impl DbStats {
    pub fn add(&mut self, q: &QuestionStats) {
        for id in &q.correct_configs {
            *self.correct_generated.entry(*id).or_default() += 1;
        }
        *self.config_selected.entry(q.selected_config).or_default() += 1;
        if q.selected_correct {
            self.correct_selected += 1;
        }
        if !q.correct_configs.is_empty() {
            self.any_correct += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Stable across resumes of the same output directory.
    pub run_id: String,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub dataset_tag: String,
    pub generators: Vec<GeneratorConfig>,
    #[serde(default)]
    pub databases: BTreeMap<String, DbState>,
    #[serde(default)]
    pub questions_done: usize,
    #[serde(default)]
    pub selection_stats: BTreeMap<String, DbStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<i64>,
    pub db_id: String,
    pub component: String,
    pub message: String,
    pub at: String,
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| PipelineError::persistence(path, format!("unreadable JSON: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PipelineError::persistence(path, e)),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let raw = serde_json::to_string_pretty(value).map_err(|e| PipelineError::persistence(path, e))?;
    write_atomic(path, &raw).await
}

/// JSON object keyed by stringified id, in numeric id order.
fn id_keyed(map: &BTreeMap<i64, String>) -> serde_json::Map<String, serde_json::Value> {
    map.iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
        .collect()
}

fn tsv(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<String, csv::Error> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_writer(Vec::new());
    w.write_record(&header)?;
    for row in rows {
        w.write_record(&row)?;
    }
    let bytes = w.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub struct RunLedger {
    layout: OutputLayout,
    dataset_tag: String,
    done: BTreeSet<i64>,
    selections: BTreeMap<i64, Selection>,
    /// db_id → question_id → prediction line
    predictions: BTreeMap<String, BTreeMap<i64, String>>,
    errors: Vec<ErrorEntry>,
    metadata: RunMetadata,
}

impl RunLedger {
    /// Loads the checkpoint, selections, error log and metadata left by an
    /// earlier run in the same output directory.
    pub async fn open(
        layout: &OutputLayout,
        dataset_tag: &str,
        generators: &[GeneratorConfig],
    ) -> Result<Self, PipelineError> {
        tokio::fs::create_dir_all(&layout.output_dir)
            .await
            .map_err(|e| PipelineError::persistence(&layout.output_dir, e))?;

        let checkpoint = layout.checkpoint_path();
        let done = match tokio::fs::read_to_string(&checkpoint).await {
            Ok(raw) => raw.lines().filter_map(|l| l.trim().parse::<i64>().ok()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(PipelineError::persistence(&checkpoint, e)),
        };
        let selections = read_json(&layout.selections_path()).await?.unwrap_or_default();
        let errors = read_json(&layout.error_log_path()).await?.unwrap_or_default();
        let now = now_rfc3339ish();
        let metadata = match read_json::<RunMetadata>(&layout.metadata_path()).await? {
            Some(mut m) => {
                m.generators = generators.to_vec();
                m.dataset_tag = dataset_tag.to_string();
                m.finished_at = None;
                m
            }
            None => RunMetadata {
                run_id: uuid::Uuid::new_v4().to_string(),
                started_at: now.clone(),
                updated_at: now,
                finished_at: None,
                dataset_tag: dataset_tag.to_string(),
                generators: generators.to_vec(),
                databases: BTreeMap::new(),
                questions_done: 0,
                selection_stats: BTreeMap::new(),
            },
        };
        let ledger = Self {
            layout: layout.clone(),
            dataset_tag: dataset_tag.to_string(),
            done,
            selections,
            predictions: BTreeMap::new(),
            errors,
            metadata,
        };
        if !ledger.done.is_empty() {
            tracing::info!(done = ledger.done.len(), "resuming from checkpoint");
        }
        Ok(ledger)
    }

    pub fn is_done(&self, question_id: i64) -> bool {
        self.done.contains(&question_id)
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    pub fn selection(&self, question_id: i64) -> Option<&Selection> {
        self.selections.get(&question_id)
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    async fn load_db_predictions(&mut self, db_id: &str) -> Result<(), PipelineError> {
        if self.predictions.contains_key(db_id) {
            return Ok(());
        }
        let raw: BTreeMap<String, String> = read_json(&self.layout.db_predictions_path(db_id))
            .await?
            .unwrap_or_default();
        let parsed = raw
            .into_iter()
            .filter_map(|(k, v)| Some((k.parse::<i64>().ok()?, v)))
            .collect();
        self.predictions.insert(db_id.to_string(), parsed);
        Ok(())
    }

    async fn write_metadata(&mut self) -> Result<(), PipelineError> {
        self.metadata.updated_at = now_rfc3339ish();
        self.metadata.questions_done = self.done.len();
        write_json(&self.layout.metadata_path(), &self.metadata).await
    }

    pub async fn set_db_state(&mut self, db_id: &str, state: DbState) -> Result<(), PipelineError> {
        if state == DbState::InProgress {
            self.load_db_predictions(db_id).await?;
        }
        self.metadata.databases.insert(db_id.to_string(), state);
        self.write_metadata().await
    }

    /// Persists one finished question: per-database predictions, checkpoint,
    /// selections, then statistics and metadata.
    pub async fn record(
        &mut self,
        question: &Question,
        mut selection: Selection,
        stats: Option<QuestionStats>,
    ) -> Result<(), PipelineError> {
        if question.runtime_schema_used.is_some() {
            selection.runtime_schema_used = question.runtime_schema_used.clone();
        }
        let db_id = question.db_id.as_str();
        self.load_db_predictions(db_id).await?;
        let mut record = PredictionRecord::new(&selection.chosen_sql, db_id);
        record.dataset_tag = self.dataset_tag.clone();
        let per_db = self.predictions.entry(db_id.to_string()).or_default();
        per_db.insert(question.question_id, record.to_string());
        let as_json = id_keyed(per_db);
        write_json(&self.layout.db_predictions_path(db_id), &as_json).await?;

        if self.done.insert(question.question_id) {
            append_line(&self.layout.checkpoint_path(), &question.question_id.to_string()).await?;
        }
        self.selections.insert(question.question_id, selection);
        write_json(&self.layout.selections_path(), &self.selections).await?;

        if let Some(stats) = stats {
            self.metadata
                .selection_stats
                .entry(db_id.to_string())
                .or_default()
                .add(&stats);
            self.write_stats().await?;
        }
        self.write_metadata().await
    }

    pub async fn log_error(
        &mut self,
        question_id: Option<i64>,
        db_id: &str,
        component: &str,
        message: impl Into<String>,
    ) -> Result<(), PipelineError> {
        self.errors.push(ErrorEntry {
            question_id,
            db_id: db_id.to_string(),
            component: component.to_string(),
            message: message.into(),
            at: now_rfc3339ish(),
        });
        write_json(&self.layout.error_log_path(), &self.errors).await
    }

    async fn write_stats(&self) -> Result<(), PipelineError> {
        let stats = &self.metadata.selection_stats;
        let config_ids: BTreeSet<u32> =
            self.metadata.generators.iter().map(|g| g.config_id).collect();
        let header = |extra: &[&str]| -> Vec<String> {
            std::iter::once("database".to_string())
                .chain(extra.iter().map(|s| s.to_string()))
                .collect()
        };
        let id_cols: Vec<String> = config_ids.iter().map(|id| format!("config_{id}")).collect();
        let id_refs: Vec<&str> = id_cols.iter().map(String::as_str).collect();
        let per_config = |pick: fn(&DbStats) -> &BTreeMap<u32, u64>| -> Vec<Vec<String>> {
            stats
                .iter()
                .map(|(db, s)| {
                    let counts = pick(s);
                    std::iter::once(db.clone())
                        .chain(
                            config_ids
                                .iter()
                                .map(|id| counts.get(id).copied().unwrap_or(0).to_string()),
                        )
                        .collect()
                })
                .collect()
        };

        let dir = self.layout.stats_dir();
        let files = [
            ("correct_generated.tsv", tsv(header(&id_refs), per_config(|s| &s.correct_generated))),
            ("config_selected.tsv", tsv(header(&id_refs), per_config(|s| &s.config_selected))),
            (
                "correct_selected.tsv",
                tsv(
                    header(&["correct_selected", "correct_generated"]),
                    stats
                        .iter()
                        .map(|(db, s)| {
                            vec![
                                db.clone(),
                                s.correct_selected.to_string(),
                                s.any_correct.to_string(),
                            ]
                        })
                        .collect(),
                ),
            ),
        ];
        for (name, content) in files {
            let path = dir.join(name);
            let content = content.map_err(|e| PipelineError::persistence(&path, e))?;
            write_atomic(&path, &content).await?;
        }
        Ok(())
    }

    /// Global predictions (question_id order), gold file and the questions
    /// file carrying `runtime_schema_used`. Questions answered by an earlier
    /// run get their linked schema back from the recorded selections.
    pub async fn finalize(&mut self, questions: &[Question]) -> Result<(), PipelineError> {
        let questions: Vec<Question> = questions
            .iter()
            .cloned()
            .map(|mut q| {
                if q.runtime_schema_used.is_none() {
                    q.runtime_schema_used = self
                        .selections
                        .get(&q.question_id)
                        .and_then(|s| s.runtime_schema_used.clone());
                }
                q
            })
            .collect();
        let dbs: BTreeSet<&str> = questions.iter().map(|q| q.db_id.as_str()).collect();
        let mut merged: BTreeMap<i64, String> = BTreeMap::new();
        for db in dbs {
            self.load_db_predictions(db).await?;
            if let Some(p) = self.predictions.get(db) {
                merged.extend(p.iter().map(|(k, v)| (*k, v.clone())));
            }
        }
        write_json(&self.layout.global_predictions_path(), &id_keyed(&merged)).await?;

        let mut sorted: Vec<&Question> = questions.iter().collect();
        sorted.sort_by_key(|q| q.question_id);
        let gold: Vec<String> = sorted
            .iter()
            .filter_map(|q| Some(GoldRecord::new(q.sql.as_deref()?, &q.db_id).to_string()))
            .collect();
        let mut gold_text = gold.join("\n");
        if !gold_text.is_empty() {
            gold_text.push('\n');
        }
        write_atomic(&self.layout.gold_path(), &gold_text).await?;

        write_json(&self.layout.questions_out_path(), &questions).await?;

        self.metadata.finished_at = Some(now_rfc3339ish());
        self.write_metadata().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Candidate, FinalStatus};

    fn question(id: i64, db: &str) -> Question {
        serde_json::from_value(serde_json::json!({
            "question_id": id, "db_id": db, "question": "q", "evidence": "",
            "SQL": format!("SELECT {id}")
        }))
        .unwrap()
    }

    fn selection(id: i64, sql: &str) -> Selection {
        Selection {
            question_id: id,
            chosen_config_id: 1,
            chosen_sql: sql.into(),
            candidates: vec![Candidate {
                config_id: 1,
                sql: sql.into(),
                trace: vec![],
                final_status: FinalStatus::Ok,
                refine_status: None,
            }],
            judge_input_fingerprint: None,
            runtime_schema_used: None,
        }
    }

    #[tokio::test]
    async fn records_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::under(dir.path());
        let mut ledger = RunLedger::open(&layout, "bird", &[]).await.unwrap();
        ledger.set_db_state("shop", DbState::InProgress).await.unwrap();
        ledger.record(&question(2, "shop"), selection(2, "SELECT\n2"), None).await.unwrap();
        ledger.log_error(Some(3), "shop", "generator", "boom").await.unwrap();

        let reopened = RunLedger::open(&layout, "bird", &[]).await.unwrap();
        assert!(reopened.is_done(2));
        assert!(!reopened.is_done(3));
        assert_eq!(reopened.selection(2).unwrap().chosen_sql, "SELECT\n2");
        assert_eq!(reopened.errors().len(), 1);
        assert_eq!(reopened.metadata().databases["shop"], DbState::InProgress);
        assert_eq!(reopened.metadata().run_id, ledger.metadata().run_id);

        let raw = std::fs::read_to_string(layout.db_predictions_path("shop")).unwrap();
        let per_db: BTreeMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(per_db["2"], "SELECT 2\t----- bird -----\tshop");
        assert_eq!(std::fs::read_to_string(layout.checkpoint_path()).unwrap(), "2\n");
    }

    #[tokio::test]
    async fn finalize_merges_in_question_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::under(dir.path());
        let mut ledger = RunLedger::open(&layout, "bird", &[]).await.unwrap();
        let qs = vec![question(10, "b"), question(2, "a"), question(3, "b")];
        for q in &qs {
            ledger.record(q, selection(q.question_id, "SELECT x"), None).await.unwrap();
        }
        ledger.finalize(&qs).await.unwrap();

        let raw = std::fs::read_to_string(layout.global_predictions_path()).unwrap();
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw).unwrap();
        let keys: Vec<String> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["2", "3", "10"]);
        let gold = std::fs::read_to_string(layout.gold_path()).unwrap();
        assert_eq!(gold, "SELECT 2\ta\nSELECT 3\tb\nSELECT 10\tb\n");
        assert!(ledger.metadata().finished_at.is_some());
    }

    #[tokio::test]
    async fn selection_stats_are_written_as_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::under(dir.path());
        let gen = |id: u32| {
            format!(
                "- {{config_id: {id}, model: [fake, m], temperature: 0, max_tokens: 8, \
                 prompt_config: {{type: basic, format_type: basic}}, \
                 prune_schema: false, add_evidence: false, improve: null}}\n"
            )
        };
        let gens: Vec<GeneratorConfig> = serde_yaml::from_str(&(gen(1) + &gen(2))).unwrap();
        let mut ledger = RunLedger::open(&layout, "bird", &gens).await.unwrap();
        let stats = QuestionStats {
            correct_configs: vec![2],
            selected_config: 1,
            selected_correct: false,
        };
        ledger.record(&question(1, "shop"), selection(1, "SELECT 1"), Some(stats)).await.unwrap();

        let dir = layout.stats_dir();
        let generated = std::fs::read_to_string(dir.join("correct_generated.tsv")).unwrap();
        assert_eq!(generated, "database\tconfig_1\tconfig_2\nshop\t0\t1\n");
        let selected = std::fs::read_to_string(dir.join("config_selected.tsv")).unwrap();
        assert_eq!(selected, "database\tconfig_1\tconfig_2\nshop\t1\t0\n");
        let summary = std::fs::read_to_string(dir.join("correct_selected.tsv")).unwrap();
        assert_eq!(summary, "database\tcorrect_selected\tcorrect_generated\nshop\t0\t1\n");
    }
}
