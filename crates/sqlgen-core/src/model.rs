use crate::schema::pruned::PrunedSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker placed between the SQL and the database id in prediction lines.
pub const DEFAULT_DATASET_TAG: &str = "bird";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// One benchmark item. Keys the pipeline does not know about are carried
/// through `extra` so rewriting the questions file loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub question_id: i64,
    pub db_id: String,
    pub question: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(rename = "SQL", default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_used: Option<PrunedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_schema_used: Option<PrunedSchema>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Question {
    pub fn load_all(path: &std::path::Path) -> anyhow::Result<Vec<Question>> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read questions file {}", path.display()))?;
        let items: Vec<Question> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse questions file {}", path.display()))?;
        Ok(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefineStatus {
    OkFromStart,
    OkAfterRepair,
    ExhaustedWithLastOk,
    Exhausted,
}

impl RefineStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, RefineStatus::OkFromStart | RefineStatus::OkAfterRepair)
    }
}

/// What a refinement step observed when it executed `sql_before`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Rows { row_count: usize, preview: String },
    Error { message: String },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineStep {
    pub attempt: u32,
    pub sql_before: String,
    pub execution_outcome: StepOutcome,
    pub sql_after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub config_id: u32,
    pub sql: String,
    #[serde(default)]
    pub trace: Vec<RefineStep>,
    pub final_status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine_status: Option<RefineStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub question_id: i64,
    pub chosen_config_id: u32,
    pub chosen_sql: String,
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_input_fingerprint: Option<String>,
    /// The question's linked schema, kept so a resumed run can restore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_schema_used: Option<PrunedSchema>,
}

/// `"<sql>\t----- <tag> -----\t<db_id>"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRecord {
    pub sql: String,
    pub dataset_tag: String,
    pub db_id: String,
}

impl PredictionRecord {
    pub fn new(sql: &str, db_id: &str) -> Self {
        Self {
            sql: single_line(sql),
            dataset_tag: DEFAULT_DATASET_TAG.to_string(),
            db_id: db_id.to_string(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let (sql, rest) = line.split_once("\t----- ")?;
        let (tag, db_id) = rest.split_once(" -----\t")?;
        if sql.is_empty() || tag.is_empty() || db_id.is_empty() {
            return None;
        }
        Some(Self {
            sql: sql.to_string(),
            dataset_tag: tag.to_string(),
            db_id: db_id.to_string(),
        })
    }
}

impl fmt::Display for PredictionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t----- {} -----\t{}", self.sql, self.dataset_tag, self.db_id)
    }
}

/// `"<sql>\t<db_id>"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldRecord {
    pub sql: String,
    pub db_id: String,
}

impl GoldRecord {
    pub fn new(sql: &str, db_id: &str) -> Self {
        Self {
            sql: single_line(sql),
            db_id: db_id.to_string(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let (sql, db_id) = line.rsplit_once('\t')?;
        Some(Self {
            sql: sql.to_string(),
            db_id: db_id.to_string(),
        })
    }
}

impl fmt::Display for GoldRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.sql, self.db_id)
    }
}

/// Turns each tab and line break into a space so a record always fits on one
/// line. Other whitespace is kept as written.
pub fn single_line(sql: &str) -> String {
    sql.replace(['\n', '\r', '\t'], " ")
}
