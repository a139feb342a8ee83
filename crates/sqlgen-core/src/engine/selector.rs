//! Picks one candidate per question.

use crate::fingerprint::sha256_hex;
use crate::model::{Candidate, Selection};
use crate::providers::llm::LlmClient;
use crate::schema::{format_schema, PrunedSchema, Schema, SchemaFormat};
use crate::sql::runner::{ExecutionResult, SqlRunner};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const PREVIEW_ROWS: usize = 10;
pub const PREVIEW_CELL_CHARS: usize = 100;
const CANDIDATE_SEPARATOR: &str = "\n\n********\n\n";

#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    pub question_id: i64,
    pub db_id: &'a str,
    pub schema: &'a Schema,
    pub pruned: Option<&'a PrunedSchema>,
    pub question: &'a str,
    pub evidence: &'a str,
}

/// `A`, `B`, … `Z`, then `AA`, `AB`, …
pub fn label(index: usize) -> String {
    const N: usize = 26;
    if index < N {
        return char::from(b'A' + index as u8).to_string();
    }
    format!("{}{}", label(index / N - 1), label(index % N))
}

fn or_list(labels: &[String]) -> String {
    let quoted: Vec<String> = labels.iter().map(|l| format!("\"{l}\"")).collect();
    match quoted.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} or {last}", rest.join(", ")),
        Some((last, _)) => last.clone(),
        None => String::new(),
    }
}

/// A candidate as shown to the judge.
pub struct LabelledCandidate<'a> {
    pub label: String,
    pub sql: &'a str,
    pub preview: String,
}

pub fn judge_prompt(input: &SelectionInput<'_>, candidates: &[LabelledCandidate<'_>]) -> String {
    let evidence = if input.evidence.trim().is_empty() {
        "None"
    } else {
        input.evidence.trim()
    };
    let blocks: Vec<String> = candidates
        .iter()
        .map(|c| {
            format!(
                "Candidate {}\n【SQL】\n{}\n【Execution Result】\n{}",
                c.label, c.sql, c.preview
            )
        })
        .collect();
    let labels: Vec<String> = candidates.iter().map(|c| c.label.clone()).collect();
    format!(
        "You are a SQLite expert. Several SQL queries were written for the question below. \
         Compare them with the schema, the evidence and their execution results, and pick the \
         one that answers the question correctly.\n\n\
         {}\n\n【Evidence】\n{}\n【Question】\n{}\n\n{}\n\
         Please output the selected candidate as {} and nothing else.",
        format_schema(input.schema, input.pruned, SchemaFormat::MSchema),
        evidence,
        input.question,
        blocks.join(CANDIDATE_SEPARATOR),
        or_list(&labels),
    )
}

fn label_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{1,2}\b").expect("static regex"))
}

fn bare_label(text: &str, labels: &[String]) -> Option<usize> {
    let bare = text
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c.is_whitespace());
    let bare = bare.strip_prefix("Answer:").map(str::trim_start).unwrap_or(bare);
    let bare = bare.strip_prefix("Candidate ").unwrap_or(bare);
    labels.iter().position(|l| l == bare)
}

/// The reply as a bare label, then its first line as one (a verdict followed
/// by an explanation), else the last standalone label token in it.
pub fn parse_label(reply: &str, labels: &[String]) -> Option<usize> {
    if let Some(i) = bare_label(reply, labels) {
        return Some(i);
    }
    if let Some(i) = reply
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|first| bare_label(first, labels))
    {
        return Some(i);
    }
    label_token()
        .find_iter(reply)
        .filter_map(|m| labels.iter().position(|l| l == m.as_str()))
        .last()
}

pub struct Selector {
    llm: Option<Arc<dyn LlmClient>>,
    runner: Arc<dyn SqlRunner>,
    timeout: Duration,
}

impl Selector {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        runner: Arc<dyn SqlRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            runner,
            timeout,
        }
    }

    fn chosen(
        input: &SelectionInput<'_>,
        candidates: Vec<Candidate>,
        index: usize,
        fingerprint: Option<String>,
    ) -> Selection {
        let winner = &candidates[index];
        Selection {
            question_id: input.question_id,
            chosen_config_id: winner.config_id,
            chosen_sql: winner.sql.clone(),
            judge_input_fingerprint: fingerprint,
            candidates,
            runtime_schema_used: None,
        }
    }

    /// Returns `None` only when there is nothing to choose from.
    pub async fn select(
        &self,
        input: &SelectionInput<'_>,
        mut candidates: Vec<Candidate>,
    ) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|c| c.config_id);
        if candidates.len() == 1 {
            return Some(Self::chosen(input, candidates, 0, None));
        }

        // First candidate of each distinct execution result, in config order.
        let mut seen = HashSet::new();
        let mut groups: Vec<(usize, ExecutionResult)> = Vec::new();
        for (i, c) in candidates.iter().enumerate() {
            let result = self.runner.execute(input.db_id, &c.sql, self.timeout).await;
            if seen.insert(result.result_hash()) {
                groups.push((i, result));
            }
        }
        if groups.len() == 1 {
            tracing::debug!(question_id = input.question_id, "all candidates agree");
            return Some(Self::chosen(input, candidates, 0, None));
        }

        let labelled: Vec<LabelledCandidate<'_>> = groups
            .iter()
            .enumerate()
            .map(|(n, (i, result))| LabelledCandidate {
                label: label(n),
                sql: &candidates[*i].sql,
                preview: result.markdown_preview(PREVIEW_ROWS, PREVIEW_CELL_CHARS),
            })
            .collect();
        let prompt = judge_prompt(input, &labelled);
        let labels: Vec<String> = labelled.into_iter().map(|c| c.label).collect();
        let fingerprint = Some(sha256_hex(&prompt));

        let Some(llm) = &self.llm else {
            tracing::warn!(
                component = "selector",
                question_id = input.question_id,
                "no selector model configured, taking the first candidate"
            );
            return Some(Self::chosen(input, candidates, 0, fingerprint));
        };
        let picked = match llm.complete(&prompt, None).await {
            Ok(resp) => parse_label(&resp.text, &labels),
            Err(e) => {
                tracing::warn!(
                    component = "selector",
                    question_id = input.question_id,
                    error = %e,
                    "judge call failed"
                );
                None
            }
        };
        let index = match picked {
            Some(n) => groups[n].0,
            None => {
                tracing::warn!(
                    component = "selector",
                    question_id = input.question_id,
                    "no usable judge label, taking the first candidate"
                );
                0
            }
        };
        Some(Self::chosen(input, candidates, index, fingerprint))
    }
}
