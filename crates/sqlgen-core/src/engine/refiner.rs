//! Execution-feedback repair loop.

use crate::config::{RefinerConfig, RefinerPrompt};
use crate::model::{FinalStatus, RefineStatus, RefineStep, StepOutcome};
use crate::providers::llm::{ChatTurn, LlmClient};
use crate::retrieval::few_shot::FewShotExample;
use crate::schema::{format_schema, PrunedSchema, Schema, SchemaFormat};
use crate::sql::runner::{truncate_bytes, ExecutionResult, SqlRunner};
use crate::sql::extract_sql;
use std::sync::Arc;
use std::time::Duration;

/// Rows shown to the model for a successful execution.
const SAMPLE_ROWS: usize = 5;
const XIYAN_RESULT_BYTES: usize = 2_000;

/// What the repair prompts are written about.
#[derive(Debug, Clone, Copy)]
pub struct RefineContext<'a> {
    pub db_id: &'a str,
    pub schema: &'a Schema,
    pub pruned: Option<&'a PrunedSchema>,
    pub question: &'a str,
    pub evidence: &'a str,
    pub examples: &'a [FewShotExample],
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutcome {
    pub sql: String,
    pub status: RefineStatus,
    pub final_status: FinalStatus,
    pub trace: Vec<RefineStep>,
}

pub fn step_outcome(result: &ExecutionResult) -> StepOutcome {
    match result {
        ExecutionResult::Rows(rs) => StepOutcome::Rows {
            row_count: rs.rows.len(),
            preview: result.render_sample(SAMPLE_ROWS),
        },
        ExecutionResult::Error(message) => StepOutcome::Error {
            message: message.clone(),
        },
        ExecutionResult::Timeout => StepOutcome::Timeout,
    }
}

fn examples_text(examples: &[FewShotExample]) -> String {
    examples
        .iter()
        .map(|e| format!("/* Question: {} */\n{}\n", e.question, e.sql))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn basic_prompt(ctx: &RefineContext<'_>, sql: &str, result: &ExecutionResult) -> String {
    format!(
        "\n/* You are a SQLite expert. */\n\
         /* Given the following database schema: */\n{}\n\n\
         /* Here are some example questions and their corresponding SQL queries: */\n{}\n\n\
         /* Task: Improve the following predicted SQLite SQL query. */\n\
         /* If there are no improvements to be made, \
         return the original query and nothing else. */\n\
         /* Provide only the improved query without any explanation. */\n\n\
         /* Question: {} */\n\
         /* Predicted SQL: */\n{}\n\
         /* Results from Predicted SQL: */\n{}\n",
        format_schema(ctx.schema, ctx.pruned, SchemaFormat::Code),
        examples_text(ctx.examples),
        ctx.question,
        sql,
        result.render_sample(SAMPLE_ROWS),
    )
}

pub fn xiyan_prompt(ctx: &RefineContext<'_>, sql: &str, result: &ExecutionResult) -> String {
    let evidence = if ctx.evidence.trim().is_empty() {
        "None"
    } else {
        ctx.evidence.trim()
    };
    let mut out = format!(
        "You are a SQLite expert. The query below was written to answer the question, but its \
         execution failed or returned a doubtful result. Correct it.\n\n\
         {}\n\n【Question】\n{}\n【Evidence】\n{}\n",
        format_schema(ctx.schema, ctx.pruned, SchemaFormat::MSchema),
        ctx.question,
        evidence,
    );
    if !ctx.examples.is_empty() {
        out.push_str("【Reference examples】\n");
        out.push_str(&examples_text(ctx.examples));
        out.push('\n');
    }
    out.push_str(&format!(
        "【SQL】\n{}\n【Execution result】\n{}\n\n\
         Return the corrected query inside a single ```sql code block.",
        sql,
        truncate_bytes(&result.render_sample(SAMPLE_ROWS), XIYAN_RESULT_BYTES),
    ));
    out
}

pub struct Refiner {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn SqlRunner>,
    cfg: RefinerConfig,
    timeout: Duration,
}

impl Refiner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn SqlRunner>,
        cfg: RefinerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            runner,
            cfg,
            timeout,
        }
    }

    pub fn config(&self) -> &RefinerConfig {
        &self.cfg
    }

    fn prompt(&self, ctx: &RefineContext<'_>, sql: &str, result: &ExecutionResult) -> String {
        match self.cfg.prompt {
            RefinerPrompt::Basic => basic_prompt(ctx, sql, result),
            RefinerPrompt::Xiyan => xiyan_prompt(ctx, sql, result),
        }
    }

    async fn ask(&self, prompt: String, turns: &mut Vec<ChatTurn>) -> anyhow::Result<String> {
        if !self.cfg.chat_mode {
            return Ok(self.llm.complete(&prompt, None).await?.text);
        }
        turns.push(ChatTurn::user(prompt));
        match self.llm.chat(turns).await {
            Ok(resp) => {
                turns.push(ChatTurn::assistant(resp.text.clone()));
                Ok(resp.text)
            }
            Err(e) => {
                turns.pop();
                Err(e)
            }
        }
    }

    /// Executes `sql` and repairs it from the execution feedback until it runs
    /// (or, with `stop_on_success` off, until the attempts are used up). The
    /// output of the last repair is always executed once more, so an `Ok*`
    /// status means the returned query executes.
    pub async fn refine(&self, ctx: &RefineContext<'_>, sql: String) -> RefineOutcome {
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut sql = sql;
        let mut trace: Vec<RefineStep> = Vec::new();
        let mut turns: Vec<ChatTurn> = Vec::new();
        let mut last_ok: Option<String> = None;
        let mut attempt: u32 = 0;

        let last = loop {
            let result = self.runner.execute(ctx.db_id, &sql, self.timeout).await;
            if result.is_ok() {
                if self.cfg.stop_on_success {
                    return RefineOutcome {
                        sql,
                        status: ok_status(attempt),
                        final_status: FinalStatus::Ok,
                        trace,
                    };
                }
                last_ok = Some(sql.clone());
            }
            if attempt >= max_attempts {
                break result;
            }

            attempt += 1;
            let prompt = self.prompt(ctx, &sql, &result);
            let sql_after = match self.ask(prompt, &mut turns).await {
                Ok(reply) => match extract_sql(&reply, false) {
                    Some(s) => s,
                    None => {
                        tracing::warn!(
                            component = "refiner",
                            db_id = ctx.db_id,
                            attempt,
                            "no SQL in repair reply"
                        );
                        sql.clone()
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        component = "refiner",
                        db_id = ctx.db_id,
                        attempt,
                        error = %e,
                        "repair call failed"
                    );
                    sql.clone()
                }
            };
            trace.push(RefineStep {
                attempt,
                sql_before: sql.clone(),
                execution_outcome: step_outcome(&result),
                sql_after: sql_after.clone(),
            });
            sql = sql_after;
        };

        if last.is_ok() {
            let status = if trace.iter().any(|s| s.sql_after != s.sql_before) {
                RefineStatus::OkAfterRepair
            } else {
                RefineStatus::OkFromStart
            };
            return RefineOutcome {
                sql,
                status,
                final_status: FinalStatus::Ok,
                trace,
            };
        }
        match last_ok {
            Some(ok_sql) => RefineOutcome {
                sql: ok_sql,
                status: RefineStatus::ExhaustedWithLastOk,
                final_status: FinalStatus::Ok,
                trace,
            },
            None => RefineOutcome {
                sql,
                status: RefineStatus::Exhausted,
                final_status: match last {
                    ExecutionResult::Timeout => FinalStatus::Timeout,
                    _ => FinalStatus::Error,
                },
                trace,
            },
        }
    }
}

fn ok_status(attempt: u32) -> RefineStatus {
    if attempt == 0 {
        RefineStatus::OkFromStart
    } else {
        RefineStatus::OkAfterRepair
    }
}
