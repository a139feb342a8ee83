//! One generator configuration applied to one question.

use super::refiner::{RefineContext, Refiner};
use crate::config::GeneratorConfig;
use crate::model::{Candidate, FinalStatus};
use crate::prompts::{self, PromptInput, PromptPlan};
use crate::providers::llm::LlmClient;
use crate::retrieval::few_shot::FewShotExample;
use crate::schema::{PrunedSchema, Schema};
use crate::sql::runner::{ExecutionResult, SqlRunner};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

/// Completions tried before a configuration gives up on a question.
pub const MAX_EXTRACTION_ATTEMPTS: u32 = 3;

/// Per-question inputs shared by every configuration.
#[derive(Debug, Clone, Copy)]
pub struct GenerationInput<'a> {
    pub db_id: &'a str,
    pub schema: &'a Schema,
    pub pruned: Option<&'a PrunedSchema>,
    pub question: &'a str,
    pub evidence: &'a str,
    /// Nearest training examples, at least as many as any configuration asks for.
    pub examples: &'a [FewShotExample],
}

pub struct Generator {
    cfg: GeneratorConfig,
    plan: PromptPlan,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn SqlRunner>,
    refiner: Option<Refiner>,
    timeout: Duration,
}

impl Generator {
    /// `refiner_llm` is only used when the configuration enables refinement;
    /// `None` reuses the generation client.
    pub fn new(
        cfg: GeneratorConfig,
        llm: Arc<dyn LlmClient>,
        refiner_llm: Option<Arc<dyn LlmClient>>,
        runner: Arc<dyn SqlRunner>,
        timeout: Duration,
    ) -> Self {
        let refiner = cfg.improve.clone().map(|rcfg| {
            let client = refiner_llm.unwrap_or_else(|| llm.clone());
            Refiner::new(client, runner.clone(), rcfg, timeout)
        });
        Self {
            plan: PromptPlan::from_generator(&cfg),
            cfg,
            llm,
            runner,
            refiner,
            timeout,
        }
    }

    pub fn config_id(&self) -> u32 {
        self.cfg.config_id
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.cfg
    }

    /// Examples this configuration needs, prompt and refiner combined.
    pub fn shots(&self) -> usize {
        let refiner_shots = self.cfg.improve.as_ref().map_or(0, |r| r.shots);
        self.plan.shots.max(refiner_shots)
    }

    async fn complete_sql(
        &self,
        prompt: &str,
        input: &GenerationInput<'_>,
    ) -> anyhow::Result<String> {
        let style = self.plan.prompt_style;
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=MAX_EXTRACTION_ATTEMPTS {
            match self.llm.complete(prompt, None).await {
                Ok(resp) => match style.extract_sql(&resp.text) {
                    Some(sql) => return Ok(sql),
                    None => tracing::warn!(
                        component = "generator",
                        config_id = self.cfg.config_id,
                        db_id = input.db_id,
                        attempt,
                        "empty SQL extraction"
                    ),
                },
                Err(e) => {
                    tracing::warn!(
                        component = "generator",
                        config_id = self.cfg.config_id,
                        db_id = input.db_id,
                        attempt,
                        error = %e,
                        "generation call failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context(format!(
                "config {} produced no SQL after {MAX_EXTRACTION_ATTEMPTS} attempts",
                self.cfg.config_id
            ))),
            None => anyhow::bail!(
                "config {} produced no SQL after {MAX_EXTRACTION_ATTEMPTS} attempts",
                self.cfg.config_id
            ),
        }
    }

    /// Prompt → completion → extracted SQL, refined when configured.
    pub async fn generate(&self, input: &GenerationInput<'_>) -> anyhow::Result<Candidate> {
        let prompt = prompts::build(
            &self.plan,
            &PromptInput {
                schema: input.schema,
                pruned: input.pruned,
                question: input.question,
                evidence: input.evidence,
                examples: input.examples,
            },
        )
        .with_context(|| format!("config {}: building prompt", self.cfg.config_id))?;

        let sql = self.complete_sql(&prompt, input).await?;

        let Some(refiner) = &self.refiner else {
            let result = self.runner.execute(input.db_id, &sql, self.timeout).await;
            return Ok(Candidate {
                config_id: self.cfg.config_id,
                sql,
                trace: Vec::new(),
                final_status: final_status(&result),
                refine_status: None,
            });
        };

        let shots = refiner.config().shots.min(input.examples.len());
        let ctx = RefineContext {
            db_id: input.db_id,
            schema: input.schema,
            pruned: input.pruned.filter(|p| self.cfg.prune_schema && !p.is_empty()),
            question: input.question,
            evidence: if self.cfg.add_evidence { input.evidence } else { "" },
            examples: &input.examples[..shots],
        };
        let outcome = refiner.refine(&ctx, sql).await;
        tracing::debug!(
            config_id = self.cfg.config_id,
            status = ?outcome.status,
            steps = outcome.trace.len(),
            "refinement finished"
        );
        Ok(Candidate {
            config_id: self.cfg.config_id,
            sql: outcome.sql,
            trace: outcome.trace,
            final_status: outcome.final_status,
            refine_status: Some(outcome.status),
        })
    }
}

pub fn final_status(result: &ExecutionResult) -> FinalStatus {
    match result {
        ExecutionResult::Rows(_) => FinalStatus::Ok,
        ExecutionResult::Error(_) => FinalStatus::Error,
        ExecutionResult::Timeout => FinalStatus::Timeout,
    }
}
