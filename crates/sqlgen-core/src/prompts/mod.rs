//! Prompt assembly: one builder per [`PromptStyle`], chosen through a
//! dispatch table. Every style gets the same inputs; layouts differ.

use crate::config::GeneratorConfig;
use crate::errors::PipelineError;
use crate::retrieval::few_shot::FewShotExample;
use crate::schema::{format_schema, PrunedSchema, Schema, SchemaFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod few_shot;
mod tasl;
mod zero_shot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    Basic,
    #[serde(alias = "text")]
    TextRepr,
    #[serde(alias = "code")]
    CodeRepr,
    #[serde(alias = "openai")]
    OpenaiDemo,
    AlpacaSft,
    FullInformation,
    SqlOnly,
    #[serde(alias = "dial_sql")]
    DailSql,
    IclXiyan,
    SemanticFullInformation,
    TaslDummy,
}

impl PromptStyle {
    pub const ALL: [PromptStyle; 11] = [
        PromptStyle::Basic,
        PromptStyle::TextRepr,
        PromptStyle::CodeRepr,
        PromptStyle::OpenaiDemo,
        PromptStyle::AlpacaSft,
        PromptStyle::FullInformation,
        PromptStyle::SqlOnly,
        PromptStyle::DailSql,
        PromptStyle::IclXiyan,
        PromptStyle::SemanticFullInformation,
        PromptStyle::TaslDummy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PromptStyle::Basic => "basic",
            PromptStyle::TextRepr => "text_repr",
            PromptStyle::CodeRepr => "code_repr",
            PromptStyle::OpenaiDemo => "openai_demo",
            PromptStyle::AlpacaSft => "alpaca_sft",
            PromptStyle::FullInformation => "full_information",
            PromptStyle::SqlOnly => "sql_only",
            PromptStyle::DailSql => "dail_sql",
            PromptStyle::IclXiyan => "icl_xiyan",
            PromptStyle::SemanticFullInformation => "semantic_full_information",
            PromptStyle::TaslDummy => "tasl_dummy",
        }
    }

    /// Few-shot styles cannot be built without examples.
    pub fn requires_examples(self) -> bool {
        matches!(
            self,
            PromptStyle::FullInformation
                | PromptStyle::SqlOnly
                | PromptStyle::DailSql
                | PromptStyle::IclXiyan
                | PromptStyle::SemanticFullInformation
        )
    }

    /// The prompt ends mid-query with `SELECT`; replies are continuations.
    pub fn ends_with_select(self) -> bool {
        !matches!(self, PromptStyle::IclXiyan)
    }

    /// Pulls the SQL out of a reply to a prompt of this style.
    pub fn extract_sql(self, reply: &str) -> Option<String> {
        let reply = match self {
            PromptStyle::TaslDummy => tasl::close_string_literal(reply),
            _ => reply,
        };
        crate::sql::extract_sql(reply, self.ends_with_select())
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptStyle {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let alias = match s.as_str() {
            "text" => Some(PromptStyle::TextRepr),
            "code" => Some(PromptStyle::CodeRepr),
            "openai" => Some(PromptStyle::OpenaiDemo),
            "dial_sql" => Some(PromptStyle::DailSql),
            _ => None,
        };
        match alias.or_else(|| PromptStyle::ALL.into_iter().find(|p| p.as_str() == s)) {
            Some(style) => Ok(style),
            None => Err(PipelineError::UnknownPromptStyle(s)),
        }
    }
}

/// How one generator configuration builds its prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPlan {
    pub prompt_style: PromptStyle,
    pub schema_format: SchemaFormat,
    pub shots: usize,
    pub include_evidence: bool,
    pub prune_schema: bool,
}

impl PromptPlan {
    pub fn from_generator(cfg: &GeneratorConfig) -> Self {
        Self {
            prompt_style: cfg.prompt_config.style,
            schema_format: cfg.prompt_config.format_type,
            shots: cfg.prompt_config.shots,
            include_evidence: cfg.add_evidence,
            prune_schema: cfg.prune_schema,
        }
    }
}

/// Per-question material a prompt is assembled from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub schema: &'a Schema,
    /// Linked subset; only used when the plan prunes.
    pub pruned: Option<&'a PrunedSchema>,
    pub question: &'a str,
    pub evidence: &'a str,
    pub examples: &'a [FewShotExample],
}

/// What every builder sees once plan and input are resolved.
pub(crate) struct PromptContext<'a> {
    pub schema: &'a Schema,
    pub pruned: Option<&'a PrunedSchema>,
    pub schema_text: String,
    pub question: &'a str,
    pub evidence: Option<&'a str>,
    pub examples: &'a [FewShotExample],
}

type BuilderFn = fn(&PromptContext<'_>) -> String;

fn builder(style: PromptStyle) -> BuilderFn {
    match style {
        PromptStyle::Basic => zero_shot::basic,
        PromptStyle::TextRepr => zero_shot::text_repr,
        PromptStyle::CodeRepr => zero_shot::code_repr,
        PromptStyle::OpenaiDemo => zero_shot::openai_demo,
        PromptStyle::AlpacaSft => zero_shot::alpaca_sft,
        PromptStyle::FullInformation => few_shot::full_information,
        PromptStyle::SqlOnly => few_shot::sql_only,
        PromptStyle::DailSql => few_shot::dail_sql,
        PromptStyle::IclXiyan => few_shot::icl_xiyan,
        PromptStyle::SemanticFullInformation => few_shot::semantic_full_information,
        PromptStyle::TaslDummy => tasl::dummy_sql,
    }
}

/// Builds the prompt for `plan`. At most `plan.shots` examples are used; a
/// few-shot style with none available fails with `MissingExamples`.
pub fn build(plan: &PromptPlan, input: &PromptInput<'_>) -> Result<String, PipelineError> {
    let style = plan.prompt_style;
    let examples = &input.examples[..input.examples.len().min(plan.shots)];
    if style.requires_examples() && examples.is_empty() {
        return Err(PipelineError::MissingExamples {
            style: style.as_str().to_string(),
        });
    }
    let pruned = input.pruned.filter(|p| plan.prune_schema && !p.is_empty());
    let evidence = Some(input.evidence.trim()).filter(|e| plan.include_evidence && !e.is_empty());
    let ctx = PromptContext {
        schema: input.schema,
        pruned,
        schema_text: format_schema(input.schema, pruned, plan.schema_format),
        question: input.question.trim(),
        evidence,
        examples,
    };
    Ok(builder(style)(&ctx))
}
