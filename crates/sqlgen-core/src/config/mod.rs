use crate::errors::{PipelineError, RunError};
use crate::prompts::PromptStyle;
use crate::schema::SchemaFormat;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod paths;

pub use paths::{DatasetLayout, OutputLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(alias = "open_ai")]
    Openai,
    Deepseek,
    Dashscope,
    /// Canned replies; for dry runs and tests.
    Fake,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Dashscope => "dashscope",
            ProviderKind::Fake => "fake",
        }
    }
}

/// `[provider, model_name]` in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef(pub ProviderKind, pub String);

impl ModelRef {
    pub fn provider(&self) -> ProviderKind {
        self.0
    }

    pub fn name(&self) -> &str {
        &self.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: ModelRef,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(rename = "type")]
    pub style: PromptStyle,
    #[serde(default)]
    pub shots: usize,
    pub format_type: SchemaFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinerPrompt {
    Basic,
    Xiyan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerConfig {
    /// Repair model; `None` reuses the generator's client.
    #[serde(default, alias = "model")]
    pub client: Option<ModelRef>,
    pub prompt: RefinerPrompt,
    pub max_attempts: u32,
    #[serde(default)]
    pub shots: usize,
    #[serde(default = "default_true")]
    pub chat_mode: bool,
    /// `false` keeps repairing after a successful execution and reports the
    /// last executable query.
    #[serde(default = "default_true")]
    pub stop_on_success: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub config_id: u32,
    pub model: ModelRef,
    pub temperature: f32,
    pub max_tokens: u32,
    pub prompt_config: PromptConfig,
    pub prune_schema: bool,
    pub add_evidence: bool,
    /// Must be present in the file; `null` or `false` disables refinement.
    #[serde(deserialize_with = "required_refiner")]
    pub improve: Option<RefinerConfig>,
}

impl GeneratorConfig {
    pub fn llm(&self) -> LlmConfig {
        LlmConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn refiner_llm(&self) -> Option<LlmConfig> {
        let improve = self.improve.as_ref()?;
        Some(LlmConfig {
            model: improve.client.clone().unwrap_or_else(|| self.model.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }

    pub fn uses_examples(&self) -> bool {
        self.prompt_config.shots > 0 || self.improve.as_ref().is_some_and(|r| r.shots > 0)
    }
}

fn required_refiner<'de, D>(de: D) -> Result<Option<RefinerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Config(RefinerConfig),
    }
    match Option::<Raw>::deserialize(de)? {
        None | Some(Raw::Flag(false)) => Ok(None),
        Some(Raw::Flag(true)) => Err(serde::de::Error::custom(
            "improve: true is not a refiner configuration",
        )),
        Some(Raw::Config(c)) => Ok(Some(c)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordStrategy {
    #[default]
    Rule,
    Llm,
}

/// Value-index tunables. Defaults follow the benchmark preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshConfig {
    pub threshold: f64,
    pub num_perm: usize,
    pub ngram: usize,
    /// Byte budget of all distinct values for columns whose name contains "name".
    pub max_total_bytes_named: u64,
    pub max_total_bytes: u64,
    pub max_avg_len: f64,
    /// Columns with fewer distinct values are always indexed.
    pub min_distinct_always: u64,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            num_perm: 100,
            ngram: 3,
            max_total_bytes_named: 5_000_000,
            max_total_bytes: 2_000_000,
            max_avg_len: 25.0,
            min_distinct_always: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Schema selector model.
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub keywords: KeywordStrategy,
    /// Model for LLM keyword extraction; defaults to the selector model.
    #[serde(default)]
    pub keyword_llm: Option<LlmConfig>,
    /// Seed the selector with value and description matches.
    #[serde(default = "default_true")]
    pub pipeline: bool,
    #[serde(default = "default_top_k")]
    pub value_top_k: usize,
    #[serde(default = "default_top_k")]
    pub description_top_k: usize,
    #[serde(default = "default_parse_retries")]
    pub max_parse_retries: u32,
    #[serde(default)]
    pub lsh: LshConfig,
}

fn default_top_k() -> usize {
    5
}

fn default_parse_retries() -> u32 {
    3
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            llm: None,
            keywords: KeywordStrategy::Rule,
            keyword_llm: None,
            pipeline: true,
            value_top_k: default_top_k(),
            description_top_k: default_top_k(),
            max_parse_retries: default_parse_retries(),
            lsh: LshConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    Openai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub provider: EmbedderKind,
    pub model: String,
    pub dims: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: EmbedderKind::Hashing,
            model: "text-embedding-3-small".to_string(),
            dims: crate::providers::embedder::hashing::DEFAULT_DIMS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub question_workers: usize,
    pub candidate_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            question_workers: 3,
            candidate_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_ms: u64,
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 5_000,
            max_retries: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crate::providers::llm::retry::RetryPolicy {
        crate::providers::llm::retry::RetryPolicy {
            backoff: Duration::from_millis(self.backoff_ms),
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_dataset_tag")]
    pub dataset_tag: String,
    /// Question records (JSON array).
    pub questions: PathBuf,
    /// Training split used for few-shot retrieval.
    #[serde(default)]
    pub samples: Option<PathBuf>,
    pub dataset: DatasetLayout,
    pub output: OutputLayout,
    #[serde(default = "default_sql_timeout")]
    pub sql_timeout_secs: f64,
    #[serde(default)]
    pub collect_data: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub linking: LinkingConfig,
    /// Base URL overrides keyed by provider name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    pub generators: Vec<GeneratorConfig>,
    #[serde(default)]
    pub selector: Option<LlmConfig>,
}

fn default_dataset_tag() -> String {
    crate::model::DEFAULT_DATASET_TAG.to_string()
}

fn default_sql_timeout() -> f64 {
    crate::sql::runner::DEFAULT_TIMEOUT.as_secs_f64()
}

impl RunConfig {
    /// Reads, path-resolves and validates a YAML run file. Relative paths are
    /// taken relative to the file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RunError::missing_config(path.display().to_string(), e.to_string())
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let cfg = Self::from_yaml_str(&raw, base).map_err(|e| {
            RunError::config_parse(Some(path.display().to_string()), e.to_string())
        })?;
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str, base: &Path) -> Result<Self, PipelineError> {
        let de = serde_yaml::Deserializer::from_str(raw);
        let mut unknown = Vec::new();
        let mut cfg: RunConfig = serde_ignored::deserialize(de, |path| {
            unknown.push(path.to_string());
        })
        .map_err(|e| PipelineError::Config(e.to_string()))?;
        for key in &unknown {
            tracing::warn!(key = %key, "ignoring unknown config key");
        }
        cfg.resolve_paths(base);
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.questions);
        if let Some(s) = self.samples.as_mut() {
            fix(s);
        }
        fix(&mut self.dataset.dataset_dir);
        if let Some(d) = self.dataset.description_dir.as_mut() {
            fix(d);
        }
        fix(&mut self.output.output_dir);
        fix(&mut self.output.preprocessed_dir);
        fix(&mut self.output.index_dir);
        if let Some(c) = self.output.cache_db.as_mut() {
            fix(c);
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let err = |m: String| Err(PipelineError::Config(m));

        if self.generators.is_empty() {
            return err("at least one generator configuration is required".into());
        }
        let mut seen = HashSet::new();
        for g in &self.generators {
            if !seen.insert(g.config_id) {
                return err(format!("duplicate config_id {}", g.config_id));
            }
            let style = g.prompt_config.style;
            if style.requires_examples() && g.prompt_config.shots == 0 {
                return Err(PipelineError::MissingExamples {
                    style: style.as_str().to_string(),
                });
            }
            if g.max_tokens == 0 {
                return err(format!("config {}: max_tokens must be > 0", g.config_id));
            }
            if !(0.0..=2.0).contains(&g.temperature) {
                return err(format!(
                    "config {}: temperature {} outside [0, 2]",
                    g.config_id, g.temperature
                ));
            }
            if let Some(r) = &g.improve {
                if r.max_attempts == 0 {
                    return err(format!(
                        "config {}: improve.max_attempts must be >= 1",
                        g.config_id
                    ));
                }
            }
        }
        if self.generators.iter().any(GeneratorConfig::uses_examples) && self.samples.is_none() {
            return err("few-shot prompts need a `samples` file".into());
        }
        if self.generators.len() > 1 && self.selector.is_none() {
            return err("a selector model is required with more than one generator".into());
        }
        if self.concurrency.question_workers == 0 || self.concurrency.candidate_workers == 0 {
            return err("concurrency workers must be >= 1".into());
        }
        if self.linking.enabled && self.linking.llm.is_none() {
            return err("linking.llm is required when schema linking is enabled".into());
        }
        if self.linking.keywords == KeywordStrategy::Llm
            && self.linking.keyword_llm.is_none()
            && self.linking.llm.is_none()
        {
            return err("LLM keyword extraction needs linking.keyword_llm or linking.llm".into());
        }
        if !(0.0..=1.0).contains(&self.linking.lsh.threshold) || self.linking.lsh.num_perm == 0 {
            return err("linking.lsh: threshold must be in [0, 1] and num_perm > 0".into());
        }
        if self.sql_timeout_secs <= 0.0 {
            return err("sql_timeout_secs must be > 0".into());
        }
        if self.dataset_tag != crate::model::DEFAULT_DATASET_TAG {
            tracing::warn!(
                tag = %self.dataset_tag,
                "non-default dataset tag; downstream evaluators expect `bird`"
            );
        }
        Ok(())
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sql_timeout_secs)
    }

    pub fn generator(&self, config_id: u32) -> Option<&GeneratorConfig> {
        self.generators.iter().find(|g| g.config_id == config_id)
    }

    pub fn base_url(&self, provider: ProviderKind) -> Option<&str> {
        self.endpoints.get(provider.as_str()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
questions: dev.json
dataset:
  dataset_dir: dev_databases
output:
  output_dir: out
  preprocessed_dir: pre
  index_dir: idx
"#;

    fn parse(extra: &str) -> Result<RunConfig, PipelineError> {
        RunConfig::from_yaml_str(&format!("{BASE}{extra}"), Path::new("/runs"))
    }

    const ONE_GEN: &str = r#"
generators:
  - config_id: 1
    model: [openai, gpt-4o-mini]
    temperature: 0.0
    max_tokens: 512
    prompt_config: { type: code_repr, shots: 0, format_type: code }
    prune_schema: false
    add_evidence: true
    improve: null
"#;

    #[test]
    fn loads_minimal_config_and_resolves_paths() {
        let cfg = parse(ONE_GEN).unwrap();
        assert_eq!(cfg.questions, PathBuf::from("/runs/dev.json"));
        assert_eq!(cfg.output.output_dir, PathBuf::from("/runs/out"));
        assert_eq!(cfg.dataset_tag, "bird");
        assert_eq!(cfg.sql_timeout(), Duration::from_secs(30));
        assert!(cfg.generators[0].improve.is_none());
        assert_eq!(cfg.generators[0].model.provider(), ProviderKind::Openai);
        assert!(!cfg.linking.enabled);
    }

    #[test]
    fn improve_key_must_be_present() {
        let without = ONE_GEN.replace("    improve: null\n", "");
        let err = parse(&without).unwrap_err();
        assert!(err.to_string().contains("improve"), "{err}");

        let disabled = ONE_GEN.replace("improve: null", "improve: false");
        assert!(parse(&disabled).unwrap().generators[0].improve.is_none());
    }

    #[test]
    fn refiner_defaults() {
        let with = ONE_GEN.replace(
            "improve: null",
            "improve: { client: null, prompt: xiyan, max_attempts: 3 }",
        );
        let cfg = parse(&with).unwrap();
        let r = cfg.generators[0].improve.as_ref().unwrap();
        assert_eq!(r.prompt, RefinerPrompt::Xiyan);
        assert!(r.chat_mode && r.stop_on_success);
        assert_eq!(cfg.generators[0].refiner_llm().unwrap().model.name(), "gpt-4o-mini");

        let zero = ONE_GEN.replace("improve: null", "improve: { prompt: basic, max_attempts: 0 }");
        assert!(parse(&zero).is_err());
    }

    #[test]
    fn few_shot_styles_need_shots_and_samples() {
        let dail = ONE_GEN.replace("type: code_repr, shots: 0", "type: dail_sql, shots: 0");
        assert!(matches!(
            parse(&dail),
            Err(PipelineError::MissingExamples { .. })
        ));
        let no_samples = ONE_GEN.replace("type: code_repr, shots: 0", "type: dail_sql, shots: 3");
        assert!(parse(&no_samples).is_err());
        let ok = format!("samples: train.json\n{no_samples}");
        assert_eq!(parse(&ok).unwrap().samples, Some(PathBuf::from("/runs/train.json")));
    }

    #[test]
    fn unknown_style_and_format_are_rejected() {
        assert!(parse(&ONE_GEN.replace("code_repr", "haiku")).is_err());
        assert!(parse(&ONE_GEN.replace("format_type: code", "format_type: xml")).is_err());
    }

    #[test]
    fn second_generator_requires_selector() {
        let two = format!(
            "{ONE_GEN}{}",
            r#"
  - config_id: 2
    model: [deepseek, deepseek-chat]
    temperature: 0.7
    max_tokens: 512
    prompt_config: { type: basic, shots: 0, format_type: basic }
    prune_schema: true
    add_evidence: false
    improve: null
"#
        );
        assert!(parse(&two).is_err());
        let with_selector =
            format!("selector: {{ model: [dashscope, qwen-max], temperature: 0.2 }}\n{two}");
        let cfg = parse(&with_selector).unwrap();
        assert_eq!(cfg.selector.unwrap().max_tokens, 1024);

        let dup = two.replace("config_id: 2", "config_id: 1");
        assert!(parse(&format!("selector: {{ model: [fake, judge] }}\n{dup}")).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let cfg = parse(&format!("mystery_flag: 3\n{ONE_GEN}")).unwrap();
        assert_eq!(cfg.generators.len(), 1);
    }

    #[test]
    fn linking_needs_a_model() {
        assert!(parse(&format!("linking: {{ enabled: true }}\n{ONE_GEN}")).is_err());
        let cfg = parse(&format!(
            "linking: {{ enabled: true, llm: {{ model: [fake, selector] }} }}\n{ONE_GEN}"
        ))
        .unwrap();
        assert_eq!(cfg.linking.max_parse_retries, 3);
        assert_eq!(cfg.linking.lsh.num_perm, 100);
    }
}
