use super::checkpoint::{DbState, QuestionStats, RunLedger};
use super::generator::{GenerationInput, Generator};
use super::selector::{SelectionInput, Selector};
use crate::config::{KeywordStrategy, LlmConfig, RunConfig};
use crate::errors::PipelineError;
use crate::linking::keywords::KeywordExtractor;
use crate::linking::values::LshValueMatcher;
use crate::linking::{PipelineArgs, SchemaLinker};
use crate::model::{Candidate, Question, Selection};
use crate::providers::embedder::Embedder;
use crate::providers::factory::ClientFactory;
use crate::providers::llm::LlmClient;
use crate::retrieval::descriptions::DescriptionRetriever;
use crate::retrieval::few_shot::{FewShotExample, FewShotStore};
use crate::retrieval::CollectionRegistry;
use crate::schema::{PrunedSchema, Schema, SchemaStore};
use crate::sql::runner::{set_equal, SqlRunner, SqliteRunner};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

/// Resolves a model configuration to a client; the `&'static str` names the
/// role the client plays (generator, refiner, selector, ...).
pub type ClientResolver<'a> =
    dyn Fn(&LlmConfig, &'static str) -> Result<Arc<dyn LlmClient>, PipelineError> + 'a;

/// The database currently being worked on.
pub struct DbContext {
    pub db_id: String,
    pub schema: Arc<Schema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    /// Answered in this invocation.
    pub answered: usize,
    /// Already in the checkpoint.
    pub resumed: usize,
    /// Questions without a selection (every configuration failed).
    pub failed: Vec<i64>,
    pub skipped_databases: Vec<String>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub databases: usize,
    pub value_indexes: usize,
    pub description_collections: usize,
    pub samples: usize,
}

/// Questions grouped by database: groups in order of first appearance,
/// question order kept within a group.
pub fn group_by_db(questions: Vec<Question>) -> Vec<(String, Vec<Question>)> {
    let mut order: Vec<(String, Vec<Question>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for q in questions {
        match index.get(&q.db_id) {
            Some(&i) => order[i].1.push(q),
            None => {
                index.insert(q.db_id.clone(), order.len());
                order.push((q.db_id.clone(), vec![q]));
            }
        }
    }
    order
}

struct Shared {
    cfg: RunConfig,
    schemas: SchemaStore,
    runner: Arc<dyn SqlRunner>,
    generators: Vec<Arc<Generator>>,
    selector: Selector,
    linker: Option<SchemaLinker>,
    values: Option<Arc<LshValueMatcher>>,
    registry: Arc<CollectionRegistry>,
}

enum Answer {
    Selected(Box<Question>, Selection, Option<QuestionStats>),
    NoCandidates(Box<Question>),
    /// Shutdown was requested before generation started.
    Interrupted,
}

pub struct Orchestrator {
    inner: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Real providers, caches and embedder as configured.
    pub fn from_config(cfg: RunConfig, factory: &ClientFactory) -> Result<Self, PipelineError> {
        let embedder = factory.embedder(&cfg.embedder)?;
        Self::build(cfg, &|llm, role| factory.build(llm, role), embedder)
    }

    pub fn build(
        cfg: RunConfig,
        clients: &ClientResolver<'_>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;
        let runner: Arc<dyn SqlRunner> = Arc::new(SqliteRunner::new(cfg.dataset.clone()));
        let timeout = cfg.sql_timeout();
        let registry = Arc::new(CollectionRegistry::new(
            Some(cfg.output.index_dir.clone()),
            embedder,
        ));

        let mut generators = Vec::with_capacity(cfg.generators.len());
        for g in &cfg.generators {
            let llm = clients(&g.llm(), "generator")?;
            let refiner_llm = match (&g.improve, g.refiner_llm()) {
                (Some(r), Some(rcfg)) if r.client.is_some() => Some(clients(&rcfg, "refiner")?),
                _ => None,
            };
            generators.push(Arc::new(Generator::new(
                g.clone(),
                llm,
                refiner_llm,
                runner.clone(),
                timeout,
            )));
        }

        let selector_llm = cfg
            .selector
            .as_ref()
            .map(|s| clients(s, "selector"))
            .transpose()?;
        let selector = Selector::new(selector_llm, runner.clone(), timeout);

        let linking = &cfg.linking;
        let values = (linking.enabled && linking.pipeline).then(|| {
            let dataset = cfg.dataset.clone();
            Arc::new(LshValueMatcher::new(
                cfg.output.preprocessed_dir.clone(),
                move |db| dataset.sqlite_path(db),
                linking.lsh.clone(),
            ))
        });
        let linker = match (&linking.llm, linking.enabled) {
            (Some(llm_cfg), true) => {
                let llm = clients(llm_cfg, "schema_linker")?;
                let keywords = match linking.keywords {
                    KeywordStrategy::Rule => KeywordExtractor::rule_based(),
                    KeywordStrategy::Llm => {
                        let kcfg = linking.keyword_llm.as_ref().unwrap_or(llm_cfg);
                        KeywordExtractor::with_llm(clients(kcfg, "keywords")?)
                    }
                };
                let mut linker = SchemaLinker::new(llm, keywords)
                    .with_max_parse_retries(linking.max_parse_retries);
                if let Some(v) = &values {
                    linker = linker.with_pipeline(v.clone(), registry.clone());
                }
                Some(linker)
            }
            _ => None,
        };

        let (_tx, shutdown) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Shared {
                schemas: SchemaStore::new(cfg.dataset.clone()),
                cfg,
                runner,
                generators,
                selector,
                linker,
                values,
                registry,
            }),
            shutdown,
        })
    }

    /// Stops scheduling questions once the channel reads `true`. A question
    /// that has started generating still finishes and is recorded.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.cfg
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn few_shot_store(&self) -> anyhow::Result<Option<Arc<FewShotStore>>> {
        let cfg = &self.inner.cfg;
        if !cfg.generators.iter().any(|g| g.uses_examples()) {
            return Ok(None);
        }
        let path = cfg
            .samples
            .as_ref()
            .context("few-shot prompts need a `samples` file")?;
        let store = FewShotStore::open(&self.inner.registry, path).await?;
        tracing::info!(examples = store.len(), "few-shot store ready");
        Ok(Some(Arc::new(store)))
    }

    /// Full pipeline over the configured questions, resuming from any
    /// checkpoint in the output directory.
    pub async fn run(&self) -> anyhow::Result<RunSummary> {
        let cfg = &self.inner.cfg;
        let mut questions = Question::load_all(&cfg.questions)?;
        let ledger = RunLedger::open(&cfg.output, &cfg.dataset_tag, &cfg.generators).await?;
        let few_shot = self.few_shot_store().await?;
        let ledger = Arc::new(Mutex::new(ledger));

        let mut summary = RunSummary {
            total: questions.len(),
            ..RunSummary::default()
        };
        let mut linked: HashMap<i64, PrunedSchema> = HashMap::new();

        for (db_id, group) in group_by_db(questions.clone()) {
            if self.stopping() {
                summary.interrupted = true;
                break;
            }
            let schema = match self.inner.schemas.get_schema(&db_id) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(db_id = %db_id, error = %e, "skipping database");
                    let mut l = ledger.lock().await;
                    l.log_error(None, &db_id, "schema_store", e.to_string()).await?;
                    l.set_db_state(&db_id, DbState::Skipped).await?;
                    summary.skipped_databases.push(db_id);
                    continue;
                }
            };
            ledger.lock().await.set_db_state(&db_id, DbState::InProgress).await?;
            tracing::info!(db_id = %db_id, questions = group.len(), "database started");

            let ctx = Arc::new(DbContext { db_id: db_id.clone(), schema });
            let sem = Arc::new(Semaphore::new(cfg.concurrency.question_workers.max(1)));
            let mut join_set = JoinSet::new();
            for q in group {
                if ledger.lock().await.is_done(q.question_id) {
                    summary.resumed += 1;
                    continue;
                }
                let permit = sem.clone().acquire_owned().await?;
                if self.stopping() {
                    summary.interrupted = true;
                    break;
                }
                let shared = self.inner.clone();
                let ctx = ctx.clone();
                let few_shot = few_shot.clone();
                let ledger = ledger.clone();
                let shutdown = self.shutdown.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    let question_id = q.question_id;
                    let span = tracing::info_span!("question", question_id, db_id = %ctx.db_id);
                    let answer = shared
                        .answer(&ctx, q, few_shot.as_deref(), &ledger, &shutdown)
                        .instrument(span)
                        .await;
                    match answer {
                        Answer::Interrupted => Ok::<_, PipelineError>(None),
                        Answer::Selected(q, selection, stats) => {
                            ledger.lock().await.record(&q, selection, stats).await?;
                            Ok(Some((question_id, q.runtime_schema_used, true)))
                        }
                        Answer::NoCandidates(q) => {
                            ledger
                                .lock()
                                .await
                                .log_error(
                                    Some(question_id),
                                    &ctx.db_id,
                                    "orchestrator",
                                    "no candidate produced",
                                )
                                .await?;
                            Ok(Some((question_id, q.runtime_schema_used, false)))
                        }
                    }
                });
            }

            let mut fatal: Option<PipelineError> = None;
            while let Some(res) = join_set.join_next().await {
                match res {
                    Ok(Ok(Some((id, runtime_schema, answered)))) => {
                        if let Some(p) = runtime_schema {
                            linked.insert(id, p);
                        }
                        if answered {
                            summary.answered += 1;
                        } else {
                            summary.failed.push(id);
                        }
                    }
                    Ok(Ok(None)) => summary.interrupted = true,
                    Ok(Err(e)) => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => tracing::error!(db_id = %db_id, error = %e, "question task failed"),
                }
            }
            if let Some(e) = fatal {
                return Err(e.into());
            }
            let state = if summary.interrupted {
                DbState::InProgress
            } else {
                DbState::Completed
            };
            ledger.lock().await.set_db_state(&db_id, state).await?;
            tracing::info!(db_id = %db_id, state = ?state, "database finished");
        }

        for q in &mut questions {
            if let Some(p) = linked.remove(&q.question_id) {
                q.runtime_schema_used = Some(p);
            }
        }
        summary.failed.sort_unstable();
        ledger.lock().await.finalize(&questions).await?;
        tracing::info!(
            total = summary.total,
            answered = summary.answered,
            resumed = summary.resumed,
            failed = summary.failed.len(),
            interrupted = summary.interrupted,
            "run finished"
        );
        Ok(summary)
    }

    /// Computes `runtime_schema_used` for every question that lacks it and
    /// writes the questions file. Nothing else is generated.
    pub async fn link_only(&self) -> anyhow::Result<Vec<Question>> {
        let cfg = &self.inner.cfg;
        let linker = self
            .inner
            .linker
            .as_ref()
            .context("schema linking is disabled in this configuration")?;
        let args = self.inner.pipeline_args();
        let mut out = Vec::new();
        for (db_id, group) in group_by_db(Question::load_all(&cfg.questions)?) {
            let schema = match self.inner.schemas.get_schema(&db_id) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(db_id = %db_id, error = %e, "skipping database");
                    out.extend(group);
                    continue;
                }
            };
            for mut q in group {
                if self.stopping() {
                    out.push(q);
                    continue;
                }
                if q.runtime_schema_used.is_none() {
                    let linked = linker
                        .link(&schema, &q.question, &q.evidence, args.as_ref())
                        .await
                        .with_context(|| format!("linking question {}", q.question_id))?;
                    q.runtime_schema_used = Some(linked);
                }
                out.push(q);
            }
        }
        out.sort_by_key(|q| q.question_id);
        let raw = serde_json::to_string_pretty(&out)?;
        crate::storage::files::write_atomic(&cfg.output.questions_out_path(), &raw).await?;
        Ok(out)
    }

    /// Builds value indexes, description collections and the few-shot
    /// collection ahead of a run.
    pub async fn build_indexes(&self) -> anyhow::Result<IndexSummary> {
        let cfg = &self.inner.cfg;
        let questions = Question::load_all(&cfg.questions)?;
        let mut summary = IndexSummary::default();
        for (db_id, _) in group_by_db(questions) {
            if self.stopping() {
                break;
            }
            summary.databases += 1;
            let schema = match self.inner.schemas.get_schema(&db_id) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(db_id = %db_id, error = %e, "skipping database");
                    continue;
                }
            };
            if let Some(values) = &self.inner.values {
                if values.index(&db_id).await.is_some() {
                    summary.value_indexes += 1;
                }
            }
            DescriptionRetriever::open(&self.inner.registry, &schema).await?;
            summary.description_collections += 1;
        }
        if let Some(store) = self.few_shot_store().await? {
            summary.samples = store.len();
        }
        Ok(summary)
    }
}

impl Shared {
    fn pipeline_args(&self) -> Option<PipelineArgs> {
        let l = &self.cfg.linking;
        l.pipeline.then_some(PipelineArgs {
            value_top_k: l.value_top_k,
            description_top_k: l.description_top_k,
        })
    }

    async fn log(
        &self,
        ledger: &Mutex<RunLedger>,
        question_id: i64,
        db_id: &str,
        component: &str,
        err: &anyhow::Error,
    ) {
        tracing::warn!(component, error = %format!("{err:#}"), "question step failed");
        if let Err(e) = ledger
            .lock()
            .await
            .log_error(Some(question_id), db_id, component, format!("{err:#}"))
            .await
        {
            tracing::error!(error = %e, "could not write error log");
        }
    }

    async fn link(
        &self,
        ctx: &DbContext,
        q: &Question,
        ledger: &Mutex<RunLedger>,
    ) -> Option<PrunedSchema> {
        if let Some(p) = &q.runtime_schema_used {
            return Some(p.canonicalize(&ctx.schema));
        }
        let linker = self.linker.as_ref()?;
        match linker
            .link(&ctx.schema, &q.question, &q.evidence, self.pipeline_args().as_ref())
            .await
        {
            Ok(p) => Some(p),
            Err(e) => {
                self.log(ledger, q.question_id, &ctx.db_id, "schema_linker", &e).await;
                None
            }
        }
    }

    async fn examples(
        &self,
        ctx: &DbContext,
        q: &Question,
        store: Option<&FewShotStore>,
        ledger: &Mutex<RunLedger>,
    ) -> Vec<FewShotExample> {
        let k = self.generators.iter().map(|g| g.shots()).max().unwrap_or(0);
        let Some(store) = store.filter(|_| k > 0) else {
            return Vec::new();
        };
        match store.top_k(&q.question, k).await {
            Ok(ex) => ex,
            Err(e) => {
                self.log(ledger, q.question_id, &ctx.db_id, "few_shot", &e).await;
                Vec::new()
            }
        }
    }

    async fn candidates(
        &self,
        ctx: &Arc<DbContext>,
        q: &Question,
        pruned: Option<PrunedSchema>,
        examples: Vec<FewShotExample>,
        ledger: &Mutex<RunLedger>,
    ) -> Vec<Candidate> {
        let sem = Arc::new(Semaphore::new(self.cfg.concurrency.candidate_workers.max(1)));
        let pruned = Arc::new(pruned);
        let examples = Arc::new(examples);
        let question = Arc::new((q.question.clone(), q.evidence.clone()));
        let mut join_set = JoinSet::new();
        for generator in &self.generators {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let generator = generator.clone();
            let (ctx, pruned) = (ctx.clone(), pruned.clone());
            let (examples, question) = (examples.clone(), question.clone());
            join_set.spawn(async move {
                let _permit = permit;
                let input = GenerationInput {
                    db_id: &ctx.db_id,
                    schema: &ctx.schema,
                    pruned: (*pruned).as_ref(),
                    question: &question.0,
                    evidence: &question.1,
                    examples: &examples,
                };
                (generator.config_id(), generator.generate(&input).await)
            });
        }

        let mut out = Vec::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((_, Ok(c))) => out.push(c),
                Ok((config_id, Err(e))) => {
                    let e = e.context(format!("config {config_id}"));
                    self.log(ledger, q.question_id, &ctx.db_id, "generator", &e).await;
                }
                Err(e) => tracing::error!(error = %e, "generator task failed"),
            }
        }
        out
    }

    /// Executes gold and candidates; correctness is set equality of rows.
    async fn stats(
        &self,
        ctx: &DbContext,
        q: &Question,
        selection: &Selection,
    ) -> Option<QuestionStats> {
        let gold_sql = q.sql.as_deref()?;
        let timeout = self.cfg.sql_timeout();
        let gold = self.runner.execute(&ctx.db_id, gold_sql, timeout).await;
        let gold_rows = gold.rows()?.to_vec();
        let mut correct_configs = Vec::new();
        let mut selected_correct = false;
        for c in &selection.candidates {
            let result = self.runner.execute(&ctx.db_id, &c.sql, timeout).await;
            let correct = result.rows().is_some_and(|rows| set_equal(rows, &gold_rows));
            if correct {
                correct_configs.push(c.config_id);
                if c.config_id == selection.chosen_config_id {
                    selected_correct = true;
                }
            }
        }
        Some(QuestionStats {
            correct_configs,
            selected_config: selection.chosen_config_id,
            selected_correct,
        })
    }

    /// Link → generate → select for one question.
    async fn answer(
        &self,
        ctx: &Arc<DbContext>,
        mut q: Question,
        few_shot: Option<&FewShotStore>,
        ledger: &Mutex<RunLedger>,
        shutdown: &watch::Receiver<bool>,
    ) -> Answer {
        if *shutdown.borrow() {
            return Answer::Interrupted;
        }
        let pruned = self.link(ctx, &q, ledger).await;
        if self.linker.is_some() {
            q.runtime_schema_used = pruned.clone();
        }
        // Past this point the question runs to completion and is recorded.
        if *shutdown.borrow() {
            return Answer::Interrupted;
        }
        let examples = self.examples(ctx, &q, few_shot, ledger).await;
        let candidates = self.candidates(ctx, &q, pruned.clone(), examples, ledger).await;
        tracing::debug!(candidates = candidates.len(), "candidates ready");

        let input = SelectionInput {
            question_id: q.question_id,
            db_id: &ctx.db_id,
            schema: &ctx.schema,
            pruned: pruned.as_ref(),
            question: &q.question,
            evidence: &q.evidence,
        };
        let Some(selection) = self.selector.select(&input, candidates).await else {
            return Answer::NoCandidates(Box::new(q));
        };
        let stats = if self.cfg.collect_data {
            self.stats(ctx, &q, &selection).await
        } else {
            None
        };
        tracing::info!(chosen = selection.chosen_config_id, "question answered");
        Answer::Selected(Box::new(q), selection, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(id: i64, db: &str) -> Question {
        serde_json::from_value(serde_json::json!({
            "question_id": id, "db_id": db, "question": "q", "evidence": ""
        }))
        .unwrap()
    }

    #[test]
    fn groups_keep_first_appearance_order() {
        let groups = group_by_db(vec![q(1, "b"), q(2, "a"), q(3, "b"), q(4, "c"), q(5, "a")]);
        let shape: Vec<(String, Vec<i64>)> = groups
            .into_iter()
            .map(|(db, qs)| (db, qs.iter().map(|q| q.question_id).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("b".to_string(), vec![1, 3]),
                ("a".to_string(), vec![2, 5]),
                ("c".to_string(), vec![4]),
            ]
        );
    }
}
