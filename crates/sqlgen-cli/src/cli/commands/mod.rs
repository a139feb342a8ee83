pub mod eval;
pub mod index;
pub mod link;
pub mod run;
pub mod schema_used;
pub mod validate;

use crate::cli::args::{Cli, Command, RunArgs};
use sqlgen_core::providers::factory::ClientFactory;
use sqlgen_core::storage::Store;
use sqlgen_core::{Orchestrator, RunConfig};

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => run::run(args).await,
        Command::Link(args) => link::run(args).await,
        Command::Index(args) => index::run(args).await,
        Command::Eval(args) => eval::run(args).await,
        Command::SchemaUsed(args) => schema_used::run(args).await,
        Command::Validate(args) => validate::run(args).await,
    }
}

/// Loads the run file and applies command-line overrides.
pub(crate) fn load_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let mut cfg = RunConfig::load(&args.config)?;
    if let Some(dir) = &args.output_dir {
        cfg.output.output_dir = dir.clone();
    }
    if let Some(q) = &args.questions {
        cfg.questions = q.clone();
    }
    if let Some(n) = args.question_workers {
        cfg.concurrency.question_workers = n;
    }
    if let Some(n) = args.candidate_workers {
        cfg.concurrency.candidate_workers = n;
    }
    if args.no_cache {
        cfg.output.cache_db = None;
    }
    cfg.validate()?;
    Ok(cfg)
}

pub(crate) fn build_orchestrator(cfg: RunConfig) -> anyhow::Result<Orchestrator> {
    let store = match &cfg.output.cache_db {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = Store::open(path)?;
            store.init_schema()?;
            Some(store)
        }
        None => None,
    };
    let factory = ClientFactory::from_config(&cfg, store);
    Ok(Orchestrator::from_config(cfg, &factory)?)
}
