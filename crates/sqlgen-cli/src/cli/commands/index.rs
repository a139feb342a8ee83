use crate::cli::args::RunArgs;
use crate::exit_codes::EXIT_SUCCESS;

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = super::load_config(&args)?;
    let summary = super::build_orchestrator(cfg)?.build_indexes().await?;
    eprintln!(
        "databases: {}  value indexes: {}  description collections: {}  samples: {}",
        summary.databases, summary.value_indexes, summary.description_collections, summary.samples
    );
    Ok(EXIT_SUCCESS)
}
