use crate::cli::args::RunArgs;
use crate::exit_codes::{EXIT_RUN_FAILED, EXIT_SUCCESS};
use tokio::sync::watch;

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = super::load_config(&args)?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing questions already generating");
            let _ = tx.send(true);
        }
    });

    let orchestrator = super::build_orchestrator(cfg)?.with_shutdown(rx);
    let summary = orchestrator.run().await?;

    eprintln!(
        "questions: {}  answered: {}  resumed: {}  failed: {}",
        summary.total,
        summary.answered,
        summary.resumed,
        summary.failed.len()
    );
    if !summary.skipped_databases.is_empty() {
        eprintln!("skipped databases: {}", summary.skipped_databases.join(", "));
    }
    if summary.interrupted {
        eprintln!("interrupted; rerun the same command to resume");
    }
    eprintln!(
        "predictions: {}",
        orchestrator.config().output.global_predictions_path().display()
    );

    if summary.failed.is_empty() && !summary.interrupted {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_RUN_FAILED)
    }
}
