use crate::cli::args::EvalArgs;
use crate::exit_codes::EXIT_SUCCESS;
use anyhow::Context;
use sqlgen_core::config::DatasetLayout;
use sqlgen_core::eval::{load_predictions, Evaluator};
use sqlgen_core::sql::runner::SqliteRunner;
use sqlgen_core::Question;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: EvalArgs) -> anyhow::Result<i32> {
    if !args.timeout_secs.is_finite() || args.timeout_secs <= 0.0 {
        anyhow::bail!("--timeout-secs must be positive");
    }
    let questions = Question::load_all(&args.questions)?;
    let predictions = load_predictions(&args.predictions)?;
    let runner = Arc::new(SqliteRunner::new(DatasetLayout::new(&args.dataset_dir)));
    let report = Evaluator::new(runner, Duration::from_secs_f64(args.timeout_secs))
        .with_workers(args.workers)
        .evaluate(&questions, &predictions)
        .await?;

    println!("{}", report.render_table());
    let missing = report.results.iter().filter(|r| r.missing).count();
    if missing > 0 {
        eprintln!("{missing} questions have no prediction");
    }
    if let Some(path) = &args.report {
        let raw = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(EXIT_SUCCESS)
}
