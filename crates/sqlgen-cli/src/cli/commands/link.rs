use crate::cli::args::RunArgs;
use crate::exit_codes::EXIT_SUCCESS;

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = super::load_config(&args)?;
    let orchestrator = super::build_orchestrator(cfg)?;
    let questions = orchestrator.link_only().await?;
    let linked = questions
        .iter()
        .filter(|q| q.runtime_schema_used.is_some())
        .count();
    eprintln!(
        "linked {linked}/{} questions -> {}",
        questions.len(),
        orchestrator.config().output.questions_out_path().display()
    );
    if let Some(recall) = sqlgen_core::eval::linking_recall(&questions) {
        eprintln!(
            "table recall {:.3}  column recall {:.3}  exact cover {}/{}",
            recall.table_recall, recall.column_recall, recall.exact_cover, recall.questions
        );
    }
    Ok(EXIT_SUCCESS)
}
