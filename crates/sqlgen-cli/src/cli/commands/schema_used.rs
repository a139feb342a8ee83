use crate::cli::args::SchemaUsedArgs;
use crate::exit_codes::EXIT_SUCCESS;
use anyhow::Context;
use sqlgen_core::config::DatasetLayout;
use sqlgen_core::eval::derive_schema_used;
use sqlgen_core::schema::SchemaStore;
use sqlgen_core::Question;

pub async fn run(args: SchemaUsedArgs) -> anyhow::Result<i32> {
    let mut questions = Question::load_all(&args.questions)?;
    let store = SchemaStore::new(DatasetLayout::new(&args.dataset_dir));
    let filled = derive_schema_used(&mut questions, &store);
    let out = args.output.as_ref().unwrap_or(&args.questions);
    let raw = serde_json::to_string_pretty(&questions)?;
    sqlgen_core::storage::files::write_atomic(out, &raw)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    eprintln!("schema_used filled for {filled}/{} questions", questions.len());
    Ok(EXIT_SUCCESS)
}
