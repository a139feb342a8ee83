use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sqlgen",
    version,
    about = "Text-to-SQL: schema linking, candidate generation, \
             execution-guided refinement and selection"
)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SQLGEN_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full pipeline, resuming from the checkpoint in the output directory
    Run(RunArgs),
    /// Compute runtime_schema_used for every question and stop
    Link(RunArgs),
    /// Build value indexes and vector collections ahead of a run
    Index(RunArgs),
    /// Execution accuracy of a predictions file
    Eval(EvalArgs),
    /// Derive schema_used from the gold SQL of a questions file
    SchemaUsed(SchemaUsedArgs),
    /// Load and validate a run configuration
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, short = 'c', default_value = "sqlgen.yaml", env = "SQLGEN_CONFIG")]
    pub config: PathBuf,

    /// Overrides output.output_dir
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Overrides the questions file
    #[arg(long)]
    pub questions: Option<PathBuf>,

    #[arg(long)]
    pub question_workers: Option<usize>,

    #[arg(long)]
    pub candidate_workers: Option<usize>,

    /// Disable the LLM response cache even when output.cache_db is set
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    #[arg(long)]
    pub predictions: PathBuf,

    #[arg(long)]
    pub questions: PathBuf,

    /// Directory holding <db>/<db>.sqlite
    #[arg(long)]
    pub dataset_dir: PathBuf,

    #[arg(long, default_value_t = 30.0)]
    pub timeout_secs: f64,

    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Write the full report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SchemaUsedArgs {
    #[arg(long)]
    pub questions: PathBuf,

    #[arg(long)]
    pub dataset_dir: PathBuf,

    /// Defaults to rewriting the questions file in place
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, short = 'c', default_value = "sqlgen.yaml", env = "SQLGEN_CONFIG")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_overrides_parse() {
        let cli = Cli::try_parse_from([
            "sqlgen",
            "--log-json",
            "run",
            "-c",
            "run.yaml",
            "--question-workers",
            "2",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.cmd {
            Command::Run(a) => {
                assert_eq!(a.config, PathBuf::from("run.yaml"));
                assert_eq!(a.question_workers, Some(2));
                assert_eq!(a.candidate_workers, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn schema_used_is_kebab_case() {
        let cli = Cli::try_parse_from([
            "sqlgen",
            "schema-used",
            "--questions",
            "q.json",
            "--dataset-dir",
            "dev_databases",
        ])
        .unwrap();
        assert!(matches!(cli.cmd, Command::SchemaUsed(_)));
    }
}
