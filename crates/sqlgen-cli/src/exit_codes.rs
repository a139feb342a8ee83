//! Process exit codes of the `sqlgen` binary.

use sqlgen_core::errors::{PipelineError, RunError, RunErrorKind};

pub const EXIT_SUCCESS: i32 = 0;
/// The run finished but some questions have no prediction, or it was interrupted.
pub const EXIT_RUN_FAILED: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Configuration problems map to [`EXIT_CONFIG_ERROR`], everything else to
/// [`EXIT_RUN_FAILED`].
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(RunError {
        kind: RunErrorKind::MissingConfig | RunErrorKind::ConfigParse,
        ..
    }) = err.downcast_ref::<RunError>()
    {
        return EXIT_CONFIG_ERROR;
    }
    match err.downcast_ref::<PipelineError>() {
        Some(
            PipelineError::Config(_)
            | PipelineError::UnsupportedFormat(_)
            | PipelineError::UnknownPromptStyle(_)
            | PipelineError::MissingExamples { .. },
        ) => EXIT_CONFIG_ERROR,
        _ => EXIT_RUN_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_two() {
        let e = anyhow::Error::new(PipelineError::Config("bad".into()));
        assert_eq!(for_error(&e), EXIT_CONFIG_ERROR);
        let e = anyhow::Error::new(PipelineError::database("shop", "missing"));
        assert_eq!(for_error(&e), EXIT_RUN_FAILED);
        assert_eq!(for_error(&anyhow::anyhow!("io")), EXIT_RUN_FAILED);
        let e = anyhow::Error::new(RunError::missing_config("run.yaml", "not found"));
        assert_eq!(for_error(&e), EXIT_CONFIG_ERROR);
    }
}
