//! Output files are replaced atomically: write a sibling temp file, then
//! rename it over the target.

use crate::errors::PipelineError;
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub async fn write_atomic(path: &Path, content: &str) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::persistence(parent, e))?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| PipelineError::persistence(&tmp, format!("failed to write temp file: {e}")))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PipelineError::persistence(path, format!("failed to rename temp file: {e}")))?;
    Ok(())
}

pub fn write_atomic_sync(path: &Path, content: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::persistence(parent, e))?;
    }
    let tmp = temp_path(path);
    std::fs::write(&tmp, content)
        .map_err(|e| PipelineError::persistence(&tmp, format!("failed to write temp file: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| PipelineError::persistence(path, format!("failed to rename temp file: {e}")))?;
    Ok(())
}

pub async fn append_line(path: &Path, line: &str) -> Result<(), PipelineError> {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::persistence(parent, e))?;
    }
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| PipelineError::persistence(path, e))?;
    f.write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|e| PipelineError::persistence(path, e))?;
    f.flush().await.map_err(|e| PipelineError::persistence(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_replaces_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b.json");
        write_atomic(&path, "{}").await.unwrap();
        write_atomic(&path, "{\"1\": 2}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"1\": 2}");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn append_keeps_previous_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.txt");
        append_line(&path, "1").await.unwrap();
        append_line(&path, "2").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n");
    }
}
