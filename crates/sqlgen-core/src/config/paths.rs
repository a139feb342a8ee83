use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk layout of a benchmark dataset:
/// `<dataset_dir>/<db>/<db>.sqlite` and `<dataset_dir>/<db>/database_description/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLayout {
    pub dataset_dir: PathBuf,
    /// Overrides the per-database description directory root
    /// (`<description_dir>/<db>/` instead of `<dataset_dir>/<db>/database_description/`).
    #[serde(default)]
    pub description_dir: Option<PathBuf>,
}

impl DatasetLayout {
    pub fn new(dataset_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            description_dir: None,
        }
    }

    pub fn sqlite_path(&self, db_id: &str) -> PathBuf {
        self.dataset_dir.join(db_id).join(format!("{db_id}.sqlite"))
    }

    pub fn description_dir(&self, db_id: &str) -> PathBuf {
        match &self.description_dir {
            Some(root) => root.join(db_id),
            None => self.dataset_dir.join(db_id).join("database_description"),
        }
    }
}

/// Where the run writes and caches things.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    pub preprocessed_dir: PathBuf,
    pub index_dir: PathBuf,
    #[serde(default)]
    pub cache_db: Option<PathBuf>,
}

impl OutputLayout {
    pub fn under(root: &Path) -> Self {
        Self {
            output_dir: root.join("output"),
            preprocessed_dir: root.join("preprocessed"),
            index_dir: root.join("index"),
            cache_db: None,
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join("checkpoint.txt")
    }

    pub fn selections_path(&self) -> PathBuf {
        self.output_dir.join("selections.json")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.output_dir.join("errors.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join("run_metadata.json")
    }

    pub fn db_predictions_path(&self, db_id: &str) -> PathBuf {
        self.output_dir
            .join("predictions")
            .join(db_id)
            .join(format!("predict_{db_id}.json"))
    }

    pub fn global_predictions_path(&self) -> PathBuf {
        self.output_dir.join("predict_dev.json")
    }

    pub fn gold_path(&self) -> PathBuf {
        self.output_dir.join("dev_gold.sql")
    }

    pub fn questions_out_path(&self) -> PathBuf {
        self.output_dir.join("questions_with_runtime_schema.json")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.output_dir.join("selection_stats")
    }

    pub fn lsh_dir(&self, db_id: &str) -> PathBuf {
        self.preprocessed_dir.join(db_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_paths_follow_benchmark_layout() {
        let layout = DatasetLayout::new("/data/dev_databases");
        assert_eq!(
            layout.sqlite_path("shop"),
            PathBuf::from("/data/dev_databases/shop/shop.sqlite")
        );
        assert_eq!(
            layout.description_dir("shop"),
            PathBuf::from("/data/dev_databases/shop/database_description")
        );
    }

    #[test]
    fn output_paths_are_per_database() {
        let out = OutputLayout::under(Path::new("/tmp/run"));
        assert_eq!(
            out.db_predictions_path("shop"),
            PathBuf::from("/tmp/run/output/predictions/shop/predict_shop.json")
        );
        assert_eq!(out.lsh_dir("shop"), PathBuf::from("/tmp/run/preprocessed/shop"));
    }
}
