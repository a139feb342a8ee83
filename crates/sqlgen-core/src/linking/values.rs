//! Keyword → (table, column) lookup through similar stored values.

use super::lsh::{jaccard, ngrams, MinHashLsh, MinHasher};
use crate::config::LshConfig;
use crate::schema::store::{open_read_only, quote_ident};
use crate::schema::PrunedSchema;
use crate::storage::files::write_atomic_sync;
use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// `table → column → distinct values`.
pub type UniqueValues = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[async_trait]
pub trait ValueMatcher: Send + Sync {
    /// Columns holding values similar to any keyword, at most `k` value hits
    /// per keyword.
    async fn lookup(&self, db_id: &str, keywords: &[String], k: usize) -> PrunedSchema;
}

const SKIPPED_NAME_PARTS: [&str; 9] = [
    "_id", " id", "url", "email", "web", "time", "phone", "date", "address",
];

/// Identifier-like and free-form columns never help value matching.
pub fn skip_column_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    SKIPPED_NAME_PARTS.iter().any(|p| lower.contains(p)) || name.ends_with("Id")
}

fn text_affinity(declared: &str) -> bool {
    let t = declared.to_ascii_uppercase();
    t.is_empty() || t.contains("TEXT") || t.contains("CHAR") || t.contains("CLOB")
}

/// Whether a column's distinct-value statistics keep it in the index.
pub fn retain_column(name: &str, total_bytes: u64, distinct: u64, cfg: &LshConfig) -> bool {
    if distinct == 0 {
        return false;
    }
    let avg = total_bytes as f64 / distinct as f64;
    (name.to_lowercase().contains("name") && total_bytes < cfg.max_total_bytes_named)
        || (total_bytes < cfg.max_total_bytes && avg < cfg.max_avg_len)
        || distinct < cfg.min_distinct_always
}

/// Distinct non-null values of every retained text column.
pub fn collect_unique_values(conn: &Connection, cfg: &LshConfig) -> rusqlite::Result<UniqueValues> {
    let mut tables = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        for name in stmt.query_map([], |r| r.get::<_, String>(0))? {
            tables.push(name?);
        }
    }

    let mut out = UniqueValues::new();
    for table in &tables {
        let mut columns = Vec::new();
        {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    r.get::<_, i64>(5)? > 0,
                ))
            })?;
            for row in rows {
                let (name, ty, pk) = row?;
                if !pk && text_affinity(&ty) && !skip_column_name(&name) {
                    columns.push(name);
                }
            }
        }

        let mut table_values = BTreeMap::new();
        for column in columns {
            let (q_col, q_table) = (quote_ident(&column), quote_ident(table));
            let stats = conn.query_row(
                &format!(
                    "SELECT SUM(LENGTH(v)), COUNT(v) FROM \
                     (SELECT DISTINCT {q_col} AS v FROM {q_table} WHERE {q_col} IS NOT NULL)"
                ),
                [],
                |r| Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, i64>(1)?)),
            );
            let (total, distinct) = match stats {
                Ok((Some(total), distinct)) => (total.max(0) as u64, distinct.max(0) as u64),
                Ok((None, _)) => continue,
                Err(e) => {
                    tracing::warn!(
                        table = %table,
                        column = %column,
                        error = %e,
                        "value statistics failed"
                    );
                    continue;
                }
            };
            if !retain_column(&column, total, distinct, cfg) {
                continue;
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT CAST({q_col} AS TEXT) FROM {q_table} WHERE {q_col} IS NOT NULL"
            ))?;
            let values = stmt
                .query_map([], |r| r.get::<_, Option<String>>(0))?
                .filter_map(|v| v.ok().flatten())
                .collect();
            table_values.insert(column, values);
        }
        out.insert(table.clone(), table_values);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinHashEntry {
    pub signature: Vec<u64>,
    pub table: String,
    pub column: String,
    pub value: String,
}

pub type MinHashes = BTreeMap<String, MinHashEntry>;

/// Artifact paths under `<preprocessed_dir>/<db>/`.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub unique_values: PathBuf,
    pub lsh: PathBuf,
    pub minhashes: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, db_id: &str) -> Self {
        Self {
            unique_values: dir.join(format!("{db_id}_unique_values.json")),
            lsh: dir.join(format!("{db_id}_lsh.json")),
            minhashes: dir.join(format!("{db_id}_minhashes.json")),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    write_atomic_sync(path, serde_json::to_string(value)?.as_bytes())?;
    Ok(())
}

fn built_with(lsh: &MinHashLsh, cfg: &LshConfig) -> bool {
    lsh.num_perm == cfg.num_perm && lsh.threshold == cfg.threshold && lsh.ngram == cfg.ngram
}

/// One database's value index.
#[derive(Debug, Clone)]
pub struct ValueIndex {
    hasher: MinHasher,
    lsh: MinHashLsh,
    minhashes: MinHashes,
}

impl ValueIndex {
    pub fn build(values: &UniqueValues, cfg: &LshConfig) -> Self {
        let hasher = MinHasher::new(cfg.num_perm, cfg.ngram);
        let mut lsh = MinHashLsh::new(cfg.threshold, cfg.num_perm, cfg.ngram);
        let mut minhashes = MinHashes::new();
        for (table, columns) in values {
            for (column, column_values) in columns {
                for (idx, value) in column_values.iter().enumerate() {
                    let key = format!("{table}_{column}_{idx}");
                    let signature = hasher.signature(value);
                    lsh.insert(&key, &signature);
                    minhashes.insert(
                        key,
                        MinHashEntry {
                            signature,
                            table: table.clone(),
                            column: column.clone(),
                            value: value.clone(),
                        },
                    );
                }
            }
        }
        Self {
            hasher,
            lsh,
            minhashes,
        }
    }

    pub fn len(&self) -> usize {
        self.minhashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minhashes.is_empty()
    }

    /// Loads the three artifacts, regenerating whatever is missing or
    /// unreadable from the database at `sqlite_path`.
    pub fn load_or_build(
        dir: &Path,
        db_id: &str,
        sqlite_path: &Path,
        cfg: &LshConfig,
    ) -> anyhow::Result<Self> {
        let paths = ArtifactPaths::new(dir, db_id);
        if paths.lsh.exists() && paths.minhashes.exists() {
            match (
                read_json::<MinHashLsh>(&paths.lsh),
                read_json::<MinHashes>(&paths.minhashes),
            ) {
                (Ok(lsh), Ok(minhashes)) if built_with(&lsh, cfg) => {
                    tracing::debug!(db_id, values = minhashes.len(), "value index loaded");
                    return Ok(Self {
                        hasher: MinHasher::new(cfg.num_perm, cfg.ngram),
                        lsh,
                        minhashes,
                    });
                }
                _ => tracing::warn!(db_id, "value index artifacts unusable, rebuilding"),
            }
        }

        let values = match read_json::<UniqueValues>(&paths.unique_values) {
            Ok(v) => v,
            Err(_) => {
                let conn = open_read_only(sqlite_path)?;
                let v = collect_unique_values(&conn, cfg)?;
                write_json(&paths.unique_values, &v)?;
                v
            }
        };
        let index = Self::build(&values, cfg);
        write_json(&paths.lsh, &index.lsh)?;
        write_json(&paths.minhashes, &index.minhashes)?;
        tracing::info!(db_id, values = index.len(), bands = index.lsh.bands, "value index built");
        Ok(index)
    }

    /// LSH candidates for `keyword`, ranked by exact n-gram Jaccard; the
    /// columns of the best `top_n` values in rank order.
    pub fn query(&self, keyword: &str, top_n: usize) -> PrunedSchema {
        let grams = ngrams(keyword, self.hasher.ngram());
        let mut scored: Vec<(&MinHashEntry, f64)> = self
            .lsh
            .query(&self.hasher.signature(keyword))
            .iter()
            .filter_map(|k| self.minhashes.get(k))
            .map(|e| (e, jaccard(&grams, &ngrams(&e.value, self.hasher.ngram()))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut out = PrunedSchema::new();
        for (entry, _) in scored.into_iter().take(top_n) {
            out.push_column(&entry.table, &entry.column);
        }
        out
    }
}

/// [`ValueMatcher`] over per-database indexes under `preprocessed_dir`,
/// loaded on first use. A database whose index cannot be built yields no
/// matches.
pub struct LshValueMatcher {
    preprocessed_dir: PathBuf,
    sqlite_path: Box<dyn Fn(&str) -> PathBuf + Send + Sync>,
    cfg: LshConfig,
    indexes: Mutex<HashMap<String, Option<Arc<ValueIndex>>>>,
}

impl LshValueMatcher {
    pub fn new(
        preprocessed_dir: PathBuf,
        sqlite_path: impl Fn(&str) -> PathBuf + Send + Sync + 'static,
        cfg: LshConfig,
    ) -> Self {
        Self {
            preprocessed_dir,
            sqlite_path: Box::new(sqlite_path),
            cfg,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn index(&self, db_id: &str) -> Option<Arc<ValueIndex>> {
        let mut map = self.indexes.lock().await;
        if let Some(entry) = map.get(db_id) {
            return entry.clone();
        }
        let dir = self.preprocessed_dir.join(db_id);
        let sqlite = (self.sqlite_path)(db_id);
        let cfg = self.cfg.clone();
        let db = db_id.to_string();
        let built =
            tokio::task::spawn_blocking(move || ValueIndex::load_or_build(&dir, &db, &sqlite, &cfg))
                .await;
        let entry = match built {
            Ok(Ok(index)) => Some(Arc::new(index)),
            Ok(Err(e)) => {
                tracing::error!(db_id, error = %e, "value index unavailable");
                None
            }
            Err(e) => {
                tracing::error!(db_id, error = %e, "value index task failed");
                None
            }
        };
        map.insert(db_id.to_string(), entry.clone());
        entry
    }
}

#[async_trait]
impl ValueMatcher for LshValueMatcher {
    async fn lookup(&self, db_id: &str, keywords: &[String], k: usize) -> PrunedSchema {
        let Some(index) = self.index(db_id).await else {
            return PrunedSchema::new();
        };
        keywords
            .iter()
            .fold(PrunedSchema::new(), |acc, kw| acc.union(&index.query(kw, k)))
    }
}
