//! Read-only SQL execution with a wall-clock cap.

use crate::config::paths::DatasetLayout;
use crate::schema::store::open_read_only;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Per-value cap applied to text and blob cells.
pub const MAX_VALUE_BYTES: usize = 50_000;
/// Cap for the textual rendering handed to prompts.
pub const MAX_RENDER_BYTES: usize = 50_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum ValueKey<'a> {
    Null,
    Int(i64),
    Real(u64),
    Text(&'a str),
    Blob(&'a [u8]),
}

impl SqlValue {
    fn from_ref(value: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => {
                let cut = &t[..t.len().min(MAX_VALUE_BYTES)];
                SqlValue::Text(String::from_utf8_lossy(cut).into_owned())
            }
            ValueRef::Blob(b) => SqlValue::Blob(b[..b.len().min(MAX_VALUE_BYTES)].to_vec()),
        }
    }

    /// Integral reals compare equal to integers, and -0.0 equals 0.0.
    fn key(&self) -> ValueKey<'_> {
        match self {
            SqlValue::Null => ValueKey::Null,
            SqlValue::Integer(i) => ValueKey::Int(*i),
            SqlValue::Real(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    ValueKey::Int(*f as i64)
                } else if f.is_nan() {
                    ValueKey::Real(f64::NAN.to_bits())
                } else {
                    ValueKey::Real(f.to_bits())
                }
            }
            SqlValue::Text(s) => ValueKey::Text(s.as_str()),
            SqlValue::Blob(b) => ValueKey::Blob(b.as_slice()),
        }
    }

    fn repr(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SqlValue {}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("None"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r:?}"),
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
        }
    }
}

pub type Row = Vec<SqlValue>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Rows(ResultSet),
    Error(String),
    Timeout,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionResult::Rows(_))
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            ExecutionResult::Rows(rs) => Some(&rs.rows),
            _ => None,
        }
    }

    /// Python-style list of tuples, cut to `max_bytes`.
    pub fn render(&self, max_bytes: usize) -> String {
        let full = match self {
            ExecutionResult::Rows(rs) => render_rows(&rs.rows),
            ExecutionResult::Error(msg) => msg.clone(),
            ExecutionResult::Timeout => "Query timed out".to_string(),
        };
        truncate_bytes(&full, max_bytes)
    }

    /// Rendering of the first `n` rows, for refinement prompts.
    pub fn render_sample(&self, n: usize) -> String {
        match self {
            ExecutionResult::Rows(rs) => {
                truncate_bytes(&render_rows(&rs.rows[..rs.rows.len().min(n)]), MAX_RENDER_BYTES)
            }
            other => other.render(MAX_RENDER_BYTES),
        }
    }

    /// Markdown table of the first `max_rows` rows (cells cut to `max_cell_chars`),
    /// or the error text.
    pub fn markdown_preview(&self, max_rows: usize, max_cell_chars: usize) -> String {
        let rs = match self {
            ExecutionResult::Rows(rs) => rs,
            other => return other.render(MAX_RENDER_BYTES),
        };
        let cell = |s: String| -> String {
            let s = s.replace('|', "\\|").replace('\n', " ");
            if s.chars().count() > max_cell_chars {
                let mut cut: String = s.chars().take(max_cell_chars).collect();
                cut.push_str("...");
                cut
            } else {
                s
            }
        };
        let mut out = String::new();
        let header: Vec<String> = rs.columns.iter().map(|c| cell(c.clone())).collect();
        out.push_str(&format!("| {} |\n", header.join(" | ")));
        out.push_str(&format!("| {} |\n", vec!["---"; header.len().max(1)].join(" | ")));
        for row in rs.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(|v| cell(v.to_string())).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        if rs.rows.is_empty() {
            out.push_str("(0 rows)\n");
        } else if rs.rows.len() > max_rows {
            out.push_str(&format!("({} rows total)\n", rs.rows.len()));
        }
        out
    }

    /// Order-insensitive digest used to group candidates with identical results.
    pub fn result_hash(&self) -> String {
        let canonical = match self {
            ExecutionResult::Rows(rs) => {
                let mut rows: Vec<String> = rs
                    .rows
                    .iter()
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .map(|r| {
                        r.iter()
                            .map(|v| format!("{:?}", v.key()))
                            .collect::<Vec<_>>()
                            .join("\u{1f}")
                    })
                    .collect();
                rows.sort();
                format!("rows:{}", rows.join("\n"))
            }
            ExecutionResult::Error(msg) => format!("error:{msg}"),
            ExecutionResult::Timeout => "timeout".to_string(),
        };
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }
}

fn render_row(row: &Row) -> String {
    let cells: Vec<String> = row.iter().map(SqlValue::repr).collect();
    if cells.len() == 1 {
        format!("({},)", cells[0])
    } else {
        format!("({})", cells.join(", "))
    }
}

fn render_rows(rows: &[Row]) -> String {
    let parts: Vec<String> = rows.iter().map(render_row).collect();
    format!("[{}]", parts.join(", "))
}

pub fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Multiset-insensitive comparison: both results contain the same distinct rows.
pub fn set_equal(a: &[Row], b: &[Row]) -> bool {
    let left: HashSet<&Row> = a.iter().collect();
    let right: HashSet<&Row> = b.iter().collect();
    left == right
}

#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn execute(&self, db_id: &str, sql: &str, timeout: Duration) -> ExecutionResult;
}

/// Executes against `<dataset_dir>/<db>/<db>.sqlite` on a fresh read-only
/// connection per call.
pub struct SqliteRunner {
    layout: DatasetLayout,
}

impl SqliteRunner {
    pub fn new(layout: DatasetLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl SqlRunner for SqliteRunner {
    async fn execute(&self, db_id: &str, sql: &str, timeout: Duration) -> ExecutionResult {
        let path = self.layout.sqlite_path(db_id);
        if !path.is_file() {
            return ExecutionResult::Error(format!("database file not found: {}", path.display()));
        }
        let conn = match open_read_only(&path) {
            Ok(conn) => conn,
            Err(e) => return ExecutionResult::Error(e.to_string()),
        };
        let interrupt = conn.get_interrupt_handle();
        let sql = sql.to_string();

        let task = tokio::task::spawn_blocking(move || run_query(&conn, &sql));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(rs))) => ExecutionResult::Rows(rs),
            Ok(Ok(Err(e))) => ExecutionResult::Error(e.to_string()),
            Ok(Err(join)) => ExecutionResult::Error(format!("execution task failed: {join}")),
            Err(_) => {
                // The blocking task observes the interrupt and releases the connection.
                interrupt.interrupt();
                let timeout_ms = timeout.as_millis() as u64;
                tracing::debug!(db_id, timeout_ms, "query interrupted");
                ExecutionResult::Timeout
            }
        }
    }
}

fn run_query(conn: &rusqlite::Connection, sql: &str) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(SqlValue::from_ref(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(ResultSet { columns, rows: out })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with_db() -> (tempfile::TempDir, SqliteRunner) {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("shop");
        std::fs::create_dir_all(&db_dir).unwrap();
        let conn = rusqlite::Connection::open(db_dir.join("shop.sqlite")).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER, name TEXT, price REAL);
             INSERT INTO t VALUES (1, 'a', 1.0), (2, 'b', 2.5), (3, 'c', NULL);",
        )
        .unwrap();
        let runner = SqliteRunner::new(DatasetLayout::new(dir.path()));
        (dir, runner)
    }

    #[tokio::test]
    async fn returns_rows_and_columns() {
        let (_dir, runner) = runner_with_db();
        let res = runner
            .execute("shop", "SELECT id, name FROM t ORDER BY id", DEFAULT_TIMEOUT)
            .await;
        let ExecutionResult::Rows(rs) = res else {
            panic!("expected rows, got {res:?}");
        };
        assert_eq!(rs.columns, vec!["id", "name"]);
        assert_eq!(rs.rows.len(), 3);
        assert_eq!(rs.rows[0], vec![SqlValue::Integer(1), SqlValue::Text("a".into())]);
    }

    #[tokio::test]
    async fn errors_are_values_not_panics() {
        let (_dir, runner) = runner_with_db();
        let res = runner.execute("shop", "SELECT nope FROM t", DEFAULT_TIMEOUT).await;
        match res {
            ExecutionResult::Error(msg) => assert!(msg.contains("nope")),
            other => panic!("expected error, got {other:?}"),
        }
        let missing = runner.execute("other", "SELECT 1", DEFAULT_TIMEOUT).await;
        assert!(matches!(missing, ExecutionResult::Error(_)));
    }

    #[tokio::test]
    async fn connection_is_read_only() {
        let (_dir, runner) = runner_with_db();
        let res = runner.execute("shop", "DELETE FROM t", DEFAULT_TIMEOUT).await;
        assert!(matches!(res, ExecutionResult::Error(_)));
        let count = runner.execute("shop", "SELECT count(*) FROM t", DEFAULT_TIMEOUT).await;
        assert_eq!(count.rows().unwrap()[0][0], SqlValue::Integer(3));
    }

    #[tokio::test]
    async fn runaway_query_times_out() {
        let (_dir, runner) = runner_with_db();
        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                   SELECT count(*) FROM c";
        let started = std::time::Instant::now();
        let res = runner.execute("shop", sql, Duration::from_millis(300)).await;
        assert_eq!(res, ExecutionResult::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn set_equality_ignores_order_duplicates_and_numeric_kind() {
        let a = vec![
            vec![SqlValue::Integer(1)],
            vec![SqlValue::Integer(2)],
            vec![SqlValue::Integer(2)],
        ];
        let b = vec![vec![SqlValue::Real(2.0)], vec![SqlValue::Integer(1)]];
        assert!(set_equal(&a, &b));
        let c = vec![vec![SqlValue::Integer(1)]];
        assert!(!set_equal(&a, &c));
        assert!(set_equal(&[], &[]));
    }

    #[test]
    fn rendering_is_truncated_on_char_boundaries() {
        let rs = ResultSet {
            columns: vec!["x".into()],
            rows: vec![vec![SqlValue::Text("é".repeat(40_000))]],
        };
        let res = ExecutionResult::Rows(rs);
        let out = res.render(MAX_RENDER_BYTES);
        assert!(out.len() <= MAX_RENDER_BYTES);
        assert!(out.starts_with("[('é"));
    }

    #[test]
    fn markdown_preview_is_deterministic() {
        let rows = (0..15).map(|i| vec![SqlValue::Integer(i)]).collect();
        let res = ExecutionResult::Rows(ResultSet { columns: vec!["n".into()], rows });
        let preview = res.markdown_preview(10, 100);
        assert!(preview.starts_with("| n |\n| --- |\n| 0 |\n"));
        assert!(preview.contains("| 9 |"));
        assert!(!preview.contains("| 10 |"));
        assert!(preview.ends_with("(15 rows total)\n"));
        assert_eq!(preview, res.markdown_preview(10, 100));
    }

    #[test]
    fn result_hash_groups_equal_sets() {
        let a = ExecutionResult::Rows(ResultSet {
            columns: vec!["x".into()],
            rows: vec![vec![SqlValue::Integer(1)], vec![SqlValue::Integer(2)]],
        });
        let b = ExecutionResult::Rows(ResultSet {
            columns: vec!["y".into()],
            rows: vec![vec![SqlValue::Integer(2)], vec![SqlValue::Integer(1)]],
        });
        assert_eq!(a.result_hash(), b.result_hash());
        assert_ne!(a.result_hash(), ExecutionResult::Timeout.result_hash());
    }
}
