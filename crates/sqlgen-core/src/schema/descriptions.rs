use std::collections::HashMap;
use std::path::Path;

/// Table and column descriptions loaded from the per-database CSV files.
/// Keys are lowercased; missing entries read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionMap {
    tables: HashMap<String, String>,
    columns: HashMap<(String, String), String>,
}

impl DescriptionMap {
    pub fn table(&self, table: &str) -> &str {
        self.tables
            .get(&table.to_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn column(&self, table: &str, column: &str) -> &str {
        self.columns
            .get(&(table.to_lowercase(), column.to_lowercase()))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_table(&mut self, table: &str, description: &str) {
        self.tables
            .insert(table.to_lowercase(), clean(description));
    }

    pub fn set_column(&mut self, table: &str, column: &str, description: &str) {
        self.columns
            .insert((table.to_lowercase(), column.to_lowercase()), clean(description));
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.columns.is_empty()
    }
}

fn clean(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Loads `<dir>/<db>_tables.csv` and one `<dir>/<table>.csv` per table.
/// Unreadable or missing files are logged and skipped.
pub fn load_descriptions(dir: &Path, db_id: &str, tables: &[&str]) -> DescriptionMap {
    let mut map = DescriptionMap::default();
    if !dir.is_dir() {
        tracing::warn!(db_id, dir = %dir.display(), "description directory missing");
        return map;
    }

    let tables_csv = dir.join(format!("{db_id}_tables.csv"));
    if tables_csv.is_file() {
        match read_rows(&tables_csv) {
            Ok(rows) => {
                for row in rows {
                    if let (Some(name), Some(desc)) =
                        (row.get("table_name"), row.get("table_description"))
                    {
                        map.set_table(name, desc);
                    }
                }
            }
            Err(e) => tracing::warn!(
                db_id,
                file = %tables_csv.display(),
                error = %e,
                "failed to read table descriptions"
            ),
        }
    }

    for table in tables {
        let Some(path) = column_csv_path(dir, table) else {
            tracing::debug!(db_id, table, "no column description file");
            continue;
        };
        let rows = match read_rows(&path) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    db_id,
                    file = %path.display(),
                    error = %e,
                    "failed to read column descriptions"
                );
                continue;
            }
        };
        for row in rows {
            let Some(column) = row
                .get("original_column_name")
                .or_else(|| row.get("column_name"))
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
            else {
                continue;
            };
            let plain = row.get("column_description").map(String::as_str).unwrap_or("");
            let improved = row
                .get("improved_column_description")
                .map(String::as_str)
                .unwrap_or("");
            let best = if improved.trim().len() > plain.trim().len() {
                improved
            } else {
                plain
            };
            map.set_column(table, column, best);
        }
    }
    map
}

fn column_csv_path(dir: &Path, table: &str) -> Option<std::path::PathBuf> {
    let exact = dir.join(format!("{table}.csv"));
    if exact.is_file() {
        return Some(exact);
    }
    let lower = dir.join(format!("{}.csv", table.to_lowercase()));
    lower.is_file().then_some(lower)
}

type CsvRow = HashMap<String, String>;

fn read_rows(path: &Path) -> anyhow::Result<Vec<CsvRow>> {
    // Description files in the wild are not always UTF-8.
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim_start_matches('\u{feff}');

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        out.push(row);
    }
    Ok(out)
}
