//! SchemaStore: read-only SQLite introspection with a per-process cache.

use super::descriptions::{load_descriptions, DescriptionMap};
use super::{Schema, MAX_EXAMPLE_CHARS, MAX_EXAMPLE_VALUES};
use crate::config::paths::DatasetLayout;
use crate::errors::PipelineError;
use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// One foreign-key edge as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

pub struct SchemaStore {
    layout: DatasetLayout,
    examples_per_column: usize,
    cache: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaStore {
    pub fn new(layout: DatasetLayout) -> Self {
        Self {
            layout,
            examples_per_column: 3,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_examples_per_column(mut self, n: usize) -> Self {
        self.examples_per_column = n.min(MAX_EXAMPLE_VALUES);
        self
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn sqlite_path(&self, db_id: &str) -> PathBuf {
        self.layout.sqlite_path(db_id)
    }

    /// Loads (or returns the cached) schema with descriptions and example values.
    pub fn get_schema(&self, db_id: &str) -> Result<Arc<Schema>, PipelineError> {
        if let Some(schema) = self
            .cache
            .read()
            .map_err(|_| PipelineError::database(db_id, "schema cache poisoned"))?
            .get(db_id)
        {
            return Ok(schema.clone());
        }

        let schema = Arc::new(self.load(db_id)?);
        let mut cache = self
            .cache
            .write()
            .map_err(|_| PipelineError::database(db_id, "schema cache poisoned"))?;
        Ok(cache.entry(db_id.to_string()).or_insert(schema).clone())
    }

    pub fn get_primary_keys(
        &self,
        db_id: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, PipelineError> {
        let schema = self.get_schema(db_id)?;
        let mut out = BTreeMap::new();
        for (t, table) in schema.tables.iter().enumerate() {
            let pks: Vec<String> = schema
                .primary_key_columns(t)
                .into_iter()
                .map(str::to_string)
                .collect();
            if !pks.is_empty() {
                out.insert(table.name.clone(), pks);
            }
        }
        Ok(out)
    }

    /// Foreign keys declared on `table`, one direction per catalog row.
    pub fn get_foreign_keys(
        &self,
        db_id: &str,
        table: &str,
    ) -> Result<Vec<ForeignKeyRef>, PipelineError> {
        let schema = self.get_schema(db_id)?;
        let Some(t) = schema.table_index(table) else {
            return Ok(Vec::new());
        };
        Ok(schema
            .foreign_keys
            .iter()
            .filter(|fk| schema.columns[fk.from].table == t)
            .map(|fk| {
                let (from_table, from_column) = schema.qualified(fk.from);
                let (to_table, to_column) = schema.qualified(fk.to);
                ForeignKeyRef {
                    from_table: from_table.to_string(),
                    from_column: from_column.to_string(),
                    to_table: to_table.to_string(),
                    to_column: to_column.to_string(),
                }
            })
            .collect())
    }

    pub fn get_example_values(
        &self,
        db_id: &str,
        table: &str,
        column: &str,
        n: usize,
    ) -> Result<Vec<String>, PipelineError> {
        let conn = self.open(db_id)?;
        example_values(&conn, table, column, n.min(MAX_EXAMPLE_VALUES))
            .map_err(|e| PipelineError::database(db_id, e))
    }

    pub fn get_descriptions(&self, db_id: &str) -> Result<DescriptionMap, PipelineError> {
        let conn = self.open(db_id)?;
        let tables = table_names(&conn).map_err(|e| PipelineError::database(db_id, e))?;
        let refs: Vec<&str> = tables.iter().map(|(n, _)| n.as_str()).collect();
        Ok(load_descriptions(
            &self.layout.description_dir(db_id),
            db_id,
            &refs,
        ))
    }

    fn open(&self, db_id: &str) -> Result<Connection, PipelineError> {
        let path = self.layout.sqlite_path(db_id);
        if !path.is_file() {
            return Err(PipelineError::database(
                db_id,
                format!("database file not found: {}", path.display()),
            ));
        }
        open_read_only(&path).map_err(|e| PipelineError::database(db_id, e))
    }

    fn load(&self, db_id: &str) -> Result<Schema, PipelineError> {
        let conn = self.open(db_id)?;
        let db_err = |e: rusqlite::Error| PipelineError::database(db_id, e);

        let mut schema = Schema::new(db_id);
        let tables = table_names(&conn).map_err(db_err)?;
        for (name, ddl) in &tables {
            let t = schema.add_table(name.clone(), ddl.clone());
            for (col, ty, pk) in table_info(&conn, name).map_err(db_err)? {
                let c = schema.add_column(t, col, ty, pk);
                if self.examples_per_column > 0 {
                    let name = schema.columns[c].name.clone();
                    let table = &schema.tables[t].name;
                    let examples = example_values(&conn, table, &name, self.examples_per_column)
                        .map_err(db_err)?;
                    schema.columns[c].examples = examples;
                }
            }
        }

        for (name, _) in &tables {
            for (from_col, to_table, to_col) in foreign_key_list(&conn, name).map_err(db_err)? {
                match resolve_fk(&schema, name, &from_col, &to_table, to_col.as_deref()) {
                    Some((from, to)) => schema.add_foreign_key(from, to),
                    None => tracing::warn!(
                        db_id,
                        table = %name,
                        column = %from_col,
                        target = %to_table,
                        "dropping unresolvable foreign key"
                    ),
                }
            }
        }

        let names: Vec<&str> = tables.iter().map(|(n, _)| n.as_str()).collect();
        let descriptions = load_descriptions(&self.layout.description_dir(db_id), db_id, &names);
        for t in 0..schema.tables.len() {
            let tname = schema.tables[t].name.clone();
            schema.tables[t].description = descriptions.table(&tname).to_string();
            for c in schema.tables[t].columns.clone() {
                let desc = descriptions.column(&tname, &schema.columns[c].name).to_string();
                schema.columns[c].description = desc;
            }
        }

        tracing::debug!(
            db_id,
            tables = schema.tables.len(),
            columns = schema.columns.len(),
            foreign_keys = schema.foreign_keys.len(),
            "schema loaded"
        );
        Ok(schema)
    }
}

pub(crate) fn open_read_only(path: &std::path::Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<(String, Option<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    rows.collect()
}

fn table_info(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, String, bool)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            row.get::<_, i64>(5)? > 0,
        ))
    })?;
    rows.collect()
}

fn foreign_key_list(
    conn: &Connection,
    table: &str,
) -> rusqlite::Result<Vec<(String, String, Option<String>)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(3)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    rows.collect()
}

/// A NULL target column refers to the target table's primary key.
fn resolve_fk(
    schema: &Schema,
    from_table: &str,
    from_col: &str,
    to_table: &str,
    to_col: Option<&str>,
) -> Option<(usize, usize)> {
    let ft = schema.table_index(from_table)?;
    let from = schema.column_index(ft, from_col)?;
    let tt = schema.table_index(to_table)?;
    let to = match to_col {
        Some(c) => schema.column_index(tt, c)?,
        None => {
            let pk = *schema.primary_key_columns(tt).first()?;
            schema.column_index(tt, pk)?
        }
    };
    Some((from, to))
}

fn example_values(
    conn: &Connection,
    table: &str,
    column: &str,
    n: usize,
) -> rusqlite::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let col = quote_ident(column);
    let sql = format!(
        "SELECT DISTINCT {col} FROM {} WHERE {col} IS NOT NULL LIMIT {}",
        quote_ident(table),
        n * 2
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let text = match row.get_ref(0)? {
            rusqlite::types::ValueRef::Null => continue,
            rusqlite::types::ValueRef::Integer(i) => i.to_string(),
            rusqlite::types::ValueRef::Real(f) => f.to_string(),
            rusqlite::types::ValueRef::Text(t) => String::from_utf8_lossy(t).trim().to_string(),
            rusqlite::types::ValueRef::Blob(_) => continue,
        };
        if text.is_empty() {
            continue;
        }
        out.push(text.chars().take(MAX_EXAMPLE_CHARS).collect());
        if out.len() == n {
            break;
        }
    }
    Ok(out)
}
