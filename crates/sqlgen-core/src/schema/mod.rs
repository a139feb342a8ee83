//! Database schema model.
//!
//! Tables, columns and foreign keys live in flat arenas and refer to each other
//! by index. A loaded [`Schema`] is never mutated; it is shared as `Arc<Schema>`.

pub mod ddl;
pub mod descriptions;
pub mod format;
pub mod pruned;
pub mod store;

pub use format::{format_schema, SchemaFormat};
pub use pruned::PrunedSchema;
pub use store::SchemaStore;

pub type TableIdx = usize;
pub type ColumnIdx = usize;

/// Upper bound on example values kept per column.
pub const MAX_EXAMPLE_VALUES: usize = 5;
/// Example values are cut to this many characters.
pub const MAX_EXAMPLE_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub description: String,
    pub ddl: Option<String>,
    pub columns: Vec<ColumnIdx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub table: TableIdx,
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub examples: Vec<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub from: ColumnIdx,
    pub to: ColumnIdx,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub db_id: String,
    pub tables: Vec<TableInfo>,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    pub fn new(db_id: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            ..Default::default()
        }
    }

    pub fn add_table(&mut self, name: impl Into<String>, ddl: Option<String>) -> TableIdx {
        self.tables.push(TableInfo {
            name: name.into(),
            description: String::new(),
            ddl,
            columns: Vec::new(),
        });
        self.tables.len() - 1
    }

    pub fn add_column(
        &mut self,
        table: TableIdx,
        name: impl Into<String>,
        data_type: impl Into<String>,
        primary_key: bool,
    ) -> ColumnIdx {
        self.columns.push(ColumnInfo {
            table,
            name: name.into(),
            data_type: data_type.into(),
            description: String::new(),
            examples: Vec::new(),
            primary_key,
        });
        let idx = self.columns.len() - 1;
        self.tables[table].columns.push(idx);
        idx
    }

    pub fn add_foreign_key(&mut self, from: ColumnIdx, to: ColumnIdx) {
        let fk = ForeignKey { from, to };
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }

    /// Case-insensitive table lookup.
    pub fn table_index(&self, name: &str) -> Option<TableIdx> {
        self.tables
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive column lookup within a table.
    pub fn column_index(&self, table: TableIdx, name: &str) -> Option<ColumnIdx> {
        self.tables[table]
            .columns
            .iter()
            .copied()
            .find(|&c| self.columns[c].name.eq_ignore_ascii_case(name))
    }

    pub fn table_columns(&self, table: TableIdx) -> impl Iterator<Item = &ColumnInfo> + '_ {
        self.tables[table].columns.iter().map(|&c| &self.columns[c])
    }

    pub fn primary_key_columns(&self, table: TableIdx) -> Vec<&str> {
        self.table_columns(table)
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn qualified(&self, column: ColumnIdx) -> (&str, &str) {
        let col = &self.columns[column];
        (self.tables[col.table].name.as_str(), col.name.as_str())
    }

    /// Every table with every column, in schema order.
    pub fn full_selection(&self) -> PrunedSchema {
        let mut pruned = PrunedSchema::default();
        for (t, table) in self.tables.iter().enumerate() {
            let cols = self.table_columns(t).map(|c| c.name.clone()).collect();
            pruned.push_table(&table.name, cols);
        }
        pruned
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Two tables joined by a foreign key: `author(id, name)` and
    /// `book(id, title, author_id -> author.id)`.
    pub fn library_schema() -> Schema {
        let mut s = Schema::new("library");
        let author = s.add_table(
            "author",
            Some("CREATE TABLE author (\n  id INTEGER PRIMARY KEY,\n  name TEXT\n)".to_string()),
        );
        let author_id = s.add_column(author, "id", "INTEGER", true);
        let name = s.add_column(author, "name", "TEXT", false);
        s.columns[name].examples = vec!["Ursula".into(), "Italo".into()];
        s.columns[name].description = "full name of the author".into();

        let book = s.add_table(
            "book",
            Some(
                "CREATE TABLE book (\n  id INTEGER PRIMARY KEY,\n  title TEXT NOT NULL,\n  \
                 author_id INTEGER,\n  FOREIGN KEY (author_id) REFERENCES author(id)\n)"
                    .to_string(),
            ),
        );
        s.add_column(book, "id", "INTEGER", true);
        s.add_column(book, "title", "TEXT", false);
        let fk = s.add_column(book, "author_id", "INTEGER", false);
        s.tables[book].description = "books in the catalogue".into();
        s.add_foreign_key(fk, author_id);
        s
    }
}
