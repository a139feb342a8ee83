use super::Schema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Ordered subset of a schema: `table -> [columns]`.
///
/// Serialized as a JSON object whose key order is the table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunedSchema {
    tables: Vec<(String, Vec<String>)>,
}

impl PrunedSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tables.iter().map(|(t, c)| (t.as_str(), c.as_slice()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|(t, _)| t.as_str()).collect()
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(table))
            .map(|(_, c)| c.as_slice())
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.columns(table).is_some()
    }

    pub fn contains_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .is_some_and(|cols| cols.iter().any(|c| c.eq_ignore_ascii_case(column)))
    }

    /// Adds a table (merging columns if it is already present, case-insensitively).
    pub fn push_table(&mut self, table: &str, columns: Vec<String>) {
        let slot = match self
            .tables
            .iter()
            .position(|(t, _)| t.eq_ignore_ascii_case(table))
        {
            Some(i) => i,
            None => {
                self.tables.push((table.to_string(), Vec::new()));
                self.tables.len() - 1
            }
        };
        for col in columns {
            self.push_column_at(slot, col);
        }
    }

    pub fn push_column(&mut self, table: &str, column: &str) {
        self.push_table(table, vec![column.to_string()]);
    }

    fn push_column_at(&mut self, slot: usize, column: String) {
        let cols = &mut self.tables[slot].1;
        if !cols.iter().any(|c| c.eq_ignore_ascii_case(&column)) {
            cols.push(column);
        }
    }

    /// Union preserving the order of `self`, then new entries of `other`.
    pub fn union(&self, other: &PrunedSchema) -> PrunedSchema {
        let mut out = self.clone();
        for (t, cols) in other.iter() {
            out.push_table(t, cols.to_vec());
        }
        out
    }

    /// Maps names onto the schema's canonical casing and drops anything the
    /// schema does not contain. The order of `self` is kept.
    pub fn canonicalize(&self, schema: &Schema) -> PrunedSchema {
        let mut out = PrunedSchema::default();
        for (table, requested) in &self.tables {
            let Some(t) = schema.table_index(table) else {
                continue;
            };
            let cols: Vec<String> = requested
                .iter()
                .filter_map(|r| schema.column_index(t, r))
                .map(|c| schema.columns[c].name.clone())
                .collect();
            out.push_table(&schema.tables[t].name, cols);
        }
        out
    }

    /// `table: col, col` per line; used where no schema is at hand.
    pub fn render_compact(&self) -> String {
        self.tables
            .iter()
            .map(|(t, cols)| format!("{}: {}", t, cols.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Serialize for PrunedSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tables.len()))?;
        for (t, cols) in &self.tables {
            map.serialize_entry(t, cols)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PrunedSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PrunedVisitor;

        impl<'de> Visitor<'de> for PrunedVisitor {
            type Value = PrunedSchema;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping table names to column lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = PrunedSchema::default();
                while let Some((table, cols)) = access.next_entry::<String, Vec<String>>()? {
                    out.push_table(&table, cols);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(PrunedVisitor)
    }
}

impl FromIterator<(String, Vec<String>)> for PrunedSchema {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let mut out = PrunedSchema::default();
        for (t, cols) in iter {
            out.push_table(&t, cols);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_support::library_schema;

    fn pruned(pairs: &[(&str, &[&str])]) -> PrunedSchema {
        pairs
            .iter()
            .map(|(t, cols)| (t.to_string(), cols.iter().map(|c| c.to_string()).collect()))
            .collect()
    }

    #[test]
    fn canonicalize_fixes_case_and_drops_unknowns() {
        let schema = library_schema();
        let raw = pruned(&[("BOOK", &["TITLE", "nope"]), ("ghost", &["x"]), ("Author", &["NAME"])]);
        let canon = raw.canonicalize(&schema);
        assert_eq!(canon, pruned(&[("book", &["title"]), ("author", &["name"])]));
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let schema = library_schema();
        let raw = pruned(&[("book", &["author_id", "Title"])]);
        let once = raw.canonicalize(&schema);
        assert_eq!(once.canonicalize(&schema), once);
    }

    #[test]
    fn json_keeps_table_order() {
        let p = pruned(&[("zeta", &["a"]), ("alpha", &["b", "c"])]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"zeta":["a"],"alpha":["b","c"]}"#);
        let back: PrunedSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn union_merges_columns_without_duplicates() {
        let a = pruned(&[("t", &["x", "y"])]);
        let b = pruned(&[("T", &["Y", "z"]), ("u", &["k"])]);
        assert_eq!(a.union(&b), pruned(&[("t", &["x", "y", "z"]), ("u", &["k"])]));
    }
}
