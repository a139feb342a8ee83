//! Text renderings of a (possibly pruned) schema for prompts.

use super::ddl::prune_create_table;
use super::{PrunedSchema, Schema};
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaFormat {
    Basic,
    Text,
    Code,
    Openai,
    Semantic,
    MSchema,
}

impl SchemaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaFormat::Basic => "basic",
            SchemaFormat::Text => "text",
            SchemaFormat::Code => "code",
            SchemaFormat::Openai => "openai",
            SchemaFormat::Semantic => "semantic",
            SchemaFormat::MSchema => "m_schema",
        }
    }
}

impl fmt::Display for SchemaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(SchemaFormat::Basic),
            "text" => Ok(SchemaFormat::Text),
            "code" => Ok(SchemaFormat::Code),
            "openai" => Ok(SchemaFormat::Openai),
            "semantic" => Ok(SchemaFormat::Semantic),
            "m_schema" | "mschema" => Ok(SchemaFormat::MSchema),
            other => Err(PipelineError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Renders `schema`, restricted to `pruned` when given.
///
/// Pruned names are matched case-insensitively and rendered in canonical case;
/// names unknown to the schema are ignored.
pub fn format_schema(
    schema: &Schema,
    pruned: Option<&PrunedSchema>,
    format: SchemaFormat,
) -> String {
    let selection = match pruned {
        Some(p) => p.canonicalize(schema),
        None => schema.full_selection(),
    };
    match format {
        SchemaFormat::Basic => line_per_table(&selection, |t, cols| {
            format!("Table {t}, columns = [ {cols} ]")
        }),
        SchemaFormat::Text => line_per_table(&selection, |t, cols| format!("{t}: {cols}")),
        SchemaFormat::Openai => line_per_table(&selection, |t, cols| format!("# {t} ( {cols} )")),
        SchemaFormat::Code => code_schema(schema, &selection),
        SchemaFormat::Semantic => semantic_schema(schema, &selection),
        SchemaFormat::MSchema => m_schema(schema, &selection),
    }
}

fn line_per_table(selection: &PrunedSchema, line: impl Fn(&str, &str) -> String) -> String {
    selection
        .iter()
        .map(|(t, cols)| line(t, &cols.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn code_schema(schema: &Schema, selection: &PrunedSchema) -> String {
    let mut out = Vec::new();
    for (table, cols) in selection.iter() {
        let Some(t) = schema.table_index(table) else {
            continue;
        };
        let Some(ddl) = schema.tables[t].ddl.as_deref() else {
            out.push(format!("-- Missing SQL for {table}"));
            continue;
        };
        let full = schema.tables[t].columns.len() == cols.len();
        if full && selection_keeps_all_targets(schema, t, selection) {
            out.push(ddl.to_string());
            continue;
        }
        let keep_column = |c: &str| cols.iter().any(|k| k.eq_ignore_ascii_case(c));
        let keep_target = |target: &str, target_cols: &[String]| {
            selection.contains_table(target)
                && target_cols
                    .iter()
                    .all(|c| selection.contains_column(target, c))
        };
        out.push(prune_create_table(ddl, &keep_column, &keep_target));
    }
    out.join("\n")
}

fn selection_keeps_all_targets(schema: &Schema, table: usize, selection: &PrunedSchema) -> bool {
    schema
        .foreign_keys
        .iter()
        .filter(|fk| schema.columns[fk.from].table == table)
        .all(|fk| {
            let (to_table, to_col) = schema.qualified(fk.to);
            selection.contains_column(to_table, to_col)
        })
}

#[derive(Serialize)]
struct SemanticTable {
    #[serde(rename = "Table")]
    table: String,
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "Columns")]
    columns: Vec<String>,
}

fn semantic_schema(schema: &Schema, selection: &PrunedSchema) -> String {
    let mut tables = Vec::new();
    for (table, cols) in selection.iter() {
        let Some(t) = schema.table_index(table) else {
            continue;
        };
        let columns = cols
            .iter()
            .filter_map(|c| schema.column_index(t, c))
            .map(|c| {
                let col = &schema.columns[c];
                format!(
                    "{}: {}, Description: {}, Example: {}",
                    col.name,
                    col.data_type,
                    col.description,
                    col.examples.first().map(String::as_str).unwrap_or("")
                )
            })
            .collect();
        tables.push(SemanticTable {
            table: schema.tables[t].name.clone(),
            description: schema.tables[t].description.clone(),
            columns,
        });
    }
    serde_yaml::to_string(&tables).unwrap_or_default()
}

fn python_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

fn m_schema(schema: &Schema, selection: &PrunedSchema) -> String {
    let mut lines = vec![format!("【DB_ID】 {}", schema.db_id), "【Schema】".to_string()];
    let mut foreign_keys = Vec::new();

    for (table, cols) in selection.iter() {
        let Some(t) = schema.table_index(table) else {
            continue;
        };
        let entries: Vec<String> = cols
            .iter()
            .filter_map(|c| schema.column_index(t, c))
            .map(|c| {
                let col = &schema.columns[c];
                format!(
                    "({}:{}, {}, {}Examples: {})",
                    col.name,
                    col.data_type.to_uppercase(),
                    col.description,
                    if col.primary_key { "Primary Key, " } else { "" },
                    python_list(&col.examples)
                )
            })
            .collect();
        lines.push(format!(
            "# Table: {}, {}\n\n[\n{}\n]",
            schema.tables[t].name,
            schema.tables[t].description,
            entries.join("\n")
        ));

        for fk in schema
            .foreign_keys
            .iter()
            .filter(|fk| schema.columns[fk.from].table == t)
        {
            let (from_t, from_c) = schema.qualified(fk.from);
            let (to_t, to_c) = schema.qualified(fk.to);
            if selection.contains_column(from_t, from_c) && selection.contains_column(to_t, to_c) {
                foreign_keys.push(format!("{from_t}.{from_c}={to_t}.{to_c}"));
            }
        }
    }

    if !foreign_keys.is_empty() {
        lines.push("【Foreign keys】".to_string());
        lines.extend(foreign_keys);
    }
    lines.join("\n")
}
