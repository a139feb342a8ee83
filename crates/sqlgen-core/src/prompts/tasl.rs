//! Dummy-SQL prompt: the schema as Python dictionaries and a half-written
//! `question_to_SQL` function the model completes.

use super::PromptContext;
use crate::schema::Schema;

fn py_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn column_note(schema: &Schema, column: usize) -> String {
    let col = &schema.columns[column];
    let mut note = col.description.replace('#', "").replace('\n', ",  ");
    if !col.examples.is_empty() {
        if !note.is_empty() {
            note.push_str(", ");
        }
        let values: Vec<String> = col.examples.iter().map(|v| py_str(v)).collect();
        note.push_str(&format!("example values are [{}]", values.join(", ")));
    }
    note
}

fn schema_dict(ctx: &PromptContext<'_>) -> String {
    let selection = match ctx.pruned {
        Some(p) => p.canonicalize(ctx.schema),
        None => ctx.schema.full_selection(),
    };
    let mut out = String::from("{\n ");
    for (table, cols) in selection.iter() {
        let Some(t) = ctx.schema.table_index(table) else {
            continue;
        };
        out.push_str(&format!("{table}:\n  {{\n\t"));
        for c in cols.iter().filter_map(|c| ctx.schema.column_index(t, c)) {
            out.push_str(&format!(
                "{}: {}\n\t\n\t",
                ctx.schema.columns[c].name,
                column_note(ctx.schema, c)
            ));
        }
        out.push_str("}\n ");
    }
    out.push('}');
    out
}

fn primary_key_dict(schema: &Schema) -> String {
    let entries: Vec<String> = (0..schema.tables.len())
        .filter_map(|t| {
            let pk = schema.primary_key_columns(t);
            if pk.is_empty() {
                return None;
            }
            let cols: Vec<String> = pk.iter().map(|c| py_str(c)).collect();
            Some(format!("{}: [{}]", py_str(&schema.tables[t].name), cols.join(", ")))
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn foreign_key_dict(schema: &Schema) -> String {
    let entries: Vec<String> = schema
        .foreign_keys
        .iter()
        .map(|fk| {
            let (ft, fc) = schema.qualified(fk.from);
            let (tt, tc) = schema.qualified(fk.to);
            format!("{}: {}", py_str(&format!("{ft}.{fc}")), py_str(&format!("{tt}.{tc}")))
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

pub(crate) fn dummy_sql(ctx: &PromptContext<'_>) -> String {
    format!(
        "# the key is the table, the value is a dict which key is original column name \
         and value is the column information including full name, column description, \
         value_description and example values.\n\
         database_schema = {}\n\n\
         # the key is the table, the value is the list of its counterpart primary keys\n\
         primary_keys = {}\n\n\
         # the key is the source column, the value is the target column \
         referenced by foreign key relationship.\n\
         foreign_keys = {}\n\n\
         question = \"{}\"\n\n\
         evidence = \"{}\"\n\n\
         def question_to_SQL(question):\n  \
         # DO NOT select more things other than what the question asks\n  \
         # Generate the SQL to answer the question considering database_schema, \
         primary_keys and foreign_keys\n  \
         # Also consider the evidence when generating the SQL\n  \
         SQL = \"SELECT",
        schema_dict(ctx),
        primary_key_dict(ctx.schema),
        foreign_key_dict(ctx.schema),
        ctx.question.replace('"', "\\\""),
        ctx.evidence.unwrap_or("").replace('"', "\\\""),
    )
}

/// Cuts a completion of `SQL = "SELECT` at the closing quote of the Python
/// string, if the model wrote one.
pub(crate) fn close_string_literal(reply: &str) -> &str {
    let mut in_single = false;
    for (i, ch) in reply.char_indices() {
        match ch {
            '\'' => in_single = !in_single,
            '"' if !in_single => return &reply[..i],
            _ => {}
        }
    }
    reply
}
