//! Token-level extraction of the tables and columns a query touches.
//!
//! Used to derive `schema_used` for gold queries and to score schema linking.
//! This is deliberately not a SQL parser: it resolves `FROM`/`JOIN` targets,
//! their aliases, qualified `alias.column` references and bare column names
//! that belong to a referenced table.

use crate::schema::{PrunedSchema, Schema};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Quoted(String),
    Dot,
    Comma,
    Open,
    Close,
    Other,
}

impl Tok {
    fn ident(&self) -> Option<&str> {
        match self {
            Tok::Word(w) | Tok::Quoted(w) => Some(w),
            _ => None,
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Tok::Word(w) if w.eq_ignore_ascii_case(kw))
    }
}

const CLAUSE_WORDS: [&str; 25] = [
    "where", "join", "inner", "left", "right", "outer", "cross", "full", "natural", "on", "using",
    "group", "order", "limit", "union", "except", "intersect", "having", "as", "set", "window",
    "select", "from", "offset", "values",
];

fn is_clause_word(tok: &Tok) -> bool {
    matches!(tok, Tok::Word(w) if CLAUSE_WORDS.iter().any(|k| w.eq_ignore_ascii_case(k)))
}

fn tokenize(sql: &str) -> Vec<Tok> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '\'' => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                out.push(Tok::Other);
            }
            '"' | '`' | '[' => {
                let end = if ch == '[' { ']' } else { ch };
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i] != end {
                    i += 1;
                }
                out.push(Tok::Quoted(chars[start..i.min(chars.len())].iter().collect()));
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                out.push(Tok::Dot);
                i += 1;
            }
            ',' => {
                out.push(Tok::Comma);
                i += 1;
            }
            '(' => {
                out.push(Tok::Open);
                i += 1;
            }
            ')' => {
                out.push(Tok::Close);
                i += 1;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                // A dot only continues a numeric literal such as `2.5`.
                let decimal_dot = |i: usize| {
                    chars[i] == '.'
                        && chars[start].is_ascii_digit()
                        && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                };
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || decimal_dot(i))
                {
                    i += 1;
                }
                out.push(Tok::Word(chars[start..i].iter().collect()));
            }
            _ => {
                out.push(Tok::Other);
                i += 1;
            }
        }
    }
    out
}

/// Tables and columns of `schema` referenced by `sql`, in order of appearance.
pub fn referenced_schema(sql: &str, schema: &Schema) -> PrunedSchema {
    let toks = tokenize(sql);
    let mut out = PrunedSchema::default();
    // alias (lowercase) -> table index
    let mut aliases: HashMap<String, usize> = HashMap::new();
    let mut referenced: Vec<usize> = Vec::new();

    // Pass 1: FROM/JOIN targets and their aliases.
    let mut in_from = false;
    for i in 0..toks.len() {
        let tok = &toks[i];
        if tok.is_kw("from") || tok.is_kw("join") {
            in_from = true;
        } else if is_clause_word(tok) && !tok.is_kw("as") {
            in_from = false;
        }
        let prev = i.checked_sub(1).map(|p| &toks[p]);
        let follows_from = prev.is_some_and(|p| {
            p.is_kw("from") || p.is_kw("join") || (in_from && *p == Tok::Comma)
        });
        if !follows_from {
            continue;
        }
        let Some(name) = tok.ident() else { continue };
        if toks.get(i + 1) == Some(&Tok::Dot) {
            continue;
        }
        let Some(t) = schema.table_index(name) else { continue };
        if !referenced.contains(&t) {
            referenced.push(t);
            out.push_table(&schema.tables[t].name, Vec::new());
        }
        aliases.insert(name.to_lowercase(), t);
        let alias = match (toks.get(i + 1), toks.get(i + 2)) {
            (Some(a), Some(b)) if a.is_kw("as") => b.ident(),
            (Some(a), _) if !is_clause_word(a) => a.ident(),
            _ => None,
        };
        if let Some(alias) = alias {
            aliases.insert(alias.to_lowercase(), t);
        }
    }
    for (t, table) in schema.tables.iter().enumerate() {
        aliases.entry(table.name.to_lowercase()).or_insert(t);
    }

    // Pass 2: columns.
    for i in 0..toks.len() {
        let Some(name) = toks[i].ident() else { continue };
        let qualified_by = (i >= 2 && toks[i - 1] == Tok::Dot)
            .then(|| toks[i - 2].ident())
            .flatten();
        if let Some(qualifier) = qualified_by {
            if let Some(&t) = aliases.get(&qualifier.to_lowercase()) {
                if let Some(c) = schema.column_index(t, name) {
                    if !referenced.contains(&t) {
                        referenced.push(t);
                    }
                    out.push_column(&schema.tables[t].name, &schema.columns[c].name);
                }
            }
            continue;
        }
        if toks.get(i + 1) == Some(&Tok::Dot) || toks.get(i + 1) == Some(&Tok::Open) {
            continue;
        }
        for &t in &referenced {
            if let Some(c) = schema.column_index(t, name) {
                out.push_column(&schema.tables[t].name, &schema.columns[c].name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_support::library_schema;

    #[test]
    fn resolves_aliases_and_qualified_columns() {
        let s = library_schema();
        let sql = "SELECT T1.name, count(T2.id) FROM author AS T1 \
                   JOIN book T2 ON T1.id = T2.author_id \
                   WHERE T2.title LIKE '%sea%' GROUP BY T1.name";
        let refs = referenced_schema(sql, &s);
        assert_eq!(refs.table_names(), vec!["author", "book"]);
        assert_eq!(refs.columns("author").unwrap(), ["name", "id"]);
        assert_eq!(refs.columns("book").unwrap(), ["id", "author_id", "title"]);
    }

    #[test]
    fn bare_columns_resolve_against_referenced_tables_only() {
        let s = library_schema();
        let refs = referenced_schema("SELECT title FROM book WHERE author_id = 3", &s);
        assert_eq!(refs.table_names(), vec!["book"]);
        assert_eq!(refs.columns("book").unwrap(), ["title", "author_id"]);
    }

    #[test]
    fn string_literals_and_functions_are_ignored() {
        let s = library_schema();
        let refs = referenced_schema("SELECT count(*) FROM `book` WHERE title = 'name'", &s);
        assert_eq!(refs.table_names(), vec!["book"]);
        assert_eq!(refs.columns("book").unwrap(), ["title"]);
    }

    #[test]
    fn comma_joins_and_subqueries() {
        let s = library_schema();
        let sql = "SELECT a.name FROM author a, book b \
                   WHERE a.id = b.author_id AND b.id IN (SELECT id FROM book)";
        let refs = referenced_schema(sql, &s);
        assert_eq!(refs.table_names(), vec!["author", "book"]);
        assert!(refs.contains_column("book", "author_id"));
        assert!(refs.contains_column("author", "name"));
    }
}
