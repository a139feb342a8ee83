//! Minimal `CREATE TABLE` handling for the code-style schema rendering:
//! split a statement into column definitions and table constraints, and
//! rebuild it with a subset of the columns.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlParts {
    /// Everything up to (not including) the opening parenthesis.
    pub head: String,
    /// Depth-0 comma separated entries of the body, trimmed.
    pub items: Vec<String>,
    /// Everything after the closing parenthesis (e.g. `WITHOUT ROWID`).
    pub tail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Punct(char),
}

const CONSTRAINT_KEYWORDS: [&str; 5] = ["constraint", "primary", "foreign", "unique", "check"];

pub fn split_create_table(ddl: &str) -> Option<DdlParts> {
    let bytes: Vec<char> = ddl.chars().collect();
    let open = find_top_level_open(&bytes)?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut items = Vec::new();
    let mut current = String::new();
    let mut close = None;

    for (i, &ch) in bytes.iter().enumerate().skip(open + 1) {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' => {
                quote = Some(']');
                current.push(ch);
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' if depth == 0 => {
                close = Some(i);
                break;
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let close = close?;
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    Some(DdlParts {
        head: bytes[..open].iter().collect::<String>().trim_end().to_string(),
        items,
        tail: bytes[close + 1..].iter().collect::<String>().trim().to_string(),
    })
}

fn find_top_level_open(chars: &[char]) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, &ch) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '[' => quote = Some(']'),
            '(' => return Some(i),
            _ => {}
        }
    }
    None
}

fn tokenize(item: &str) -> Vec<Tok> {
    let chars: Vec<char> = item.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
        } else if ch == '"' || ch == '`' || ch == '[' {
            let end = if ch == '[' { ']' } else { ch };
            let start = i + 1;
            i = start;
            while i < chars.len() && chars[i] != end {
                i += 1;
            }
            out.push(Tok::Ident(chars[start..i.min(chars.len())].iter().collect()));
            i += 1;
        } else if ch == '\'' {
            // String literal: skipped, it never names a column.
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                i += 1;
            }
            i += 1;
        } else if ch.is_alphanumeric() || ch == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            out.push(Tok::Ident(chars[start..i].iter().collect()));
        } else {
            out.push(Tok::Punct(ch));
            i += 1;
        }
    }
    out
}

fn is_kw(tok: Option<&Tok>, kw: &str) -> bool {
    matches!(tok, Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
}

/// Column name of a column definition; `None` for table constraints.
pub fn item_column_name(item: &str) -> Option<String> {
    let toks = tokenize(item);
    let first = toks.first()?;
    let leading_bare = item
        .trim_start()
        .chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '_');
    match first {
        Tok::Ident(name)
            if leading_bare && CONSTRAINT_KEYWORDS.iter().any(|k| name.eq_ignore_ascii_case(k)) =>
        {
            None
        }
        Tok::Ident(name) => Some(name.clone()),
        Tok::Punct(_) => None,
    }
}

/// Column names in declaration order.
pub fn parse_columns(ddl: &str) -> Vec<String> {
    split_create_table(ddl)
        .map(|parts| parts.items.iter().filter_map(|i| item_column_name(i)).collect())
        .unwrap_or_default()
}

/// Identifiers inside the first parenthesised list after position `from`.
fn paren_list(toks: &[Tok], from: usize) -> (Vec<String>, usize) {
    let mut i = from;
    while i < toks.len() && toks[i] != Tok::Punct('(') {
        i += 1;
    }
    let mut out = Vec::new();
    i += 1;
    while i < toks.len() && toks[i] != Tok::Punct(')') {
        if let Tok::Ident(s) = &toks[i] {
            out.push(s.clone());
        }
        i += 1;
    }
    (out, i + 1)
}

/// `REFERENCES <table> [(<cols>)]` starting at token index `at`.
fn references_target(toks: &[Tok], at: usize) -> Option<(String, Vec<String>)> {
    let table = match toks.get(at + 1) {
        Some(Tok::Ident(t)) => t.clone(),
        _ => return None,
    };
    let cols = if toks.get(at + 2) == Some(&Tok::Punct('(')) {
        paren_list(toks, at + 2).0
    } else {
        Vec::new()
    };
    Some((table, cols))
}

/// Rebuilds `ddl` keeping only the columns for which `keep_column` is true.
///
/// Table constraints naming a removed column are dropped, as are foreign keys
/// whose target is not kept according to `keep_target(table, columns)`.
/// Returns the input unchanged if it does not parse as `CREATE TABLE ... ( ... )`.
pub fn prune_create_table(
    ddl: &str,
    keep_column: &dyn Fn(&str) -> bool,
    keep_target: &dyn Fn(&str, &[String]) -> bool,
) -> String {
    let Some(parts) = split_create_table(ddl) else {
        return ddl.to_string();
    };

    let mut kept = Vec::new();
    for item in &parts.items {
        match item_column_name(item) {
            Some(col) => {
                if !keep_column(&col) {
                    continue;
                }
                kept.push(strip_dangling_reference(item, keep_target));
            }
            None => {
                if constraint_survives(item, keep_column, keep_target) {
                    kept.push(item.clone());
                }
            }
        }
    }

    let mut out = format!("{} (\n  {}\n)", parts.head, kept.join(",\n  "));
    if !parts.tail.is_empty() {
        out.push(' ');
        out.push_str(&parts.tail);
    }
    out
}

fn strip_dangling_reference(item: &str, keep_target: &dyn Fn(&str, &[String]) -> bool) -> String {
    let toks = tokenize(item);
    let Some(pos) = toks.iter().position(|t| is_kw(Some(t), "references")) else {
        return item.to_string();
    };
    match references_target(&toks, pos) {
        Some((table, cols)) if keep_target(&table, &cols) => item.to_string(),
        _ => {
            let lower = item.to_lowercase();
            match lower.find("references") {
                Some(byte) => item[..byte].trim_end().to_string(),
                None => item.to_string(),
            }
        }
    }
}

fn constraint_survives(
    item: &str,
    keep_column: &dyn Fn(&str) -> bool,
    keep_target: &dyn Fn(&str, &[String]) -> bool,
) -> bool {
    let toks = tokenize(item);
    let mut i = 0;
    if is_kw(toks.first(), "constraint") {
        i = 2;
    }
    match toks.get(i) {
        Some(Tok::Ident(kw))
            if kw.eq_ignore_ascii_case("primary") || kw.eq_ignore_ascii_case("unique") =>
        {
            let (cols, _) = paren_list(&toks, i);
            cols.iter().all(|c| keep_column(c))
        }
        Some(Tok::Ident(kw)) if kw.eq_ignore_ascii_case("foreign") => {
            let (cols, next) = paren_list(&toks, i);
            if !cols.iter().all(|c| keep_column(c)) {
                return false;
            }
            let Some(pos) = toks[next.min(toks.len())..]
                .iter()
                .position(|t| is_kw(Some(t), "references"))
                .map(|p| p + next)
            else {
                return false;
            };
            match references_target(&toks, pos) {
                Some((table, target_cols)) => keep_target(&table, &target_cols),
                None => false,
            }
        }
        Some(Tok::Ident(kw)) if kw.eq_ignore_ascii_case("check") => {
            // Keep unless it mentions something that is not kept; keywords and
            // literals are not columns, so only the column predicate's "false"
            // for a name that is a real column matters to the caller.
            toks.iter().skip(i + 1).all(|t| match t {
                Tok::Ident(name) => {
                    keep_column(name) || !looks_like_removed_column(name, keep_column)
                }
                Tok::Punct(_) => true,
            })
        }
        _ => true,
    }
}

fn looks_like_removed_column(name: &str, keep_column: &dyn Fn(&str) -> bool) -> bool {
    !name.chars().all(|c| c.is_ascii_digit()) && !keep_column(name) && !is_sql_word(name)
}

fn is_sql_word(name: &str) -> bool {
    const WORDS: [&str; 14] = [
        "and", "or", "not", "null", "is", "in", "between", "like", "length", "glob", "true",
        "false", "upper", "lower",
    ];
    WORDS.iter().any(|w| name.eq_ignore_ascii_case(w))
}
