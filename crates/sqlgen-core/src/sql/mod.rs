pub mod refs;
pub mod runner;

pub use runner::{set_equal, ExecutionResult, SqlRunner, SqliteRunner};

/// Pulls a single SQL statement out of a model reply.
///
/// Handles fenced ```sql blocks (first block wins), bare statements, and
/// completions of prompts that end in `SELECT` (`continues_select`), where the
/// model only returns the tail of the query. Returns `None` when nothing
/// usable remains.
pub fn extract_sql(reply: &str, continues_select: bool) -> Option<String> {
    let body = match fenced_block(reply) {
        Some(block) => block,
        None => reply.trim().to_string(),
    };
    let body = strip_label(&body);
    let statement = first_statement(body).trim().to_string();
    if statement.is_empty() {
        return None;
    }

    let starts_query = {
        let head = statement.trim_start_matches('(').to_ascii_uppercase();
        head.starts_with("SELECT") || head.starts_with("WITH") || head.starts_with("VALUES")
    };
    if starts_query {
        Some(statement)
    } else if continues_select {
        Some(format!("SELECT {statement}"))
    } else {
        None
    }
}

fn fenced_block(reply: &str) -> Option<String> {
    let start = reply.find("```")?;
    let after = &reply[start + 3..];
    // Skip an info string such as `sql` or `sqlite`.
    let content_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let info = after[..content_start].trim();
    if !info.is_empty() && !info.chars().all(|c| c.is_ascii_alphanumeric()) {
        // ```SELECT ... ``` on one line
        let end = after.find("```")?;
        return Some(after[..end].trim().to_string());
    }
    let content = &after[content_start..];
    let end = content.find("```").unwrap_or(content.len());
    Some(content[..end].trim().to_string())
}

fn strip_label(body: &str) -> &str {
    let trimmed = body.trim_start();
    for label in ["SQL:", "sql:", "A:", "Answer:"] {
        if let Some(rest) = trimmed.strip_prefix(label) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Text up to the first `;` that is not inside a quoted region.
pub fn first_statement(sql: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, ch) in sql.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '[' => quote = Some(']'),
                ';' => return &sql[..i],
                _ => {}
            },
        }
    }
    sql
}
