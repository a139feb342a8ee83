use super::PromptContext;

const SCHEMA_HEADER: &str = "/* Given the following database schema : */";

fn answer_line(question: &str) -> String {
    format!("/* Answer the following : {question} */\n")
}

fn evidence_comment(evidence: Option<&str>) -> String {
    evidence
        .map(|e| format!("/* Evidence: {e} */\n"))
        .unwrap_or_default()
}

/// Schema, question and SQL repeated per example, then the target block.
pub(crate) fn full_information(ctx: &PromptContext<'_>) -> String {
    let mut parts = Vec::new();
    for ex in ctx.examples {
        parts.push(format!("{SCHEMA_HEADER}\n{}\n", ctx.schema_text));
        parts.push(answer_line(&ex.question));
        parts.push(format!("{}\n", ex.sql));
    }
    parts.push(format!("{SCHEMA_HEADER}\n{}\n", ctx.schema_text));
    parts.push(answer_line(ctx.question));
    if let Some(e) = ctx.evidence {
        parts.push(evidence_comment(Some(e)));
    }
    parts.push("SELECT".to_string());
    parts.join("\n")
}

pub(crate) fn sql_only(ctx: &PromptContext<'_>) -> String {
    let mut parts =
        vec!["/* Some SQL examples are provided based on similar problems : */\n".to_string()];
    for ex in ctx.examples {
        parts.push(format!("\n{}\n", ex.sql));
    }
    parts.push(format!("{SCHEMA_HEADER}\n{}\n", ctx.schema_text));
    parts.push(format!(
        "{}{}SELECT",
        answer_line(ctx.question),
        evidence_comment(ctx.evidence)
    ));
    parts.join("\n")
}

pub(crate) fn dail_sql(ctx: &PromptContext<'_>) -> String {
    let mut parts = vec![format!("{SCHEMA_HEADER}\n{}\n", ctx.schema_text)];
    parts.push(
        "/* Some example questions and corresponding SQL queries \
         are provided based on similar problems : */\n"
            .to_string(),
    );
    for ex in ctx.examples {
        parts.push(answer_line(&ex.question));
        parts.push(format!("{}\n", ex.sql));
    }
    parts.push(format!(
        "{}{}SELECT",
        answer_line(ctx.question),
        evidence_comment(ctx.evidence)
    ));
    parts.join("\n")
}

/// Examples carry their evidence and the tables they touched; the schema is
/// given once up front.
pub(crate) fn semantic_full_information(ctx: &PromptContext<'_>) -> String {
    let mut parts = vec![format!("{SCHEMA_HEADER}\n{}\n", ctx.schema_text)];
    parts.push(
        "/* Similar questions, the schema elements they use and their SQL : */\n".to_string(),
    );
    for ex in ctx.examples {
        let mut block = answer_line(&ex.question);
        if !ex.evidence.trim().is_empty() {
            block.push_str(&evidence_comment(Some(ex.evidence.trim())));
        }
        if let Some(used) = ex.schema_used.as_ref().filter(|s| !s.is_empty()) {
            block.push_str(&format!(
                "/* Schema used : {} */\n",
                used.render_compact().replace('\n', "; ")
            ));
        }
        block.push_str(&format!("{}\n", ex.sql));
        parts.push(block);
    }
    parts.push(format!(
        "{}{}SELECT",
        answer_line(ctx.question),
        evidence_comment(ctx.evidence)
    ));
    parts.join("\n")
}

/// Sectioned instruction prompt; the answer comes back as a fenced block.
pub(crate) fn icl_xiyan(ctx: &PromptContext<'_>) -> String {
    let mut out = String::from(
        "You are a SQLite expert. Read the database schema and the reference examples, \
         then write one SQLite query that answers the user question.\n\n",
    );
    out.push_str(&format!("【Database schema】\n{}\n\n【Reference examples】\n", ctx.schema_text));
    for (i, ex) in ctx.examples.iter().enumerate() {
        out.push_str(&format!("Example {}\nQuestion: {}\n", i + 1, ex.question));
        if !ex.evidence.trim().is_empty() {
            out.push_str(&format!("Evidence: {}\n", ex.evidence.trim()));
        }
        out.push_str(&format!("```sql\n{}\n```\n\n", ex.sql.trim()));
    }
    out.push_str(&format!("【Question】\n{}\n", ctx.question));
    if let Some(e) = ctx.evidence {
        out.push_str(&format!("【Evidence】\n{e}\n"));
    }
    out.push_str("\nReturn only the query, inside a single ```sql code block.\n");
    out
}
