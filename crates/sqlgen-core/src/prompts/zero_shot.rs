use super::PromptContext;

pub(crate) fn basic(ctx: &PromptContext<'_>) -> String {
    let evidence = ctx
        .evidence
        .map(|e| format!("Evidence: {e}\n"))
        .unwrap_or_default();
    format!("{}\n{evidence}Q: {}\nA: SELECT", ctx.schema_text, ctx.question)
}

pub(crate) fn text_repr(ctx: &PromptContext<'_>) -> String {
    let evidence = ctx
        .evidence
        .map(|e| format!("Evidence: {e}\n"))
        .unwrap_or_default();
    format!(
        "Complete sqlite SQL query only and with no explanation\n\
         Given the following database schema :\n{}\n\
         Answer the following: {}\n{evidence}SELECT",
        ctx.schema_text, ctx.question
    )
}

pub(crate) fn openai_demo(ctx: &PromptContext<'_>) -> String {
    let evidence = ctx
        .evidence
        .map(|e| format!("\n#Evidence: {e}"))
        .unwrap_or_default();
    format!(
        "### Complete sqlite SQL query only and with no explanation\n\
         ### SQLite SQL tables , with their properties :\n#\n{}\n### {}\n#{evidence}\nSELECT",
        ctx.schema_text, ctx.question
    )
}

pub(crate) fn code_repr(ctx: &PromptContext<'_>) -> String {
    let evidence = ctx
        .evidence
        .map(|e| format!("\n/* Evidence: {e}*/\n"))
        .unwrap_or_default();
    format!(
        "/* Complete sqlite SQL query only and with no explanation\n\
         Given the following database schema : */\n{}\n\
         /* Answer the following : {} */\n{evidence}\nSELECT",
        ctx.schema_text, ctx.question
    )
}

pub(crate) fn alpaca_sft(ctx: &PromptContext<'_>) -> String {
    let evidence = ctx
        .evidence
        .map(|e| format!("\n### Evidence: {e}\n"))
        .unwrap_or_default();
    format!(
        "Below is an instruction that describes a task , paired with an input that provides \
         further context . Write a response that appropriately completes the request .\n\
         ### Instruction:\nWrite a sql to answer the question \"{}\"\n\n\
         ### Input:\n{}\n{evidence}\n### Response:\nSELECT",
        ctx.question, ctx.schema_text
    )
}
