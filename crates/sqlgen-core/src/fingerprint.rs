use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub hex: String,
    pub components: Vec<String>,
}

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Computes a deterministic fingerprint for one LLM request.
///
/// Chat turns are joined in order with their roles so that a different
/// conversation history never collides with a single-shot prompt.
pub fn compute(
    provider: &str,
    model: &str,
    temperature: f32,
    max_tokens: u32,
    prompt: &str,
    turns: Option<&[(String, String)]>,
) -> Fingerprint {
    let mut parts = Vec::new();

    parts.push(format!("provider={provider}"));
    parts.push(format!("model={model}"));
    // Formatted with fixed precision so 0.7 and 0.70000005 hash alike.
    parts.push(format!("temperature={temperature:.3}"));
    parts.push(format!("max_tokens={max_tokens}"));
    parts.push(format!("prompt={prompt}"));
    match turns {
        Some(turns) => {
            let joined = turns
                .iter()
                .map(|(role, content)| format!("{role}:{content}"))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("turns={joined}"));
        }
        None => parts.push("turns=".to_string()),
    }
    parts.push(format!("sqlgen_version={}", env!("CARGO_PKG_VERSION")));

    let hex = sha256_hex(&parts.join("\n"));
    Fingerprint {
        hex,
        components: parts,
    }
}

/// Cache key for embeddings: model + text.
pub fn embedding_key(model: &str, text: &str) -> String {
    let mut h = Sha256::new();
    h.update(model.as_bytes());
    h.update(b"\n");
    h.update(text.as_bytes());
    hex::encode(h.finalize())
}
