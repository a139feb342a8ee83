//! Keyword extraction from a question and its evidence.

use crate::config::KeywordStrategy;
use crate::providers::llm::LlmClient;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "among", "an", "and",
    "any", "are", "as", "at", "be", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "either", "else",
    "ever", "every", "few", "for", "from", "further", "had", "has", "have", "having", "he", "her",
    "here", "hers", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself",
    "just", "least", "less", "many", "may", "me", "might", "more", "most", "much", "must", "my",
    "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "out",
    "over", "own", "per", "same", "shall", "she", "should", "so", "some", "such", "than", "that",
    "the", "their", "them", "then", "there", "these", "they", "this", "those", "through", "to",
    "too", "under", "until", "up", "upon", "us", "very", "was", "we", "were", "what", "when",
    "where", "whether", "which", "while", "who", "whom", "whose", "why", "will", "with", "within",
    "without", "would", "yet", "you", "your",
];

/// Imperatives that open benchmark questions.
const QUESTION_VERBS: &[&str] = &[
    "calculate", "compute", "describe", "determine", "find", "give", "identify", "indicate",
    "list", "mention", "please", "provide", "refer", "refers", "return", "show", "state", "tell",
];

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().chain(QUESTION_VERBS).copied().collect())
}

fn is_stop_word(w: &str) -> bool {
    stop_words().contains(w.to_lowercase().as_str())
}

struct Patterns {
    quoted: Regex,
    date: Regex,
    number: Regex,
    word: Regex,
    list_item: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        quoted: Regex::new(r#""([^"]+)"|(?:^|[\s(=])'([^']+)'"#).expect("static regex"),
        date: Regex::new(concat!(
            r"\b(?:\d{1,2}/\d{1,2}/\d{2,4}",
            r"|\d{4}-\d{1,2}-\d{1,2}",
            r"|\d{4}/\d{1,2}/\d{1,2})\b"
        ))
        .expect("static regex"),
        number: Regex::new(r"\b\d+(?:\.\d+)?\b").expect("static regex"),
        word: Regex::new(r"[A-Za-z][A-Za-z0-9_'\-]*").expect("static regex"),
        list_item: Regex::new(r#"'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)""#).expect("static regex"),
    })
}

/// Crude English singular: `ies → y`, `sses → ss`, `(s|x|z|ch|sh)es → stem`,
/// otherwise a trailing `s` unless the word ends in `ss`, `us` or `is`.
pub fn singularize(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.len() <= 3 {
        return word.to_string();
    }
    let cut = |n: usize| word[..word.len() - n].to_string();
    if lower.ends_with("ies") {
        return format!("{}y", cut(3));
    }
    if lower.ends_with("sses") {
        return cut(2);
    }
    for suffix in ["ses", "xes", "zes", "ches", "shes"] {
        if lower.ends_with(suffix) {
            return cut(2);
        }
    }
    if lower.ends_with('s') && !["ss", "us", "is"].iter().any(|s| lower.ends_with(s)) {
        return cut(1);
    }
    word.to_string()
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, kw: &str) {
    let kw = kw.trim().trim_matches(|c: char| c == ',' || c == '.' || c == '?' || c == '!');
    if kw.is_empty() {
        return;
    }
    if seen.insert(kw.to_lowercase()) {
        out.push(kw.to_string());
    }
}

fn extract_text(text: &str, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    let p = patterns();
    let mut masked = text.to_string();
    for cap in p.quoted.captures_iter(text) {
        if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
            push_unique(out, seen, m.as_str());
            masked.replace_range(m.range(), &" ".repeat(m.len()));
        }
    }

    // Runs of capitalised words; a stop word or question verb at the start of
    // the run is dropped.
    let words: Vec<regex::Match<'_>> = p.word.find_iter(&masked).collect();
    let mut i = 0;
    while i < words.len() {
        let is_cap =
            |w: &regex::Match<'_>| w.as_str().chars().next().is_some_and(char::is_uppercase);
        if !is_cap(&words[i]) || is_stop_word(words[i].as_str()) {
            i += 1;
            continue;
        }
        let start = i;
        while i + 1 < words.len()
            && is_cap(&words[i + 1])
            && masked[words[i].end()..words[i + 1].start()].trim().is_empty()
        {
            i += 1;
        }
        if i > start || words[start].start() > 0 {
            let span = &masked[words[start].start()..words[i].end()];
            push_unique(out, seen, span);
        }
        i += 1;
    }

    let date_ranges: Vec<std::ops::Range<usize>> =
        p.date.find_iter(&masked).map(|m| m.range()).collect();
    for r in &date_ranges {
        push_unique(out, seen, &masked[r.clone()]);
    }
    for m in p.number.find_iter(&masked) {
        if !date_ranges.iter().any(|r| r.start <= m.start() && m.end() <= r.end) {
            push_unique(out, seen, m.as_str());
        }
    }

    for w in p.word.find_iter(&masked) {
        let word = w.as_str().trim_end_matches(['\'', '-']);
        let word = word.strip_suffix("'s").unwrap_or(word);
        if word.len() < 2 || is_stop_word(word) {
            continue;
        }
        push_unique(out, seen, &singularize(&word.to_lowercase()));
    }
}

/// Rule-based extraction over the question, then the evidence.
pub fn extract_rule_based(question: &str, evidence: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    extract_text(question, &mut out, &mut seen);
    extract_text(evidence, &mut out, &mut seen);
    out
}

pub fn keyword_prompt(question: &str, evidence: &str) -> String {
    format!(
        "Analyze the question and the hint below and pull out the keywords and phrases that \
         identify database tables, columns or stored values. Keep names, quoted strings, \
         dates and numbers exactly as written.\n\n\
         Question: {question}\n\
         Hint: {evidence}\n\n\
         Answer with a Python list of strings and nothing else, for example:\n\
         [\"keyword one\", \"keyword two\"]"
    )
}

/// Parses a list reply: a JSON/Python list, or bullet, comma or newline
/// separated phrases.
pub fn parse_keyword_reply(reply: &str) -> Vec<String> {
    let body = reply
        .trim()
        .trim_start_matches("```python")
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    if let (Some(open), Some(close)) = (body.find('['), body.rfind(']')) {
        if open < close {
            let inner = &body[open..=close];
            if let Ok(items) = serde_json::from_str::<Vec<String>>(inner) {
                for item in items {
                    push_unique(&mut out, &mut seen, &item);
                }
                return out;
            }
            // Python list with single quotes.
            for cap in patterns().list_item.captures_iter(inner) {
                if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
                    push_unique(&mut out, &mut seen, &m.as_str().replace("\\'", "'"));
                }
            }
            if !out.is_empty() {
                return out;
            }
        }
    }

    for line in body.lines() {
        let line = line
            .trim()
            .trim_start_matches(['-', '*', '•'])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
            .trim();
        for part in line.split(',') {
            push_unique(&mut out, &mut seen, part.trim().trim_matches(['"', '\'']));
        }
    }
    out
}

pub struct KeywordExtractor {
    strategy: KeywordStrategy,
    llm: Option<Arc<dyn LlmClient>>,
}

impl KeywordExtractor {
    pub fn rule_based() -> Self {
        Self {
            strategy: KeywordStrategy::Rule,
            llm: None,
        }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            strategy: KeywordStrategy::Llm,
            llm: Some(llm),
        }
    }

    pub fn strategy(&self) -> KeywordStrategy {
        self.strategy
    }

    /// LLM failures or empty replies fall back to the rule-based extractor.
    pub async fn extract(&self, question: &str, evidence: &str) -> Vec<String> {
        if let (KeywordStrategy::Llm, Some(llm)) = (self.strategy, &self.llm) {
            match llm.complete(&keyword_prompt(question, evidence), None).await {
                Ok(resp) => {
                    let kws = parse_keyword_reply(&resp.text);
                    if !kws.is_empty() {
                        return kws;
                    }
                    tracing::warn!(component = "keywords", "empty keyword reply, using rules");
                }
                Err(e) => {
                    tracing::warn!(
                        component = "keywords",
                        error = %e,
                        "keyword extraction failed, using rules"
                    )
                }
            }
        }
        extract_rule_based(question, evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::llm::fake::FakeClient;

    #[test]
    fn singular_forms() {
        assert_eq!(singularize("cities"), "city");
        assert_eq!(singularize("classes"), "class");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("matches"), "match");
        assert_eq!(singularize("books"), "book");
        assert_eq!(singularize("status"), "status");
        assert_eq!(singularize("analysis"), "analysis");
        assert_eq!(singularize("bus"), "bus");
    }

    #[test]
    fn rules_pick_entities_quotes_dates_and_nouns() {
        let kws = extract_rule_based(
            "How many schools in Alameda County opened after 8/10/2009 with \"Charter\" status?",
            "opened refers to OpenDate > '2009-08-10'",
        );
        let expected_keywords =
            ["Charter", "Alameda County", "8/10/2009", "school", "status", "2009-08-10"];
        for expected in expected_keywords {
            assert!(kws.iter().any(|k| k == expected), "missing {expected}: {kws:?}");
        }
        assert!(!kws.iter().any(|k| k.eq_ignore_ascii_case("how")));
        assert!(!kws.iter().any(|k| k == "8" || k == "10"));
    }

    #[test]
    fn output_is_deduplicated_case_insensitively() {
        let kws = extract_rule_based("List books. Books by Tolkien", "");
        assert_eq!(kws.iter().filter(|k| k.eq_ignore_ascii_case("book")).count(), 1);
        assert!(kws.contains(&"Tolkien".to_string()));
    }

    #[test]
    fn reply_formats() {
        assert_eq!(parse_keyword_reply("[\"a b\", \"c\"]"), vec!["a b", "c"]);
        assert_eq!(parse_keyword_reply("```python\n['x', \"y\"]\n```"), vec!["x", "y"]);
        assert_eq!(parse_keyword_reply("- alpha\n- beta, gamma"), vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn llm_strategy_falls_back_on_empty_reply() {
        let llm = Arc::new(FakeClient::new("m".into()).with_response("[]".into()));
        let ex = KeywordExtractor::with_llm(llm);
        let kws = ex.extract("List the cities", "").await;
        assert_eq!(kws, vec!["city"]);
    }
}
