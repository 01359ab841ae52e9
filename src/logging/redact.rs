//! Redaction of secrets from log output.
//!
//! Matches LLM API keys, bot tokens, and per-recording access keys. Applied
//! to every formatted log line before it reaches a writer.

use regex::Regex;
use std::sync::OnceLock;

fn sensitive_patterns() -> &'static Regex {
    static PATTERNS: OnceLock<Regex> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        Regex::new(concat!(
            r"(sk-ant-[A-Za-z0-9_-]{20,})",
            r"|((?:Bot\s+)?[A-Za-z0-9_-]{24,}\.[A-Za-z0-9_-]{6,7}\.[A-Za-z0-9_-]{27,})",
            r"|(\?key=[A-Za-z0-9]{4,})",
        ))
        .expect("sensitive pattern regex is valid")
    })
}

/// Replace any sensitive token in `text` with a masked form.
///
/// Access keys inside URLs become `?key=***`; other secrets keep their first
/// eight characters so log lines stay correlatable.
pub fn redact(text: &str) -> String {
    sensitive_patterns()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if matched.starts_with("?key=") {
                "?key=***".to_string()
            } else {
                let head: String = matched.chars().take(8).collect();
                format!("{head}***")
            }
        })
        .into_owned()
}
