//! Log Redaction Layer
//!
//! Scrubs API keys, bearer tokens, and credential assignments from strings
//! before they reach execution logs or the tracing output.

use regex::Regex;
use std::sync::LazyLock;

static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9]{32,})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)").unwrap()
});
static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|secret|token|api[_-]?key|access[_-]?token)(["']?\s*[:=]\s*["']?)[^\s"'&,]+"#)
        .unwrap()
});

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = API_KEY_RE.replace_all(input, "[REDACTED_TOKEN]");
    CREDENTIAL_RE
        .replace_all(&redacted, "${1}${2}[REDACTED]")
        .into_owned()
}
