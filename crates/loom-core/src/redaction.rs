//! Error-message sanitization for untrusted observers.
//!
//! Internal logs keep the full error text. Anything forwarded to the
//! notification sink or returned in metrics goes through
//! [`sanitize_error_message`] first, which removes:
//! - absolute filesystem paths (Unix and Windows forms)
//! - credentials embedded in URLs
//! - key-like tokens
//! - stack-trace / backtrace lines

use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound on sanitized message length (in chars).
pub const MAX_SANITIZED_LEN: usize = 500;

static UNIX_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s'"(=\[])(?:/[\w.@+\-]+){2,}/?"#).expect("static regex")
});

static WINDOWS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s'"(=\[])[A-Za-z]:[\\/][^\s'"]*"#).expect("static regex")
});

static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://)[^:@\s/]+:[^@\s/]+@").expect("static regex"));

static KEY_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:sk-|pk_|ghp_|Bearer )[A-Za-z0-9_\-]{16,}").expect("static regex")
});

static STACK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:at\s+\S|\d+:\s+\S|stack backtrace:|Backtrace|thread '.*' panicked)")
        .expect("static regex")
});

/// Sanitize an error message before it reaches an untrusted observer.
pub fn sanitize_error_message(message: &str) -> String {
    let kept: Vec<&str> = message
        .lines()
        .filter(|line| !STACK_LINE.is_match(line))
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let joined = kept.join(" ");

    let redacted = URL_CREDENTIALS.replace_all(&joined, "${1}[REDACTED]@");
    let redacted = KEY_TOKEN.replace_all(&redacted, "[REDACTED_KEY]");
    let redacted = WINDOWS_PATH.replace_all(&redacted, "${1}[path]");
    let redacted = UNIX_PATH.replace_all(&redacted, "${1}[path]");

    truncate_chars(redacted.trim(), MAX_SANITIZED_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
