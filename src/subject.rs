//! Subject naming rules.
//!
//! Every registered function is addressed on the bus by a subject derived
//! from its namespace, durability, and name:
//!
//! ```text
//! {namespace}.{name}        request/reply and fire-and-forget
//! {namespace}.js.{name}     durable (pull consumer, at-least-once)
//! ```
//!
//! Subjects are dot-separated tokens. Subscriptions may use `*` to match a
//! single token and a trailing `>` to match one or more tokens.

/// Token inserted between namespace and name for durable functions.
pub const DURABLE_TOKEN: &str = "js";

/// Build the subject for a function.
pub fn function_subject(namespace: &str, name: &str, durable: bool) -> String {
    if durable {
        format!("{}.{}.{}", namespace, DURABLE_TOKEN, name)
    } else {
        format!("{}.{}", namespace, name)
    }
}

/// Wildcard subject capturing everything published under a namespace.
pub fn namespace_wildcard(namespace: &str) -> String {
    format!("{}.>", namespace)
}

/// Whether a subject is in the durable form `{namespace}.js.{name}`.
pub fn is_durable_subject(subject: &str) -> bool {
    let mut tokens = subject.split('.');
    matches!(
        (tokens.next(), tokens.next(), tokens.next(), tokens.next()),
        (Some(_), Some(DURABLE_TOKEN), Some(_), None)
    )
}

/// Check a namespace or function name for use as a single subject token.
///
/// Returns the reason when the token is unusable.
pub fn validate_token(token: &str) -> Result<(), &'static str> {
    if token.is_empty() {
        return Err("must not be empty");
    }
    if token.contains('.') {
        return Err("must not contain '.'");
    }
    if token.contains('*') || token.contains('>') {
        return Err("must not contain wildcards");
    }
    if token.chars().any(char::is_whitespace) {
        return Err("must not contain whitespace");
    }
    Ok(())
}

/// Match a concrete subject against a subscription pattern.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            // `>` needs at least one remaining token
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Durable consumer name for a subject.
///
/// Deterministic so that a restarted listener binds to the same
/// server-side cursor. Separators and wildcards become `_`.
pub fn durable_consumer_name(base: &str, subject: &str) -> String {
    let normalized: String = subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect();
    format!("{}_{}", base, normalized)
}
