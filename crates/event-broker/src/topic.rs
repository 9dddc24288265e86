//! # Topic Translators
//!
//! Map canonical event names and patterns onto each transport's native
//! addressing syntax. Translation is one-way; matching for AMQP, MQTT and
//! NATS happens inside the transport.
//!
//! | Canonical | MQTT | NATS | Redis | AMQP |
//! |-----------|------|------|-------|------|
//! | `.`       | `/`  | `.`  | `.`   | `.`  |
//! | `*`       | `+`  | `*`  | `*`   | `*`  |
//! | `#`       | `#`  | `>`  | `*`   | `#`  |
//!
//! Redis has no token-aware wildcard. Its `*` matches any run of characters,
//! dots included, so `user.*` also receives `user.a.b` and `logs.#` becomes
//! `logs.*`, which no longer receives a bare `logs`.

use crate::error::{BrokerError, Result};
use crate::pattern::CANONICAL;

const TRAILING_MULTI: &str = "'#' is only supported as the last token";

/// MQTT filter for a subscribe pattern.
pub fn mqtt_filter(pattern: &str) -> Result<String> {
    let tokens: Vec<&str> = pattern.split(CANONICAL.separator).collect();
    let last = tokens.len() - 1;
    let mut levels = Vec::with_capacity(tokens.len());

    for (index, token) in tokens.iter().enumerate() {
        let level = match *token {
            "*" => "+",
            "#" if index == last => "#",
            "#" => return Err(BrokerError::invalid_pattern(pattern, TRAILING_MULTI)),
            literal if literal.contains(['/', '+', '#']) => {
                return Err(BrokerError::invalid_pattern(
                    pattern,
                    "tokens must not contain '/', '+' or '#'",
                ))
            }
            literal => literal,
        };
        levels.push(level);
    }

    Ok(levels.join("/"))
}

/// MQTT topic for a published event name.
pub fn mqtt_topic(event: &str) -> Result<String> {
    if event.contains(['+', '#', '/']) || CANONICAL.is_wildcard(event) {
        return Err(BrokerError::invalid_pattern(
            event,
            "published event names must not contain wildcards or '/'",
        ));
    }
    Ok(event.replace(CANONICAL.separator, "/"))
}

/// NATS subject for a subscribe pattern. Only `#` needs rewriting.
pub fn nats_subject(pattern: &str) -> Result<String> {
    let tokens: Vec<&str> = pattern.split(CANONICAL.separator).collect();
    let last = tokens.len() - 1;

    let mut subject = Vec::with_capacity(tokens.len());
    for (index, token) in tokens.into_iter().enumerate() {
        match token {
            "#" if index == last => subject.push(">"),
            "#" => return Err(BrokerError::invalid_pattern(pattern, TRAILING_MULTI)),
            other => subject.push(other),
        }
    }
    Ok(subject.join("."))
}

/// Redis PSUBSCRIBE glob for a subscribe pattern.
///
/// Glob metacharacters inside literal tokens are escaped so only whole
/// `*` / `#` tokens act as wildcards.
pub fn redis_pattern(pattern: &str) -> String {
    pattern
        .split(CANONICAL.separator)
        .map(|token| match token {
            "*" | "#" => "*".to_string(),
            literal => escape_glob(literal),
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// AMQP topic-exchange binding key. The grammars coincide.
pub fn amqp_binding_key(pattern: &str) -> &str {
    pattern
}
