//! # Pattern Matcher
//!
//! Wildcard matching over separator-delimited tokens.
//!
//! The canonical grammar splits on `.`; `*` matches exactly one token and
//! `#` matches zero or more remaining tokens. `#` is terminal: once reached
//! the match succeeds without looking at later pattern tokens, so `a.#.b`
//! behaves exactly like `a.#`.
//!
//! The same algorithm with `/`, `+` and `#` gives MQTT filter matching.

/// Token separator and wildcard tokens of a topic grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grammar {
    pub separator: char,
    pub single: &'static str,
    pub multi: &'static str,
}

/// Dot-separated event names with `*` / `#`.
pub const CANONICAL: Grammar = Grammar {
    separator: '.',
    single: "*",
    multi: "#",
};

/// Slash-separated MQTT topics with `+` / `#`.
pub const MQTT: Grammar = Grammar {
    separator: '/',
    single: "+",
    multi: "#",
};

impl Grammar {
    /// Whether `pattern` matches the concrete `name`.
    pub fn matches(&self, pattern: &str, name: &str) -> bool {
        if pattern == name {
            return true;
        }
        let pattern: Vec<&str> = pattern.split(self.separator).collect();
        let name: Vec<&str> = name.split(self.separator).collect();
        self.match_tokens(&pattern, &name)
    }

    fn match_tokens(&self, pattern: &[&str], name: &[&str]) -> bool {
        match (pattern.split_first(), name.split_first()) {
            (None, _) => name.is_empty(),
            (Some((head, _)), _) if *head == self.multi => true,
            (Some(_), None) => false,
            (Some((head, pattern_rest)), Some((token, name_rest))) => {
                (*head == self.single || head == token) && self.match_tokens(pattern_rest, name_rest)
            }
        }
    }

    /// Whether `pattern` contains a wildcard token.
    pub fn is_wildcard(&self, pattern: &str) -> bool {
        pattern
            .split(self.separator)
            .any(|token| token == self.single || token == self.multi)
    }
}

/// Canonical-grammar match. See the module docs.
pub fn matches(pattern: &str, event: &str) -> bool {
    CANONICAL.matches(pattern, event)
}
