//! Redis-style glob patterns for bulk key deletion
//!
//! Supported syntax: `*` (any run of characters), `?` (exactly one
//! character), `[abc]`, `[a-z]`, `[^a]` / `[!a]` and `\` to escape the next
//! character. The compiled matcher is anchored on both ends and always
//! includes the store namespace, so a pattern can never reach a key outside
//! it.

use crate::error::{CacheError, CacheResult};
use regex::Regex;

/// A compiled glob, anchored inside one namespace
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile `pattern` for keys stored under `namespace`.
    pub fn compile(namespace: &str, pattern: &str) -> CacheResult<Self> {
        let invalid = |reason: &str| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut expr = String::with_capacity(pattern.len() * 2 + namespace.len() + 8);
        expr.push_str("(?s)^");
        expr.push_str(&regex::escape(namespace));

        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| invalid("dangling escape"))?;
                    push_literal(&mut expr, escaped);
                }
                '[' => {
                    let class = read_class(&mut chars)
                        .ok_or_else(|| invalid("unclosed character class"))?;
                    if class.is_empty() {
                        return Err(invalid("empty character class"));
                    }
                    expr.push_str(&class);
                }
                other => push_literal(&mut expr, other),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether a full (namespaced) key matches.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The glob as given by the caller.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn push_literal(expr: &mut String, c: char) {
    let mut buf = [0u8; 4];
    expr.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

/// Translate the body of a `[...]` class. Returns `None` when the closing
/// bracket is missing and an empty string for `[]`.
fn read_class(chars: &mut std::str::Chars<'_>) -> Option<String> {
    let mut body = String::new();
    let mut negated = false;
    let mut first = true;

    loop {
        let c = chars.next()?;
        match c {
            ']' => break,
            '^' | '!' if first => negated = true,
            '\\' => {
                let escaped = chars.next()?;
                if !escaped.is_alphanumeric() {
                    body.push('\\');
                }
                body.push(escaped);
            }
            '-' => body.push('-'),
            '[' | '&' | '~' | '^' => {
                body.push('\\');
                body.push(c);
            }
            other => body.push(other),
        }
        first = false;
    }

    if body.is_empty() {
        return Some(String::new());
    }

    Some(if negated {
        format!("[^{body}]")
    } else {
        format!("[{body}]")
    })
}
