//! Key prefixing and wildcard pattern matching.
//!
//! Every key that leaves the process is namespaced with a deployment-unique
//! prefix; every key that comes back is stripped before callers see it. The
//! pattern matcher accepts `*` as "any run of characters" and treats all
//! other characters literally.

/// Canonical key prefixing for a single deployment/environment.
///
/// Prefixing is idempotent: a key that already carries the prefix is
/// returned unchanged, so layered call paths cannot double-prefix.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix, verbatim.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Namespace a key. Idempotent.
    #[must_use]
    pub fn prefixed(&self, key: &str) -> String {
        if key.starts_with(&self.prefix) {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Strip the prefix from a key, if present.
    #[must_use]
    pub fn unprefixed<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }
}

/// A compiled key pattern where `*` matches any run of characters
/// (including the empty run) and every other character is literal.
///
/// Compile once, match many: [`KeyPattern::compile`] splits the pattern into
/// literal runs so matching is a linear scan with no per-call allocation.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    parts: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
    has_wildcard: bool,
}

impl KeyPattern {
    #[must_use]
    pub fn compile(pattern: &str) -> Self {
        let has_wildcard = pattern.contains('*');
        Self {
            raw: pattern.to_string(),
            parts: pattern
                .split('*')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            anchored_start: !pattern.starts_with('*'),
            anchored_end: !pattern.ends_with('*'),
            has_wildcard,
        }
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Test a key against the pattern.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if !self.has_wildcard {
            return key == self.raw;
        }

        let mut remaining = key;
        let mut parts: &[String] = &self.parts;

        if self.anchored_start {
            let Some((first, rest)) = parts.split_first() else {
                return true;
            };
            match remaining.strip_prefix(first.as_str()) {
                Some(r) => {
                    remaining = r;
                    parts = rest;
                }
                None => return false,
            }
        }

        if self.anchored_end {
            if let Some((last, rest)) = parts.split_last() {
                match remaining.strip_suffix(last.as_str()) {
                    Some(r) => {
                        remaining = r;
                        parts = rest;
                    }
                    None => return false,
                }
            }
        }

        // Middle runs must appear in order; greedy left-to-right scan.
        for part in parts {
            match remaining.find(part.as_str()) {
                Some(idx) => remaining = &remaining[idx + part.len()..],
                None => return false,
            }
        }
        true
    }
}
