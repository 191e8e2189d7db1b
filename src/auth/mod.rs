//! Capability token authorizer: SHA-256-hashed tokens scoped by glob path
//! patterns and operation sets (spec §4.D).

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use serde::Deserialize;
use thiserror::Error;

use crate::hashing::sha256_prefixed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Publish,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token supplied")]
    NoToken,
    #[error("token is invalid or unknown")]
    Invalid,
    #[error("token has expired")]
    Expired,
    #[error("token is not permitted for this operation or path")]
    NotPermitted,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o error reading tokens file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed tokens file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("duplicate token hash across labels \"{first}\" and \"{second}\"")]
    DuplicateHash { first: String, second: String },
    #[error("invalid glob pattern \"{pattern}\" in label \"{label}\": {reason}")]
    BadGlob {
        label: String,
        pattern: String,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct TokensFile {
    #[serde(default)]
    tokens: HashMap<String, TokenRecordRaw>,
}

#[derive(Debug, Deserialize)]
struct TokenRecordRaw {
    hash: String,
    paths: Vec<String>,
    operations: Vec<Operation>,
    expires: Option<DateTime<Utc>>,
}

/// A loaded, glob-compiled token record (spec §6.4).
struct TokenRecord {
    label: String,
    matchers: Vec<GlobMatcher>,
    operations: Vec<Operation>,
    expires: Option<DateTime<Utc>>,
}

impl TokenRecord {
    fn matches_path(&self, path: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(path))
    }
}

/// The in-memory token table: hash digest → record (spec §4.D).
pub struct TokenTable {
    by_hash: HashMap<String, TokenRecord>,
}

impl TokenTable {
    /// An empty table: every token is `invalid`. Used when no tokens file is
    /// configured, matching the spec's "absent tokens path" startup case.
    pub fn empty() -> Self {
        Self {
            by_hash: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path)?;
        let parsed: TokensFile = toml::from_str(&text)?;

        let mut by_hash: HashMap<String, TokenRecord> = HashMap::new();
        for (label, raw) in parsed.tokens {
            if let Some(existing) = by_hash.get(&raw.hash) {
                return Err(LoadError::DuplicateHash {
                    first: existing.label.clone(),
                    second: label,
                });
            }
            let matchers = raw
                .paths
                .iter()
                .map(|pattern| compile_pattern(&label, pattern))
                .collect::<Result<Vec<_>, _>>()?;
            by_hash.insert(
                raw.hash.clone(),
                TokenRecord {
                    label,
                    matchers,
                    operations: raw.operations,
                    expires: raw.expires,
                },
            );
        }
        Ok(Self { by_hash })
    }

    /// `Authorize(raw, path, op)` — spec §4.D.
    pub fn authorize(&self, raw_token: &str, path: &str, op: Operation) -> Result<(), AuthError> {
        if raw_token.is_empty() {
            return Err(AuthError::NoToken);
        }
        let digest = sha256_prefixed(raw_token.as_bytes());
        let record = self.by_hash.get(&digest).ok_or(AuthError::Invalid)?;

        if let Some(expires) = record.expires {
            if Utc::now() > expires {
                return Err(AuthError::Expired);
            }
        }
        if !record.operations.contains(&op) {
            return Err(AuthError::NotPermitted);
        }
        if !record.matches_path(path) {
            return Err(AuthError::NotPermitted);
        }
        Ok(())
    }
}

/// Validates and compiles one glob pattern per spec §4.D's custom `**`
/// discipline: at most one `**`, and only as a full, slash-delimited
/// segment (`/**` trailing or `/**/ ` infix) — never a bare or partial one.
fn compile_pattern(label: &str, pattern: &str) -> Result<GlobMatcher, LoadError> {
    let double_star_count = pattern.matches("**").count();
    if double_star_count > 1 {
        return Err(LoadError::BadGlob {
            label: label.to_string(),
            pattern: pattern.to_string(),
            reason: "at most one '**' is allowed per pattern".to_string(),
        });
    }
    if let Some(idx) = pattern.find("**") {
        let before_ok = idx == 0 || pattern.as_bytes()[idx - 1] == b'/';
        let after = idx + 2;
        let after_ok = after == pattern.len() || pattern.as_bytes()[after] == b'/';
        if !before_ok || !after_ok {
            return Err(LoadError::BadGlob {
                label: label.to_string(),
                pattern: pattern.to_string(),
                reason: "'**' must be slash-delimited (trailing '/**' or infix '/**/')".to_string(),
            });
        }
    }

    // `literal_separator` gives gitignore-style semantics: a single `*` or
    // `?` never crosses a `/`, while `**` (already validated above) spans
    // any number of segments — exactly the grammar spec §4.D specifies.
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|source| LoadError::BadGlob {
            label: label.to_string(),
            pattern: pattern.to_string(),
            reason: source.to_string(),
        })
}
