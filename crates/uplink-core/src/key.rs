//! Storage key derivation
//!
//! Keys are `[prefix/]YYYY-MM-DD/<sanitized base name>`. The directory part of
//! the client's path is deliberately dropped.

use std::fmt;

use chrono::{DateTime, Utc};

/// Stand-in for base names that carry no usable file name
pub const PLACEHOLDER_FILENAME: &str = "unknown";

/// Final path element, with the usual base-name conventions:
/// trailing separators are ignored, `""` becomes `"."` and a path made only of
/// separators becomes `"/"`.
pub fn base_name(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }

    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Replace spaces and `..` sequences with underscores
pub fn sanitize_filename(name: &str) -> String {
    name.replace(' ', "_").replace("..", "_")
}

/// Object key under which a completed upload is stored
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Derive the key for `path` uploaded at `now`.
    pub fn derive(prefix: Option<&str>, now: DateTime<Utc>, path: &str) -> Self {
        let date = now.format("%Y-%m-%d");

        let filename = match base_name(path) {
            "" | "." | "/" => PLACEHOLDER_FILENAME.to_string(),
            name => sanitize_filename(name),
        };

        let prefix = prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty());

        match prefix {
            Some(prefix) => Self(format!("{}/{}/{}", prefix, date, filename)),
            None => Self(format!("{}/{}", date, filename)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The file name segment (everything after the date partition)
    pub fn filename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
