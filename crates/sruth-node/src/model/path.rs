//! `ArchivePath`: a canonicalized, slash-separated pathname relative to an
//! archive root.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Directory name reserved for archive-internal bookkeeping. Never
/// distributed, never walked, purged (except the deletion queue) at startup.
pub const HIDDEN_DIR: &str = ".sruth";

/// Reserved subtree for administrative files with infinite TTL (tracker
/// topology snapshots and the like).
pub const ADMIN_DIR: &str = "SRUTH";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchivePath(String);

impl ArchivePath {
    /// Validates and canonicalizes `raw` into an `ArchivePath`.
    ///
    /// Rejects absolute paths, `.`/`..` segments, empty segments, and paths
    /// that fall under the hidden `.sruth` prefix.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, Error> {
        let raw = raw.as_ref();
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        let segments: Vec<&str> = raw.split(['/', '\\']).collect();
        if segments.is_empty() {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        for seg in &segments {
            if seg.is_empty() || *seg == "." || *seg == ".." {
                return Err(Error::InvalidPath(raw.to_string()));
            }
        }
        if segments[0] == HIDDEN_DIR {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        Ok(Self(segments.join("/")))
    }

    pub fn is_admin(&self) -> bool {
        self.0.split('/').next() == Some(ADMIN_DIR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the visible, complete copy under `root`.
    pub fn visible_path(&self, root: &std::path::Path) -> std::path::PathBuf {
        root.join(&self.0)
    }

    /// Path of the hidden, partial staging copy under `root`.
    pub fn hidden_path(&self, root: &std::path::Path) -> std::path::PathBuf {
        root.join(HIDDEN_DIR).join(&self.0)
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
