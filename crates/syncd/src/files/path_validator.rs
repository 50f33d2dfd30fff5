//! Containment checks for paths requested relative to the data root.
//!
//! Validation happens in three stages:
//!
//! 1. UNC-style paths (`\\server\share`, `//server/share`) are rejected
//!    syntactically, both as given and after separator normalization.
//! 2. The path is normalized lexically against the root; absolute paths and
//!    anything that climbs out of the root with `..` are rejected.
//! 3. The real (symlink-resolved) location is compared against the root's
//!    real location. Lexical checks alone are defeated by an in-root symlink
//!    that points outside, so this stage is mandatory. When the path does
//!    not exist yet, its deepest existing ancestor is checked instead.
//!
//! Any resolution error fails closed.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during path validation.
#[derive(Debug, Error)]
pub enum PathError {
    /// UNC-style network path.
    #[error("UNC paths are not allowed: {0}")]
    Unc(String),

    /// Absolute path or path with a drive prefix.
    #[error("absolute paths are not allowed: {0}")]
    Absolute(PathBuf),

    /// The path does not name anything below the root.
    #[error("path does not name a file inside the data root: {0}")]
    Empty(PathBuf),

    /// `..` components climb out of the root.
    #[error("path traversal detected: {0}")]
    Traversal(PathBuf),

    /// A symlink resolves outside the root.
    #[error("symlink points outside the data root: {0}")]
    SymlinkEscape(PathBuf),

    /// The root or the path could not be resolved.
    #[error("failed to resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn is_unc(raw: &str) -> bool {
    let normalized = raw.replace('\\', "/");
    raw.starts_with("\\\\") || raw.starts_with("//") || normalized.starts_with("//")
}

/// Lexically normalize `path`, refusing anything that leaves its base.
fn normalize_relative(path: &Path) -> Result<PathBuf, PathError> {
    let mut normalized = PathBuf::new();
    let mut depth = 0usize;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(PathError::Absolute(path.to_path_buf()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(PathError::Traversal(path.to_path_buf()));
                }
                normalized.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                // A backslash is a plain character on Unix but a separator
                // for anyone opening the same file from Windows.
                let part_str = part.to_string_lossy();
                if part_str.contains('\\') {
                    let rewritten = PathBuf::from(part_str.replace('\\', "/"));
                    let nested = normalize_relative(&rewritten)?;
                    depth += nested.components().count();
                    normalized.push(nested);
                } else {
                    normalized.push(part);
                    depth += 1;
                }
            }
        }
    }

    if depth == 0 {
        return Err(PathError::Empty(path.to_path_buf()));
    }
    Ok(normalized)
}

/// Find the deepest ancestor of `path` (inclusive) that exists.
fn deepest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| fs::symlink_metadata(p).is_ok())
}

/// Validates paths against a fixed data root.
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: PathBuf,
}

impl PathValidator {
    /// Create a validator for `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is safe to open below the root.
    pub fn validate(&self, path: impl AsRef<Path>) -> bool {
        match self.resolve(path.as_ref()) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected path");
                false
            }
        }
    }

    /// Resolve `path` to its absolute location below the root.
    ///
    /// The returned path is the lexical join of root and the normalized
    /// relative path, so callers keep operating on the name they asked for
    /// rather than on a symlink target.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, PathError> {
        let raw = path.to_string_lossy();
        if is_unc(&raw) {
            return Err(PathError::Unc(raw.into_owned()));
        }
        if path.is_absolute() || path.has_root() {
            return Err(PathError::Absolute(path.to_path_buf()));
        }

        let relative = normalize_relative(path)?;
        if is_unc(&relative.to_string_lossy()) {
            return Err(PathError::Unc(raw.into_owned()));
        }
        let joined = self.root.join(&relative);

        let real_root = fs::canonicalize(&self.root).map_err(|source| PathError::Resolve {
            path: self.root.clone(),
            source,
        })?;

        let ancestor = deepest_existing(&joined).ok_or_else(|| PathError::Resolve {
            path: joined.clone(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;
        let real_ancestor = fs::canonicalize(ancestor).map_err(|source| PathError::Resolve {
            path: ancestor.to_path_buf(),
            source,
        })?;

        if !real_ancestor.starts_with(&real_root) {
            return Err(PathError::SymlinkEscape(path.to_path_buf()));
        }
        // The ancestor may be the root itself when nothing below it exists yet;
        // that is fine because the remaining components were checked lexically.
        Ok(joined)
    }
}

/// Check `path` against `root` in one call.
pub fn validate_path(path: impl AsRef<Path>, root: impl AsRef<Path>) -> bool {
    PathValidator::new(root.as_ref()).validate(path)
}
