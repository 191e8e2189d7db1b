//! Path resolver: maps a request path onto the content root with
//! symlink-aware containment (spec §4.B).

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("not found")]
    NotFound,
}

/// Resolves a content root once at startup (and again on demand); callers
/// may hold this across many requests or recompute it per call, per spec.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
}

impl Resolver {
    /// Canonicalizes `root` once. `root` must already exist and be a directory.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        let canonical = std::fs::canonicalize(root)?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically cleans `path` (collapsing `.`, `..`, and duplicate `/`),
    /// joins it under the content root, canonicalizes as far as the
    /// filesystem allows, and checks containment. Returns the resolved
    /// absolute path, which is guaranteed to equal the root or lie strictly
    /// beneath it.
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, ResolveError> {
        let cleaned = lexically_clean(request_path);
        let joined = self.root.join(cleaned.trim_start_matches('/'));

        let canonical = canonicalize_best_effort(&joined).ok_or(ResolveError::NotFound)?;

        if canonical == self.root {
            return Ok(canonical);
        }
        let mut root_with_sep = self.root.clone().into_os_string();
        root_with_sep.push(std::path::MAIN_SEPARATOR.to_string());
        if canonical.as_os_str().to_string_lossy().starts_with(
            &*root_with_sep.to_string_lossy(),
        ) {
            Ok(canonical)
        } else {
            Err(ResolveError::NotFound)
        }
    }
}

/// Resolves symlinks in `path` if it exists; if it doesn't (the write case),
/// canonicalizes its parent instead and reattaches the final component, so a
/// not-yet-created file still gets a containment-checkable absolute path.
fn canonicalize_best_effort(path: &Path) -> Option<PathBuf> {
    if let Ok(canon) = std::fs::canonicalize(path) {
        return Some(canon);
    }
    let parent = path.parent()?;
    let file_name = path.file_name()?;
    let canon_parent = std::fs::canonicalize(parent).ok()?;
    Some(canon_parent.join(file_name))
}

/// Collapses `.`, `..`, and repeated separators without touching the
/// filesystem. Leading `..` components that would escape the root are
/// simply dropped — the later containment check is the real defense, this
/// is just defense-in-depth (spec §4.B).
fn lexically_clean(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn lexically_clean_collapses_dot_dot_and_duplicate_slashes() {
        assert_eq!(lexically_clean("/a//b/../c"), "a/c");
        assert_eq!(lexically_clean("/../../etc/passwd"), "etc/passwd");
        assert_eq!(lexically_clean("/./a/./b"), "a/b");
    }

    #[test]
    fn resolves_path_within_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/guide.md"), b"hi").unwrap();

        let resolver = Resolver::new(dir.path()).unwrap();
        let resolved = resolver.resolve("/docs/guide.md").unwrap();
        assert!(resolved.starts_with(resolver.root()));
    }

    #[test]
    fn resolves_nonexistent_write_target_via_parent() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/versions")).unwrap();

        let resolver = Resolver::new(dir.path()).unwrap();
        let resolved = resolver.resolve("/docs/versions/new.md.v1").unwrap();
        assert!(resolved.starts_with(resolver.root()));
    }

    #[test]
    fn rejects_dot_dot_traversal_outside_root() {
        let dir = tempdir().unwrap();
        let resolver = Resolver::new(dir.path()).unwrap();
        // Lexical cleaning alone can't escape; this must still land inside.
        let resolved = resolver.resolve("/../../../../etc/passwd");
        assert!(resolved.is_ok());
        assert!(resolved.unwrap().starts_with(resolver.root()));
    }

    #[test]
    fn rejects_symlink_escape() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"TOP SECRET").unwrap();
        symlink(outside.path().join("secret"), dir.path().join("evil.md")).unwrap();

        let resolver = Resolver::new(dir.path()).unwrap();
        assert_eq!(resolver.resolve("/evil.md"), Err(ResolveError::NotFound));
    }
}
