//! Versioned document store: append-only, hash-chained version history with
//! atomic writes and symlink-based "current version" indirection (spec §4.C).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::hashing::{sha256_hex, sha256_prefixed};
use crate::resolver::{ResolveError, Resolver};

/// Default maximum size, in bytes, of a single stored version file (spec §4.C.1).
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("content exceeds the maximum stored size")]
    TooLarge,
    #[error("a concurrent writer already claimed this version")]
    Conflict,
    #[error("stored frontmatter is corrupt: {0}")]
    Corrupt(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("version {0} has corrupt or missing frontmatter")]
    Corrupt(u64),
    #[error("chain mismatch at version {at_version}: expected {expected}, found {found}")]
    Mismatch {
        at_version: u64,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A document version as read back from disk: both the raw on-disk bytes
/// (needed for etags and chain hashing) and the stripped user body.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub version: u64,
    pub raw: Vec<u8>,
    pub body: Vec<u8>,
    pub archived: bool,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VersionInfo {
    pub version: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub version: u64,
    pub modified: SystemTime,
}

/// Store-managed YAML frontmatter prepended to every version file.
#[derive(Debug, Clone)]
struct StoredFrontMatter {
    version: u64,
    previous_hash: Option<String>,
    archived: bool,
}

/// Filesystem-backed implementation of the versioned store (spec §3, §4.C).
pub struct VersionedStore {
    resolver: Resolver,
    max_size: u64,
    /// Per-`dir/base` locks serializing racing writers on the same document
    /// (spec §4.C.4's concurrency note; §5's "per-dir/base mutex").
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VersionedStore {
    pub fn new(resolver: Resolver, max_size: u64) -> Self {
        Self {
            resolver,
            max_size,
            locks: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    async fn lock_for(&self, dir: &Path, base: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}/{}", dir.display(), base);
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// `get(path, version)` — spec §4.C.1.
    pub fn get(&self, path: &str, version: u64) -> Result<StoredVersion, StoreError> {
        let resolved = self.resolver.resolve(path).map_err(resolve_to_store)?;
        if resolved.is_dir() {
            return Err(StoreError::NotFound);
        }
        let (dir, base) = split_dir_base(&resolved);
        let vdir = versions_dir(&dir);
        if !vdir.is_dir() {
            // No versions/ sibling: refuse orphan flat files (spec §4.C.1).
            return Err(StoreError::NotFound);
        }

        let target_version = if version == 0 {
            current_version_number(&resolved)?
        } else {
            version
        };
        if target_version == 0 {
            return Err(StoreError::NotFound);
        }
        self.read_version_file(&dir, &base, target_version)
    }

    /// `list(path)` — spec §4.C.2.
    pub fn list(&self, path: &str) -> Result<Vec<ListEntry>, StoreError> {
        let resolved = self.resolver.resolve(path).map_err(resolve_to_store)?;
        if !resolved.is_dir() {
            return Err(StoreError::NotADirectory);
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == "versions" {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            entries.push(ListEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// `versions(path)` — spec §4.C.3. Newest first.
    pub fn versions(&self, path: &str) -> Result<Vec<VersionInfo>, StoreError> {
        let resolved = self.resolver.resolve(path).map_err(resolve_to_store)?;
        let (dir, base) = split_dir_base(&resolved);
        let mut out = self.read_versions_dir(&dir, &base)?;
        out.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(out)
    }

    fn read_versions_dir(&self, dir: &Path, base: &str) -> Result<Vec<VersionInfo>, StoreError> {
        let vdir = versions_dir(dir);
        if !vdir.is_dir() {
            return Err(StoreError::NotFound);
        }
        let prefix = format!("{base}.v");
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&vdir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num_str) = name.strip_prefix(&prefix) {
                if let Ok(n) = num_str.parse::<u64>() {
                    let modified = entry.metadata()?.modified()?;
                    out.push(VersionInfo {
                        version: n,
                        modified,
                    });
                }
            }
        }
        Ok(out)
    }

    /// `write(path, bodyBytes)` — spec §4.C.4.
    pub async fn write(
        &self,
        path: &str,
        body: &[u8],
        archived: bool,
    ) -> Result<WriteOutcome, StoreError> {
        let resolved = self.resolver.resolve(path).map_err(resolve_to_store)?;
        let (dir, base) = split_dir_base(&resolved);
        let _guard = self.lock_for(&dir, &base).await;

        let current = current_version_number(&resolved)?;
        let next = if current == 0 { 1 } else { current + 1 };

        let vdir = versions_dir(&dir);
        std::fs::create_dir_all(&vdir)?;
        set_dir_mode(&vdir)?;

        if next > 1 {
            let v1_path = version_file_path(&dir, &base, 1);
            if !v1_path.exists() {
                let flat_content = std::fs::read(&resolved)?;
                let migrated = build_stored_bytes(1, None, false, &flat_content);
                atomic_create(&v1_path, &migrated)?;
            }
        }

        let previous_hash = if next > 1 {
            let prev_raw = std::fs::read(version_file_path(&dir, &base, next - 1))?;
            Some(sha256_prefixed(&prev_raw))
        } else {
            None
        };

        let stored = build_stored_bytes(next, previous_hash.as_deref(), archived, body);
        if stored.len() as u64 > self.max_size {
            return Err(StoreError::TooLarge);
        }

        let target = version_file_path(&dir, &base, next);
        atomic_create(&target, &stored)?;

        let _ = std::fs::remove_file(&resolved);
        symlink(&target, &resolved)?;

        let modified = std::fs::metadata(&target)?.modified()?;
        Ok(WriteOutcome {
            version: next,
            modified,
        })
    }

    /// `archive(path)` — spec §4.C.6: a write of an empty body with `archived: true`.
    pub async fn archive(&self, path: &str) -> Result<WriteOutcome, StoreError> {
        self.write(path, &[], true).await
    }

    /// `verifyChain(path)` — spec §4.C.5.
    pub fn verify_chain(&self, path: &str) -> Result<(), ChainError> {
        let resolved = self.resolver.resolve(path).map_err(resolve_to_store)?;
        let (dir, base) = split_dir_base(&resolved);
        let mut vs = self.read_versions_dir(&dir, &base)?;
        vs.sort_by_key(|v| v.version);

        for pair in vs.windows(2) {
            let (prev, curr) = (pair[0].version, pair[1].version);
            let prev_raw = std::fs::read(version_file_path(&dir, &base, prev))?;
            let expected = sha256_prefixed(&prev_raw);

            let curr_raw = std::fs::read(version_file_path(&dir, &base, curr))?;
            let fm = parse_store_frontmatter(&curr_raw)
                .ok_or(ChainError::Corrupt(curr))?
                .0;
            let found = fm.previous_hash.unwrap_or_default();
            if found != expected {
                return Err(ChainError::Mismatch {
                    at_version: curr,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    fn read_version_file(&self, dir: &Path, base: &str, n: u64) -> Result<StoredVersion, StoreError> {
        let path = version_file_path(dir, base, n);
        let meta = std::fs::metadata(&path).map_err(|_| StoreError::NotFound)?;
        if meta.len() > self.max_size {
            return Err(StoreError::TooLarge);
        }
        let raw = std::fs::read(&path)?;
        let (fm, body_start) = parse_store_frontmatter(&raw)
            .ok_or_else(|| StoreError::Corrupt(format!("{base}.v{n} has no valid frontmatter")))?;
        let body = raw[body_start..].to_vec();
        Ok(StoredVersion {
            version: fm.version,
            raw,
            body,
            archived: fm.archived,
            modified: meta.modified()?,
        })
    }
}

fn resolve_to_store(_e: ResolveError) -> StoreError {
    StoreError::NotFound
}

fn split_dir_base(resolved: &Path) -> (PathBuf, String) {
    let dir = resolved.parent().unwrap_or(resolved).to_path_buf();
    let base = resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    (dir, base)
}

fn versions_dir(dir: &Path) -> PathBuf {
    dir.join("versions")
}

fn version_file_path(dir: &Path, base: &str, n: u64) -> PathBuf {
    versions_dir(dir).join(format!("{base}.v{n}"))
}

/// The "current" version number for a document, per spec §4.C.4: the target
/// of the current-pointer symlink if one exists, `1` if only an unmigrated
/// flat file is present, or `0` if nothing exists at all.
fn current_version_number(base_path: &Path) -> Result<u64, StoreError> {
    match std::fs::symlink_metadata(base_path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = std::fs::read_link(base_path)?;
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.rsplit_once(".v")
                .and_then(|(_, n)| n.parse::<u64>().ok())
                .ok_or_else(|| StoreError::Corrupt(format!("unparseable symlink target {name}")))
        }
        Ok(_) => Ok(1), // pre-existing flat file, not yet migrated into the chain
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn build_stored_bytes(version: u64, previous_hash: Option<&str>, archived: bool, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + body.len());
    out.extend_from_slice(b"---\n");
    out.extend_from_slice(format!("version: {version}\n").as_bytes());
    if let Some(hash) = previous_hash {
        out.extend_from_slice(format!("previous-hash: {hash}\n").as_bytes());
    }
    if archived {
        out.extend_from_slice(b"archived: true\n");
    }
    out.extend_from_slice(b"---\n");
    out.extend_from_slice(body);
    out
}

/// Parses the store-managed frontmatter block, returning it plus the byte
/// offset where the user body begins. `None` if the block is missing or
/// malformed.
fn parse_store_frontmatter(raw: &[u8]) -> Option<(StoredFrontMatter, usize)> {
    if !raw.starts_with(b"---\n") {
        return None;
    }
    let mut pos = 4usize;
    let mut version = None;
    let mut previous_hash = None;
    let mut archived = false;

    loop {
        let line_end = raw[pos..].iter().position(|&b| b == b'\n')? + pos;
        let line = &raw[pos..line_end];
        if line == b"---" {
            pos = line_end + 1;
            break;
        }
        let line_str = std::str::from_utf8(line).ok()?;
        let (key, value) = line_str.split_once(':')?;
        match key.trim() {
            "version" => version = value.trim().parse::<u64>().ok(),
            "previous-hash" => previous_hash = Some(value.trim().to_string()),
            "archived" => archived = value.trim() == "true",
            _ => {}
        }
        pos = line_end + 1;
    }

    Some((
        StoredFrontMatter {
            version: version?,
            previous_hash,
            archived,
        },
        pos,
    ))
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_path_for(target: &Path) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    dir.join(format!(".tmp-{}-{nanos}-{n}", std::process::id()))
}

/// Writes `bytes` to a temp file, then atomically claims `target` via a hard
/// link (which fails with `AlreadyExists` if `target` already exists —
/// `rename` alone doesn't give that guarantee on platforms where it silently
/// overwrites, per spec §9's design note on the immutability guard).
fn atomic_create(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path_for(target);
    std::fs::write(&tmp, bytes)?;
    set_file_mode(&tmp)?;
    let result = std::fs::hard_link(&tmp, target);
    let _ = std::fs::remove_file(&tmp);
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::Conflict),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Version files are written 0644, `versions/` directories 0755 (spec §6.5).
#[cfg(unix)]
fn set_file_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
