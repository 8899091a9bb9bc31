//! Cache registry: on-disk descriptors for each page format of a dataset.
//!
//! Every `(matrix identity, format suffix, path prefix)` triple maps to one
//! cache file. The descriptor's `written` flag is the single source of truth
//! for cache-hit versus cache-miss decisions: it starts false, is flipped
//! true by the owning page source once a full write pass completed, and is
//! only ever reversed by erasing the entry and creating a fresh one. Erase
//! bumps a per-key generation that is baked into the file name, so a reader
//! still holding the stale descriptor can never observe the rewrite.
//!
//! Registry entries live exactly as long as the owning dataset; identity is
//! an explicit generation-counter key, not a language identity mechanism.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// File-name suffix for the primary row-page cache.
pub const ROW_PAGE_SUFFIX: &str = ".row.page";
/// File-name suffix for the column-page cache.
pub const COLUMN_PAGE_SUFFIX: &str = ".col.page";
/// File-name suffix for the sorted-column-page cache.
pub const SORTED_COLUMN_PAGE_SUFFIX: &str = ".sorted.col.page";
/// File-name suffix for the histogram-index-page cache.
pub const HISTOGRAM_PAGE_SUFFIX: &str = ".hist.page";
/// File-name suffix for the dataset metadata JSON.
pub const META_SUFFIX: &str = ".meta.json";

/// Opaque identity of one in-memory dataset instance.
///
/// Allocated from a process-wide counter so two datasets sharing a cache
/// prefix never collide on file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixId(u64);

impl MatrixId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// One page-format cache file: its path and whether a full write pass has
/// completed. `written` is monotone false→true for the lifetime of the
/// descriptor; invalidation goes through [`CacheRegistry::erase`] instead.
pub struct CacheEntry {
    path: PathBuf,
    written: AtomicBool,
}

impl CacheEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Flip the written flag. Called only by the owning page source after a
    /// complete pass has been persisted; the registry never calls this.
    pub fn mark_written(&self) {
        self.written.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "page cache fully written");
    }
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct CacheKey {
    id: MatrixId,
    suffix: &'static str,
    prefix: PathBuf,
}

/// Map from cache keys to live descriptors, owned by one dataset.
#[derive(Default)]
pub struct CacheRegistry {
    entries: HashMap<CacheKey, Arc<CacheEntry>>,
    /// Erase count per key; baked into the file name of the next descriptor.
    generations: HashMap<CacheKey, u32>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing descriptor for the key, or allocate a fresh one
    /// (path derived from prefix, identity, generation, and suffix) with
    /// `written = false`.
    pub fn get_or_create(
        &mut self,
        id: MatrixId,
        suffix: &'static str,
        prefix: &Path,
    ) -> Arc<CacheEntry> {
        let key = CacheKey {
            id,
            suffix,
            prefix: prefix.to_path_buf(),
        };
        if let Some(entry) = self.entries.get(&key) {
            return Arc::clone(entry);
        }
        let generation = self.generations.get(&key).copied().unwrap_or(0);
        let path = cache_file_path(prefix, id, generation, suffix);
        debug!(path = %path.display(), "allocated cache entry");
        let entry = Arc::new(CacheEntry {
            path,
            written: AtomicBool::new(false),
        });
        self.entries.insert(key, Arc::clone(&entry));
        entry
    }

    /// Drop the descriptor for the key so the next [`get_or_create`] starts
    /// over with a fresh file. Used when invalidating a stale histogram
    /// cache; this is normal control flow, not an error path.
    pub fn erase(&mut self, id: MatrixId, suffix: &'static str, prefix: &Path) {
        let key = CacheKey {
            id,
            suffix,
            prefix: prefix.to_path_buf(),
        };
        if let Some(entry) = self.entries.remove(&key) {
            debug!(path = %entry.path.display(), "erased cache entry");
            // Best-effort removal; a reader still holding the descriptor
            // keeps its mapping alive until it drops.
            let _ = std::fs::remove_file(&entry.path);
            *self.generations.entry(key).or_insert(0) += 1;
        }
    }

    /// Paths of all live descriptors; used for best-effort file cleanup
    /// when the owning dataset is dropped.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.values().map(|e| e.path())
    }
}

pub(crate) fn cache_file_path(
    prefix: &Path,
    id: MatrixId,
    generation: u32,
    suffix: &str,
) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("-{id}"));
    if generation > 0 {
        name.push(format!(".g{generation}"));
    }
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let mut reg = CacheRegistry::new();
        let id = MatrixId::next();
        let prefix = Path::new("/tmp/cache");
        let a = reg.get_or_create(id, ROW_PAGE_SUFFIX, prefix);
        let b = reg.get_or_create(id, ROW_PAGE_SUFFIX, prefix);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_written());
    }

    #[test]
    fn distinct_formats_get_distinct_paths() {
        let mut reg = CacheRegistry::new();
        let id = MatrixId::next();
        let prefix = Path::new("/tmp/cache");
        let row = reg.get_or_create(id, ROW_PAGE_SUFFIX, prefix);
        let col = reg.get_or_create(id, COLUMN_PAGE_SUFFIX, prefix);
        assert_ne!(row.path(), col.path());
    }

    #[test]
    fn erase_produces_fresh_descriptor_and_path() {
        let mut reg = CacheRegistry::new();
        let id = MatrixId::next();
        let prefix = Path::new("/tmp/cache");
        let old = reg.get_or_create(id, HISTOGRAM_PAGE_SUFFIX, prefix);
        old.mark_written();

        reg.erase(id, HISTOGRAM_PAGE_SUFFIX, prefix);
        let fresh = reg.get_or_create(id, HISTOGRAM_PAGE_SUFFIX, prefix);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!fresh.is_written());
        assert_ne!(old.path(), fresh.path());
        // The stale descriptor keeps reporting its own state untouched.
        assert!(old.is_written());
    }

    #[test]
    fn two_datasets_sharing_a_prefix_do_not_collide() {
        let mut reg = CacheRegistry::new();
        let prefix = Path::new("/tmp/cache");
        let a = reg.get_or_create(MatrixId::next(), ROW_PAGE_SUFFIX, prefix);
        let b = reg.get_or_create(MatrixId::next(), ROW_PAGE_SUFFIX, prefix);
        assert_ne!(a.path(), b.path());
    }
}
