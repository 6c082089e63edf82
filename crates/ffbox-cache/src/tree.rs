//! The cache tree: `<real root>/<mount-relative path>` holding sparse
//! placeholders and fetched bytes.
//!
//! Completion state lives in the `user.is_complete` extended attribute so it
//! survives remounts; a process-local set of known-complete paths shadows
//! the xattr as a fast path. The set may be stale for paths completed by an
//! earlier process; the xattr is authoritative.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashSet;
use filetime::FileTime;
use tracing::warn;

/// Marker: local bytes (file) or children (directory) fully mirror the
/// remote state observed at fetch time. Value is `"1"` or absent.
pub const XATTR_COMPLETE: &str = "user.is_complete";

/// Opaque remote locator set on manifest-mode placeholders.
pub const XATTR_URL: &str = "user.url";

pub struct CacheTree {
    root: PathBuf,
    complete: DashSet<String>,
}

impl CacheTree {
    pub fn new(root: PathBuf) -> CacheTree {
        CacheTree {
            root,
            complete: DashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path for a mount-relative path (`""` names the root).
    pub fn full_path(&self, rel: &str) -> PathBuf {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Eagerly create a directory entry (and any missing parents).
    pub fn ensure_dir(&self, rel: &str) -> io::Result<PathBuf> {
        let path = self.full_path(rel);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Create a sparse placeholder sized to the remote object. Existing
    /// entries are left untouched, so locally diverged files survive.
    pub fn ensure_placeholder(
        &self,
        rel: &str,
        size: u64,
        mtime: Option<SystemTime>,
        url: Option<&str>,
    ) -> io::Result<()> {
        let path = self.full_path(rel);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        file.set_len(size)?;
        drop(file);
        if let Some(url) = url {
            self.write_xattr(&path, XATTR_URL, url.as_bytes());
        }
        if let Some(mtime) = mtime {
            let ft = FileTime::from_system_time(mtime);
            filetime::set_file_times(&path, ft, ft)?;
        }
        Ok(())
    }

    /// Fast-path set first, xattr second. A positive xattr hit is promoted
    /// into the set.
    pub fn is_complete(&self, rel: &str) -> bool {
        if self.complete.contains(rel) {
            return true;
        }
        let path = self.full_path(rel);
        match xattr::get(&path, XATTR_COMPLETE) {
            Ok(Some(value)) if value == b"1" => {
                self.complete.insert(rel.to_string());
                true
            }
            _ => false,
        }
    }

    /// Record completion. The xattr write is the durable marker; if the
    /// filesystem rejects it the in-process set still covers this mount's
    /// lifetime and a remount re-fetches.
    pub fn mark_complete(&self, rel: &str) {
        let path = self.full_path(rel);
        self.write_xattr(&path, XATTR_COMPLETE, b"1");
        self.complete.insert(rel.to_string());
    }

    /// Drop any completion/locator state for a path (unlink, rename).
    pub fn forget(&self, rel: &str) {
        self.complete.remove(rel);
    }

    pub fn url(&self, rel: &str) -> Option<String> {
        let path = self.full_path(rel);
        match xattr::get(&path, XATTR_URL) {
            Ok(Some(value)) => String::from_utf8(value).ok(),
            _ => None,
        }
    }

    pub fn set_url(&self, rel: &str, url: &str) {
        let path = self.full_path(rel);
        self.write_xattr(&path, XATTR_URL, url.as_bytes());
    }

    fn write_xattr(&self, path: &Path, name: &str, value: &[u8]) {
        if let Err(e) = xattr::set(path, name, value) {
            warn!(path = %path.display(), xattr = name, "xattr write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// User xattrs are unsupported on some test filesystems (tmpfs on older
    /// kernels); gate the xattr-dependent assertions on a probe.
    fn xattrs_supported(dir: &Path) -> bool {
        let probe = dir.join(".xattr_probe");
        std::fs::write(&probe, b"").unwrap();
        xattr::set(&probe, "user.probe", b"1").is_ok()
    }

    #[test]
    fn placeholder_is_sized_and_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let tree = CacheTree::new(dir.path().to_path_buf());

        tree.ensure_placeholder("a/b/model.bin", 4096, None, None)
            .unwrap();
        let meta = std::fs::metadata(tree.full_path("a/b/model.bin")).unwrap();
        assert_eq!(meta.len(), 4096);

        // idempotent: an existing entry is untouched
        std::fs::write(tree.full_path("a/b/model.bin"), b"local").unwrap();
        tree.ensure_placeholder("a/b/model.bin", 4096, None, None)
            .unwrap();
        assert_eq!(
            std::fs::read(tree.full_path("a/b/model.bin")).unwrap(),
            b"local"
        );
    }

    #[test]
    fn placeholder_mtime_is_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let tree = CacheTree::new(dir.path().to_path_buf());

        let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        tree.ensure_placeholder("f", 10, Some(mtime), None).unwrap();
        let meta = std::fs::metadata(tree.full_path("f")).unwrap();
        assert_eq!(meta.modified().unwrap(), mtime);
    }

    #[test]
    fn completion_marks() {
        let dir = tempfile::tempdir().unwrap();
        let tree = CacheTree::new(dir.path().to_path_buf());
        tree.ensure_dir("d").unwrap();

        assert!(!tree.is_complete("d"));
        tree.mark_complete("d");
        assert!(tree.is_complete("d"));

        if xattrs_supported(dir.path()) {
            // a fresh tree over the same root sees the durable marker
            let fresh = CacheTree::new(dir.path().to_path_buf());
            assert!(fresh.is_complete("d"));
        }

        tree.forget("d");
        if !xattrs_supported(dir.path()) {
            assert!(!tree.is_complete("d"));
        }
    }

    #[test]
    fn url_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let tree = CacheTree::new(dir.path().to_path_buf());
        tree.ensure_placeholder("x", 1, None, Some("/src/x")).unwrap();
        assert_eq!(tree.url("x").as_deref(), Some("/src/x"));
        tree.set_url("x", "s3://bkt/x");
        assert_eq!(tree.url("x").as_deref(), Some("s3://bkt/x"));
    }

    #[test]
    fn root_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tree = CacheTree::new(dir.path().to_path_buf());
        assert_eq!(tree.full_path(""), dir.path());
        assert_eq!(tree.full_path("/a/b"), dir.path().join("a/b"));
    }
}
