//! The `head/list/get/get_range/put/download` surface used by every other
//! component. Transient failures are retried by the operator's retry layer;
//! a final failure surfaces as `StoreError::Io`. NotFound is distinct and
//! never retried.

use std::path::Path;
use std::time::SystemTime;

use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use thiserror::Error;
use tracing::debug;

use crate::operator::build_operator;
use crate::source::Source;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage I/O: {0}")]
    Io(#[source] opendal::Error),

    #[error("local I/O: {0}")]
    Local(#[from] std::io::Error),
}

fn classify(key: &str, err: opendal::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

/// Size and mtime of a remote object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// One file reported by a delimiter-style listing. `name` is a basename.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// A delimiter-style directory listing: immediate subdirectories and files.
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    pub dirs: Vec<String>,
    pub files: Vec<ObjectEntry>,
}

/// Object-store client bound to one mount source.
#[derive(Clone)]
pub struct ObjectStore {
    op: Operator,
    source: Source,
}

impl ObjectStore {
    pub fn open(source: Source) -> anyhow::Result<ObjectStore> {
        let op = build_operator(&source)?;
        Ok(ObjectStore { op, source })
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Object key for a mount-relative path.
    pub fn key(&self, rel: &str) -> String {
        self.source.key(rel)
    }

    pub async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        let meta = self.op.stat(key).await.map_err(|e| classify(key, e))?;
        Ok(ObjectMeta {
            size: meta.content_length(),
            mtime: meta.last_modified().map(SystemTime::from),
        })
    }

    /// List the immediate children of a directory key. A missing prefix
    /// yields an empty listing (S3 semantics). The underlying lister
    /// paginates internally, so the result is never truncated.
    pub async fn list_dir(&self, key: &str) -> StoreResult<DirListing> {
        let dir = if key.trim_matches('/').is_empty() {
            "/".to_string()
        } else {
            format!("{}/", key.trim_matches('/'))
        };

        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DirListing::default()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut listing = DirListing::default();
        for entry in entries {
            let name = entry.name().trim_matches('/').to_string();
            if name.is_empty() {
                continue; // the listed directory itself
            }
            if entry.metadata().is_dir() {
                listing.dirs.push(name);
            } else {
                // Some backends report size/mtime in the listing; others
                // need a stat round trip.
                let meta = entry.metadata();
                let (size, mtime) = if meta.last_modified().is_some() {
                    (meta.content_length(), meta.last_modified())
                } else {
                    let full = self
                        .op
                        .stat(entry.path())
                        .await
                        .map_err(|e| classify(entry.path(), e))?;
                    (full.content_length(), full.last_modified())
                };
                listing.files.push(ObjectEntry {
                    name,
                    size,
                    mtime: mtime.map(SystemTime::from),
                });
            }
        }
        debug!(dir = %dir, dirs = listing.dirs.len(), files = listing.files.len(), "listed");
        Ok(listing)
    }

    pub async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.op
            .read(key)
            .await
            .map(|buf| buf.to_bytes())
            .map_err(|e| classify(key, e))
    }

    /// Fetch `[start, end_inclusive]` of an object.
    pub async fn get_range(&self, key: &str, start: u64, end_inclusive: u64) -> StoreResult<Bytes> {
        self.op
            .read_with(key)
            .range(start..end_inclusive + 1)
            .await
            .map(|buf| buf.to_bytes())
            .map_err(|e| classify(key, e))
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        self.op
            .write(key, data)
            .await
            .map(|_| ())
            .map_err(|e| classify(key, e))
    }

    /// Whole-object fetch into a local file. Returns the byte count.
    pub async fn download(&self, key: &str, local_path: &Path) -> StoreResult<u64> {
        let data = self.get(key).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;
        debug!(key = %key, local = %local_path.display(), bytes = data.len(), "downloaded");
        Ok(data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_store(root: &Path) -> ObjectStore {
        ObjectStore::open(Source::Local {
            root: root.to_path_buf(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn put_get_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());

        store.put("a/hello.txt", b"hi".to_vec()).await.unwrap();
        let data = store.get("a/hello.txt").await.unwrap();
        assert_eq!(&data[..], b"hi");

        let meta = store.head("a/hello.txt").await.unwrap();
        assert_eq!(meta.size, 2);
    }

    #[tokio::test]
    async fn head_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        match store.head("nope").await {
            Err(StoreError::NotFound(key)) => assert_eq!(key, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        store.put("blob", b"0123456789".to_vec()).await.unwrap();

        let data = store.get_range("blob", 2, 5).await.unwrap();
        assert_eq!(&data[..], b"2345");

        let tail = store.get_range("blob", 8, 9).await.unwrap();
        assert_eq!(&tail[..], b"89");
    }

    #[tokio::test]
    async fn list_dir_splits_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        store.put("a/x", vec![0u8; 10]).await.unwrap();
        store.put("a/b/y", vec![0u8; 20]).await.unwrap();

        let listing = store.list_dir("a").await.unwrap();
        assert_eq!(listing.dirs, vec!["b"]);
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].name, "x");
        assert_eq!(listing.files[0].size, 10);

        // missing prefix: empty, not an error
        let empty = store.list_dir("does/not/exist").await.unwrap();
        assert!(empty.dirs.is_empty() && empty.files.is_empty());
    }

    #[tokio::test]
    async fn download_writes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        store.put("obj", b"payload".to_vec()).await.unwrap();

        let dest = dir.path().join("out/obj.bin");
        let n = store.download("obj", &dest).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
