//! `push`: upload a local tree to the object store and publish manifests.
//!
//! Runs the read-order recorder first when the repo config names a run
//! command, so the resulting `.ffbox/read_order.log` ships with the tree.
//! Files upload through a bounded worker pool; manifests are written last
//! so a mount never sees a manifest pointing at objects that are not there
//! yet.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use ffbox_core::config::RepoConfig;
use ffbox_core::{DirManifest, ManifestEntry, DIR_META_NAME};
use ffbox_store::ObjectStore;

use crate::deploy::{ctime_f64, mtime_f64};
use crate::recorder::record_read_order;
use crate::SYNC_WORKERS;

/// Progress callback: (done, total, message).
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Debug)]
pub struct PushStats {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// Upload `local_dir` to the store and write per-directory manifests.
pub async fn push_tree(
    store: &ObjectStore,
    local_dir: &Path,
    progress: Option<&ProgressFn>,
) -> Result<PushStats> {
    let root = local_dir
        .canonicalize()
        .with_context(|| format!("resolving push dir: {}", local_dir.display()))?;

    let config = RepoConfig::load(&root)?;

    // Record the read-order trace before collecting files so the fresh log
    // ships with this push. Failure here never fails the push.
    if let Some(cmd) = config.trace_command() {
        match record_read_order(&root, cmd) {
            Ok(log) => info!(log = %log.display(), "read-order trace recorded"),
            Err(e) => warn!("read-order recording failed: {e}"),
        }
    }

    let excludes = compile_excludes(&config.exclude)?;
    let plan = collect_tree(&root, &excludes)?;

    // Upload files through the worker pool.
    let done = AtomicU64::new(0);
    let bytes = AtomicU64::new(0);
    let total = plan.files.len() as u64;
    stream::iter(&plan.files)
        .map(Ok)
        .try_for_each_concurrent(SYNC_WORKERS, |rel| {
            let done = &done;
            let bytes = &bytes;
            let root = &root;
            async move {
                let path = root.join(rel);
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading: {}", path.display()))?;
                let len = data.len() as u64;
                store
                    .put(&store.key(rel), data)
                    .await
                    .with_context(|| format!("uploading: {rel}"))?;
                bytes.fetch_add(len, Ordering::Relaxed);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(cb) = progress {
                    cb(n, total, rel);
                }
                Ok::<(), anyhow::Error>(())
            }
        })
        .await?;

    // Manifests last, bounded the same way.
    let manifests = build_manifests(&root, &plan, store);
    let dir_count = manifests.len();
    let written = AtomicUsize::new(0);
    stream::iter(manifests)
        .map(Ok)
        .try_for_each_concurrent(SYNC_WORKERS, |(rel_dir, manifest)| {
            let written = &written;
            async move {
                let key = if rel_dir.is_empty() {
                    store.key(DIR_META_NAME)
                } else {
                    store.key(&format!("{rel_dir}/{DIR_META_NAME}"))
                };
                store
                    .put(&key, manifest.to_bytes()?)
                    .await
                    .with_context(|| format!("uploading manifest: {key}"))?;
                written.fetch_add(1, Ordering::Relaxed);
                Ok::<(), anyhow::Error>(())
            }
        })
        .await?;

    Ok(PushStats {
        files: plan.files.len(),
        dirs: dir_count,
        bytes: bytes.into_inner(),
    })
}

struct PushPlan {
    /// Relative paths of every directory, root as `""`.
    dirs: Vec<String>,
    /// Relative paths of every file to upload.
    files: Vec<String>,
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("bad exclude pattern: {p}")))
        .collect()
}

fn excluded(rel: &str, excludes: &[glob::Pattern]) -> bool {
    excludes.iter().any(|p| p.matches(rel))
}

fn collect_tree(root: &Path, excludes: &[glob::Pattern]) -> Result<PushPlan> {
    let mut plan = PushPlan {
        dirs: vec![String::new()],
        files: Vec::new(),
    };
    collect_tree_inner(root, root, excludes, &mut plan)?;
    plan.dirs.sort();
    plan.files.sort();
    Ok(plan)
}

fn collect_tree_inner(
    root: &Path,
    dir: &Path,
    excludes: &[glob::Pattern],
    plan: &mut PushPlan,
) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading dir: {}", dir.display()))?
    {
        let entry = entry.context("reading dir entry")?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .expect("entry under root")
            .to_string_lossy()
            .replace('\\', "/");
        if excluded(&rel, excludes) {
            continue;
        }

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };
        if meta.is_dir() {
            if entry.file_name() == DIR_META_NAME {
                anyhow::bail!("reserved name used as a directory: {}", path.display());
            }
            plan.dirs.push(rel);
            collect_tree_inner(root, &path, excludes, plan)?;
        } else if meta.is_file() {
            if entry.file_name() == DIR_META_NAME {
                // stale manifest from a local deploy; regenerated below
                continue;
            }
            plan.files.push(rel);
        }
    }
    Ok(())
}

/// One manifest per collected directory, keyed by relative dir path, built
/// from the collected (exclude-filtered) children only.
fn build_manifests(
    root: &Path,
    plan: &PushPlan,
    store: &ObjectStore,
) -> BTreeMap<String, DirManifest> {
    let mut manifests: BTreeMap<String, DirManifest> = plan
        .dirs
        .iter()
        .map(|d| (d.clone(), DirManifest::new()))
        .collect();

    for rel_dir in &plan.dirs {
        if rel_dir.is_empty() {
            continue;
        }
        let (parent, name) = split_parent(rel_dir);
        if let Some(manifest) = manifests.get_mut(parent) {
            manifest.insert(name, ManifestEntry::dir(store.source().url_for(rel_dir)));
        }
    }
    for rel_file in &plan.files {
        let (parent, name) = split_parent(rel_file);
        let Ok(meta) = std::fs::metadata(root.join(rel_file)) else {
            continue;
        };
        if let Some(manifest) = manifests.get_mut(parent) {
            manifest.insert(
                name,
                ManifestEntry::file(
                    meta.len(),
                    mtime_f64(&meta),
                    ctime_f64(&meta),
                    store.source().url_for(rel_file),
                ),
            );
        }
    }
    manifests
}

fn split_parent(rel: &str) -> (&str, &str) {
    match rel.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", rel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffbox_store::Source;

    fn local_store(root: &Path) -> ObjectStore {
        ObjectStore::open(Source::Local {
            root: root.to_path_buf(),
        })
        .unwrap()
    }

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("top.txt"), b"top").unwrap();
        std::fs::write(root.join("a/x"), vec![0u8; 10]).unwrap();
        std::fs::write(root.join("a/b/y"), vec![1u8; 20]).unwrap();
    }

    #[tokio::test]
    async fn push_uploads_files_and_manifests() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path());
        let store = local_store(dst.path());

        let stats = push_tree(&store, src.path(), None).await.unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.bytes, 33);

        assert_eq!(std::fs::read(dst.path().join("a/x")).unwrap(), vec![0u8; 10]);

        let root_manifest =
            DirManifest::from_bytes(&std::fs::read(dst.path().join(DIR_META_NAME)).unwrap())
                .unwrap();
        assert!(root_manifest.entries["a"].is_dir());
        assert_eq!(root_manifest.entries["top.txt"].size, Some(3));

        let a_manifest = DirManifest::from_bytes(
            &std::fs::read(dst.path().join("a").join(DIR_META_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(a_manifest.entries["x"].size, Some(10));
        assert!(a_manifest.entries["b"].is_dir());
    }

    #[tokio::test]
    async fn exclude_patterns_are_honored() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path());
        let meta = src.path().join(".ffbox");
        std::fs::create_dir_all(&meta).unwrap();
        std::fs::write(
            meta.join("config.json"),
            r#"{"exclude": ["a/b", "*.txt"]}"#,
        )
        .unwrap();

        let store = local_store(dst.path());
        let stats = push_tree(&store, src.path(), None).await.unwrap();

        // a/b pruned as a subtree, top.txt matched by glob
        assert_eq!(stats.files, 2); // a/x and .ffbox/config.json
        assert!(!dst.path().join("a/b").exists());
        assert!(!dst.path().join("top.txt").exists());

        let a_manifest = DirManifest::from_bytes(
            &std::fs::read(dst.path().join("a").join(DIR_META_NAME)).unwrap(),
        )
        .unwrap();
        assert!(!a_manifest.entries.contains_key("b"));
    }

    #[tokio::test]
    async fn stale_local_manifests_are_regenerated_not_uploaded_twice() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path());
        // simulate a prior local deploy
        std::fs::write(src.path().join(DIR_META_NAME), b"{}").unwrap();

        let store = local_store(dst.path());
        let stats = push_tree(&store, src.path(), None).await.unwrap();
        assert_eq!(stats.files, 3, "stale manifest must not count as a file");

        let root_manifest =
            DirManifest::from_bytes(&std::fs::read(dst.path().join(DIR_META_NAME)).unwrap())
                .unwrap();
        assert!(!root_manifest.entries.contains_key(DIR_META_NAME));
    }

    #[test]
    fn split_parent_paths() {
        assert_eq!(split_parent("a/b/c"), ("a/b", "c"));
        assert_eq!(split_parent("top"), ("", "top"));
    }
}
