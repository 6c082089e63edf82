//! `deploy`: write `.ffbox_dir_meta.json` into every directory of a local
//! tree, without uploading anything. A deployed tree can be mounted with a
//! plain path source; manifest `url` fields are absolute local paths.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use ffbox_core::{DirManifest, ManifestEntry, DIR_META_NAME};

use crate::SYNC_WORKERS;

#[derive(Debug)]
pub struct DeployStats {
    pub dirs: usize,
    pub files: usize,
}

/// Write a manifest into every directory under `local_dir`. Running it
/// twice yields identical manifests modulo timestamps.
pub async fn deploy_tree(local_dir: &Path) -> Result<DeployStats> {
    let root = local_dir
        .canonicalize()
        .with_context(|| format!("resolving deploy dir: {}", local_dir.display()))?;

    let dirs = collect_dirs(&root)?;
    let files = AtomicUsize::new(0);

    stream::iter(&dirs)
        .map(Ok)
        .try_for_each_concurrent(SYNC_WORKERS, |dir| {
            let files = &files;
            async move {
                let manifest = build_local_manifest(dir)?;
                files.fetch_add(
                    manifest.entries.values().filter(|e| !e.is_dir()).count(),
                    Ordering::Relaxed,
                );
                write_manifest(dir, &manifest)
            }
        })
        .await?;

    Ok(DeployStats {
        dirs: dirs.len(),
        files: files.into_inner(),
    })
}

/// Every directory under `root`, root included. The reserved manifest name
/// is rejected as a directory name anywhere in the tree.
fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    collect_dirs_inner(root, &mut dirs)?;
    dirs.sort();
    Ok(dirs)
}

fn collect_dirs_inner(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    out.push(dir.to_path_buf());
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading dir: {}", dir.display()))?
    {
        let entry = entry.context("reading dir entry")?;
        let path = entry.path();
        if entry.file_type().context("stat dir entry")?.is_dir() {
            if entry.file_name() == DIR_META_NAME {
                anyhow::bail!(
                    "reserved name used as a directory: {}",
                    path.display()
                );
            }
            collect_dirs_inner(&path, out)?;
        }
    }
    Ok(())
}

/// Build the manifest for one directory: files as `{size, mtime, ctime,
/// url}`, subdirectories as `{url}`, with `url` the absolute local path.
/// Manifests from an earlier deploy are skipped (regenerated), not listed.
pub(crate) fn build_local_manifest(dir: &Path) -> Result<DirManifest> {
    let mut manifest = DirManifest::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading dir: {}", dir.display()))?
    {
        let entry = entry.context("reading dir entry")?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == DIR_META_NAME {
            continue;
        }
        let path = entry.path();
        let url = path.display().to_string();

        // follow symlinks so a linked file deploys as its target's bytes
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };

        if meta.is_dir() {
            manifest.insert(name, ManifestEntry::dir(url));
        } else if meta.is_file() {
            manifest.insert(
                name,
                ManifestEntry::file(meta.len(), mtime_f64(&meta), ctime_f64(&meta), url),
            );
        }
    }
    Ok(manifest)
}

pub(crate) fn mtime_f64(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn ctime_f64(meta: &std::fs::Metadata) -> f64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime() as f64 + meta.ctime_nsec() as f64 * 1e-9
}

/// Atomic write: temp sibling then rename.
fn write_manifest(dir: &Path, manifest: &DirManifest) -> Result<()> {
    let path = dir.join(DIR_META_NAME);
    let tmp = dir.join(format!("{DIR_META_NAME}.tmp"));
    std::fs::write(&tmp, manifest.to_bytes()?)
        .with_context(|| format!("writing manifest tmp: {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("renaming manifest: {}", path.display()))?;
    debug!(dir = %dir.display(), entries = manifest.len(), "manifest written");
    Ok(())
}
