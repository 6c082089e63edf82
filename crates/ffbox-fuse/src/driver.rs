//! FUSE driver: translates VFS operations into cache-tree and object-store
//! operations.
//!
//! ## Two parallel trees
//!
//! ```text
//! object store:                     cache tree (~/.cache/ffbox/...):
//!   {prefix}/model/weights.bin       model/weights.bin   (sparse until fetched)
//!   {prefix}/model/config.json       model/config.json
//!   {prefix}/.ffbox_dir_meta.json    (manifests stay out of the tree)
//!
//! mountpoint /mnt/box:
//!   model/weights.bin   ← reads block on exactly the chunks they need
//! ```
//!
//! Directories materialize on first touch (manifest fetch or LIST), files
//! on first open. Writes land in the cache tree only and never propagate
//! back to the store.

use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use filetime::FileTime;
use fuse3::path::prelude::*;
use fuse3::{Errno, FileType};
use futures::stream;
use tracing::{debug, info, warn};

use ffbox_cache::{CacheTree, LockTable};
use ffbox_core::{DirManifest, FfboxError, DIR_META_NAME};
use ffbox_fetch::{ChunkedReader, FetchError};
use ffbox_store::{ObjectStore, StoreError};

/// TTL for dentry/attr replies. Short, because the cache tree is locally
/// writable underneath the kernel's cache.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// An open file handle. `rel` is the mount-relative path the handle was
/// opened for; `file` is the local fd (cache tree, or the deploy source
/// when a read-only open followed a local `user.url`).
struct OpenHandle {
    rel: String,
    file: File,
}

/// The FUSE filesystem driver.
pub struct FfboxFs {
    store: ObjectStore,
    cache: CacheTree,
    locks: LockTable,
    /// Chunked readers for open-but-incomplete files, at most one per path.
    readers: DashMap<String, Arc<ChunkedReader>>,
    /// Open file handles: fh → handle.
    handles: DashMap<u64, Arc<OpenHandle>>,
    next_fh: AtomicU64,
    /// Selected at mount time by probing for the root manifest.
    manifest_mode: bool,
    chunk_size: u64,
    max_workers: usize,
}

impl FfboxFs {
    pub fn new(
        store: ObjectStore,
        cache: CacheTree,
        manifest_mode: bool,
        chunk_size: u64,
        max_workers: usize,
    ) -> FfboxFs {
        FfboxFs {
            store,
            cache,
            locks: LockTable::new(),
            readers: DashMap::new(),
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            manifest_mode,
            chunk_size,
            max_workers,
        }
    }

    // ── Materialization ───────────────────────────────────────────────────

    /// Populate a directory's children from the store and mark it complete.
    /// No-op when already complete; serialized per path.
    async fn materialize_dir(&self, rel: &str) -> Result<(), FfboxError> {
        if self.cache.is_complete(rel) {
            return Ok(());
        }
        let lock = self.locks.lock_for(rel);
        let _guard = lock.lock().await;
        if self.cache.is_complete(rel) {
            return Ok(());
        }
        self.cache.ensure_dir(rel)?;
        if self.manifest_mode {
            self.materialize_from_manifest(rel).await?;
        } else {
            self.materialize_from_listing(rel).await?;
        }
        self.cache.mark_complete(rel);
        Ok(())
    }

    async fn materialize_from_manifest(&self, rel: &str) -> Result<(), FfboxError> {
        let manifest_rel = if rel.is_empty() {
            DIR_META_NAME.to_string()
        } else {
            format!("{rel}/{DIR_META_NAME}")
        };
        let bytes = match self.store.get(&self.store.key(&manifest_rel)).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                // a directory with no manifest is empty
                debug!(dir = %rel, "no manifest, treating directory as empty");
                return Ok(());
            }
            Err(e) => return Err(store_err(e)),
        };
        let manifest = DirManifest::from_bytes(&bytes)?;

        for (name, entry) in &manifest.entries {
            let child = join_rel(rel, name);
            if entry.is_dir() {
                self.cache.ensure_dir(&child)?;
                self.cache.set_url(&child, &entry.url);
            } else {
                self.cache.ensure_placeholder(
                    &child,
                    entry.size.unwrap_or(0),
                    entry.mtime.and_then(epoch_f64_to_system_time),
                    Some(&entry.url),
                )?;
            }
        }
        debug!(dir = %rel, entries = manifest.len(), "materialized from manifest");
        Ok(())
    }

    async fn materialize_from_listing(&self, rel: &str) -> Result<(), FfboxError> {
        let listing = self
            .store
            .list_dir(&self.store.key(rel))
            .await
            .map_err(store_err)?;
        for dir in &listing.dirs {
            self.cache.ensure_dir(&join_rel(rel, dir))?;
        }
        for file in &listing.files {
            if file.name == DIR_META_NAME {
                continue;
            }
            self.cache
                .ensure_placeholder(&join_rel(rel, &file.name), file.size, file.mtime, None)?;
        }
        debug!(
            dir = %rel,
            dirs = listing.dirs.len(),
            files = listing.files.len(),
            "materialized from listing"
        );
        Ok(())
    }

    /// Stat a path, materializing its parent on a local miss. A miss under
    /// an already-complete parent is ENOENT.
    async fn stat_or_materialize(&self, rel: &str) -> fuse3::Result<std::fs::Metadata> {
        let full = self.cache.full_path(rel);
        if let Ok(meta) = std::fs::symlink_metadata(&full) {
            return Ok(meta);
        }
        if rel.is_empty() {
            self.cache.ensure_dir("").map_err(|e| io_err(&e))?;
            return std::fs::symlink_metadata(&full).map_err(|e| io_err(&e));
        }
        let parent = parent_rel(rel);
        if !self.cache.is_complete(parent) {
            self.materialize_dir(parent).await.map_err(fs_err)?;
        }
        std::fs::symlink_metadata(&full).map_err(|_| Errno::from(libc::ENOENT))
    }

    // ── Open-path fetch logic ─────────────────────────────────────────────

    /// Bring a file to an openable state and return the real path to open:
    /// the cache-tree path, or the deploy source path for a read-only open
    /// of a locally-deployed file. Registers a chunked reader for large
    /// incomplete files.
    async fn prepare_open(&self, rel: &str, flags: u32) -> Result<PathBuf, FfboxError> {
        let full = self.cache.full_path(rel);
        let wants_write = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;

        if !self.cache.is_complete(rel) {
            // Deploy-mode locator: the bytes already live on this machine.
            if let Some(url) = self.cache.url(rel) {
                if url.starts_with('/') {
                    if !wants_write {
                        return Ok(PathBuf::from(url));
                    }
                    let lock = self.locks.lock_for(rel);
                    let _guard = lock.lock().await;
                    if !self.cache.is_complete(rel) {
                        std::fs::copy(&url, &full)?;
                        self.cache.mark_complete(rel);
                    }
                    return Ok(full);
                }
            }
        }

        if self.cache.is_complete(rel) {
            return Ok(full);
        }

        let lock = self.locks.lock_for(rel);
        let _guard = lock.lock().await;
        if self.cache.is_complete(rel) {
            return Ok(full);
        }

        let key = self.store.key(rel);
        let size = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta.len(),
            // A failed download unlinks its placeholder; recreate it from a
            // HEAD so this open retries from scratch.
            Err(_) => match self.store.head(&key).await {
                Ok(meta) => {
                    self.cache
                        .ensure_placeholder(rel, meta.size, meta.mtime, None)?;
                    meta.size
                }
                Err(StoreError::NotFound(key)) => return Err(FfboxError::NotFound(key)),
                Err(e) => return Err(store_err(e)),
            },
        };

        if size <= self.chunk_size {
            // Whole-object fetch; not worth a chunk map.
            match self.store.download(&key, &full).await {
                Ok(_) => self.cache.mark_complete(rel),
                Err(StoreError::NotFound(key)) => return Err(FfboxError::NotFound(key)),
                Err(e) => return Err(store_err(e)),
            }
        } else if !self.readers.contains_key(rel) {
            let reader = ChunkedReader::spawn(
                self.store.clone(),
                key,
                full.clone(),
                size,
                self.chunk_size,
                self.max_workers,
            )?;
            self.readers.insert(rel.to_string(), reader);
            debug!(path = %rel, size, "chunked reader started");
        }
        Ok(full)
    }

    fn register_handle(&self, rel: String, file: File) -> ReplyOpen {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, Arc::new(OpenHandle { rel, file }));
        ReplyOpen { fh, flags: 0 }
    }

    fn handle(&self, fh: u64) -> fuse3::Result<Arc<OpenHandle>> {
        self.handles
            .get(&fh)
            .map(|h| h.clone())
            .ok_or_else(|| Errno::from(libc::EBADF))
    }

    fn reader_for(&self, rel: &str) -> Option<Arc<ChunkedReader>> {
        self.readers.get(rel).map(|r| r.clone())
    }
}

// ── Path and attr helpers ─────────────────────────────────────────────────

fn rel_of(path: &OsStr) -> fuse3::Result<String> {
    let s = path.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
    Ok(s.trim_matches('/').to_string())
}

fn child_rel(parent: &OsStr, name: &OsStr) -> fuse3::Result<String> {
    let parent = rel_of(parent)?;
    let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
    Ok(join_rel(&parent, name))
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_rel(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn epoch_f64_to_system_time(secs: f64) -> Option<SystemTime> {
    if secs.is_finite() && secs > 0.0 {
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn unix_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    }
}

fn attr_from_meta(meta: &std::fs::Metadata) -> FileAttr {
    let kind = if meta.file_type().is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        size: meta.len(),
        blocks: meta.blocks(),
        atime: unix_time(meta.atime(), meta.atime_nsec()),
        mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
        ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        #[cfg(target_os = "macos")]
        crtime: unix_time(meta.ctime(), meta.ctime_nsec()),
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

fn open_local(path: &Path, flags: u32) -> io::Result<File> {
    let acc = flags as i32 & libc::O_ACCMODE;
    OpenOptions::new()
        .read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
        .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
        .custom_flags(flags as i32 & !libc::O_ACCMODE)
        .open(path)
}

fn fs_err(err: FfboxError) -> Errno {
    Errno::from(err.errno())
}

fn io_err(err: &io::Error) -> Errno {
    Errno::from(err.raw_os_error().unwrap_or(libc::EIO))
}

fn store_err(err: StoreError) -> FfboxError {
    match err {
        StoreError::NotFound(key) => FfboxError::NotFound(key),
        StoreError::Io(e) => FfboxError::Other(anyhow::anyhow!("storage I/O: {e}")),
        StoreError::Local(e) => FfboxError::Io(e),
    }
}

// ── PathFilesystem impl ───────────────────────────────────────────────────

impl PathFilesystem for FfboxFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!(
            source = %self.store.source(),
            manifest_mode = self.manifest_mode,
            "ffbox-fuse init"
        );
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("ffbox unmounted");
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        let rel = match path {
            Some(path) => rel_of(path)?,
            None => self.handle(fh.ok_or_else(|| Errno::from(libc::ENOENT))?)?.rel.clone(),
        };
        let meta = self.stat_or_materialize(&rel).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let rel = child_rel(parent, name)?;
        let meta = self.stat_or_materialize(&rel).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> fuse3::Result<ReplyAttr> {
        let rel = match path {
            Some(path) => rel_of(path)?,
            None => self.handle(fh.ok_or_else(|| Errno::from(libc::ENOENT))?)?.rel.clone(),
        };
        let full = self.cache.full_path(&rel);

        if let Some(size) = set_attr.size {
            let truncated = fh
                .and_then(|fh| self.handles.get(&fh).map(|h| h.clone()))
                .map(|h| h.file.set_len(size));
            match truncated {
                Some(result) => result.map_err(|e| io_err(&e))?,
                None => {
                    let file = OpenOptions::new()
                        .write(true)
                        .open(&full)
                        .map_err(|e| io_err(&e))?;
                    file.set_len(size).map_err(|e| io_err(&e))?;
                }
            }
        }
        if let Some(mode) = set_attr.mode {
            std::fs::set_permissions(&full, Permissions::from_mode(mode)).map_err(|e| io_err(&e))?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            std::os::unix::fs::chown(&full, set_attr.uid, set_attr.gid)
                .map_err(|e| io_err(&e))?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
            let atime = set_attr
                .atime
                .map(|t| {
                    FileTime::from_system_time(
                        SystemTime::UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec),
                    )
                })
                .unwrap_or_else(|| FileTime::from_last_access_time(&meta));
            let mtime = set_attr
                .mtime
                .map(|t| {
                    FileTime::from_system_time(
                        SystemTime::UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec),
                    )
                })
                .unwrap_or_else(|| FileTime::from_last_modification_time(&meta));
            filetime::set_file_times(&full, atime, mtime).map_err(|e| io_err(&e))?;
        }

        let meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> fuse3::Result<ReplyData> {
        let rel = rel_of(path)?;
        let target = std::fs::read_link(self.cache.full_path(&rel)).map_err(|e| io_err(&e))?;
        Ok(ReplyData {
            data: Bytes::copy_from_slice(target.as_os_str().as_bytes()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        let rel = child_rel(parent, name)?;
        let full = self.cache.full_path(&rel);
        std::os::unix::fs::symlink(link_path, &full).map_err(|e| io_err(&e))?;
        let meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let rel = child_rel(parent, name)?;
        let full = self.cache.full_path(&rel);
        let cpath =
            CString::new(full.as_os_str().as_bytes()).map_err(|_| Errno::from(libc::EINVAL))?;
        let ret = unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(io_err(&err));
        }
        self.cache.mark_complete(&rel);
        let meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let rel = child_rel(parent, name)?;
        let full = self.cache.full_path(&rel);
        std::fs::create_dir(&full).map_err(|e| io_err(&e))?;
        let _ = std::fs::set_permissions(&full, Permissions::from_mode(mode & !umask));
        // a locally created directory has no remote children to fetch
        self.cache.mark_complete(&rel);
        let meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let rel = child_rel(parent, name)?;
        std::fs::remove_file(self.cache.full_path(&rel)).map_err(|e| io_err(&e))?;
        self.cache.forget(&rel);
        self.readers.remove(&rel);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let rel = child_rel(parent, name)?;
        std::fs::remove_dir(self.cache.full_path(&rel)).map_err(|e| io_err(&e))?;
        self.cache.forget(&rel);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> fuse3::Result<()> {
        let from = child_rel(origin_parent, origin_name)?;
        let to = child_rel(parent, name)?;
        std::fs::rename(self.cache.full_path(&from), self.cache.full_path(&to))
            .map_err(|e| io_err(&e))?;
        // completion xattrs travel with the inode; only the fast-path set
        // entries are keyed by path
        self.cache.forget(&from);
        self.cache.forget(&to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        let from = rel_of(path)?;
        let to = child_rel(new_parent, new_name)?;
        let to_full = self.cache.full_path(&to);
        std::fs::hard_link(self.cache.full_path(&from), &to_full).map_err(|e| io_err(&e))?;
        let meta = std::fs::symlink_metadata(&to_full).map_err(|e| io_err(&e))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: attr_from_meta(&meta),
        })
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
        let rel = rel_of(path)?;
        let target = self.prepare_open(&rel, flags).await.map_err(fs_err)?;

        // Truncating a placeholder under an active chunk map would
        // invalidate it; the write lands locally on release anyway.
        let flags = if self.readers.contains_key(&rel) {
            flags & !(libc::O_TRUNC as u32)
        } else {
            flags
        };
        let file = open_local(&target, flags).map_err(|e| io_err(&e))?;
        debug!(path = %rel, "opened");
        Ok(self.register_handle(rel, file))
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let handle = self.handle(fh)?;

        if let Some(reader) = self.reader_for(&handle.rel) {
            return match reader.read(offset, size).await {
                Ok(data) => {
                    if reader.is_fully_cached() {
                        self.cache.mark_complete(&handle.rel);
                    }
                    Ok(ReplyData { data })
                }
                Err(FetchError::Failed(msg)) => {
                    warn!(path = %handle.rel, "chunked read failed: {msg}");
                    self.readers.remove(&handle.rel);
                    Err(Errno::from(libc::EIO))
                }
                Err(FetchError::Io(e)) => Err(io_err(&e)),
            };
        }

        let mut buf = vec![0u8; size as usize];
        let n = handle.file.read_at(&mut buf, offset).map_err(|e| io_err(&e))?;
        buf.truncate(n);
        Ok(ReplyData { data: buf.into() })
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyWrite> {
        let handle = self.handle(fh)?;
        handle
            .file
            .write_all_at(data, offset)
            .map_err(|e| io_err(&e))?;
        Ok(ReplyWrite {
            written: data.len() as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        if let Some((_, handle)) = self.handles.remove(&fh) {
            if let Some(reader) = self.reader_for(&handle.rel) {
                if reader.is_fully_cached() {
                    self.cache.mark_complete(&handle.rel);
                    self.readers.remove(&handle.rel);
                } else if reader.is_failed() {
                    self.readers.remove(&handle.rel);
                }
                // still downloading: other handles (or the next open) keep it
            }
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<()> {
        let handle = self.handle(fh)?;
        handle.file.sync_all().map_err(|e| io_err(&e))?;
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> fuse3::Result<()> {
        let handle = self.handle(fh)?;
        let result = if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        };
        result.map_err(|e| io_err(&e))?;
        Ok(())
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> fuse3::Result<()> {
        let rel = rel_of(path)?;
        let full = self.cache.full_path(&rel);
        let cpath =
            CString::new(full.as_os_str().as_bytes()).map_err(|_| Errno::from(libc::EINVAL))?;
        if unsafe { libc::access(cpath.as_ptr(), mask as libc::c_int) } == 0 {
            Ok(())
        } else {
            Err(Errno::from(libc::EACCES))
        }
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> fuse3::Result<ReplyCreated> {
        let rel = child_rel(parent, name)?;
        let full = self.cache.full_path(&rel);
        if let Some(parent_dir) = full.parent() {
            std::fs::create_dir_all(parent_dir).map_err(|e| io_err(&e))?;
        }
        let acc = flags as i32 & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .write(true)
            .read(acc != libc::O_WRONLY)
            .create(true)
            .mode(mode)
            .open(&full)
            .map_err(|e| io_err(&e))?;
        // born local: nothing to fetch, ever
        self.cache.mark_complete(&rel);
        let meta = file.metadata().map_err(|e| io_err(&e))?;
        let attr = attr_from_meta(&meta);
        let ReplyOpen { fh, .. } = self.register_handle(rel, file);
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    // Directory entry stream types
    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let rel = rel_of(path)?;
        self.materialize_dir(&rel).await.map_err(fs_err)?;

        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();
        if offset == 0 {
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
            }));
        }
        if offset <= 1 {
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
            }));
        }

        let full = self.cache.full_path(&rel);
        let mut next_offset = 3i64;
        for entry in std::fs::read_dir(&full).map_err(|e| io_err(&e))? {
            let entry = entry.map_err(|e| io_err(&e))?;
            if entry.file_name() == DIR_META_NAME {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| io_err(&e))?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            if next_offset > offset {
                entries.push(Ok(DirectoryEntry {
                    kind,
                    name: entry.file_name(),
                    offset: next_offset,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let rel = rel_of(path)?;
        self.materialize_dir(&rel).await.map_err(fs_err)?;

        let full = self.cache.full_path(&rel);
        let self_meta = std::fs::symlink_metadata(&full).map_err(|e| io_err(&e))?;
        let offset = offset as i64;

        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
        if offset == 0 {
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
                attr: attr_from_meta(&self_meta),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }
        if offset <= 1 {
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
                attr: attr_from_meta(&self_meta),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let mut next_offset = 3i64;
        for entry in std::fs::read_dir(&full).map_err(|e| io_err(&e))? {
            let entry = entry.map_err(|e| io_err(&e))?;
            if entry.file_name() == DIR_META_NAME {
                continue;
            }
            let meta = match std::fs::symlink_metadata(entry.path()) {
                Ok(meta) => meta,
                Err(_) => continue, // raced with unlink
            };
            let attr = attr_from_meta(&meta);
            if next_offset > offset {
                entries.push(Ok(DirectoryEntryPlus {
                    kind: attr.kind,
                    name: entry.file_name(),
                    offset: next_offset,
                    attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn opendir(&self, _req: Request, _path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 1 << 30,
            bfree: 1 << 29,
            bavail: 1 << 29,
            files: 1 << 20,
            ffree: 1 << 19,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffbox_fetch::DEFAULT_MAX_WORKERS;
    use ffbox_store::Source;

    fn local_store(root: &Path) -> ObjectStore {
        ObjectStore::open(Source::Local {
            root: root.to_path_buf(),
        })
        .unwrap()
    }

    fn make_fs(remote: &Path, cache: &Path, manifest_mode: bool, chunk_size: u64) -> FfboxFs {
        FfboxFs::new(
            local_store(remote),
            CacheTree::new(cache.to_path_buf()),
            manifest_mode,
            chunk_size,
            DEFAULT_MAX_WORKERS,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_mode_materializes_placeholders() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("a/b")).unwrap();
        std::fs::write(remote.path().join("a/hello.txt"), b"hi").unwrap();
        std::fs::write(remote.path().join("a/b/y"), vec![1u8; 20]).unwrap();

        let fs = make_fs(remote.path(), cache.path(), false, 5 * 1024 * 1024);
        fs.materialize_dir("a").await.unwrap();

        assert!(fs.cache.is_complete("a"));
        let placeholder = cache.path().join("a/hello.txt");
        assert_eq!(std::fs::metadata(&placeholder).unwrap().len(), 2);
        assert!(cache.path().join("a/b").is_dir());
        assert!(!fs.cache.is_complete("a/b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stat_materializes_parent_and_misses_enoent() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("a")).unwrap();
        std::fs::write(remote.path().join("a/x"), vec![0u8; 10]).unwrap();

        let fs = make_fs(remote.path(), cache.path(), false, 5 * 1024 * 1024);

        let meta = fs.stat_or_materialize("a/x").await.unwrap();
        assert_eq!(meta.len(), 10);

        // parent is now complete; a missing sibling is a definitive miss
        let err = fs.stat_or_materialize("a/missing").await.unwrap_err();
        assert_eq!(err, Errno::from(libc::ENOENT));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_file_open_downloads_whole_object() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("hello.txt"), b"hi").unwrap();

        let fs = make_fs(remote.path(), cache.path(), false, 5 * 1024 * 1024);
        fs.materialize_dir("").await.unwrap();

        let target = fs
            .prepare_open("hello.txt", libc::O_RDONLY as u32)
            .await
            .unwrap();
        assert_eq!(target, cache.path().join("hello.txt"));
        assert!(fs.cache.is_complete("hello.txt"));
        assert_eq!(std::fs::read(&target).unwrap(), b"hi");
        assert!(fs.readers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_file_open_registers_one_chunked_reader() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..255u8).cycle().take(100).collect();
        std::fs::write(remote.path().join("big.bin"), &payload).unwrap();

        // chunk_size 16 → the 100-byte file takes the chunked path
        let fs = make_fs(remote.path(), cache.path(), false, 16);
        fs.materialize_dir("").await.unwrap();

        fs.prepare_open("big.bin", libc::O_RDONLY as u32).await.unwrap();
        fs.prepare_open("big.bin", libc::O_RDONLY as u32).await.unwrap();
        assert_eq!(fs.readers.len(), 1, "concurrent opens share one reader");

        let reader = fs.reader_for("big.bin").unwrap();
        let data = reader.read(32, 40).await.unwrap();
        assert_eq!(&data[..], &payload[32..72]);

        let all = reader.read(0, 200).await.unwrap();
        assert_eq!(&all[..], &payload[..]);
        assert!(reader.is_fully_cached());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_object_surfaces_not_found() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        let fs = make_fs(remote.path(), cache.path(), false, 5 * 1024 * 1024);
        // placeholder exists locally but the object is gone remotely
        fs.cache.ensure_placeholder("ghost", 4, None, None).unwrap();

        let err = fs
            .prepare_open("ghost", libc::O_RDONLY as u32)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_download_retries_from_scratch() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = vec![5u8; 100];

        let fs = make_fs(remote.path(), cache.path(), false, 16);
        // placeholder exists but the object is missing: the chunked
        // download fails and unlinks the partial file
        fs.cache.ensure_placeholder("flaky", 100, None, None).unwrap();
        fs.prepare_open("flaky", libc::O_RDONLY as u32).await.unwrap();
        let reader = fs.reader_for("flaky").unwrap();
        assert!(matches!(
            reader.read(0, 100).await,
            Err(FetchError::Failed(_))
        ));
        fs.readers.remove("flaky");
        assert!(!cache.path().join("flaky").exists());

        // the object appears remotely; the next open re-heads, recreates
        // the placeholder, and fetches cleanly
        std::fs::write(remote.path().join("flaky"), &payload).unwrap();
        fs.prepare_open("flaky", libc::O_RDONLY as u32).await.unwrap();
        let reader = fs.reader_for("flaky").unwrap();
        assert_eq!(&reader.read(0, 100).await.unwrap()[..], &payload[..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manifest_mode_deployed_tree() {
        let source = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("a/b")).unwrap();
        std::fs::write(source.path().join("a/x"), vec![7u8; 10]).unwrap();
        std::fs::write(source.path().join("a/b/y"), vec![9u8; 20]).unwrap();
        ffbox_sync::deploy_tree(source.path()).await.unwrap();

        let root = source.path().canonicalize().unwrap();
        let fs = make_fs(&root, cache.path(), true, 5 * 1024 * 1024);

        fs.materialize_dir("").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(cache.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a"]);

        fs.materialize_dir("a").await.unwrap();
        let mut names: Vec<String> = std::fs::read_dir(cache.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["b", "x"]);
        assert_eq!(
            std::fs::metadata(cache.path().join("a/x")).unwrap().len(),
            10
        );

        fs.materialize_dir("a/b").await.unwrap();
        // open a/b/y read-only: served from the deploy source when the
        // filesystem supports the url xattr, fetched otherwise
        let target = fs
            .prepare_open("a/b/y", libc::O_RDONLY as u32)
            .await
            .unwrap();
        let mut file = std::fs::File::open(&target).unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        file.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 20]);
    }

    #[test]
    fn rel_helpers() {
        assert_eq!(rel_of(OsStr::new("/a/b")).unwrap(), "a/b");
        assert_eq!(rel_of(OsStr::new("/")).unwrap(), "");
        assert_eq!(
            child_rel(OsStr::new("/"), OsStr::new("x")).unwrap(),
            "x"
        );
        assert_eq!(
            child_rel(OsStr::new("/a"), OsStr::new("b")).unwrap(),
            "a/b"
        );
        assert_eq!(parent_rel("a/b/c"), "a/b");
        assert_eq!(parent_rel("a"), "");
    }
}
