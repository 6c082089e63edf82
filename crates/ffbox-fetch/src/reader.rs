//! Parallel chunk downloader with a wait-for-chunk read API.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use ffbox_store::ObjectStore;

use crate::chunk_map::ChunkMap;

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_WORKERS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("chunk download failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

struct ChunkState {
    downloaded: Vec<bool>,
    fully_cached: bool,
    failed: Option<String>,
}

/// Coordinates parallel range-GETs for one open-but-incomplete file.
///
/// Chunk order is not guaranteed; readers block on exactly the chunks their
/// range needs. A chunk that exhausts the store's retries poisons the
/// reader: pending and future reads fail, the partial local file is
/// unlinked, and the owner drops the reader so a later open retries from
/// scratch.
pub struct ChunkedReader {
    key: String,
    local_path: PathBuf,
    file_size: u64,
    chunk_size: u64,
    num_chunks: usize,
    state: Mutex<ChunkState>,
    progress: watch::Sender<u64>,
    progress_rx: watch::Receiver<u64>,
    map: Option<ChunkMap>,
}

impl ChunkedReader {
    /// Map the placeholder at `local_path` (already sized to `file_size`)
    /// and start downloading. Must be called from a tokio runtime.
    pub fn spawn(
        store: ObjectStore,
        key: String,
        local_path: PathBuf,
        file_size: u64,
        chunk_size: u64,
        max_workers: usize,
    ) -> io::Result<Arc<ChunkedReader>> {
        let num_chunks = if file_size == 0 {
            0
        } else {
            file_size.div_ceil(chunk_size) as usize
        };

        let map = if num_chunks == 0 {
            None
        } else {
            let file = OpenOptions::new().read(true).write(true).open(&local_path)?;
            if file.metadata()?.len() != file_size {
                file.set_len(file_size)?;
            }
            Some(ChunkMap::new(&file, file_size)?)
        };

        let (progress, progress_rx) = watch::channel(0u64);
        let reader = Arc::new(ChunkedReader {
            key,
            local_path,
            file_size,
            chunk_size,
            num_chunks,
            state: Mutex::new(ChunkState {
                downloaded: vec![false; num_chunks],
                fully_cached: num_chunks == 0,
                failed: None,
            }),
            progress,
            progress_rx,
            map,
        });

        if num_chunks > 0 {
            let task_reader = reader.clone();
            tokio::spawn(task_reader.download_all(store, max_workers));
        }
        Ok(reader)
    }

    pub fn is_fully_cached(&self) -> bool {
        self.state.lock().unwrap().fully_cached
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().unwrap().failed.is_some()
    }

    /// Read `[offset, offset + length)`, clamped to the file size, blocking
    /// until every covering chunk is downloaded.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Bytes, FetchError> {
        if offset >= self.file_size {
            return Ok(Bytes::new());
        }
        let length = (length as u64).min(self.file_size - offset);
        if length == 0 {
            return Ok(Bytes::new());
        }
        let first = (offset / self.chunk_size) as usize;
        let last = ((offset + length - 1) / self.chunk_size) as usize;

        let mut rx = self.progress_rx.clone();
        loop {
            {
                let state = self.state.lock().unwrap();
                if let Some(msg) = &state.failed {
                    return Err(FetchError::Failed(msg.clone()));
                }
                if state.fully_cached || state.downloaded[first..=last].iter().all(|d| *d) {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                return Err(FetchError::Failed("download task gone".to_string()));
            }
        }

        match &self.map {
            // SAFETY: every chunk covering the range is downloaded, so no
            // writer touches these bytes anymore.
            Some(map) => Ok(unsafe { map.read(offset as usize, length as usize) }),
            None => Ok(Bytes::new()),
        }
    }

    async fn download_all(self: Arc<Self>, store: ObjectStore, max_workers: usize) {
        let result = stream::iter(0..self.num_chunks)
            .map(Ok)
            .try_for_each_concurrent(max_workers, |idx| {
                let this = self.clone();
                let store = store.clone();
                async move { this.fetch_chunk(&store, idx).await }
            })
            .await;

        match result {
            Ok(()) => {
                if let Some(map) = &self.map {
                    if let Err(e) = map.flush() {
                        warn!(key = %self.key, "mmap flush failed: {e}");
                    }
                }
                self.state.lock().unwrap().fully_cached = true;
                self.progress.send_modify(|gen| *gen += 1);
                debug!(key = %self.key, chunks = self.num_chunks, "fully cached");
            }
            Err(e) => {
                warn!(key = %self.key, "download failed: {e}");
                // Unlink the partial file before publishing the failure so
                // a retrying open never sees stale bytes.
                if let Err(unlink_err) = std::fs::remove_file(&self.local_path) {
                    if unlink_err.kind() != io::ErrorKind::NotFound {
                        warn!(path = %self.local_path.display(), "unlink failed: {unlink_err}");
                    }
                }
                self.state.lock().unwrap().failed = Some(e.to_string());
                self.progress.send_modify(|gen| *gen += 1);
            }
        }
    }

    async fn fetch_chunk(&self, store: &ObjectStore, idx: usize) -> Result<(), FetchError> {
        let start = idx as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size) - 1;
        let expected = end - start + 1;

        let bytes = store
            .get_range(&self.key, start, end)
            .await
            .map_err(|e| FetchError::Failed(format!("chunk {idx} bytes {start}-{end}: {e}")))?;
        if bytes.len() as u64 != expected {
            return Err(FetchError::Failed(format!(
                "chunk {idx}: short read, got {} of {expected} bytes",
                bytes.len()
            )));
        }

        let Some(map) = &self.map else {
            return Ok(());
        };
        // SAFETY: each chunk index is fetched by exactly one worker, so the
        // ranges written here are disjoint.
        unsafe { map.write(start as usize, &bytes) };

        self.state.lock().unwrap().downloaded[idx] = true;
        self.progress.send_modify(|gen| *gen += 1);
        Ok(())
    }
}
