//! Background prefetcher: replays the recorded read-order trace against the
//! live mountpoint, so the cache is warm in the order a representative run
//! reads it.
//!
//! Runs wholly outside the FUSE service path: workers issue ordinary
//! blocking `open(2)`/`lstat(2)` syscalls on the mountpoint (from the
//! blocking pool), which the kernel turns into the driver's own read-side
//! operations. Each open of a large file kicks off its chunked download and
//! returns; the trace order therefore becomes the download order.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use ffbox_core::readorder::{parse_trace, TraceRecord, READ_ORDER_KEY};
use ffbox_store::{ObjectStore, StoreError};

/// Worker pool size. Workers spend their time blocked on network-backed
/// opens, so the pool is wide.
const PREFETCH_WORKERS: usize = 200;

/// Queue bound between the trace reader and the workers.
const QUEUE_DEPTH: usize = 1024;

/// Start the prefetcher. Returns immediately; a missing trace is a no-op.
pub fn spawn(store: ObjectStore, mountpoint: PathBuf) {
    tokio::spawn(run(store, mountpoint));
}

async fn run(store: ObjectStore, mountpoint: PathBuf) {
    let key = store.key(READ_ORDER_KEY);
    let text = match store.get(&key).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(StoreError::NotFound(_)) => {
            debug!(key = %key, "no read-order trace, skipping prefetch");
            return;
        }
        Err(e) => {
            warn!(key = %key, "failed to fetch read-order trace: {e}");
            return;
        }
    };

    let records = parse_trace(&text);
    if records.is_empty() {
        return;
    }
    info!(entries = records.len(), "prefetching recorded read order");

    let (tx, rx) = async_channel::bounded::<TraceRecord>(QUEUE_DEPTH);
    let mut workers = Vec::with_capacity(PREFETCH_WORKERS);
    for _ in 0..PREFETCH_WORKERS {
        workers.push(tokio::spawn(worker(rx.clone(), mountpoint.clone())));
    }

    for record in records {
        if tx.send(record).await.is_err() {
            break;
        }
    }
    tx.close();

    for worker in workers {
        let _ = worker.await;
    }
    info!("prefetch complete");
}

async fn worker(rx: async_channel::Receiver<TraceRecord>, mountpoint: PathBuf) {
    while let Ok(record) = rx.recv().await {
        let path = mountpoint.join(record.rel_path.trim_matches('/'));
        let is_open = record.op.is_open();
        let result = tokio::task::spawn_blocking(move || {
            if is_open {
                // opening is enough: the driver starts fetching on open
                std::fs::File::open(&path).map(drop)
            } else {
                std::fs::symlink_metadata(&path).map(drop)
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(path = %record.rel_path, "prefetch miss: {e}"),
            Err(e) => warn!("prefetch worker task failed: {e}"),
        }
    }
}
