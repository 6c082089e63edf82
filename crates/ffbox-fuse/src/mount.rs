//! Mount entry point: prepare the cache tree, probe the manifest mode,
//! start the prefetcher, then hand the driver to the kernel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fuse3::path::Session;
use fuse3::MountOptions;
use tracing::info;

use ffbox_cache::CacheTree;
use ffbox_core::DIR_META_NAME;
use ffbox_fetch::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WORKERS};
use ffbox_store::{ObjectStore, Source};

use crate::driver::FfboxFs;
use crate::prefetch;

pub struct MountOpts {
    pub source: Source,
    /// Kernel-visible mountpoint (the fake tree).
    pub mountpoint: PathBuf,
    /// On-disk cache directory (the real tree).
    pub cache_root: PathBuf,
    /// Wipe the cache before mounting.
    pub clean: bool,
}

/// Mount the source at the mountpoint and block until unmounted
/// (`fusermount3 -u <mountpoint>` or `ffbox unmount`).
pub async fn mount(opts: MountOpts) -> Result<()> {
    if opts.mountpoint.starts_with(&opts.cache_root) || opts.cache_root.starts_with(&opts.mountpoint)
    {
        anyhow::bail!(
            "cache dir {} and mountpoint {} must be disjoint",
            opts.cache_root.display(),
            opts.mountpoint.display()
        );
    }

    if opts.clean && opts.cache_root.exists() {
        std::fs::remove_dir_all(&opts.cache_root)
            .with_context(|| format!("cleaning cache: {}", opts.cache_root.display()))?;
    }
    std::fs::create_dir_all(&opts.cache_root)
        .with_context(|| format!("creating cache dir: {}", opts.cache_root.display()))?;
    std::fs::create_dir_all(&opts.mountpoint)
        .with_context(|| format!("creating mountpoint: {}", opts.mountpoint.display()))?;

    let store = ObjectStore::open(opts.source.clone())?;

    // Presence of a root manifest selects manifest mode for the whole mount.
    let manifest_mode = store.head(&store.key(DIR_META_NAME)).await.is_ok();
    info!(
        source = %opts.source,
        mountpoint = %opts.mountpoint.display(),
        cache = %opts.cache_root.display(),
        manifest_mode,
        "mounting"
    );

    let fs = FfboxFs::new(
        store.clone(),
        CacheTree::new(opts.cache_root.clone()),
        manifest_mode,
        DEFAULT_CHUNK_SIZE,
        DEFAULT_MAX_WORKERS,
    );

    // Warm the cache in the order a representative run reads it. Started
    // before FUSE serves; workers block until the mount is live.
    prefetch::spawn(store, opts.mountpoint.clone());

    let mut mount_options = MountOptions::default();
    mount_options.fs_name("ffbox");
    mount_options.force_readdir_plus(true);

    let handle = Session::new(mount_options)
        .mount_with_unprivileged(fs, &opts.mountpoint)
        .await?;

    handle.await?;
    Ok(())
}
