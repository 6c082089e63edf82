//! ffbox-fuse: the userspace filesystem.
//!
//! Presents an object-store tree as a local mountpoint backed by the cache
//! tree: listings and stats materialize placeholders on first touch, opens
//! fetch bytes (whole-object for small files, chunked for large ones), and
//! everything already cached is served at local-disk speed. A background
//! prefetcher replays the recorded read-order trace to warm the cache.

pub mod driver;
pub mod mount;
pub mod prefetch;

pub use driver::FfboxFs;
pub use mount::{mount, MountOpts};
