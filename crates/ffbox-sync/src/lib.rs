//! ffbox-sync: the publish side.
//!
//! `deploy` writes per-directory manifests into a local tree so it can be
//! mounted directly; `push` uploads the tree to an object store and writes
//! the manifests as objects; the recorder captures the read-order trace of
//! a representative run at push time.

pub mod deploy;
pub mod push;
pub mod recorder;

pub use deploy::{deploy_tree, DeployStats};
pub use push::{push_tree, ProgressFn, PushStats};
pub use recorder::record_read_order;

/// Bounded concurrency for manifest production and uploads.
pub(crate) const SYNC_WORKERS: usize = 20;
