//! ffbox-cache: the on-disk cache tree behind a mount, plus the per-path
//! lock table that serializes cache-state transitions.

pub mod locks;
pub mod tree;

pub use locks::LockTable;
pub use tree::{CacheTree, XATTR_COMPLETE, XATTR_URL};
