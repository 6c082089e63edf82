pub mod config;
pub mod error;
pub mod manifest;
pub mod readorder;

pub use error::{FfboxError, FfboxResult};
pub use manifest::{DirManifest, ManifestEntry, DIR_META_NAME};
pub use readorder::{TraceOp, TraceRecord, META_DIR, READ_ORDER_KEY};
