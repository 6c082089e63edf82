//! ffbox-store: the object-store client abstraction.
//!
//! One `head/list/get/get_range/put/download` surface over either an
//! S3-compatible bucket or a local "deployed" directory, selected by URL
//! scheme at mount time. Both backends ride the same OpenDAL `Operator`.

pub mod operator;
pub mod source;
pub mod store;

pub use source::Source;
pub use store::{DirListing, ObjectEntry, ObjectMeta, ObjectStore, StoreError, StoreResult};
