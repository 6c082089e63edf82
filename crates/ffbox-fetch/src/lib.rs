//! ffbox-fetch: the chunked range-read engine.
//!
//! Downloads an object in parallel byte-range chunks directly into an
//! mmap'd local file and lets readers block on exactly the chunks their
//! range needs, so a read deep into a large file is served long before the
//! whole object arrives.

mod chunk_map;
mod reader;

pub use reader::{ChunkedReader, FetchError, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WORKERS};
