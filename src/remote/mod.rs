/// Remote access layer: byte sources, block caches and the range reader.
///
/// ```text
///   HttpSource / FileSource      (ByteSource: length request + byte ranges)
///            │
///            ▼
///   ┌──────────────┐
///   │ RangeReader  │  Read + Seek, fetches whole blocks on demand
///   └──────────────┘
///            │  into_blocks / with_blocks
///            ▼
///   ┌──────────────┐
///   │  RangeCache  │  LRU of BlockCache keyed by URL
///   └──────────────┘
/// ```
pub mod cache;
pub mod reader;
pub mod source;

pub use cache::{BlockCache, LruCache, RangeCache};
pub use reader::RangeReader;
pub use source::{build_agent, ByteSource, FileSource, HttpSource, Location};
