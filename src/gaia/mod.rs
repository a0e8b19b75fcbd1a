/// Gaia EDR3 source id → survey coordinates.
///
/// ```text
///   key table (Parquet, sorted)          record file
///   ┌──────────────┬──────┬──────┐      ┌───────────────────────┐
///   │EDR3_SOURCE_ID│ pos1 │ pos2 │ ───► │ [0,1000) column names │
///   └──────────────┴──────┴──────┘      │ [pos1,pos2) record    │
///        binary search                  └───────────────────────┘
/// ```
///
/// Older releases ship a single FITS table instead; both answer
/// [`GaiaIndex::search_id`].

pub mod index;
pub mod pickle;

pub use index::{
    fetch_key_table, load_key_table, GaiaIndex, GaiaMatch, IndexRecord, KeyTable,
    RECORD_HEADER_LEN,
};
pub use pickle::{PickleValue, Pickler};
