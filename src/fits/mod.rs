/// FITS access for DESI spectra files over a range reader. Headers are
/// parsed by `fitsrs`; single image rows and `FIBERMAP` rows are then
/// read from the data offsets it reports.
pub mod file;
pub mod header;
pub mod table;
pub mod writer;

pub use file::{FitsFile, Hdu, HduKind};
pub use header::{Header, HeaderValue};
pub use table::{BinTable, Column, ColumnFormat};
pub use writer::{ColumnData, FitsWriter, ImageData, TableColumn};

/// Size of a FITS logical record.
pub const BLOCK_LEN: usize = 2880;

/// Pad `len` up to a whole number of FITS blocks.
pub fn padded_len(len: u64) -> u64 {
    len.div_ceil(BLOCK_LEN as u64) * BLOCK_LEN as u64
}
