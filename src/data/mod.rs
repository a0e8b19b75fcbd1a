/// Data layer: record types, row selection, extraction and export.
///
/// Architecture:
/// ```text
///   FitsFile (FIBERMAP + {B,R,Z}_{WAVELENGTH,FLUX,MASK,IVAR,MODEL})
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  TARGETID / FIBER / EXPID → row indices
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │ extract   │  row sections per arm → SpectrumRecord / ModelRecord
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  export   │  long-format CSV
///   └──────────┘
/// ```

pub mod export;
pub mod extract;
pub mod filter;
pub mod model;
