//! Fetch DESI spectra and RVSpecfit models for single objects.
//!
//! Files are addressed by release, grouping and object identifiers (or a
//! Gaia source id) and read with cached HTTP range requests, so only the
//! fibermap and the requested rows are transferred.
//!
//! ```no_run
//! use desi_retriever::{DataRelease, ObjectQuery, Retriever, SpectraQuery};
//!
//! let retriever = Retriever::from_env()?;
//! let object = ObjectQuery::new(DataRelease::Dr1)
//!     .healpix("main", "bright", 10378)
//!     .targetid(39627793289890840);
//! let spectra = retriever.get_specs(&SpectraQuery::new(object).with_ivar())?;
//! println!("{} observations", spectra.len());
//! # Ok::<(), desi_retriever::Error>(())
//! ```

pub mod app;
pub mod color;
pub mod config;
pub mod data;
pub mod error;
pub mod fits;
pub mod gaia;
pub mod release;
pub mod remote;
pub mod retriever;
pub mod state;
pub mod ui;

pub use config::{Credentials, RetrieverConfig};
pub use data::extract::SpectraOptions;
pub use data::filter::RowSelector;
pub use data::model::{Arm, ArmModel, ArmSpectrum, FieldValue, ModelRecord, SpectrumRecord};
pub use error::{Error, Result};
pub use gaia::{GaiaIndex, GaiaMatch};
pub use release::{DataRelease, GroupType, Locator, SpecType};
pub use remote::Location;
pub use retriever::{ModelQuery, ObjectQuery, Retriever, SpectraQuery};
