use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host serving both the collaboration and the public data trees.
pub const DATA_HOST: &str = "data.desi.lbl.gov";

const HTTP_ROOT: &str = "https://data.desi.lbl.gov/desi";
const PUBLIC_HTTP_ROOT: &str = "https://data.desi.lbl.gov";
const NERSC_ROOT: &str = "/global/cfs/cdirs/desi";
const PORTAL_ROOT: &str = "https://portal.nersc.gov/project/desi";

/// Number of fibers served by one spectrograph.
pub const FIBERS_PER_SPECTROGRAPH: i64 = 500;

// ---------------------------------------------------------------------------
// DataRelease
// ---------------------------------------------------------------------------

/// A DESI processing era. Each era lays its files out slightly differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataRelease {
    Andes,
    Blanc,
    Everest,
    Fuji,
    Jura,
    Loa,
    Dr1,
}

impl DataRelease {
    pub const ALL: [DataRelease; 7] = [
        DataRelease::Andes,
        DataRelease::Blanc,
        DataRelease::Everest,
        DataRelease::Fuji,
        DataRelease::Jura,
        DataRelease::Loa,
        DataRelease::Dr1,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DataRelease::Andes => "andes",
            DataRelease::Blanc => "blanc",
            DataRelease::Everest => "everest",
            DataRelease::Fuji => "fuji",
            DataRelease::Jura => "jura",
            DataRelease::Loa => "loa",
            DataRelease::Dr1 => "dr1",
        }
    }

    /// Name of the spectroscopic reduction directory.
    pub fn default_dataset(self) -> &'static str {
        match self {
            DataRelease::Dr1 => "iron",
            other => other.name(),
        }
    }

    /// RVSpecfit run identifier used when none is given.
    pub fn default_run(self) -> &'static str {
        match self {
            DataRelease::Andes => "200507",
            DataRelease::Blanc => "210112",
            DataRelease::Everest => "210803",
            DataRelease::Fuji => "220309",
            DataRelease::Jura | DataRelease::Loa => "240620",
            DataRelease::Dr1 => "240520",
        }
    }

    /// Tree of a public release, relative to the data host and to the
    /// NERSC root.
    fn public_path(self) -> Option<&'static str> {
        match self {
            DataRelease::Dr1 => Some("/public/dr1"),
            _ => None,
        }
    }

    /// Public releases are served without credentials.
    pub fn requires_auth(self) -> bool {
        self.public_path().is_none()
    }

    /// The release whose public tree contains `path` (a URL path on the
    /// data host).
    pub fn serving(path: &str) -> Option<DataRelease> {
        DataRelease::ALL.into_iter().find(|r| {
            r.public_path()
                .and_then(|p| path.strip_prefix(p))
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    fn root(self, nersc: bool) -> String {
        match (self.public_path(), nersc) {
            (Some(public), true) => format!("{NERSC_ROOT}{public}"),
            (Some(public), false) => format!("{PUBLIC_HTTP_ROOT}{public}"),
            (None, true) => NERSC_ROOT.to_string(),
            (None, false) => HTTP_ROOT.to_string(),
        }
    }

    fn supports(self, group: GroupType) -> bool {
        use GroupType::*;
        match self {
            DataRelease::Andes | DataRelease::Blanc => matches!(group, Tiles),
            DataRelease::Everest => matches!(group, Healpix | Cumulative | PerNight),
            _ => matches!(group, Healpix | Tiles | Cumulative),
        }
    }

    /// Where the Gaia source id index of this release lives, if it has one.
    pub fn gaia_index_source(self, nersc: bool) -> Option<GaiaIndexSource> {
        let users = format!("{}/users/koposov", self.root_for_users(nersc));
        match self {
            DataRelease::Andes | DataRelease::Blanc => None,
            DataRelease::Everest => Some(GaiaIndexSource::Table {
                url: format!("{users}/gaiaid_db/gaia-everest-coadd-hpx-index.fits"),
            }),
            DataRelease::Fuji => Some(GaiaIndexSource::Table {
                url: format!("{users}/gaiaid_db/indexes/gaia-fuji-coadd-hpx-index.fits"),
            }),
            DataRelease::Jura => Some(GaiaIndexSource::Sidecar {
                base: format!("{users}/gaiaid_db"),
                parquet: "aa.parquet".into(),
                records: "aa.bin".into(),
            }),
            DataRelease::Loa => Some(GaiaIndexSource::Sidecar {
                base: format!("{users}/gaiaid_db/indexes"),
                parquet: "gaia-index-loa-coadd_241127.parquet".into(),
                records: "gaia-index-loa-coadd_241127.bin".into(),
            }),
            DataRelease::Dr1 => Some(GaiaIndexSource::Sidecar {
                base: format!("{users}/dr1/gaia_id_db"),
                parquet: "gaia-index-dr1-coadd_250319.parquet".into(),
                records: "gaia-index-dr1-coadd_250319.bin".into(),
            }),
        }
    }

    fn root_for_users(self, nersc: bool) -> &'static str {
        match (self, nersc) {
            (_, true) => NERSC_ROOT,
            (DataRelease::Dr1, false) => PORTAL_ROOT,
            (_, false) => HTTP_ROOT,
        }
    }
}

impl fmt::Display for DataRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataRelease {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if lower == "iron" {
            return Ok(DataRelease::Dr1);
        }
        DataRelease::ALL
            .into_iter()
            .find(|r| r.name() == lower)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown data release '{s}'")))
    }
}

/// Layout of a release's Gaia source id index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GaiaIndexSource {
    /// A single FITS binary table sorted by source id.
    Table { url: String },
    /// A Parquet key/offset table next to a file of pickled records.
    Sidecar {
        base: String,
        parquet: String,
        records: String,
    },
}

// ---------------------------------------------------------------------------
// Grouping and file types
// ---------------------------------------------------------------------------

/// How spectra are grouped into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    Healpix,
    Tiles,
    Cumulative,
    PerNight,
    Exposure,
}

impl GroupType {
    pub fn is_tile_based(self) -> bool {
        !matches!(self, GroupType::Healpix)
    }
}

impl FromStr for GroupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "healpix" => Ok(GroupType::Healpix),
            "tiles" => Ok(GroupType::Tiles),
            "tiles/cumulative" | "cumulative" => Ok(GroupType::Cumulative),
            "pernight" | "tiles/pernight" => Ok(GroupType::PerNight),
            "exposure" => Ok(GroupType::Exposure),
            other => Err(Error::InvalidQuery(format!("unknown group type '{other}'"))),
        }
    }
}

/// Which reduction product to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecType {
    Coadd,
    Spectra,
    Cframe,
}

impl SpecType {
    pub fn prefix(self) -> &'static str {
        match self {
            SpecType::Coadd => "coadd",
            SpecType::Spectra => "spectra",
            SpecType::Cframe => "cframe",
        }
    }
}

impl FromStr for SpecType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coadd" => Ok(SpecType::Coadd),
            "spectra" => Ok(SpecType::Spectra),
            "cframe" => Ok(SpecType::Cframe),
            other => Err(Error::InvalidQuery(format!("unknown spec type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Identifies the file holding an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Healpix {
        survey: String,
        program: String,
        hpx: i64,
    },
    Tile {
        tileid: i64,
        night: String,
        spectrograph: i64,
    },
}

impl Locator {
    /// Spectrograph serving `fiber`.
    pub fn spectrograph_for_fiber(fiber: i64) -> i64 {
        fiber / FIBERS_PER_SPECTROGRAPH
    }
}

/// Everything the path builder needs besides the locator.
#[derive(Debug, Clone, Copy)]
pub struct Layout<'a> {
    pub release: DataRelease,
    pub dataset: &'a str,
    pub group: GroupType,
    pub spec_type: SpecType,
    pub nersc: bool,
}

impl Layout<'_> {
    fn check(&self, locator: &Locator) -> Result<()> {
        if !self.release.supports(self.group) {
            return Err(Error::Unsupported(format!(
                "{:?} grouping is not available for {}",
                self.group, self.release
            )));
        }
        if matches!(self.release, DataRelease::Andes | DataRelease::Blanc)
            && self.spec_type == SpecType::Cframe
        {
            return Err(Error::Unsupported(format!(
                "cframe files are not available for {}",
                self.release
            )));
        }
        match (self.group.is_tile_based(), locator) {
            (true, Locator::Tile { .. }) | (false, Locator::Healpix { .. }) => Ok(()),
            _ => Err(Error::InvalidQuery(format!(
                "{:?} grouping needs a {} locator",
                self.group,
                if self.group.is_tile_based() { "tile" } else { "healpix" }
            ))),
        }
    }

    fn file_name(&self, locator: &Locator) -> String {
        let spec = self.spec_type.prefix();
        match locator {
            Locator::Healpix {
                survey,
                program,
                hpx,
            } => format!("{spec}-{survey}-{program}-{hpx}.fits"),
            Locator::Tile {
                tileid,
                night,
                spectrograph,
            } => {
                let night = match self.group {
                    GroupType::Cumulative => format!("thru{night}"),
                    _ => night.clone(),
                };
                format!("{spec}-{spectrograph}-{tileid}-{night}.fits")
            }
        }
    }

    fn group_dir(&self, locator: &Locator) -> String {
        match locator {
            Locator::Healpix {
                survey,
                program,
                hpx,
            } => format!("healpix/{survey}/{program}/{}/{hpx}", hpx / 100),
            Locator::Tile { tileid, night, .. } => match self.group {
                GroupType::Cumulative => format!("tiles/cumulative/{tileid}/{night}"),
                GroupType::PerNight => format!("tiles/pernight/{tileid}/{night}"),
                _ => format!("tiles/{tileid}/{night}"),
            },
        }
    }

    /// Path or URL of a spectra file.
    pub fn spectra_path(&self, locator: &Locator) -> Result<String> {
        self.check(locator)?;
        Ok(format!(
            "{}/spectro/redux/{}/{}/{}",
            self.release.root(self.nersc),
            self.dataset,
            self.group_dir(locator),
            self.file_name(locator)
        ))
    }

    /// Path or URL of an RVSpecfit model file for run `run`.
    pub fn model_path(&self, run: &str, locator: &Locator) -> Result<String> {
        self.check(locator)?;
        let root = self.release.root(self.nersc);
        let dataset = self.dataset;
        let fname = format!("rvmod_{}", self.file_name(locator));
        let path = match (self.release, locator) {
            (DataRelease::Dr1, _) => format!(
                "{root}/vac/dr1/mws/{dataset}/v1.0/rv_output/{run}/{}/{fname}",
                self.group_dir(locator)
            ),
            (DataRelease::Andes | DataRelease::Blanc, Locator::Tile { tileid, night, .. }) => {
                format!("{root}/science/mws/redux/{dataset}/rv_output/{run}/{tileid}/{night}/{fname}")
            }
            (
                DataRelease::Everest,
                Locator::Healpix {
                    survey,
                    program,
                    hpx,
                },
            ) => {
                let survey_short = if survey.starts_with("sv") {
                    "sv"
                } else {
                    survey.as_str()
                };
                format!(
                    "{root}/science/mws/redux/{dataset}/rv_output/{run}/healpix_{survey_short}_{program}/{}/{hpx}/{fname}",
                    hpx / 100
                )
            }
            (DataRelease::Everest, Locator::Tile { .. }) => format!(
                "{root}/science/mws/redux/{dataset}/{}/{fname}",
                self.group_dir(locator)
            ),
            _ => format!(
                "{root}/science/mws/redux/{dataset}/rv_output/{run}/{}/{fname}",
                self.group_dir(locator)
            ),
        };
        Ok(path)
    }
}
