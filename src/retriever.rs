use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use url::Url;

use crate::config::{Credentials, RetrieverConfig};
use crate::data::extract::{self, SpectraOptions};
use crate::data::filter::RowSelector;
use crate::data::model::{ModelRecord, SpectrumRecord};
use crate::error::{Error, Result};
use crate::fits::FitsFile;
use crate::gaia::{self, GaiaIndex, GaiaMatch};
use crate::release::{DataRelease, GaiaIndexSource, GroupType, Layout, Locator, SpecType, DATA_HOST};
use crate::remote::{build_agent, ByteSource, FileSource, HttpSource, Location, RangeCache, RangeReader};

type Reader = RangeReader<Box<dyn ByteSource>>;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Identifies one object in one release.
///
/// Healpix grouping needs `survey`, `program` and `hpx`; tile-based
/// grouping needs `tileid`, `night` and either `fiber` or `spectrograph`.
/// A Gaia source id fills in `survey`, `program`, `hpx` and `targetid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectQuery {
    pub release: DataRelease,
    pub gaia_edr3_source_id: Option<i64>,
    pub tileid: Option<i64>,
    pub night: Option<String>,
    pub fiber: Option<i64>,
    pub hpx: Option<i64>,
    pub targetid: Option<i64>,
    pub expid: Option<i64>,
    pub group_type: GroupType,
    pub spec_type: SpecType,
    /// Reduction name; the release default when unset.
    pub dataset: Option<String>,
    pub survey: Option<String>,
    pub program: Option<String>,
    pub spectrograph: Option<i64>,
}

impl ObjectQuery {
    pub fn new(release: DataRelease) -> Self {
        Self {
            release,
            gaia_edr3_source_id: None,
            tileid: None,
            night: None,
            fiber: None,
            hpx: None,
            targetid: None,
            expid: None,
            group_type: GroupType::Healpix,
            spec_type: SpecType::Coadd,
            dataset: None,
            survey: None,
            program: None,
            spectrograph: None,
        }
    }

    pub fn healpix(mut self, survey: &str, program: &str, hpx: i64) -> Self {
        self.group_type = GroupType::Healpix;
        self.survey = Some(survey.to_string());
        self.program = Some(program.to_string());
        self.hpx = Some(hpx);
        self
    }

    pub fn tile(mut self, group_type: GroupType, tileid: i64, night: impl ToString) -> Self {
        self.group_type = group_type;
        self.tileid = Some(tileid);
        self.night = Some(night.to_string());
        self
    }

    pub fn targetid(mut self, targetid: i64) -> Self {
        self.targetid = Some(targetid);
        self
    }

    pub fn fiber(mut self, fiber: i64) -> Self {
        self.fiber = Some(fiber);
        self
    }

    pub fn expid(mut self, expid: i64) -> Self {
        self.expid = Some(expid);
        self
    }

    pub fn gaia(mut self, source_id: i64) -> Self {
        self.gaia_edr3_source_id = Some(source_id);
        self
    }

    pub fn spec_type(mut self, spec_type: SpecType) -> Self {
        self.spec_type = spec_type;
        self
    }

    pub fn dataset(mut self, dataset: &str) -> Self {
        self.dataset = Some(dataset.to_string());
        self
    }

    pub fn spectrograph(mut self, spectrograph: i64) -> Self {
        self.spectrograph = Some(spectrograph);
        self
    }
}

/// Arguments of [`Retriever::get_specs`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpectraQuery {
    pub object: ObjectQuery,
    pub options: SpectraOptions,
}

impl SpectraQuery {
    pub fn new(object: ObjectQuery) -> Self {
        Self {
            object,
            options: SpectraOptions::default(),
        }
    }

    pub fn with_mask(mut self) -> Self {
        self.options.mask = true;
        self
    }

    pub fn with_ivar(mut self) -> Self {
        self.options.ivar = true;
        self
    }

    pub fn with_fibermap(mut self) -> Self {
        self.options.fibermap = true;
        self
    }
}

/// Arguments of [`Retriever::get_rvspec_models`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelQuery {
    pub object: ObjectQuery,
    /// RVSpecfit run; the release default when unset.
    pub run: Option<String>,
}

impl ModelQuery {
    pub fn new(object: ObjectQuery) -> Self {
        Self { object, run: None }
    }

    pub fn run(mut self, run: &str) -> Self {
        self.run = Some(run.to_string());
        self
    }
}

/// A query resolved down to a file and a row selection.
#[derive(Debug, Clone)]
struct Plan {
    release: DataRelease,
    dataset: String,
    group: GroupType,
    spec_type: SpecType,
    locator: Locator,
    selector: RowSelector,
}

impl Plan {
    fn layout(&self, nersc: bool) -> Layout<'_> {
        Layout {
            release: self.release,
            dataset: &self.dataset,
            group: self.group,
            spec_type: self.spec_type,
            nersc,
        }
    }
}

// ---------------------------------------------------------------------------
// Retriever
// ---------------------------------------------------------------------------

/// Entry point: resolves queries to files and reads them through a shared
/// range cache.
pub struct Retriever {
    config: RetrieverConfig,
    agent: ureq::Agent,
    credentials: Mutex<Option<Credentials>>,
    ranges: Mutex<RangeCache>,
    gaia: Mutex<HashMap<DataRelease, Arc<GaiaIndex>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Retriever {
    pub fn new(config: RetrieverConfig) -> Result<Self> {
        config.validate()?;
        let agent = build_agent(Duration::from_secs(config.timeout_secs));
        let ranges = RangeCache::new(config.cache_capacity, config.block_size);
        Ok(Self {
            config,
            agent,
            credentials: Mutex::new(None),
            ranges: Mutex::new(ranges),
            gaia: Mutex::new(HashMap::new()),
        })
    }

    /// Configuration from `$DESI_RETRIEVER_CONFIG` / `$DESI_NERSC`.
    pub fn from_env() -> Result<Self> {
        Self::new(RetrieverConfig::from_env()?)
    }

    /// Use these credentials instead of the dot-file.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        *lock(&self.credentials) = Some(credentials);
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Number of URLs with cached blocks.
    pub fn cached_urls(&self) -> usize {
        lock(&self.ranges).len()
    }

    fn credentials(&self) -> Result<Credentials> {
        let mut slot = lock(&self.credentials);
        if let Some(creds) = slot.as_ref() {
            return Ok(creds.clone());
        }
        let creds = self.config.load_credentials()?;
        debug!("loaded credentials for user {}", creds.user);
        *slot = Some(creds.clone());
        Ok(creds)
    }

    fn credentials_for(&self, url: &Url) -> Result<Option<Credentials>> {
        let needs_auth = url.host_str() == Some(DATA_HOST)
            && DataRelease::serving(url.path()).map_or(true, DataRelease::requires_auth);
        if needs_auth {
            self.credentials().map(Some)
        } else {
            Ok(None)
        }
    }

    fn parse_url(url: &str) -> Result<Url> {
        Url::parse(url).map_err(|e| Error::InvalidQuery(format!("bad URL '{url}': {e}")))
    }

    /// A byte source for `location`, authenticated when the host needs it.
    fn open_source(&self, location: &Location) -> Result<Box<dyn ByteSource>> {
        match location {
            Location::Local(path) => Ok(Box::new(FileSource::open(path)?)),
            Location::Remote(url) => {
                let parsed = Self::parse_url(url)?;
                let creds = self.credentials_for(&parsed)?;
                Ok(Box::new(HttpSource::new(self.agent.clone(), url.as_str(), creds.as_ref())))
            }
        }
    }

    /// Run `f` on the FITS file at `location`. Remote block caches are taken
    /// from the range cache and returned afterwards, also when `f` fails.
    fn with_fits<T, F>(&self, location: &Location, f: F) -> Result<T>
    where
        F: FnOnce(&mut FitsFile<&mut Reader>) -> Result<T>,
    {
        let source = self.open_source(location)?;
        match location {
            Location::Local(_) => {
                let mut reader = RangeReader::new(source, self.config.block_size)?;
                let mut fits = FitsFile::open(&mut reader)?;
                f(&mut fits)
            }
            Location::Remote(url) => {
                let blocks = lock(&self.ranges).checkout(url);
                let mut reader = RangeReader::with_blocks(source, blocks)?;
                let result = FitsFile::open(&mut reader).and_then(|mut fits| f(&mut fits));
                debug!(
                    "{} range requests for {} ({} bytes cached)",
                    reader.requests(),
                    url,
                    reader.blocks().cached_bytes()
                );
                lock(&self.ranges).checkin(url, reader.into_blocks());
                result
            }
        }
    }

    // -- explicit locations --

    /// Spectra of the rows matching `selector` in the file at `location`.
    pub fn read_spectra_at(
        &self,
        location: &Location,
        selector: &RowSelector,
        options: SpectraOptions,
    ) -> Result<Vec<SpectrumRecord>> {
        self.with_fits(location, |fits| extract::read_spectra(fits, selector, options))
    }

    /// Models of the rows matching `selector` in the file at `location`.
    pub fn read_models_at(
        &self,
        location: &Location,
        selector: &RowSelector,
    ) -> Result<Vec<ModelRecord>> {
        self.with_fits(location, |fits| extract::read_models(fits, selector))
    }

    // -- queries --

    fn plan(&self, query: &ObjectQuery) -> Result<Plan> {
        let mut survey = query.survey.clone();
        let mut program = query.program.clone();
        let mut hpx = query.hpx;
        let mut targetid = query.targetid;

        if let Some(source_id) = query.gaia_edr3_source_id {
            let found = self.lookup_gaia(query.release, source_id)?;
            info!(
                "Gaia {} → {}/{} hpx {} TARGETID {}",
                source_id, found.survey, found.program, found.hpx, found.targetid
            );
            survey = Some(found.survey);
            program = Some(found.program);
            hpx = Some(found.hpx);
            targetid = Some(found.targetid);
        }

        if targetid.is_none() && query.fiber.is_none() {
            return Err(Error::InvalidQuery(
                "either a target id, a fiber or a Gaia source id is needed".into(),
            ));
        }

        let locator = if query.group_type.is_tile_based() {
            let missing = |what: &str| {
                Error::InvalidQuery(format!("{what} is required for {:?} grouping", query.group_type))
            };
            let spectrograph = match (query.spectrograph, query.fiber) {
                (Some(sp), _) => sp,
                (None, Some(fiber)) => Locator::spectrograph_for_fiber(fiber),
                (None, None) => {
                    return Err(missing("a fiber (to identify the spectrograph)"));
                }
            };
            Locator::Tile {
                tileid: query.tileid.ok_or_else(|| missing("tileid"))?,
                night: query.night.clone().ok_or_else(|| missing("night"))?,
                spectrograph,
            }
        } else {
            let missing = |what: &str| Error::InvalidQuery(format!("{what} is required for healpix grouping"));
            Locator::Healpix {
                survey: survey.ok_or_else(|| missing("survey"))?,
                program: program.ok_or_else(|| missing("program"))?,
                hpx: hpx.ok_or_else(|| missing("hpx"))?,
            }
        };

        Ok(Plan {
            release: query.release,
            dataset: query
                .dataset
                .clone()
                .unwrap_or_else(|| query.release.default_dataset().to_string()),
            group: query.group_type,
            spec_type: query.spec_type,
            locator,
            selector: RowSelector {
                targetid,
                fiber: query.fiber,
                expid: query.expid,
            },
        })
    }

    /// Path or URL of the spectra file a query resolves to.
    pub fn spectra_location(&self, query: &ObjectQuery) -> Result<Location> {
        let plan = self.plan(query)?;
        let path = plan.layout(self.config.nersc).spectra_path(&plan.locator)?;
        Ok(Location::parse(&path))
    }

    /// Spectra of one object. Returns one record per matching observation.
    pub fn get_specs(&self, query: &SpectraQuery) -> Result<Vec<SpectrumRecord>> {
        let plan = self.plan(&query.object)?;
        let path = plan.layout(self.config.nersc).spectra_path(&plan.locator)?;
        info!("reading spectra from {path}");
        self.read_spectra_at(&Location::parse(&path), &plan.selector, query.options)
    }

    /// RVSpecfit best-fit models of one object.
    pub fn get_rvspec_models(&self, query: &ModelQuery) -> Result<Vec<ModelRecord>> {
        let plan = self.plan(&query.object)?;
        let run = query
            .run
            .as_deref()
            .unwrap_or_else(|| plan.release.default_run());
        let path = plan.layout(self.config.nersc).model_path(run, &plan.locator)?;
        info!("reading models from {path}");
        self.read_models_at(&Location::parse(&path), &plan.selector)
    }

    // -- Gaia --

    /// The Gaia index of `release`, loaded on first use.
    pub fn gaia_index(&self, release: DataRelease) -> Result<Arc<GaiaIndex>> {
        if let Some(index) = lock(&self.gaia).get(&release) {
            return Ok(index.clone());
        }
        let source = release.gaia_index_source(self.config.nersc).ok_or_else(|| {
            Error::Unsupported(format!("{release} has no Gaia source id index"))
        })?;
        let index = Arc::new(self.open_gaia_index(&source)?);
        info!("Gaia index for {release}: {} entries", index.len());
        lock(&self.gaia).insert(release, index.clone());
        Ok(index)
    }

    /// Use `index` for `release` instead of loading the published one.
    pub fn set_gaia_index(&self, release: DataRelease, index: GaiaIndex) {
        lock(&self.gaia).insert(release, Arc::new(index));
    }

    /// Load an index from an explicit source.
    pub fn open_gaia_index(&self, source: &GaiaIndexSource) -> Result<GaiaIndex> {
        match source {
            GaiaIndexSource::Table { url } => {
                self.with_fits(&Location::parse(url), |fits| GaiaIndex::from_fits(fits))
            }
            GaiaIndexSource::Sidecar {
                base,
                parquet,
                records,
            } => {
                let keys = match Location::join(base, parquet) {
                    Location::Local(path) => gaia::load_key_table(&path)?,
                    Location::Remote(url) => {
                        let parsed = Self::parse_url(&url)?;
                        let creds = self.credentials_for(&parsed)?;
                        let http = HttpSource::new(self.agent.clone(), url.as_str(), creds.as_ref());
                        gaia::fetch_key_table(
                            &self.config.cache_dir.join(parquet),
                            self.config.index_download_attempts,
                            || http.fetch_all(),
                        )?
                    }
                };
                let records = self.open_source(&Location::join(base, records))?;
                GaiaIndex::sidecar(keys, records)
            }
        }
    }

    /// Survey coordinates of a Gaia source in `release`.
    pub fn lookup_gaia(&self, release: DataRelease, source_id: i64) -> Result<GaiaMatch> {
        self.gaia_index(release)?.resolve(source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retriever() -> Retriever {
        Retriever::new(RetrieverConfig::default()).unwrap()
    }

    #[test]
    fn healpix_query_builds_public_url() {
        let q = ObjectQuery::new(DataRelease::Dr1)
            .healpix("main", "bright", 10378)
            .targetid(39627793289890840);
        let loc = retriever().spectra_location(&q).unwrap();
        assert_eq!(
            loc.to_string(),
            "https://data.desi.lbl.gov/public/dr1/spectro/redux/iron/healpix/main/bright/103/10378/coadd-main-bright-10378.fits"
        );
    }

    #[test]
    fn tile_query_derives_spectrograph_from_fiber() {
        let q = ObjectQuery::new(DataRelease::Fuji)
            .tile(GroupType::Cumulative, 80605, 20210205)
            .fiber(1234);
        let loc = retriever().spectra_location(&q).unwrap();
        assert!(loc
            .to_string()
            .ends_with("tiles/cumulative/80605/20210205/coadd-2-80605-thru20210205.fits"));
    }

    #[test]
    fn tile_query_without_fiber_or_spectrograph_fails() {
        let q = ObjectQuery::new(DataRelease::Jura)
            .tile(GroupType::Tiles, 1000, "20210517")
            .targetid(5);
        assert!(matches!(
            retriever().spectra_location(&q),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn query_needs_an_identifier() {
        let q = ObjectQuery::new(DataRelease::Loa).healpix("sv1", "dark", 17683);
        assert!(matches!(
            retriever().spectra_location(&q),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn nersc_queries_are_local_paths() {
        let config = RetrieverConfig {
            nersc: true,
            ..RetrieverConfig::default()
        };
        let q = ObjectQuery::new(DataRelease::Loa)
            .healpix("sv1", "dark", 17683)
            .targetid(1);
        let loc = Retriever::new(config).unwrap().spectra_location(&q).unwrap();
        assert!(loc.is_local());
        assert!(loc.to_string().starts_with("/global/cfs/cdirs/desi/spectro/redux/loa/"));
    }

    #[test]
    fn releases_without_index_are_unsupported() {
        assert!(matches!(
            retriever().gaia_index(DataRelease::Andes),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn credentials_only_for_private_data_host() {
        let r = retriever().with_credentials(Credentials {
            user: "u".into(),
            password: "p".into(),
        });
        let private = Url::parse("https://data.desi.lbl.gov/desi/spectro/x.fits").unwrap();
        let public = Url::parse("https://data.desi.lbl.gov/public/dr1/x.fits").unwrap();
        let other = Url::parse("http://127.0.0.1:8000/desi/x.fits").unwrap();
        assert!(r.credentials_for(&private).unwrap().is_some());
        assert!(r.credentials_for(&public).unwrap().is_none());
        assert!(r.credentials_for(&other).unwrap().is_none());
    }

    #[test]
    fn built_dr1_urls_need_no_credentials() {
        // asking this retriever for credentials fails
        let config = RetrieverConfig {
            credentials_file: Some("/nonexistent/.desi_http_user".into()),
            ..RetrieverConfig::default()
        };
        let r = Retriever::new(config).unwrap();
        let q = ObjectQuery::new(DataRelease::Dr1)
            .healpix("main", "bright", 10378)
            .targetid(39627793289890840);
        let url = Url::parse(&r.spectra_location(&q).unwrap().to_string()).unwrap();
        assert!(r.credentials_for(&url).unwrap().is_none());

        let q = ObjectQuery::new(DataRelease::Loa)
            .healpix("main", "bright", 10378)
            .targetid(39627793289890840);
        let url = Url::parse(&r.spectra_location(&q).unwrap().to_string()).unwrap();
        assert!(r.credentials_for(&url).is_err());
    }
}
