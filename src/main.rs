use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value as JsonValue};

use desi_retriever::app::run_viewer;
use desi_retriever::data::export::save_csv;
use desi_retriever::release::GaiaIndexSource;
use desi_retriever::state::ViewerState;
use desi_retriever::{
    DataRelease, GroupType, Location, ModelQuery, ModelRecord, ObjectQuery, Retriever,
    RetrieverConfig, RowSelector, SpecType, SpectraOptions, SpectraQuery, SpectrumRecord,
};

#[derive(Parser)]
#[command(name = "desi-retriever", about = "Fetch DESI spectra and RVSpecfit models")]
struct Cli {
    /// JSON configuration file (defaults to $DESI_RETRIEVER_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read from /global/cfs instead of over HTTPS.
    #[arg(long, global = true)]
    nersc: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the spectra of one object.
    Spectra {
        #[command(flatten)]
        object: ObjectArgs,

        /// Also return the pixel masks.
        #[arg(long)]
        mask: bool,

        /// Also return the inverse variances.
        #[arg(long)]
        ivar: bool,

        /// Also return the fibermap row.
        #[arg(long)]
        fibermap: bool,

        /// Overlay the RVSpecfit model in the viewer and CSV.
        #[arg(long)]
        with_model: bool,

        /// RVSpecfit run for --with-model.
        #[arg(long)]
        run: Option<String>,

        /// rvmod file to read the models from. Needed with --with-model
        /// when --location names the spectra file.
        #[arg(long, requires = "with_model")]
        model_location: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Fetch the RVSpecfit models of one object.
    Models {
        #[command(flatten)]
        object: ObjectArgs,

        /// RVSpecfit run (release default if omitted).
        #[arg(long)]
        run: Option<String>,
    },

    /// Look up a Gaia EDR3 source id in a release's index.
    Gaia {
        /// Gaia EDR3 source id.
        source_id: i64,

        /// Data release.
        #[arg(short, long, default_value = "dr1")]
        release: DataRelease,

        /// Directory or URL of a sidecar index to use instead of the
        /// release's published one.
        #[arg(long, requires_all = ["keys", "records"])]
        index_base: Option<String>,

        /// Parquet key table under --index-base.
        #[arg(long)]
        keys: Option<String>,

        /// Pickled record file under --index-base.
        #[arg(long)]
        records: Option<String>,
    },
}

#[derive(Args)]
struct ObjectArgs {
    /// Data release (andes, blanc, everest, fuji, jura, loa, dr1).
    #[arg(short, long, default_value = "dr1")]
    release: DataRelease,

    /// Read this URL or path instead of building one from the query.
    #[arg(long)]
    location: Option<String>,

    /// Gaia EDR3 source id; fills survey, program, hpx and targetid.
    #[arg(long)]
    gaia: Option<i64>,

    #[arg(long)]
    targetid: Option<i64>,

    #[arg(long)]
    fiber: Option<i64>,

    #[arg(long)]
    expid: Option<i64>,

    #[arg(long)]
    tileid: Option<i64>,

    /// Night (YYYYMMDD, or `all` / `deep` for coadds).
    #[arg(long)]
    night: Option<String>,

    /// Healpix (nside 64, nested).
    #[arg(long)]
    hpx: Option<i64>,

    /// Survey (main, sv1, ...).
    #[arg(long)]
    survey: Option<String>,

    /// Program (dark, bright, ...).
    #[arg(long)]
    program: Option<String>,

    #[arg(long)]
    spectrograph: Option<i64>,

    /// healpix, tiles, cumulative, pernight.
    #[arg(long, default_value = "healpix")]
    group_type: GroupType,

    /// coadd, spectra, cframe.
    #[arg(long, default_value = "coadd")]
    spec_type: SpecType,

    /// Reduction name (release default if omitted).
    #[arg(long)]
    dataset: Option<String>,
}

#[derive(Args)]
struct OutputArgs {
    /// Write the first observation as CSV.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Open the spectrum viewer.
    #[arg(long)]
    plot: bool,

    /// Viewer title.
    #[arg(long)]
    title: Option<String>,

    /// Flux percentiles used as y-limits, e.g. "1,99".
    #[arg(long)]
    percentiles: Option<String>,
}

impl ObjectArgs {
    fn query(&self) -> ObjectQuery {
        ObjectQuery {
            release: self.release,
            gaia_edr3_source_id: self.gaia,
            tileid: self.tileid,
            night: self.night.clone(),
            fiber: self.fiber,
            hpx: self.hpx,
            targetid: self.targetid,
            expid: self.expid,
            group_type: self.group_type,
            spec_type: self.spec_type,
            dataset: self.dataset.clone(),
            survey: self.survey.clone(),
            program: self.program.clone(),
            spectrograph: self.spectrograph,
        }
    }

    fn selector(&self) -> RowSelector {
        RowSelector {
            targetid: self.targetid,
            fiber: self.fiber,
            expid: self.expid,
        }
    }
}

fn parse_percentiles(text: &str) -> Result<(f64, f64)> {
    let (lo, hi) = text
        .split_once(',')
        .context("percentiles must look like LOW,HIGH")?;
    let lo: f64 = lo.trim().parse().context("parsing lower percentile")?;
    let hi: f64 = hi.trim().parse().context("parsing upper percentile")?;
    if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo >= hi {
        bail!("percentiles must satisfy 0 <= LOW < HIGH <= 100");
    }
    Ok((lo, hi))
}

fn print_json(value: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Where the models for a `spectra --with-model` call come from. An
/// explicit spectra file has no model file derivable from it.
fn model_location<'a>(object: &'a ObjectArgs, model_location: Option<&'a str>) -> Result<Option<&'a str>> {
    match (model_location, &object.location) {
        (Some(location), _) => Ok(Some(location)),
        (None, Some(_)) => bail!("--with-model with --location needs --model-location"),
        (None, None) => Ok(None),
    }
}

fn fetch_models(
    retriever: &Retriever,
    object: &ObjectArgs,
    location: Option<&str>,
    run: Option<&str>,
) -> Result<Vec<ModelRecord>> {
    let records = match location {
        Some(location) => retriever.read_models_at(&Location::parse(location), &object.selector())?,
        None => {
            let mut query = ModelQuery::new(object.query());
            query.run = run.map(str::to_string);
            retriever.get_rvspec_models(&query)?
        }
    };
    Ok(records)
}

fn fetch_spectra(retriever: &Retriever, object: &ObjectArgs, options: SpectraOptions) -> Result<Vec<SpectrumRecord>> {
    let records = match &object.location {
        Some(location) => {
            retriever.read_spectra_at(&Location::parse(location), &object.selector(), options)?
        }
        None => retriever.get_specs(&SpectraQuery {
            object: object.query(),
            options,
        })?,
    };
    Ok(records)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RetrieverConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RetrieverConfig::from_env()?,
    };
    if cli.nersc {
        config.nersc = true;
    }
    let retriever = Retriever::new(config)?;

    match cli.command {
        Commands::Spectra {
            object,
            mask,
            ivar,
            fibermap,
            with_model,
            run,
            model_location: models_at,
            output,
        } => {
            let options = SpectraOptions {
                mask,
                ivar,
                fibermap,
            };
            let models_at = if with_model {
                model_location(&object, models_at.as_deref())?
            } else {
                None
            };
            let spectra = fetch_spectra(&retriever, &object, options)?;
            if spectra.is_empty() {
                bail!("no spectra found");
            }
            let models = if with_model {
                fetch_models(&retriever, &object, models_at, run.as_deref())?
            } else {
                Vec::new()
            };

            if let Some(path) = &output.csv {
                save_csv(path, &spectra[0], models.first())
                    .with_context(|| format!("writing {}", path.display()))?;
                log::info!("wrote {}", path.display());
            } else if !output.plot {
                let rows = spectra.iter().map(|s| JsonValue::Object(s.to_map())).collect();
                print_json(&JsonValue::Array(rows))?;
            }

            if output.plot {
                let percentiles = output.percentiles.as_deref().map(parse_percentiles).transpose()?;
                let state = ViewerState::new(spectra, models)
                    .with_title(output.title)
                    .with_percentiles(percentiles);
                run_viewer(state).map_err(|e| anyhow::anyhow!("viewer failed: {e}"))?;
            }
        }
        Commands::Models { object, run } => {
            let models = fetch_models(&retriever, &object, object.location.as_deref(), run.as_deref())?;
            if models.is_empty() {
                bail!("no models found");
            }
            let rows = models.iter().map(|m| JsonValue::Object(m.to_map())).collect();
            print_json(&JsonValue::Array(rows))?;
        }
        Commands::Gaia {
            source_id,
            release,
            index_base,
            keys,
            records,
        } => {
            if let (Some(base), Some(parquet), Some(records)) = (index_base, keys, records) {
                let index = retriever.open_gaia_index(&GaiaIndexSource::Sidecar {
                    base,
                    parquet,
                    records,
                })?;
                retriever.set_gaia_index(release, index);
            }
            let found = retriever.lookup_gaia(release, source_id)?;
            print_json(&json!({
                "source_id": found.source_id,
                "survey": found.survey,
                "program": found.program,
                "hpx": found.hpx,
                "targetid": found.targetid,
                "fields": found
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>(),
            }))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn percentiles_parse_and_validate() {
        assert_eq!(parse_percentiles("1, 99").unwrap(), (1.0, 99.0));
        assert!(parse_percentiles("99,1").is_err());
        assert!(parse_percentiles("50").is_err());
    }

    #[test]
    fn spectra_command_reads_query_flags() {
        let cli = Cli::try_parse_from([
            "desi-retriever",
            "spectra",
            "--release",
            "fuji",
            "--group-type",
            "cumulative",
            "--tileid",
            "80605",
            "--night",
            "20210205",
            "--fiber",
            "1234",
            "--ivar",
        ])
        .unwrap();
        let Commands::Spectra { object, ivar, .. } = cli.command else {
            panic!("expected spectra");
        };
        assert!(ivar);
        let q = object.query();
        assert_eq!(q.release, DataRelease::Fuji);
        assert_eq!(q.group_type, GroupType::Cumulative);
        assert_eq!(q.night.as_deref(), Some("20210205"));
    }

    #[test]
    fn explicit_spectra_file_needs_a_model_file() {
        let cli = Cli::try_parse_from([
            "desi-retriever",
            "spectra",
            "--location",
            "/data/coadd-main-dark-10378.fits",
            "--targetid",
            "7",
            "--with-model",
        ])
        .unwrap();
        let Commands::Spectra { object, model_location: m, .. } = cli.command else {
            panic!("expected spectra");
        };
        assert!(model_location(&object, m.as_deref()).is_err());

        let cli = Cli::try_parse_from([
            "desi-retriever",
            "spectra",
            "--location",
            "/data/coadd-main-dark-10378.fits",
            "--targetid",
            "7",
            "--with-model",
            "--model-location",
            "/data/rvmod_coadd-main-dark-10378.fits",
        ])
        .unwrap();
        let Commands::Spectra { object, model_location: m, .. } = cli.command else {
            panic!("expected spectra");
        };
        assert_eq!(
            model_location(&object, m.as_deref()).unwrap(),
            Some("/data/rvmod_coadd-main-dark-10378.fits")
        );

        // a built query derives the model file itself
        let cli = Cli::try_parse_from(["desi-retriever", "spectra", "--hpx", "10378", "--with-model"]).unwrap();
        let Commands::Spectra { object, model_location: m, .. } = cli.command else {
            panic!("expected spectra");
        };
        assert_eq!(model_location(&object, m.as_deref()).unwrap(), None);

        assert!(Cli::try_parse_from([
            "desi-retriever",
            "spectra",
            "--model-location",
            "/data/rvmod.fits",
        ])
        .is_err());
    }

    #[test]
    fn gaia_index_override_needs_all_parts() {
        assert!(Cli::try_parse_from(["desi-retriever", "gaia", "42", "--index-base", "/tmp"]).is_err());
        assert!(Cli::try_parse_from([
            "desi-retriever",
            "gaia",
            "42",
            "--index-base",
            "/tmp",
            "--keys",
            "k.parquet",
            "--records",
            "r.bin",
        ])
        .is_ok());
    }
}
