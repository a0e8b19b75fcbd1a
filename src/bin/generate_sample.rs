//! Writes a small local tree of synthetic DESI-like files for trying the
//! CLI and viewer without network access:
//!
//! * `coadd-main-dark-10378.fits` with FIBERMAP and B/R/Z arrays
//! * `rvmod_coadd-main-dark-10378.fits` with the noise-free models
//! * `gaia-index.parquet` / `gaia-index.bin`, a Gaia source id index

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use desi_retriever::fits::{ColumnData, FitsWriter, ImageData, TableColumn};
use desi_retriever::gaia::{PickleValue, Pickler, RECORD_HEADER_LEN};
use desi_retriever::Arm;

const N_TARGETS: usize = 8;
const HPX: i64 = 10378;
const FIRST_TARGETID: i64 = 39627793289890840;
const FIRST_SOURCE_ID: i64 = 1_000_000_000_000;

/// Absorption lines (rest wavelength, width, depth).
const LINES: [(f64, f64, f64); 6] = [
    (3934.8, 3.0, 0.6),
    (3969.6, 3.0, 0.5),
    (4862.7, 4.0, 0.4),
    (5176.7, 2.0, 0.3),
    (6564.6, 4.0, 0.5),
    (8544.4, 2.0, 0.3),
];

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// Wavelength grid of each arm, 0.8 Å steps.
fn wavelength_grid(arm: Arm) -> Vec<f64> {
    let (start, end) = match arm {
        Arm::B => (3600.0, 5800.0),
        Arm::R => (5760.0, 7620.0),
        Arm::Z => (7520.0, 9824.0),
    };
    let n = ((end - start) / 0.8) as usize + 1;
    (0..n).map(|i| start + 0.8 * i as f64).collect()
}

struct Star {
    continuum: f64,
    slope: f64,
    /// Radial velocity in km/s.
    rv: f64,
}

impl Star {
    fn model(&self, wave: &[f64]) -> Vec<f64> {
        let shift = 1.0 + self.rv / 299_792.458;
        wave.iter()
            .map(|&w| {
                let base = self.continuum * (1.0 + self.slope * (w - 6000.0) / 1000.0);
                let absorbed: f64 = LINES
                    .iter()
                    .map(|&(mu, sigma, depth)| gaussian(w, mu * shift, sigma, depth))
                    .sum();
                base * (1.0 - absorbed.min(0.95))
            })
            .collect()
    }
}

fn fibermap(stars: &[Star]) -> Vec<TableColumn> {
    let n = stars.len();
    vec![
        TableColumn::new(
            "TARGETID",
            ColumnData::Int64((0..n as i64).map(|i| FIRST_TARGETID + i).collect()),
        ),
        TableColumn::new("FIBER", ColumnData::Int32((0..n as i32).map(|i| 500 + i).collect())),
        TableColumn::new(
            "OBJTYPE",
            ColumnData::Text {
                width: 3,
                values: vec!["TGT".into(); n],
            },
        ),
        TableColumn::new("RV_TRUE", ColumnData::Float64(stars.iter().map(|s| s.rv).collect())),
    ]
}

fn write_coadd(path: &Path, stars: &[Star], rng: &mut SimpleRng) -> Result<()> {
    let mut w = FitsWriter::new(Vec::new());
    w.write_table("FIBERMAP", &fibermap(stars))?;
    for arm in Arm::ALL {
        let wave = wavelength_grid(arm);
        let npix = wave.len();
        let mut flux = Vec::with_capacity(npix * stars.len());
        let mut ivar = Vec::with_capacity(npix * stars.len());
        let mut mask = Vec::with_capacity(npix * stars.len());
        for star in stars {
            let sigma = 0.05 * star.continuum;
            for (i, m) in star.model(&wave).into_iter().enumerate() {
                // a few bad pixels at the start of each row
                let bad = i < 5;
                flux.push(m as f32 + rng.gauss(0.0, sigma) as f32);
                ivar.push(if bad { 0.0 } else { (1.0 / (sigma * sigma)) as f32 });
                mask.push(if bad { 1 } else { 0 });
            }
        }
        let rows = stars.len();
        w.write_image(&arm.hdu_name("WAVELENGTH"), &[npix], &ImageData::Float64(wave))?;
        w.write_image(&arm.hdu_name("FLUX"), &[npix, rows], &ImageData::Float32(flux))?;
        w.write_image(&arm.hdu_name("IVAR"), &[npix, rows], &ImageData::Float32(ivar))?;
        w.write_image(&arm.hdu_name("MASK"), &[npix, rows], &ImageData::Int32(mask))?;
    }
    fs::write(path, w.finish()?).with_context(|| format!("writing {}", path.display()))
}

fn write_models(path: &Path, stars: &[Star]) -> Result<()> {
    let mut w = FitsWriter::new(Vec::new());
    w.write_table("FIBERMAP", &fibermap(stars))?;
    for arm in Arm::ALL {
        let wave = wavelength_grid(arm);
        let model: Vec<f32> = stars
            .iter()
            .flat_map(|s| s.model(&wave))
            .map(|v| v as f32)
            .collect();
        let npix = wave.len();
        w.write_image(&arm.hdu_name("WAVELENGTH"), &[npix], &ImageData::Float64(wave))?;
        w.write_image(&arm.hdu_name("MODEL"), &[npix, stars.len()], &ImageData::Float32(model))?;
    }
    fs::write(path, w.finish()?).with_context(|| format!("writing {}", path.display()))
}

/// Sidecar index: one pickled record per target, keyed by a made-up
/// Gaia source id.
fn write_gaia_index(dir: &Path, n: usize) -> Result<()> {
    let columns = ["SURVEY", "PROGRAM", "hpx", "TARGETID"]
        .into_iter()
        .map(|c| PickleValue::Str(c.into()))
        .collect();
    let mut records = Pickler::new().dumps(&PickleValue::List(columns));
    records.resize(RECORD_HEADER_LEN as usize, 0);

    let (mut ids, mut pos1, mut pos2) = (Vec::new(), Vec::new(), Vec::new());
    for i in 0..n as i64 {
        let record = PickleValue::Tuple(vec![
            PickleValue::Str("main".into()),
            PickleValue::Str("dark".into()),
            PickleValue::Int(HPX),
            PickleValue::Int(FIRST_TARGETID + i),
        ]);
        ids.push(FIRST_SOURCE_ID + 7 * i);
        pos1.push(records.len() as i64);
        records.extend(Pickler::new().numpy_scalars(true).dumps(&record));
        pos2.push(records.len() as i64);
    }
    fs::write(dir.join("gaia-index.bin"), &records)?;

    let schema = Arc::new(Schema::new(vec![
        Field::new("EDR3_SOURCE_ID", DataType::Int64, false),
        Field::new("pos1", DataType::Int64, false),
        Field::new("pos2", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(Int64Array::from(pos1)),
            Arc::new(Int64Array::from(pos2)),
        ],
    )
    .context("Failed to create RecordBatch")?;

    let file = fs::File::create(dir.join("gaia-index.parquet")).context("Failed to create index file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("Failed to create writer")?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let out: PathBuf = std::env::args().nth(1).unwrap_or_else(|| "sample".into()).into();
    fs::create_dir_all(&out)?;

    let mut rng = SimpleRng::new(42);
    let stars: Vec<Star> = (0..N_TARGETS)
        .map(|_| Star {
            continuum: 5.0 + 20.0 * rng.next_f64(),
            slope: rng.gauss(0.0, 0.2),
            rv: rng.gauss(0.0, 150.0),
        })
        .collect();

    let name = format!("coadd-main-dark-{HPX}.fits");
    write_coadd(&out.join(&name), &stars, &mut rng)?;
    write_models(&out.join(format!("rvmod_{name}")), &stars)?;
    write_gaia_index(&out, stars.len())?;

    println!(
        "Wrote {} targets to {} (TARGETID {}..{}, Gaia ids {} step 7)",
        stars.len(),
        out.display(),
        FIRST_TARGETID,
        FIRST_TARGETID + stars.len() as i64 - 1,
        FIRST_SOURCE_ID
    );
    Ok(())
}
