//! Shared fixtures: synthetic coadd files, a sidecar Gaia index and a
//! loopback HTTP server that honours `Range` requests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parquet::arrow::ArrowWriter;

use desi_retriever::fits::{ColumnData, FitsWriter, ImageData, TableColumn};
use desi_retriever::gaia::{PickleValue, Pickler, RECORD_HEADER_LEN};
use desi_retriever::Arm;

pub const NPIX: usize = 50;
pub const TARGETS: [i64; 3] = [39627793289890840, 39627793289890841, 39627793289890842];

/// Coadd with three targets. Flux of row `r`, arm `a` is `100 * a + r`.
pub fn coadd_bytes() -> Vec<u8> {
    let mut w = FitsWriter::new(Vec::new());
    w.write_table(
        "FIBERMAP",
        &[
            TableColumn::new("TARGETID", ColumnData::Int64(TARGETS.to_vec())),
            TableColumn::new("FIBER", ColumnData::Int32(vec![10, 11, 12])),
        ],
    )
    .unwrap();
    for (a, arm) in Arm::ALL.into_iter().enumerate() {
        let wave: Vec<f64> = (0..NPIX).map(|i| 3600.0 + 2000.0 * a as f64 + i as f64).collect();
        let flux: Vec<f32> = (0..TARGETS.len())
            .flat_map(|r| std::iter::repeat((100 * a + r) as f32).take(NPIX))
            .collect();
        let rows = TARGETS.len();
        w.write_image(&arm.hdu_name("WAVELENGTH"), &[NPIX], &ImageData::Float64(wave))
            .unwrap();
        w.write_image(&arm.hdu_name("FLUX"), &[NPIX, rows], &ImageData::Float32(flux.clone()))
            .unwrap();
        w.write_image(&arm.hdu_name("IVAR"), &[NPIX, rows], &ImageData::Float32(vec![4.0; NPIX * rows]))
            .unwrap();
        w.write_image(&arm.hdu_name("MASK"), &[NPIX, rows], &ImageData::Int32(vec![0; NPIX * rows]))
            .unwrap();
        w.write_image(&arm.hdu_name("MODEL"), &[NPIX, rows], &ImageData::Float32(flux))
            .unwrap();
    }
    w.finish().unwrap()
}

/// Writes `keys.parquet` and `records.bin` into `dir`. Source id
/// `1000 + r` maps to `TARGETS[r]`.
pub fn write_sidecar(dir: &Path) {
    let columns = ["SURVEY", "PROGRAM", "hpx", "TARGETID"]
        .into_iter()
        .map(|c| PickleValue::Str(c.into()))
        .collect();
    let mut records = Pickler::new().dumps(&PickleValue::List(columns));
    records.resize(RECORD_HEADER_LEN as usize, 0);

    let (mut ids, mut pos1, mut pos2) = (Vec::new(), Vec::new(), Vec::new());
    for (r, &targetid) in TARGETS.iter().enumerate() {
        let record = PickleValue::Tuple(vec![
            PickleValue::Str("main".into()),
            PickleValue::Str("bright".into()),
            PickleValue::Int(10378),
            PickleValue::Int(targetid),
        ]);
        ids.push(1000 + r as i64);
        pos1.push(records.len() as i64);
        records.extend(Pickler::new().numpy_scalars(true).dumps(&record));
        pos2.push(records.len() as i64);
    }
    std::fs::write(dir.join("records.bin"), &records).unwrap();

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
    .unwrap();
    let file = std::fs::File::create(dir.join("keys.parquet")).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

// ---------------------------------------------------------------------------
// Range server
// ---------------------------------------------------------------------------

struct Files {
    files: HashMap<String, Vec<u8>>,
    /// Paths under `protected/` need this `Authorization` header.
    authorization: String,
    requests: AtomicUsize,
}

/// Loopback server over a fixed set of files, on its own runtime thread.
pub struct RangeServer {
    pub addr: SocketAddr,
    state: Arc<Files>,
}

impl RangeServer {
    pub fn start(files: HashMap<String, Vec<u8>>, authorization: &str) -> Self {
        let state = Arc::new(Files {
            files,
            authorization: authorization.to_string(),
            requests: AtomicUsize::new(0),
        });
        let (tx, rx) = mpsc::channel();
        let app = Router::new()
            .route("/*path", get(serve_file))
            .with_state(state.clone());
        thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });
        let addr = rx.recv().unwrap();
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{path}", self.addr)
    }

    /// Requests served so far, length requests included.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    (start <= end && start < len).then(|| (start, end.min(len - 1)))
}

async fn serve_file(
    State(state): State<Arc<Files>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if path.starts_with("protected/") {
        let given = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        if given != Some(state.authorization.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let Some(data) = state.files.get(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, data.len()));
    match range {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{}", data.len()))],
            data[start..=end].to_vec(),
        )
            .into_response(),
        None => (StatusCode::OK, data.clone()).into_response(),
    }
}
