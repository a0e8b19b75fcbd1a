use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{bail, Context};
use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Int64Type};
use arrow::record_batch::RecordBatch;
use log::{debug, info, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::pickle::{self, PickleValue};
use crate::data::model::FieldValue;
use crate::error::{Error, Result};
use crate::fits::FitsFile;
use crate::remote::ByteSource;

/// Bytes at the start of a sidecar record file reserved for the pickled
/// column names.
pub const RECORD_HEADER_LEN: u64 = 1000;

/// Column name → one value per matching index entry.
pub type IndexRecord = BTreeMap<String, Vec<FieldValue>>;

// ---------------------------------------------------------------------------
// Key table (Parquet)
// ---------------------------------------------------------------------------

/// Sorted source ids and the byte span of each record in the sidecar file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyTable {
    pub source_ids: Vec<i64>,
    pub pos1: Vec<u64>,
    pub pos2: Vec<u64>,
}

impl KeyTable {
    pub fn len(&self) -> usize {
        self.source_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_ids.is_empty()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pos1.len() != self.source_ids.len() || self.pos2.len() != self.source_ids.len() {
            bail!(
                "column lengths differ: {} ids, {} pos1, {} pos2",
                self.source_ids.len(),
                self.pos1.len(),
                self.pos2.len()
            );
        }
        if let Some(i) = self.source_ids.windows(2).position(|w| w[0] > w[1]) {
            bail!("EDR3_SOURCE_ID is not sorted at row {}", i + 1);
        }
        if let Some(i) = self.pos1.iter().zip(&self.pos2).position(|(a, b)| a > b) {
            bail!("record span at row {i} ends before it starts");
        }
        Ok(())
    }
}

/// Read `EDR3_SOURCE_ID`, `pos1`, `pos2` from a Parquet file.
pub fn load_key_table(path: &Path) -> Result<KeyTable> {
    read_key_table(path).map_err(|e| Error::Index(format!("{}: {e:#}", path.display())))
}

fn read_key_table(path: &Path) -> anyhow::Result<KeyTable> {
    let file = fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut table = KeyTable::default();
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        table.source_ids.extend(int_column(&batch, "EDR3_SOURCE_ID")?);
        table.pos1.extend(offset_column(&batch, "pos1")?);
        table.pos2.extend(offset_column(&batch, "pos2")?);
    }
    table.validate()?;
    Ok(table)
}

/// An integer column of any width, widened to `i64`.
fn int_column(batch: &RecordBatch, name: &str) -> anyhow::Result<Vec<i64>> {
    let col = batch
        .column_by_name(name)
        .with_context(|| format!("Parquet file missing '{name}' column"))?;
    match col.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {}
        other => bail!("column '{name}' has type {other:?}, expected an integer"),
    }
    if col.null_count() > 0 {
        bail!("column '{name}' contains nulls");
    }
    let widened = arrow::compute::cast(col, &DataType::Int64)
        .with_context(|| format!("casting '{name}' to Int64"))?;
    Ok(widened.as_primitive::<Int64Type>().values().to_vec())
}

fn offset_column(batch: &RecordBatch, name: &str) -> anyhow::Result<Vec<u64>> {
    int_column(batch, name)?
        .into_iter()
        .map(|v| u64::try_from(v).with_context(|| format!("negative offset {v} in '{name}'")))
        .collect()
}

/// Load the key table from `local`, downloading it again whenever it cannot
/// be read. The file is read up to `attempts + 1` times and downloaded up to
/// `attempts` times.
pub fn fetch_key_table<F>(local: &Path, attempts: u32, mut download: F) -> Result<KeyTable>
where
    F: FnMut() -> Result<Vec<u8>>,
{
    let mut attempt = 0;
    loop {
        match load_key_table(local) {
            Ok(table) => {
                info!("loaded Gaia key table {} ({} ids)", local.display(), table.len());
                return Ok(table);
            }
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => debug!("cannot use cached key table: {e}"),
        }
        attempt += 1;
        info!("downloading Gaia key table to {}", local.display());
        match download().and_then(|bytes| store(local, &bytes)) {
            Ok(()) => info!("downloaded {}", local.display()),
            Err(e) => warn!(
                "failed to download the Gaia index file ({e}); you may want to update desi-retriever"
            ),
        }
    }
}

fn store(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// GaiaIndex
// ---------------------------------------------------------------------------

/// Source id index of one release.
pub enum GaiaIndex {
    /// Parquet key table plus a file of pickled records.
    Sidecar(SidecarIndex),
    /// Everything in one FITS binary table.
    Table(TableIndex),
}

pub struct SidecarIndex {
    keys: KeyTable,
    columns: Vec<String>,
    records: Box<dyn ByteSource>,
}

pub struct TableIndex {
    source_ids: Vec<i64>,
    columns: BTreeMap<String, Vec<FieldValue>>,
}

/// Half-open range of rows of sorted `keys` equal to `key`.
fn equal_range(keys: &[i64], key: i64) -> std::ops::Range<usize> {
    let lo = keys.partition_point(|&k| k < key);
    let hi = keys.partition_point(|&k| k <= key);
    lo..hi
}

impl GaiaIndex {
    /// Pair a key table with its record file; the column names are read
    /// from the record file header.
    pub fn sidecar(keys: KeyTable, records: Box<dyn ByteSource>) -> Result<Self> {
        let len = records.content_length()?;
        if len == 0 {
            return Err(Error::Index(format!("{} is empty", records.describe())));
        }
        let header = records.fetch_range(0, RECORD_HEADER_LEN.min(len) - 1)?;
        let columns = match pickle::loads(&header)? {
            PickleValue::List(items) | PickleValue::Tuple(items) => items
                .into_iter()
                .map(|v| match v {
                    PickleValue::Str(s) => Ok(s),
                    other => Err(Error::Index(format!("column name {other:?} is not a string"))),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(Error::Index(format!(
                    "record header holds {other:?}, expected a list of column names"
                )))
            }
        };
        debug!("Gaia record columns: {:?}", columns);
        Ok(GaiaIndex::Sidecar(SidecarIndex {
            keys,
            columns,
            records,
        }))
    }

    /// Build from the first binary-table extension of a FITS index.
    pub fn from_fits<R: Read + Seek>(fits: &mut FitsFile<R>) -> Result<Self> {
        let hdu = fits.hdu_at(1)?;
        let table = fits.read_table(&hdu)?;
        let source_ids = table.column_i64("EDR3_SOURCE_ID")?;
        if let Some(i) = source_ids.windows(2).position(|w| w[0] > w[1]) {
            return Err(Error::Index(format!(
                "EDR3_SOURCE_ID is not sorted at row {}",
                i + 1
            )));
        }
        let mut columns = BTreeMap::new();
        for column in table.columns() {
            if column.name.eq_ignore_ascii_case("EDR3_SOURCE_ID") {
                continue;
            }
            let values = (0..table.num_rows())
                .map(|row| table.cell(row, &column.name))
                .collect::<Result<Vec<_>>>()?;
            columns.insert(column.name.clone(), values);
        }
        Ok(GaiaIndex::Table(TableIndex {
            source_ids,
            columns,
        }))
    }

    pub fn len(&self) -> usize {
        match self {
            GaiaIndex::Sidecar(s) => s.keys.len(),
            GaiaIndex::Table(t) => t.source_ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column names of the returned records.
    pub fn columns(&self) -> Vec<String> {
        match self {
            GaiaIndex::Sidecar(s) => s.columns.clone(),
            GaiaIndex::Table(t) => t.columns.keys().cloned().collect(),
        }
    }

    /// All entries for `source_id`, as column → values, or `None` when the id
    /// is not indexed.
    pub fn search_id(&self, source_id: i64) -> Result<Option<IndexRecord>> {
        match self {
            GaiaIndex::Sidecar(s) => s.search_id(source_id),
            GaiaIndex::Table(t) => Ok(t.search_id(source_id)),
        }
    }

    /// Survey coordinates of the first entry for `source_id`.
    pub fn resolve(&self, source_id: i64) -> Result<GaiaMatch> {
        let record = self
            .search_id(source_id)?
            .ok_or(Error::ObjectNotFound(source_id))?;
        GaiaMatch::from_record(source_id, &record)
    }
}

impl SidecarIndex {
    fn search_id(&self, source_id: i64) -> Result<Option<IndexRecord>> {
        let rows = equal_range(&self.keys.source_ids, source_id);
        if rows.is_empty() {
            return Ok(None);
        }
        let mut record: IndexRecord = self
            .columns
            .iter()
            .map(|c| (c.clone(), Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            let (start, end) = (self.keys.pos1[row], self.keys.pos2[row]);
            if end == start {
                return Err(Error::Index(format!("empty record span for row {row}")));
            }
            let raw = self.records.fetch_range(start, end - 1)?;
            let values = pickle::loads(&raw)?;
            let values = values.as_seq().ok_or_else(|| {
                Error::Index(format!("record at {start} is not a tuple: {values:?}"))
            })?;
            if values.len() != self.columns.len() {
                return Err(Error::Index(format!(
                    "record at {start} has {} values for {} columns",
                    values.len(),
                    self.columns.len()
                )));
            }
            for (column, value) in self.columns.iter().zip(values) {
                if let Some(slot) = record.get_mut(column) {
                    slot.push(value.to_field_value());
                }
            }
        }
        Ok(Some(record))
    }
}

impl TableIndex {
    fn search_id(&self, source_id: i64) -> Option<IndexRecord> {
        let rows = equal_range(&self.source_ids, source_id);
        if rows.is_empty() {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(name, values)| (name.clone(), values[rows.clone()].to_vec()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// GaiaMatch
// ---------------------------------------------------------------------------

/// What a spectra query needs from an index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GaiaMatch {
    pub source_id: i64,
    pub survey: String,
    pub program: String,
    pub hpx: i64,
    pub targetid: i64,
    /// Every column of the first entry.
    pub fields: BTreeMap<String, FieldValue>,
}

impl GaiaMatch {
    pub fn from_record(source_id: i64, record: &IndexRecord) -> Result<Self> {
        let first = |names: &[&str]| -> Option<&FieldValue> {
            names.iter().find_map(|name| {
                record
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .and_then(|(_, v)| v.first())
            })
        };
        let missing = |what: &str| Error::Index(format!("index entry for {source_id} has no {what}"));
        let text = |names: &[&str], what: &str| -> Result<String> {
            match first(names) {
                Some(FieldValue::String(s)) => Ok(s.trim().to_string()),
                Some(other) => Err(Error::Index(format!(
                    "index entry for {source_id} has a non-string {what}: {other}"
                ))),
                None => Err(missing(what)),
            }
        };

        let survey = text(&["SURVEY"], "survey")?;
        let program = text(&["PROGRAM", "subsurvey"], "program")?;
        let hpx = first(&["hpx", "HEALPIX"])
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| missing("healpix"))?;
        let targetid = first(&["TARGETID"])
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| missing("TARGETID"))?;
        let fields = record
            .iter()
            .filter_map(|(k, v)| v.first().map(|first| (k.clone(), first.clone())))
            .collect();

        Ok(GaiaMatch {
            source_id,
            survey,
            program,
            hpx,
            targetid,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::gaia::pickle::Pickler;

    struct MemorySource {
        data: Vec<u8>,
        calls: Arc<AtomicUsize>,
    }

    impl ByteSource for MemorySource {
        fn describe(&self) -> &str {
            "memory"
        }

        fn content_length(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let end = (end as usize + 1).min(self.data.len());
            Ok(self.data[start as usize..end].to_vec())
        }
    }

    fn s(v: &str) -> PickleValue {
        PickleValue::Str(v.into())
    }

    /// Record file with three entries, the middle id observed twice.
    fn sidecar() -> (GaiaIndex, Arc<AtomicUsize>) {
        let columns = PickleValue::List(vec![s("SURVEY"), s("PROGRAM"), s("hpx"), s("TARGETID")]);
        let mut data = Pickler::new().dumps(&columns);
        data.resize(RECORD_HEADER_LEN as usize, 0);

        let rows = [
            (11, "main", "dark", 9000, 100),
            (22, "sv1", "bright", 17683, 200),
            (22, "main", "bright", 17684, 201),
            (33, "sv3", "backup", 5, 300),
        ];
        let mut keys = KeyTable::default();
        for (id, survey, program, hpx, targetid) in rows {
            let record = PickleValue::Tuple(vec![
                s(survey),
                s(program),
                PickleValue::Int(hpx),
                PickleValue::Int(targetid),
            ]);
            let start = data.len() as u64;
            data.extend(Pickler::new().numpy_scalars(true).dumps(&record));
            keys.source_ids.push(id);
            keys.pos1.push(start);
            keys.pos2.push(data.len() as u64);
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let source = MemorySource {
            data,
            calls: calls.clone(),
        };
        (GaiaIndex::sidecar(keys, Box::new(source)).unwrap(), calls)
    }

    #[test]
    fn equal_range_finds_all_duplicates() {
        let keys = [1, 3, 3, 3, 7];
        assert_eq!(equal_range(&keys, 3), 1..4);
        assert!(equal_range(&keys, 4).is_empty());
        assert!(equal_range(&keys, 9).is_empty());
        assert!(equal_range(&[], 1).is_empty());
    }

    #[test]
    fn sidecar_returns_every_matching_record() {
        let (index, calls) = sidecar();
        assert_eq!(index.columns(), vec!["SURVEY", "PROGRAM", "hpx", "TARGETID"]);
        let before = calls.load(Ordering::SeqCst);

        let record = index.search_id(22).unwrap().unwrap();
        assert_eq!(
            record["SURVEY"],
            vec![FieldValue::String("sv1".into()), FieldValue::String("main".into())]
        );
        assert_eq!(
            record["TARGETID"],
            vec![FieldValue::Integer(200), FieldValue::Integer(201)]
        );
        assert_eq!(calls.load(Ordering::SeqCst) - before, 2);
    }

    #[test]
    fn unknown_id_is_none_and_resolve_fails() {
        let (index, calls) = sidecar();
        let before = calls.load(Ordering::SeqCst);
        assert!(index.search_id(12).unwrap().is_none());
        assert!(index.search_id(99).unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert!(matches!(index.resolve(12), Err(Error::ObjectNotFound(12))));
    }

    #[test]
    fn resolve_uses_first_entry() {
        let (index, _) = sidecar();
        let m = index.resolve(33).unwrap();
        assert_eq!(m.survey, "sv3");
        assert_eq!(m.program, "backup");
        assert_eq!(m.hpx, 5);
        assert_eq!(m.targetid, 300);
        assert_eq!(m.fields.len(), 4);
    }

    #[test]
    fn match_accepts_fits_index_column_names() {
        let mut record = IndexRecord::new();
        record.insert("survey".into(), vec![FieldValue::String("sv1 ".into())]);
        record.insert("subsurvey".into(), vec![FieldValue::String("dark".into())]);
        record.insert("hpx".into(), vec![FieldValue::Integer(17683)]);
        record.insert("TARGETID".into(), vec![FieldValue::Integer(39627793289890840)]);
        record.insert("row".into(), vec![FieldValue::Integer(12)]);
        let m = GaiaMatch::from_record(7, &record).unwrap();
        assert_eq!(m.survey, "sv1");
        assert_eq!(m.program, "dark");
        assert_eq!(m.targetid, 39627793289890840);
    }

    #[test]
    fn match_needs_text_survey_and_program() {
        let mut record = IndexRecord::new();
        record.insert("SURVEY".into(), vec![FieldValue::Null]);
        record.insert("PROGRAM".into(), vec![FieldValue::String("dark".into())]);
        record.insert("hpx".into(), vec![FieldValue::Integer(17683)]);
        record.insert("TARGETID".into(), vec![FieldValue::Integer(1)]);
        assert!(matches!(GaiaMatch::from_record(7, &record), Err(Error::Index(_))));

        record.insert("SURVEY".into(), vec![FieldValue::String("main".into())]);
        record.insert(
            "PROGRAM".into(),
            vec![FieldValue::Array(vec![FieldValue::String("dark".into())])],
        );
        assert!(matches!(GaiaMatch::from_record(7, &record), Err(Error::Index(_))));

        record.remove("PROGRAM");
        assert!(matches!(GaiaMatch::from_record(7, &record), Err(Error::Index(_))));
    }

    #[test]
    fn unsorted_key_table_is_rejected() {
        let keys = KeyTable {
            source_ids: vec![5, 3],
            pos1: vec![0, 10],
            pos2: vec![10, 20],
        };
        assert!(keys.validate().is_err());
    }

    #[test]
    fn failed_downloads_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("keys.parquet");
        let mut downloads = 0;
        let result = fetch_key_table(&local, 2, || {
            downloads += 1;
            Err(Error::NotFound("keys.parquet".into()))
        });
        assert!(matches!(result, Err(Error::Index(_))));
        assert_eq!(downloads, 2);
    }
}
