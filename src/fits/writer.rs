use std::io::Write;

use super::header::HeaderValue;
use super::padded_len;
use crate::error::{Error, Result};

/// Size of one header card.
const CARD_LEN: usize = 80;

/// Format one 80-character card.
fn format_card(keyword: &str, value: &HeaderValue) -> String {
    let value = match value {
        HeaderValue::Str(s) => {
            let escaped = s.replace('\'', "''");
            format!("'{escaped:<8}'")
        }
        other => format!("{:>20}", other.to_string()),
    };
    let card = format!("{keyword:<8}= {value}");
    format!("{card:<CARD_LEN$}")
}

/// Values of one binary-table column.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Logical(Vec<bool>),
    Text { width: usize, values: Vec<String> },
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Logical(v) => v.len(),
            ColumnData::Text { values, .. } => values.len(),
        }
    }

    fn tform(&self) -> String {
        match self {
            ColumnData::Int16(_) => "I".into(),
            ColumnData::Int32(_) => "J".into(),
            ColumnData::Int64(_) => "K".into(),
            ColumnData::Float32(_) => "E".into(),
            ColumnData::Float64(_) => "D".into(),
            ColumnData::Logical(_) => "L".into(),
            ColumnData::Text { width, .. } => format!("{width}A"),
        }
    }

    fn width(&self) -> usize {
        match self {
            ColumnData::Int16(_) => 2,
            ColumnData::Int32(_) | ColumnData::Float32(_) => 4,
            ColumnData::Int64(_) | ColumnData::Float64(_) => 8,
            ColumnData::Logical(_) => 1,
            ColumnData::Text { width, .. } => *width,
        }
    }

    fn write_cell(&self, row: usize, out: &mut Vec<u8>) {
        match self {
            ColumnData::Int16(v) => out.extend(v[row].to_be_bytes()),
            ColumnData::Int32(v) => out.extend(v[row].to_be_bytes()),
            ColumnData::Int64(v) => out.extend(v[row].to_be_bytes()),
            ColumnData::Float32(v) => out.extend(v[row].to_be_bytes()),
            ColumnData::Float64(v) => out.extend(v[row].to_be_bytes()),
            ColumnData::Logical(v) => out.push(if v[row] { b'T' } else { b'F' }),
            ColumnData::Text { width, values } => {
                let mut bytes = values[row].as_bytes().to_vec();
                bytes.resize(*width, b' ');
                out.extend(bytes);
            }
        }
    }
}

/// A named binary-table column.
#[derive(Debug, Clone)]
pub struct TableColumn {
    pub name: String,
    pub data: ColumnData,
}

impl TableColumn {
    pub fn new(name: &str, data: ColumnData) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

/// Pixels of an image extension.
#[derive(Debug, Clone)]
pub enum ImageData {
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl ImageData {
    fn bitpix(&self) -> i64 {
        match self {
            ImageData::Int32(_) => 32,
            ImageData::Float32(_) => -32,
            ImageData::Float64(_) => -64,
        }
    }

    fn len(&self) -> usize {
        match self {
            ImageData::Int32(v) => v.len(),
            ImageData::Float32(v) => v.len(),
            ImageData::Float64(v) => v.len(),
        }
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            ImageData::Int32(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
            ImageData::Float32(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
            ImageData::Float64(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// FitsWriter
// ---------------------------------------------------------------------------

/// Writes a FITS file HDU by HDU: an empty primary, then extensions.
pub struct FitsWriter<W: Write> {
    out: W,
    wrote_primary: bool,
}

impl<W: Write> FitsWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            wrote_primary: false,
        }
    }

    fn write_header(&mut self, cards: &[(&str, HeaderValue)]) -> Result<()> {
        let mut text = String::new();
        for (keyword, value) in cards {
            text.push_str(&format_card(keyword, value));
        }
        text.push_str(&format!("{:<CARD_LEN$}", "END"));
        let mut bytes = text.into_bytes();
        bytes.resize(padded_len(bytes.len() as u64) as usize, b' ');
        self.out.write_all(&bytes)?;
        Ok(())
    }

    fn write_data(&mut self, mut bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        bytes.resize(padded_len(bytes.len() as u64) as usize, 0);
        self.out.write_all(&bytes)?;
        Ok(())
    }

    /// Data-less primary HDU with extra keywords.
    pub fn write_primary(&mut self, extra: &[(&str, HeaderValue)]) -> Result<()> {
        let mut cards = vec![
            ("SIMPLE", HeaderValue::Logical(true)),
            ("BITPIX", HeaderValue::Int(8)),
            ("NAXIS", HeaderValue::Int(0)),
            ("EXTEND", HeaderValue::Logical(true)),
        ];
        cards.extend(extra.iter().cloned());
        self.write_header(&cards)?;
        self.wrote_primary = true;
        Ok(())
    }

    fn ensure_primary(&mut self) -> Result<()> {
        if !self.wrote_primary {
            self.write_primary(&[])?;
        }
        Ok(())
    }

    /// Image extension; `axes` lists `NAXIS1` first.
    pub fn write_image(&mut self, name: &str, axes: &[usize], data: &ImageData) -> Result<()> {
        let expected: usize = axes.iter().product();
        if data.len() != expected {
            return Err(Error::Fits(format!(
                "image {name} has {} pixels, axes need {expected}",
                data.len()
            )));
        }
        self.ensure_primary()?;
        let naxis_keys: Vec<String> = (1..=axes.len()).map(|i| format!("NAXIS{i}")).collect();
        let mut cards = vec![
            ("XTENSION", HeaderValue::Str("IMAGE".into())),
            ("BITPIX", HeaderValue::Int(data.bitpix())),
            ("NAXIS", HeaderValue::Int(axes.len() as i64)),
        ];
        for (key, n) in naxis_keys.iter().zip(axes) {
            cards.push((key.as_str(), HeaderValue::Int(*n as i64)));
        }
        cards.push(("PCOUNT", HeaderValue::Int(0)));
        cards.push(("GCOUNT", HeaderValue::Int(1)));
        cards.push(("EXTNAME", HeaderValue::Str(name.to_string())));
        self.write_header(&cards)?;
        self.write_data(data.to_be_bytes())
    }

    /// Binary-table extension; all columns must have the same length.
    pub fn write_table(&mut self, name: &str, columns: &[TableColumn]) -> Result<()> {
        let rows = columns.first().map(|c| c.data.len()).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.data.len() != rows) {
            return Err(Error::Fits(format!(
                "column {} has {} rows, expected {rows}",
                bad.name,
                bad.data.len()
            )));
        }
        self.ensure_primary()?;
        let row_len: usize = columns.iter().map(|c| c.data.width()).sum();

        let keys: Vec<(String, String)> = (1..=columns.len())
            .map(|i| (format!("TTYPE{i}"), format!("TFORM{i}")))
            .collect();
        let mut cards = vec![
            ("XTENSION", HeaderValue::Str("BINTABLE".into())),
            ("BITPIX", HeaderValue::Int(8)),
            ("NAXIS", HeaderValue::Int(2)),
            ("NAXIS1", HeaderValue::Int(row_len as i64)),
            ("NAXIS2", HeaderValue::Int(rows as i64)),
            ("PCOUNT", HeaderValue::Int(0)),
            ("GCOUNT", HeaderValue::Int(1)),
            ("TFIELDS", HeaderValue::Int(columns.len() as i64)),
        ];
        for ((ttype, tform), col) in keys.iter().zip(columns) {
            cards.push((ttype.as_str(), HeaderValue::Str(col.name.clone())));
            cards.push((tform.as_str(), HeaderValue::Str(col.data.tform())));
        }
        cards.push(("EXTNAME", HeaderValue::Str(name.to_string())));
        self.write_header(&cards)?;

        let mut data = Vec::with_capacity(row_len * rows);
        for row in 0..rows {
            for col in columns {
                col.data.write_cell(row, &mut data);
            }
        }
        self.write_data(data)
    }

    pub fn finish(mut self) -> Result<W> {
        self.ensure_primary()?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::BLOCK_LEN;

    #[test]
    fn cards_are_eighty_columns() {
        let card = format_card("BITPIX", &HeaderValue::Int(-64));
        assert_eq!(card.len(), CARD_LEN);
        assert_eq!(&card[8..10], "= ");
        assert_eq!(card[10..30].trim(), "-64");
        let card = format_card("EXTNAME", &HeaderValue::Str("O'B".into()));
        assert_eq!(&card[10..20], "'O''B    '");
    }

    #[test]
    fn headers_and_data_fill_whole_blocks() {
        let mut w = FitsWriter::new(Vec::new());
        w.write_image("B_FLUX", &[3, 2], &ImageData::Float32(vec![0.0; 6]))
            .unwrap();
        let bytes = w.finish().unwrap();
        // primary header, image header, image data
        assert_eq!(bytes.len(), 3 * BLOCK_LEN);

        let mut w = FitsWriter::new(Vec::new());
        assert!(w
            .write_image("B_FLUX", &[3, 2], &ImageData::Float32(vec![0.0; 5]))
            .is_err());
    }
}
