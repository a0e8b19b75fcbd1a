use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};

use super::header::Header;
use crate::data::model::FieldValue;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Column descriptions
// ---------------------------------------------------------------------------

/// Parsed `TFORMn`: repeat count and type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnFormat {
    pub repeat: usize,
    pub code: char,
}

impl ColumnFormat {
    pub fn parse(tform: &str) -> Result<Self> {
        let tform = tform.trim();
        let digits: String = tform.chars().take_while(|c| c.is_ascii_digit()).collect();
        let repeat = if digits.is_empty() {
            1
        } else {
            digits
                .parse()
                .map_err(|_| Error::Fits(format!("bad repeat count in TFORM '{tform}'")))?
        };
        let code = tform[digits.len()..]
            .chars()
            .next()
            .ok_or_else(|| Error::Fits(format!("TFORM '{tform}' has no type code")))?;
        if !matches!(
            code,
            'L' | 'X' | 'B' | 'I' | 'J' | 'K' | 'A' | 'E' | 'D' | 'C' | 'M' | 'P' | 'Q'
        ) {
            return Err(Error::Fits(format!("unknown TFORM type code '{code}'")));
        }
        Ok(Self { repeat, code })
    }

    /// Bytes one cell occupies in a row.
    pub fn width(&self) -> usize {
        match self.code {
            'X' => self.repeat.div_ceil(8),
            'L' | 'B' | 'A' => self.repeat,
            'I' => 2 * self.repeat,
            'J' | 'E' => 4 * self.repeat,
            'K' | 'D' | 'C' | 'P' => 8 * self.repeat,
            _ => 16 * self.repeat,
        }
    }

    fn element_len(&self) -> usize {
        match self.code {
            'L' | 'B' | 'A' => 1,
            'I' => 2,
            'J' | 'E' => 4,
            'K' | 'D' | 'C' | 'P' => 8,
            _ => 16,
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self.code, 'B' | 'I' | 'J' | 'K')
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub format: ColumnFormat,
    /// Byte offset of the cell within a row.
    pub offset: usize,
    pub tscal: f64,
    pub tzero: f64,
}

impl Column {
    fn scaled(&self) -> bool {
        self.tscal != 1.0 || self.tzero != 0.0
    }

    fn int_element(&self, bytes: &[u8]) -> i128 {
        match self.format.code {
            'B' => bytes[0] as i128,
            'I' => BigEndian::read_i16(bytes) as i128,
            'J' => BigEndian::read_i32(bytes) as i128,
            _ => BigEndian::read_i64(bytes) as i128,
        }
    }

    fn decode_element(&self, bytes: &[u8]) -> FieldValue {
        match self.format.code {
            'L' => match bytes[0] {
                b'T' => FieldValue::Bool(true),
                b'F' => FieldValue::Bool(false),
                _ => FieldValue::Null,
            },
            'B' | 'I' | 'J' | 'K' => {
                let raw = self.int_element(bytes);
                if self.tscal == 1.0 && self.tzero.fract() == 0.0 {
                    let v = raw + self.tzero as i128;
                    match i64::try_from(v) {
                        Ok(i) => FieldValue::Integer(i),
                        Err(_) => FieldValue::Float(v as f64),
                    }
                } else {
                    FieldValue::Float(self.tzero + self.tscal * raw as f64)
                }
            }
            'E' | 'D' => {
                let raw = if self.format.code == 'E' {
                    BigEndian::read_f32(bytes) as f64
                } else {
                    BigEndian::read_f64(bytes)
                };
                if self.scaled() {
                    FieldValue::Float(self.tzero + self.tscal * raw)
                } else {
                    FieldValue::Float(raw)
                }
            }
            'C' => FieldValue::Array(vec![
                FieldValue::Float(BigEndian::read_f32(&bytes[..4]) as f64),
                FieldValue::Float(BigEndian::read_f32(&bytes[4..8]) as f64),
            ]),
            'M' => FieldValue::Array(vec![
                FieldValue::Float(BigEndian::read_f64(&bytes[..8])),
                FieldValue::Float(BigEndian::read_f64(&bytes[8..16])),
            ]),
            // Variable-length array descriptors point into the heap.
            _ => FieldValue::Null,
        }
    }

    /// Decode this column's cell from one row.
    pub fn decode(&self, row: &[u8]) -> FieldValue {
        let cell = &row[self.offset..self.offset + self.format.width()];
        let fmt = self.format;
        if fmt.repeat == 0 {
            return FieldValue::Null;
        }
        match fmt.code {
            'A' => {
                let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
                let text = String::from_utf8_lossy(&cell[..end]);
                FieldValue::String(text.trim_end().to_string())
            }
            'X' => FieldValue::Array(
                (0..fmt.repeat)
                    .map(|bit| FieldValue::Bool(cell[bit / 8] & (0x80 >> (bit % 8)) != 0))
                    .collect(),
            ),
            _ if fmt.repeat == 1 => self.decode_element(cell),
            _ => FieldValue::Array(
                cell.chunks_exact(fmt.element_len())
                    .map(|e| self.decode_element(e))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// BinTable
// ---------------------------------------------------------------------------

/// Rows of a binary table extension held in memory.
#[derive(Debug, Clone)]
pub struct BinTable {
    columns: Vec<Column>,
    row_len: usize,
    num_rows: usize,
    data: Vec<u8>,
}

impl BinTable {
    /// Column layout from a `BINTABLE` header; rows are added with
    /// [`BinTable::set_data`].
    pub fn from_header(header: &Header) -> Result<Self> {
        let row_len = header.require_int("NAXIS1")? as usize;
        let num_rows = header.require_int("NAXIS2")? as usize;
        let tfields = header.require_int("TFIELDS")?;

        let mut columns = Vec::with_capacity(tfields.max(0) as usize);
        let mut offset = 0;
        for i in 1..=tfields {
            let tform = header
                .get_str(&format!("TFORM{i}"))
                .ok_or_else(|| Error::Fits(format!("missing TFORM{i}")))?;
            let format = ColumnFormat::parse(tform)?;
            let name = header
                .get_str(&format!("TTYPE{i}"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| format!("COL{i}"));
            columns.push(Column {
                name,
                format,
                offset,
                tscal: header.get_float(&format!("TSCAL{i}")).unwrap_or(1.0),
                tzero: header.get_float(&format!("TZERO{i}")).unwrap_or(0.0),
            });
            offset += format.width();
        }
        if offset != row_len {
            return Err(Error::Fits(format!(
                "column widths add up to {offset} bytes but NAXIS1 is {row_len}"
            )));
        }
        Ok(Self {
            columns,
            row_len,
            num_rows,
            data: Vec::new(),
        })
    }

    pub fn set_data(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() != self.row_len * self.num_rows {
            return Err(Error::Fits(format!(
                "table data is {} bytes, expected {}",
                data.len(),
                self.row_len * self.num_rows
            )));
        }
        self.data = data;
        Ok(())
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by name, compared case-insensitively.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn require_column(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| Error::NotFound(format!("table column {name}")))
    }

    fn row_bytes(&self, row: usize) -> &[u8] {
        &self.data[row * self.row_len..(row + 1) * self.row_len]
    }

    /// Scalar integer column, one value per row.
    pub fn column_i64(&self, name: &str) -> Result<Vec<i64>> {
        let col = self.require_column(name)?;
        if !col.format.is_integer() || col.format.repeat != 1 {
            return Err(Error::Fits(format!(
                "column {name} is not a scalar integer column"
            )));
        }
        (0..self.num_rows)
            .map(|row| match col.decode(self.row_bytes(row)) {
                FieldValue::Integer(i) => Ok(i),
                other => Err(Error::Fits(format!(
                    "column {name} row {row} holds {other}, not an integer"
                ))),
            })
            .collect()
    }

    /// Single cell.
    pub fn cell(&self, row: usize, name: &str) -> Result<FieldValue> {
        if row >= self.num_rows {
            return Err(Error::Fits(format!("row {row} out of range")));
        }
        Ok(self.require_column(name)?.decode(self.row_bytes(row)))
    }

    /// Every column of one row.
    pub fn row(&self, row: usize) -> Result<BTreeMap<String, FieldValue>> {
        if row >= self.num_rows {
            return Err(Error::Fits(format!("row {row} out of range")));
        }
        let bytes = self.row_bytes(row);
        Ok(self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.decode(bytes)))
            .collect())
    }
}
