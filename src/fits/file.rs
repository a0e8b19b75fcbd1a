use std::fmt;
use std::io::{BufReader, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};
use fitsrs::hdu::HDU;
use fitsrs::Fits;
use log::debug;

use super::header::Header;
use super::table::BinTable;
use super::{padded_len, BLOCK_LEN};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Hdu
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HduKind {
    Primary,
    Image,
    BinTable,
    Other,
}

/// One header/data unit: its keywords and where its data lives.
#[derive(Debug, Clone)]
pub struct Hdu {
    pub index: usize,
    pub kind: HduKind,
    pub header: Header,
    pub data_offset: u64,
    pub data_len: u64,
}

impl Hdu {
    pub fn name(&self) -> Option<&str> {
        self.header.get_str("EXTNAME")
    }

    pub fn bitpix(&self) -> Result<i64> {
        self.header.require_int("BITPIX")
    }

    /// Axis lengths, `NAXIS1` first.
    pub fn axes(&self) -> Result<Vec<usize>> {
        let naxis = self.header.get_int("NAXIS").unwrap_or(0);
        (1..=naxis)
            .map(|i| {
                let n = self.header.require_int(&format!("NAXIS{i}"))?;
                usize::try_from(n).map_err(|_| Error::Fits(format!("negative NAXIS{i}")))
            })
            .collect()
    }
}

/// Copy what is needed of a `fitsrs` HDU: the keywords and the byte
/// range of its data unit.
macro_rules! describe {
    ($index:expr, $kind:expr, $hdu:expr) => {{
        let hdu = $hdu;
        let header = hdu.get_header();
        Hdu {
            index: $index,
            kind: $kind,
            header: Header::collect(|keyword| header.get(keyword)),
            data_offset: hdu.get_data_unit_byte_offset() as u64,
            data_len: hdu.get_data_unit_byte_size() as u64,
        }
    }};
}

/// Parse every header of the file with `fitsrs`. Data units are seeked
/// over, never read.
fn scan<R>(reader: &mut R, len: u64) -> Result<Vec<Hdu>>
where
    R: Read + Seek + fmt::Debug,
{
    let mut units = Fits::from_reader(BufReader::new(reader));
    let mut hdus: Vec<Hdu> = Vec::new();
    let mut next_offset = 0;
    while next_offset + BLOCK_LEN as u64 <= len {
        let index = hdus.len();
        let hdu = match units.next() {
            Some(Ok(hdu)) => hdu,
            Some(Err(e)) => return Err(Error::Fits(format!("HDU #{index}: {e}"))),
            None => break,
        };
        let hdu = match hdu {
            HDU::Primary(h) => describe!(index, HduKind::Primary, &h),
            HDU::XImage(h) => describe!(index, HduKind::Image, &h),
            HDU::XBinaryTable(h) => describe!(index, HduKind::BinTable, &h),
            HDU::XASCIITable(h) => describe!(index, HduKind::Other, &h),
        };
        debug!(
            "hdu {} {:?} name={:?} data_offset={} data_len={}",
            hdu.index,
            hdu.kind,
            hdu.name(),
            hdu.data_offset,
            hdu.data_len
        );
        next_offset = hdu.data_offset + padded_len(hdu.data_len);
        hdus.push(hdu);
    }
    Ok(hdus)
}

// ---------------------------------------------------------------------------
// FitsFile
// ---------------------------------------------------------------------------

/// A FITS file read through any `Read + Seek` handle. Headers are parsed
/// once on open; data is read on demand, one section at a time.
pub struct FitsFile<R> {
    reader: R,
    hdus: Vec<Hdu>,
}

impl<R: Read + Seek> FitsFile<R> {
    pub fn open(mut reader: R) -> Result<Self>
    where
        R: fmt::Debug,
    {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < BLOCK_LEN as u64 {
            return Err(Error::Fits(format!("{len} bytes is too short for a FITS file")));
        }
        reader.seek(SeekFrom::Start(0))?;
        let hdus = scan(&mut reader, len)?;
        if hdus.is_empty() {
            return Err(Error::Fits("no primary HDU".into()));
        }
        Ok(Self { reader, hdus })
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// HDU by position (0 is the primary).
    pub fn hdu_at(&self, index: usize) -> Result<Hdu> {
        self.hdus
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("HDU #{index}")))
    }

    /// HDU by `EXTNAME`, compared case-insensitively.
    pub fn hdu(&self, name: &str) -> Result<Hdu> {
        self.hdus
            .iter()
            .find(|h| h.name().is_some_and(|n| n.trim().eq_ignore_ascii_case(name)))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("HDU {name}")))
    }

    // -- Images --

    fn image_geometry(hdu: &Hdu) -> Result<(ImageScale, Vec<usize>)> {
        if !matches!(hdu.kind, HduKind::Primary | HduKind::Image) {
            return Err(Error::Fits(format!("HDU {:?} is not an image", hdu.name())));
        }
        let scale = ImageScale::from_header(hdu)?;
        Ok((scale, hdu.axes()?))
    }

    /// Whole image as floats, flattened with `NAXIS1` varying fastest.
    pub fn read_image(&mut self, hdu: &Hdu) -> Result<Vec<f64>> {
        let (scale, axes) = Self::image_geometry(hdu)?;
        let count: usize = if axes.is_empty() { 0 } else { axes.iter().product() };
        let bytes = self.read_exact_at(hdu.data_offset, count * scale.pixel_len())?;
        Ok(scale.decode_f64(&bytes))
    }

    fn row_bytes(&mut self, hdu: &Hdu, row: usize) -> Result<(ImageScale, Vec<u8>)> {
        let (scale, axes) = Self::image_geometry(hdu)?;
        let (width, height) = match axes.as_slice() {
            [w, h] => (*w, *h),
            _ => {
                return Err(Error::Fits(format!(
                    "HDU {:?} has {} axes, expected 2",
                    hdu.name(),
                    axes.len()
                )))
            }
        };
        if row >= height {
            return Err(Error::Fits(format!(
                "row {row} out of range for HDU {:?} with {height} rows",
                hdu.name()
            )));
        }
        let row_len = width * scale.pixel_len();
        let offset = hdu.data_offset + (row * row_len) as u64;
        let bytes = self.read_exact_at(offset, row_len)?;
        Ok((scale, bytes))
    }

    /// One row of a 2-D image, reading only that row's bytes.
    pub fn read_image_row(&mut self, hdu: &Hdu, row: usize) -> Result<Vec<f64>> {
        let (scale, bytes) = self.row_bytes(hdu, row)?;
        Ok(scale.decode_f64(&bytes))
    }

    /// One row of a 2-D integer image (e.g. a bit mask).
    pub fn read_image_row_int(&mut self, hdu: &Hdu, row: usize) -> Result<Vec<i64>> {
        let (scale, bytes) = self.row_bytes(hdu, row)?;
        scale.decode_i64(&bytes)
    }

    // -- Tables --

    /// Load a binary table's rows.
    pub fn read_table(&mut self, hdu: &Hdu) -> Result<BinTable> {
        if hdu.kind != HduKind::BinTable {
            return Err(Error::Fits(format!("HDU {:?} is not a binary table", hdu.name())));
        }
        let mut table = BinTable::from_header(&hdu.header)?;
        let bytes = self.read_exact_at(hdu.data_offset, table.row_len() * table.num_rows())?;
        table.set_data(bytes)?;
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// ImageScale
// ---------------------------------------------------------------------------

/// Pixel type plus `BSCALE`/`BZERO` of an image.
#[derive(Debug, Clone, Copy)]
struct ImageScale {
    bitpix: i64,
    bscale: f64,
    bzero: f64,
}

impl ImageScale {
    fn from_header(hdu: &Hdu) -> Result<Self> {
        let bitpix = hdu.bitpix()?;
        if !matches!(bitpix, 8 | 16 | 32 | 64 | -32 | -64) {
            return Err(Error::Fits(format!("unsupported BITPIX {bitpix}")));
        }
        Ok(Self {
            bitpix,
            bscale: hdu.header.get_float("BSCALE").unwrap_or(1.0),
            bzero: hdu.header.get_float("BZERO").unwrap_or(0.0),
        })
    }

    fn pixel_len(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }

    fn raw_f64(&self, px: &[u8]) -> f64 {
        match self.bitpix {
            8 => px[0] as f64,
            16 => BigEndian::read_i16(px) as f64,
            32 => BigEndian::read_i32(px) as f64,
            64 => BigEndian::read_i64(px) as f64,
            -32 => BigEndian::read_f32(px) as f64,
            _ => BigEndian::read_f64(px),
        }
    }

    fn decode_f64(&self, bytes: &[u8]) -> Vec<f64> {
        let scaled = self.bscale != 1.0 || self.bzero != 0.0;
        bytes
            .chunks_exact(self.pixel_len())
            .map(|px| {
                let v = self.raw_f64(px);
                if scaled {
                    self.bzero + self.bscale * v
                } else {
                    v
                }
            })
            .collect()
    }

    fn decode_i64(&self, bytes: &[u8]) -> Result<Vec<i64>> {
        if self.bitpix < 0 {
            return Err(Error::Fits(format!(
                "expected an integer image, found BITPIX {}",
                self.bitpix
            )));
        }
        if self.bscale != 1.0 || self.bzero.fract() != 0.0 {
            return Err(Error::Fits("integer image with non-integral scaling".into()));
        }
        let zero = self.bzero as i128;
        Ok(bytes
            .chunks_exact(self.pixel_len())
            .map(|px| {
                let raw: i128 = match self.bitpix {
                    8 => px[0] as i128,
                    16 => BigEndian::read_i16(px) as i128,
                    32 => BigEndian::read_i32(px) as i128,
                    _ => BigEndian::read_i64(px) as i128,
                };
                (raw + zero) as i64
            })
            .collect())
    }
}
