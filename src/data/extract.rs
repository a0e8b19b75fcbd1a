use std::collections::BTreeMap;
use std::io::{Read, Seek};

use log::{debug, warn};

use super::filter::RowSelector;
use super::model::{Arm, ArmModel, ArmSpectrum, ModelRecord, SpectrumRecord};
use crate::error::Result;
use crate::fits::FitsFile;

/// Which optional arrays to return with each spectrum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpectraOptions {
    pub mask: bool,
    pub ivar: bool,
    pub fibermap: bool,
}

// ---------------------------------------------------------------------------
// Spectra
// ---------------------------------------------------------------------------

/// Extract every observation matching `selector` from a spectra or coadd
/// file. Returns an empty list when nothing matches.
pub fn read_spectra<R: Read + Seek>(
    fits: &mut FitsFile<R>,
    selector: &RowSelector,
    options: SpectraOptions,
) -> Result<Vec<SpectrumRecord>> {
    let fibermap_hdu = fits.hdu("FIBERMAP")?;
    let fibermap = fits.read_table(&fibermap_hdu)?;
    let rows = selector.matching_rows(&fibermap)?;
    if rows.is_empty() {
        warn!("no spectra found for {:?}", selector);
        return Ok(Vec::new());
    }
    debug!("selected fibermap rows {:?}", rows);

    let mut records: Vec<SpectrumRecord> = Vec::with_capacity(rows.len());
    for &row in &rows {
        records.push(SpectrumRecord {
            fibermap: if options.fibermap {
                Some(fibermap.row(row)?)
            } else {
                None
            },
            arms: BTreeMap::new(),
        });
    }

    for arm in Arm::ALL {
        let wave_hdu = fits.hdu(&arm.hdu_name("WAVELENGTH"))?;
        let wavelength = fits.read_image(&wave_hdu)?;
        let flux_hdu = fits.hdu(&arm.hdu_name("FLUX"))?;
        let mask_hdu = match options.mask {
            true => Some(fits.hdu(&arm.hdu_name("MASK"))?),
            false => None,
        };
        let ivar_hdu = match options.ivar {
            true => Some(fits.hdu(&arm.hdu_name("IVAR"))?),
            false => None,
        };

        for (record, &row) in records.iter_mut().zip(&rows) {
            let mask = match &mask_hdu {
                Some(hdu) => Some(fits.read_image_row_int(hdu, row)?),
                None => None,
            };
            let ivar = match &ivar_hdu {
                Some(hdu) => Some(fits.read_image_row(hdu, row)?),
                None => None,
            };
            record.arms.insert(
                arm,
                ArmSpectrum {
                    wavelength: wavelength.clone(),
                    flux: fits.read_image_row(&flux_hdu, row)?,
                    mask,
                    ivar,
                },
            );
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Extract the best-fit models of every observation matching `selector`
/// from an `rvmod_` file.
pub fn read_models<R: Read + Seek>(
    fits: &mut FitsFile<R>,
    selector: &RowSelector,
) -> Result<Vec<ModelRecord>> {
    let fibermap_hdu = fits.hdu("FIBERMAP")?;
    let fibermap = fits.read_table(&fibermap_hdu)?;
    let rows = selector.matching_rows(&fibermap)?;
    if rows.is_empty() {
        warn!("no models found for {:?}", selector);
        return Ok(Vec::new());
    }

    let mut records = vec![ModelRecord::default(); rows.len()];
    for arm in Arm::ALL {
        let wave_hdu = fits.hdu(&arm.hdu_name("WAVELENGTH"))?;
        let wavelength = fits.read_image(&wave_hdu)?;
        let model_hdu = fits.hdu(&arm.hdu_name("MODEL"))?;
        for (record, &row) in records.iter_mut().zip(&rows) {
            record.arms.insert(
                arm,
                ArmModel {
                    wavelength: wavelength.clone(),
                    model: fits.read_image_row(&model_hdu, row)?,
                },
            );
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::data::model::FieldValue;
    use crate::fits::{ColumnData, FitsWriter, ImageData, TableColumn};

    const NPIX: usize = 3;

    /// Two-row coadd with all three arms, plus model images.
    fn coadd() -> Vec<u8> {
        let mut w = FitsWriter::new(Vec::new());
        w.write_table(
            "FIBERMAP",
            &[
                TableColumn::new("TARGETID", ColumnData::Int64(vec![501, 502])),
                TableColumn::new("FIBER", ColumnData::Int32(vec![40, 41])),
            ],
        )
        .unwrap();
        for (i, arm) in Arm::ALL.into_iter().enumerate() {
            let start = 3600.0 + 2000.0 * i as f64;
            let wave: Vec<f64> = (0..NPIX).map(|p| start + p as f64).collect();
            w.write_image(&arm.hdu_name("WAVELENGTH"), &[NPIX], &ImageData::Float64(wave))
                .unwrap();
            let flux: Vec<f32> = (0..2 * NPIX).map(|p| (10 * i + p) as f32).collect();
            w.write_image(&arm.hdu_name("FLUX"), &[NPIX, 2], &ImageData::Float32(flux))
                .unwrap();
            w.write_image(&arm.hdu_name("IVAR"), &[NPIX, 2], &ImageData::Float32(vec![0.5; 2 * NPIX]))
                .unwrap();
            w.write_image(&arm.hdu_name("MASK"), &[NPIX, 2], &ImageData::Int32(vec![0, 0, 1, 0, 2, 0]))
                .unwrap();
            w.write_image(&arm.hdu_name("MODEL"), &[NPIX, 2], &ImageData::Float32(vec![1.0; 2 * NPIX]))
                .unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn reads_flux_of_selected_row() {
        let mut fits = FitsFile::open(Cursor::new(coadd())).unwrap();
        let spectra = read_spectra(&mut fits, &RowSelector::target(502), SpectraOptions::default()).unwrap();
        assert_eq!(spectra.len(), 1);
        let b = spectra[0].arm(Arm::B).unwrap();
        assert_eq!(b.wavelength, vec![3600.0, 3601.0, 3602.0]);
        assert_eq!(b.flux, vec![3.0, 4.0, 5.0]);
        assert!(b.mask.is_none() && b.ivar.is_none());
        assert!(spectra[0].fibermap.is_none());
        assert_eq!(spectra[0].arm(Arm::Z).unwrap().flux, vec![23.0, 24.0, 25.0]);
    }

    #[test]
    fn optional_arrays_follow_options() {
        let mut fits = FitsFile::open(Cursor::new(coadd())).unwrap();
        let options = SpectraOptions {
            mask: true,
            ivar: true,
            fibermap: true,
        };
        let spectra = read_spectra(&mut fits, &RowSelector::fiber(41), options).unwrap();
        let r = spectra[0].arm(Arm::R).unwrap();
        assert_eq!(r.mask.as_deref(), Some(&[0, 2, 0][..]));
        assert_eq!(r.ivar.as_deref(), Some(&[0.5, 0.5, 0.5][..]));
        let fibermap = spectra[0].fibermap.as_ref().unwrap();
        assert_eq!(fibermap["TARGETID"], FieldValue::Integer(502));
    }

    #[test]
    fn unmatched_object_gives_no_spectra() {
        let mut fits = FitsFile::open(Cursor::new(coadd())).unwrap();
        let spectra = read_spectra(&mut fits, &RowSelector::target(1), SpectraOptions::default()).unwrap();
        assert!(spectra.is_empty());
    }

    #[test]
    fn reads_models_per_arm() {
        let mut fits = FitsFile::open(Cursor::new(coadd())).unwrap();
        let models = read_models(&mut fits, &RowSelector::target(501)).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].arms.len(), 3);
        let z = models[0].arm(Arm::Z).unwrap();
        assert_eq!(z.wavelength[0], 7600.0);
        assert_eq!(z.model, vec![1.0; NPIX]);
    }
}
