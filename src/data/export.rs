use std::io::Write;
use std::path::Path;

use serde::Serialize;

use super::model::{Arm, ModelRecord, SpectrumRecord};
use crate::error::Result;

/// One pixel of one arm, as written to CSV.
#[derive(Debug, Serialize)]
struct PixelRow {
    arm: &'static str,
    wavelength: f64,
    flux: f64,
    ivar: Option<f64>,
    mask: Option<i64>,
    model: Option<f64>,
}

/// Write `spectrum` (and `model`, when given) as long-format CSV:
/// `arm,wavelength,flux,ivar,mask,model`.
pub fn write_csv<W: Write>(
    out: W,
    spectrum: &SpectrumRecord,
    model: Option<&ModelRecord>,
) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for arm in Arm::ALL {
        let Some(data) = spectrum.arm(arm) else {
            continue;
        };
        let model_arm = model.and_then(|m| m.arm(arm));
        for (i, (&wavelength, &flux)) in data.wavelength.iter().zip(&data.flux).enumerate() {
            writer.serialize(PixelRow {
                arm: arm.key(),
                wavelength,
                flux,
                ivar: data.ivar.as_ref().and_then(|v| v.get(i).copied()),
                mask: data.mask.as_ref().and_then(|v| v.get(i).copied()),
                model: model_arm.and_then(|m| m.model.get(i).copied()),
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// [`write_csv`] into a file.
pub fn save_csv(path: &Path, spectrum: &SpectrumRecord, model: Option<&ModelRecord>) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_csv(std::io::BufWriter::new(file), spectrum, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{ArmModel, ArmSpectrum};

    #[test]
    fn writes_one_row_per_pixel() {
        let mut spectrum = SpectrumRecord::default();
        spectrum.arms.insert(
            Arm::B,
            ArmSpectrum {
                wavelength: vec![3600.0, 3600.8],
                flux: vec![1.0, 2.0],
                mask: Some(vec![0, 4]),
                ivar: None,
            },
        );
        let mut model = ModelRecord::default();
        model.arms.insert(
            Arm::B,
            ArmModel {
                wavelength: vec![3600.0, 3600.8],
                model: vec![0.9, 2.1],
            },
        );

        let mut out = Vec::new();
        write_csv(&mut out, &spectrum, Some(&model)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "arm,wavelength,flux,ivar,mask,model");
        assert_eq!(lines[1], "b,3600.0,1.0,,0,0.9");
        assert_eq!(lines[2], "b,3600.8,2.0,,4,2.1");
        assert_eq!(lines.len(), 3);
    }
}
