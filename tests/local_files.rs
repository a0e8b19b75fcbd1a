mod common;

use common::{coadd_bytes, NPIX, TARGETS};
use desi_retriever::data::export::save_csv;
use desi_retriever::{Arm, Location, Retriever, RetrieverConfig, RowSelector, SpectraOptions};

fn retriever() -> Retriever {
    Retriever::new(RetrieverConfig::default()).unwrap()
}

#[test]
fn reads_spectra_from_a_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coadd-main-bright-10378.fits");
    std::fs::write(&path, coadd_bytes()).unwrap();

    let retriever = retriever();
    let options = SpectraOptions {
        mask: true,
        ivar: true,
        fibermap: true,
    };
    let location = Location::Local(path);
    let spectra = retriever
        .read_spectra_at(&location, &RowSelector::target(TARGETS[2]), options)
        .unwrap();
    assert_eq!(spectra.len(), 1);
    let z = spectra[0].arm(Arm::Z).unwrap();
    assert_eq!(z.flux, vec![202.0; NPIX]);
    assert_eq!(z.ivar.as_deref(), Some(&[4.0; NPIX][..]));
    assert_eq!(z.mask.as_ref().map(Vec::len), Some(NPIX));
    assert!(spectra[0].fibermap.is_some());

    // local files never enter the range cache
    assert_eq!(retriever.cached_urls(), 0);
}

#[test]
fn fiber_selects_rows_when_no_target_given() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coadd.fits");
    std::fs::write(&path, coadd_bytes()).unwrap();

    let spectra = retriever()
        .read_spectra_at(&Location::Local(path), &RowSelector::fiber(11), SpectraOptions::default())
        .unwrap();
    assert_eq!(spectra[0].arm(Arm::B).unwrap().flux[0], 1.0);
    assert_eq!(spectra[0].arm(Arm::R).unwrap().flux[0], 101.0);
}

#[test]
fn missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = retriever()
        .read_spectra_at(
            &Location::Local(dir.path().join("nope.fits")),
            &RowSelector::target(1),
            SpectraOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, desi_retriever::Error::NotFound(_)));
}

#[test]
fn spectrum_and_model_export_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coadd.fits");
    std::fs::write(&path, coadd_bytes()).unwrap();
    let retriever = retriever();
    let location = Location::Local(path);
    let selector = RowSelector::target(TARGETS[0]);

    let spectra = retriever
        .read_spectra_at(&location, &selector, SpectraOptions::default())
        .unwrap();
    let models = retriever.read_models_at(&location, &selector).unwrap();

    let out = dir.path().join("spectrum.csv");
    save_csv(&out, &spectra[0], models.first()).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("arm,wavelength,flux,ivar,mask,model"));
    assert_eq!(lines.next(), Some("b,3600.0,0.0,,,0.0"));
    assert_eq!(text.lines().count(), 1 + 3 * NPIX);
}
