mod common;

use std::collections::HashMap;

use common::{write_sidecar, RangeServer, TARGETS};
use desi_retriever::release::GaiaIndexSource;
use desi_retriever::{DataRelease, Error, ObjectQuery, Retriever, RetrieverConfig};

fn local_source(dir: &std::path::Path) -> GaiaIndexSource {
    GaiaIndexSource::Sidecar {
        base: dir.display().to_string(),
        parquet: "keys.parquet".into(),
        records: "records.bin".into(),
    }
}

#[test]
fn local_sidecar_resolves_source_ids() {
    let dir = tempfile::tempdir().unwrap();
    write_sidecar(dir.path());

    let retriever = Retriever::new(RetrieverConfig::default()).unwrap();
    let index = retriever.open_gaia_index(&local_source(dir.path())).unwrap();
    assert_eq!(index.len(), TARGETS.len());
    retriever.set_gaia_index(DataRelease::Dr1, index);

    let found = retriever.lookup_gaia(DataRelease::Dr1, 1001).unwrap();
    assert_eq!(found.survey, "main");
    assert_eq!(found.program, "bright");
    assert_eq!(found.hpx, 10378);
    assert_eq!(found.targetid, TARGETS[1]);

    assert!(matches!(
        retriever.lookup_gaia(DataRelease::Dr1, 5),
        Err(Error::ObjectNotFound(5))
    ));
}

#[test]
fn gaia_id_fills_in_the_healpix_location() {
    let dir = tempfile::tempdir().unwrap();
    write_sidecar(dir.path());
    let retriever = Retriever::new(RetrieverConfig::default()).unwrap();
    let index = retriever.open_gaia_index(&local_source(dir.path())).unwrap();
    retriever.set_gaia_index(DataRelease::Dr1, index);

    let location = retriever
        .spectra_location(&ObjectQuery::new(DataRelease::Dr1).gaia(1002))
        .unwrap();
    assert!(location
        .to_string()
        .ends_with("healpix/main/bright/103/10378/coadd-main-bright-10378.fits"));
}

#[test]
fn remote_sidecar_downloads_key_table_once() {
    let staging = tempfile::tempdir().unwrap();
    write_sidecar(staging.path());
    let mut files = HashMap::new();
    for name in ["keys.parquet", "records.bin"] {
        let data = std::fs::read(staging.path().join(name)).unwrap();
        files.insert(format!("public/gaia/{name}"), data);
    }
    let server = RangeServer::start(files, "unused");

    let cache = tempfile::tempdir().unwrap();
    let config = RetrieverConfig {
        cache_dir: cache.path().to_path_buf(),
        ..Default::default()
    };
    let retriever = Retriever::new(config).unwrap();
    let source = GaiaIndexSource::Sidecar {
        base: server.url("public/gaia"),
        parquet: "keys.parquet".into(),
        records: "records.bin".into(),
    };

    let index = retriever.open_gaia_index(&source).unwrap();
    assert!(cache.path().join("keys.parquet").exists());
    assert_eq!(index.resolve(1000).unwrap().targetid, TARGETS[0]);

    // a second open reuses the downloaded key table
    let before = server.requests();
    let again = retriever.open_gaia_index(&source).unwrap();
    assert_eq!(again.resolve(1002).unwrap().targetid, TARGETS[2]);
    let extra = server.requests() - before;
    // record file length, its header and one record; no key table download
    assert!(extra <= 3, "unexpected {extra} requests");
}

#[test]
fn releases_without_index_are_unsupported() {
    let retriever = Retriever::new(RetrieverConfig::default()).unwrap();
    assert!(matches!(
        retriever.lookup_gaia(DataRelease::Andes, 1),
        Err(Error::Unsupported(_))
    ));
}
