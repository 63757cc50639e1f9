use std::fs;
use std::io::Write;
use std::path::PathBuf;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_dataset_downloader::domain::{ArchiveDescriptor, IdentifierField, PathTemplate};
use kira_dataset_downloader::error::KiraError;
use kira_dataset_downloader::extract::{ExtractOutcome, Extractor};
use kira_dataset_downloader::store::Store;

fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn setup() -> (tempfile::TempDir, Extractor) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(
        root.join("uncompressed"),
        root.join("compressed"),
        PathTemplate::default(),
    );
    (temp, Extractor::new(store))
}

fn descriptor(url: &str) -> ArchiveDescriptor {
    ArchiveDescriptor::new("normal", "hypersim", "ai_001_001", url).unwrap()
}

fn write_archive(temp: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = temp.path().join(name);
    fs::write(&path, bytes).unwrap();
    path
}

fn staging_leftovers(extractor: &Extractor) -> usize {
    let root = extractor.store().dataset_root().as_std_path();
    if !root.exists() {
        return 0;
    }
    fs::read_dir(root)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(".kira-dd-staging")
        })
        .count()
}

#[test]
fn tar_gz_payload_lands_at_destination() {
    let (temp, extractor) = setup();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar_bytes(&[
            ("ai_001_001/frame.0000.png", b"frame".as_slice()),
            ("README", b"ignored".as_slice()),
        ]))
        .unwrap();
    let path = write_archive(&temp, "ai_001_001-normal.tar.gz", &encoder.finish().unwrap());
    let archive = descriptor("https://h/hypersim/ai_001_001-normal.tar.gz");

    let outcome = extractor.extract(&path, &archive, true).unwrap();
    let destination = extractor.store().destination_path(&archive);
    assert_eq!(outcome, ExtractOutcome::Extracted(destination.clone()));
    assert_eq!(
        fs::read(destination.join("frame.0000.png").as_std_path()).unwrap(),
        b"frame"
    );
    assert!(!destination.join("README").as_std_path().exists());
    assert_eq!(staging_leftovers(&extractor), 0);
    // the compressed archive is left for the caller
    assert!(path.exists());
}

#[test]
fn zip_payload_follows_internal_layout() {
    let (temp, extractor) = setup();
    let path = temp.path().join("ai_001_001-normal.zip");
    let mut writer = zip::ZipWriter::new(fs::File::create(&path).unwrap());
    writer
        .start_file(
            "normal/ai_001_001/depth.hdf5",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
    writer.write_all(b"depth").unwrap();
    writer.finish().unwrap();

    let archive = descriptor("https://h/hypersim/ai_001_001-normal.zip")
        .with_internal_layout(&[IdentifierField::Domain, IdentifierField::Model]);
    assert_matches!(
        extractor.extract(&path, &archive, true),
        Ok(ExtractOutcome::Extracted(_))
    );
    let destination = extractor.store().destination_path(&archive);
    assert_eq!(
        fs::read(destination.join("depth.hdf5").as_std_path()).unwrap(),
        b"depth"
    );
}

#[test]
fn truncated_archive_never_reaches_destination() {
    let (temp, extractor) = setup();
    let bytes = tar_bytes(&[
        ("ai_001_001/a.png", b"first".as_slice()),
        ("ai_001_001/b.png", b"second".as_slice()),
    ]);
    // first entry complete, second header cut short
    let path = write_archive(&temp, "ai_001_001-normal.tar", &bytes[..1024 + 100]);
    let archive = descriptor("https://h/hypersim/ai_001_001-normal.tar");

    assert_matches!(
        extractor.extract(&path, &archive, true),
        Err(KiraError::Archive(_))
    );
    let destination = extractor.store().destination_path(&archive);
    assert!(!destination.as_std_path().exists());
    assert_eq!(staging_leftovers(&extractor), 0);
}

#[test]
fn missing_payload_is_reported() {
    let (temp, extractor) = setup();
    let bytes = tar_bytes(&[("other_model/a.png", b"x".as_slice())]);
    let path = write_archive(&temp, "ai_001_001-normal.tar", &bytes);
    let archive = descriptor("https://h/hypersim/ai_001_001-normal.tar");

    assert_matches!(
        extractor.extract(&path, &archive, true),
        Err(KiraError::PayloadMissing(layout)) if layout == "ai_001_001"
    );
    assert_eq!(staging_leftovers(&extractor), 0);
}

#[test]
fn existing_destination_is_left_untouched() {
    let (temp, extractor) = setup();
    let bytes = tar_bytes(&[("ai_001_001/a.png", b"new".as_slice())]);
    let path = write_archive(&temp, "ai_001_001-normal.tar", &bytes);
    let archive = descriptor("https://h/hypersim/ai_001_001-normal.tar");

    let destination = extractor.store().destination_path(&archive);
    fs::create_dir_all(destination.as_std_path()).unwrap();
    fs::write(destination.join("a.png").as_std_path(), b"old").unwrap();

    assert_eq!(
        extractor.extract(&path, &archive, true).unwrap(),
        ExtractOutcome::AlreadyPresent(destination.clone())
    );
    assert_matches!(
        extractor.extract(&path, &archive, false),
        Err(KiraError::Filesystem(_))
    );
    assert_eq!(
        fs::read(destination.join("a.png").as_std_path()).unwrap(),
        b"old"
    );
    assert_eq!(staging_leftovers(&extractor), 0);
}
