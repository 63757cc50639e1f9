use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Picks the format from the file name; anything unrecognised is read as a
    /// plain tarball.
    pub fn from_file_name(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if lower.ends_with(".zip") {
            ArchiveKind::Zip
        } else {
            ArchiveKind::Tar
        }
    }
}

pub fn unpack(archive_path: &Path, target_dir: &Path) -> Result<(), KiraError> {
    let file_name = archive_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    match ArchiveKind::from_file_name(file_name) {
        ArchiveKind::Tar => extract_tar(open(archive_path)?, target_dir),
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(open(archive_path)?), target_dir),
        ArchiveKind::Zip => extract_zip(archive_path, target_dir),
    }
}

fn open(path: &Path) -> Result<BufReader<fs::File>, KiraError> {
    fs::File::open(path)
        .map(BufReader::new)
        .map_err(|err| KiraError::Archive(format!("open {}: {err}", path.display())))
}

pub fn extract_tar<R: Read>(reader: R, target_dir: &Path) -> Result<(), KiraError> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    let entries = archive
        .entries()
        .map_err(|err| KiraError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| KiraError::Archive(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            return Err(KiraError::Archive(format!(
                "tar entry path traversal detected: {name}"
            )));
        }
    }
    Ok(())
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), KiraError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| KiraError::Archive(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| KiraError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(KiraError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| KiraError::Archive(err.to_string()))?;
    }
    Ok(())
}
