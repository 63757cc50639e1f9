use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};

use crate::domain::{ArchiveDescriptor, PathTemplate};
use crate::error::KiraError;

const STAGING_PREFIX: &str = ".kira-dd-staging";

/// The two on-disk trees a run writes to: compressed downloads and the
/// extracted dataset.
#[derive(Debug, Clone)]
pub struct Store {
    dataset_root: Utf8PathBuf,
    compressed_root: Utf8PathBuf,
    template: PathTemplate,
}

impl Store {
    pub fn new_with_paths(
        dataset_root: Utf8PathBuf,
        compressed_root: Utf8PathBuf,
        template: PathTemplate,
    ) -> Self {
        Self {
            dataset_root,
            compressed_root,
            template,
        }
    }

    pub fn from_std_paths(
        dataset_root: &Path,
        compressed_root: &Path,
        template: PathTemplate,
    ) -> Result<Self, KiraError> {
        let dataset_root = Utf8PathBuf::from_path_buf(dataset_root.to_path_buf())
            .map_err(|_| KiraError::Filesystem("non-utf8 dataset path".to_string()))?;
        let compressed_root = Utf8PathBuf::from_path_buf(compressed_root.to_path_buf())
            .map_err(|_| KiraError::Filesystem("non-utf8 compressed path".to_string()))?;
        Ok(Self::new_with_paths(dataset_root, compressed_root, template))
    }

    pub fn dataset_root(&self) -> &Utf8Path {
        &self.dataset_root
    }

    pub fn compressed_root(&self) -> &Utf8Path {
        &self.compressed_root
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn destination_path(&self, archive: &ArchiveDescriptor) -> Utf8PathBuf {
        self.dataset_root.join(self.template.resolve(archive))
    }

    pub fn compressed_path(&self, archive: &ArchiveDescriptor) -> Utf8PathBuf {
        self.compressed_root.join(&archive.file_name)
    }

    pub fn ensure_dataset_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.dataset_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn ensure_compressed_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.compressed_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    /// Private staging directory inside the dataset root, so the final move
    /// stays on one filesystem. Removed when the returned guard drops.
    pub fn staging_dir(&self) -> Result<TempDir, KiraError> {
        self.ensure_dataset_root()?;
        Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.dataset_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn remove_compressed(&self, path: &Path) -> Result<(), KiraError> {
        fs::remove_file(path)
            .map_err(|err| KiraError::Filesystem(format!("remove {}: {err}", path.display())))
    }
}

/// Renames `from` to `to` unless `to` already exists. Returns whether the move
/// happened.
pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<bool> {
    if to.exists() {
        return Ok(false);
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    rename_no_clobber(from, to)
}

/// A destination that appeared after the existence check makes the rename fail
/// with one of these kinds; that is a lost race, not an error.
fn rename_no_clobber(from: &Path, to: &Path) -> io::Result<bool> {
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
            ) =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}
