use std::path::Path;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::ArchiveDescriptor;
use crate::error::KiraError;
use crate::fs_util;
use crate::store::{Store, atomic_rename_dir};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ExtractOutcome {
    Extracted(Utf8PathBuf),
    AlreadyPresent(Utf8PathBuf),
}

/// Unpacks verified archives into a staging directory and moves the payload
/// into the dataset tree with a single rename.
#[derive(Debug, Clone)]
pub struct Extractor {
    store: Store,
}

impl Extractor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn extract(
        &self,
        archive_path: &Path,
        archive: &ArchiveDescriptor,
        skip_if_exists: bool,
    ) -> Result<ExtractOutcome, KiraError> {
        let final_path = self.store.destination_path(archive);
        if skip_if_exists && self.store.exists(&final_path) {
            info!(path = %final_path, "already exists, skipping");
            return Ok(ExtractOutcome::AlreadyPresent(final_path));
        }

        let staging = self.store.staging_dir()?;
        debug!(
            archive = %archive_path.display(),
            staging = %staging.path().display(),
            "unpacking"
        );
        fs_util::unpack(archive_path, staging.path())?;

        let payload = archive
            .internal_layout
            .iter()
            .fold(staging.path().to_path_buf(), |path, segment| path.join(segment));
        if !payload.exists() {
            return Err(KiraError::PayloadMissing(archive.internal_layout.join("/")));
        }

        let moved = atomic_rename_dir(&payload, final_path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("move to {final_path}: {err}")))?;
        if !moved {
            if skip_if_exists {
                info!(path = %final_path, "appeared during extraction, skipping");
                return Ok(ExtractOutcome::AlreadyPresent(final_path));
            }
            return Err(KiraError::Filesystem(format!(
                "destination {final_path} already exists"
            )));
        }

        info!(path = %final_path, "extracted");
        Ok(ExtractOutcome::Extracted(final_path))
    }
}
