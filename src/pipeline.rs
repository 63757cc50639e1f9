use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use camino::Utf8PathBuf;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::ArchiveDescriptor;
use crate::error::KiraError;
use crate::extract::{ExtractOutcome, Extractor};
use crate::transfer::{TransferCoordinator, TransferState};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PipelineOptions {
    pub workers: usize,
    pub keep_compressed: bool,
    pub download_only: bool,
    pub dry_run: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            keep_compressed: false,
            download_only: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Extracted { path: Utf8PathBuf },
    Downloaded { path: Utf8PathBuf },
    AlreadyPresent { path: Utf8PathBuf },
    Planned { compressed: Utf8PathBuf, destination: Utf8PathBuf },
    TransferFailed {
        attempts: u32,
        checksum_failures: u32,
        reason: String,
    },
    ExtractFailed { reason: String },
    Aborted { reason: String },
}

impl OutcomeStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OutcomeStatus::TransferFailed { .. }
                | OutcomeStatus::ExtractFailed { .. }
                | OutcomeStatus::Aborted { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub archive: ArchiveDescriptor,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Per-archive download, extract and cleanup, fanned out over a fixed number
/// of workers. Everything a worker needs lives in this struct and is only read.
pub struct Pipeline {
    coordinator: Option<TransferCoordinator>,
    extractor: Extractor,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        coordinator: TransferCoordinator,
        extractor: Extractor,
        options: PipelineOptions,
    ) -> Self {
        Self {
            coordinator: Some(coordinator),
            extractor,
            options,
        }
    }

    /// A dry-run pipeline: plans every archive and never touches a transfer
    /// backend.
    pub fn planner(extractor: Extractor, options: PipelineOptions) -> Self {
        Self {
            coordinator: None,
            extractor,
            options: PipelineOptions {
                dry_run: true,
                ..options
            },
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Runs every archive and returns outcomes in input order. Only a failure
    /// to build the worker pool is an error; per-archive problems are outcomes.
    pub fn run(
        &self,
        archives: &[ArchiveDescriptor],
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ArchiveOutcome>, KiraError> {
        if !self.options.dry_run {
            self.extractor.store().ensure_compressed_root()?;
            if !self.options.download_only {
                self.extractor.store().ensure_dataset_root()?;
            }
        }

        if self.options.workers <= 1 {
            return Ok(archives
                .iter()
                .map(|archive| self.run_contained(archive, sink))
                .collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|index| format!("kira-dd-worker-{index}"))
            .build()
            .map_err(|err| KiraError::ThreadPool(err.to_string()))?;
        Ok(pool.install(|| {
            archives
                .par_iter()
                .map(|archive| self.run_contained(archive, sink))
                .collect()
        }))
    }

    fn run_contained(
        &self,
        archive: &ArchiveDescriptor,
        sink: &dyn ProgressSink,
    ) -> ArchiveOutcome {
        let status = catch_unwind(AssertUnwindSafe(|| self.process(archive, sink)))
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|message| message.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                warn!(archive = %archive.label(), reason = %reason, "archive task aborted");
                OutcomeStatus::Aborted { reason }
            });
        ArchiveOutcome {
            archive: archive.clone(),
            status,
        }
    }

    /// fetch, then extract, then delete the compressed file, in that order.
    pub fn process(&self, archive: &ArchiveDescriptor, sink: &dyn ProgressSink) -> OutcomeStatus {
        let store = self.extractor.store();
        let destination = store.destination_path(archive);
        if !self.options.download_only && store.exists(&destination) {
            sink.event(ProgressEvent {
                message: format!("phase=Store; {} already present", archive.label()),
                elapsed: None,
            });
            return OutcomeStatus::AlreadyPresent { path: destination };
        }

        let compressed = store.compressed_path(archive);
        if self.options.dry_run {
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Plan; download {} to {compressed}, extract into {destination}",
                    archive.url
                ),
                elapsed: None,
            });
            return OutcomeStatus::Planned {
                compressed,
                destination,
            };
        }

        let Some(coordinator) = &self.coordinator else {
            return OutcomeStatus::TransferFailed {
                attempts: 0,
                checksum_failures: 0,
                reason: "no transfer backend configured".to_string(),
            };
        };

        sink.event(ProgressEvent {
            message: format!("phase=Download; {}", archive.label()),
            elapsed: None,
        });
        let start = Instant::now();
        let request = coordinator.fetch(archive, store.compressed_root().as_std_path());
        let local = match request.state() {
            TransferState::Succeeded { path } => path.clone(),
            TransferState::Failed { reason } => {
                warn!(
                    archive = %archive.label(),
                    attempts = request.attempts(),
                    checksum_failures = request.checksum_failures(),
                    "skipping archive after failed transfer"
                );
                return OutcomeStatus::TransferFailed {
                    attempts: request.attempts(),
                    checksum_failures: request.checksum_failures(),
                    reason: reason.clone(),
                };
            }
            TransferState::Pending => {
                return OutcomeStatus::TransferFailed {
                    attempts: request.attempts(),
                    checksum_failures: request.checksum_failures(),
                    reason: "transfer never settled".to_string(),
                };
            }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Download; {} done", archive.label()),
            elapsed: Some(start.elapsed()),
        });

        if self.options.download_only {
            return OutcomeStatus::Downloaded { path: compressed };
        }

        sink.event(ProgressEvent {
            message: format!("phase=Extract; {}", archive.label()),
            elapsed: None,
        });
        let start = Instant::now();
        let status = match self.extractor.extract(&local, archive, true) {
            Ok(ExtractOutcome::Extracted(path)) => OutcomeStatus::Extracted { path },
            Ok(ExtractOutcome::AlreadyPresent(path)) => OutcomeStatus::AlreadyPresent { path },
            Err(err) => {
                warn!(archive = %archive.label(), error = %err, "extraction failed");
                return OutcomeStatus::ExtractFailed {
                    reason: err.to_string(),
                };
            }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {} done", archive.label()),
            elapsed: Some(start.elapsed()),
        });

        if !self.options.keep_compressed {
            match store.remove_compressed(&local) {
                Ok(()) => info!(path = %local.display(), "removed compressed archive"),
                Err(err) => warn!(error = %err, "could not remove compressed archive"),
            }
        }
        status
    }
}
