use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::catalog::{Catalog, ServerSummary};
use crate::domain::ArchiveDescriptor;
use crate::error::KiraError;
use crate::filter::{ChunkStripe, SelectionCriteria, ensure_checksums, filter_archives};
use crate::pipeline::{ArchiveOutcome, OutcomeStatus, Pipeline, PipelineOptions};
use crate::transfer::ConnectionBudget;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives operator-facing progress. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Everything that shaped a run, echoed in the banner and the summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunParameters {
    pub catalog: String,
    pub criteria: SelectionCriteria,
    pub stripe: ChunkStripe,
    pub dest: String,
    pub dest_compressed: String,
    pub output_structure: String,
    pub budget: ConnectionBudget,
    pub max_attempts: u32,
    pub verify_checksums: bool,
    pub transfer: String,
    pub pipeline: PipelineOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub selected: usize,
    pub extracted: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub planned: usize,
    pub transfer_failed: usize,
    pub extract_failed: usize,
    pub aborted: usize,
}

impl RunCounts {
    pub fn tally(outcomes: &[ArchiveOutcome]) -> Self {
        let mut counts = Self {
            selected: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            let slot = match outcome.status {
                OutcomeStatus::Extracted { .. } => &mut counts.extracted,
                OutcomeStatus::Downloaded { .. } => &mut counts.downloaded,
                OutcomeStatus::AlreadyPresent { .. } => &mut counts.already_present,
                OutcomeStatus::Planned { .. } => &mut counts.planned,
                OutcomeStatus::TransferFailed { .. } => &mut counts.transfer_failed,
                OutcomeStatus::ExtractFailed { .. } => &mut counts.extract_failed,
                OutcomeStatus::Aborted { .. } => &mut counts.aborted,
            };
            *slot += 1;
        }
        counts
    }

    pub fn failed(&self) -> usize {
        self.transfer_failed + self.extract_failed + self.aborted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedArchive {
    pub label: String,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub tool: String,
    pub parameters: RunParameters,
    pub servers: Vec<ServerSummary>,
    pub started_at: String,
    pub finished_at: String,
    pub counts: RunCounts,
    pub failures: Vec<FailedArchive>,
    pub outcomes: Vec<ArchiveOutcome>,
}

#[derive(Debug, Clone)]
pub struct App {
    catalog: Catalog,
}

impl App {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Filters the catalog, keeps this chunk's stripe and, when enforcing,
    /// refuses the whole selection if any archive lacks a checksum.
    pub fn select(
        &self,
        criteria: &SelectionCriteria,
        stripe: ChunkStripe,
        enforce_checksums: bool,
    ) -> Result<Vec<ArchiveDescriptor>, KiraError> {
        let matching = filter_archives(&self.catalog, criteria);
        let matched = matching.len();
        let selected = stripe.apply(matching);
        info!(
            matched,
            selected = selected.len(),
            chunk = stripe.index(),
            chunks = stripe.total(),
            "selected archives"
        );
        if enforce_checksums {
            ensure_checksums(&selected)?;
        }
        Ok(selected)
    }

    pub fn run(
        &self,
        pipeline: &Pipeline,
        archives: &[ArchiveDescriptor],
        parameters: RunParameters,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, KiraError> {
        let started_at = iso_timestamp();
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} archives queued", archives.len()),
            elapsed: None,
        });

        let start = std::time::Instant::now();
        let outcomes = pipeline.run(archives, sink)?;
        sink.event(ProgressEvent {
            message: "phase=Done; all archives processed".to_string(),
            elapsed: Some(start.elapsed()),
        });

        let counts = RunCounts::tally(&outcomes);
        let failures = outcomes
            .iter()
            .filter_map(|outcome| {
                let reason = match &outcome.status {
                    OutcomeStatus::TransferFailed {
                        attempts,
                        checksum_failures: 0,
                        reason,
                    } => format!("transfer failed after {attempts} attempt(s): {reason}"),
                    OutcomeStatus::TransferFailed {
                        attempts,
                        checksum_failures,
                        reason,
                    } => format!(
                        "transfer failed after {attempts} attempt(s), {checksum_failures} checksum mismatch(es): {reason}"
                    ),
                    OutcomeStatus::ExtractFailed { reason } => format!("extract failed: {reason}"),
                    OutcomeStatus::Aborted { reason } => format!("aborted: {reason}"),
                    _ => return None,
                };
                Some(FailedArchive {
                    label: outcome.archive.label(),
                    url: outcome.archive.url.clone(),
                    reason,
                })
            })
            .collect();

        Ok(RunSummary {
            tool: format!("kira-dd/{}", env!("CARGO_PKG_VERSION")),
            parameters,
            servers: self.catalog.servers().to_vec(),
            started_at,
            finished_at: iso_timestamp(),
            counts,
            failures,
            outcomes,
        })
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
