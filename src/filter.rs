use serde::Serialize;

use crate::catalog::{Catalog, Partitions};
use crate::domain::{ArchiveDescriptor, Selection, Split, SubsetTier};
use crate::error::KiraError;

const MISSING_CHECKSUM_SAMPLE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SelectionCriteria {
    pub domains: Selection<String>,
    pub components: Selection<String>,
    /// `None` selects every subset tier.
    pub subset: Option<SubsetTier>,
    /// `None` selects every split.
    pub split: Option<Split>,
}

impl SelectionCriteria {
    pub fn everything() -> Self {
        Self {
            domains: Selection::All,
            components: Selection::All,
            subset: None,
            split: None,
        }
    }
}

/// Archives of `catalog` matching `criteria`, in catalog order.
pub fn filter_archives(catalog: &Catalog, criteria: &SelectionCriteria) -> Vec<ArchiveDescriptor> {
    catalog
        .archives()
        .iter()
        .filter(|archive| is_selected(archive, criteria, catalog.splits(), catalog.subsets()))
        .cloned()
        .collect()
}

pub fn is_selected(
    archive: &ArchiveDescriptor,
    criteria: &SelectionCriteria,
    splits: &Partitions<Split>,
    subsets: &Partitions<SubsetTier>,
) -> bool {
    criteria.components.contains(&archive.component)
        && is_member(subsets, criteria.subset, archive)
        && is_member(splits, criteria.split, archive)
        && criteria.domains.contains(&archive.domain)
}

fn is_member<K: Ord>(
    partitions: &Partitions<K>,
    key: Option<K>,
    archive: &ArchiveDescriptor,
) -> bool {
    let Some(key) = key else {
        return true;
    };
    match partitions.get(&archive.component) {
        None | Some(None) => true,
        Some(Some(groups)) => groups
            .get(&key)
            .map(|members| members.contains(&archive.model))
            .unwrap_or(false),
    }
}

/// Deterministic slice of a list: every `total`-th item starting at `index`.
/// Running all `total` stripes covers the list exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkStripe {
    index: usize,
    total: usize,
}

impl ChunkStripe {
    pub fn new(index: usize, total: usize) -> Result<Self, KiraError> {
        if total == 0 || index >= total {
            return Err(KiraError::InvalidChunk { index, total });
        }
        Ok(Self { index, total })
    }

    pub fn whole() -> Self {
        Self { index: 0, total: 1 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .enumerate()
            .filter(|(position, _)| position % self.total == self.index)
            .map(|(_, item)| item)
            .collect()
    }
}

/// Fails when any archive lacks a checksum; used before any transfer starts.
pub fn ensure_checksums(archives: &[ArchiveDescriptor]) -> Result<(), KiraError> {
    let missing = archives
        .iter()
        .filter(|archive| archive.checksum.is_none())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(());
    }

    let mut sample = missing
        .iter()
        .take(MISSING_CHECKSUM_SAMPLE)
        .map(|archive| format!("    {}", archive.url))
        .collect::<Vec<_>>();
    if missing.len() > MISSING_CHECKSUM_SAMPLE {
        sample.push(format!(
            "    and {} more...",
            missing.len() - MISSING_CHECKSUM_SAMPLE
        ));
    }
    Err(KiraError::MissingChecksums {
        count: missing.len(),
        sample: sample.join("\n"),
    })
}
