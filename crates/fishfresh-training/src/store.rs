//! Persisted label taxonomy and the reconciliation policy applied on startup.
//!
//! A checkpoint's head weights are only meaningful under the index assignment
//! they were trained with, so a saved species ordering is reused whenever the
//! freshness ordering still matches. Newly discovered species are ignored in
//! that case rather than appended.

use crate::atomic::write_json_atomic;
use crate::error::TrainingResult;
use crate::taxonomy::Taxonomy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk shape of the agreed taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyRecord {
    #[serde(default)]
    pub freshness_classes: Vec<String>,
    #[serde(default)]
    pub species_classes: Vec<String>,
}

impl TaxonomyRecord {
    #[must_use]
    pub fn new(freshness: &Taxonomy, species: &Taxonomy) -> Self {
        Self {
            freshness_classes: freshness.names().to_vec(),
            species_classes: species.names().to_vec(),
        }
    }
}

/// Where the agreed species ordering came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomySource {
    /// Taken from the persisted record.
    Reused,
    /// Taken from the directory scan (first run or deliberate reset).
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub freshness: Taxonomy,
    pub species: Taxonomy,
    pub source: TaxonomySource,
    /// Species found on disk that the reused ordering does not cover.
    pub ignored_species: Vec<String>,
    /// A record existed but was not reusable.
    pub replaced_prior: bool,
}

impl Reconciliation {
    #[must_use]
    pub fn record(&self) -> TaxonomyRecord {
        TaxonomyRecord::new(&self.freshness, &self.species)
    }

    #[must_use]
    pub fn needs_persist(&self) -> bool {
        self.source == TaxonomySource::Discovered
    }
}

/// Decide the agreed species ordering from a prior record and a fresh scan.
pub fn reconcile(prior: Option<&TaxonomyRecord>, freshness: &Taxonomy, discovered: Taxonomy) -> Reconciliation {
    let reusable = prior
        .filter(|record| record.freshness_classes.as_slice() == freshness.names())
        .filter(|record| !record.species_classes.is_empty())
        .and_then(|record| Taxonomy::new(record.species_classes.clone()).ok());

    match reusable {
        Some(species) => {
            let ignored_species = discovered
                .names()
                .iter()
                .filter(|name| !species.contains(name))
                .cloned()
                .collect();
            Reconciliation {
                freshness: freshness.clone(),
                species,
                source: TaxonomySource::Reused,
                ignored_species,
                replaced_prior: false,
            }
        }
        None => Reconciliation {
            freshness: freshness.clone(),
            species: discovered,
            source: TaxonomySource::Discovered,
            ignored_species: Vec::new(),
            replaced_prior: prior.is_some(),
        },
    }
}

/// JSON file holding the [`TaxonomyRecord`].
#[derive(Debug, Clone)]
pub struct TaxonomyStore {
    path: PathBuf,
}

impl TaxonomyStore {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no record has been written yet.
    pub fn load(&self) -> TrainingResult<Option<TaxonomyRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, record: &TaxonomyRecord) -> TrainingResult<()> {
        write_json_atomic(&self.path, record)
    }

    /// Load the prior record, reconcile it with `discovered`, and persist the
    /// outcome when the discovered ordering was adopted.
    pub fn resolve(&self, freshness: &Taxonomy, discovered: Taxonomy) -> TrainingResult<Reconciliation> {
        let prior = self.load()?;
        let outcome = reconcile(prior.as_ref(), freshness, discovered);

        if outcome.replaced_prior {
            warn!(
                path = %self.path.display(),
                "stored taxonomy does not match the current freshness classes; adopting discovered species \
                 (an existing checkpoint's species head may no longer line up)"
            );
        }
        if !outcome.ignored_species.is_empty() {
            warn!(
                ignored = ?outcome.ignored_species,
                "species folders not in the stored taxonomy are ignored"
            );
        }
        if outcome.needs_persist() {
            self.save(&outcome.record())?;
            info!(path = %self.path.display(), species = %outcome.species, "saved taxonomy record");
        }
        Ok(outcome)
    }
}
