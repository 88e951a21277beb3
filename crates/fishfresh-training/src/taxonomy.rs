//! Label taxonomies and species discovery.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::debug;

/// Placeholder species for images without a species folder.
pub const UNKNOWN_SPECIES: &str = "unknown";

/// Label dimension a taxonomy describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelDimension {
    Freshness,
    Species,
}

/// Ordered category names; position is the class index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Taxonomy(Vec<String>);

impl Taxonomy {
    /// Build a taxonomy, rejecting empty lists and repeated names.
    pub fn new(names: Vec<String>) -> TrainingResult<Self> {
        if names.is_empty() {
            return Err(TrainingError::Taxonomy("taxonomy must not be empty".to_string()));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if name.trim().is_empty() {
                return Err(TrainingError::Taxonomy("category names must not be blank".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(TrainingError::Taxonomy(format!("duplicate category: {name}")));
            }
        }
        Ok(Self(names))
    }

    pub fn from_names<I, S>(names: I) -> TrainingResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Into::into).collect())
    }

    /// Single-category taxonomy used when discovery finds nothing.
    #[must_use]
    pub fn fallback() -> Self {
        Self(vec![UNKNOWN_SPECIES.to_string()])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    #[must_use]
    pub fn name(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }
}

impl TryFrom<Vec<String>> for Taxonomy {
    type Error = TrainingError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Taxonomy> for Vec<String> {
    fn from(value: Taxonomy) -> Self {
        value.0
    }
}

impl std::fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Collect species folder names under every freshness folder of `train_root`.
///
/// The result is sorted and deduplicated. Missing or unreadable folders count as
/// empty. An empty scan yields [`Taxonomy::fallback`].
pub fn discover_species(train_root: &Path, freshness: &Taxonomy) -> Taxonomy {
    let mut species = BTreeSet::new();

    for fresh in freshness.names() {
        let fresh_dir = train_root.join(fresh);
        let entries = match std::fs::read_dir(&fresh_dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %fresh_dir.display(), error = %err, "skipping freshness folder");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            species.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    if species.is_empty() {
        return Taxonomy::fallback();
    }
    Taxonomy(species.into_iter().collect())
}
