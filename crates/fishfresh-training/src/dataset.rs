use crate::taxonomy::Taxonomy;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One image and its class indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub freshness: usize,
    pub species: usize,
}

/// One-hot targets for both heads.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelBundle {
    pub freshness: Array1<f32>,
    pub species: Array1<f32>,
}

impl LabelBundle {
    /// Class indices recovered from the one-hot vectors.
    #[must_use]
    pub fn argmax(&self) -> (Option<usize>, Option<usize>) {
        (argmax(self.freshness.view()), argmax(self.species.view()))
    }
}

impl Sample {
    #[must_use]
    pub fn labels(&self, freshness_width: usize, species_width: usize) -> LabelBundle {
        LabelBundle {
            freshness: one_hot(self.freshness, freshness_width),
            species: one_hot(self.species, species_width),
        }
    }
}

#[must_use]
pub fn one_hot(index: usize, depth: usize) -> Array1<f32> {
    let mut out = Array1::zeros(depth);
    if let Some(slot) = out.get_mut(index) {
        *slot = 1.0;
    }
    out
}

/// Index of the largest value; the first one wins on ties.
#[must_use]
pub fn argmax(values: ArrayView1<'_, f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

pub fn is_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_lowercase();
    allowed.iter().any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Enumerate `split/<freshness>/<species>/**/<image>` samples.
///
/// Species folders missing from `species` contribute nothing, and files sitting
/// directly in a freshness folder are not samples. Order is freshness order,
/// then species folder name, then file path, so repeated scans agree.
pub fn list_samples(split_dir: &Path, freshness: &Taxonomy, species: &Taxonomy, extensions: &[String]) -> Vec<Sample> {
    let mut samples = Vec::new();

    for (fresh_idx, fresh) in freshness.names().iter().enumerate() {
        let fresh_dir = split_dir.join(fresh);
        let entries = match std::fs::read_dir(&fresh_dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %fresh_dir.display(), error = %err, "freshness folder not readable; contributes no samples");
                continue;
            }
        };

        let mut species_dirs: Vec<(String, PathBuf)> = entries
            .flatten()
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .filter(|(_, path)| path.is_dir())
            .collect();
        species_dirs.sort();

        for (name, dir) in species_dirs {
            let Some(species_idx) = species.index_of(&name) else {
                debug!(dir = %dir.display(), "species folder not in taxonomy; skipped");
                continue;
            };

            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(err) => {
                        debug!(error = %err, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !is_allowed_extension(entry.path(), extensions) {
                    continue;
                }
                samples.push(Sample {
                    path: entry.into_path(),
                    freshness: fresh_idx,
                    species: species_idx,
                });
            }
        }
    }

    samples
}

/// Per-class sample counts, indexed like the taxonomy.
#[must_use]
pub fn class_counts(samples: &[Sample], freshness_width: usize, species_width: usize) -> (Vec<usize>, Vec<usize>) {
    let mut fresh = vec![0; freshness_width];
    let mut species = vec![0; species_width];
    for sample in samples {
        if let Some(c) = fresh.get_mut(sample.freshness) {
            *c += 1;
        }
        if let Some(c) = species.get_mut(sample.species) {
            *c += 1;
        }
    }
    (fresh, species)
}
