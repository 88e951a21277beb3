//! Batched image stream feeding the model.
//!
//! Order is fixed before any decoding happens: samples are (optionally)
//! shuffled through a bounded buffer, decoded concurrently on the blocking
//! pool, consumed back in sample order, grouped into batches and prefetched.

use crate::config::TrainingConfig;
use crate::dataset::{list_samples, LabelBundle, Sample};
use crate::error::{TrainingError, TrainingResult};
use crate::taxonomy::Taxonomy;
use futures::stream::{self, Stream, StreamExt};
use image::imageops::FilterType;
use ndarray::{Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

pub type BatchStream = Pin<Box<dyn Stream<Item = TrainingResult<Batch>> + Send>>;

/// Images `[n, height, width, 3]` in `[0, 1]` plus one-hot targets per head.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub freshness: Array2<f32>,
    pub species: Array2<f32>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// `[height, width]`.
    pub image_size: [u32; 2],
    pub batch_size: usize,
    /// `None` keeps sample order (validation and evaluation).
    pub shuffle_buffer: Option<usize>,
    pub prefetch: usize,
    pub decode_workers: usize,
    pub seed: u64,
}

impl PipelineOptions {
    #[must_use]
    pub fn training(config: &TrainingConfig) -> Self {
        Self {
            shuffle_buffer: Some(config.shuffle_buffer.max(1)),
            ..Self::evaluation(config)
        }
    }

    #[must_use]
    pub fn evaluation(config: &TrainingConfig) -> Self {
        Self {
            image_size: config.image_size,
            batch_size: config.batch_size.max(1),
            shuffle_buffer: None,
            prefetch: config.prefetch,
            decode_workers: config.decode_workers.max(1),
            seed: config.seed,
        }
    }
}

/// Iterator adapter that keeps up to `capacity` items and emits a random one.
///
/// With capacity 1 it is the identity; with capacity >= input length it is a
/// full uniform shuffle.
pub struct ShuffleBuffer<I: Iterator, R> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
    pub fn new(source: I, capacity: usize, rng: R) -> Self {
        let capacity = capacity.max(1);
        Self { source, buffer: Vec::with_capacity(capacity), capacity, rng }
    }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(idx))
    }
}

/// Decode to RGB, resize bilinearly to `[height, width]`, scale to `[0, 1]`.
pub fn decode_image(path: &Path, image_size: [u32; 2]) -> TrainingResult<Array3<f32>> {
    let decode_err = |reason: String| TrainingError::Decode { path: path.display().to_string(), reason };

    let decoded = image::ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))?;

    let [height, width] = image_size;
    let rgb = decoded.to_rgb8();
    let resized = image::imageops::resize(&rgb, width, height, FilterType::Triangle);
    let pixels: Vec<f32> = resized.into_raw().into_iter().map(|v| f32::from(v) / 255.0).collect();

    Array3::from_shape_vec((height as usize, width as usize, 3), pixels).map_err(|e| decode_err(e.to_string()))
}

/// A split's samples plus the recipe for streaming them.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    samples: Arc<[Sample]>,
    freshness_width: usize,
    species_width: usize,
    options: PipelineOptions,
}

impl ImageDataset {
    #[must_use]
    pub fn new(samples: Vec<Sample>, freshness_width: usize, species_width: usize, options: PipelineOptions) -> Self {
        Self { samples: samples.into(), freshness_width, species_width, options }
    }

    /// Scan `split_dir` with the agreed taxonomy.
    #[must_use]
    pub fn from_split(
        split_dir: &Path,
        freshness: &Taxonomy,
        species: &Taxonomy,
        extensions: &[String],
        options: PipelineOptions,
    ) -> Self {
        let samples = list_samples(split_dir, freshness, species, extensions);
        Self::new(samples, freshness.len(), species.len(), options)
    }

    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.options.batch_size)
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Sample order for one pass; reshuffled per epoch when shuffling is on.
    #[must_use]
    pub fn sample_order(&self, epoch: u64) -> Vec<Sample> {
        match self.options.shuffle_buffer {
            Some(capacity) => {
                let rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(epoch));
                ShuffleBuffer::new(self.samples.iter().cloned(), capacity, rng).collect()
            }
            None => self.samples.to_vec(),
        }
    }

    /// Start a fresh pass over the split.
    ///
    /// With `prefetch > 0` a producer task is spawned, so this must be called
    /// from within a Tokio runtime.
    pub fn batches(&self, epoch: u64) -> BatchStream {
        let order = self.sample_order(epoch);
        let image_size = self.options.image_size;
        let (freshness_width, species_width) = (self.freshness_width, self.species_width);

        let decoded = stream::iter(order)
            .map(move |sample| async move {
                let path = sample.path.display().to_string();
                tokio::task::spawn_blocking(move || {
                    let image = decode_image(&sample.path, image_size)?;
                    Ok::<_, TrainingError>((image, sample.labels(freshness_width, species_width)))
                })
                .await
                .map_err(|e| TrainingError::Decode { path, reason: e.to_string() })?
            })
            .buffered(self.options.decode_workers);

        let batches = decoded
            .chunks(self.options.batch_size)
            .map(move |items| collate(items, image_size, freshness_width, species_width));

        if self.options.prefetch == 0 {
            return Box::pin(batches);
        }

        let (tx, rx) = tokio::sync::mpsc::channel(self.options.prefetch);
        tokio::spawn(async move {
            let mut batches = Box::pin(batches);
            while let Some(item) = batches.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

fn collate(
    items: Vec<TrainingResult<(Array3<f32>, LabelBundle)>>,
    image_size: [u32; 2],
    freshness_width: usize,
    species_width: usize,
) -> TrainingResult<Batch> {
    let items = items.into_iter().collect::<TrainingResult<Vec<_>>>()?;
    let n = items.len();
    let [height, width] = image_size;

    let mut batch = Batch {
        images: Array4::zeros((n, height as usize, width as usize, 3)),
        freshness: Array2::zeros((n, freshness_width)),
        species: Array2::zeros((n, species_width)),
    };
    for (i, (image, labels)) in items.into_iter().enumerate() {
        batch.images.index_axis_mut(Axis(0), i).assign(&image);
        batch.freshness.row_mut(i).assign(&labels.freshness);
        batch.species.row_mut(i).assign(&labels.species);
    }
    Ok(batch)
}
