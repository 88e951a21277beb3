//! Model implementations for Fishfresh.
//!
//! This crate provides a concrete `ModelBackend` for the training controller.
//!
//! # Backends
//!
//! - **Patch probe** (`patch-probe`): a small CPU model written against
//!   `ndarray`. The backbone pools each image onto a coarse grid and runs a
//!   stack of per-cell layers; a dropout/dense block feeds the freshness and
//!   species softmax heads. Checkpoints are JSON.

pub mod augment;
pub mod backbone;
pub mod layers;
pub mod probe;

pub use backbone::PatchBackbone;
pub use probe::{PatchProbeBackend, PatchProbeModel, ProbeWeights, BACKEND_ID};
