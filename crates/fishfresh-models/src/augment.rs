//! Train-time image perturbations.
//!
//! Geometry (flip, rotation, zoom, translation) is applied as one inverse
//! affine map sampled with nearest neighbour and edge clamping; photometric
//! jitter follows. Pixel values stay in `[0, 1]`.

use fishfresh_training::model::AugmentationSpec;
use ndarray::{Array3, ArrayView3, Axis};
use rand::Rng;
use std::f32::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Draw {
    flip: bool,
    angle: f32,
    scale: f32,
    shift_y: f32,
    shift_x: f32,
    brightness: f32,
    contrast: f32,
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 { rng.gen_range(-range..=range) } else { 0.0 }
}

fn draw<R: Rng>(spec: &AugmentationSpec, rng: &mut R) -> Draw {
    Draw {
        flip: spec.horizontal_flip && rng.gen_bool(0.5),
        angle: symmetric(rng, spec.rotation) * TAU,
        scale: 1.0 + symmetric(rng, spec.zoom),
        shift_y: symmetric(rng, spec.translate_height),
        shift_x: symmetric(rng, spec.translate_width),
        brightness: symmetric(rng, spec.brightness),
        contrast: 1.0 + symmetric(rng, spec.contrast),
    }
}

/// One random perturbation of `image` (`[height, width, 3]`).
pub fn augment_image<R: Rng>(image: ArrayView3<'_, f32>, spec: &AugmentationSpec, rng: &mut R) -> Array3<f32> {
    apply(image, draw(spec, rng))
}

fn apply(image: ArrayView3<'_, f32>, d: Draw) -> Array3<f32> {
    let (height, width, channels) = image.dim();
    let (cy, cx) = ((height as f32 - 1.0) / 2.0, (width as f32 - 1.0) / 2.0);
    let (sin, cos) = d.angle.sin_cos();
    let max_y = height.saturating_sub(1) as f32;
    let max_x = width.saturating_sub(1) as f32;

    let mut out = Array3::zeros((height, width, channels));
    for y in 0..height {
        for x in 0..width {
            // output pixel relative to centre, undo translation then rotation/zoom
            let oy = y as f32 - cy - d.shift_y * height as f32;
            let ox = x as f32 - cx - d.shift_x * width as f32;
            let sy = (cos * oy - sin * ox) / d.scale + cy;
            let mut sx = (sin * oy + cos * ox) / d.scale + cx;
            if d.flip {
                sx = max_x - sx;
            }
            let src_y = sy.round().clamp(0.0, max_y) as usize;
            let src_x = sx.round().clamp(0.0, max_x) as usize;
            for c in 0..channels {
                out[[y, x, c]] = image[[src_y, src_x, c]];
            }
        }
    }

    let mean = out.mean().unwrap_or(0.0);
    out.mapv_inplace(|v| ((v - mean) * d.contrast + mean + d.brightness).clamp(0.0, 1.0));
    out
}

/// Augment every image of a `[n, height, width, 3]` batch independently.
pub fn augment_batch<R: Rng>(images: &ndarray::Array4<f32>, spec: &AugmentationSpec, rng: &mut R) -> ndarray::Array4<f32> {
    let mut out = images.clone();
    for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(images.axis_iter(Axis(0))) {
        dst.assign(&augment_image(src, spec, rng));
    }
    out
}
