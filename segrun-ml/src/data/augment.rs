//! Paired image/mask augmentation.
//!
//! Two [`TransformStream`]s built from the same pipeline share seed, parameters and
//! sample count, so they consume their random generators identically: the k-th sample
//! of the image stream and the k-th sample of the mask stream always receive the same
//! shuffle position and the same geometric transform.

use crate::config::ExperimentConfig;
use ndarray::{Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// An `(image_batch, mask_batch)` pair.
pub type Batch = (Array4<f32>, Array4<f32>);

/// Declarative augmentation knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// Maximum absolute rotation, degrees.
    pub rotation_range: f64,
    /// Zoom factors are drawn from `[1 - zoom_range, 1 + zoom_range]`.
    pub zoom_range: f64,
    pub vertical_flip: bool,
}

impl AugmentParams {
    pub fn identity() -> Self {
        Self {
            rotation_range: 0.0,
            zoom_range: 0.0,
            vertical_flip: false,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        if config.augmentation {
            Self {
                rotation_range: config.rot_range,
                zoom_range: config.zoom_range,
                vertical_flip: config.vertical_flip,
            }
        } else {
            Self::identity()
        }
    }
}

/// One concrete random geometric transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricTransform {
    pub angle_deg: f64,
    pub zoom_x: f64,
    pub zoom_y: f64,
    pub flip_vertical: bool,
}

impl GeometricTransform {
    pub fn identity() -> Self {
        Self {
            angle_deg: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip_vertical: false,
        }
    }

    /// Draw a transform. Disabled knobs consume no randomness.
    pub fn sample(params: &AugmentParams, rng: &mut StdRng) -> Self {
        let mut t = Self::identity();
        if params.rotation_range > 0.0 {
            t.angle_deg = rng.gen_range(-params.rotation_range..=params.rotation_range);
        }
        if params.zoom_range > 0.0 {
            let (lo, hi) = (1.0 - params.zoom_range, 1.0 + params.zoom_range);
            t.zoom_x = rng.gen_range(lo..=hi);
            t.zoom_y = rng.gen_range(lo..=hi);
        }
        if params.vertical_flip {
            t.flip_vertical = rng.gen_bool(0.5);
        }
        t
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Apply to one `H×W×C` sample. Output pixels are inverse-mapped around the centre
    /// and sampled bilinearly; out-of-range coordinates reflect back into the image.
    pub fn apply(&self, sample: ArrayView3<f32>) -> Array3<f32> {
        if self.is_identity() {
            return sample.to_owned();
        }
        let (h, w, c) = sample.dim();
        let (cy, cx) = ((h as f64 - 1.0) / 2.0, (w as f64 - 1.0) / 2.0);
        let (sin, cos) = self.angle_deg.to_radians().sin_cos();

        let mut out = Array3::zeros((h, w, c));
        for y in 0..h {
            let oy = if self.flip_vertical { h - 1 - y } else { y };
            for x in 0..w {
                let (dy, dx) = (y as f64 - cy, x as f64 - cx);
                let sy = self.zoom_y * (cos * dy - sin * dx) + cy;
                let sx = self.zoom_x * (sin * dy + cos * dx) + cx;
                for ch in 0..c {
                    out[[oy, x, ch]] = bilinear(&sample, sy, sx, ch);
                }
            }
        }
        out
    }
}

fn bilinear(sample: &ArrayView3<f32>, sy: f64, sx: f64, ch: usize) -> f32 {
    let (h, w, _) = sample.dim();
    let (y0, x0) = (sy.floor(), sx.floor());
    let (wy, wx) = ((sy - y0) as f32, (sx - x0) as f32);
    let (y0, x0) = (y0 as i64, x0 as i64);
    let at = |y: i64, x: i64| sample[[reflect(y, h), reflect(x, w), ch]];

    let top = at(y0, x0) * (1.0 - wx) + at(y0, x0 + 1) * wx;
    let bottom = at(y0 + 1, x0) * (1.0 - wx) + at(y0 + 1, x0 + 1) * wx;
    top * (1.0 - wy) + bottom * wy
}

/// Half-sample symmetric reflection: `d c b a | a b c d | d c b a`.
fn reflect(i: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

/// Lazy, infinite, restartable stream of transformed batches over one array.
#[derive(Debug, Clone)]
pub struct TransformStream {
    data: Arc<Array4<f32>>,
    params: AugmentParams,
    batch_size: usize,
    seed: u64,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl TransformStream {
    fn new(data: Arc<Array4<f32>>, params: AugmentParams, batch_size: usize, seed: u64) -> Self {
        Self {
            data,
            params,
            batch_size,
            seed,
            rng: StdRng::seed_from_u64(seed),
            order: Vec::new(),
            cursor: 0,
        }
    }

    /// Restart from the seed; the stream replays the same batches.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.order.clear();
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Array4<f32> {
        let n = self.data.len_of(Axis(0));
        if self.cursor >= self.order.len() {
            self.order = (0..n).collect();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let (_, h, w, c) = self.data.dim();

        let mut batch = Array4::zeros((end - self.cursor, h, w, c));
        for (slot, &idx) in self.order[self.cursor..end].iter().enumerate() {
            let transform = GeometricTransform::sample(&self.params, &mut self.rng);
            let sample = transform.apply(self.data.index_axis(Axis(0), idx));
            batch.index_axis_mut(Axis(0), slot).assign(&sample);
        }
        self.cursor = end;
        batch
    }
}

impl Iterator for TransformStream {
    type Item = Array4<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len_of(Axis(0)) == 0 {
            return None;
        }
        Some(self.next_batch())
    }
}

/// Zip of an image stream and a mask stream.
#[derive(Debug, Clone)]
pub struct PairedBatches {
    images: TransformStream,
    masks: TransformStream,
}

impl PairedBatches {
    pub fn reset(&mut self) {
        self.images.reset();
        self.masks.reset();
    }
}

impl Iterator for PairedBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        Some((self.images.next()?, self.masks.next()?))
    }
}

/// Builder for synchronized image/mask streams.
#[derive(Debug, Clone, Copy)]
pub struct AugmentationPipeline {
    pub params: AugmentParams,
    pub batch_size: usize,
    pub seed: u64,
}

impl AugmentationPipeline {
    pub fn new(params: AugmentParams, batch_size: usize, seed: u64) -> Self {
        Self {
            params,
            batch_size: batch_size.max(1),
            seed,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        let pipeline = Self::new(
            AugmentParams::from_config(config),
            config.batch_size,
            config.seed,
        );
        tracing::debug!(params = ?pipeline.params, "Built augmentation pipeline");
        pipeline
    }

    pub fn image_stream(&self, images: Arc<Array4<f32>>) -> TransformStream {
        TransformStream::new(images, self.params, self.batch_size, self.seed)
    }

    pub fn mask_stream(&self, masks: Arc<Array4<f32>>) -> TransformStream {
        TransformStream::new(masks, self.params, self.batch_size, self.seed)
    }

    /// Paired stream over aligned images and one-hot masks.
    pub fn flow(&self, images: Arc<Array4<f32>>, masks: Arc<Array4<f32>>) -> PairedBatches {
        PairedBatches {
            images: self.image_stream(images),
            masks: self.mask_stream(masks),
        }
    }

    pub fn steps_per_epoch(&self, train_len: usize) -> usize {
        train_len / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, h, w, 1), |(i, y, x, _)| (i * 100 + y * w + x) as f32)
    }

    fn augmenting() -> AugmentParams {
        AugmentParams {
            rotation_range: 30.0,
            zoom_range: 0.2,
            vertical_flip: true,
        }
    }

    #[test]
    fn test_disabled_augmentation_is_identity() {
        let config = ExperimentConfig {
            rot_range: 45.0,
            zoom_range: 0.3,
            vertical_flip: true,
            ..Default::default()
        };
        assert_eq!(AugmentParams::from_config(&config), AugmentParams::identity());

        let data = Arc::new(ramp(4, 5, 5));
        let pipeline = AugmentationPipeline::new(AugmentParams::identity(), 4, 1);
        let batch = pipeline.image_stream(data.clone()).next().unwrap();
        let mut rows: Vec<f32> = batch.iter().copied().collect();
        let mut expected: Vec<f32> = data.iter().copied().collect();
        rows.sort_by(f32::total_cmp);
        expected.sort_by(f32::total_cmp);
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_streams_receive_identical_transforms() {
        let data = Arc::new(ramp(5, 6, 6));
        let pipeline = AugmentationPipeline::new(augmenting(), 2, 1234);
        let mut paired = pipeline.flow(data.clone(), data);
        for _ in 0..7 {
            let (images, masks) = paired.next().unwrap();
            assert_eq!(images, masks);
        }
    }

    #[test]
    fn test_reset_replays_stream() {
        let data = Arc::new(ramp(3, 4, 4));
        let pipeline = AugmentationPipeline::new(augmenting(), 2, 9);
        let mut stream = pipeline.image_stream(data);
        let first: Vec<_> = stream.by_ref().take(4).collect();
        stream.reset();
        let replay: Vec<_> = stream.take(4).collect();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_batches_cover_each_pass_with_partial_tail() {
        let data = Arc::new(ramp(5, 2, 2));
        let pipeline = AugmentationPipeline::new(AugmentParams::identity(), 2, 3);
        let sizes: Vec<usize> = pipeline
            .image_stream(data)
            .take(6)
            .map(|b| b.len_of(Axis(0)))
            .collect();
        assert_eq!(sizes, vec![2, 2, 1, 2, 2, 1]);
        assert_eq!(pipeline.steps_per_epoch(5), 2);
    }

    #[test]
    fn test_vertical_flip_reverses_rows() {
        let sample = ramp(1, 3, 2);
        let t = GeometricTransform {
            flip_vertical: true,
            ..GeometricTransform::identity()
        };
        let out = t.apply(sample.index_axis(Axis(0), 0));
        assert_eq!(out[[0, 0, 0]], sample[[0, 2, 0, 0]]);
        assert_eq!(out[[2, 1, 0]], sample[[0, 0, 1, 0]]);
    }

    #[test]
    fn test_reflect_indices() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(2, 4), 2);
    }
}
