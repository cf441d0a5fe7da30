//! Point sampling for mask costs and losses.
//!
//! Masks are compared on a set of normalized `(x, y)` points instead of
//! every pixel. Values between pixel centres are bilinearly interpolated
//! with pixel centres at `(i + 0.5) / size` and zero outside the mask.
//! When the point budget covers the whole mask every pixel is used as is.

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TractrConfig;

/// Where a mask is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplePoints {
    /// Every pixel of an `H x W` mask.
    Grid { height: usize, width: usize },
    /// Normalized `(x, y)` locations.
    Points(Vec<[f32; 2]>),
}

impl SamplePoints {
    pub fn len(&self) -> usize {
        match self {
            SamplePoints::Grid { height, width } => height * width,
            SamplePoints::Points(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of `mask` at every point.
    pub fn sample(&self, mask: ArrayView2<'_, f32>) -> Vec<f32> {
        match self {
            SamplePoints::Grid { height, width } if mask.dim() == (*height, *width) => {
                mask.iter().copied().collect()
            }
            SamplePoints::Grid { height, width } => {
                let (h, w) = (*height, *width);
                (0..h * w)
                    .map(|k| {
                        let x = ((k % w) as f32 + 0.5) / w as f32;
                        let y = ((k / w) as f32 + 0.5) / h as f32;
                        bilinear(mask, x, y)
                    })
                    .collect()
            }
            SamplePoints::Points(points) => {
                points.iter().map(|&[x, y]| bilinear(mask, x, y)).collect()
            }
        }
    }
}

/// Bilinear interpolation at normalized `(x, y)`, zero padded.
pub fn bilinear(mask: ArrayView2<'_, f32>, x: f32, y: f32) -> f32 {
    let (h, w) = mask.dim();
    let px = x * w as f32 - 0.5;
    let py = y * h as f32 - 0.5;
    let x0 = px.floor();
    let y0 = py.floor();
    let fx = px - x0;
    let fy = py - y0;

    let at = |yy: f32, xx: f32| -> f32 {
        if yy < 0.0 || xx < 0.0 || yy >= h as f32 || xx >= w as f32 {
            0.0
        } else {
            mask[[yy as usize, xx as usize]]
        }
    };

    at(y0, x0) * (1.0 - fx) * (1.0 - fy)
        + at(y0, x0 + 1.0) * fx * (1.0 - fy)
        + at(y0 + 1.0, x0) * (1.0 - fx) * fy
        + at(y0 + 1.0, x0 + 1.0) * fx * fy
}

/// Seeded sampler keyed by a sampling step.
///
/// Points depend only on `(seed, step, stream)`: every call within one step
/// sees the same points, so matching the same frame twice is idempotent,
/// while advancing `step` moves the points over the whole mask.
#[derive(Debug, Clone)]
pub struct PointSampler {
    pub num_points: usize,
    pub oversample_ratio: f32,
    pub importance_sample_ratio: f32,
    pub seed: u64,
    /// Current sampling step, advanced once per processed frame.
    pub step: u64,
}

impl PointSampler {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            num_points: cfg.num_points,
            oversample_ratio: cfg.oversample_ratio,
            importance_sample_ratio: cfg.importance_sample_ratio,
            seed: cfg.seed,
            step: 0,
        }
    }

    /// Move to sampling step `step`.
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    fn rng(&self, stream: u64) -> StdRng {
        StdRng::seed_from_u64(mix_seed(self.seed, self.step, stream))
    }

    fn covers(&self, height: usize, width: usize) -> bool {
        self.num_points >= height * width
    }

    /// Uniform points for matching costs.
    pub fn uniform(&self, height: usize, width: usize) -> SamplePoints {
        if self.covers(height, width) {
            return SamplePoints::Grid { height, width };
        }
        SamplePoints::Points(random_points(&mut self.rng(0), self.num_points))
    }

    /// Points concentrated where `logits` are closest to zero.
    ///
    /// `oversample_ratio x num_points` candidates are drawn uniformly; the
    /// `importance_sample_ratio` share of the budget goes to the most
    /// uncertain candidates and the rest is drawn uniformly again. Distinct
    /// `stream`s draw independent candidates within one step.
    pub fn importance(&self, logits: ArrayView2<'_, f32>, stream: u64) -> SamplePoints {
        let (height, width) = logits.dim();
        if self.covers(height, width) {
            return SamplePoints::Grid { height, width };
        }
        let mut rng = self.rng(stream.wrapping_add(1));
        let num_candidates = ((self.num_points as f32 * self.oversample_ratio) as usize).max(1);
        let candidates = random_points(&mut rng, num_candidates);
        let mut uncertainty: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, &[x, y])| (i, -bilinear(logits, x, y).abs()))
            .collect();
        uncertainty.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let num_uncertain =
            ((self.importance_sample_ratio * self.num_points as f32) as usize).min(num_candidates);
        let mut points: Vec<[f32; 2]> = uncertainty[..num_uncertain]
            .iter()
            .map(|(i, _)| candidates[*i])
            .collect();
        points.extend(random_points(&mut rng, self.num_points - num_uncertain));
        SamplePoints::Points(points)
    }
}

/// SplitMix64 finalizer over seed, step and stream.
fn mix_seed(seed: u64, step: u64, stream: u64) -> u64 {
    let mut z = seed
        ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ stream.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn random_points(rng: &mut StdRng, n: usize) -> Vec<[f32; 2]> {
    (0..n)
        .map(|_| [rng.gen_range(0.0f32..1.0), rng.gen_range(0.0f32..1.0)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn sampler(num_points: usize) -> PointSampler {
        PointSampler {
            num_points,
            oversample_ratio: 3.0,
            importance_sample_ratio: 0.75,
            seed: 1,
            step: 0,
        }
    }

    #[test]
    fn bilinear_hits_pixel_centres() {
        let mask = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
        assert_abs_diff_eq!(bilinear(mask.view(), 2.5 / 4.0, 1.5 / 4.0), 6.0, epsilon = 1e-4);
    }

    #[test]
    fn bilinear_interpolates_between_centres() {
        let mut mask = Array2::zeros((1, 2));
        mask[[0, 1]] = 1.0;
        assert_abs_diff_eq!(bilinear(mask.view(), 0.5, 0.5), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn bilinear_pads_with_zero() {
        let mask = Array2::from_elem((2, 2), 1.0);
        // A corner point is half a pixel outside on both axes.
        assert_abs_diff_eq!(bilinear(mask.view(), 0.0, 0.0), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn full_budget_uses_every_pixel() {
        let mask = Array2::from_shape_fn((3, 3), |(y, x)| (y * 3 + x) as f32);
        let points = sampler(9).uniform(3, 3);
        assert_eq!(points, SamplePoints::Grid { height: 3, width: 3 });
        assert_eq!(points.sample(mask.view()), mask.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn points_are_fixed_within_a_step() {
        let s = sampler(16);
        assert_eq!(s.uniform(64, 64), s.uniform(64, 64));
        assert_eq!(s.uniform(64, 64).len(), 16);
        let logits = Array2::from_shape_fn((64, 64), |(y, x)| (x + y) as f32 - 64.0);
        assert_eq!(s.importance(logits.view(), 3), s.importance(logits.view(), 3));
    }

    #[test]
    fn points_move_with_the_step() {
        let mut s = sampler(16);
        let first = s.uniform(64, 64);
        s.set_step(1);
        assert_ne!(s.uniform(64, 64), first);

        let logits = Array2::<f32>::zeros((64, 64));
        s.set_step(0);
        let before = s.importance(logits.view(), 0);
        assert_ne!(s.importance(logits.view(), 1), before);
        s.set_step(1);
        assert_ne!(s.importance(logits.view(), 0), before);
    }

    #[test]
    fn advancing_steps_cover_the_mask() {
        let mut s = sampler(16);
        let mut touched = std::collections::HashSet::new();
        for step in 0..200 {
            s.set_step(step);
            if let SamplePoints::Points(points) = s.uniform(64, 64) {
                for [x, y] in points {
                    touched.insert(((y * 64.0) as usize, (x * 64.0) as usize));
                }
            }
        }
        // 3200 draws over 4096 pixels.
        assert!(touched.len() > 1500, "only {} pixels sampled", touched.len());
    }

    #[test]
    fn importance_sampling_budget() {
        let logits = Array2::from_shape_fn((32, 32), |(_, x)| x as f32 - 16.0);
        let points = sampler(20).importance(logits.view(), 0);
        assert_eq!(points.len(), 20);
        if let SamplePoints::Points(p) = &points {
            // Uncertain points cluster around the zero crossing.
            let near_boundary = p[..15]
                .iter()
                .filter(|[x, _]| (x * 32.0 - 16.5).abs() < 8.0)
                .count();
            assert!(near_boundary >= 12);
        } else {
            panic!("expected sampled points");
        }
    }
}
