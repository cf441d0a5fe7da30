//! Deformable attention backends.

use ndarray::{Array2, ArrayView2};

use crate::config::Device;
use crate::error::{TractrError, TractrResult};
use crate::tracker::{DeformableAttention, MultiScaleFeatures};

/// Reference CPU operator.
///
/// Every query reads each feature level at its reference point with
/// bilinear interpolation (pixel centres at `(i + 0.5) / size`, zero
/// outside the map) and averages the levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDeformAttn;

impl DeformableAttention for CpuDeformAttn {
    fn attend(
        &self,
        queries: ArrayView2<'_, f32>,
        reference_points: ArrayView2<'_, f32>,
        features: &MultiScaleFeatures,
    ) -> TractrResult<Array2<f32>> {
        check_points(queries, reference_points)?;
        let q = reference_points.nrows();
        let channels = features.channels();
        let mut out = Array2::zeros((q, channels));
        if features.num_levels() == 0 {
            return Ok(out);
        }

        for level in features.levels() {
            let (h, w, _) = level.dim();
            for (i, point) in reference_points.outer_iter().enumerate() {
                for (y, x, weight) in bilinear_taps(point[0], point[1], h, w) {
                    let mut row = out.row_mut(i);
                    row.scaled_add(weight, &level.slice(ndarray::s![y, x, ..]));
                }
            }
        }
        out /= features.num_levels() as f32;
        Ok(out)
    }
}

/// Dense `[Q, H * W]` interpolation matrix of one level, row-major pixels.
pub fn sampling_matrix(reference_points: ArrayView2<'_, f32>, height: usize, width: usize) -> Array2<f32> {
    let mut matrix = Array2::zeros((reference_points.nrows(), height * width));
    for (i, point) in reference_points.outer_iter().enumerate() {
        for (y, x, weight) in bilinear_taps(point[0], point[1], height, width) {
            matrix[[i, y * width + x]] += weight;
        }
    }
    matrix
}

/// In-bounds pixels around normalized `(x, y)` with their weights.
fn bilinear_taps(x: f32, y: f32, height: usize, width: usize) -> Vec<(usize, usize, f32)> {
    let px = x * width as f32 - 0.5;
    let py = y * height as f32 - 0.5;
    let x0 = px.floor();
    let y0 = py.floor();
    let fx = px - x0;
    let fy = py - y0;
    [
        (y0, x0, (1.0 - fx) * (1.0 - fy)),
        (y0, x0 + 1.0, fx * (1.0 - fy)),
        (y0 + 1.0, x0, (1.0 - fx) * fy),
        (y0 + 1.0, x0 + 1.0, fx * fy),
    ]
    .into_iter()
    .filter(|&(yy, xx, w)| {
        w != 0.0 && yy >= 0.0 && xx >= 0.0 && yy < height as f32 && xx < width as f32
    })
    .map(|(yy, xx, w)| (yy as usize, xx as usize, w))
    .collect()
}

pub(crate) fn check_points(
    queries: ArrayView2<'_, f32>,
    reference_points: ArrayView2<'_, f32>,
) -> TractrResult<()> {
    if reference_points.dim() != (queries.nrows(), 2) {
        return Err(TractrError::shape_mismatch(
            "reference points",
            vec![queries.nrows(), 2],
            reference_points.shape().to_vec(),
        ));
    }
    Ok(())
}

/// Pick the attention operator for `device`.
pub fn attention_for_device(device: Device) -> TractrResult<Box<dyn DeformableAttention>> {
    match device {
        Device::Cpu => Ok(Box::new(CpuDeformAttn)),
        #[cfg(feature = "burn-gpu")]
        Device::Gpu => Ok(Box::new(
            super::burn_backend::BurnDeformAttn::<burn::backend::Wgpu>::default(),
        )),
        #[cfg(not(feature = "burn-gpu"))]
        Device::Gpu => Err(TractrError::Attention(
            "the gpu device needs the burn-gpu feature".to_string(),
        )),
    }
}
