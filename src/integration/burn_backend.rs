//! Burn implementation of the attention operator.
//!
//! Each level's interpolation matrix is built on the host and applied to
//! the flattened feature map with a backend matmul, so any Burn backend
//! (including GPU ones) can run the sampling. With the `burn-gpu` feature
//! the configured `gpu` device runs it on `burn::backend::Wgpu`.
//!
//! # Example
//!
//! ```ignore
//! use burn::backend::NdArray;
//! use cell_tractr::integration::BurnDeformAttn;
//!
//! let attention = BurnDeformAttn::<NdArray>::default();
//! let pipeline = TrackingPipeline::new(cfg, decoder, proposals, attention)?;
//! ```

use burn::prelude::*;
use burn::tensor::Tensor;
use ndarray::{Array2, ArrayView2};

use super::deform_attn::{check_points, sampling_matrix};
use crate::error::{TractrError, TractrResult};
use crate::tracker::{DeformableAttention, MultiScaleFeatures};

/// Deformable attention on a Burn backend.
pub struct BurnDeformAttn<B: Backend> {
    device: B::Device,
}

impl<B: Backend> Default for BurnDeformAttn<B> {
    fn default() -> Self {
        Self::new(B::Device::default())
    }
}

impl<B: Backend> BurnDeformAttn<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn tensor(&self, data: &[f32], rows: usize, cols: usize) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(data, &self.device).reshape([rows, cols])
    }
}

impl<B: Backend> DeformableAttention for BurnDeformAttn<B> {
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
        if features.num_levels() == 0 || q == 0 {
            return Ok(out);
        }

        for level in features.levels() {
            let (h, w, c) = level.dim();
            let weights: Vec<f32> = sampling_matrix(reference_points, h, w).into_iter().collect();
            let values: Vec<f32> = level.iter().copied().collect();
            let sampled = self
                .tensor(&weights, q, h * w)
                .matmul(self.tensor(&values, h * w, c));
            let host = sampled
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| TractrError::Attention(format!("reading attention output: {e:?}")))?;
            let host = Array2::from_shape_vec((q, c), host)
                .map_err(|e| TractrError::Attention(e.to_string()))?;
            out += &host;
        }
        out /= features.num_levels() as f32;
        Ok(out)
    }
}
