//! Decoder stack contract.
//!
//! The decoder is a homogeneous sequence of [`RefinementStep`]s. Each step
//! sees the query embeddings and the reference boxes left by the previous
//! layer and predicts logit-space box deltas, so refinement is always
//! cumulative: layer `l` outputs `sigmoid(inverse_sigmoid(ref_l) + delta_l)`
//! and only the primary box becomes `ref_{l+1}`. Sharing one head across
//! layers is a matter of putting the same `Arc` in every slot.

use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, Array4, ArrayView2};
use tracing::trace;

use crate::config::TractrConfig;
use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::BBox;
use crate::tracker::prediction::{BOX_COLUMNS, PredictionSet};
use crate::tracker::query::QuerySet;

/// Multi-level encoder feature maps, each `[H, W, C]` with a shared `C`.
#[derive(Debug, Clone)]
pub struct MultiScaleFeatures {
    levels: Vec<Array3<f32>>,
}

impl MultiScaleFeatures {
    pub fn new(levels: Vec<Array3<f32>>) -> TractrResult<Self> {
        if let Some(first) = levels.first() {
            let channels = first.dim().2;
            if let Some(bad) = levels.iter().find(|l| l.dim().2 != channels) {
                return Err(TractrError::shape_mismatch(
                    "feature level channels",
                    vec![channels],
                    vec![bad.dim().2],
                ));
            }
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[Array3<f32>] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn channels(&self) -> usize {
        self.levels.first().map_or(0, |l| l.dim().2)
    }

    /// `(H, W)` of every level.
    pub fn spatial_shapes(&self) -> Vec<(usize, usize)> {
        self.levels
            .iter()
            .map(|l| {
                let (h, w, _) = l.dim();
                (h, w)
            })
            .collect()
    }
}

/// Black-box multi-scale deformable attention operator.
pub trait DeformableAttention: Send + Sync {
    /// Attend from `queries` `[Q, D]` at `reference_points` `[Q, 2]`
    /// (normalized x, y) over every feature level. Returns `[Q, C]`.
    fn attend(
        &self,
        queries: ArrayView2<'_, f32>,
        reference_points: ArrayView2<'_, f32>,
        features: &MultiScaleFeatures,
    ) -> TractrResult<Array2<f32>>;
}

impl<T: DeformableAttention + ?Sized> DeformableAttention for Box<T> {
    fn attend(
        &self,
        queries: ArrayView2<'_, f32>,
        reference_points: ArrayView2<'_, f32>,
        features: &MultiScaleFeatures,
    ) -> TractrResult<Array2<f32>> {
        (**self).attend(queries, reference_points, features)
    }
}

/// Raw output of one refinement step, one row per query.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Refined embeddings `[Q, D]`.
    pub embeddings: Array2<f32>,
    /// Logit-space deltas `[Q, 8]` for the primary and secondary boxes.
    pub box_deltas: Array2<f32>,
    /// Class logits `[Q, C]`.
    pub logits: Array2<f32>,
    pub division_logits: Option<Array1<f32>>,
    /// Mask logits `[Q, 2, H, W]`.
    pub masks: Option<Array4<f32>>,
}

/// One decoder layer's refinement capability.
pub trait RefinementStep: Send + Sync {
    /// Refine queries at decoder layer `layer`.
    ///
    /// `reference` holds the incoming `[Q, 4]` CXCYWH reference boxes.
    /// `attention_mask` is the `[Q, Q]` self-attention mask of
    /// [`QuerySet::attention_mask`]; `true` entries must not be attended.
    fn refine(
        &self,
        layer: usize,
        embeddings: ArrayView2<'_, f32>,
        reference: ArrayView2<'_, f32>,
        attention_mask: ArrayView2<'_, bool>,
        features: &MultiScaleFeatures,
        attention: &dyn DeformableAttention,
    ) -> TractrResult<StepOutput>;
}

/// Everything one decoder layer produced.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Refined embeddings `[Q, D]`.
    pub embeddings: Array2<f32>,
    pub predictions: PredictionSet,
    /// Reference boxes `[Q, 4]` this layer refined.
    pub reference: Array2<f32>,
}

/// Per-layer outputs of a decoder pass.
#[derive(Debug, Clone, Default)]
pub struct DecoderOutput {
    pub layers: Vec<LayerOutput>,
}

impl DecoderOutput {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn final_layer(&self) -> Option<&LayerOutput> {
        self.layers.last()
    }
}

/// Homogeneous stack of refinement steps.
#[derive(Clone)]
pub struct DecoderStack {
    steps: Vec<Arc<dyn RefinementStep>>,
    return_intermediate_masks: bool,
}

impl std::fmt::Debug for DecoderStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderStack")
            .field("layers", &self.steps.len())
            .field("return_intermediate_masks", &self.return_intermediate_masks)
            .finish()
    }
}

impl DecoderStack {
    /// One step per layer.
    pub fn new(steps: Vec<Arc<dyn RefinementStep>>, return_intermediate_masks: bool) -> Self {
        Self {
            steps,
            return_intermediate_masks,
        }
    }

    /// The same step reused for `layers` layers.
    pub fn shared(step: Arc<dyn RefinementStep>, layers: usize, return_intermediate_masks: bool) -> Self {
        Self::new(vec![step; layers], return_intermediate_masks)
    }

    /// Build from per-layer steps, or from the first one alone when
    /// `share_bbox_layers` is set.
    pub fn from_config(cfg: &TractrConfig, steps: Vec<Arc<dyn RefinementStep>>) -> TractrResult<Self> {
        let rim = cfg.masks && cfg.return_intermediate_masks;
        if cfg.share_bbox_layers {
            let step = steps
                .into_iter()
                .next()
                .ok_or_else(|| TractrError::malformed("decoder needs at least one refinement step"))?;
            return Ok(Self::shared(step, cfg.dec_layers, rim));
        }
        if steps.len() != cfg.dec_layers {
            return Err(TractrError::shape_mismatch(
                "decoder layers",
                vec![cfg.dec_layers],
                vec![steps.len()],
            ));
        }
        Ok(Self::new(steps, rim))
    }

    pub fn num_layers(&self) -> usize {
        self.steps.len()
    }

    /// Run every layer over `queries`.
    pub fn forward(
        &self,
        queries: &QuerySet,
        features: &MultiScaleFeatures,
        attention: &dyn DeformableAttention,
    ) -> TractrResult<DecoderOutput> {
        let q = queries.len();
        let mut embeddings = queries.embeddings();
        let mut reference = queries.references();
        let attention_mask = queries.attention_mask();
        let mut layers = Vec::with_capacity(self.steps.len());
        let last = self.steps.len().saturating_sub(1);

        for (layer, step) in self.steps.iter().enumerate() {
            let out = step.refine(
                layer,
                embeddings.view(),
                reference.view(),
                attention_mask.view(),
                features,
                attention,
            )?;
            check_rows("refined embeddings", &out.embeddings, q)?;
            if out.embeddings.ncols() != queries.hidden_dim() {
                return Err(TractrError::shape_mismatch(
                    "refined embeddings",
                    vec![q, queries.hidden_dim()],
                    out.embeddings.shape().to_vec(),
                ));
            }
            if out.box_deltas.dim() != (q, BOX_COLUMNS) {
                return Err(TractrError::shape_mismatch(
                    "box deltas",
                    vec![q, BOX_COLUMNS],
                    out.box_deltas.shape().to_vec(),
                ));
            }

            let boxes = apply_deltas(&reference, &out.box_deltas);
            let masks = if layer == last || self.return_intermediate_masks {
                out.masks
            } else {
                None
            };
            let predictions = PredictionSet::new(out.logits, boxes, out.division_logits, masks)?;
            let next_reference = Array2::from_shape_fn((q, 4), |(i, j)| predictions.boxes[[i, j]]);

            trace!(layer, queries = q, "decoder layer refined");
            layers.push(LayerOutput {
                embeddings: out.embeddings.clone(),
                predictions,
                reference: std::mem::replace(&mut reference, next_reference),
            });
            embeddings = out.embeddings;
        }

        Ok(DecoderOutput { layers })
    }
}

fn check_rows(what: &'static str, array: &Array2<f32>, rows: usize) -> TractrResult<()> {
    if array.nrows() != rows {
        return Err(TractrError::shape_mismatch(
            what,
            vec![rows, array.ncols()],
            array.shape().to_vec(),
        ));
    }
    Ok(())
}

/// Apply `[Q, 8]` deltas to `[Q, 4]` references: both daughters start
/// from the same incoming reference.
fn apply_deltas(reference: &Array2<f32>, deltas: &Array2<f32>) -> Array2<f32> {
    let mut boxes = Array2::zeros((reference.nrows(), BOX_COLUMNS));
    for (i, (r, d)) in reference.outer_iter().zip(deltas.outer_iter()).enumerate() {
        let base = BBox::new(r[0], r[1], r[2], r[3]);
        let d = d.to_vec();
        let primary = base.refine(&d[..4]).to_cxcywh();
        let secondary = base.refine(&d[4..]).to_cxcywh();
        for j in 0..4 {
            boxes[[i, j]] = primary[j];
            boxes[[i, j + 4]] = secondary[j];
        }
    }
    boxes
}

/// Static split of decoder layers into detection and tracking duties.
///
/// Without CoMOT every layer detects and tracks. With CoMOT only the first
/// `num_OD_layers` layers detect; the rest only track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPartition {
    pub dec_layers: usize,
    pub num_od_layers: usize,
    pub comot: bool,
    pub comot_loss_ce: bool,
}

impl LayerPartition {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            dec_layers: cfg.dec_layers,
            num_od_layers: cfg.num_od_layers,
            comot: cfg.comot,
            comot_loss_ce: cfg.comot_loss_ce,
        }
    }

    /// Whether object queries are supervised for detection at `layer`.
    pub fn detects(&self, layer: usize) -> bool {
        layer < self.dec_layers && (!self.comot || layer < self.num_od_layers)
    }

    /// Whether track queries are supervised at `layer`.
    pub fn tracks(&self, layer: usize) -> bool {
        layer < self.dec_layers
    }

    /// Whether the object classification term is kept at `layer`.
    pub fn keeps_object_class(&self, layer: usize) -> bool {
        self.detects(layer) || (self.comot && self.comot_loss_ce && self.tracks(layer))
    }

    pub fn detection_layers(&self) -> Vec<usize> {
        (0..self.dec_layers).filter(|&l| self.detects(l)).collect()
    }

    pub fn tracking_layers(&self) -> Vec<usize> {
        (0..self.dec_layers).filter(|&l| self.tracks(l)).collect()
    }

    /// Layer whose output is carried to the next frame.
    pub fn final_tracking_layer(&self) -> usize {
        self.dec_layers.saturating_sub(1)
    }
}
