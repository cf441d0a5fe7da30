//! Loss assembly over decoder layers and query partitions.

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::config::TractrConfig;
use crate::criterion::matcher::{Assignment, bce_with_logits, check_classes};
use crate::criterion::sampling::PointSampler;
use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::sigmoid;
use crate::tracker::decoder::{DecoderOutput, LayerPartition};
use crate::tracker::prediction::PredictionSet;
use crate::tracker::{QueryPartition, QuerySet};
use crate::tracker::target::{FrameTargets, QueryTarget};

/// Coefficients of every loss term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub cls: f32,
    pub bbox: f32,
    pub giou: f32,
    pub mask: f32,
    pub dice: f32,
    pub div: f32,
    pub track_div: f32,
    pub dn_object: f32,
    pub dn_track: f32,
    pub mask_target_cell: f32,
    pub mask_all_cells: f32,
}

impl LossWeights {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            cls: cfg.cls_loss_coef,
            bbox: cfg.bbox_loss_coef,
            giou: cfg.giou_loss_coef,
            mask: cfg.mask_loss_coef,
            dice: cfg.dice_loss_coef,
            div: cfg.div_loss_coef,
            track_div: cfg.track_div_loss_coef,
            dn_object: cfg.dn_object_coef,
            dn_track: cfg.dn_track_coef,
            mask_target_cell: cfg.mask_weight_target_cell_coef,
            mask_all_cells: cfg.mask_weight_all_cells_coef,
        }
    }

    /// Scale applied to every term of `partition`.
    pub fn partition_scale(&self, partition: QueryPartition) -> f32 {
        match partition {
            QueryPartition::Track | QueryPartition::Object => 1.0,
            QueryPartition::DenoisingTrack => self.dn_track,
            QueryPartition::DenoisingObject | QueryPartition::DenoisingEnc => self.dn_object,
        }
    }
}

/// Weighted loss terms and their sum.
///
/// Keys read `layer{l}/{partition}/{term}` for decoder terms and
/// `enc/{term}` for the two-stage encoder terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossReport {
    pub total: f32,
    pub terms: BTreeMap<String, f32>,
}

impl LossReport {
    fn add(&mut self, key: String, value: f32) {
        self.total += value;
        *self.terms.entry(key).or_insert(0.0) += value;
    }

    pub fn get(&self, key: &str) -> Option<f32> {
        self.terms.get(key).copied()
    }

    pub fn is_finite(&self) -> bool {
        self.total.is_finite()
    }

    /// Add every term of `other` under `prefix`.
    pub fn merge(&mut self, prefix: &str, other: &LossReport) {
        for (key, value) in &other.terms {
            self.add(format!("{prefix}/{key}"), *value);
        }
    }

    /// Keys ending in `/{term}` that mention `partition`.
    pub fn layers_with(&self, partition: QueryPartition, term: &str) -> Vec<usize> {
        let suffix = format!("/{}/{}", partition.name(), term);
        self.terms
            .keys()
            .filter_map(|k| {
                k.strip_suffix(&suffix)
                    .and_then(|head| head.strip_prefix("layer"))
                    .and_then(|l| l.parse().ok())
            })
            .collect()
    }
}

/// Unweighted, normalized terms of one partition at one layer.
#[derive(Debug, Clone, Copy, Default)]
struct PartitionTerms {
    ce: f32,
    bbox: f32,
    giou: f32,
    mask: Option<f32>,
    dice: Option<f32>,
    div: Option<f32>,
}

/// Sums the configured loss terms over layers and query partitions.
#[derive(Debug, Clone)]
pub struct LossAssembler {
    pub weights: LossWeights,
    pub focal_alpha: f32,
    pub focal_gamma: f32,
    pub aux_loss: bool,
    pub masks: bool,
    pub partition: LayerPartition,
    pub sampler: PointSampler,
}

impl LossAssembler {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            weights: LossWeights::from_config(cfg),
            focal_alpha: cfg.focal_alpha,
            focal_gamma: cfg.focal_gamma,
            aux_loss: cfg.aux_loss,
            masks: cfg.masks,
            partition: LayerPartition::from_config(cfg),
            sampler: PointSampler::from_config(cfg),
        }
    }

    /// Assemble the loss of one frame.
    ///
    /// `assignments` holds one assignment per decoder layer. `two_stage`
    /// carries the encoder predictions and their assignment when the
    /// proposal stage produced them.
    pub fn compute(
        &self,
        queries: &QuerySet,
        decoder: &DecoderOutput,
        assignments: &[Assignment],
        targets: &FrameTargets,
        two_stage: Option<(&PredictionSet, &Assignment)>,
    ) -> TractrResult<LossReport> {
        if assignments.len() != decoder.num_layers() {
            return Err(TractrError::shape_mismatch(
                "per-layer assignments",
                vec![decoder.num_layers()],
                vec![assignments.len()],
            ));
        }
        let foreground = targets.foreground();
        let mut report = LossReport::default();

        let num_layers = decoder.num_layers();
        let first = if self.aux_loss { 0 } else { num_layers.saturating_sub(1) };
        for layer in first..num_layers {
            let predictions = &decoder.layers[layer].predictions;
            let assignment = &assignments[layer];
            if predictions.len() != queries.len() || assignment.len() != queries.len() {
                return Err(TractrError::shape_mismatch(
                    "layer predictions and assignment",
                    vec![queries.len(), queries.len()],
                    vec![predictions.len(), assignment.len()],
                ));
            }
            check_classes(predictions, targets)?;

            for partition in queries.active_partitions() {
                let is_object = partition == QueryPartition::Object;
                let keep_class = !is_object || self.partition.keeps_object_class(layer);
                let keep_rest = !is_object || self.partition.detects(layer);
                if !keep_class {
                    continue;
                }
                let terms = self.partition_terms(
                    queries.span(partition),
                    predictions,
                    assignment,
                    targets,
                    foreground.as_ref(),
                );
                let scale = self.weights.partition_scale(partition);
                let key = |term: &str| format!("layer{layer}/{}/{term}", partition.name());

                report.add(key("loss_ce"), scale * self.weights.cls * terms.ce);
                if !keep_rest {
                    continue;
                }
                report.add(key("loss_bbox"), scale * self.weights.bbox * terms.bbox);
                report.add(key("loss_giou"), scale * self.weights.giou * terms.giou);
                if let (Some(mask), Some(dice)) = (terms.mask, terms.dice) {
                    report.add(key("loss_mask"), scale * self.weights.mask * mask);
                    report.add(key("loss_dice"), scale * self.weights.dice * dice);
                }
                if let Some(div) = terms.div {
                    let coef = if partition.is_track_stage() {
                        self.weights.track_div
                    } else {
                        self.weights.div
                    };
                    report.add(key("loss_div"), scale * coef * div);
                }
            }
        }

        if let Some((predictions, assignment)) = two_stage {
            if predictions.len() != assignment.len() {
                return Err(TractrError::shape_mismatch(
                    "encoder predictions and assignment",
                    vec![predictions.len()],
                    vec![assignment.len()],
                ));
            }
            let terms =
                self.partition_terms(0..predictions.len(), predictions, assignment, targets, None);
            report.add("enc/loss_ce".to_string(), self.weights.cls * terms.ce);
            report.add("enc/loss_bbox".to_string(), self.weights.bbox * terms.bbox);
            report.add("enc/loss_giou".to_string(), self.weights.giou * terms.giou);
        }

        debug!(total = report.total, terms = report.terms.len(), "assembled loss");
        Ok(report)
    }

    fn partition_terms(
        &self,
        rows: Range<usize>,
        predictions: &PredictionSet,
        assignment: &Assignment,
        targets: &FrameTargets,
        foreground: Option<&Array2<f32>>,
    ) -> PartitionTerms {
        let num_boxes = assignment.num_boxes(rows.clone()).max(1) as f32;
        let num_classes = predictions.num_classes().max(1) as f32;
        let mut terms = PartitionTerms::default();

        for row in rows.clone() {
            let target = assignment.target(row);
            let class = target
                .primary()
                .and_then(|g| targets.instances.get(g))
                .map(|gt| gt.class);
            let ce: f32 = predictions
                .logits
                .row(row)
                .iter()
                .enumerate()
                .map(|(c, &x)| {
                    let t = if Some(c) == class { 1.0 } else { 0.0 };
                    sigmoid_focal_loss(x, t, self.focal_alpha, self.focal_gamma)
                })
                .sum();
            terms.ce += ce / num_classes;
        }
        terms.ce /= num_boxes;

        let mut mask_sum = 0.0;
        let mut dice_sum = 0.0;
        let with_masks = self.masks && predictions.masks.is_some();
        for row in rows.clone() {
            let target = assignment.target(row);
            let boxes = [(0, target.primary()), (1, target.secondary())];
            for (channel, gt) in boxes {
                let Some(gt) = gt.and_then(|g| targets.instances.get(g)) else {
                    continue;
                };
                let pred = predictions.box_for(row, channel);
                terms.bbox += pred.l1(&gt.bbox);
                terms.giou += 1.0 - pred.giou(&gt.bbox);

                if !with_masks {
                    continue;
                }
                if let (Some(logits), Some(mask)) = (predictions.mask(row, channel), gt.mask.as_ref()) {
                    let stream = (row * 2 + channel) as u64;
                    let (m, d) =
                        self.mask_terms(logits, mask.view(), foreground.map(|f| f.view()), stream);
                    mask_sum += m;
                    dice_sum += d;
                }
            }
        }
        terms.bbox /= num_boxes;
        terms.giou /= num_boxes;
        if with_masks {
            terms.mask = Some(mask_sum / num_boxes);
            terms.dice = Some(dice_sum / num_boxes);
        }

        if let Some(division) = &predictions.division_logits {
            let mut div = 0.0;
            for row in rows {
                let target = assignment.target(row);
                if target.is_background() {
                    continue;
                }
                let t = if matches!(target, QueryTarget::Divided { .. }) { 1.0 } else { 0.0 };
                div += sigmoid_focal_loss(division[row], t, self.focal_alpha, self.focal_gamma);
            }
            terms.div = Some(div / num_boxes);
        }

        terms
    }

    /// Weighted point BCE and Dice of one predicted mask.
    fn mask_terms(
        &self,
        logits: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        foreground: Option<ArrayView2<'_, f32>>,
        stream: u64,
    ) -> (f32, f32) {
        let points = self.sampler.importance(logits, stream);
        let pred = points.sample(logits);
        let tgt = points.sample(target);
        let fg = match foreground {
            Some(f) => points.sample(f),
            None => tgt.clone(),
        };
        if pred.is_empty() {
            return (0.0, 0.0);
        }

        let mut bce = 0.0;
        let (mut inter, mut p_sum, mut t_sum) = (0.0, 0.0, 0.0);
        for ((&x, &t), &f) in pred.iter().zip(&tgt).zip(&fg) {
            let weight = 1.0 + self.weights.mask_target_cell * t + self.weights.mask_all_cells * f;
            bce += weight * bce_with_logits(x, t);
            let p = sigmoid(x);
            inter += p * t;
            p_sum += p;
            t_sum += t;
        }
        let dice = 1.0 - (2.0 * inter + 1.0) / (p_sum + t_sum + 1.0);
        (bce / pred.len() as f32, dice)
    }
}

/// Sigmoid focal loss of one logit against a binary target.
pub fn sigmoid_focal_loss(x: f32, t: f32, alpha: f32, gamma: f32) -> f32 {
    let p = sigmoid(x);
    let ce = bce_with_logits(x, t);
    let p_t = p * t + (1.0 - p) * (1.0 - t);
    let loss = ce * (1.0 - p_t).powf(gamma);
    if alpha >= 0.0 {
        loss * (alpha * t + (1.0 - alpha) * (1.0 - t))
    } else {
        loss
    }
}
