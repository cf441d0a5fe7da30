//! Accuracy bookkeeping of matched predictions.
//!
//! Counts come from final-layer predictions and the assignment the
//! carry-over used. A confident prediction (`score > cls_threshold`) that
//! was matched is correct when its box, or its mask, overlaps the ground
//! truth with an IoU above `iou_threshold`. Missed cells and confident
//! unmatched queries count against every accuracy. Denoising queries are
//! not counted.

use std::ops::AddAssign;

use ndarray::ArrayView2;

use crate::config::TractrConfig;
use crate::criterion::matcher::Assignment;
use crate::criterion::sampling::SamplePoints;
use crate::error::{TractrError, TractrResult};
use crate::tracker::prediction::PredictionSet;
use crate::tracker::target::{FrameTargets, GroundTruthInstance, QueryTarget};
use crate::tracker::{QueryPartition, QuerySet};

/// Correct out of total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    pub correct: u64,
    pub total: u64,
}

impl Accuracy {
    pub fn new(correct: u64, total: u64) -> Self {
        Self { correct, total }
    }

    /// `correct / total`, `None` when nothing was counted.
    pub fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }

    fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    fn miss(&mut self) {
        self.total += 1;
    }
}

impl AddAssign for Accuracy {
    fn add_assign(&mut self, other: Self) {
        self.correct += other.correct;
        self.total += other.total;
    }
}

/// Accuracies of one frame, or the sum over several frames.
///
/// Mask accuracies are `None` when the predictions carry no masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameAccuracy {
    /// Every cell, tracked or newly detected, judged by its box.
    pub bbox: Accuracy,
    pub mask: Option<Accuracy>,
    /// Divisions of tracked cells.
    pub divisions_bbox: Accuracy,
    pub divisions_mask: Option<Accuracy>,
    /// Cells picked up by object queries.
    pub new_cells_bbox: Accuracy,
    pub new_cells_mask: Option<Accuracy>,
}

impl FrameAccuracy {
    /// Named accuracies for logs.
    pub fn entries(&self) -> Vec<(&'static str, Accuracy)> {
        let mut entries = vec![
            ("bbox_acc", self.bbox),
            ("divisions_bbox_acc", self.divisions_bbox),
            ("new_cells_bbox_acc", self.new_cells_bbox),
        ];
        for (name, acc) in [
            ("mask_acc", self.mask),
            ("divisions_mask_acc", self.divisions_mask),
            ("new_cells_mask_acc", self.new_cells_mask),
        ] {
            if let Some(acc) = acc {
                entries.push((name, acc));
            }
        }
        entries
    }
}

impl AddAssign<&FrameAccuracy> for FrameAccuracy {
    fn add_assign(&mut self, other: &FrameAccuracy) {
        self.bbox += other.bbox;
        self.divisions_bbox += other.divisions_bbox;
        self.new_cells_bbox += other.new_cells_bbox;
        add_optional(&mut self.mask, other.mask);
        add_optional(&mut self.divisions_mask, other.divisions_mask);
        add_optional(&mut self.new_cells_mask, other.new_cells_mask);
    }
}

fn add_optional(total: &mut Option<Accuracy>, other: Option<Accuracy>) {
    if let Some(other) = other {
        *total.get_or_insert_with(Accuracy::default) += other;
    }
}

/// Raw counts before they are folded into accuracies.
#[derive(Debug, Default)]
struct Counts {
    tp_bbox: u64,
    fp_bbox: u64,
    tp_mask: u64,
    fp_mask: u64,
    /// Confident queries without a cell, and divisions predicted wrongly.
    fp: u64,
    /// Matched cells scored below the threshold, and missed divisions.
    fn_: u64,
    divisions: Accuracy,
    divisions_bbox: Accuracy,
    divisions_mask: Accuracy,
    new_cells: Accuracy,
    new_cells_bbox: Accuracy,
    new_cells_mask: Accuracy,
}

impl Counts {
    fn bbox(&mut self, hit: bool) {
        if hit {
            self.tp_bbox += 1;
        } else {
            self.fp_bbox += 1;
        }
    }

    fn mask(&mut self, hit: bool) {
        if hit {
            self.tp_mask += 1;
        } else {
            self.fp_mask += 1;
        }
    }

    fn finish(self, with_masks: bool) -> FrameAccuracy {
        let missed = self.fn_ + self.fp;
        let mut divisions_bbox = self.divisions;
        divisions_bbox += self.divisions_bbox;
        let mut new_cells_bbox = self.new_cells;
        new_cells_bbox += self.new_cells_bbox;

        let masks = with_masks.then(|| {
            let mut divisions = self.divisions;
            divisions += self.divisions_mask;
            let mut new_cells = self.new_cells;
            new_cells += self.new_cells_mask;
            let overall = Accuracy::new(self.tp_mask, self.tp_mask + missed + self.fp_mask);
            (overall, divisions, new_cells)
        });

        FrameAccuracy {
            bbox: Accuracy::new(self.tp_bbox, self.tp_bbox + missed + self.fp_bbox),
            mask: masks.map(|m| m.0),
            divisions_bbox,
            divisions_mask: masks.map(|m| m.1),
            new_cells_bbox,
            new_cells_mask: masks.map(|m| m.2),
        }
    }
}

/// Detection, tracking, division and new-cell accuracy of a frame.
#[derive(Debug, Clone, Copy)]
pub struct AccuracyCounter {
    pub cls_threshold: f32,
    pub iou_threshold: f32,
}

impl AccuracyCounter {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            cls_threshold: cfg.cls_threshold,
            iou_threshold: cfg.iou_threshold,
        }
    }

    /// Count one frame.
    ///
    /// Object queries are judged as new cells. Track queries are judged on
    /// their primary box, and on their secondary box when they divide.
    pub fn frame(
        &self,
        queries: &QuerySet,
        predictions: &PredictionSet,
        assignment: &Assignment,
        targets: &FrameTargets,
    ) -> TractrResult<FrameAccuracy> {
        if predictions.len() != queries.len() || assignment.len() != queries.len() {
            return Err(TractrError::shape_mismatch(
                "predictions and assignment",
                vec![queries.len(), queries.len()],
                vec![predictions.len(), assignment.len()],
            ));
        }
        let instance = |g: usize| {
            targets.instances.get(g).ok_or_else(|| {
                TractrError::malformed(format!(
                    "assignment points at ground truth {g} of {}",
                    targets.len()
                ))
            })
        };
        let with_masks = predictions.masks.is_some();
        let mut counts = Counts::default();

        for (row, query) in queries.queries().iter().enumerate() {
            let partition = query.partition();
            if partition.is_denoising() {
                continue;
            }
            let confident = predictions.score(row) > self.cls_threshold;
            let target = assignment.target(row);
            let Some(primary) = target.primary() else {
                if confident {
                    counts.fp += 1;
                }
                continue;
            };
            let gt = instance(primary)?;

            if partition == QueryPartition::Object {
                if !confident {
                    counts.fn_ += 1;
                    counts.new_cells.miss();
                    continue;
                }
                let hit = self.box_hit(predictions, row, 0, gt);
                counts.bbox(hit);
                counts.new_cells_bbox.record(hit);
                if with_masks {
                    let hit = self.mask_hit(predictions, row, 0, gt);
                    counts.mask(hit);
                    counts.new_cells_mask.record(hit);
                }
                continue;
            }

            if confident {
                counts.bbox(self.box_hit(predictions, row, 0, gt));
                if with_masks {
                    counts.mask(self.mask_hit(predictions, row, 0, gt));
                }
            } else {
                counts.fn_ += 1;
            }

            let divides = predictions
                .division_probability(row)
                .is_some_and(|p| p > self.cls_threshold);
            match (divides, target) {
                (true, QueryTarget::Divided { second, .. }) => {
                    let gt = instance(second)?;
                    let hit = self.box_hit(predictions, row, 1, gt);
                    counts.bbox(hit);
                    counts.divisions_bbox.record(hit);
                    if with_masks {
                        let hit = self.mask_hit(predictions, row, 1, gt);
                        counts.mask(hit);
                        counts.divisions_mask.record(hit);
                    }
                }
                (true, _) => {
                    counts.fp += 1;
                    counts.divisions.miss();
                }
                (false, QueryTarget::Divided { .. }) => {
                    counts.fn_ += 1;
                    counts.divisions.miss();
                }
                (false, _) => {}
            }
        }

        Ok(counts.finish(with_masks))
    }

    fn box_hit(&self, predictions: &PredictionSet, row: usize, channel: usize, gt: &GroundTruthInstance) -> bool {
        predictions.box_for(row, channel).iou(&gt.bbox) > self.iou_threshold
    }

    /// Ground truth without a mask never counts as a mask hit.
    fn mask_hit(&self, predictions: &PredictionSet, row: usize, channel: usize, gt: &GroundTruthInstance) -> bool {
        match (predictions.mask(row, channel), gt.mask.as_ref()) {
            (Some(logits), Some(target)) => mask_iou(logits, target.view()) > self.iou_threshold,
            _ => false,
        }
    }
}

/// IoU of a predicted mask, resampled onto the target grid and cut at
/// probability 0.5, against a binary target.
pub fn mask_iou(logits: ArrayView2<'_, f32>, target: ArrayView2<'_, f32>) -> f32 {
    let (height, width) = target.dim();
    let predicted = SamplePoints::Grid { height, width }.sample(logits);
    let (mut inter, mut union) = (0u64, 0u64);
    for (&p, &t) in predicted.iter().zip(target.iter()) {
        let (p, t) = (p > 0.0, t > 0.5);
        inter += u64::from(p && t);
        union += u64::from(p || t);
    }
    if union == 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}
