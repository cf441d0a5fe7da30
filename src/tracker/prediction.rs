//! Per-layer decoder predictions.

use ndarray::{Array1, Array2, Array4, ArrayView2, Axis};

use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::{BBox, sigmoid};

/// Box columns per prediction row: the primary cell, then the second daughter.
pub const BOX_COLUMNS: usize = 8;

/// Mask channels per query, one per possible daughter.
pub const MASK_CHANNELS: usize = 2;

/// Predictions of one decoder layer, one row per query.
///
/// Immutable once a layer has produced it.
#[derive(Debug, Clone)]
pub struct PredictionSet {
    /// Class logits `[Q, C]`.
    pub logits: Array2<f32>,
    /// Boxes `[Q, 8]`: columns `0..4` the primary cell, `4..8` the second
    /// daughter when the query divides.
    pub boxes: Array2<f32>,
    /// Division logits `[Q]`.
    pub division_logits: Option<Array1<f32>>,
    /// Mask logits `[Q, 2, H, W]`.
    pub masks: Option<Array4<f32>>,
}

impl PredictionSet {
    /// Create a prediction set after checking that every head agrees on `Q`.
    pub fn new(
        logits: Array2<f32>,
        boxes: Array2<f32>,
        division_logits: Option<Array1<f32>>,
        masks: Option<Array4<f32>>,
    ) -> TractrResult<Self> {
        let rows = logits.nrows();
        if boxes.dim() != (rows, BOX_COLUMNS) {
            return Err(TractrError::shape_mismatch(
                "prediction boxes",
                vec![rows, BOX_COLUMNS],
                boxes.shape().to_vec(),
            ));
        }
        if let Some(div) = &division_logits {
            if div.len() != rows {
                return Err(TractrError::shape_mismatch(
                    "division logits",
                    vec![rows],
                    div.shape().to_vec(),
                ));
            }
        }
        if let Some(masks) = &masks {
            let (q, c, _, _) = masks.dim();
            if q != rows || c != MASK_CHANNELS {
                return Err(TractrError::shape_mismatch(
                    "mask logits",
                    vec![rows, MASK_CHANNELS],
                    masks.shape()[..2].to_vec(),
                ));
            }
        }
        Ok(Self {
            logits,
            boxes,
            division_logits,
            masks,
        })
    }

    /// Pad 4-column boxes with an empty second daughter.
    pub fn pad_boxes(boxes4: &Array2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((boxes4.nrows(), BOX_COLUMNS));
        for (i, row) in boxes4.outer_iter().enumerate() {
            for (j, v) in row.iter().take(4).enumerate() {
                out[[i, j]] = *v;
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.logits.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.logits.ncols()
    }

    pub fn primary_box(&self, row: usize) -> BBox {
        let r = self.boxes.row(row);
        BBox::new(r[0], r[1], r[2], r[3])
    }

    pub fn secondary_box(&self, row: usize) -> BBox {
        let r = self.boxes.row(row);
        BBox::new(r[4], r[5], r[6], r[7])
    }

    /// Box predicted for daughter `channel` (0 primary, 1 secondary).
    pub fn box_for(&self, row: usize, channel: usize) -> BBox {
        if channel == 0 {
            self.primary_box(row)
        } else {
            self.secondary_box(row)
        }
    }

    /// Mask logits of one query and channel.
    pub fn mask(&self, row: usize, channel: usize) -> Option<ArrayView2<'_, f32>> {
        self.masks
            .as_ref()
            .map(|m| m.index_axis(Axis(0), row).index_axis_move(Axis(0), channel))
    }

    /// Highest class probability of a row.
    pub fn score(&self, row: usize) -> f32 {
        self.logits
            .row(row)
            .iter()
            .fold(0.0f32, |best, &l| best.max(sigmoid(l)))
    }

    pub fn division_probability(&self, row: usize) -> Option<f32> {
        self.division_logits.as_ref().map(|d| sigmoid(d[row]))
    }

    /// Copy of this set without masks.
    pub fn without_masks(&self) -> Self {
        Self {
            logits: self.logits.clone(),
            boxes: self.boxes.clone(),
            division_logits: self.division_logits.clone(),
            masks: None,
        }
    }
}
