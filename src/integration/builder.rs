//! Builder for ground-truth instances from dataset annotations.

use ndarray::Array2;

use crate::tracker::{BBox, GroundTruthInstance, mask_to_box};

/// Builder for `GroundTruthInstance` values.
///
/// The box may be given directly or derived from the mask; an explicit
/// box always wins.
#[derive(Debug, Clone, Default)]
pub struct InstanceBuilder {
    track_id: u64,
    bbox: Option<BBox>,
    mask: Option<Array2<f32>>,
    class: usize,
    divided_from: Option<u64>,
}

impl InstanceBuilder {
    /// Start an instance following dataset track `track_id`.
    pub fn new(track_id: u64) -> Self {
        Self {
            track_id,
            ..Self::default()
        }
    }

    /// Set the box in CXCYWH format.
    pub fn cxcywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.bbox = Some(BBox::new(cx, cy, w, h));
        self
    }

    /// Set the box in XYXY format.
    pub fn xyxy(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Some(BBox::from_xyxy(x1, y1, x2, y2));
        self
    }

    /// Attach a binary mask.
    pub fn mask(mut self, mask: Array2<f32>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn class(mut self, class: usize) -> Self {
        self.class = class;
        self
    }

    /// Mark the instance as a daughter of `parent`.
    pub fn divided_from(mut self, parent: u64) -> Self {
        self.divided_from = Some(parent);
        self
    }

    /// Build the instance. Without an explicit box the tight box of the
    /// mask is used, and an empty or missing mask yields an empty box.
    pub fn build(self) -> GroundTruthInstance {
        let bbox = self
            .bbox
            .or_else(|| self.mask.as_ref().and_then(|m| mask_to_box(m.view(), 0.5)))
            .unwrap_or_default();
        GroundTruthInstance {
            bbox,
            mask: self.mask,
            class: self.class,
            track_id: self.track_id,
            divided_from: self.divided_from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn explicit_box() {
        let gt = InstanceBuilder::new(7)
            .xyxy(0.1, 0.2, 0.5, 0.8)
            .divided_from(3)
            .build();

        assert_eq!(gt.track_id, 7);
        assert_eq!(gt.divided_from, Some(3));
        assert_abs_diff_eq!(gt.bbox.cx, 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(gt.bbox.h, 0.6, epsilon = 1e-6);
    }

    #[test]
    fn box_from_mask() {
        let mut mask = Array2::zeros((4, 4));
        mask[[1, 1]] = 1.0;
        mask[[2, 2]] = 1.0;
        let gt = InstanceBuilder::new(1).mask(mask).build();

        assert_eq!(gt.bbox.to_xyxy(), [0.25, 0.25, 0.75, 0.75]);
        assert!(gt.mask.is_some());
    }

    #[test]
    fn empty_mask_gives_empty_box() {
        let gt = InstanceBuilder::new(1).mask(Array2::zeros((3, 3))).build();
        assert!(gt.bbox.is_empty());
    }
}
