//! Ground truth supplied per frame and the per-query target it resolves to.

use ndarray::Array2;

use crate::tracker::bbox::BBox;

/// One annotated cell in one frame. Read-only to the tracker.
#[derive(Debug, Clone)]
pub struct GroundTruthInstance {
    /// Normalized box.
    pub bbox: BBox,
    /// Binary instance mask, if the dataset carries masks.
    pub mask: Option<Array2<f32>>,
    /// Class index (0 for cells).
    pub class: usize,
    /// Dataset track id, stable across frames.
    pub track_id: u64,
    /// Track id of the parent when this cell was born by a division in this frame.
    pub divided_from: Option<u64>,
}

/// All instances annotated in one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameTargets {
    /// Annotated instances, in dataset order.
    pub instances: Vec<GroundTruthInstance>,
}

impl FrameTargets {
    /// Wrap a list of instances.
    pub fn new(instances: Vec<GroundTruthInstance>) -> Self {
        Self { instances }
    }

    /// Frame without any cells.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Index of the instance following `track_id`.
    pub fn index_of(&self, track_id: u64) -> Option<usize> {
        self.instances.iter().position(|i| i.track_id == track_id)
    }

    /// Indices of the two daughters of `parent`, in dataset order.
    ///
    /// Anything other than exactly two daughters is not a division.
    pub fn division_children(&self, parent: u64) -> Option<[usize; 2]> {
        let mut children = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.divided_from == Some(parent))
            .map(|(idx, _)| idx);
        match (children.next(), children.next(), children.next()) {
            (Some(a), Some(b), None) => Some([a, b]),
            _ => None,
        }
    }

    /// Resolve the target of an identity that follows `track_id`.
    pub fn resolve_identity(&self, track_id: u64) -> QueryTarget {
        if let Some(idx) = self.index_of(track_id) {
            QueryTarget::Single(idx)
        } else if let Some([first, second]) = self.division_children(track_id) {
            QueryTarget::Divided { first, second }
        } else {
            QueryTarget::Background
        }
    }

    pub fn boxes(&self) -> Vec<BBox> {
        self.instances.iter().map(|i| i.bbox).collect()
    }

    /// Union of every instance mask, or `None` when masks are missing.
    pub fn foreground(&self) -> Option<Array2<f32>> {
        let mut masks = self.instances.iter().map(|i| i.mask.as_ref());
        let first = masks.next()??;
        let mut union = first.mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });
        for mask in masks {
            let mask = mask?;
            if mask.dim() != union.dim() {
                return None;
            }
            union.zip_mut_with(mask, |u, &m| {
                if m > 0.5 {
                    *u = 1.0;
                }
            });
        }
        Some(union)
    }
}

/// What a single query is supervised towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTarget {
    /// No object: the query must score as background.
    #[default]
    Background,
    /// One ground-truth instance.
    Single(usize),
    /// A division: the primary box targets `first`, the secondary box `second`.
    Divided { first: usize, second: usize },
}

impl QueryTarget {
    /// Number of boxes this target supervises.
    pub fn num_boxes(&self) -> usize {
        match self {
            QueryTarget::Background => 0,
            QueryTarget::Single(_) => 1,
            QueryTarget::Divided { .. } => 2,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, QueryTarget::Background)
    }

    /// Ground-truth index supervising the primary box.
    pub fn primary(&self) -> Option<usize> {
        match *self {
            QueryTarget::Background => None,
            QueryTarget::Single(idx) => Some(idx),
            QueryTarget::Divided { first, .. } => Some(first),
        }
    }

    /// Ground-truth index supervising the secondary box.
    pub fn secondary(&self) -> Option<usize> {
        match *self {
            QueryTarget::Divided { second, .. } => Some(second),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(track_id: u64, divided_from: Option<u64>) -> GroundTruthInstance {
        GroundTruthInstance {
            bbox: BBox::new(0.5, 0.5, 0.1, 0.1),
            mask: None,
            class: 0,
            track_id,
            divided_from,
        }
    }

    #[test]
    fn resolves_continuing_dividing_and_ended_identities() {
        let targets = FrameTargets::new(vec![
            instance(1, None),
            instance(5, Some(2)),
            instance(6, Some(2)),
        ]);
        assert_eq!(targets.resolve_identity(1), QueryTarget::Single(0));
        assert_eq!(
            targets.resolve_identity(2),
            QueryTarget::Divided {
                first: 1,
                second: 2
            }
        );
        assert_eq!(targets.resolve_identity(3), QueryTarget::Background);
    }

    #[test]
    fn single_orphan_daughter_is_not_a_division() {
        let targets = FrameTargets::new(vec![instance(5, Some(2))]);
        assert!(targets.division_children(2).is_none());
    }

    #[test]
    fn foreground_is_union_of_masks() {
        let mut a = instance(1, None);
        let mut b = instance(2, None);
        let mut ma = Array2::zeros((2, 2));
        ma[[0, 0]] = 1.0;
        let mut mb = Array2::zeros((2, 2));
        mb[[1, 1]] = 1.0;
        a.mask = Some(ma);
        b.mask = Some(mb);
        let fg = FrameTargets::new(vec![a, b]).foreground().unwrap();
        assert_eq!(fg.sum(), 2.0);
        assert_eq!(fg[[0, 1]], 0.0);
    }

    #[test]
    fn target_box_counts() {
        assert_eq!(QueryTarget::Background.num_boxes(), 0);
        assert_eq!(QueryTarget::Single(3).num_boxes(), 1);
        let div = QueryTarget::Divided {
            first: 1,
            second: 2,
        };
        assert_eq!(div.num_boxes(), 2);
        assert_eq!(div.primary(), Some(1));
        assert_eq!(div.secondary(), Some(2));
    }
}
