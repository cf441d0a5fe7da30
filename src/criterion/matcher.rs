//! Hungarian matching of predictions to ground truth.
//!
//! Track queries keep the ground truth of the identity they follow, or its
//! two daughters after a division. Object queries are matched with an
//! optimal bipartite assignment over the ground truth the tracks left
//! unclaimed. Denoising queries are assigned the target they were built
//! from.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use tracing::debug;

use crate::config::TractrConfig;
use crate::criterion::sampling::{PointSampler, SamplePoints};
use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::{BBox, giou_batch, l1_batch, sigmoid};
use crate::tracker::prediction::PredictionSet;
use crate::tracker::target::{FrameTargets, GroundTruthInstance, QueryTarget};
use crate::tracker::{QueryKind, QueryPartition, QuerySet};

/// Cost assigned to padded rows and columns of the square matrix.
const PADDING_COST: f64 = 1e6;

/// Weights of the matching cost terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherCosts {
    pub class: f32,
    pub bbox: f32,
    pub giou: f32,
    pub mask: f32,
    pub dice: f32,
}

impl MatcherCosts {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            class: cfg.set_cost_class,
            bbox: cfg.set_cost_bbox,
            giou: cfg.set_cost_giou,
            mask: cfg.set_cost_mask,
            dice: cfg.set_cost_dice,
        }
    }
}

/// One target per query of a query set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    targets: Vec<QueryTarget>,
}

impl Assignment {
    pub fn new(targets: Vec<QueryTarget>) -> Self {
        Self { targets }
    }

    /// Every query unmatched.
    pub fn background(len: usize) -> Self {
        Self::new(vec![QueryTarget::Background; len])
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, row: usize) -> QueryTarget {
        self.targets.get(row).copied().unwrap_or_default()
    }

    pub fn targets(&self) -> &[QueryTarget] {
        &self.targets
    }

    /// Matched rows with their targets.
    pub fn matched(&self) -> impl Iterator<Item = (usize, QueryTarget)> + '_ {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_background())
            .map(|(i, t)| (i, *t))
    }

    /// Boxes supervised by `rows`; a division counts two.
    pub fn num_boxes(&self, rows: std::ops::Range<usize>) -> usize {
        self.targets[rows].iter().map(QueryTarget::num_boxes).sum()
    }
}

/// Focal-cost Hungarian matcher.
#[derive(Debug, Clone)]
pub struct HungarianMatcher {
    pub costs: MatcherCosts,
    pub focal_alpha: f32,
    pub focal_gamma: f32,
    pub match_masks: bool,
    pub sampler: PointSampler,
}

impl HungarianMatcher {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            costs: MatcherCosts::from_config(cfg),
            focal_alpha: cfg.focal_alpha,
            focal_gamma: cfg.focal_gamma,
            match_masks: cfg.masks && cfg.match_masks,
            sampler: PointSampler::from_config(cfg),
        }
    }

    /// Assign every query of `queries` to a target of this frame.
    pub fn match_frame(
        &self,
        queries: &QuerySet,
        predictions: &PredictionSet,
        targets: &FrameTargets,
    ) -> TractrResult<Assignment> {
        if predictions.len() != queries.len() {
            return Err(TractrError::shape_mismatch(
                "predictions",
                vec![queries.len()],
                vec![predictions.len()],
            ));
        }
        check_classes(predictions, targets)?;
        let points = self.points(predictions);
        let mut assigned = vec![QueryTarget::Background; queries.len()];
        let mut claimed = vec![false; targets.len()];

        for (row, query) in queries.iter_partition(QueryPartition::Track) {
            let QueryKind::Track {
                label: Some(label), ..
            } = query.kind
            else {
                continue;
            };
            let target = match targets.resolve_identity(label) {
                QueryTarget::Divided { first, second } => {
                    self.order_daughters(predictions, row, targets, first, second, points.as_ref())
                }
                other => other,
            };
            let gts: Vec<usize> = target.primary().into_iter().chain(target.secondary()).collect();
            if gts.iter().any(|&g| claimed[g]) {
                continue;
            }
            for g in gts {
                claimed[g] = true;
            }
            assigned[row] = target;
        }

        let object_rows: Vec<usize> = queries.span(QueryPartition::Object).collect();
        let free: Vec<usize> = (0..targets.len()).filter(|&g| !claimed[g]).collect();
        let cost = self.cost_matrix(predictions, &object_rows, targets, &free, points.as_ref())?;
        for (r, c) in linear_assignment(&cost) {
            assigned[object_rows[r]] = QueryTarget::Single(free[c]);
        }

        for partition in [
            QueryPartition::DenoisingTrack,
            QueryPartition::DenoisingObject,
            QueryPartition::DenoisingEnc,
        ] {
            for (row, query) in queries.iter_partition(partition) {
                assigned[row] = query.kind.denoising_target().unwrap_or_default();
            }
        }

        let assignment = Assignment::new(assigned);
        debug!(
            queries = queries.len(),
            targets = targets.len(),
            matched = assignment.matched().count(),
            "matched frame"
        );
        Ok(assignment)
    }

    /// Match every row of `predictions` as an object query.
    pub fn match_all(
        &self,
        predictions: &PredictionSet,
        targets: &FrameTargets,
    ) -> TractrResult<Assignment> {
        let rows: Vec<usize> = (0..predictions.len()).collect();
        let cols: Vec<usize> = (0..targets.len()).collect();
        let points = self.points(predictions);
        let cost = self.cost_matrix(predictions, &rows, targets, &cols, points.as_ref())?;
        let mut assigned = vec![QueryTarget::Background; predictions.len()];
        for (r, c) in linear_assignment(&cost) {
            assigned[rows[r]] = QueryTarget::Single(cols[c]);
        }
        Ok(Assignment::new(assigned))
    }

    /// Cost of `rows` x `cols`, lower is better.
    ///
    /// Every term is computed as a whole `[rows, cols]` block.
    ///
    /// # Errors
    ///
    /// [`TractrError::MalformedBatch`] when a ground-truth class has no
    /// column in the class logits.
    pub fn cost_matrix(
        &self,
        predictions: &PredictionSet,
        rows: &[usize],
        targets: &FrameTargets,
        cols: &[usize],
        points: Option<&SamplePoints>,
    ) -> TractrResult<Array2<f32>> {
        check_classes(predictions, targets)?;
        let classes: Vec<usize> = cols.iter().map(|&c| targets.instances[c].class).collect();
        let pred_boxes: Vec<BBox> = rows.iter().map(|&r| predictions.primary_box(r)).collect();
        let gt_boxes: Vec<BBox> = cols.iter().map(|&c| targets.instances[c].bbox).collect();

        let class_cost = predictions
            .logits
            .select(Axis(0), rows)
            .mapv(|x| self.focal_cost(x))
            .select(Axis(1), &classes);
        let mut cost = class_cost * self.costs.class
            + l1_batch(&pred_boxes, &gt_boxes) * self.costs.bbox
            - giou_batch(&pred_boxes, &gt_boxes) * self.costs.giou;

        if let Some((bce, dice)) =
            points.and_then(|p| mask_cost_blocks(predictions, rows, targets, cols, p))
        {
            cost = cost + bce * self.costs.mask + dice * self.costs.dice;
        }
        Ok(cost)
    }

    /// Focal classification cost of one logit: positive minus negative
    /// focal terms.
    fn focal_cost(&self, logit: f32) -> f32 {
        let p = sigmoid(logit);
        let (a, g) = (self.focal_alpha, self.focal_gamma);
        let neg = (1.0 - a) * p.powf(g) * -(1.0 - p + 1e-8).ln();
        let pos = a * (1.0 - p).powf(g) * -(p + 1e-8).ln();
        pos - neg
    }

    /// Box and mask cost of daughter `channel` of `row` against `gt`.
    fn geometry_cost(
        &self,
        predictions: &PredictionSet,
        row: usize,
        channel: usize,
        gt: &GroundTruthInstance,
        points: Option<&SamplePoints>,
    ) -> f32 {
        let pred = predictions.box_for(row, channel);
        let mut cost = self.costs.bbox * pred.l1(&gt.bbox) - self.costs.giou * pred.giou(&gt.bbox);
        if let (Some(points), Some(logits), Some(target)) =
            (points, predictions.mask(row, channel), gt.mask.as_ref())
        {
            let (bce, dice) = mask_costs(points, logits, target.view());
            cost += self.costs.mask * bce + self.costs.dice * dice;
        }
        cost
    }

    /// Order a division's daughters so the primary and secondary boxes
    /// take the cheaper pairing. Ties keep dataset order.
    fn order_daughters(
        &self,
        predictions: &PredictionSet,
        row: usize,
        targets: &FrameTargets,
        first: usize,
        second: usize,
        points: Option<&SamplePoints>,
    ) -> QueryTarget {
        let cost = |c0: usize, c1: usize| {
            self.geometry_cost(predictions, row, 0, &targets.instances[c0], points)
                + self.geometry_cost(predictions, row, 1, &targets.instances[c1], points)
        };
        if cost(second, first) < cost(first, second) {
            QueryTarget::Divided {
                first: second,
                second: first,
            }
        } else {
            QueryTarget::Divided { first, second }
        }
    }

    fn points(&self, predictions: &PredictionSet) -> Option<SamplePoints> {
        if !self.match_masks {
            return None;
        }
        let (_, _, h, w) = predictions.masks.as_ref()?.dim();
        Some(self.sampler.uniform(h, w))
    }
}

/// Reject ground truth whose class the class head does not score.
pub(crate) fn check_classes(predictions: &PredictionSet, targets: &FrameTargets) -> TractrResult<()> {
    let num_classes = predictions.num_classes();
    match targets.instances.iter().find(|gt| gt.class >= num_classes) {
        Some(gt) => Err(TractrError::malformed(format!(
            "ground truth {} has class {} but the class head scores {num_classes} classes",
            gt.track_id, gt.class
        ))),
        None => Ok(()),
    }
}

/// Point BCE and Dice cost blocks `[rows, cols]` of the primary masks.
///
/// Ground truth without a mask costs nothing. `None` when the predictions
/// carry no masks.
fn mask_cost_blocks(
    predictions: &PredictionSet,
    rows: &[usize],
    targets: &FrameTargets,
    cols: &[usize],
    points: &SamplePoints,
) -> Option<(Array2<f32>, Array2<f32>)> {
    let n = points.len();
    if n == 0 {
        return None;
    }
    let mut logits = Array2::zeros((rows.len(), n));
    for (i, &row) in rows.iter().enumerate() {
        let mask = predictions.mask(row, 0)?;
        logits.row_mut(i).assign(&Array1::from(points.sample(mask)));
    }
    let mut target = Array2::zeros((cols.len(), n));
    let mut has_mask = Array1::<f32>::zeros(cols.len());
    for (j, &col) in cols.iter().enumerate() {
        if let Some(mask) = targets.instances[col].mask.as_ref() {
            target.row_mut(j).assign(&Array1::from(points.sample(mask.view())));
            has_mask[j] = 1.0;
        }
    }

    // bce(x, t) = softplus(x) - x * t, summed over points.
    let softplus = logits
        .mapv(|x| x.max(0.0) + (-x.abs()).exp().ln_1p())
        .sum_axis(Axis(1))
        .insert_axis(Axis(1));
    let bce = (&softplus - &logits.dot(&target.t())) / n as f32;

    let probs = logits.mapv(sigmoid);
    let inter = probs.dot(&target.t());
    let p_sum = probs.sum_axis(Axis(1)).insert_axis(Axis(1));
    let t_sum = target.sum_axis(Axis(1)).insert_axis(Axis(0));
    let denominator = &p_sum + &t_sum;
    let dice = Zip::from(&inter)
        .and(&denominator)
        .map_collect(|&i, &d| 1.0 - (2.0 * i + 1.0) / (d + 1.0));

    let keep = has_mask.insert_axis(Axis(0));
    Some((bce * &keep, dice * &keep))
}

/// Mean point BCE and Dice between mask logits and a binary target.
fn mask_costs(points: &SamplePoints, logits: ArrayView2<'_, f32>, target: ArrayView2<'_, f32>) -> (f32, f32) {
    let pred = points.sample(logits);
    let tgt = points.sample(target);
    if pred.is_empty() {
        return (0.0, 0.0);
    }
    let mut bce = 0.0;
    let (mut inter, mut p_sum, mut t_sum) = (0.0, 0.0, 0.0);
    for (&x, &t) in pred.iter().zip(&tgt) {
        bce += bce_with_logits(x, t);
        let p = sigmoid(x);
        inter += p * t;
        p_sum += p;
        t_sum += t;
    }
    let dice = 1.0 - (2.0 * inter + 1.0) / (p_sum + t_sum + 1.0);
    (bce / pred.len() as f32, dice)
}

/// Numerically stable binary cross entropy on a logit.
pub fn bce_with_logits(x: f32, t: f32) -> f32 {
    x.max(0.0) - x * t + (-x.abs()).exp().ln_1p()
}

/// Minimum-cost assignment of rows to columns.
///
/// The matrix is padded to a square with a prohibitive cost so every row
/// and column of the original gets at most one partner. Returns matched
/// `(row, col)` pairs in row order.
pub fn linear_assignment(cost_matrix: &Array2<f32>) -> Vec<(usize, usize)> {
    let (num_rows, num_cols) = cost_matrix.dim();
    if num_rows == 0 || num_cols == 0 {
        return Vec::new();
    }

    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), PADDING_COST);
    for i in 0..num_rows {
        for j in 0..num_cols {
            let c = cost_matrix[[i, j]];
            padded[[i, j]] = if c.is_finite() { c as f64 } else { PADDING_COST };
        }
    }

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => row_to_col
            .iter()
            .enumerate()
            .filter(|&(row, &col)| row < num_rows && col < num_cols)
            .map(|(row, &col)| (row, col))
            .collect(),
        Err(_) => {
            tracing::warn!(rows = num_rows, cols = num_cols, "assignment solver failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Query, TrackId};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array4, array};

    fn gt(track_id: u64, cx: f32, divided_from: Option<u64>) -> GroundTruthInstance {
        GroundTruthInstance {
            bbox: BBox::new(cx, 0.5, 0.1, 0.1),
            mask: None,
            class: 0,
            track_id,
            divided_from,
        }
    }

    fn matcher() -> HungarianMatcher {
        let mut cfg = TractrConfig::default();
        cfg.match_masks = false;
        HungarianMatcher::from_config(&cfg)
    }

    fn query(kind: QueryKind) -> Query {
        Query::new(Array1::zeros(2), BBox::new(0.5, 0.5, 0.1, 0.1), kind)
    }

    fn predictions(primary: &[f32], secondary: &[f32]) -> PredictionSet {
        let q = primary.len();
        let mut boxes = Array2::zeros((q, 8));
        for i in 0..q {
            boxes.row_mut(i).assign(&array![
                primary[i],
                0.5,
                0.1,
                0.1,
                secondary[i],
                0.5,
                0.1,
                0.1
            ]);
        }
        PredictionSet::new(Array2::from_elem((q, 1), 2.0), boxes, None, None).unwrap()
    }

    #[test]
    fn linear_assignment_prefers_cheapest_pairs() {
        let cost = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        assert_eq!(linear_assignment(&cost), vec![(0, 1), (1, 0), (2, 2)]);
    }

    #[test]
    fn linear_assignment_rectangular() {
        let cost = array![[0.9, 0.1], [0.2, 0.8], [0.5, 0.5]];
        let matches = linear_assignment(&cost);
        assert_eq!(matches, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn objects_match_nearest_free_ground_truth() {
        let set = QuerySet::new(
            vec![query(QueryKind::Object), query(QueryKind::Object), query(QueryKind::Object)],
            2,
        )
        .unwrap();
        let preds = predictions(&[0.8, 0.2, 0.5], &[0.0; 3]);
        let targets = FrameTargets::new(vec![gt(1, 0.2, None), gt(2, 0.8, None)]);
        let a = matcher().match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(
            a.targets(),
            &[
                QueryTarget::Single(1),
                QueryTarget::Single(0),
                QueryTarget::Background
            ]
        );
        assert_eq!(a.num_boxes(0..3), 2);
    }

    #[test]
    fn tracks_keep_their_identity_and_claim_it() {
        let set = QuerySet::new(
            vec![
                query(QueryKind::Track {
                    id: TrackId(0),
                    label: Some(2),
                }),
                query(QueryKind::Object),
            ],
            2,
        )
        .unwrap();
        // The object query sits exactly on gt 1 but the track owns it.
        let preds = predictions(&[0.2, 0.8], &[0.0; 2]);
        let targets = FrameTargets::new(vec![gt(1, 0.2, None), gt(2, 0.8, None)]);
        let a = matcher().match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(a.target(0), QueryTarget::Single(1));
        assert_eq!(a.target(1), QueryTarget::Single(0));
    }

    #[test]
    fn division_children_are_ordered_by_cost() {
        let set = QuerySet::new(
            vec![query(QueryKind::Track {
                id: TrackId(0),
                label: Some(7),
            })],
            2,
        )
        .unwrap();
        // Primary box sits on the second daughter in dataset order.
        let preds = predictions(&[0.6], &[0.3]);
        let targets = FrameTargets::new(vec![gt(8, 0.3, Some(7)), gt(9, 0.6, Some(7))]);
        let a = matcher().match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(
            a.target(0),
            QueryTarget::Divided {
                first: 1,
                second: 0
            }
        );
        assert_eq!(a.num_boxes(0..1), 2);
    }

    #[test]
    fn vanished_identity_is_background() {
        let set = QuerySet::new(
            vec![query(QueryKind::Track {
                id: TrackId(0),
                label: Some(3),
            })],
            2,
        )
        .unwrap();
        let preds = predictions(&[0.5], &[0.0]);
        let targets = FrameTargets::new(vec![gt(1, 0.5, None)]);
        let a = matcher().match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(a.target(0), QueryTarget::Background);
    }

    #[test]
    fn empty_targets_give_all_background() {
        let set = QuerySet::new(vec![query(QueryKind::Object); 4], 2).unwrap();
        let preds = predictions(&[0.1, 0.2, 0.3, 0.4], &[0.0; 4]);
        let a = matcher()
            .match_frame(&set, &preds, &FrameTargets::empty())
            .unwrap();
        assert_eq!(a, Assignment::background(4));
    }

    #[test]
    fn matching_is_idempotent() {
        let set = QuerySet::new(vec![query(QueryKind::Object); 5], 2).unwrap();
        // Two identical predictions force a tie.
        let preds = predictions(&[0.3, 0.3, 0.7, 0.1, 0.9], &[0.0; 5]);
        let targets = FrameTargets::new(vec![gt(1, 0.3, None), gt(2, 0.7, None)]);
        let m = matcher();
        let first = m.match_frame(&set, &preds, &targets).unwrap();
        for _ in 0..5 {
            assert_eq!(m.match_frame(&set, &preds, &targets).unwrap(), first);
        }
    }

    #[test]
    fn denoising_rows_take_their_generated_target() {
        let set = QuerySet::new(
            vec![
                query(QueryKind::Object),
                query(QueryKind::DenoisingObject {
                    group: 0,
                    target: QueryTarget::Single(0),
                }),
            ],
            2,
        )
        .unwrap();
        let preds = predictions(&[0.9, 0.1], &[0.0; 2]);
        let targets = FrameTargets::new(vec![gt(1, 0.5, None)]);
        let a = matcher().match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(a.target(1), QueryTarget::Single(0));
        // Denoising rows do not claim ground truth from object queries.
        assert_eq!(a.target(0), QueryTarget::Single(0));
    }

    #[test]
    fn unscored_class_is_rejected() {
        let set = QuerySet::new(vec![query(QueryKind::Object); 2], 2).unwrap();
        let preds = predictions(&[0.2, 0.8], &[0.0; 2]);
        let mut stray = gt(2, 0.8, None);
        stray.class = 1;
        let targets = FrameTargets::new(vec![gt(1, 0.2, None), stray]);

        let m = matcher();
        let err = m.match_frame(&set, &preds, &targets).unwrap_err();
        assert!(matches!(err, TractrError::MalformedBatch(_)));
        assert!(m.match_all(&preds, &targets).is_err());
    }

    #[test]
    fn cost_blocks_match_per_pair_costs() {
        let mut cfg = TractrConfig::default();
        cfg.num_points = 16;
        let m = HungarianMatcher::from_config(&cfg);

        let mut a = gt(1, 0.3, None);
        a.mask = Some(Array2::from_shape_fn((4, 4), |(y, _)| if y < 2 { 1.0 } else { 0.0 }));
        let mut b = gt(2, 0.6, None);
        b.mask = Some(Array2::from_shape_fn((4, 4), |(_, x)| if x < 2 { 1.0 } else { 0.0 }));
        let c = gt(3, 0.9, None);
        let targets = FrameTargets::new(vec![a, b, c]);

        let mut preds = predictions(&[0.25, 0.5, 0.7], &[0.0; 3]);
        preds.logits = array![[1.5], [-0.5], [0.2]];
        preds.masks = Some(Array4::from_shape_fn((3, 2, 4, 4), |(q, _, y, x)| {
            (q as f32 - 1.0) * 2.0 + y as f32 - x as f32
        }));

        let points = m.points(&preds);
        let rows = [0, 1, 2];
        let cols = [0, 1, 2];
        let cost = m
            .cost_matrix(&preds, &rows, &targets, &cols, points.as_ref())
            .unwrap();
        for &row in &rows {
            for &col in &cols {
                let gt = &targets.instances[col];
                let expected = m.costs.class * m.focal_cost(preds.logits[[row, 0]])
                    + m.geometry_cost(&preds, row, 0, gt, points.as_ref());
                assert_abs_diff_eq!(cost[[row, col]], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn mask_cost_breaks_box_ties() {
        let mut cfg = TractrConfig::default();
        cfg.num_points = 16;
        let m = HungarianMatcher::from_config(&cfg);

        let mut fg = Array2::zeros((4, 4));
        fg.slice_mut(ndarray::s![0..2, ..]).fill(1.0);
        let mut a = gt(1, 0.5, None);
        a.mask = Some(fg.clone());
        let mut b = gt(2, 0.5, None);
        b.mask = Some(fg.mapv(|v| 1.0 - v));

        let mut masks = Array4::from_elem((2, 2, 4, 4), -10.0);
        masks.slice_mut(ndarray::s![1, 0, 0..2, ..]).fill(10.0);
        masks.slice_mut(ndarray::s![0, 0, 2..4, ..]).fill(10.0);
        let mut preds = predictions(&[0.5, 0.5], &[0.0; 2]);
        preds.masks = Some(masks);

        let set = QuerySet::new(vec![query(QueryKind::Object); 2], 2).unwrap();
        let targets = FrameTargets::new(vec![a, b]);
        let assignment = m.match_frame(&set, &preds, &targets).unwrap();
        assert_eq!(assignment.target(0), QueryTarget::Single(1));
        assert_eq!(assignment.target(1), QueryTarget::Single(0));
    }
}
