//! Query pool: owns track identities between frames.
//!
//! Identities live in an arena and are addressed by [`TrackId`]. The pool
//! hands out track queries for the next frame, assembles the full query set
//! and, once the decoder has run, carries the refined track queries over:
//! kept identities are refreshed, divided ones are replaced by two
//! daughters, lost ones are retired after the grace period and confirmed
//! object detections are promoted to new identities.

use std::collections::VecDeque;

use ndarray::Array1;
use tracing::{debug, info};

use crate::config::TractrConfig;
use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::BBox;
use crate::tracker::decoder::LayerOutput;
use crate::tracker::denoising::{DenoisingBatch, DenoisingSource};
use crate::tracker::mask::mask_to_box;
use crate::tracker::prediction::PredictionSet;
use crate::tracker::query::{Query, QueryKind, QueryPartition, QuerySet, TrackId};
use crate::tracker::target::{FrameTargets, QueryTarget};
use crate::tracker::track_state::TrackState;

/// Pool behaviour taken from the configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub hidden_dim: usize,
    pub track_grace_frames: u32,
    pub init_boxes_from_masks: bool,
    pub use_prev_prev_frame: bool,
    pub cls_threshold: f32,
}

impl PoolOptions {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            hidden_dim: cfg.hidden_dim,
            track_grace_frames: cfg.track_grace_frames,
            init_boxes_from_masks: cfg.init_boxes_from_masks,
            use_prev_prev_frame: cfg.use_prev_prev_frame,
            cls_threshold: cfg.cls_threshold,
        }
    }
}

/// One identity in the arena.
#[derive(Debug, Clone)]
pub struct TrackSlot {
    pub id: TrackId,
    /// Dataset track id followed during training.
    pub label: Option<u64>,
    pub embedding: Array1<f32>,
    pub reference: BBox,
    pub state: TrackState,
    /// Consecutive frames without a match.
    pub missed: u32,
    pub start_frame: u64,
    pub last_frame: u64,
    /// Identity this one was split from.
    pub parent: Option<TrackId>,
}

/// What happens to a query at the frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Keep (track) or promote (object), following `label`.
    Keep { label: Option<u64> },
    /// Split into two daughters following `labels`.
    Divide { labels: [Option<u64>; 2] },
    /// Not matched or not confident.
    Drop,
}

/// Parent to daughters relation, kept for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivisionRecord {
    pub parent: TrackId,
    pub children: [TrackId; 2],
    pub frame: u64,
}

/// Tracks present after a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSnapshot {
    pub frame: u64,
    pub tracks: Vec<(TrackId, BBox)>,
}

impl FrameSnapshot {
    /// Identities present, in query order.
    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|(id, _)| *id).collect()
    }
}

/// The two frames preceding the current one. Missing history is empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameWindow {
    pub prev_prev: FrameSnapshot,
    pub prev: FrameSnapshot,
}

/// Bookkeeping of one carry-over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CarryOverSummary {
    /// Identities fed to the decoder this frame.
    pub tracks_before: usize,
    pub kept: usize,
    /// Unmatched but inside the grace period.
    pub lost: usize,
    pub retired: usize,
    pub promoted: usize,
    pub divided: usize,
    /// Identities carried into the next frame.
    pub carried: usize,
}

impl CarryOverSummary {
    /// `tracks - retirements + promotions + 2 x divisions - divisions`.
    pub fn expected_carried(&self) -> usize {
        self.tracks_before - self.retired + self.promoted + self.divided
    }
}

/// Exclusive owner of the carried track queries.
#[derive(Debug, Clone)]
pub struct QueryPoolManager {
    slots: Vec<TrackSlot>,
    active: Vec<TrackId>,
    frame_id: u64,
    options: PoolOptions,
    last_divisions: Vec<DivisionRecord>,
    history: VecDeque<FrameSnapshot>,
}

impl QueryPoolManager {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            slots: Vec::new(),
            active: Vec::new(),
            frame_id: 0,
            options,
            last_divisions: Vec::new(),
            history: VecDeque::new(),
        }
    }

    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self::new(PoolOptions::from_config(cfg))
    }

    /// Number of frames carried over since the last reset.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Active identities in query order.
    pub fn active_ids(&self) -> &[TrackId] {
        &self.active
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    pub fn slot(&self, id: TrackId) -> Option<&TrackSlot> {
        self.slots.get(id.index())
    }

    /// Divisions performed by the last carry-over.
    pub fn last_divisions(&self) -> &[DivisionRecord] {
        &self.last_divisions
    }

    /// Snapshots of the previous two frames.
    pub fn window(&self) -> FrameWindow {
        let n = self.history.len();
        let prev = self.history.back().cloned().unwrap_or_default();
        let prev_prev = if self.options.use_prev_prev_frame && n >= 2 {
            self.history[n - 2].clone()
        } else {
            FrameSnapshot::default()
        };
        FrameWindow { prev_prev, prev }
    }

    /// Track queries for the next decoder pass, in identity order.
    pub fn track_queries(&self) -> Vec<Query> {
        self.active
            .iter()
            .filter_map(|id| self.slot(*id))
            .filter(|slot| slot.state.is_active())
            .map(|slot| {
                Query::new(
                    slot.embedding.clone(),
                    slot.reference,
                    QueryKind::Track {
                        id: slot.id,
                        label: slot.label,
                    },
                )
            })
            .collect()
    }

    /// Denoising sources built from the active identities.
    ///
    /// Each source is supervised towards the identity's ground truth this
    /// frame, its two daughters after a division, or background.
    pub fn denoising_sources(&self, targets: &FrameTargets) -> Vec<DenoisingSource> {
        self.active
            .iter()
            .filter_map(|id| self.slot(*id))
            .map(|slot| DenoisingSource {
                reference: slot.reference,
                embedding: Some(slot.embedding.clone()),
                target: slot
                    .label
                    .map_or(QueryTarget::Background, |l| targets.resolve_identity(l)),
            })
            .collect()
    }

    /// Concatenate track queries, object proposals and denoising batches.
    ///
    /// Identity `i` of [`active_ids`](Self::active_ids) lands at row `i`.
    pub fn assemble(
        &self,
        proposals: Vec<Query>,
        mut denoising: Vec<DenoisingBatch>,
    ) -> TractrResult<QuerySet> {
        if let Some(bad) = proposals.iter().find(|q| q.kind != QueryKind::Object) {
            return Err(TractrError::malformed(format!(
                "proposal of kind {} among object queries",
                bad.partition()
            )));
        }
        if let Some(bad) = denoising.iter().find(|b| !b.partition.is_denoising()) {
            return Err(TractrError::malformed(format!(
                "denoising batch tagged {}",
                bad.partition
            )));
        }
        denoising.sort_by_key(|b| b.partition);

        let mut queries = self.track_queries();
        queries.extend(proposals);
        for batch in denoising {
            queries.extend(batch.queries);
        }
        QuerySet::new(queries, self.options.hidden_dim)
    }

    /// Outcomes from the final tracking layer's assignment.
    pub fn outcomes_from_assignment(
        &self,
        queries: &QuerySet,
        assignment: &[QueryTarget],
        targets: &FrameTargets,
    ) -> TractrResult<Vec<QueryOutcome>> {
        if assignment.len() != queries.len() {
            return Err(TractrError::shape_mismatch(
                "assignment",
                vec![queries.len()],
                vec![assignment.len()],
            ));
        }
        let label = |gt: usize| targets.instances.get(gt).map(|i| i.track_id);
        Ok(queries
            .queries()
            .iter()
            .zip(assignment)
            .map(|(query, target)| {
                if query.partition().is_denoising() {
                    return QueryOutcome::Drop;
                }
                match *target {
                    QueryTarget::Background => QueryOutcome::Drop,
                    QueryTarget::Single(gt) => QueryOutcome::Keep { label: label(gt) },
                    QueryTarget::Divided { first, second } => QueryOutcome::Divide {
                        labels: [label(first), label(second)],
                    },
                }
            })
            .collect())
    }

    /// Outcomes from final-layer scores, used without ground truth.
    pub fn outcomes_from_scores(
        &self,
        queries: &QuerySet,
        predictions: &PredictionSet,
    ) -> TractrResult<Vec<QueryOutcome>> {
        check_len(queries, predictions.len())?;
        let threshold = self.options.cls_threshold;
        Ok(queries
            .queries()
            .iter()
            .enumerate()
            .map(|(row, query)| {
                if query.partition().is_denoising() || predictions.score(row) < threshold {
                    return QueryOutcome::Drop;
                }
                let divides = query.divisible
                    && predictions
                        .division_probability(row)
                        .is_some_and(|p| p >= threshold);
                if divides {
                    QueryOutcome::Divide {
                        labels: [None, None],
                    }
                } else {
                    QueryOutcome::Keep { label: None }
                }
            })
            .collect())
    }

    /// Carry the refined track queries of `output` into the next frame.
    pub fn carry_over(
        &mut self,
        queries: &QuerySet,
        output: &LayerOutput,
        outcomes: &[QueryOutcome],
    ) -> TractrResult<CarryOverSummary> {
        check_len(queries, output.predictions.len())?;
        check_len(queries, outcomes.len())?;
        let track_ids: Vec<TrackId> = queries
            .iter_partition(QueryPartition::Track)
            .filter_map(|(_, q)| q.kind.track_id())
            .collect();
        if track_ids != self.active {
            return Err(TractrError::malformed(format!(
                "query set carries {} track queries that do not match the {} pooled identities",
                track_ids.len(),
                self.active.len()
            )));
        }

        self.frame_id += 1;
        self.last_divisions.clear();
        let frame = self.frame_id;
        let mut summary = CarryOverSummary {
            tracks_before: self.active.len(),
            ..Default::default()
        };
        let mut next_active = Vec::with_capacity(self.active.len());

        for (row, query) in queries.queries().iter().enumerate() {
            let outcome = outcomes[row];
            match (&query.kind, outcome) {
                (QueryKind::Track { id, .. }, QueryOutcome::Divide { labels }) if query.divisible => {
                    let id = *id;
                    self.slots[id.index()].state = TrackState::Divided;
                    let embedding = output.embeddings.row(row).to_owned();
                    let first = self.spawn(labels[0], embedding.clone(), self.reference(output, row, 0), Some(id));
                    let second = self.spawn(labels[1], embedding, self.reference(output, row, 1), Some(id));
                    self.last_divisions.push(DivisionRecord {
                        parent: id,
                        children: [first, second],
                        frame,
                    });
                    debug!(parent = %id, first = %first, second = %second, frame, "track divided");
                    next_active.extend([first, second]);
                    summary.divided += 1;
                }
                (QueryKind::Track { id, .. }, QueryOutcome::Keep { label })
                | (QueryKind::Track { id, .. }, QueryOutcome::Divide { labels: [label, _] }) => {
                    let reference = self.reference(output, row, 0);
                    let slot = &mut self.slots[id.index()];
                    slot.embedding = output.embeddings.row(row).to_owned();
                    slot.reference = reference;
                    slot.label = label.or(slot.label);
                    slot.state = TrackState::Tracked;
                    slot.missed = 0;
                    slot.last_frame = frame;
                    next_active.push(*id);
                    summary.kept += 1;
                }
                (QueryKind::Track { id, .. }, QueryOutcome::Drop) => {
                    let grace = self.options.track_grace_frames;
                    let slot = &mut self.slots[id.index()];
                    slot.missed += 1;
                    if slot.missed > grace {
                        slot.state = TrackState::Removed;
                        summary.retired += 1;
                    } else {
                        slot.state = TrackState::Lost;
                        next_active.push(*id);
                        summary.lost += 1;
                    }
                }
                (QueryKind::Object, QueryOutcome::Keep { label })
                | (QueryKind::Object, QueryOutcome::Divide { labels: [label, _] }) => {
                    let embedding = output.embeddings.row(row).to_owned();
                    let id = self.spawn(label, embedding, self.reference(output, row, 0), None);
                    next_active.push(id);
                    summary.promoted += 1;
                }
                _ => {}
            }
        }

        self.active = next_active;
        summary.carried = self.active.len();
        self.push_snapshot();

        info!(
            frame,
            before = summary.tracks_before,
            kept = summary.kept,
            lost = summary.lost,
            retired = summary.retired,
            promoted = summary.promoted,
            divided = summary.divided,
            carried = summary.carried,
            "carried track queries over"
        );
        Ok(summary)
    }

    /// Drop every identity at the end of a sequence.
    ///
    /// [`TrackId`]s are scoped to one sequence, so the arena is emptied and
    /// ids handed out before the reset no longer resolve.
    pub fn reset(&mut self) {
        let dropped = self.slots.len();
        self.slots.clear();
        self.active.clear();
        self.last_divisions.clear();
        self.history.clear();
        self.frame_id = 0;
        debug!(identities = dropped, "query pool reset");
    }

    /// Identities allocated since the last reset, retired ones included.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn spawn(
        &mut self,
        label: Option<u64>,
        embedding: Array1<f32>,
        reference: BBox,
        parent: Option<TrackId>,
    ) -> TrackId {
        let id = TrackId(self.slots.len());
        self.slots.push(TrackSlot {
            id,
            label,
            embedding,
            reference,
            state: TrackState::Tracked,
            missed: 0,
            start_frame: self.frame_id,
            last_frame: self.frame_id,
            parent,
        });
        id
    }

    /// Reference box of daughter `channel` of row `row` for the next frame.
    fn reference(&self, output: &LayerOutput, row: usize, channel: usize) -> BBox {
        let predicted = output.predictions.box_for(row, channel);
        if !self.options.init_boxes_from_masks {
            return predicted;
        }
        output
            .predictions
            .mask(row, channel)
            .and_then(|m| mask_to_box(m, 0.0))
            .unwrap_or(predicted)
    }

    fn push_snapshot(&mut self) {
        let tracks = self
            .active
            .iter()
            .map(|id| (*id, self.slots[id.index()].reference))
            .collect();
        self.history.push_back(FrameSnapshot {
            frame: self.frame_id,
            tracks,
        });
        let keep = if self.options.use_prev_prev_frame { 2 } else { 1 };
        while self.history.len() > keep {
            self.history.pop_front();
        }
    }
}

fn check_len(queries: &QuerySet, len: usize) -> TractrResult<()> {
    if len != queries.len() {
        return Err(TractrError::shape_mismatch(
            "per-query rows",
            vec![queries.len()],
            vec![len],
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::target::GroundTruthInstance;
    use ndarray::{Array2, Array4};

    const DIM: usize = 4;

    fn options() -> PoolOptions {
        PoolOptions {
            hidden_dim: DIM,
            track_grace_frames: 0,
            init_boxes_from_masks: false,
            use_prev_prev_frame: true,
            cls_threshold: 0.5,
        }
    }

    fn object(cx: f32) -> Query {
        Query::new(Array1::zeros(DIM), BBox::new(cx, 0.5, 0.1, 0.1), QueryKind::Object)
    }

    /// Layer output whose predictions equal the query references, with the
    /// secondary box shifted right.
    fn output(queries: &QuerySet, masks: Option<Array4<f32>>) -> LayerOutput {
        let q = queries.len();
        let refs = queries.references();
        let mut boxes = Array2::zeros((q, 8));
        for i in 0..q {
            for j in 0..4 {
                boxes[[i, j]] = refs[[i, j]];
                boxes[[i, j + 4]] = refs[[i, j]];
            }
            boxes[[i, 4]] += 0.05;
        }
        LayerOutput {
            embeddings: Array2::from_elem((q, DIM), 1.0),
            predictions: PredictionSet::new(Array2::zeros((q, 1)), boxes, None, masks).unwrap(),
            reference: refs,
        }
    }

    fn promote_all(pool: &mut QueryPoolManager, n: usize) {
        let proposals = (0..n).map(|i| object(0.1 + 0.2 * i as f32)).collect();
        let set = pool.assemble(proposals, Vec::new()).unwrap();
        let outcomes: Vec<_> = (0..n)
            .map(|i| QueryOutcome::Keep {
                label: Some(i as u64),
            })
            .collect();
        let out = output(&set, None);
        pool.carry_over(&set, &out, &outcomes).unwrap();
    }

    #[test]
    fn promotions_become_identities_in_order() {
        let mut pool = QueryPoolManager::new(options());
        promote_all(&mut pool, 3);
        assert_eq!(pool.num_active(), 3);
        let set = pool.assemble(vec![object(0.9)], Vec::new()).unwrap();
        assert_eq!(set.count(QueryPartition::Track), 3);
        for (row, id) in pool.active_ids().iter().enumerate() {
            assert_eq!(set.queries()[row].kind.track_id(), Some(*id));
        }
    }

    #[test]
    fn division_retires_parent_and_spawns_two() {
        let mut pool = QueryPoolManager::new(options());
        promote_all(&mut pool, 2);
        let parent = pool.active_ids()[1];

        let set = pool.assemble(Vec::new(), Vec::new()).unwrap();
        let outcomes = vec![
            QueryOutcome::Keep { label: Some(0) },
            QueryOutcome::Divide {
                labels: [Some(5), Some(6)],
            },
        ];
        let summary = pool.carry_over(&set, &output(&set, None), &outcomes).unwrap();

        assert_eq!(summary.divided, 1);
        assert_eq!(summary.carried, 3);
        assert_eq!(summary.carried, summary.expected_carried());
        assert_eq!(pool.slot(parent).unwrap().state, TrackState::Divided);

        let record = pool.last_divisions()[0];
        assert_eq!(record.parent, parent);
        let first = pool.slot(record.children[0]).unwrap();
        let second = pool.slot(record.children[1]).unwrap();
        assert_eq!(first.label, Some(5));
        assert_eq!(second.parent, Some(parent));
        assert!((second.reference.cx - first.reference.cx - 0.05).abs() < 1e-6);
        assert_eq!(first.embedding, second.embedding);

        // The record does not outlive the next frame.
        let set = pool.assemble(Vec::new(), Vec::new()).unwrap();
        let keep = vec![QueryOutcome::Keep { label: None }; set.len()];
        pool.carry_over(&set, &output(&set, None), &keep).unwrap();
        assert!(pool.last_divisions().is_empty());
    }

    #[test]
    fn grace_period_delays_retirement() {
        let mut opts = options();
        opts.track_grace_frames = 1;
        let mut pool = QueryPoolManager::new(opts);
        promote_all(&mut pool, 1);

        let set = pool.assemble(Vec::new(), Vec::new()).unwrap();
        let s = pool
            .carry_over(&set, &output(&set, None), &[QueryOutcome::Drop])
            .unwrap();
        assert_eq!((s.lost, s.retired, s.carried), (1, 0, 1));
        let id = pool.active_ids()[0];
        assert_eq!(pool.slot(id).unwrap().state, TrackState::Lost);
        assert!(pool.slot(id).unwrap().state.is_active());

        let set = pool.assemble(Vec::new(), Vec::new()).unwrap();
        let s = pool
            .carry_over(&set, &output(&set, None), &[QueryOutcome::Drop])
            .unwrap();
        assert_eq!((s.lost, s.retired, s.carried), (0, 1, 0));
        assert_eq!(s.carried, s.expected_carried());
        assert!(!pool.slot(id).unwrap().state.is_active());
    }

    #[test]
    fn mask_boxes_replace_predicted_boxes() {
        let mut opts = options();
        opts.init_boxes_from_masks = true;
        let mut pool = QueryPoolManager::new(opts);

        let set = pool.assemble(vec![object(0.5), object(0.2)], Vec::new()).unwrap();
        let mut masks = Array4::from_elem((2, 2, 8, 8), -5.0);
        for y in 2..5 {
            for x in 1..7 {
                masks[[0, 0, y, x]] = 3.0;
            }
        }
        let out = output(&set, Some(masks));
        let outcomes = vec![QueryOutcome::Keep { label: None }; 2];
        pool.carry_over(&set, &out, &outcomes).unwrap();

        let from_mask = pool.slot(pool.active_ids()[0]).unwrap().reference;
        assert_eq!(from_mask, BBox::from_xyxy(1.0 / 8.0, 2.0 / 8.0, 7.0 / 8.0, 5.0 / 8.0));
        // Empty mask falls back to the predicted box.
        let fallback = pool.slot(pool.active_ids()[1]).unwrap().reference;
        assert_eq!(fallback, BBox::new(0.2, 0.5, 0.1, 0.1));
    }

    #[test]
    fn outcomes_follow_the_assignment() {
        let mut pool = QueryPoolManager::new(options());
        promote_all(&mut pool, 1);
        let set = pool.assemble(vec![object(0.5)], Vec::new()).unwrap();
        let targets = FrameTargets::new(vec![
            GroundTruthInstance {
                bbox: BBox::new(0.5, 0.5, 0.1, 0.1),
                mask: None,
                class: 0,
                track_id: 10,
                divided_from: None,
            },
            GroundTruthInstance {
                bbox: BBox::new(0.2, 0.5, 0.1, 0.1),
                mask: None,
                class: 0,
                track_id: 11,
                divided_from: None,
            },
        ]);
        let outcomes = pool
            .outcomes_from_assignment(
                &set,
                &[QueryTarget::Background, QueryTarget::Single(1)],
                &targets,
            )
            .unwrap();
        assert_eq!(
            outcomes,
            vec![QueryOutcome::Drop, QueryOutcome::Keep { label: Some(11) }]
        );
    }

    #[test]
    fn score_outcomes_respect_threshold() {
        let pool = QueryPoolManager::new(options());
        let set = pool.assemble(vec![object(0.5), object(0.2)], Vec::new()).unwrap();
        let mut out = output(&set, None);
        out.predictions.logits[[0, 0]] = 3.0;
        out.predictions.logits[[1, 0]] = -3.0;
        let outcomes = pool.outcomes_from_scores(&set, &out.predictions).unwrap();
        assert_eq!(
            outcomes,
            vec![QueryOutcome::Keep { label: None }, QueryOutcome::Drop]
        );
    }

    #[test]
    fn window_fabricates_missing_history() {
        let mut pool = QueryPoolManager::new(options());
        assert_eq!(pool.window(), FrameWindow::default());
        promote_all(&mut pool, 2);
        let window = pool.window();
        assert!(window.prev_prev.tracks.is_empty());
        assert_eq!(window.prev.tracks.len(), 2);

        let set = pool.assemble(Vec::new(), Vec::new()).unwrap();
        let keep = vec![QueryOutcome::Keep { label: None }; 2];
        pool.carry_over(&set, &output(&set, None), &keep).unwrap();
        assert_eq!(pool.window().prev_prev.frame, 1);
        assert_eq!(pool.window().prev.frame, 2);
    }

    #[test]
    fn stale_query_set_is_rejected() {
        let mut pool = QueryPoolManager::new(options());
        let stale = pool.assemble(Vec::new(), Vec::new()).unwrap();
        promote_all(&mut pool, 1);
        let err = pool
            .carry_over(&stale, &output(&stale, None), &[])
            .unwrap_err();
        assert!(matches!(err, TractrError::MalformedBatch(_)));
    }

    #[test]
    fn reset_empties_the_arena() {
        let mut pool = QueryPoolManager::new(options());
        promote_all(&mut pool, 2);
        let ids = pool.active_ids().to_vec();
        pool.reset();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_slots(), 0);
        assert!(ids.iter().all(|id| pool.slot(*id).is_none()));
        assert_eq!(pool.window(), FrameWindow::default());
    }

    #[test]
    fn arena_does_not_grow_across_sequences() {
        let mut pool = QueryPoolManager::new(options());
        for _ in 0..50 {
            promote_all(&mut pool, 2);
            pool.reset();
        }
        promote_all(&mut pool, 2);
        assert_eq!(pool.num_slots(), 2);
        assert!(pool.active_ids().iter().all(|id| id.index() < 2));
    }
}
