//! TrackingPipeline: one training or inference step over a frame window.

use tracing::{debug, info};

use crate::config::TractrConfig;
use crate::criterion::{
    AccuracyCounter, Assignment, FrameAccuracy, HungarianMatcher, LossAssembler, LossReport,
};
use crate::error::{ConfigError, TractrError, TractrResult};
use crate::tracker::{
    CarryOverSummary, DecoderOutput, DecoderStack, DeformableAttention, DenoisingBatch,
    DenoisingGenerator, DenoisingSource, EncoderOutput, FrameTargets, FrameWindow, LayerOutput,
    LayerPartition, MultiScaleFeatures, NoiseSpec, PredictionSet, ProposalStage, Proposals,
    QueryPartition, QueryPoolManager, QuerySet, TrackId,
};

use super::context::{StepOutcome, TrainingContext};

/// Longest window: prev_prev, prev and cur.
const MAX_WINDOW_FRAMES: usize = 3;

/// Everything the model sees of one frame.
#[derive(Debug, Clone)]
pub struct FrameInput {
    /// Position of the frame in its sequence.
    pub index: u64,
    pub features: MultiScaleFeatures,
    /// Encoder output, required by the two-stage proposal stage.
    pub encoder: Option<EncoderOutput>,
    /// Ground truth; `None` runs inference.
    pub targets: Option<FrameTargets>,
}

/// Result of one processed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub index: u64,
    /// Tracks of the preceding frames this frame was decoded from.
    pub window: FrameWindow,
    /// Query count per partition, in query order.
    pub partitions: Vec<(QueryPartition, usize)>,
    /// Final-layer predictions, one row per query.
    pub predictions: PredictionSet,
    /// Assignment used for the carry-over, when ground truth was given.
    pub assignment: Option<Assignment>,
    pub loss: Option<LossReport>,
    /// Accuracy of the final tracking layer, when ground truth was given.
    pub accuracy: Option<FrameAccuracy>,
    pub carry_over: Option<CarryOverSummary>,
    /// Identities carried into the next frame.
    pub active_tracks: Vec<TrackId>,
}

impl FrameReport {
    pub fn count(&self, partition: QueryPartition) -> usize {
        self.partitions
            .iter()
            .find(|(p, _)| *p == partition)
            .map_or(0, |(_, n)| *n)
    }
}

/// Result of a frame window.
#[derive(Debug, Clone, Default)]
pub struct WindowReport {
    pub frames: Vec<FrameReport>,
    /// Loss that receives gradients, keyed `frame{k}/...`.
    pub loss: LossReport,
    /// Accuracy summed over every frame of the window.
    pub accuracy: FrameAccuracy,
}

/// Drives proposals, denoising, decoding, matching, loss and carry-over
/// over the frames of a sequence.
pub struct TrackingPipeline<A: DeformableAttention> {
    config: TractrConfig,
    decoder: DecoderStack,
    proposals: ProposalStage,
    attention: A,
    pool: QueryPoolManager,
    denoiser: DenoisingGenerator,
    matcher: HungarianMatcher,
    criterion: LossAssembler,
    accuracy: AccuracyCounter,
    partition: LayerPartition,
    last_frame: Option<u64>,
    /// Mask sampling step of the next frame.
    sample_step: u64,
}

impl<A: DeformableAttention> TrackingPipeline<A> {
    /// Create a pipeline; the decoder depth and proposal kind must agree
    /// with `config`.
    pub fn new(
        config: TractrConfig,
        decoder: DecoderStack,
        proposals: ProposalStage,
        attention: A,
    ) -> TractrResult<Self> {
        config.validate()?;
        if decoder.num_layers() != config.dec_layers {
            return Err(TractrError::shape_mismatch(
                "decoder layers",
                vec![config.dec_layers],
                vec![decoder.num_layers()],
            ));
        }
        if proposals.is_two_stage() != config.two_stage {
            return Err(ConfigError::invalid_value(
                "two_stage",
                "does not match the proposal stage",
            )
            .into());
        }

        Ok(Self {
            pool: QueryPoolManager::from_config(&config),
            denoiser: DenoisingGenerator::from_config(&config),
            matcher: HungarianMatcher::from_config(&config),
            criterion: LossAssembler::from_config(&config),
            accuracy: AccuracyCounter::from_config(&config),
            partition: LayerPartition::from_config(&config),
            config,
            decoder,
            proposals,
            attention,
            last_frame: None,
            sample_step: 0,
        })
    }

    pub fn config(&self) -> &TractrConfig {
        &self.config
    }

    pub fn pool(&self) -> &QueryPoolManager {
        &self.pool
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    /// Mask sampling step the next frame will use.
    pub fn sample_step(&self) -> u64 {
        self.sample_step
    }

    /// Forget the carried identities at a sequence boundary.
    pub fn reset(&mut self) {
        self.pool.reset();
        self.last_frame = None;
    }

    /// Process the next frame of the current sequence.
    pub fn process_frame(&mut self, frame: &FrameInput) -> TractrResult<FrameReport> {
        if let Some(last) = self.last_frame {
            if frame.index <= last {
                return Err(TractrError::OutOfOrderFrame {
                    last,
                    got: frame.index,
                });
            }
        }

        self.matcher.sampler.set_step(self.sample_step);
        self.criterion.sampler.set_step(self.sample_step);
        self.sample_step += 1;

        let Proposals {
            queries: object_queries,
            predictions: enc_predictions,
            ..
        } = self.proposals.propose(frame.encoder.as_ref())?;
        let denoising = match &frame.targets {
            Some(targets) => self.denoising(targets)?,
            None => Vec::new(),
        };
        let window = self.pool.window();
        let queries = self.pool.assemble(object_queries, denoising)?;
        let carried: Vec<TrackId> = queries
            .iter_partition(QueryPartition::Track)
            .filter_map(|(_, q)| q.kind.track_id())
            .collect();
        if carried != window.prev.ids() {
            return Err(TractrError::malformed(format!(
                "{} track queries assembled but the previous frame left {}",
                carried.len(),
                window.prev.tracks.len()
            )));
        }
        let decoded = self.decoder.forward(&queries, &frame.features, &self.attention)?;
        let carried_layer = self.partition.final_tracking_layer();
        let final_layer = decoded.layers.get(carried_layer).ok_or_else(|| {
            TractrError::malformed(format!("decoder produced no layer {carried_layer}"))
        })?;

        let (assignment, loss, accuracy, outcomes) = match &frame.targets {
            Some(targets) => {
                let assignments = self.match_layers(&queries, &decoded, targets)?;
                let enc_assignment = match &enc_predictions {
                    Some(p) => Some(self.matcher.match_all(p, targets)?),
                    None => None,
                };
                let two_stage = enc_predictions.as_ref().zip(enc_assignment.as_ref());
                let loss =
                    self.criterion
                        .compute(&queries, &decoded, &assignments, targets, two_stage)?;
                let carried = assignments
                    .into_iter()
                    .nth(carried_layer)
                    .unwrap_or_else(|| Assignment::background(queries.len()));
                let accuracy =
                    self.accuracy
                        .frame(&queries, &final_layer.predictions, &carried, targets)?;
                let outcomes =
                    self.pool
                        .outcomes_from_assignment(&queries, carried.targets(), targets)?;
                (Some(carried), Some(loss), Some(accuracy), outcomes)
            }
            None => {
                let outcomes = self.pool.outcomes_from_scores(&queries, &final_layer.predictions)?;
                (None, None, None, outcomes)
            }
        };

        let carry_over = if self.config.tracking {
            Some(self.pool.carry_over(&queries, final_layer, &outcomes)?)
        } else {
            None
        };
        self.last_frame = Some(frame.index);

        let partitions: Vec<(QueryPartition, usize)> = QueryPartition::ALL
            .iter()
            .map(|&p| (p, queries.count(p)))
            .collect();
        debug!(
            frame = frame.index,
            queries = queries.len(),
            prev_tracks = window.prev.tracks.len(),
            prev_prev_tracks = window.prev_prev.tracks.len(),
            loss = loss.as_ref().map(|l| l.total),
            bbox_acc = accuracy.and_then(|a| a.bbox.ratio()),
            "processed frame"
        );
        Ok(FrameReport {
            index: frame.index,
            window,
            partitions,
            predictions: final_layer.predictions.clone(),
            assignment,
            loss,
            accuracy,
            carry_over,
            active_tracks: self.pool.active_ids().to_vec(),
        })
    }

    /// Run a `prev(_prev)/cur` window from a fresh pool.
    ///
    /// With `backprop_prev_frame` the loss sums every frame of the window,
    /// otherwise only the current (last) frame contributes.
    pub fn run_window(&mut self, frames: &[FrameInput]) -> TractrResult<WindowReport> {
        let max_frames = match (self.config.tracking, self.config.use_prev_prev_frame) {
            (false, _) => 1,
            (true, false) => 2,
            (true, true) => MAX_WINDOW_FRAMES,
        };
        if frames.is_empty() || frames.len() > max_frames {
            return Err(TractrError::malformed(format!(
                "a window holds 1 to {max_frames} frames, got {}",
                frames.len()
            )));
        }
        if frames.iter().any(|f| f.targets.is_none()) {
            return Err(TractrError::malformed("every training frame needs ground truth"));
        }

        self.reset();
        let last = frames.len() - 1;
        let mut report = WindowReport::default();
        for (k, frame) in frames.iter().enumerate() {
            let frame_report = self.process_frame(frame)?;
            if self.config.backprop_prev_frame || k == last {
                if let Some(loss) = &frame_report.loss {
                    report.loss.merge(&format!("frame{k}"), loss);
                }
            }
            if let Some(accuracy) = &frame_report.accuracy {
                report.accuracy += accuracy;
            }
            report.frames.push(frame_report);
        }
        Ok(report)
    }

    /// One optimizer step: run the window and account for its loss.
    pub fn train_step(
        &mut self,
        ctx: &mut TrainingContext,
        frames: &[FrameInput],
    ) -> TractrResult<(StepOutcome, WindowReport)> {
        // Each step samples fresh mask points, reproducibly after a resume.
        self.sample_step = ctx.global_step().wrapping_mul(MAX_WINDOW_FRAMES as u64);
        let report = self.run_window(frames)?;
        let outcome = ctx.record_loss(&report.loss)?;
        if outcome == StepOutcome::Applied {
            info!(
                step = ctx.global_step(),
                epoch = ctx.epoch(),
                loss = report.loss.total,
                bbox_acc = report.accuracy.bbox.ratio(),
                lr = ctx.lr(),
                "training step"
            );
        }
        Ok((outcome, report))
    }

    fn denoising(&mut self, targets: &FrameTargets) -> TractrResult<Vec<DenoisingBatch>> {
        let mut batches = Vec::new();
        for partition in [
            QueryPartition::DenoisingTrack,
            QueryPartition::DenoisingObject,
            QueryPartition::DenoisingEnc,
        ] {
            let Some(spec) = NoiseSpec::for_partition(&self.config, partition) else {
                continue;
            };
            let sources = match partition {
                QueryPartition::DenoisingTrack => self.pool.denoising_sources(targets),
                _ => DenoisingSource::from_targets(targets),
            };
            if sources.is_empty() {
                continue;
            }
            batches.push(self.denoiser.generate(partition, &sources, &spec)?);
        }
        Ok(batches)
    }

    /// One assignment per decoder layer, or the final layer's shared by
    /// all layers when the regression head is shared.
    fn match_layers(
        &self,
        queries: &QuerySet,
        decoded: &DecoderOutput,
        targets: &FrameTargets,
    ) -> TractrResult<Vec<Assignment>> {
        if self.config.share_bbox_layers {
            let last = decoded
                .final_layer()
                .ok_or_else(|| TractrError::malformed("decoder produced no layers"))?;
            let assignment = self.matcher.match_frame(queries, &last.predictions, targets)?;
            return Ok(vec![assignment; decoded.num_layers()]);
        }
        decoded
            .layers
            .iter()
            .map(|layer: &LayerOutput| self.matcher.match_frame(queries, &layer.predictions, targets))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::CpuDeformAttn;
    use crate::tracker::{BBox, GroundTruthInstance, RefinementStep, StepOutput};
    use ndarray::{Array1, Array2, Array3, ArrayView2};
    use std::sync::Arc;

    const HIDDEN: usize = 8;

    /// Keeps every box, scores every query as a confident non-dividing cell.
    struct StillStep;

    impl RefinementStep for StillStep {
        fn refine(
            &self,
            _layer: usize,
            embeddings: ArrayView2<'_, f32>,
            _reference: ArrayView2<'_, f32>,
            _attention_mask: ArrayView2<'_, bool>,
            _features: &MultiScaleFeatures,
            _attention: &dyn DeformableAttention,
        ) -> TractrResult<StepOutput> {
            let q = embeddings.nrows();
            Ok(StepOutput {
                embeddings: embeddings.to_owned(),
                box_deltas: Array2::zeros((q, 8)),
                logits: Array2::from_elem((q, 1), 4.0),
                division_logits: Some(Array1::from_elem(q, -4.0)),
                masks: None,
            })
        }
    }

    fn config() -> TractrConfig {
        TractrConfig {
            hidden_dim: HIDDEN,
            num_queries: 3,
            dec_layers: 2,
            two_stage: false,
            masks: false,
            match_masks: false,
            return_intermediate_masks: false,
            dn_track: false,
            dn_object: false,
            ..TractrConfig::default()
        }
    }

    fn cell(track_id: u64, cx: f32) -> GroundTruthInstance {
        GroundTruthInstance {
            bbox: BBox::new(cx, 0.5, 0.1, 0.1),
            mask: None,
            class: 0,
            track_id,
            divided_from: None,
        }
    }

    fn pipeline(cfg: TractrConfig) -> TrackingPipeline<CpuDeformAttn> {
        let step: Arc<dyn RefinementStep> = Arc::new(StillStep);
        let decoder = DecoderStack::shared(step, cfg.dec_layers, false);
        let boxes = Array2::from_shape_fn((3, 4), |(i, j)| match j {
            0 => 0.2 + 0.3 * i as f32,
            1 => 0.5,
            _ => 0.1,
        });
        let proposals = ProposalStage::learned(Array2::zeros((3, HIDDEN)), boxes).unwrap();
        TrackingPipeline::new(cfg, decoder, proposals, CpuDeformAttn).unwrap()
    }

    fn frame(index: u64, targets: Option<FrameTargets>) -> FrameInput {
        FrameInput {
            index,
            features: MultiScaleFeatures::new(vec![Array3::zeros((4, 4, HIDDEN))]).unwrap(),
            encoder: None,
            targets,
        }
    }

    #[test]
    fn objects_are_promoted_and_then_tracked() {
        let mut p = pipeline(config());
        let targets = FrameTargets::new(vec![cell(10, 0.2), cell(11, 0.5)]);

        let first = p.process_frame(&frame(0, Some(targets.clone()))).unwrap();
        let summary = first.carry_over.unwrap();
        assert_eq!(summary.promoted, 2);
        assert_eq!(first.active_tracks.len(), 2);

        let second = p.process_frame(&frame(1, Some(targets))).unwrap();
        assert_eq!(second.count(QueryPartition::Track), 2);
        let summary = second.carry_over.unwrap();
        assert_eq!(summary.kept, 2);
        assert_eq!(summary.promoted, 0);
        assert_eq!(summary.carried, summary.expected_carried());
    }

    #[test]
    fn frames_must_arrive_in_order() {
        let mut p = pipeline(config());
        p.process_frame(&frame(3, Some(FrameTargets::empty()))).unwrap();
        let err = p.process_frame(&frame(3, Some(FrameTargets::empty()))).unwrap_err();
        assert!(matches!(err, TractrError::OutOfOrderFrame { last: 3, got: 3 }));
    }

    #[test]
    fn inference_promotes_confident_queries() {
        let mut p = pipeline(config());
        let report = p.process_frame(&frame(0, None)).unwrap();
        assert!(report.loss.is_none());
        assert_eq!(report.active_tracks.len(), 3);
    }

    #[test]
    fn window_loss_covers_the_current_frame_only() {
        let targets = FrameTargets::new(vec![cell(1, 0.2)]);
        let frames = [frame(0, Some(targets.clone())), frame(1, Some(targets))];

        let report = pipeline(config()).run_window(&frames).unwrap();
        assert_eq!(report.frames.len(), 2);
        assert!(report.loss.terms.keys().all(|k| k.starts_with("frame1/")));

        let cfg = TractrConfig {
            backprop_prev_frame: true,
            ..config()
        };
        let report = pipeline(cfg).run_window(&frames).unwrap();
        assert!(report.loss.terms.keys().any(|k| k.starts_with("frame0/")));
        assert!(report.loss.terms.keys().any(|k| k.starts_with("frame1/")));
    }

    #[test]
    fn oversized_window_is_rejected() {
        let frames: Vec<FrameInput> = (0..3).map(|i| frame(i, Some(FrameTargets::empty()))).collect();
        let err = pipeline(config()).run_window(&frames).unwrap_err();
        assert!(matches!(err, TractrError::MalformedBatch(_)));
    }

    #[test]
    fn denoising_adds_identity_assigned_queries() {
        let cfg = TractrConfig {
            dn_object: true,
            dn_object_groups: 2,
            ..config()
        };
        let mut p = pipeline(cfg);
        let targets = FrameTargets::new(vec![cell(1, 0.2), cell(2, 0.8)]);
        let report = p.process_frame(&frame(0, Some(targets))).unwrap();

        assert_eq!(report.count(QueryPartition::DenoisingObject), 4);
        let assignment = report.assignment.unwrap();
        let dn: Vec<_> = assignment.targets()[3..].to_vec();
        assert_eq!(dn.iter().filter(|t| !t.is_background()).count(), 4);
        // Denoising queries never become identities.
        assert_eq!(report.active_tracks.len(), 2);
    }

    #[test]
    fn train_step_records_the_loss() {
        let mut p = pipeline(config());
        let mut ctx = TrainingContext::from_config(p.config());
        let frames = [frame(0, Some(FrameTargets::new(vec![cell(1, 0.5)])))];
        let (outcome, report) = p.train_step(&mut ctx, &frames).unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert!(report.loss.is_finite());
        assert_eq!(ctx.global_step(), 1);
    }

    #[test]
    fn frames_report_the_window_they_were_decoded_from() {
        let cfg = TractrConfig {
            use_prev_prev_frame: true,
            ..config()
        };
        let mut p = pipeline(cfg);
        let targets = FrameTargets::new(vec![cell(1, 0.2), cell(2, 0.5)]);
        let reports: Vec<FrameReport> = (0..3)
            .map(|i| p.process_frame(&frame(i, Some(targets.clone()))).unwrap())
            .collect();

        assert_eq!(reports[0].window, FrameWindow::default());
        assert!(reports[1].window.prev_prev.tracks.is_empty());
        assert_eq!(reports[1].window.prev.ids(), reports[0].active_tracks);
        assert_eq!(reports[2].window.prev_prev.ids(), reports[0].active_tracks);
        assert_eq!(reports[2].window.prev.ids(), reports[1].active_tracks);
    }

    #[test]
    fn mask_sampling_advances_with_frames_and_steps() {
        let mut p = pipeline(config());
        let targets = FrameTargets::new(vec![cell(1, 0.5)]);
        p.process_frame(&frame(0, Some(targets.clone()))).unwrap();
        p.process_frame(&frame(1, Some(targets.clone()))).unwrap();
        assert_eq!(p.sample_step(), 2);

        let mut ctx = TrainingContext::from_config(p.config());
        let frames = [frame(0, Some(targets))];
        p.train_step(&mut ctx, &frames).unwrap();
        assert_eq!(p.sample_step(), 1);
        p.train_step(&mut ctx, &frames).unwrap();
        assert_eq!(p.sample_step(), MAX_WINDOW_FRAMES as u64 + 1);
    }

    #[test]
    fn frames_report_accuracy_against_ground_truth() {
        use crate::criterion::Accuracy;

        let mut p = pipeline(config());
        let targets = FrameTargets::new(vec![cell(1, 0.2), cell(2, 0.5)]);
        let report = p.process_frame(&frame(0, Some(targets.clone()))).unwrap();
        let accuracy = report.accuracy.unwrap();
        // Two cells found, the third confident proposal sits on nothing.
        assert_eq!(accuracy.bbox, Accuracy::new(2, 3));
        assert_eq!(accuracy.new_cells_bbox, Accuracy::new(2, 2));
        assert_eq!(accuracy.mask, None);

        assert!(p.process_frame(&frame(1, None)).unwrap().accuracy.is_none());

        let frames = [frame(0, Some(targets.clone())), frame(1, Some(targets))];
        let window = p.run_window(&frames).unwrap();
        let mut total = FrameAccuracy::default();
        for f in &window.frames {
            total += f.accuracy.as_ref().unwrap();
        }
        assert_eq!(window.accuracy, total);
    }

    #[test]
    fn windows_reuse_the_arena() {
        let mut p = pipeline(config());
        let targets = FrameTargets::new(vec![cell(1, 0.2), cell(2, 0.8)]);
        let frames = [frame(0, Some(targets.clone())), frame(1, Some(targets))];
        for _ in 0..20 {
            p.run_window(&frames).unwrap();
        }
        assert_eq!(p.pool().num_slots(), 2);
    }
}
