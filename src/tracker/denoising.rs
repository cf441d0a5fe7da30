//! Denoising query generation.
//!
//! Denoising queries are noised copies of boxes whose target is known by
//! construction, so they bypass the matcher: the assignment of every query
//! is the target it was generated from. Noise is drawn fresh on every
//! forward pass from a seeded [`StdRng`].

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::TractrConfig;
use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::{BBox, MIN_BOX_SIZE};
use crate::tracker::query::{Query, QueryKind, QueryPartition};
use crate::tracker::target::{FrameTargets, QueryTarget};

/// Noise magnitudes for one denoising kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseSpec {
    /// Centre perturbation limit, relative to half the box size.
    pub l1: f32,
    /// Size perturbation limit, relative to the box size.
    pub l2: f32,
    /// Number of independent noise realizations.
    pub groups: usize,
    /// Per-dimension embedding perturbation limit.
    pub embedding_noise: f32,
}

impl NoiseSpec {
    /// Noise for `partition`, or `None` when that kind is switched off.
    pub fn for_partition(cfg: &TractrConfig, partition: QueryPartition) -> Option<Self> {
        let (enabled, l1, l2, groups) = match partition {
            QueryPartition::DenoisingTrack => (
                cfg.tracking && cfg.dn_track,
                cfg.dn_track_l1,
                cfg.dn_track_l2,
                cfg.track_denoising_groups(),
            ),
            QueryPartition::DenoisingObject => (
                cfg.dn_object,
                cfg.dn_object_l1,
                cfg.dn_object_l2,
                cfg.dn_object_groups,
            ),
            QueryPartition::DenoisingEnc => (
                cfg.two_stage && cfg.dn_enc,
                cfg.dn_enc_l1,
                cfg.dn_enc_l2,
                cfg.dn_enc_groups,
            ),
            QueryPartition::Track | QueryPartition::Object => return None,
        };
        (enabled && groups > 0).then_some(Self {
            l1,
            l2,
            groups,
            embedding_noise: cfg.tgt_noise,
        })
    }
}

/// What a denoising query is generated from.
#[derive(Debug, Clone)]
pub struct DenoisingSource {
    /// Clean box to perturb.
    pub reference: BBox,
    /// Clean content embedding, zeros when absent.
    pub embedding: Option<Array1<f32>>,
    /// Target the noised copies are supervised towards.
    pub target: QueryTarget,
}

impl DenoisingSource {
    /// One source per ground-truth instance.
    pub fn from_targets(targets: &FrameTargets) -> Vec<Self> {
        targets
            .instances
            .iter()
            .enumerate()
            .map(|(idx, inst)| Self {
                reference: inst.bbox,
                embedding: None,
                target: QueryTarget::Single(idx),
            })
            .collect()
    }
}

/// Queries of one denoising kind, `groups x sources` of them.
#[derive(Debug, Clone)]
pub struct DenoisingBatch {
    pub partition: QueryPartition,
    pub queries: Vec<Query>,
}

impl DenoisingBatch {
    pub fn empty(partition: QueryPartition) -> Self {
        Self {
            partition,
            queries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Target of every query in generation order.
    pub fn assignment(&self) -> Vec<QueryTarget> {
        self.queries
            .iter()
            .map(|q| q.kind.denoising_target().unwrap_or_default())
            .collect()
    }
}

/// Seeded generator of noised queries.
#[derive(Debug, Clone)]
pub struct DenoisingGenerator {
    rng: StdRng,
    hidden_dim: usize,
}

impl DenoisingGenerator {
    pub fn new(seed: u64, hidden_dim: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            hidden_dim,
        }
    }

    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self::new(cfg.seed, cfg.hidden_dim)
    }

    /// Generate `spec.groups` noised copies of every source.
    ///
    /// Group `g` occupies rows `g * sources.len()..(g + 1) * sources.len()`.
    pub fn generate(
        &mut self,
        partition: QueryPartition,
        sources: &[DenoisingSource],
        spec: &NoiseSpec,
    ) -> TractrResult<DenoisingBatch> {
        if !partition.is_denoising() {
            return Err(TractrError::malformed(format!(
                "cannot generate denoising queries for the {partition} partition"
            )));
        }
        let mut queries = Vec::with_capacity(spec.groups * sources.len());
        for group in 0..spec.groups {
            for source in sources {
                let embedding = match &source.embedding {
                    Some(e) if e.len() != self.hidden_dim => {
                        return Err(TractrError::shape_mismatch(
                            "denoising source embedding",
                            vec![self.hidden_dim],
                            vec![e.len()],
                        ));
                    }
                    Some(e) => e.clone(),
                    None => Array1::zeros(self.hidden_dim),
                };
                let embedding = self.perturb_embedding(embedding, spec.embedding_noise);
                let reference = self.perturb_box(&source.reference, spec);
                let target = source.target;
                let kind = match partition {
                    QueryPartition::DenoisingTrack => QueryKind::DenoisingTrack { group, target },
                    QueryPartition::DenoisingObject => {
                        QueryKind::DenoisingObject { group, target }
                    }
                    _ => QueryKind::DenoisingEnc { group, target },
                };
                queries.push(Query::new(embedding, reference, kind));
            }
        }
        debug!(
            partition = partition.name(),
            groups = spec.groups,
            sources = sources.len(),
            "generated denoising queries"
        );
        Ok(DenoisingBatch { partition, queries })
    }

    /// Move the centre by up to `l1 * size / 2` and scale the size by up to
    /// `1 +/- l2`, then clamp into the unit square.
    pub fn perturb_box(&mut self, bbox: &BBox, spec: &NoiseSpec) -> BBox {
        let mut u = || self.rng.gen_range(-1.0f32..=1.0);
        let cx = bbox.cx + u() * spec.l1 * bbox.w / 2.0;
        let cy = bbox.cy + u() * spec.l1 * bbox.h / 2.0;
        let w = (bbox.w * (1.0 + u() * spec.l2)).max(MIN_BOX_SIZE);
        let h = (bbox.h * (1.0 + u() * spec.l2)).max(MIN_BOX_SIZE);
        BBox::new(cx, cy, w, h).clamp_unit()
    }

    fn perturb_embedding(&mut self, mut embedding: Array1<f32>, magnitude: f32) -> Array1<f32> {
        if magnitude > 0.0 {
            for v in embedding.iter_mut() {
                *v += self.rng.gen_range(-magnitude..=magnitude);
            }
        }
        embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::target::GroundTruthInstance;

    fn targets(n: usize) -> FrameTargets {
        FrameTargets::new(
            (0..n)
                .map(|i| GroundTruthInstance {
                    bbox: BBox::new(0.2 + 0.1 * i as f32, 0.5, 0.08, 0.1),
                    mask: None,
                    class: 0,
                    track_id: i as u64,
                    divided_from: None,
                })
                .collect(),
        )
    }

    fn spec(groups: usize) -> NoiseSpec {
        NoiseSpec {
            l1: 0.4,
            l2: 0.4,
            groups,
            embedding_noise: 0.1,
        }
    }

    #[test]
    fn produces_groups_times_sources_queries() {
        let mut generator = DenoisingGenerator::new(7, 16);
        let sources = DenoisingSource::from_targets(&targets(3));
        let batch = generator
            .generate(QueryPartition::DenoisingObject, &sources, &spec(2))
            .unwrap();
        assert_eq!(batch.len(), 6);
        assert!(
            batch
                .queries
                .iter()
                .all(|q| q.partition() == QueryPartition::DenoisingObject)
        );
    }

    #[test]
    fn assignment_round_trips_to_source_targets() {
        let mut generator = DenoisingGenerator::new(7, 16);
        let sources = DenoisingSource::from_targets(&targets(4));
        let batch = generator
            .generate(QueryPartition::DenoisingEnc, &sources, &spec(3))
            .unwrap();
        let assignment = batch.assignment();
        for (row, target) in assignment.iter().enumerate() {
            assert_eq!(*target, sources[row % sources.len()].target);
        }
    }

    #[test]
    fn noise_stays_within_bounds() {
        let mut generator = DenoisingGenerator::new(3, 4);
        let clean = BBox::new(0.5, 0.5, 0.2, 0.1);
        let s = spec(1);
        for _ in 0..200 {
            let noised = generator.perturb_box(&clean, &s);
            assert!((noised.cx - clean.cx).abs() <= s.l1 * clean.w / 2.0 + 1e-5);
            assert!((noised.cy - clean.cy).abs() <= s.l1 * clean.h / 2.0 + 1e-5);
            assert!(noised.w <= clean.w * (1.0 + s.l2) + 1e-5);
            assert!(noised.w >= clean.w * (1.0 - s.l2) - 1e-5);
        }
    }

    #[test]
    fn embedding_noise_is_bounded() {
        let mut generator = DenoisingGenerator::new(11, 8);
        let sources = vec![DenoisingSource {
            reference: BBox::new(0.5, 0.5, 0.1, 0.1),
            embedding: Some(Array1::from_elem(8, 1.0)),
            target: QueryTarget::Background,
        }];
        let batch = generator
            .generate(QueryPartition::DenoisingTrack, &sources, &spec(1))
            .unwrap();
        let e = &batch.queries[0].embedding;
        assert!(e.iter().all(|v| (v - 1.0).abs() <= 0.1 + 1e-6));
        assert!(batch.queries[0].divisible);
    }

    #[test]
    fn same_seed_gives_same_noise() {
        let sources = DenoisingSource::from_targets(&targets(2));
        let a = DenoisingGenerator::new(5, 4)
            .generate(QueryPartition::DenoisingObject, &sources, &spec(2))
            .unwrap();
        let b = DenoisingGenerator::new(5, 4)
            .generate(QueryPartition::DenoisingObject, &sources, &spec(2))
            .unwrap();
        for (qa, qb) in a.queries.iter().zip(&b.queries) {
            assert_eq!(qa.reference, qb.reference);
        }
    }

    #[test]
    fn disabled_kinds_have_no_noise() {
        let mut cfg = TractrConfig::default();
        cfg.dn_track = false;
        cfg.dn_object = false;
        cfg.dn_enc = false;
        for p in [
            QueryPartition::DenoisingTrack,
            QueryPartition::DenoisingObject,
            QueryPartition::DenoisingEnc,
        ] {
            assert!(NoiseSpec::for_partition(&cfg, p).is_none());
        }
        cfg.dn_track = true;
        cfg.dn_track_group = true;
        let track = NoiseSpec::for_partition(&cfg, QueryPartition::DenoisingTrack).unwrap();
        assert_eq!(track.groups, cfg.dn_track_groups);
    }

    #[test]
    fn non_denoising_partition_is_rejected() {
        let mut generator = DenoisingGenerator::new(1, 4);
        assert!(
            generator
                .generate(QueryPartition::Object, &[], &spec(1))
                .is_err()
        );
    }
}
