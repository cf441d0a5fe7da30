//! Queries fed to the decoder and the ordered set they are assembled into.

use std::fmt;
use std::ops::Range;

use ndarray::{Array1, Array2};

use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::BBox;
use crate::tracker::target::QueryTarget;

/// Stable index of a track identity in the pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub(crate) usize);

impl TrackId {
    /// Position of the identity in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Payload-free tag grouping queries of the same kind.
///
/// The declaration order is the order of the spans in a [`QuerySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryPartition {
    Track,
    Object,
    DenoisingTrack,
    DenoisingObject,
    DenoisingEnc,
}

impl QueryPartition {
    /// All partitions in span order.
    pub const ALL: [QueryPartition; 5] = [
        QueryPartition::Track,
        QueryPartition::Object,
        QueryPartition::DenoisingTrack,
        QueryPartition::DenoisingObject,
        QueryPartition::DenoisingEnc,
    ];

    /// Short name used in loss term keys and logs.
    pub fn name(self) -> &'static str {
        match self {
            QueryPartition::Track => "track",
            QueryPartition::Object => "object",
            QueryPartition::DenoisingTrack => "dn_track",
            QueryPartition::DenoisingObject => "dn_object",
            QueryPartition::DenoisingEnc => "dn_enc",
        }
    }

    pub fn is_denoising(self) -> bool {
        matches!(
            self,
            QueryPartition::DenoisingTrack
                | QueryPartition::DenoisingObject
                | QueryPartition::DenoisingEnc
        )
    }

    /// Whether queries of this partition follow a cell identity across frames.
    pub fn is_track_stage(self) -> bool {
        matches!(self, QueryPartition::Track | QueryPartition::DenoisingTrack)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QueryPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a query together with the data its lifecycle needs.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    /// Fresh detection proposal without identity.
    Object,
    /// Identity carried from the previous frame.
    Track {
        id: TrackId,
        /// Dataset track id followed during training.
        label: Option<u64>,
    },
    /// Noised copy of a track query.
    DenoisingTrack { group: usize, target: QueryTarget },
    /// Noised ground-truth box posing as an object query.
    DenoisingObject { group: usize, target: QueryTarget },
    /// Noised ground-truth box placed next to the encoder proposals.
    DenoisingEnc { group: usize, target: QueryTarget },
}

impl QueryKind {
    pub fn partition(&self) -> QueryPartition {
        match self {
            QueryKind::Object => QueryPartition::Object,
            QueryKind::Track { .. } => QueryPartition::Track,
            QueryKind::DenoisingTrack { .. } => QueryPartition::DenoisingTrack,
            QueryKind::DenoisingObject { .. } => QueryPartition::DenoisingObject,
            QueryKind::DenoisingEnc { .. } => QueryPartition::DenoisingEnc,
        }
    }

    /// Target a denoising query was generated from.
    pub fn denoising_target(&self) -> Option<QueryTarget> {
        match self {
            QueryKind::DenoisingTrack { target, .. }
            | QueryKind::DenoisingObject { target, .. }
            | QueryKind::DenoisingEnc { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn track_id(&self) -> Option<TrackId> {
        match self {
            QueryKind::Track { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Denoising partition and group, `None` for matching queries.
    pub fn denoising_group(&self) -> Option<(QueryPartition, usize)> {
        match self {
            QueryKind::DenoisingTrack { group, .. }
            | QueryKind::DenoisingObject { group, .. }
            | QueryKind::DenoisingEnc { group, .. } => Some((self.partition(), *group)),
            _ => None,
        }
    }
}

/// One decoder query.
#[derive(Debug, Clone)]
pub struct Query {
    /// Content embedding.
    pub embedding: Array1<f32>,
    /// Reference box the first decoder layer refines.
    pub reference: BBox,
    pub kind: QueryKind,
    /// Whether the query may represent a dividing cell.
    pub divisible: bool,
}

impl Query {
    /// Create a query. Only track-stage queries are divisible.
    pub fn new(embedding: Array1<f32>, reference: BBox, kind: QueryKind) -> Self {
        let divisible = kind.partition().is_track_stage();
        Self {
            embedding,
            reference,
            kind,
            divisible,
        }
    }

    pub fn partition(&self) -> QueryPartition {
        self.kind.partition()
    }
}

/// Ordered queries of one frame, one contiguous span per partition.
///
/// Decoder output row `i` belongs to query `i`.
#[derive(Debug, Clone)]
pub struct QuerySet {
    queries: Vec<Query>,
    spans: [Range<usize>; 5],
    hidden_dim: usize,
}

impl QuerySet {
    /// Build a set from queries already in span order.
    ///
    /// # Errors
    ///
    /// [`TractrError::MalformedBatch`] when partitions are interleaved or out
    /// of order, [`TractrError::ShapeMismatch`] when an embedding width differs
    /// from `hidden_dim`.
    pub fn new(queries: Vec<Query>, hidden_dim: usize) -> TractrResult<Self> {
        let mut spans: [Range<usize>; 5] = Default::default();
        let mut cursor = 0;
        for partition in QueryPartition::ALL {
            let start = cursor;
            while cursor < queries.len() && queries[cursor].partition() == partition {
                cursor += 1;
            }
            spans[partition.slot()] = start..cursor;
        }
        if cursor != queries.len() {
            return Err(TractrError::malformed(format!(
                "query {} ({}) is out of partition order",
                cursor,
                queries[cursor].partition()
            )));
        }
        if let Some(bad) = queries.iter().find(|q| q.embedding.len() != hidden_dim) {
            return Err(TractrError::shape_mismatch(
                "query embedding",
                vec![hidden_dim],
                vec![bad.embedding.len()],
            ));
        }
        Ok(Self {
            queries,
            spans,
            hidden_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub fn get(&self, index: usize) -> Option<&Query> {
        self.queries.get(index)
    }

    /// Row range occupied by `partition`.
    pub fn span(&self, partition: QueryPartition) -> Range<usize> {
        self.spans[partition.slot()].clone()
    }

    pub fn count(&self, partition: QueryPartition) -> usize {
        self.spans[partition.slot()].len()
    }

    /// Partitions holding at least one query, in span order.
    pub fn active_partitions(&self) -> impl Iterator<Item = QueryPartition> + '_ {
        QueryPartition::ALL
            .into_iter()
            .filter(|p| self.count(*p) > 0)
    }

    /// Queries of one partition with their row index.
    pub fn iter_partition(
        &self,
        partition: QueryPartition,
    ) -> impl Iterator<Item = (usize, &Query)> + '_ {
        let span = self.span(partition);
        self.queries[span.clone()]
            .iter()
            .enumerate()
            .map(move |(offset, q)| (span.start + offset, q))
    }

    /// Embedding matrix `[Q, hidden_dim]`.
    pub fn embeddings(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.queries.len(), self.hidden_dim), |(i, j)| {
            self.queries[i].embedding[j]
        })
    }

    /// Self-attention mask `[Q, Q]`; `true` blocks row `i` from attending
    /// to column `j`.
    ///
    /// Track and object queries never see denoising queries, which are
    /// built from ground truth. A denoising group sees the matching queries
    /// and itself, but no other group of any denoising partition.
    pub fn attention_mask(&self) -> Array2<bool> {
        let groups: Vec<Option<(QueryPartition, usize)>> = self
            .queries
            .iter()
            .map(|q| q.kind.denoising_group())
            .collect();
        let n = groups.len();
        Array2::from_shape_fn((n, n), |(i, j)| match (groups[i], groups[j]) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(row), Some(col)) => row != col,
        })
    }

    /// Reference boxes `[Q, 4]` in CXCYWH.
    pub fn references(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.queries.len(), 4), |(i, j)| {
            self.queries[i].reference.to_cxcywh()[j]
        })
    }
}
