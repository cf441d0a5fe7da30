//! Object query proposals, either learned or selected from encoder tokens.

use ndarray::{Array1, Array2};
use tracing::trace;

use crate::error::{TractrError, TractrResult};
use crate::tracker::bbox::BBox;
use crate::tracker::prediction::PredictionSet;
use crate::tracker::query::{Query, QueryKind};

/// Per-token output of the external encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Token memory `[N, D]`.
    pub memory: Array2<f32>,
    /// Token class logits `[N, C]`.
    pub logits: Array2<f32>,
    /// Token boxes `[N, 4]`, normalized CXCYWH.
    pub boxes: Array2<f32>,
}

impl EncoderOutput {
    pub fn new(memory: Array2<f32>, logits: Array2<f32>, boxes: Array2<f32>) -> TractrResult<Self> {
        let n = memory.nrows();
        if logits.nrows() != n {
            return Err(TractrError::shape_mismatch(
                "encoder logits",
                vec![n, logits.ncols()],
                logits.shape().to_vec(),
            ));
        }
        if boxes.dim() != (n, 4) {
            return Err(TractrError::shape_mismatch(
                "encoder boxes",
                vec![n, 4],
                boxes.shape().to_vec(),
            ));
        }
        Ok(Self {
            memory,
            logits,
            boxes,
        })
    }

    pub fn len(&self) -> usize {
        self.memory.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objectness of a token: its highest class logit.
    fn objectness(&self, token: usize) -> f32 {
        self.logits
            .row(token)
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(f32::NEG_INFINITY, f32::max)
    }

    /// Indices of the `k` most object-like tokens, ties broken by lower index.
    pub fn top_k(&self, k: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            self.objectness(b)
                .total_cmp(&self.objectness(a))
                .then(a.cmp(&b))
        });
        order.truncate(k);
        order
    }
}

/// Object queries of one frame.
#[derive(Debug, Clone)]
pub struct Proposals {
    pub queries: Vec<Query>,
    /// Encoder-side predictions of the selected tokens, for the two-stage loss.
    pub predictions: Option<PredictionSet>,
    /// Encoder token behind each query.
    pub tokens: Vec<usize>,
}

/// Source of object queries.
#[derive(Debug, Clone)]
pub enum ProposalStage {
    /// Fixed learned embeddings and reference boxes.
    Learned {
        embeddings: Array2<f32>,
        boxes: Array2<f32>,
    },
    /// Top-scoring encoder tokens.
    TwoStage {
        num_queries: usize,
        /// Learned content table used instead of token memory.
        table: Option<Array2<f32>>,
    },
}

impl ProposalStage {
    /// Single-stage proposals from `[Q, D]` embeddings and `[Q, 4]` boxes.
    pub fn learned(embeddings: Array2<f32>, boxes: Array2<f32>) -> TractrResult<Self> {
        if boxes.dim() != (embeddings.nrows(), 4) {
            return Err(TractrError::shape_mismatch(
                "learned reference boxes",
                vec![embeddings.nrows(), 4],
                boxes.shape().to_vec(),
            ));
        }
        Ok(ProposalStage::Learned { embeddings, boxes })
    }

    /// Two-stage proposals; `table` must hold at least `num_queries` rows.
    pub fn two_stage(num_queries: usize, table: Option<Array2<f32>>) -> TractrResult<Self> {
        if let Some(t) = &table {
            if t.nrows() < num_queries {
                return Err(TractrError::shape_mismatch(
                    "query embedding table",
                    vec![num_queries, t.ncols()],
                    t.shape().to_vec(),
                ));
            }
        }
        Ok(ProposalStage::TwoStage { num_queries, table })
    }

    pub fn is_two_stage(&self) -> bool {
        matches!(self, ProposalStage::TwoStage { .. })
    }

    /// Produce the object queries of a frame.
    ///
    /// The two-stage variant needs the encoder output and fails without it.
    pub fn propose(&self, encoder: Option<&EncoderOutput>) -> TractrResult<Proposals> {
        match self {
            ProposalStage::Learned { embeddings, boxes } => {
                let queries = embeddings
                    .outer_iter()
                    .zip(boxes.outer_iter())
                    .map(|(e, b)| {
                        let reference = BBox::new(b[0], b[1], b[2], b[3]);
                        Query::new(e.to_owned(), reference, QueryKind::Object)
                    })
                    .collect();
                Ok(Proposals {
                    queries,
                    predictions: None,
                    tokens: Vec::new(),
                })
            }
            ProposalStage::TwoStage { num_queries, table } => {
                let encoder = encoder.ok_or_else(|| {
                    TractrError::malformed("two-stage proposals need the encoder output")
                })?;
                let tokens = encoder.top_k(*num_queries);
                let mut queries = Vec::with_capacity(tokens.len());
                for (rank, &token) in tokens.iter().enumerate() {
                    let embedding: Array1<f32> = match table {
                        Some(t) => t.row(rank).to_owned(),
                        None => encoder.memory.row(token).to_owned(),
                    };
                    let b = encoder.boxes.row(token);
                    let reference = BBox::new(b[0], b[1], b[2], b[3]);
                    queries.push(Query::new(embedding, reference, QueryKind::Object));
                }
                let predictions = PredictionSet::new(
                    encoder.logits.select(ndarray::Axis(0), &tokens),
                    PredictionSet::pad_boxes(&encoder.boxes.select(ndarray::Axis(0), &tokens)),
                    None,
                    None,
                )?;
                trace!(selected = tokens.len(), available = encoder.len(), "two-stage proposals");
                Ok(Proposals {
                    queries,
                    predictions: Some(predictions),
                    tokens,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn encoder() -> EncoderOutput {
        EncoderOutput::new(
            array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]],
            array![[0.1], [2.0], [-1.0], [2.0]],
            array![
                [0.1, 0.1, 0.1, 0.1],
                [0.2, 0.2, 0.1, 0.1],
                [0.3, 0.3, 0.1, 0.1],
                [0.4, 0.4, 0.1, 0.1]
            ],
        )
        .unwrap()
    }

    #[test]
    fn picks_top_tokens_with_lower_index_on_ties() {
        assert_eq!(encoder().top_k(3), vec![1, 3, 0]);
    }

    #[test]
    fn two_stage_uses_token_memory_and_boxes() {
        let stage = ProposalStage::two_stage(2, None).unwrap();
        let proposals = stage.propose(Some(&encoder())).unwrap();
        assert_eq!(proposals.tokens, vec![1, 3]);
        assert_eq!(proposals.queries[1].embedding.to_vec(), vec![4.0, 4.0]);
        assert_eq!(proposals.queries[0].reference, BBox::new(0.2, 0.2, 0.1, 0.1));
        let preds = proposals.predictions.unwrap();
        assert_eq!(preds.len(), 2);
        assert!(preds.secondary_box(0).is_empty());
    }

    #[test]
    fn learned_table_replaces_token_memory() {
        let table = array![[9.0, 9.0], [8.0, 8.0]];
        let stage = ProposalStage::two_stage(2, Some(table)).unwrap();
        let proposals = stage.propose(Some(&encoder())).unwrap();
        assert_eq!(proposals.queries[0].embedding.to_vec(), vec![9.0, 9.0]);
        assert_eq!(proposals.queries[0].reference, BBox::new(0.2, 0.2, 0.1, 0.1));
    }

    #[test]
    fn two_stage_without_encoder_is_malformed() {
        let stage = ProposalStage::two_stage(2, None).unwrap();
        assert!(matches!(
            stage.propose(None),
            Err(TractrError::MalformedBatch(_))
        ));
    }

    #[test]
    fn fewer_tokens_than_queries() {
        let stage = ProposalStage::two_stage(10, None).unwrap();
        assert_eq!(stage.propose(Some(&encoder())).unwrap().queries.len(), 4);
    }

    #[test]
    fn learned_proposals_are_object_queries() {
        let stage =
            ProposalStage::learned(Array2::zeros((3, 2)), Array2::from_elem((3, 4), 0.5)).unwrap();
        let proposals = stage.propose(None).unwrap();
        assert_eq!(proposals.queries.len(), 3);
        assert!(proposals.predictions.is_none());
        assert!(proposals.queries.iter().all(|q| q.kind == QueryKind::Object));
    }
}
