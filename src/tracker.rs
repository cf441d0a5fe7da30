pub mod bbox;
pub mod decoder;
pub mod denoising;
pub mod mask;
pub mod pool;
pub mod prediction;
pub mod proposal;
mod query;
pub mod target;
mod track_state;

pub use bbox::BBox;
pub use decoder::{
    DecoderOutput, DecoderStack, DeformableAttention, LayerOutput, LayerPartition,
    MultiScaleFeatures, RefinementStep, StepOutput,
};
pub use denoising::{DenoisingBatch, DenoisingGenerator, DenoisingSource, NoiseSpec};
pub use mask::mask_to_box;
pub use pool::{CarryOverSummary, FrameSnapshot, FrameWindow, QueryOutcome, QueryPoolManager};
pub use prediction::PredictionSet;
pub use proposal::{EncoderOutput, ProposalStage, Proposals};
pub use query::{Query, QueryKind, QueryPartition, QuerySet, TrackId};
pub use target::{FrameTargets, GroundTruthInstance, QueryTarget};
pub use track_state::TrackState;
