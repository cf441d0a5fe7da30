//! Query lifecycle, matching and loss assembly for transformer-based cell
//! tracking.
//!
//! A frame is decoded from a query set made of carried track queries,
//! fresh object proposals and denoising queries. The Hungarian matcher
//! assigns the decoder output to ground truth, the loss assembler sums the
//! configured terms over layers and query partitions, and the query pool
//! carries matched identities (and the daughters of dividing cells) into
//! the next frame.
//!
//! # Example
//!
//! ```ignore
//! use cell_tractr::{TractrConfig, TrackingPipeline, CpuDeformAttn};
//!
//! let cfg = TractrConfig::from_json(path)?;
//! let mut pipeline = TrackingPipeline::new(cfg, decoder, proposals, CpuDeformAttn)?;
//! let report = pipeline.run_window(&frames)?;
//! println!("loss {}", report.loss.total);
//! ```

pub mod checkpoint;
pub mod config;
pub mod criterion;
pub mod error;
pub mod integration;
pub mod tracker;

pub use checkpoint::{Checkpoint, ParamTensor, ResumeOptions, RestoredState};
pub use config::{Device, TractrConfig};
pub use criterion::{Assignment, HungarianMatcher, LossAssembler, LossReport};
pub use error::{CheckpointError, ConfigError, TractrError, TractrResult};
pub use integration::{
    CpuDeformAttn, FrameInput, FrameReport, InstanceBuilder, TrackingPipeline, TrainingContext,
    WindowReport,
};
pub use tracker::{
    BBox, DecoderStack, DeformableAttention, FrameTargets, GroundTruthInstance, PredictionSet,
    ProposalStage, QueryPartition, QueryPoolManager, QuerySet, RefinementStep,
};
