//! Orchestration of the tracker and criterion over frame sequences.
//!
//! This module provides the attention backends the decoder runs on, the
//! per-step training state and the pipeline that walks a frame window.

mod builder;
mod context;
mod deform_attn;
mod pipeline;

pub use builder::InstanceBuilder;
pub use context::{SchedulerState, StepOutcome, TrainingContext};
pub use deform_attn::{CpuDeformAttn, attention_for_device, sampling_matrix};
pub use pipeline::{FrameInput, FrameReport, TrackingPipeline, WindowReport};

#[cfg(feature = "burn-backend")]
mod burn_backend;

#[cfg(feature = "burn-backend")]
pub use burn_backend::BurnDeformAttn;
