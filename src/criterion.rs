//! Matching, loss assembly and accuracy bookkeeping.

pub mod loss;
pub mod matcher;
pub mod metrics;
pub mod sampling;

pub use loss::{LossAssembler, LossReport, LossWeights, sigmoid_focal_loss};
pub use matcher::{Assignment, HungarianMatcher, MatcherCosts, linear_assignment};
pub use metrics::{Accuracy, AccuracyCounter, FrameAccuracy, mask_iou};
pub use sampling::{PointSampler, SamplePoints};
