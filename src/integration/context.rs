//! Explicit training state threaded through the step loop.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TractrConfig;
use crate::criterion::LossReport;
use crate::error::{TractrError, TractrResult};

/// Multiplier applied to the learning rates every `lr_drop` epochs.
const LR_GAMMA: f64 = 0.1;

/// What happened to one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The loss was finite and the step counts.
    Applied,
    /// The loss was NaN or infinite; gradients must be discarded.
    Skipped,
}

/// Scheduler state stored in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Number of completed epochs.
    pub last_epoch: usize,
    pub step_size: usize,
    pub gamma: f64,
}

/// Epoch, step and learning-rate bookkeeping for one training run.
///
/// Epochs are 1-based. The learning rate follows a step schedule:
/// `lr * 0.1^((epoch - 1) / lr_drop)`.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    epoch: usize,
    start_epoch: usize,
    epochs: usize,
    global_step: u64,
    base_lr: f64,
    base_lr_backbone: f64,
    lr_drop: usize,
    max_nonfinite: usize,
    consecutive_nonfinite: usize,
    skipped_steps: u64,
}

impl TrainingContext {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            epoch: 1,
            start_epoch: 1,
            epochs: cfg.epochs,
            global_step: 0,
            base_lr: cfg.lr,
            base_lr_backbone: cfg.lr_backbone,
            lr_drop: cfg.lr_drop,
            max_nonfinite: cfg.max_nonfinite_steps,
            consecutive_nonfinite: 0,
            skipped_steps: 0,
        }
    }

    /// Continue a resumed run at `start_epoch`.
    pub fn resume_at(mut self, start_epoch: usize) -> Self {
        self.start_epoch = start_epoch.max(1);
        self.epoch = self.start_epoch;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn consecutive_nonfinite(&self) -> usize {
        self.consecutive_nonfinite
    }

    fn decay(&self) -> f64 {
        if self.lr_drop == 0 {
            return 1.0;
        }
        let drops = (self.epoch.saturating_sub(1) / self.lr_drop) as i32;
        LR_GAMMA.powi(drops)
    }

    /// Learning rate of the transformer parameters for the current epoch.
    pub fn lr(&self) -> f64 {
        self.base_lr * self.decay()
    }

    /// Learning rate of the backbone for the current epoch.
    pub fn lr_backbone(&self) -> f64 {
        self.base_lr_backbone * self.decay()
    }

    /// Account for the loss of one step.
    ///
    /// A non-finite total skips the step. Once more than
    /// `max_nonfinite_steps` steps in a row were skipped the run is aborted
    /// with [`TractrError::TooManyNonFinite`].
    pub fn record_loss(&mut self, report: &LossReport) -> TractrResult<StepOutcome> {
        self.global_step += 1;
        if report.is_finite() {
            self.consecutive_nonfinite = 0;
            return Ok(StepOutcome::Applied);
        }

        self.consecutive_nonfinite += 1;
        self.skipped_steps += 1;
        let err = TractrError::NonFiniteLoss {
            step: self.global_step,
            value: report.total,
        };
        warn!(
            %err,
            consecutive = self.consecutive_nonfinite,
            limit = self.max_nonfinite,
            "skipping step"
        );
        if self.consecutive_nonfinite > self.max_nonfinite {
            return Err(TractrError::TooManyNonFinite {
                consecutive: self.consecutive_nonfinite,
            });
        }
        Ok(StepOutcome::Skipped)
    }

    /// Close the current epoch. Returns `false` once the run is complete.
    pub fn end_epoch(&mut self) -> bool {
        info!(
            epoch = self.epoch,
            global_step = self.global_step,
            skipped = self.skipped_steps,
            lr = self.lr(),
            "epoch finished"
        );
        self.epoch += 1;
        self.epoch <= self.epochs
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.epoch.saturating_sub(1),
            step_size: self.lr_drop,
            gamma: LR_GAMMA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn report(total: f32) -> LossReport {
        LossReport {
            total,
            ..LossReport::default()
        }
    }

    fn context(max_nonfinite_steps: usize) -> TrainingContext {
        let cfg = TractrConfig {
            lr: 1e-3,
            lr_drop: 2,
            epochs: 4,
            max_nonfinite_steps,
            ..TractrConfig::default()
        };
        TrainingContext::from_config(&cfg)
    }

    #[test]
    fn learning_rate_steps_down() {
        let mut ctx = context(5);
        assert_relative_eq!(ctx.lr(), 1e-3);
        assert!(ctx.end_epoch());
        assert_relative_eq!(ctx.lr(), 1e-3);
        assert!(ctx.end_epoch());
        assert_relative_eq!(ctx.lr(), 1e-4, max_relative = 1e-9);
        assert!(ctx.end_epoch());
        assert!(!ctx.end_epoch());
    }

    #[test]
    fn nonfinite_losses_are_skipped_then_fatal() {
        let mut ctx = context(2);
        assert_eq!(ctx.record_loss(&report(f32::NAN)).unwrap(), StepOutcome::Skipped);
        assert_eq!(ctx.record_loss(&report(f32::INFINITY)).unwrap(), StepOutcome::Skipped);
        let err = ctx.record_loss(&report(f32::NAN)).unwrap_err();
        assert!(matches!(err, TractrError::TooManyNonFinite { consecutive: 3 }));
        assert_eq!(ctx.global_step(), 3);
    }

    #[test]
    fn finite_loss_resets_the_counter() {
        let mut ctx = context(1);
        ctx.record_loss(&report(f32::NAN)).unwrap();
        assert_eq!(ctx.record_loss(&report(0.5)).unwrap(), StepOutcome::Applied);
        assert_eq!(ctx.consecutive_nonfinite(), 0);
        assert_eq!(ctx.record_loss(&report(f32::NAN)).unwrap(), StepOutcome::Skipped);
        assert_eq!(ctx.skipped_steps(), 2);
    }

    #[test]
    fn resumed_run_keeps_the_schedule() {
        let ctx = context(5).resume_at(3);
        assert_eq!(ctx.epoch(), 3);
        assert_relative_eq!(ctx.lr(), 1e-4, max_relative = 1e-9);
        assert_eq!(ctx.scheduler_state().last_epoch, 2);
    }
}
