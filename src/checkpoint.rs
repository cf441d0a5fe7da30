//! JSON checkpoints and resume with best-effort parameter migration.
//!
//! A checkpoint stores named parameter tensors next to the opaque optimizer
//! state and the learning-rate schedule:
//!
//! ```json
//! { "format_version": 1, "epoch": 12,
//!   "model": { "class_embed.0.weight": { "shape": [2, 288], "values": [..] } },
//!   "optimizer": { .. }, "lr_scheduler": { "last_epoch": 12, .. } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TractrConfig;
use crate::error::CheckpointError;
use crate::integration::{SchedulerState, TrainingContext};

/// Layout version written by [`Checkpoint::save`].
pub const FORMAT_VERSION: u32 = 1;

/// Prefix older checkpoints put in front of every parameter name.
const LEGACY_PREFIX: &str = "detr.";

/// One named parameter, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len])
    }

    fn check(&self, key: &str) -> Result<(), CheckpointError> {
        let expected: usize = self.shape.iter().product();
        if expected != self.values.len() {
            return Err(CheckpointError::Corrupt {
                key: key.to_string(),
                shape: self.shape.clone(),
                len: self.values.len(),
            });
        }
        Ok(())
    }

    /// Number of values per entry of the leading dimension.
    fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }
}

/// Named parameters of a model.
pub type ModelState = BTreeMap<String, ParamTensor>;

/// Everything persisted between training runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    /// Last completed epoch.
    pub epoch: usize,
    pub model: ModelState,
    #[serde(default)]
    pub optimizer: Option<serde_json::Value>,
    #[serde(default)]
    pub lr_scheduler: Option<SchedulerState>,
}

impl Checkpoint {
    pub fn new(epoch: usize, model: ModelState) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            epoch,
            model,
            optimizer: None,
            lr_scheduler: None,
        }
    }

    /// Snapshot at the end of the context's current epoch.
    pub fn from_training(
        ctx: &TrainingContext,
        model: ModelState,
        optimizer: Option<serde_json::Value>,
    ) -> Self {
        Self {
            optimizer,
            lr_scheduler: Some(ctx.scheduler_state()),
            ..Self::new(ctx.epoch(), model)
        }
    }

    /// Write the checkpoint as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let io = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_string(self).map_err(|source| CheckpointError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io)
    }

    /// Read and check a checkpoint written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ckpt: Checkpoint =
            serde_json::from_str(&contents).map_err(|source| CheckpointError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if ckpt.format_version != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: ckpt.format_version,
                supported: FORMAT_VERSION,
            });
        }
        for (key, tensor) in &ckpt.model {
            tensor.check(key)?;
        }
        Ok(ckpt)
    }
}

/// How a checkpoint is merged into a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Restore optimizer and scheduler and continue after the saved epoch.
    pub resume_optim: bool,
    /// Allow the class-neuron shift and the shape migrations.
    pub shift_neuron: bool,
}

impl ResumeOptions {
    pub fn from_config(cfg: &TractrConfig) -> Self {
        Self {
            resume_optim: cfg.resume_optim,
            shift_neuron: cfg.resume_shift_neuron,
        }
    }
}

/// Outcome of [`restore`].
#[derive(Debug, Clone, Default)]
pub struct RestoredState {
    pub model: ModelState,
    /// Parameters absent from the checkpoint, kept at their initial value.
    pub from_scratch: Vec<String>,
    /// Checkpoint parameters the model does not have.
    pub unexpected: Vec<String>,
    /// Parameters rewritten by a migration rule.
    pub migrated: Vec<String>,
    pub optimizer: Option<serde_json::Value>,
    pub lr_scheduler: Option<SchedulerState>,
    /// First epoch to run, when optimizer state was restored.
    pub start_epoch: Option<usize>,
}

impl RestoredState {
    /// Training context continuing where the checkpoint left off.
    pub fn training_context(&self, cfg: &TractrConfig) -> TrainingContext {
        let ctx = TrainingContext::from_config(cfg);
        match self.start_epoch {
            Some(epoch) => ctx.resume_at(epoch),
            None => ctx,
        }
    }
}

/// Merge `checkpoint` into the freshly initialized `model`.
///
/// Missing keys keep their initial value and unknown keys are reported.
/// A shape difference is fatal unless `shift_neuron` allows a migration:
/// `class_embed` rows are truncated, `norm` vectors of half the size are
/// tiled twice. With `shift_neuron`, same-shaped `class_embed` parameters
/// have their neurons shifted so label 0 sits at neuron 0.
pub fn restore(
    model: &ModelState,
    checkpoint: &Checkpoint,
    options: ResumeOptions,
) -> Result<RestoredState, CheckpointError> {
    let stored: BTreeMap<&str, &ParamTensor> = checkpoint
        .model
        .iter()
        .map(|(k, v)| (k.strip_prefix(LEGACY_PREFIX).unwrap_or(k), v))
        .collect();

    let mut restored = RestoredState::default();
    for key in stored.keys().filter(|k| !model.contains_key(**k)) {
        warn!(key = *key, "checkpoint parameter unknown to the model");
        restored.unexpected.push(key.to_string());
    }

    for (key, current) in model {
        let Some(&saved) = stored.get(key.as_str()) else {
            info!(key = %key, shape = ?current.shape, "parameter loaded from scratch");
            restored.from_scratch.push(key.clone());
            restored.model.insert(key.clone(), current.clone());
            continue;
        };
        saved.check(key)?;

        let value = if saved.shape != current.shape {
            let migrated = if options.shift_neuron {
                migrate(key, current, saved)
            } else {
                None
            };
            let value = migrated.ok_or_else(|| CheckpointError::ShapeMismatch {
                key: key.clone(),
                expected: current.shape.clone(),
                found: saved.shape.clone(),
            })?;
            info!(key = %key, from = ?saved.shape, to = ?current.shape, "parameter migrated");
            restored.migrated.push(key.clone());
            value
        } else if options.shift_neuron && key.contains("class_embed") {
            restored.migrated.push(key.clone());
            shift_neurons(saved)
        } else {
            saved.clone()
        };
        restored.model.insert(key.clone(), value);
    }

    if options.resume_optim {
        restored.optimizer = checkpoint.optimizer.clone();
        restored.lr_scheduler = checkpoint.lr_scheduler;
        restored.start_epoch = Some(checkpoint.epoch + 1);
        info!(start_epoch = checkpoint.epoch + 1, "resuming optimizer state");
    }
    Ok(restored)
}

/// Load `cfg.resume` and merge it into `model`, or `None` without resume.
pub fn resume_from_config(
    cfg: &TractrConfig,
    model: &ModelState,
) -> Result<Option<RestoredState>, CheckpointError> {
    let Some(path) = cfg.resume.as_deref() else {
        return Ok(None);
    };
    let checkpoint = Checkpoint::load(path)?;
    restore(model, &checkpoint, ResumeOptions::from_config(cfg)).map(Some)
}

fn migrate(key: &str, current: &ParamTensor, saved: &ParamTensor) -> Option<ParamTensor> {
    if key.contains("norm") && saved.shape.len() == 1 && current.shape == [saved.shape[0] * 2] {
        let values = saved.values.iter().chain(&saved.values).copied().collect();
        return Some(ParamTensor::new(current.shape.clone(), values));
    }
    if key.contains("class_embed")
        && !saved.shape.is_empty()
        && saved.shape.len() == current.shape.len()
        && saved.shape[1..] == current.shape[1..]
        && saved.shape.first() >= current.shape.first()
    {
        let len: usize = current.shape.iter().product();
        return Some(ParamTensor::new(current.shape.clone(), saved.values[..len].to_vec()));
    }
    None
}

/// `new[..n - 1] = old[1..]`, then `new[n - 2] = old[0]`, over rows.
fn shift_neurons(saved: &ParamTensor) -> ParamTensor {
    let row = saved.row_len();
    let n = saved.shape.first().copied().unwrap_or(0);
    let mut values = saved.values.clone();
    if n < 2 || row == 0 {
        return ParamTensor::new(saved.shape.clone(), values);
    }
    values[..(n - 1) * row].copy_from_slice(&saved.values[row..n * row]);
    values[(n - 2) * row..(n - 1) * row].copy_from_slice(&saved.values[..row]);
    ParamTensor::new(saved.shape.clone(), values)
}
