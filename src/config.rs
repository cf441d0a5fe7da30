//! Training and tracking configuration.
//!
//! [`TractrConfig`] is a flat key-value document. Every toggle of the query
//! pool, denoising generator, proposal stage, decoder partition, matcher and
//! loss assembler lives here next to the standard optimization settings.
//! Unknown keys are rejected when the document is parsed and contradictory
//! toggles are rejected by [`TractrConfig::validate`], so a bad configuration
//! fails at startup instead of at the first training step.
//!
//! ```rust
//! use cell_tractr::config::TractrConfig;
//!
//! let cfg = TractrConfig::from_json_str(r#"{ "dec_layers": 4, "CoMOT": true }"#).unwrap();
//! assert_eq!(cfg.dec_layers, 4);
//! assert!(TractrConfig::from_json_str(r#"{ "dec_layer": 4 }"#).is_err());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the deformable attention operator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Reference CPU kernel.
    #[default]
    Cpu,
    /// Burn kernel on the wgpu backend (Vulkan, Metal, DX12 or CUDA-capable
    /// adapters). `"cuda"` is accepted as an alias.
    #[serde(alias = "cuda")]
    Gpu,
}

/// Complete configuration of a Cell-TRACTR run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TractrConfig {
    // -----------------------------------------------------------------------
    // Model shape
    // -----------------------------------------------------------------------
    /// Width of query embeddings.
    pub hidden_dim: usize,
    /// Number of object queries (two-stage proposals) per frame.
    pub num_queries: usize,
    /// Number of foreground classes scored by the class head.
    pub num_classes: usize,
    /// Number of decoder layers.
    pub dec_layers: usize,
    /// Number of encoder feature levels fed to the attention operator.
    pub num_feature_levels: usize,

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------
    /// Carry track queries across frames.
    pub tracking: bool,
    /// Train on a prev_prev/prev/cur window instead of prev/cur.
    pub use_prev_prev_frame: bool,
    /// Let the loss of earlier window frames count towards the step.
    pub backprop_prev_frame: bool,
    /// Frames a track identity may go unmatched before it is retired.
    pub track_grace_frames: u32,
    /// Score threshold for keeping, dividing and promoting queries at inference.
    pub cls_threshold: f32,
    /// IoU a confident prediction needs to count as correct in the accuracy
    /// bookkeeping.
    pub iou_threshold: f32,

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------
    /// Seed object queries from encoder proposals.
    pub two_stage: bool,
    /// Take proposal content from a learned table instead of encoder memory.
    pub init_enc_queries_embeddings: bool,
    /// Rebuild track reference boxes from the predicted mask.
    pub init_boxes_from_masks: bool,

    // -----------------------------------------------------------------------
    // Masks
    // -----------------------------------------------------------------------
    /// Predict instance masks.
    pub masks: bool,
    /// Supervise masks on every decoder layer, not only the last.
    pub return_intermediate_masks: bool,
    /// Include mask and Dice costs in the matcher.
    pub match_masks: bool,
    /// Number of points sampled for mask costs and losses.
    pub num_points: usize,
    /// Candidate oversampling factor for importance sampling.
    pub oversample_ratio: f32,
    /// Share of points placed on the most uncertain candidates.
    pub importance_sample_ratio: f32,

    // -----------------------------------------------------------------------
    // Decoder
    // -----------------------------------------------------------------------
    /// Reuse one refinement head for every decoder layer.
    pub share_bbox_layers: bool,
    /// Supervise every decoder layer, not only the last.
    pub aux_loss: bool,
    /// Partition decoder layers into detect+track and track-only layers.
    #[serde(rename = "CoMOT")]
    pub comot: bool,
    /// Keep the object classification term on track-only layers.
    #[serde(rename = "CoMOT_loss_ce")]
    pub comot_loss_ce: bool,
    /// Number of leading decoder layers that still detect new objects.
    #[serde(rename = "num_OD_layers")]
    pub num_od_layers: usize,

    // -----------------------------------------------------------------------
    // Denoising
    // -----------------------------------------------------------------------
    /// Add noised copies of track queries.
    pub dn_track: bool,
    /// Use several track-denoising groups.
    pub dn_track_group: bool,
    /// Number of track-denoising groups when `dn_track_group` is set.
    pub dn_track_groups: usize,
    /// Centre perturbation limit for track denoising.
    pub dn_track_l1: f32,
    /// Size perturbation limit for track denoising.
    pub dn_track_l2: f32,
    /// Add noised copies of ground-truth boxes as object queries.
    pub dn_object: bool,
    /// Number of object-denoising groups.
    pub dn_object_groups: usize,
    /// Centre perturbation limit for object denoising.
    pub dn_object_l1: f32,
    /// Size perturbation limit for object denoising.
    pub dn_object_l2: f32,
    /// Add noised ground-truth boxes next to the encoder proposals.
    pub dn_enc: bool,
    /// Number of encoder-denoising groups.
    pub dn_enc_groups: usize,
    /// Centre perturbation limit for encoder denoising.
    pub dn_enc_l1: f32,
    /// Size perturbation limit for encoder denoising.
    pub dn_enc_l2: f32,
    /// Content embedding perturbation magnitude.
    pub tgt_noise: f32,

    // -----------------------------------------------------------------------
    // Matcher costs
    // -----------------------------------------------------------------------
    /// Weight of the focal classification cost.
    pub set_cost_class: f32,
    /// Weight of the box L1 cost.
    pub set_cost_bbox: f32,
    /// Weight of the generalized IoU cost.
    pub set_cost_giou: f32,
    /// Weight of the point mask BCE cost.
    pub set_cost_mask: f32,
    /// Weight of the point Dice cost.
    pub set_cost_dice: f32,

    // -----------------------------------------------------------------------
    // Loss coefficients
    // -----------------------------------------------------------------------
    /// Focal classification loss coefficient.
    pub cls_loss_coef: f32,
    /// Box L1 loss coefficient.
    pub bbox_loss_coef: f32,
    /// GIoU loss coefficient.
    pub giou_loss_coef: f32,
    /// Weighted mask BCE coefficient.
    pub mask_loss_coef: f32,
    /// Dice loss coefficient.
    pub dice_loss_coef: f32,
    /// Division loss coefficient for object queries.
    pub div_loss_coef: f32,
    /// Division loss coefficient for track queries.
    pub track_div_loss_coef: f32,
    /// Scale of object and encoder denoising losses.
    pub dn_object_coef: f32,
    /// Scale of track denoising losses.
    pub dn_track_coef: f32,
    /// Extra mask weight on the target cell's pixels.
    pub mask_weight_target_cell_coef: f32,
    /// Extra mask weight on any foreground pixel.
    pub mask_weight_all_cells_coef: f32,
    /// Focal loss balance.
    pub focal_alpha: f32,
    /// Focal loss focusing exponent.
    pub focal_gamma: f32,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Base learning rate.
    pub lr: f64,
    /// Backbone learning rate.
    pub lr_backbone: f64,
    /// Weight decay.
    pub weight_decay: f64,
    /// Number of epochs.
    pub epochs: usize,
    /// Epoch at which the learning rate drops by 10x.
    pub lr_drop: usize,
    /// Sequences per step.
    pub batch_size: usize,
    /// Gradient clipping norm (0 disables clipping).
    pub clip_max_norm: f64,
    /// Seed for denoising noise and point sampling.
    pub seed: u64,
    /// Consecutive non-finite steps tolerated before training aborts.
    pub max_nonfinite_steps: usize,

    // -----------------------------------------------------------------------
    // Device and resume
    // -----------------------------------------------------------------------
    /// Where the attention operator runs.
    pub device: Device,
    /// Checkpoint to resume from.
    pub resume: Option<PathBuf>,
    /// Also restore optimizer and scheduler state.
    pub resume_optim: bool,
    /// Allow the best-effort parameter migration on resume.
    pub resume_shift_neuron: bool,
}

impl Default for TractrConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 288,
            num_queries: 30,
            num_classes: 1,
            dec_layers: 6,
            num_feature_levels: 4,

            tracking: true,
            use_prev_prev_frame: false,
            backprop_prev_frame: false,
            track_grace_frames: 0,
            cls_threshold: 0.5,
            iou_threshold: 0.5,

            two_stage: true,
            init_enc_queries_embeddings: false,
            init_boxes_from_masks: false,

            masks: true,
            return_intermediate_masks: true,
            match_masks: true,
            num_points: 12544,
            oversample_ratio: 3.0,
            importance_sample_ratio: 0.75,

            share_bbox_layers: false,
            aux_loss: true,
            comot: false,
            comot_loss_ce: false,
            num_od_layers: 1,

            dn_track: true,
            dn_track_group: false,
            dn_track_groups: 3,
            dn_track_l1: 0.4,
            dn_track_l2: 0.4,
            dn_object: true,
            dn_object_groups: 1,
            dn_object_l1: 0.4,
            dn_object_l2: 0.4,
            dn_enc: false,
            dn_enc_groups: 1,
            dn_enc_l1: 0.4,
            dn_enc_l2: 0.4,
            tgt_noise: 0.1,

            set_cost_class: 2.0,
            set_cost_bbox: 5.0,
            set_cost_giou: 2.0,
            set_cost_mask: 5.0,
            set_cost_dice: 5.0,

            cls_loss_coef: 2.0,
            bbox_loss_coef: 5.0,
            giou_loss_coef: 2.0,
            mask_loss_coef: 5.0,
            dice_loss_coef: 5.0,
            div_loss_coef: 2.0,
            track_div_loss_coef: 2.0,
            dn_object_coef: 1.0,
            dn_track_coef: 1.0,
            mask_weight_target_cell_coef: 1.0,
            mask_weight_all_cells_coef: 0.5,
            focal_alpha: 0.25,
            focal_gamma: 2.0,

            lr: 2e-4,
            lr_backbone: 2e-5,
            weight_decay: 1e-4,
            epochs: 40,
            lr_drop: 30,
            batch_size: 1,
            clip_max_norm: 0.1,
            seed: 42,
            max_nonfinite_steps: 5,

            device: Device::Cpu,
            resume: None,
            resume_optim: false,
            resume_shift_neuron: false,
        }
    }
}

impl TractrConfig {
    /// Parse and validate a configuration from a JSON string.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: TractrConfig = serde_json::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a configuration from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::Parse`] if it is malformed or names an unknown key, and
    /// any validation error.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Serialize this configuration to pretty-printed JSON at `path`,
    /// creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Number of track-denoising groups actually generated.
    pub fn track_denoising_groups(&self) -> usize {
        if self.dn_track_group {
            self.dn_track_groups
        } else {
            1
        }
    }

    /// Validate all fields and return the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("hidden_dim", self.hidden_dim),
            ("num_queries", self.num_queries),
            ("num_classes", self.num_classes),
            ("dec_layers", self.dec_layers),
            ("num_feature_levels", self.num_feature_levels),
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("max_nonfinite_steps", self.max_nonfinite_steps),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be > 0"));
            }
        }

        // Toggles that only make sense on top of another toggle.
        let requirements = [
            (self.dn_track_group, !self.dn_track, "dn_track_group", "dn_track"),
            (self.dn_track, !self.tracking, "dn_track", "tracking"),
            (self.use_prev_prev_frame, !self.tracking, "use_prev_prev_frame", "tracking"),
            (self.backprop_prev_frame, !self.tracking, "backprop_prev_frame", "tracking"),
            (self.dn_enc, !self.two_stage, "dn_enc", "two_stage"),
            (
                self.init_enc_queries_embeddings,
                !self.two_stage,
                "init_enc_queries_embeddings",
                "two_stage",
            ),
            (self.match_masks, !self.masks, "match_masks", "masks"),
            (
                self.return_intermediate_masks,
                !self.masks,
                "return_intermediate_masks",
                "masks",
            ),
            (self.init_boxes_from_masks, !self.masks, "init_boxes_from_masks", "masks"),
            (self.comot_loss_ce, !self.comot, "CoMOT_loss_ce", "CoMOT"),
            (self.resume_optim, self.resume.is_none(), "resume_optim", "resume"),
            (
                self.resume_shift_neuron,
                self.resume.is_none(),
                "resume_shift_neuron",
                "resume",
            ),
        ];
        for (enabled, missing, field, requires) in requirements {
            if enabled && missing {
                return Err(ConfigError::Conflict { field, requires });
            }
        }

        if self.comot && (self.num_od_layers == 0 || self.num_od_layers > self.dec_layers) {
            return Err(ConfigError::invalid_value(
                "num_OD_layers",
                format!("must be in [1, dec_layers = {}] when CoMOT is on", self.dec_layers),
            ));
        }
        if self.device == Device::Gpu && !cfg!(feature = "burn-gpu") {
            return Err(ConfigError::Conflict {
                field: "device",
                requires: "the burn-gpu feature",
            });
        }

        for (field, groups, enabled) in [
            ("dn_track_groups", self.dn_track_groups, self.dn_track_group),
            ("dn_object_groups", self.dn_object_groups, self.dn_object),
            ("dn_enc_groups", self.dn_enc_groups, self.dn_enc),
        ] {
            if enabled && groups == 0 {
                return Err(ConfigError::invalid_value(field, "must be > 0"));
            }
        }
        if self.masks && self.num_points == 0 {
            return Err(ConfigError::invalid_value("num_points", "must be > 0"));
        }
        if self.oversample_ratio < 1.0 {
            return Err(ConfigError::invalid_value("oversample_ratio", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.importance_sample_ratio) {
            return Err(ConfigError::invalid_value(
                "importance_sample_ratio",
                "must be in [0.0, 1.0]",
            ));
        }
        if !(0.0..=1.0).contains(&self.focal_alpha) {
            return Err(ConfigError::invalid_value("focal_alpha", "must be in [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.cls_threshold) {
            return Err(ConfigError::invalid_value("cls_threshold", "must be in [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::invalid_value("iou_threshold", "must be in [0.0, 1.0]"));
        }

        let non_negative = [
            ("dn_track_l1", self.dn_track_l1),
            ("dn_track_l2", self.dn_track_l2),
            ("dn_object_l1", self.dn_object_l1),
            ("dn_object_l2", self.dn_object_l2),
            ("dn_enc_l1", self.dn_enc_l1),
            ("dn_enc_l2", self.dn_enc_l2),
            ("tgt_noise", self.tgt_noise),
            ("set_cost_class", self.set_cost_class),
            ("set_cost_bbox", self.set_cost_bbox),
            ("set_cost_giou", self.set_cost_giou),
            ("set_cost_mask", self.set_cost_mask),
            ("set_cost_dice", self.set_cost_dice),
            ("cls_loss_coef", self.cls_loss_coef),
            ("bbox_loss_coef", self.bbox_loss_coef),
            ("giou_loss_coef", self.giou_loss_coef),
            ("mask_loss_coef", self.mask_loss_coef),
            ("dice_loss_coef", self.dice_loss_coef),
            ("div_loss_coef", self.div_loss_coef),
            ("track_div_loss_coef", self.track_div_loss_coef),
            ("dn_object_coef", self.dn_object_coef),
            ("dn_track_coef", self.dn_track_coef),
            ("mask_weight_target_cell_coef", self.mask_weight_target_cell_coef),
            ("mask_weight_all_cells_coef", self.mask_weight_all_cells_coef),
            ("focal_gamma", self.focal_gamma),
        ];
        for (field, value) in non_negative {
            if !(value >= 0.0) {
                return Err(ConfigError::invalid_value(field, "must be >= 0.0"));
            }
        }

        if self.lr <= 0.0 {
            return Err(ConfigError::invalid_value("lr", "must be > 0.0"));
        }
        if self.lr_backbone < 0.0 {
            return Err(ConfigError::invalid_value("lr_backbone", "must be >= 0.0"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid_value("weight_decay", "must be >= 0.0"));
        }
        if self.clip_max_norm < 0.0 {
            return Err(ConfigError::invalid_value("clip_max_norm", "must be >= 0.0"));
        }

        Ok(())
    }
}
