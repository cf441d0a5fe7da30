//! Error types for the query pool, matcher, loss assembler and checkpoints.
//!
//! ```text
//! TractrError (top-level)
//! ├── ConfigError      (config validation / file loading)
//! └── CheckpointError  (resume and state migration)
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Convenient `Result` alias used throughout the crate.
pub type TractrResult<T> = Result<T, TractrError>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum TractrError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A checkpoint could not be restored.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Two arrays that must agree in shape did not.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which array was being checked.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Frames must be processed strictly in order.
    #[error("Frame {got} arrived out of order (expected a frame after {last})")]
    OutOfOrderFrame {
        /// Last processed frame index.
        last: u64,
        /// Offending frame index.
        got: u64,
    },

    /// The batch handed to a training step is unusable.
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// The assembled loss was NaN or infinite.
    #[error("Non-finite loss {value} at step {step}")]
    NonFiniteLoss {
        /// Global step index.
        step: u64,
        /// The offending value.
        value: f32,
    },

    /// Too many consecutive steps produced non-finite losses.
    #[error("{consecutive} consecutive non-finite losses, training cannot proceed")]
    TooManyNonFinite {
        /// Number of consecutive failures.
        consecutive: usize,
    },

    /// The deformable attention backend failed.
    #[error("Attention backend error: {0}")]
    Attention(String),
}

impl TractrError {
    /// Construct a [`TractrError::ShapeMismatch`].
    pub fn shape_mismatch(what: &'static str, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        TractrError::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Construct a [`TractrError::MalformedBatch`].
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        TractrError::MalformedBatch(msg.into())
    }
}

/// Errors produced when loading or validating a
/// [`TractrConfig`](crate::config::TractrConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A toggle was enabled without the toggle it depends on.
    #[error("`{field}` requires `{requires}`")]
    Conflict {
        /// The enabled toggle.
        field: &'static str,
        /// What it depends on.
        requires: &'static str,
    },

    /// A configuration file could not be read or written.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is malformed or names an unknown key.
    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors produced while restoring a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint file could not be read or written.
    #[error("I/O error on checkpoint `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint is not valid JSON for the expected layout.
    #[error("Cannot parse checkpoint `{path}`: {source}")]
    Parse {
        /// Path being parsed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The checkpoint was written by an unknown format version.
    #[error("Unsupported checkpoint format version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version in the file.
        found: u32,
        /// Version this crate writes.
        supported: u32,
    },

    /// A parameter's shape differs and no migration rule applies.
    #[error("Parameter `{key}` has shape {found:?} in the checkpoint but the model expects {expected:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Shape the model expects.
        expected: Vec<usize>,
        /// Shape stored in the checkpoint.
        found: Vec<usize>,
    },

    /// A parameter's value count does not agree with its declared shape.
    #[error("Parameter `{key}` declares shape {shape:?} but holds {len} values")]
    Corrupt {
        /// Parameter name.
        key: String,
        /// Declared shape.
        shape: Vec<usize>,
        /// Actual number of values.
        len: usize,
    },
}
