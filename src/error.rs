//! Error types for configuration, input contracts and numerical failures.

use thiserror::Error;

use crate::config::Task;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any forward pass.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Declared lengths or shapes disagree with the tensors handed in.
    #[error("input contract violation: {message}")]
    InputContract { message: String },

    /// The composed loss stopped being finite; recovery is the caller's decision.
    #[error("non-finite {task} loss: {value}")]
    NonFiniteLoss { task: &'static str, value: f32 },

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn input(message: impl Into<String>) -> Self {
        Self::InputContract {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {what} layer count: {count}")]
    InvalidLayerCount { what: &'static str, count: usize },

    #[error("sub-task encoder layer {index} outside 1..={num_layers}")]
    SubLayerOutOfRange { index: usize, num_layers: usize },

    #[error("subsample list has {len} entries for {num_layers} encoder layers")]
    SubsampleListLength { len: usize, num_layers: usize },

    #[error("{what}: residual and dense residual are mutually exclusive")]
    ConflictingResidual { what: &'static str },

    #[error("beam width must be at least 1, got {0}")]
    InvalidBeamWidth(usize),

    #[error("{name} must lie in [0, 1), got {value}")]
    InvalidProbability { name: &'static str, value: f64 },

    #[error("{name} must lie in [0, 1], got {value}")]
    InvalidFraction { name: &'static str, value: f64 },

    #[error("{name} must be non-negative and finite, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("invalid attention setting: {0}")]
    InvalidAttention(String),

    #[error("{0} requires a sub-task with an attention decoder")]
    MissingSubTask(&'static str),

    #[error("{0} requires a main-task attention decoder")]
    MissingMainDecoder(&'static str),

    #[error(
        "joint CTC decoding of the {0:?} task needs a CTC head; \
         enable a CTC loss weight or decode.ctc_weight"
    )]
    MissingCtcHead(Task),

    #[error("scheduled sampling probability {prob} needs a positive max step")]
    ScheduledSamplingStep { prob: f64 },

    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),
}

pub type Result<T> = std::result::Result<T, Error>;
