pub mod asr;
pub mod config;
pub mod error;

pub use asr::batch::{Batch, FeatureSequence};
pub use asr::seq2seq::{AttentionSeq2seq, DecodeOutput, Hypothesis, TaskMetrics, TrainOutput};
pub use asr::vocab::Vocabulary;
pub use config::{Config, DecodeConfig, Task};
pub use error::{ConfigError, Error, Result};
