mod lattice;
mod loss;
mod prefix_score;
mod search;

pub use lattice::CtcLattice;
pub use loss::{ctc_loss, min_frames};
pub use prefix_score::{CtcPrefixScorer, CtcPrefixState};
pub use search::{ctc_beam_search, ctc_greedy_decode, CtcHypothesis};

use candle::{Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::asr::common::tensor_ext::TensorExt;

/// Frame-wise projection onto the labels plus blank.
pub struct CtcHead {
    fc: Linear,
    num_classes: usize,
}

impl CtcHead {
    pub fn new(enc_units: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let fc = candle_nn::linear(enc_units, num_classes, vb)?;
        Ok(Self { fc, num_classes })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// [B, T', E] => logits [B, T', C]
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc.forward(xs)
    }

    pub fn log_probs(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs)?.log_softmax(D::Minus1)
    }
}

/// Row `b` of `[B, T', C]` log-probabilities as host vectors, trimmed to `len` frames.
pub fn host_log_probs(log_probs: &Tensor, b: usize, len: usize) -> Result<Vec<Vec<f32>>> {
    log_probs
        .narrow(0, b, 1)?
        .squeeze(0)?
        .narrow(0, 0, len)?
        .to_vec2::<f32>()
}

pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}
