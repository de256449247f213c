use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};

use crate::{
    asr::{
        common::tensor_ext::{length_mask, TensorExt, LOG_ZERO},
        encoder::EncodedSequence,
    },
    config::{AttentionConfig, AttentionType},
};

/// Alignment of every head at the latest step plus the running sum of all steps.
#[derive(Clone, Debug)]
pub struct AttentionState {
    /// [B, H, T']
    weights: Tensor,
    /// [B, H, T']
    coverage: Tensor,
}

impl AttentionState {
    pub fn initial(batch: usize, num_heads: usize, t: usize, device: &Device) -> Result<Self> {
        let zeros = Tensor::zeros((batch, num_heads, t), DType::F32, device)?;
        Ok(Self {
            weights: zeros.clone(),
            coverage: zeros,
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn coverage(&self) -> &Tensor {
        &self.coverage
    }
}

/// Encoder-side projections computed once per utterance batch.
pub struct AttentionKeys {
    /// [B, T', E]
    values: Tensor,
    /// One [B, T', A] tensor per head.
    keys: Vec<Tensor>,
    /// [B, T'] with 1.0 on valid frames.
    mask: Tensor,
}

impl AttentionKeys {
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn max_len(&self) -> usize {
        self.values.size(1)
    }
}

enum Scorer {
    Content {
        w_enc: Linear,
        w_dec: Linear,
        v: Linear,
    },
    Location {
        w_enc: Linear,
        w_dec: Linear,
        v: Linear,
        conv: Conv1d,
        w_conv: Linear,
    },
    DotProduct {
        w_enc: Linear,
        w_dec: Linear,
        scale: f64,
    },
}

impl Scorer {
    fn new(enc_dim: usize, dec_dim: usize, cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let att_dim = cfg.attention_dim;
        let w_enc = candle_nn::linear(enc_dim, att_dim, vb.pp("w_enc"))?;
        let w_dec = candle_nn::linear_no_bias(dec_dim, att_dim, vb.pp("w_dec"))?;
        match cfg.attention_type {
            AttentionType::Content => Ok(Self::Content {
                w_enc,
                w_dec,
                v: candle_nn::linear_no_bias(att_dim, 1, vb.pp("v"))?,
            }),
            AttentionType::Location => {
                let conv = candle_nn::conv1d(
                    1,
                    cfg.conv_num_channels,
                    cfg.conv_width,
                    Conv1dConfig {
                        padding: cfg.conv_width / 2,
                        ..Default::default()
                    },
                    vb.pp("conv"),
                )?;
                Ok(Self::Location {
                    w_enc,
                    w_dec,
                    v: candle_nn::linear_no_bias(att_dim, 1, vb.pp("v"))?,
                    conv,
                    w_conv: candle_nn::linear_no_bias(
                        cfg.conv_num_channels,
                        att_dim,
                        vb.pp("w_conv"),
                    )?,
                })
            }
            AttentionType::DotProduct => Ok(Self::DotProduct {
                w_enc,
                w_dec,
                scale: (att_dim as f64).powf(-0.5),
            }),
        }
    }

    fn keys(&self, values: &Tensor) -> Result<Tensor> {
        match self {
            Self::Content { w_enc, .. }
            | Self::Location { w_enc, .. }
            | Self::DotProduct { w_enc, .. } => w_enc.forward(values),
        }
    }

    /// keys [B, T', A], query [B, Q], prev [B, T'] => energies [B, T']
    fn energy(&self, keys: &Tensor, query: &Tensor, prev: &Tensor) -> Result<Tensor> {
        match self {
            Self::Content { w_dec, v, .. } => {
                let q = w_dec.forward(query)?.unsqueeze(1)?;
                v.forward(&keys.broadcast_add(&q)?.tanh()?)?.squeeze(2)
            }
            Self::Location {
                w_dec,
                v,
                conv,
                w_conv,
                ..
            } => {
                let q = w_dec.forward(query)?.unsqueeze(1)?;
                // [B, 1, T'] => [B, C, T'] => [B, T', A]
                let loc = conv.forward(&prev.unsqueeze(1)?)?.transpose(1, 2)?;
                let loc = w_conv.forward(&loc.contiguous()?)?;
                v.forward(&keys.broadcast_add(&q)?.add(&loc)?.tanh()?)?
                    .squeeze(2)
            }
            Self::DotProduct { w_dec, scale, .. } => {
                let q = w_dec.forward(query)?.unsqueeze(2)?;
                keys.matmul(&q)?.squeeze(2)?.affine(*scale, 0.0)
            }
        }
    }
}

pub struct AttentionMechanism {
    heads: Vec<Scorer>,
    w_out: Option<Linear>,
    sharpening_factor: f64,
    sigmoid_smoothing: bool,
    coverage_weight: f64,
}

impl AttentionMechanism {
    pub fn new(
        enc_dim: usize,
        dec_dim: usize,
        cfg: &AttentionConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let heads = (0..cfg.num_heads)
            .map(|h| Scorer::new(enc_dim, dec_dim, cfg, vb.pp(format!("head{h}"))))
            .collect::<Result<Vec<_>>>()?;
        let w_out = if cfg.num_heads > 1 {
            Some(candle_nn::linear(
                enc_dim * cfg.num_heads,
                enc_dim,
                vb.pp("w_out"),
            )?)
        } else {
            None
        };
        Ok(Self {
            heads,
            w_out,
            sharpening_factor: cfg.sharpening_factor,
            sigmoid_smoothing: cfg.sigmoid_smoothing,
            coverage_weight: cfg.coverage_weight,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn prepare(&self, enc: &EncodedSequence) -> Result<AttentionKeys> {
        let values = enc.xs.contiguous()?;
        let keys = self
            .heads
            .iter()
            .map(|head| head.keys(&values))
            .collect::<Result<Vec<_>>>()?;
        let mask = length_mask(&enc.lens, enc.xs.size(1), enc.xs.device())?;
        Ok(AttentionKeys {
            values,
            keys,
            mask,
        })
    }

    pub fn initial_state(&self, keys: &AttentionKeys) -> Result<AttentionState> {
        AttentionState::initial(
            keys.values.size(0),
            self.num_heads(),
            keys.max_len(),
            keys.values.device(),
        )
    }

    /// query [B, Q] => context [B, E] and the advanced state.
    pub fn attend(
        &self,
        keys: &AttentionKeys,
        query: &Tensor,
        state: &AttentionState,
    ) -> Result<(Tensor, AttentionState)> {
        let mut contexts = Vec::with_capacity(self.heads.len());
        let mut weights = Vec::with_capacity(self.heads.len());
        for (h, head) in self.heads.iter().enumerate() {
            let prev = state.weights.narrow(1, h, 1)?.squeeze(1)?;
            let mut e = head.energy(&keys.keys[h], query, &prev)?;
            if self.sharpening_factor != 1.0 {
                e = e.affine(self.sharpening_factor, 0.0)?;
            }
            if self.coverage_weight > 0.0 {
                let cov = state.coverage.narrow(1, h, 1)?.squeeze(1)?;
                e = e.sub(&cov.affine(self.coverage_weight, 0.0)?)?;
            }
            let e = e.masked_fill(&keys.mask, LOG_ZERO)?;
            let w = if self.sigmoid_smoothing {
                let w = candle_nn::ops::sigmoid(&e)?.mul(&keys.mask)?;
                w.broadcast_div(&w.sum_keepdim(D::Minus1)?)?
            } else {
                e.softmax(D::Minus1)?
            };
            // [B, 1, T'] x [B, T', E] => [B, E]
            contexts.push(w.unsqueeze(1)?.matmul(&keys.values)?.squeeze(1)?);
            weights.push(w);
        }

        let context = match &self.w_out {
            Some(w_out) => w_out.forward(&Tensor::cat(&contexts, 1)?)?,
            None => contexts.remove(0),
        };
        let weights = Tensor::stack(&weights, 1)?;
        let coverage = state.coverage.add(&weights)?;
        Ok((context, AttentionState { weights, coverage }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn encoded(lens: Vec<usize>, t: usize) -> Result<EncodedSequence> {
        let xs = Tensor::randn(0f32, 1., (lens.len(), t, 6), &Device::Cpu)?;
        Ok(EncodedSequence { xs, lens })
    }

    fn mechanism(cfg: &AttentionConfig, varmap: &VarMap) -> Result<AttentionMechanism> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        AttentionMechanism::new(6, 5, cfg, vb)
    }

    #[test]
    fn weights_sum_to_one_on_valid_frames_only() -> Result<()> {
        for attention_type in [
            AttentionType::Content,
            AttentionType::Location,
            AttentionType::DotProduct,
        ] {
            let cfg = AttentionConfig {
                attention_type,
                attention_dim: 4,
                conv_width: 3,
                conv_num_channels: 2,
                num_heads: 2,
                ..Default::default()
            };
            let varmap = VarMap::new();
            let att = mechanism(&cfg, &varmap)?;
            let keys = att.prepare(&encoded(vec![4, 2], 4)?)?;
            let query = Tensor::randn(0f32, 1., (2, 5), &Device::Cpu)?;
            let state = att.initial_state(&keys)?;
            let (context, state) = att.attend(&keys, &query, &state)?;
            assert_eq!(context.dims(), &[2, 6]);
            let w = state.weights().to_vec3::<f32>()?;
            for (b, heads) in w.iter().enumerate() {
                for row in heads {
                    let sum: f32 = row.iter().sum();
                    assert!((sum - 1.0).abs() < 1e-5, "{attention_type:?} sum {sum}");
                    if b == 1 {
                        assert_eq!(row[2], 0.0);
                        assert_eq!(row[3], 0.0);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn sigmoid_smoothing_still_normalizes() -> Result<()> {
        let cfg = AttentionConfig {
            attention_type: AttentionType::Content,
            attention_dim: 4,
            sigmoid_smoothing: true,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let att = mechanism(&cfg, &varmap)?;
        let keys = att.prepare(&encoded(vec![3], 3)?)?;
        let query = Tensor::randn(0f32, 1., (1, 5), &Device::Cpu)?;
        let (_, state) = att.attend(&keys, &query, &att.initial_state(&keys)?)?;
        let sum = state.weights().sum_all()?.to_scalar::<f32>()?;
        assert!((sum - 1.0).abs() < 1e-5);
        Ok(())
    }
}
