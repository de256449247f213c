use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::{
    asr::{
        attention::{AttentionKeys, AttentionMechanism, AttentionState},
        common::{
            rnn::{CellState, RecurrentCell},
            tensor_ext::{length_mask, TensorExt, LOG_ZERO},
        },
        encoder::EncodedSequence,
    },
    config::{AttentionConfig, DecoderConfig, DecodingOrder, InitDecState, RnnType, UsageDecSub},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Residual {
    None,
    Previous,
    Dense,
}

#[derive(Clone, Debug)]
pub struct DecoderState {
    cells: Vec<CellState>,
}

impl DecoderState {
    pub fn cells(&self) -> &[CellState] {
        &self.cells
    }
}

/// Stacked recurrent cells stepped one output token at a time.
pub struct RnnDecoder {
    layers: Vec<RecurrentCell>,
    residual: Residual,
    dropout: f32,
}

impl RnnDecoder {
    pub fn new(input_size: usize, cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.num_layers)
            .map(|i| {
                let in_dim = if i == 0 { input_size } else { cfg.num_units };
                RecurrentCell::new(cfg.rnn_type, in_dim, cfg.num_units, vb.pp(format!("layer{i}")))
            })
            .collect::<Result<_>>()?;
        let residual = match (cfg.residual, cfg.dense_residual) {
            (_, true) => Residual::Dense,
            (true, false) => Residual::Previous,
            (false, false) => Residual::None,
        };

        Ok(Self {
            layers,
            residual,
            dropout: cfg.dropout,
        })
    }

    pub fn zero_state(&self, batch: usize) -> Result<DecoderState> {
        let cells = self
            .layers
            .iter()
            .map(|layer| layer.zero_state(batch))
            .collect::<Result<_>>()?;
        Ok(DecoderState { cells })
    }

    /// Every layer starts from the same hidden vector `h` [B, U].
    pub fn state_from_hidden(&self, h: &Tensor) -> Result<DecoderState> {
        let cells = self
            .layers
            .iter()
            .map(|layer| layer.state_from_hidden(h.clone()))
            .collect::<Result<_>>()?;
        Ok(DecoderState { cells })
    }

    /// [B, D] => [B, U]
    pub fn step(
        &self,
        x: &Tensor,
        state: &DecoderState,
        train: bool,
    ) -> Result<(Tensor, DecoderState)> {
        let mut cells = Vec::with_capacity(self.layers.len());
        let mut outputs: Vec<Tensor> = Vec::with_capacity(self.layers.len());
        let mut input = x.clone();
        for (j, layer) in self.layers.iter().enumerate() {
            let next = layer.step(&input, &state.cells[j])?;
            let mut out = next.h().clone();
            if train && self.dropout > 0.0 {
                out = candle_nn::ops::dropout(&out, self.dropout)?;
            }
            if j > 0 {
                out = match self.residual {
                    Residual::None => out,
                    Residual::Previous => out.add(&outputs[j - 1])?,
                    Residual::Dense => outputs.iter().try_fold(out, |acc, o| acc.add(o))?,
                };
            }
            outputs.push(out.clone());
            cells.push(next);
            input = out;
        }
        Ok((input, DecoderState { cells }))
    }
}

enum Recurrence {
    Stacked(RnnDecoder),
    /// One cell before the attention and one after, sharing a single state.
    Conditional {
        first: RecurrentCell,
        second: RecurrentCell,
    },
}

impl Recurrence {
    fn zero_state(&self, batch: usize) -> Result<DecoderState> {
        match self {
            Self::Stacked(rnn) => rnn.zero_state(batch),
            Self::Conditional { first, .. } => Ok(DecoderState {
                cells: vec![first.zero_state(batch)?],
            }),
        }
    }

    fn state_from_hidden(&self, h: &Tensor) -> Result<DecoderState> {
        match self {
            Self::Stacked(rnn) => rnn.state_from_hidden(h),
            Self::Conditional { first, .. } => Ok(DecoderState {
                cells: vec![first.state_from_hidden(h.clone())?],
            }),
        }
    }
}

/// Shapes the decoder needs from the rest of the model.
#[derive(Clone, Copy, Debug)]
pub struct TaskDims {
    pub num_classes: usize,
    pub sos: u32,
    pub blank: u32,
    pub enc_units: usize,
    pub enc_rnn_type: RnnType,
    /// Usage and width of the main decoder snapshot, for a cross-conditioned sub-task.
    pub cross: Option<(UsageDecSub, usize)>,
}

/// Everything carried from one decoding step to the next.
#[derive(Clone, Debug)]
pub struct StepState {
    pub dec: DecoderState,
    /// [B, U]
    pub output: Tensor,
    pub attention: AttentionState,
    /// [B, E]
    pub context: Tensor,
    /// [B] token consumed by orders that update before generating.
    prev_token: Tensor,
}

/// The outcome of scoring one step, before a token has been chosen.
pub struct Scored {
    /// [B, V]
    pub logits: Tensor,
    state: StepState,
}

impl Scored {
    pub fn attention(&self) -> &AttentionState {
        &self.state.attention
    }

    pub fn context(&self) -> &Tensor {
        &self.state.context
    }
}

pub struct DecoderOutput {
    /// [B, U, V]
    pub logits: Tensor,
    /// One [B, H, T'] alignment per output step.
    pub weights: Vec<Tensor>,
    /// [B, U, E]
    pub contexts: Tensor,
    /// [B, H, T']
    pub coverage: Tensor,
}

/// Attention decoder for one task: embedding, attention, recurrence and output layer.
pub struct TaskDecoder {
    embedding: Embedding,
    attention: AttentionMechanism,
    recurrence: Recurrence,
    w_d: Linear,
    w_c: Linear,
    w_s: Option<Linear>,
    fc: Linear,
    w_init: Option<Linear>,
    init: InitDecState,
    order: DecodingOrder,
    usage: UsageDecSub,
    num_units: usize,
    enc_units: usize,
    num_classes: usize,
    sos: u32,
    blank: u32,
    dropout_embedding: f32,
}

impl TaskDecoder {
    pub fn new(
        dims: TaskDims,
        att_cfg: &AttentionConfig,
        cfg: &DecoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (usage, snapshot_units) = match dims.cross {
            Some((usage, units)) if usage != UsageDecSub::Independent => (usage, units),
            _ => (UsageDecSub::Independent, 0),
        };
        let embedding =
            candle_nn::embedding(dims.num_classes, cfg.embedding_dim, vb.pp("embed"))?;
        let attention =
            AttentionMechanism::new(dims.enc_units, cfg.num_units, att_cfg, vb.pp("attend"))?;

        let recurrence = match cfg.decoding_order {
            DecodingOrder::Conditional => Recurrence::Conditional {
                first: RecurrentCell::new(
                    cfg.rnn_type,
                    cfg.embedding_dim + snapshot_units,
                    cfg.num_units,
                    vb.pp("decoder_first"),
                )?,
                second: RecurrentCell::new(
                    cfg.rnn_type,
                    dims.enc_units,
                    cfg.num_units,
                    vb.pp("decoder_second"),
                )?,
            },
            _ => Recurrence::Stacked(RnnDecoder::new(
                cfg.embedding_dim + dims.enc_units + snapshot_units,
                cfg,
                vb.pp("decoder"),
            )?),
        };

        let w_d = candle_nn::linear(cfg.num_units, cfg.bottleneck_dim, vb.pp("w_d"))?;
        let w_c = candle_nn::linear_no_bias(dims.enc_units, cfg.bottleneck_dim, vb.pp("w_c"))?;
        let w_s = if usage == UsageDecSub::All {
            Some(candle_nn::linear_no_bias(
                snapshot_units,
                cfg.bottleneck_dim,
                vb.pp("w_s"),
            )?)
        } else {
            None
        };
        let fc = candle_nn::linear(cfg.bottleneck_dim, dims.num_classes, vb.pp("fc"))?;

        // A learned initial state only makes sense between cells of the same kind.
        let init = if dims.enc_rnn_type == cfg.rnn_type {
            cfg.init_dec_state
        } else {
            InitDecState::Zero
        };
        let w_init = if init == InitDecState::Zero {
            None
        } else {
            Some(candle_nn::linear(
                dims.enc_units,
                cfg.num_units,
                vb.pp("w_dec_init"),
            )?)
        };

        Ok(Self {
            embedding,
            attention,
            recurrence,
            w_d,
            w_c,
            w_s,
            fc,
            w_init,
            init,
            order: cfg.decoding_order,
            usage,
            num_units: cfg.num_units,
            enc_units: dims.enc_units,
            num_classes: dims.num_classes,
            sos: dims.sos,
            blank: dims.blank,
            dropout_embedding: cfg.dropout_embedding,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn blank(&self) -> u32 {
        self.blank
    }

    pub fn usage(&self) -> UsageDecSub {
        self.usage
    }

    pub fn prepare(&self, enc: &EncodedSequence) -> Result<AttentionKeys> {
        self.attention.prepare(enc)
    }

    pub fn init_state(&self, keys: &AttentionKeys, enc: &EncodedSequence) -> Result<StepState> {
        let batch = enc.batch_size();
        let device = enc.xs.device();
        let (dec, output) = match &self.w_init {
            Some(w_init) => {
                let v = match self.init {
                    InitDecState::First => enc.xs.narrow(1, 0, 1)?.squeeze(1)?,
                    InitDecState::Final => {
                        let idx: Vec<u32> = enc
                            .lens
                            .iter()
                            .map(|&l| l.saturating_sub(1) as u32)
                            .collect();
                        let idx = Tensor::from_vec(idx, (batch, 1, 1), device)?
                            .broadcast_as((batch, 1, self.enc_units))?
                            .contiguous()?;
                        enc.xs.contiguous()?.gather(&idx, 1)?.squeeze(1)?
                    }
                    InitDecState::Mean | InitDecState::Zero => {
                        let mask = length_mask(&enc.lens, enc.xs.size(1), device)?;
                        let lens: Vec<f32> = enc.lens.iter().map(|&l| l.max(1) as f32).collect();
                        let lens = Tensor::from_vec(lens, (batch, 1), device)?;
                        enc.xs
                            .broadcast_mul(&mask.unsqueeze(2)?)?
                            .sum(1)?
                            .broadcast_div(&lens)?
                    }
                };
                let h = w_init.forward(&v)?.tanh()?;
                (self.recurrence.state_from_hidden(&h)?, h)
            }
            None => (
                self.recurrence.zero_state(batch)?,
                Tensor::zeros((batch, self.num_units), DType::F32, device)?,
            ),
        };

        Ok(StepState {
            dec,
            output,
            attention: self.attention.initial_state(keys)?,
            context: Tensor::zeros((batch, self.enc_units), DType::F32, device)?,
            prev_token: Tensor::new(vec![self.sos; batch].as_slice(), device)?,
        })
    }

    fn embed(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let emb = self.embedding.forward(ids)?;
        if train && self.dropout_embedding > 0.0 {
            candle_nn::ops::dropout(&emb, self.dropout_embedding)
        } else {
            Ok(emb)
        }
    }

    fn recurrent_input(&self, parts: &[&Tensor], snapshot: Option<&Tensor>) -> Result<Tensor> {
        match (self.usage, snapshot) {
            (UsageDecSub::Independent, _) | (_, None) => Tensor::cat(parts, 1),
            (_, Some(snapshot)) => {
                let mut parts = parts.to_vec();
                parts.push(snapshot);
                Tensor::cat(&parts, 1)
            }
        }
    }

    /// fc(tanh(W_d s + W_c c [+ W_s m])) => [B, V]
    fn generate(
        &self,
        output: &Tensor,
        context: &Tensor,
        snapshot: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut hidden = self.w_d.forward(output)?.add(&self.w_c.forward(context)?)?;
        if let (Some(w_s), Some(snapshot)) = (&self.w_s, snapshot) {
            hidden = hidden.add(&w_s.forward(snapshot)?)?;
        }
        self.fc.forward(&hidden.tanh()?)
    }

    /// Runs the part of a step that does not depend on the token chosen at it.
    pub fn score(
        &self,
        keys: &AttentionKeys,
        state: &StepState,
        snapshot: Option<&Tensor>,
        train: bool,
    ) -> Result<Scored> {
        match (self.order, &self.recurrence) {
            (DecodingOrder::AttendGenerateUpdate, _) => {
                let (context, attention) =
                    self.attention.attend(keys, &state.output, &state.attention)?;
                let logits = self.generate(&state.output, &context, snapshot)?;
                Ok(Scored {
                    logits,
                    state: StepState {
                        dec: state.dec.clone(),
                        output: state.output.clone(),
                        attention,
                        context,
                        prev_token: state.prev_token.clone(),
                    },
                })
            }
            (DecodingOrder::Conditional, Recurrence::Conditional { first, second }) => {
                let emb = self.embed(&state.prev_token, train)?;
                let input = self.recurrent_input(&[&emb], snapshot)?;
                let mid = first.step(&input, &state.dec.cells[0])?;
                let (context, attention) =
                    self.attention.attend(keys, mid.h(), &state.attention)?;
                let cell = second.step(&context, &mid)?;
                let output = cell.h().clone();
                let logits = self.generate(&output, &context, snapshot)?;
                Ok(Scored {
                    logits,
                    state: StepState {
                        dec: DecoderState { cells: vec![cell] },
                        output,
                        attention,
                        context,
                        prev_token: state.prev_token.clone(),
                    },
                })
            }
            (_, Recurrence::Stacked(rnn)) => {
                let (context, attention) =
                    self.attention.attend(keys, &state.output, &state.attention)?;
                let emb = self.embed(&state.prev_token, train)?;
                let input = self.recurrent_input(&[&emb, &context], snapshot)?;
                let (output, dec) = rnn.step(&input, &state.dec, train)?;
                let logits = self.generate(&output, &context, snapshot)?;
                Ok(Scored {
                    logits,
                    state: StepState {
                        dec,
                        output,
                        attention,
                        context,
                        prev_token: state.prev_token.clone(),
                    },
                })
            }
            (_, Recurrence::Conditional { .. }) => {
                candle::bail!("conditional recurrence requires the conditional decoding order")
            }
        }
    }

    /// Commits token `y` [B] as the output of the scored step.
    pub fn advance(
        &self,
        scored: &Scored,
        y: &Tensor,
        snapshot: Option<&Tensor>,
        train: bool,
    ) -> Result<StepState> {
        let mut state = scored.state.clone();
        if let (DecodingOrder::AttendGenerateUpdate, Recurrence::Stacked(rnn)) =
            (self.order, &self.recurrence)
        {
            let emb = self.embed(y, train)?;
            let input = self.recurrent_input(&[&emb, &state.context], snapshot)?;
            let (output, dec) = rnn.step(&input, &state.dec, train)?;
            state.output = output;
            state.dec = dec;
        }
        state.prev_token = y.clone();
        Ok(state)
    }

    /// Log-probabilities [B, V] with the blank id excluded.
    pub fn log_probs(&self, logits: &Tensor) -> Result<Tensor> {
        let mut bias = vec![0f32; self.num_classes];
        bias[self.blank as usize] = LOG_ZERO;
        let bias = Tensor::from_vec(bias, self.num_classes, logits.device())?;
        logits.broadcast_add(&bias)?.log_softmax(D::Minus1)
    }

    /// Teacher-forced pass over `targets` [B, U]. Where `sample_at[t]` is set the
    /// input at step `t` is the model's own arg-max from step `t - 1`.
    pub fn forward_train(
        &self,
        keys: &AttentionKeys,
        enc: &EncodedSequence,
        targets: &Tensor,
        sample_at: &[bool],
        snapshot: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderOutput> {
        let (_, u) = targets.dims2()?;
        let mut state = self.init_state(keys, enc)?;
        let mut logits = Vec::with_capacity(u);
        let mut weights = Vec::with_capacity(u);
        let mut contexts = Vec::with_capacity(u);
        let mut coverage = state.attention.coverage().clone();

        for t in 0..u {
            let scored = self.score(keys, &state, snapshot, train)?;
            logits.push(scored.logits.clone());
            weights.push(scored.attention().weights().clone());
            contexts.push(scored.context().clone());
            coverage = scored.attention().coverage().clone();
            if t + 1 == u {
                break;
            }
            let y = if sample_at.get(t + 1).copied().unwrap_or(false) {
                self.log_probs(&scored.logits)?.argmax(D::Minus1)?.detach()
            } else {
                // embedding backward needs contiguous ids
                targets.narrow(1, t, 1)?.squeeze(1)?.contiguous()?
            };
            state = self.advance(&scored, &y, snapshot, train)?;
        }

        Ok(DecoderOutput {
            logits: Tensor::stack(&logits, 1)?,
            weights,
            contexts: Tensor::stack(&contexts, 1)?,
            coverage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    fn dims() -> TaskDims {
        TaskDims {
            num_classes: 6,
            sos: 5,
            blank: 0,
            enc_units: 4,
            enc_rnn_type: RnnType::Lstm,
            cross: None,
        }
    }

    fn small_cfg(order: DecodingOrder) -> (AttentionConfig, DecoderConfig) {
        (
            AttentionConfig {
                attention_dim: 3,
                conv_width: 3,
                conv_num_channels: 2,
                ..Default::default()
            },
            DecoderConfig {
                num_units: 5,
                embedding_dim: 3,
                bottleneck_dim: 4,
                decoding_order: order,
                ..Default::default()
            },
        )
    }

    #[test]
    fn every_order_produces_logits_per_target() -> Result<()> {
        let dev = Device::Cpu;
        for order in [
            DecodingOrder::AttendGenerateUpdate,
            DecodingOrder::AttendUpdateGenerate,
            DecodingOrder::Conditional,
        ] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
            let (att, dec) = small_cfg(order);
            let decoder = TaskDecoder::new(dims(), &att, &dec, vb)?;
            let enc = EncodedSequence {
                xs: Tensor::randn(0f32, 1., (2, 5, 4), &dev)?,
                lens: vec![5, 3],
            };
            let keys = decoder.prepare(&enc)?;
            let targets = Tensor::new(&[[1u32, 2, 5], [3, 5, 5]], &dev)?;
            let sample_at = [false, true, false];
            let out = decoder.forward_train(&keys, &enc, &targets, &sample_at, None, true)?;
            assert_eq!(out.logits.dims(), &[2, 3, 6]);
            assert_eq!(out.contexts.dims(), &[2, 3, 4]);
            assert_eq!(out.weights.len(), 3);
        }
        Ok(())
    }

    #[test]
    fn log_probs_never_pick_blank() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let (att, dec) = small_cfg(DecodingOrder::AttendGenerateUpdate);
        let decoder = TaskDecoder::new(dims(), &att, &dec, vb)?;
        let logits = Tensor::new(&[[9f32, 0., 1., 0., 0., 0.]], &dev)?;
        let lp = decoder.log_probs(&logits)?;
        let best = lp.argmax(D::Minus1)?.to_vec1::<u32>()?;
        assert_eq!(best, vec![2]);
        let total = lp.exp()?.sum_all()?.to_scalar::<f32>()?;
        assert!((total - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_cell_kinds_start_from_zero() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let (att, mut dec) = small_cfg(DecodingOrder::AttendGenerateUpdate);
        dec.rnn_type = RnnType::Gru;
        let decoder = TaskDecoder::new(dims(), &att, &dec, vb)?;
        let enc = EncodedSequence {
            xs: Tensor::randn(0f32, 1., (1, 3, 4), &dev)?,
            lens: vec![3],
        };
        let keys = decoder.prepare(&enc)?;
        let state = decoder.init_state(&keys, &enc)?;
        assert_eq!(state.output.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }
}
