mod subsampling;

pub use subsampling::{subsampled_length, TimeSubsampling};

use candle::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::{
    asr::common::{
        rnn::{CellState, RecurrentCell},
        tensor_ext::length_mask,
    },
    config::{EncoderConfig, RnnType, SubsampleType},
};

/// A padded batch of encoded frames with the true length of each row.
#[derive(Clone, Debug)]
pub struct EncodedSequence {
    /// [B, T', H]
    pub xs: Tensor,
    pub lens: Vec<usize>,
}

impl EncodedSequence {
    pub fn batch_size(&self) -> usize {
        self.lens.len()
    }

    /// Row `b` trimmed to its true length.
    pub fn select(&self, b: usize) -> Result<Self> {
        let len = self.lens[b];
        let xs = self.xs.narrow(0, b, 1)?.narrow(1, 0, len)?.contiguous()?;
        Ok(Self { xs, lens: vec![len] })
    }
}

#[derive(Clone, Debug)]
pub struct EncoderOutput {
    pub main: EncodedSequence,
    /// Captured after `encoder_num_layers_sub` layers when a sub-task is configured.
    pub sub: Option<EncodedSequence>,
}

struct EncoderLayer {
    fwd: RecurrentCell,
    bwd: Option<RecurrentCell>,
    proj: Option<Linear>,
    subsampling: Option<TimeSubsampling>,
    /// Maps a concat-subsampled residual stream back to the layer width.
    residual_bridge: Option<Linear>,
}

impl EncoderLayer {
    /// [B, T, D] => [B, T, H]
    fn forward(&self, xs: &Tensor, lens: &[usize]) -> Result<Tensor> {
        let ys = run_direction(&self.fwd, xs, lens, false)?;
        let ys = match &self.bwd {
            Some(bwd) => {
                let ys_bwd = run_direction(bwd, xs, lens, true)?;
                Tensor::cat(&[&ys, &ys_bwd], 2)?
            }
            None => ys,
        };
        match &self.proj {
            Some(proj) => proj.forward(&ys),
            None => Ok(ys),
        }
    }
}

/// Steps `cell` over the time axis; padded frames produce zero outputs and,
/// when running backwards, leave the state untouched until the true end is reached.
fn run_direction(
    cell: &RecurrentCell,
    xs: &Tensor,
    lens: &[usize],
    reverse: bool,
) -> Result<Tensor> {
    let (b, t, _) = xs.dims3()?;
    let mask = length_mask(lens, t, xs.device())?;
    let mut state: CellState = cell.zero_state(b)?;
    let mut ys = Vec::with_capacity(t);
    let order: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..t).rev())
    } else {
        Box::new(0..t)
    };
    for i in order {
        let x = xs.narrow(1, i, 1)?.squeeze(1)?;
        let keep = mask.narrow(1, i, 1)?;
        let next = cell.step(&x, &state)?;
        state = if reverse {
            next.blend(&state, &keep)?
        } else {
            next
        };
        ys.push((i, state.h().broadcast_mul(&keep)?));
    }
    ys.sort_by_key(|(i, _)| *i);
    let ys: Vec<Tensor> = ys.into_iter().map(|(_, y)| y).collect();
    Tensor::stack(&ys, 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Residual {
    None,
    Previous,
    Dense,
}

/// Stacked (bi)directional recurrent encoder with per-layer time subsampling.
pub struct RnnEncoder {
    layers: Vec<EncoderLayer>,
    residual: Residual,
    rnn_type: RnnType,
    subsample_type: SubsampleType,
    subsample_list: Vec<bool>,
    num_layers_sub: Option<usize>,
    output_units: usize,
    sub_units: Option<usize>,
    dropout_input: f32,
    dropout_hidden: f32,
}

impl RnnEncoder {
    pub fn new(
        input_size: usize,
        cfg: &EncoderConfig,
        num_layers_sub: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let residual = match (cfg.residual, cfg.dense_residual) {
            (_, true) => Residual::Dense,
            (true, false) => Residual::Previous,
            (false, false) => Residual::None,
        };
        let layer_units = cfg.layer_units();
        let subsampling = TimeSubsampling::new(cfg.subsample_type);

        let mut layers = Vec::with_capacity(cfg.num_layers);
        let mut in_dim = input_size;
        let mut sub_units = None;
        for i in 0..cfg.num_layers {
            let vb = vb.pp(format!("layer{i}"));
            let fwd = RecurrentCell::new(cfg.rnn_type, in_dim, cfg.num_units, vb.pp("fwd"))?;
            let bwd = if cfg.bidirectional {
                Some(RecurrentCell::new(
                    cfg.rnn_type,
                    in_dim,
                    cfg.num_units,
                    vb.pp("bwd"),
                )?)
            } else {
                None
            };
            let proj = if cfg.num_proj > 0 {
                Some(candle_nn::linear(
                    cfg.num_units * cfg.num_directions(),
                    cfg.num_proj,
                    vb.pp("proj"),
                )?)
            } else {
                None
            };
            let layer_subsampling = cfg.subsample_at(i).then_some(subsampling);
            let residual_bridge = match (residual, layer_subsampling) {
                (Residual::None, _) => None,
                (_, Some(s)) if s.kind() == SubsampleType::Concat => Some(candle_nn::linear(
                    layer_units * 2,
                    layer_units,
                    vb.pp("residual_bridge"),
                )?),
                _ => None,
            };
            in_dim = layer_subsampling.map_or(layer_units, |s| s.output_units(layer_units));
            if num_layers_sub == Some(i + 1) {
                sub_units = Some(in_dim);
            }
            layers.push(EncoderLayer {
                fwd,
                bwd,
                proj,
                subsampling: layer_subsampling,
                residual_bridge,
            });
        }

        Ok(Self {
            layers,
            residual,
            rnn_type: cfg.rnn_type,
            subsample_type: cfg.subsample_type,
            subsample_list: cfg.subsample_list.clone(),
            num_layers_sub,
            output_units: in_dim,
            sub_units,
            dropout_input: cfg.dropout_input,
            dropout_hidden: cfg.dropout_hidden,
        })
    }

    pub fn rnn_type(&self) -> RnnType {
        self.rnn_type
    }

    pub fn output_units(&self) -> usize {
        self.output_units
    }

    pub fn sub_units(&self) -> Option<usize> {
        self.sub_units
    }

    pub fn output_length(&self, t: usize) -> usize {
        subsampled_length(t, &self.subsample_list, self.subsample_type)
    }

    pub fn output_length_sub(&self, t: usize) -> Option<usize> {
        self.num_layers_sub.map(|n| {
            let policy = &self.subsample_list[..n.min(self.subsample_list.len())];
            subsampled_length(t, policy, self.subsample_type)
        })
    }

    /// [B, T, D] => [B, T', H]
    pub fn forward(&self, xs: &Tensor, lens: &[usize], train: bool) -> Result<EncoderOutput> {
        let mut xs = if train && self.dropout_input > 0.0 {
            candle_nn::ops::dropout(xs, self.dropout_input)?
        } else {
            xs.clone()
        };
        let mut lens = lens.to_vec();
        let mut stream: Option<Tensor> = None;
        let mut sub = None;

        for (i, layer) in self.layers.iter().enumerate() {
            let mut ys = layer.forward(&xs, &lens)?;
            if train && self.dropout_hidden > 0.0 {
                ys = candle_nn::ops::dropout(&ys, self.dropout_hidden)?;
            }
            let raw = ys.clone();
            if let Some(res) = &stream {
                ys = ys.add(res)?;
            }
            stream = match self.residual {
                Residual::None => None,
                Residual::Previous => Some(ys.clone()),
                Residual::Dense => Some(match stream {
                    Some(sum) => sum.add(&raw)?,
                    None => raw,
                }),
            };

            if let Some(subsampling) = &layer.subsampling {
                ys = subsampling.forward(&ys)?;
                lens = lens.iter().map(|&l| subsampling.output_length(l)).collect();
                stream = match stream {
                    Some(res) => {
                        let res = subsampling.forward(&res)?;
                        Some(match &layer.residual_bridge {
                            Some(bridge) => bridge.forward(&res)?,
                            None => res,
                        })
                    }
                    None => None,
                };
            }
            tracing::trace!(layer = i, frames = ys.dim(1)?, "encoder layer");

            if self.num_layers_sub == Some(i + 1) {
                sub = Some(EncodedSequence {
                    xs: ys.clone(),
                    lens: lens.clone(),
                });
            }
            xs = ys;
        }

        Ok(EncoderOutput {
            main: EncodedSequence { xs, lens },
            sub,
        })
    }
}
