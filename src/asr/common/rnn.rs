use candle::{DType, Result, Tensor};
use candle_nn::{
    rnn::{GRUState, LSTMState},
    GRUConfig, LSTMConfig, VarBuilder, GRU, LSTM, RNN,
};

use crate::config::RnnType;

/// A single recurrent cell whose kind is fixed at construction.
pub enum RecurrentCell {
    Lstm(LSTM),
    Gru(GRU),
}

#[derive(Clone, Debug)]
pub enum CellState {
    Lstm(LSTMState),
    Gru(GRUState),
}

impl CellState {
    pub fn h(&self) -> &Tensor {
        match self {
            Self::Lstm(state) => state.h(),
            Self::Gru(state) => &state.h,
        }
    }

    /// Per-row choice between `self` and `other`; `keep` is `[B, 1]` with 1.0 selecting `self`.
    pub fn blend(&self, other: &Self, keep: &Tensor) -> Result<Self> {
        let mix = |a: &Tensor, b: &Tensor| -> Result<Tensor> {
            let drop = keep.affine(-1.0, 1.0)?;
            a.broadcast_mul(keep)?.add(&b.broadcast_mul(&drop)?)
        };
        match (self, other) {
            (Self::Lstm(a), Self::Lstm(b)) => Ok(Self::Lstm(LSTMState::new(
                mix(a.h(), b.h())?,
                mix(a.c(), b.c())?,
            ))),
            (Self::Gru(a), Self::Gru(b)) => Ok(Self::Gru(GRUState {
                h: mix(&a.h, &b.h)?,
            })),
            _ => candle::bail!("cannot blend states of different cell kinds"),
        }
    }
}

impl RecurrentCell {
    pub fn new(kind: RnnType, in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            RnnType::Lstm => Ok(Self::Lstm(candle_nn::lstm(
                in_dim,
                hidden,
                LSTMConfig::default(),
                vb,
            )?)),
            RnnType::Gru => Ok(Self::Gru(candle_nn::gru(
                in_dim,
                hidden,
                GRUConfig::default(),
                vb,
            )?)),
        }
    }

    pub fn zero_state(&self, batch: usize) -> Result<CellState> {
        match self {
            Self::Lstm(lstm) => Ok(CellState::Lstm(lstm.zero_state(batch)?)),
            Self::Gru(gru) => Ok(CellState::Gru(gru.zero_state(batch)?)),
        }
    }

    /// State whose hidden vector is `h` and whose memory cell (if any) is zero.
    pub fn state_from_hidden(&self, h: Tensor) -> Result<CellState> {
        match self {
            Self::Lstm(_) => {
                let c = Tensor::zeros(h.dims(), DType::F32, h.device())?;
                Ok(CellState::Lstm(LSTMState::new(h, c)))
            }
            Self::Gru(_) => Ok(CellState::Gru(GRUState { h })),
        }
    }

    /// [B, D] => next state
    pub fn step(&self, x: &Tensor, state: &CellState) -> Result<CellState> {
        match (self, state) {
            (Self::Lstm(lstm), CellState::Lstm(state)) => Ok(CellState::Lstm(lstm.step(x, state)?)),
            (Self::Gru(gru), CellState::Gru(state)) => Ok(CellState::Gru(gru.step(x, state)?)),
            _ => candle::bail!("recurrent state does not match the cell kind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    #[test]
    fn blend_keeps_rows_selected_by_mask() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cell = RecurrentCell::new(RnnType::Gru, 3, 2, vb)?;
        let zero = cell.zero_state(2)?;
        let x = Tensor::ones((2, 3), DType::F32, &dev)?;
        let next = cell.step(&x, &zero)?;
        let keep = Tensor::new(&[[1f32], [0.]], &dev)?;
        let mixed = next.blend(&zero, &keep)?;
        let h = mixed.h().to_vec2::<f32>()?;
        assert_eq!(h[1], vec![0.0, 0.0]);
        assert_eq!(h[0], next.h().to_vec2::<f32>()?[0]);
        Ok(())
    }
}
