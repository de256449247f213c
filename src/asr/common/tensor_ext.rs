use candle::{shape::Dim, Result, Tensor};

/// Finite stand-in for log(0); keeps masked log-space arithmetic free of NaN gradients.
pub const LOG_ZERO: f32 = -1e30;

pub trait TensorExt {
    fn size(&self, dim: usize) -> usize;
    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor>;
    fn log_softmax<D: Dim>(&self, dim: D) -> Result<Tensor>;
    fn log_sum_exp_keepdim<D: Dim + Copy>(&self, dim: D) -> Result<Tensor>;
    fn masked_fill(&self, keep: &Tensor, value: f32) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn size(&self, dim: usize) -> usize {
        self.dims()[dim]
    }

    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor> {
        candle_nn::ops::softmax(self, dim)
    }

    fn log_softmax<D: Dim>(&self, dim: D) -> Result<Tensor> {
        candle_nn::ops::log_softmax(self, dim)
    }

    fn log_sum_exp_keepdim<D: Dim + Copy>(&self, dim: D) -> Result<Tensor> {
        let max = self.max_keepdim(dim)?;
        self.broadcast_sub(&max)?
            .exp()?
            .sum_keepdim(dim)?
            .log()?
            .broadcast_add(&max)
    }

    /// `keep` holds 1.0 where the value survives and 0.0 where `value` is written.
    fn masked_fill(&self, keep: &Tensor, value: f32) -> Result<Tensor> {
        let fill = keep.affine(-(value as f64), value as f64)?;
        self.broadcast_mul(keep)?.broadcast_add(&fill)
    }
}

/// `[B, T]` mask with 1.0 on the first `lens[b]` positions of each row.
pub fn length_mask(lens: &[usize], max_len: usize, device: &candle::Device) -> Result<Tensor> {
    let mask: Vec<f32> = lens
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (lens.len(), max_len), device)
}
