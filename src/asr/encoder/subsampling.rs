use candle::{Result, Tensor};

use crate::config::SubsampleType;

/// Halves the time axis of a `[B, T, H]` sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSubsampling {
    kind: SubsampleType,
}

impl TimeSubsampling {
    pub fn new(kind: SubsampleType) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SubsampleType {
        self.kind
    }

    /// Width of the output given the input width.
    pub fn output_units(&self, units: usize) -> usize {
        match self.kind {
            SubsampleType::Drop => units,
            SubsampleType::Concat => units * 2,
        }
    }

    /// drop keeps frames 0, 2, 4, ... so odd lengths round up;
    /// concat only merges complete pairs so odd lengths round down.
    pub fn output_length(&self, len: usize) -> usize {
        match self.kind {
            SubsampleType::Drop => len.div_ceil(2),
            SubsampleType::Concat => len / 2,
        }
    }

    /// [B, T, H] => [B, T', H] (drop) or [B, T', 2H] (concat)
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, h) = xs.dims3()?;
        match self.kind {
            SubsampleType::Drop => {
                let idx: Vec<u32> = (0..t as u32).step_by(2).collect();
                let idx = Tensor::new(idx.as_slice(), xs.device())?;
                xs.index_select(&idx, 1)
            }
            SubsampleType::Concat => {
                let t_out = t / 2;
                if t_out == 0 {
                    candle::bail!("cannot concat-subsample a sequence of length {t}");
                }
                xs.narrow(1, 0, t_out * 2)?
                    .contiguous()?
                    .reshape((b, t_out, h * 2))
            }
        }
    }
}

/// Encoded length after the layers flagged in `policy` halve a length-`t` input.
pub fn subsampled_length(t: usize, policy: &[bool], kind: SubsampleType) -> usize {
    let sub = TimeSubsampling::new(kind);
    policy
        .iter()
        .filter(|&&on| on)
        .fold(t, |len, _| sub.output_length(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn two_halvings_of_one_hundred_frames() {
        let policy = [true, true, false];
        assert_eq!(subsampled_length(100, &policy, SubsampleType::Drop), 25);
        assert_eq!(subsampled_length(100, &policy, SubsampleType::Concat), 25);
    }

    #[test]
    fn odd_lengths_round_per_policy() {
        assert_eq!(subsampled_length(7, &[true], SubsampleType::Drop), 4);
        assert_eq!(subsampled_length(7, &[true], SubsampleType::Concat), 3);
        assert_eq!(subsampled_length(1, &[true, true], SubsampleType::Drop), 1);
    }

    #[test]
    fn concat_pairs_adjacent_frames() -> Result<()> {
        let xs = Tensor::arange(0f32, 10., &Device::Cpu)?.reshape((1, 5, 2))?;
        let ys = TimeSubsampling::new(SubsampleType::Concat).forward(&xs)?;
        assert_eq!(ys.dims(), &[1, 2, 4]);
        assert_eq!(
            ys.to_vec3::<f32>()?[0],
            vec![vec![0., 1., 2., 3.], vec![4., 5., 6., 7.]]
        );
        Ok(())
    }

    #[test]
    fn drop_keeps_even_frames() -> Result<()> {
        let xs = Tensor::arange(0f32, 5., &Device::Cpu)?
            .reshape((1, 5, 1))?
            .to_dtype(DType::F32)?;
        let ys = TimeSubsampling::new(SubsampleType::Drop).forward(&xs)?;
        assert_eq!(ys.flatten_all()?.to_vec1::<f32>()?, vec![0., 2., 4.]);
        Ok(())
    }
}
