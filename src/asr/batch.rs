use candle::{Device, Tensor};

use crate::error::{Error, Result};

/// Frames of one utterance, `[T, D]` row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSequence {
    data: Vec<f32>,
    dim: usize,
}

impl FeatureSequence {
    pub fn new(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(Error::input(format!(
                "{} values do not form frames of width {dim}",
                data.len()
            )));
        }
        Ok(Self { data, dim })
    }

    pub fn from_frames(frames: &[Vec<f32>]) -> Result<Self> {
        let dim = frames.first().map_or(0, Vec::len);
        if frames.iter().any(|f| f.len() != dim) {
            return Err(Error::input("frames of unequal width"));
        }
        Self::new(frames.concat(), dim)
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn frames(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.dim)
    }
}

/// A padded mini-batch with the true length of every utterance.
#[derive(Clone, Debug)]
pub struct Batch {
    /// [B, T, D]
    pub xs: Tensor,
    pub x_lens: Vec<usize>,
    pub labels: Vec<Vec<u32>>,
    pub labels_sub: Option<Vec<Vec<u32>>>,
}

impl Batch {
    /// Checks declared lengths against the padded tensor.
    pub fn new(
        xs: Tensor,
        x_lens: Vec<usize>,
        labels: Vec<Vec<u32>>,
        labels_sub: Option<Vec<Vec<u32>>>,
    ) -> Result<Self> {
        let (b, t, _) = xs.dims3()?;
        if x_lens.len() != b {
            return Err(Error::input(format!(
                "{} lengths declared for {b} utterances",
                x_lens.len()
            )));
        }
        if let Some(&bad) = x_lens.iter().find(|&&l| l == 0 || l > t) {
            return Err(Error::input(format!(
                "declared length {bad} outside 1..={t}"
            )));
        }
        if labels.len() != b {
            return Err(Error::input(format!(
                "{} label sequences for {b} utterances",
                labels.len()
            )));
        }
        if let Some(sub) = &labels_sub {
            if sub.len() != b {
                return Err(Error::input(format!(
                    "{} sub-task label sequences for {b} utterances",
                    sub.len()
                )));
            }
        }
        Ok(Self {
            xs,
            x_lens,
            labels,
            labels_sub,
        })
    }

    /// Zero-pads `features` to the longest utterance.
    pub fn from_utterances(
        features: &[FeatureSequence],
        labels: Vec<Vec<u32>>,
        labels_sub: Option<Vec<Vec<u32>>>,
        device: &Device,
    ) -> Result<Self> {
        let Some(first) = features.first() else {
            return Err(Error::input("empty batch"));
        };
        let dim = first.dim();
        if features.iter().any(|f| f.dim() != dim) {
            return Err(Error::input("utterances with different feature widths"));
        }
        let t_max = features.iter().map(FeatureSequence::len).max().unwrap_or(0);
        let mut data = vec![0f32; features.len() * t_max * dim];
        for (b, f) in features.iter().enumerate() {
            let offset = b * t_max * dim;
            data[offset..offset + f.data.len()].copy_from_slice(&f.data);
        }
        let xs = Tensor::from_vec(data, (features.len(), t_max, dim), device)?;
        let x_lens = features.iter().map(FeatureSequence::len).collect();
        Self::new(xs, x_lens, labels, labels_sub)
    }

    /// Unlabelled batch for decoding.
    pub fn from_features(features: &[FeatureSequence], device: &Device) -> Result<Self> {
        Self::from_utterances(features, vec![vec![]; features.len()], None, device)
    }

    pub fn batch_size(&self) -> usize {
        self.x_lens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;

    #[test]
    fn pads_to_longest_utterance() -> Result<()> {
        let a = FeatureSequence::new(vec![1.; 6], 2)?;
        let b = FeatureSequence::new(vec![2.; 2], 2)?;
        let batch = Batch::from_utterances(&[a, b], vec![vec![1], vec![2]], None, &Device::Cpu)?;
        assert_eq!(batch.xs.dims(), &[2, 3, 2]);
        assert_eq!(batch.x_lens, vec![3, 1]);
        let row = batch.xs.to_vec3::<f32>()?[1].clone();
        assert_eq!(row, vec![vec![2., 2.], vec![0., 0.], vec![0., 0.]]);
        Ok(())
    }

    #[test]
    fn rejects_lengths_beyond_tensor() -> Result<()> {
        let xs = Tensor::zeros((2, 4, 3), DType::F32, &Device::Cpu)?;
        let err = Batch::new(xs, vec![4, 5], vec![vec![], vec![]], None);
        assert!(matches!(err, Err(Error::InputContract { .. })));
        Ok(())
    }
}
