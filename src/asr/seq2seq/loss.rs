use candle::{Device, Result, Tensor, D};

use crate::{
    asr::common::tensor_ext::{length_mask, TensorExt},
    config::Config,
};

/// `1 - p` on the gold id and `p` spread evenly over every other id.
///
/// With `blank` set, that id gets no mass and the spread is `p / (V - 2)`,
/// otherwise it is `p / (V - 1)`.
pub fn label_smoothing_target(
    gold: u32,
    num_classes: usize,
    p: f64,
    blank: Option<u32>,
) -> Vec<f32> {
    let blank = blank.filter(|&b| (b as usize) < num_classes && b != gold);
    let others = num_classes.saturating_sub(1 + blank.is_some() as usize);
    let mut target = vec![0f32; num_classes];
    if others == 0 {
        target[gold as usize] = 1.0;
        return target;
    }
    target.fill((p / others as f64) as f32);
    if let Some(b) = blank {
        target[b as usize] = 0.0;
    }
    target[gold as usize] = (1.0 - p) as f32;
    target
}

/// logits [B, U, V] against `targets[b]` (valid positions only) => scalar.
///
/// Token losses are summed over the valid positions of every row and
/// divided by the batch size.
pub fn cross_entropy_label_smoothing(
    logits: &Tensor,
    targets: &[Vec<u32>],
    label_smoothing_prob: f64,
    blank: Option<u32>,
) -> Result<Tensor> {
    let (b, u, v) = logits.dims3()?;
    if targets.len() != b {
        candle::bail!("{} target rows for a batch of {b}", targets.len());
    }
    let mut dist = vec![0f32; b * u * v];
    for (i, row) in targets.iter().enumerate() {
        if row.len() > u {
            candle::bail!("target row {i} has {} tokens for {u} steps", row.len());
        }
        for (t, &gold) in row.iter().enumerate() {
            let offset = (i * u + t) * v;
            dist[offset..offset + v]
                .copy_from_slice(&label_smoothing_target(gold, v, label_smoothing_prob, blank));
        }
    }
    let dist = Tensor::from_vec(dist, (b, u, v), logits.device())?;
    let log_probs = logits.log_softmax(D::Minus1)?;
    dist.mul(&log_probs)?.sum_all()?.neg()? / b as f64
}

/// Squared deviation of each head's total coverage from an even spread of
/// `U` steps over the `T'` valid frames, averaged over batch and heads.
pub fn attention_regularization(
    weights: &[Tensor],
    out_lens: &[usize],
    frame_lens: &[usize],
) -> Result<Tensor> {
    let steps = Tensor::stack(weights, 1)?;
    let (b, u, h, t) = steps.dims4()?;
    let device = steps.device();
    let step_mask = length_mask(out_lens, u, device)?.reshape((b, u, 1, 1))?;
    let coverage = steps.broadcast_mul(&step_mask)?.sum(1)?;
    let target: Vec<f32> = out_lens
        .iter()
        .zip(frame_lens)
        .map(|(&steps, &frames)| steps.min(u) as f32 / frames.max(1) as f32)
        .collect();
    let target = Tensor::from_vec(target, (b, 1, 1), device)?;
    let frame_mask = length_mask(frame_lens, t, device)?.unsqueeze(1)?;
    let diff = coverage.broadcast_sub(&target)?.broadcast_mul(&frame_mask)?;
    diff.sqr()?.sum_all()? / (b * h) as f64
}

/// Per-task loss terms; absent terms are not part of the configuration.
#[derive(Clone, Debug, Default)]
pub struct TaskLosses {
    pub attention: Option<Tensor>,
    pub ctc: Option<Tensor>,
    pub att_reg: Option<Tensor>,
}

#[derive(Clone, Debug)]
pub struct ComposedLoss {
    pub total: Tensor,
    pub main: Tensor,
    pub sub: Option<Tensor>,
}

/// Weighted sum of both tasks' attention, CTC and regularization terms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossComposer {
    pub main_loss_weight: f64,
    pub sub_loss_weight: f64,
    pub ctc_loss_weight: f64,
    pub ctc_loss_weight_sub: f64,
    pub att_reg_weight: f64,
}

impl LossComposer {
    pub fn from_config(cfg: &Config) -> Self {
        let (sub_loss_weight, ctc_loss_weight_sub) = cfg
            .sub_task
            .as_ref()
            .map_or((0.0, 0.0), |s| (s.sub_loss_weight, s.ctc_loss_weight_sub));
        Self {
            main_loss_weight: cfg.training.main_loss_weight,
            sub_loss_weight,
            ctc_loss_weight: cfg.training.ctc_loss_weight,
            ctc_loss_weight_sub,
            att_reg_weight: cfg.training.att_reg_weight,
        }
    }

    /// `(1 - w) * attention + w * ctc` within one task.
    fn partition(losses: &TaskLosses, ctc_weight: f64, device: &Device) -> Result<Tensor> {
        let mut total = Tensor::zeros((), candle::DType::F32, device)?;
        if let Some(att) = &losses.attention {
            total = total.add(&att.affine(1.0 - ctc_weight, 0.0)?)?;
        }
        if let Some(ctc) = &losses.ctc {
            total = total.add(&ctc.affine(ctc_weight, 0.0)?)?;
        }
        Ok(total)
    }

    pub fn compose(&self, main: &TaskLosses, sub: Option<&TaskLosses>) -> Result<ComposedLoss> {
        let device = match main.attention.as_ref().or(main.ctc.as_ref()) {
            Some(t) => t.device().clone(),
            None => candle::bail!("main task produced no loss term"),
        };
        let main_loss = Self::partition(main, self.ctc_loss_weight, &device)?;
        let mut total = main_loss.affine(self.main_loss_weight, 0.0)?;

        let sub_loss = match sub {
            Some(sub) => {
                let loss = Self::partition(sub, self.ctc_loss_weight_sub, &device)?;
                total = total.add(&loss.affine(self.sub_loss_weight, 0.0)?)?;
                Some(loss)
            }
            None => None,
        };

        if self.att_reg_weight > 0.0 {
            let regs = std::iter::once(main).chain(sub).filter_map(|l| l.att_reg.as_ref());
            for reg in regs {
                total = total.add(&reg.affine(self.att_reg_weight, 0.0)?)?;
            }
        }

        Ok(ComposedLoss {
            total,
            main: main_loss,
            sub: sub_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothed_target_matches_definition() {
        let target = label_smoothing_target(2, 5, 0.1, None);
        assert_eq!(target.len(), 5);
        assert!((target[2] - 0.9).abs() < 1e-7);
        for (i, &q) in target.iter().enumerate() {
            if i != 2 {
                assert!((q - 0.025).abs() < 1e-7);
            }
        }
        let sum: f32 = target.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn smoothed_cross_entropy_by_hand() -> Result<()> {
        let logits = [1f64, 2., 0.5, -1., 0.];
        let lse = logits.iter().map(|l| l.exp()).sum::<f64>().ln();
        let lp: Vec<f64> = logits.iter().map(|l| l - lse).collect();
        let expected = -(0.9 * lp[1] + 0.025 * (lp[0] + lp[2] + lp[3] + lp[4]));

        let input: Vec<f32> = logits.iter().map(|&l| l as f32).collect();
        let t = Tensor::from_vec(input, (1, 1, 5), &Device::Cpu)?;
        let loss = cross_entropy_label_smoothing(&t, &[vec![1]], 0.1, None)?.to_scalar::<f32>()?;
        assert!((loss as f64 - expected).abs() < 1e-5, "{loss} vs {expected}");
        Ok(())
    }

    #[test]
    fn blank_gets_no_smoothing_mass() {
        let target = label_smoothing_target(3, 5, 0.3, Some(0));
        assert_eq!(target[0], 0.0);
        assert!((target[3] - 0.7).abs() < 1e-7);
        for i in [1, 2, 4] {
            assert!((target[i] - 0.1).abs() < 1e-7);
        }
        let sum: f32 = target.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn smoothed_cross_entropy_ignores_blank_logit_target() -> Result<()> {
        let logits = [3f64, 0.5, -1., 1.];
        let lse = logits.iter().map(|l| l.exp()).sum::<f64>().ln();
        let lp: Vec<f64> = logits.iter().map(|l| l - lse).collect();
        let expected = -(0.8 * lp[2] + 0.1 * (lp[1] + lp[3]));

        let input: Vec<f32> = logits.iter().map(|&l| l as f32).collect();
        let t = Tensor::from_vec(input, (1, 1, 4), &Device::Cpu)?;
        let loss = cross_entropy_label_smoothing(&t, &[vec![2]], 0.2, Some(0))?;
        let loss = loss.to_scalar::<f32>()?;
        assert!((loss as f64 - expected).abs() < 1e-5, "{loss} vs {expected}");
        Ok(())
    }

    #[test]
    fn padding_positions_do_not_contribute() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::randn(0f32, 1., (2, 3, 4), &dev)?;
        let full = cross_entropy_label_smoothing(&logits, &[vec![1, 2], vec![3]], 0.0, None)?;
        let row = |i| logits.narrow(0, i, 1);
        let first = cross_entropy_label_smoothing(&row(0)?, &[vec![1, 2]], 0.0, None)?;
        let second = cross_entropy_label_smoothing(&row(1)?, &[vec![3]], 0.0, None)?;
        let expected = (first.to_scalar::<f32>()? + second.to_scalar::<f32>()?) / 2.0;
        assert!((full.to_scalar::<f32>()? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn uniform_coverage_has_no_penalty() -> Result<()> {
        let dev = Device::Cpu;
        // two steps over four frames, each step spreads evenly
        let step = Tensor::full(0.25f32, (1, 1, 4), &dev)?;
        let reg = attention_regularization(&[step.clone(), step], &[2], &[4])?;
        assert!(reg.to_scalar::<f32>()?.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn ctc_weight_partitions_a_task() -> Result<()> {
        let dev = Device::Cpu;
        let composer = LossComposer {
            main_loss_weight: 1.0,
            sub_loss_weight: 0.5,
            ctc_loss_weight: 0.25,
            ctc_loss_weight_sub: 1.0,
            att_reg_weight: 0.0,
        };
        let main = TaskLosses {
            attention: Some(Tensor::new(4f32, &dev)?),
            ctc: Some(Tensor::new(8f32, &dev)?),
            att_reg: None,
        };
        let sub = TaskLosses {
            ctc: Some(Tensor::new(2f32, &dev)?),
            ..Default::default()
        };
        let out = composer.compose(&main, Some(&sub))?;
        assert!((out.main.to_scalar::<f32>()? - 5.0).abs() < 1e-6);
        assert!((out.total.to_scalar::<f32>()? - 6.0).abs() < 1e-6);
        Ok(())
    }
}
