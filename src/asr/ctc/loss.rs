use candle::{Result, Tensor};

use crate::asr::common::tensor_ext::{length_mask, TensorExt, LOG_ZERO};

/// Frames needed to emit `labels`: one per label plus a blank between repeats.
pub fn min_frames(labels: &[u32]) -> usize {
    let repeats = labels.windows(2).filter(|w| w[0] == w[1]).count();
    labels.len() + repeats
}

/// Shifts `[B, S]` right by `k` states, filling the gap with log zero.
fn shift(alpha: &Tensor, k: usize) -> Result<Tensor> {
    let (b, s) = alpha.dims2()?;
    if k >= s {
        return Tensor::full(LOG_ZERO, (b, s), alpha.device());
    }
    let pad = Tensor::full(LOG_ZERO, (b, k), alpha.device())?;
    Tensor::cat(&[&pad, &alpha.narrow(1, 0, s - k)?], 1)
}

/// Negative log-likelihood of each label sequence under `log_probs` [B, T', C].
///
/// The alpha recursion runs over the blank-interleaved labels entirely on
/// tensors, so the result is differentiable. Rows stop updating past their
/// input length.
pub fn ctc_loss(
    log_probs: &Tensor,
    input_lens: &[usize],
    labels: &[Vec<u32>],
    blank: u32,
) -> Result<Tensor> {
    let (b, t, _) = log_probs.dims3()?;
    let device = log_probs.device();
    if labels.len() != b || input_lens.len() != b {
        candle::bail!(
            "ctc batch mismatch: {b} rows, {} labels, {} lengths",
            labels.len(),
            input_lens.len()
        );
    }
    let s_max = labels.iter().map(|l| 2 * l.len() + 1).max().unwrap_or(1);

    let mut ext = Vec::with_capacity(b * s_max);
    let mut skip = Vec::with_capacity(b * s_max);
    let mut valid = Vec::with_capacity(b * s_max);
    let mut start = Vec::with_capacity(b * s_max);
    let mut end_idx = Vec::with_capacity(b * 2);
    let mut end_keep = Vec::with_capacity(b * 2);
    for seq in labels {
        let s_len = 2 * seq.len() + 1;
        let row: Vec<u32> = (0..s_max)
            .map(|s| if s % 2 == 1 && s < s_len { seq[s / 2] } else { blank })
            .collect();
        for s in 0..s_max {
            let can_skip = s % 2 == 1 && s >= 3 && s < s_len && row[s] != row[s - 2];
            skip.push(if can_skip { 1f32 } else { 0. });
            valid.push(if s < s_len { 1f32 } else { 0. });
            start.push(if s < 2 && s < s_len { 1f32 } else { 0. });
        }
        ext.extend(row);
        end_idx.push((s_len - 1) as u32);
        end_idx.push(s_len.saturating_sub(2) as u32);
        end_keep.push(1f32);
        end_keep.push(if seq.is_empty() { 0. } else { 1. });
    }
    let ext = Tensor::from_vec(ext, (b, s_max), device)?;
    let skip = Tensor::from_vec(skip, (b, s_max), device)?;
    let valid = Tensor::from_vec(valid, (b, s_max), device)?;
    let start = Tensor::from_vec(start, (b, s_max), device)?;
    let end_idx = Tensor::from_vec(end_idx, (b, 2), device)?;
    let end_keep = Tensor::from_vec(end_keep, (b, 2), device)?;
    let frames = length_mask(input_lens, t, device)?;

    let emit = |ti: usize| -> Result<Tensor> {
        log_probs
            .narrow(1, ti, 1)?
            .squeeze(1)?
            .contiguous()?
            .gather(&ext, 1)
    };

    let mut alpha = emit(0)?.masked_fill(&start, LOG_ZERO)?;
    for ti in 1..t {
        let stay = alpha.clone();
        let step = shift(&alpha, 1)?;
        let jump = shift(&alpha, 2)?.masked_fill(&skip, LOG_ZERO)?;
        let next = Tensor::stack(&[&stay, &step, &jump], 2)?
            .log_sum_exp_keepdim(2)?
            .squeeze(2)?
            .add(&emit(ti)?)?
            .masked_fill(&valid, LOG_ZERO)?;
        let keep = frames.narrow(1, ti, 1)?;
        let hold = keep.affine(-1.0, 1.0)?;
        alpha = next
            .broadcast_mul(&keep)?
            .add(&alpha.broadcast_mul(&hold)?)?;
    }

    let ends = alpha.gather(&end_idx, 1)?.masked_fill(&end_keep, LOG_ZERO)?;
    ends.log_sum_exp_keepdim(1)?.squeeze(1)?.neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::ctc::CtcLattice;
    use candle::Device;

    fn log_probs(rows: &[[f32; 3]]) -> Vec<Vec<f32>> {
        rows.iter()
            .map(|r| {
                let z: f32 = r.iter().sum();
                r.iter().map(|p| (p / z).ln()).collect()
            })
            .collect()
    }

    #[test]
    fn min_frames_counts_repeats() {
        assert_eq!(min_frames(&[1, 1, 2]), 4);
        assert_eq!(min_frames(&[]), 0);
    }

    #[test]
    fn tensor_loss_matches_host_lattice() -> Result<()> {
        let dev = Device::Cpu;
        let a = log_probs(&[[0.5, 0.3, 0.2], [0.2, 0.6, 0.2], [0.3, 0.3, 0.4], [0.6, 0.2, 0.2]]);
        let b = log_probs(&[[0.1, 0.1, 0.8], [0.4, 0.4, 0.2], [0.3, 0.3, 0.4], [0.3, 0.3, 0.4]]);
        let labels = vec![vec![1, 2], vec![2]];
        let flat: Vec<f32> = a.iter().chain(b.iter()).flatten().copied().collect();
        let lp = Tensor::from_vec(flat, (2, 4, 3), &dev)?;
        let nll = ctc_loss(&lp, &[4, 2], &labels, 0)?.to_vec1::<f32>()?;

        let expected_a = -CtcLattice::new(&a, &labels[0], 0).log_likelihood_alpha();
        let expected_b = -CtcLattice::new(&b[..2], &labels[1], 0).log_likelihood_alpha();
        assert!((nll[0] as f64 - expected_a).abs() < 1e-4, "{} vs {expected_a}", nll[0]);
        assert!((nll[1] as f64 - expected_b).abs() < 1e-4, "{} vs {expected_b}", nll[1]);
        Ok(())
    }

    #[test]
    fn empty_label_sequence_is_all_blank() -> Result<()> {
        let dev = Device::Cpu;
        let a = log_probs(&[[0.5, 0.3, 0.2], [0.25, 0.5, 0.25]]);
        let flat: Vec<f32> = a.iter().flatten().copied().collect();
        let lp = Tensor::from_vec(flat, (1, 2, 3), &dev)?;
        let nll = ctc_loss(&lp, &[2], &[vec![]], 0)?.to_vec1::<f32>()?;
        let expected = -(0.5f64.ln() + 0.25f64.ln());
        assert!((nll[0] as f64 - expected).abs() < 1e-5);
        Ok(())
    }
}
