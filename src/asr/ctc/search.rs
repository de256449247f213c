use std::collections::HashMap;

use candle::{Result, Tensor, D};

use crate::asr::ctc::log_add;

#[derive(Clone, Debug, PartialEq)]
pub struct CtcHypothesis {
    pub labels: Vec<u32>,
    pub log_prob: f64,
}

/// Best-path decoding: arg-max per frame, merge repeats, drop blanks.
pub fn ctc_greedy_decode(log_probs: &Tensor, lens: &[usize], blank: u32) -> Result<Vec<Vec<u32>>> {
    let best = log_probs.argmax(D::Minus1)?.to_vec2::<u32>()?;
    Ok(best
        .iter()
        .zip(lens)
        .map(|(frames, &len)| {
            let mut out = Vec::new();
            let mut prev = None;
            for &c in &frames[..len.min(frames.len())] {
                if c != blank && Some(c) != prev {
                    out.push(c);
                }
                prev = Some(c);
            }
            out
        })
        .collect())
}

/// Candidates at one frame, kept in the order they were first reached.
#[derive(Default)]
struct NextBeam {
    entries: Vec<(Vec<u32>, f64, f64)>,
    index: HashMap<Vec<u32>, usize>,
}

impl NextBeam {
    fn entry(&mut self, prefix: Vec<u32>) -> &mut (Vec<u32>, f64, f64) {
        let i = match self.index.get(&prefix) {
            Some(&i) => i,
            None => {
                self.index.insert(prefix.clone(), self.entries.len());
                self.entries
                    .push((prefix, f64::NEG_INFINITY, f64::NEG_INFINITY));
                self.entries.len() - 1
            }
        };
        &mut self.entries[i]
    }
}

/// Prefix beam search over one utterance's `[T][C]` log-probabilities.
/// Returns up to `beam_width` prefixes, best first.
pub fn ctc_beam_search(
    log_probs: &[Vec<f32>],
    beam_width: usize,
    blank: u32,
) -> Vec<CtcHypothesis> {
    // (prefix, log P(ends in blank), log P(ends in label))
    let mut beam: Vec<(Vec<u32>, f64, f64)> = vec![(vec![], 0.0, f64::NEG_INFINITY)];

    for frame in log_probs {
        let mut next = NextBeam::default();
        for (c, &p) in frame.iter().enumerate() {
            let c = c as u32;
            let p = p as f64;
            for (prefix, p_b, p_nb) in &beam {
                if c == blank {
                    let e = next.entry(prefix.clone());
                    e.1 = log_add(e.1, log_add(p_b + p, p_nb + p));
                    continue;
                }
                let end = prefix.last().copied();
                let mut extended = prefix.clone();
                extended.push(c);
                let e = next.entry(extended);
                if Some(c) != end {
                    e.2 = log_add(e.2, log_add(p_b + p, p_nb + p));
                } else {
                    // repeated label without a blank in between collapses
                    e.2 = log_add(e.2, p_b + p);
                    let e = next.entry(prefix.clone());
                    e.2 = log_add(e.2, p_nb + p);
                }
            }
        }
        beam = next.entries;
        beam.sort_by(|a, b| log_add(b.1, b.2).total_cmp(&log_add(a.1, a.2)));
        beam.truncate(beam_width.max(1));
    }

    beam.into_iter()
        .map(|(labels, p_b, p_nb)| CtcHypothesis {
            labels,
            log_prob: log_add(p_b, p_nb),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn ln(rows: &[[f32; 3]]) -> Vec<Vec<f32>> {
        rows.iter().map(|r| r.iter().map(|p| p.ln()).collect()).collect()
    }

    #[test]
    fn greedy_merges_repeats_and_drops_blank() -> Result<()> {
        let lp = ln(&[
            [0.1, 0.8, 0.1],
            [0.1, 0.8, 0.1],
            [0.8, 0.1, 0.1],
            [0.1, 0.8, 0.1],
            [0.1, 0.1, 0.8],
        ]);
        let flat: Vec<f32> = lp.iter().flatten().copied().collect();
        let t = Tensor::from_vec(flat, (1, 5, 3), &Device::Cpu)?;
        assert_eq!(ctc_greedy_decode(&t, &[5], 0)?, vec![vec![1, 1, 2]]);
        assert_eq!(ctc_greedy_decode(&t, &[2], 0)?, vec![vec![1]]);
        Ok(())
    }

    #[test]
    fn prefix_search_sums_paths_that_greedy_splits() {
        // Greedy picks blank at both frames, but "1" collects more total mass.
        let lp = ln(&[[0.4, 0.35, 0.25], [0.4, 0.35, 0.25]]);
        let hyps = ctc_beam_search(&lp, 4, 0);
        assert_eq!(hyps[0].labels, vec![1]);
        let mass_1 = 0.4 * 0.35 + 0.35 * 0.4 + 0.35 * 0.35;
        assert!((hyps[0].log_prob - f64::ln(mass_1)).abs() < 1e-6);
        let blank_only = hyps.iter().find(|h| h.labels.is_empty()).expect("empty prefix kept");
        assert!((blank_only.log_prob - f64::ln(0.16)).abs() < 1e-6);
    }

    #[test]
    fn beam_width_one_keeps_single_prefix() {
        let lp = ln(&[[0.2, 0.7, 0.1], [0.6, 0.2, 0.2]]);
        let hyps = ctc_beam_search(&lp, 1, 0);
        assert_eq!(hyps.len(), 1);
        assert_eq!(hyps[0].labels, vec![1]);
    }
}
