use crate::asr::ctc::log_add;

/// Host-side forward-backward over the blank-interleaved label sequence.
#[derive(Clone, Debug)]
pub struct CtcLattice {
    ext: Vec<u32>,
    /// [T][S] log P(prefix through state s at t, emissions 0..=t)
    alpha: Vec<Vec<f64>>,
    /// [T][S] log P(emissions t+1.. | state s at t)
    beta: Vec<Vec<f64>>,
    first_emit: [f64; 2],
}

impl CtcLattice {
    pub fn new(log_probs: &[Vec<f32>], labels: &[u32], blank: u32) -> Self {
        let mut ext = Vec::with_capacity(2 * labels.len() + 1);
        ext.push(blank);
        for &l in labels {
            ext.push(l);
            ext.push(blank);
        }
        let s_len = ext.len();
        let t_len = log_probs.len();
        let lp = |t: usize, s: usize| log_probs[t][ext[s] as usize] as f64;
        let can_skip = |s: usize| s >= 2 && ext[s] != blank && ext[s] != ext[s - 2];

        let mut alpha = vec![vec![f64::NEG_INFINITY; s_len]; t_len];
        let mut beta = vec![vec![f64::NEG_INFINITY; s_len]; t_len];
        let mut first_emit = [f64::NEG_INFINITY; 2];
        if t_len == 0 {
            return Self {
                ext,
                alpha,
                beta,
                first_emit,
            };
        }

        for (s, first) in first_emit.iter_mut().enumerate().take(s_len.min(2)) {
            *first = lp(0, s);
            alpha[0][s] = *first;
        }
        for t in 1..t_len {
            for s in 0..s_len {
                let mut acc = alpha[t - 1][s];
                if s >= 1 {
                    acc = log_add(acc, alpha[t - 1][s - 1]);
                }
                if can_skip(s) {
                    acc = log_add(acc, alpha[t - 1][s - 2]);
                }
                alpha[t][s] = acc + lp(t, s);
            }
        }

        beta[t_len - 1][s_len - 1] = 0.0;
        if s_len >= 2 {
            beta[t_len - 1][s_len - 2] = 0.0;
        }
        for t in (0..t_len - 1).rev() {
            for s in 0..s_len {
                let mut acc = beta[t + 1][s] + lp(t + 1, s);
                if s + 1 < s_len {
                    acc = log_add(acc, beta[t + 1][s + 1] + lp(t + 1, s + 1));
                }
                if s + 2 < s_len && can_skip(s + 2) {
                    acc = log_add(acc, beta[t + 1][s + 2] + lp(t + 1, s + 2));
                }
                beta[t][s] = acc;
            }
        }

        Self {
            ext,
            alpha,
            beta,
            first_emit,
        }
    }

    /// Blank-interleaved labels the lattice states correspond to.
    pub fn extended_labels(&self) -> &[u32] {
        &self.ext
    }

    pub fn log_likelihood_alpha(&self) -> f64 {
        let Some(last) = self.alpha.last() else {
            return f64::NEG_INFINITY;
        };
        let s_len = last.len();
        if s_len >= 2 {
            log_add(last[s_len - 1], last[s_len - 2])
        } else {
            last[s_len - 1]
        }
    }

    pub fn log_likelihood_beta(&self) -> f64 {
        let Some(first) = self.beta.first() else {
            return f64::NEG_INFINITY;
        };
        self.first_emit
            .iter()
            .zip(first)
            .fold(f64::NEG_INFINITY, |acc, (e, b)| log_add(acc, e + b))
    }

    /// [T][S] probability of occupying state s at frame t given the labels.
    pub fn posteriors(&self) -> Vec<Vec<f64>> {
        let ll = self.log_likelihood_alpha();
        self.alpha
            .iter()
            .zip(&self.beta)
            .map(|(a, b)| {
                a.iter()
                    .zip(b)
                    .map(|(a, b)| {
                        if ll == f64::NEG_INFINITY {
                            0.0
                        } else {
                            (a + b - ll).exp()
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs() -> Vec<Vec<f32>> {
        [[0.5f32, 0.3, 0.2], [0.2, 0.5, 0.3], [0.4, 0.1, 0.5]]
            .iter()
            .map(|r| r.iter().map(|p| p.ln()).collect())
            .collect()
    }

    /// Sums every frame path of length 3 that collapses to `labels`.
    fn brute_force(log_probs: &[Vec<f32>], labels: &[u32]) -> f64 {
        let mut total = 0.0;
        for a in 0..3u32 {
            for b in 0..3u32 {
                for c in 0..3u32 {
                    let path = [a, b, c];
                    let mut collapsed = vec![];
                    let mut prev = None;
                    for &p in &path {
                        if Some(p) != prev && p != 0 {
                            collapsed.push(p);
                        }
                        prev = Some(p);
                    }
                    if collapsed == labels {
                        total += path
                            .iter()
                            .enumerate()
                            .map(|(t, &p)| log_probs[t][p as usize] as f64)
                            .sum::<f64>()
                            .exp();
                    }
                }
            }
        }
        total.ln()
    }

    #[test]
    fn forward_backward_matches_enumeration() {
        let lp = probs();
        for labels in [vec![1], vec![1, 2], vec![2, 2], vec![]] {
            let lattice = CtcLattice::new(&lp, &labels, 0);
            let expected = brute_force(&lp, &labels);
            let alpha = lattice.log_likelihood_alpha();
            let beta = lattice.log_likelihood_beta();
            assert!((alpha - expected).abs() < 1e-6, "{labels:?}: {alpha} vs {expected}");
            assert!((beta - expected).abs() < 1e-6, "{labels:?}: {beta} vs {expected}");
        }
    }

    #[test]
    fn posteriors_sum_to_one_per_frame() {
        let lattice = CtcLattice::new(&probs(), &[1, 2], 0);
        for row in lattice.posteriors() {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
        assert_eq!(lattice.extended_labels(), &[0, 1, 0, 2, 0]);
    }
}
