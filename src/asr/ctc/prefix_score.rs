use crate::asr::ctc::log_add;

/// Forward variables of one label prefix, split by whether the last frame was blank.
#[derive(Clone, Debug)]
pub struct CtcPrefixState {
    r_nb: Vec<f64>,
    r_b: Vec<f64>,
    last: Option<u32>,
    /// log P(prefix is a prefix of the labelling)
    score: f64,
}

impl CtcPrefixState {
    pub fn score(&self) -> f64 {
        self.score
    }
}

/// Incremental CTC prefix probabilities for joint CTC/attention beam search.
pub struct CtcPrefixScorer {
    log_probs: Vec<Vec<f64>>,
    blank: u32,
    eos: u32,
}

impl CtcPrefixScorer {
    pub fn new(log_probs: &[Vec<f32>], blank: u32, eos: u32) -> Self {
        let log_probs = log_probs
            .iter()
            .map(|row| row.iter().map(|&p| p as f64).collect())
            .collect();
        Self {
            log_probs,
            blank,
            eos,
        }
    }

    fn frames(&self) -> usize {
        self.log_probs.len()
    }

    /// State of the empty prefix: only blanks emitted so far.
    pub fn initial(&self) -> CtcPrefixState {
        let t_len = self.frames();
        let mut r_b = vec![f64::NEG_INFINITY; t_len];
        let mut acc = 0.0;
        for (t, r) in r_b.iter_mut().enumerate() {
            acc += self.log_probs[t][self.blank as usize];
            *r = acc;
        }
        CtcPrefixState {
            r_nb: vec![f64::NEG_INFINITY; t_len],
            r_b,
            last: None,
            score: 0.0,
        }
    }

    /// Appends `c` to the prefix. For the end token the score becomes the
    /// probability of the complete labelling.
    pub fn extend(&self, state: &CtcPrefixState, c: u32) -> CtcPrefixState {
        let t_len = self.frames();
        if t_len == 0 {
            return CtcPrefixState {
                score: f64::NEG_INFINITY,
                ..state.clone()
            };
        }
        if c == self.eos {
            return CtcPrefixState {
                score: log_add(state.r_nb[t_len - 1], state.r_b[t_len - 1]),
                ..state.clone()
            };
        }

        let emit = |t: usize| self.log_probs[t][c as usize];
        // Mass the new label can follow at each frame; a repeated label must be separated by blank.
        let phi = |t: usize| {
            if state.last == Some(c) {
                state.r_b[t]
            } else {
                log_add(state.r_nb[t], state.r_b[t])
            }
        };

        let mut r_nb = vec![f64::NEG_INFINITY; t_len];
        let mut r_b = vec![f64::NEG_INFINITY; t_len];
        if state.last.is_none() {
            r_nb[0] = emit(0);
        }
        let mut psi = r_nb[0];
        for t in 1..t_len {
            r_nb[t] = log_add(r_nb[t - 1], phi(t - 1)) + emit(t);
            r_b[t] = log_add(r_nb[t - 1], r_b[t - 1]) + self.log_probs[t][self.blank as usize];
            psi = log_add(psi, phi(t - 1) + emit(t));
        }

        CtcPrefixState {
            r_nb,
            r_b,
            last: Some(c),
            score: psi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::ctc::CtcLattice;

    fn probs() -> Vec<Vec<f32>> {
        // classes: blank, a, b, eos
        [
            [0.4f32, 0.3, 0.2, 0.1],
            [0.3, 0.2, 0.4, 0.1],
            [0.5, 0.25, 0.15, 0.1],
            [0.2, 0.3, 0.4, 0.1],
        ]
        .iter()
        .map(|r| r.iter().map(|p| p.ln()).collect())
        .collect()
    }

    #[test]
    fn eos_score_equals_full_sequence_likelihood() {
        let lp = probs();
        let scorer = CtcPrefixScorer::new(&lp, 0, 3);
        for labels in [vec![1u32], vec![1, 2], vec![2, 2], vec![]] {
            let state = labels
                .iter()
                .fold(scorer.initial(), |st, &c| scorer.extend(&st, c));
            let full = scorer.extend(&state, 3).score();
            let expected = CtcLattice::new(&lp, &labels, 0).log_likelihood_alpha();
            assert!((full - expected).abs() < 1e-9, "{labels:?}: {full} vs {expected}");
        }
    }

    #[test]
    fn prefix_scores_do_not_increase() {
        let lp = probs();
        let scorer = CtcPrefixScorer::new(&lp, 0, 3);
        let a = scorer.extend(&scorer.initial(), 1);
        let ab = scorer.extend(&a, 2);
        assert!(a.score() <= 0.0);
        assert!(ab.score() <= a.score() + 1e-12);
    }
}
