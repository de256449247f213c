use rand::{rngs::StdRng, Rng, SeedableRng};

/// Linear warm-up of the probability of feeding back the model's own prediction.
pub struct ScheduledSampling {
    max_prob: f64,
    max_step: usize,
    step: usize,
    rng: StdRng,
}

impl ScheduledSampling {
    pub fn new(max_prob: f64, max_step: usize, seed: u64) -> Self {
        Self {
            max_prob,
            max_step,
            step: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `min(max_prob, max_prob * step / max_step)`, zero when disabled.
    pub fn probability(&self, step: usize) -> f64 {
        if self.max_prob <= 0.0 || self.max_step == 0 {
            return 0.0;
        }
        (self.max_prob * step as f64 / self.max_step as f64).min(self.max_prob)
    }

    pub fn current_probability(&self) -> f64 {
        self.probability(self.step)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Counts one optimizer step.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// One draw per output position; the first position always takes the gold input.
    pub fn decisions(&mut self, num_steps: usize) -> Vec<bool> {
        let prob = self.current_probability();
        (0..num_steps)
            .map(|t| t > 0 && prob > 0.0 && self.rng.gen::<f64>() < prob)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_ramps_then_caps() {
        let ss = ScheduledSampling::new(0.4, 100, 0);
        assert_eq!(ss.probability(0), 0.0);
        let mut prev = 0.0;
        for step in 0..300 {
            let p = ss.probability(step);
            assert!(p >= prev);
            assert!(p <= 0.4);
            prev = p;
        }
        assert!((ss.probability(50) - 0.2).abs() < 1e-12);
        assert_eq!(ss.probability(100), 0.4);
        assert_eq!(ss.probability(1000), 0.4);
    }

    #[test]
    fn nothing_is_sampled_at_step_zero() {
        let mut ss = ScheduledSampling::new(0.9, 10, 7);
        assert!(ss.decisions(20).iter().all(|&d| !d));
        for _ in 0..10 {
            ss.advance();
        }
        let decisions = ss.decisions(200);
        assert!(!decisions[0]);
        assert!(decisions.iter().any(|&d| d));
    }

    #[test]
    fn same_seed_same_decisions() {
        let mut a = ScheduledSampling::new(0.5, 1, 3);
        let mut b = ScheduledSampling::new(0.5, 1, 3);
        a.advance();
        b.advance();
        assert_eq!(a.decisions(50), b.decisions(50));
    }
}
