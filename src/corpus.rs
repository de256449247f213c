//! Deterministic toy corpus for exercising the model end to end.
//!
//! Every label is rendered as a short run of frames whose energy sits in a
//! label-specific band of the feature vector, so a small model can learn the
//! mapping within a few hundred steps.

use anyhow::Result;
use candle::Device;
use las_asr::{Batch, FeatureSequence, Vocabulary};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const TOKENS: [&str; 4] = ["a", "b", "c", "d"];
pub const SUB_TOKENS: [&str; 2] = ["x", "y"];
const FRAMES_PER_LABEL: usize = 4;

pub struct Utterance {
    pub tokens: Vec<&'static str>,
    pub features: FeatureSequence,
}

pub struct ToyCorpus {
    rng: StdRng,
    input_size: usize,
    noise: f32,
}

impl ToyCorpus {
    pub fn new(seed: u64, input_size: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            input_size,
            noise: 0.1,
        }
    }

    pub fn vocab() -> Result<Vocabulary> {
        Ok(Vocabulary::new(TOKENS)?)
    }

    pub fn vocab_sub() -> Result<Vocabulary> {
        Ok(Vocabulary::new(SUB_TOKENS)?)
    }

    /// Coarse label of a token: the first half of the inventory maps to `x`.
    pub fn coarse(token: &str) -> &'static str {
        match TOKENS.iter().position(|&t| t == token) {
            Some(i) if i < TOKENS.len() / 2 => SUB_TOKENS[0],
            _ => SUB_TOKENS[1],
        }
    }

    pub fn utterance(&mut self) -> Result<Utterance> {
        let len = self.rng.gen_range(1..=4);
        let tokens: Vec<&'static str> = (0..len)
            .map(|_| TOKENS[self.rng.gen_range(0..TOKENS.len())])
            .collect();
        let band = (self.input_size / TOKENS.len()).max(1);
        let mut frames = Vec::with_capacity(len * FRAMES_PER_LABEL);
        for token in &tokens {
            let index = TOKENS.iter().position(|t| t == token).unwrap_or(0);
            for _ in 0..FRAMES_PER_LABEL {
                let frame = (0..self.input_size)
                    .map(|d| {
                        let on = d / band == index;
                        let noise = self.rng.gen_range(-self.noise..self.noise);
                        if on {
                            1.0 + noise
                        } else {
                            noise
                        }
                    })
                    .collect::<Vec<f32>>();
                frames.push(frame);
            }
        }
        Ok(Utterance {
            tokens,
            features: FeatureSequence::from_frames(&frames)?,
        })
    }

    pub fn batch(
        &mut self,
        size: usize,
        vocab: &Vocabulary,
        vocab_sub: Option<&Vocabulary>,
        device: &Device,
    ) -> Result<(Batch, Vec<Utterance>)> {
        let utterances = (0..size)
            .map(|_| self.utterance())
            .collect::<Result<Vec<_>>>()?;
        let labels = utterances
            .iter()
            .map(|u| vocab.encode(u.tokens.as_slice()))
            .collect::<las_asr::Result<Vec<_>>>()?;
        let labels_sub = match vocab_sub {
            Some(sub) => Some(
                utterances
                    .iter()
                    .map(|u| {
                        let coarse: Vec<&str> =
                            u.tokens.iter().map(|t| Self::coarse(t)).collect();
                        sub.encode(coarse.as_slice())
                    })
                    .collect::<las_asr::Result<Vec<_>>>()?,
            ),
            None => None,
        };
        let features: Vec<FeatureSequence> =
            utterances.iter().map(|u| u.features.clone()).collect();
        let batch = Batch::from_utterances(&features, labels, labels_sub, device)?;
        Ok((batch, utterances))
    }
}
