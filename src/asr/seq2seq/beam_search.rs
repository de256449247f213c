use candle::{Result, Tensor};

use crate::{
    asr::{
        attention::AttentionKeys,
        ctc::{CtcPrefixScorer, CtcPrefixState},
        decoder::{StepState, TaskDecoder},
        encoder::EncodedSequence,
    },
    config::DecodeConfig,
};

#[derive(Clone, Debug)]
pub struct Hypothesis {
    /// Emitted labels without the start or end marker.
    pub tokens: Vec<u32>,
    pub score: f64,
    /// The end marker was emitted.
    pub terminal: bool,
    /// One [H, T'] alignment per output step, the end step included.
    pub alignments: Vec<Tensor>,
}

#[derive(Clone, Debug)]
pub struct DecodeOutput {
    /// Best first.
    pub hypotheses: Vec<Hypothesis>,
    /// No hypothesis reached the end marker within the length limit.
    pub truncated: bool,
}

impl DecodeOutput {
    pub fn best(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }
}

/// The `k` best ids other than blank; equal scores favour the lower id.
pub(crate) fn top_k(log_probs: &[f32], k: usize, blank: u32) -> Vec<u32> {
    let mut ids: Vec<u32> = (0..log_probs.len() as u32).filter(|&c| c != blank).collect();
    ids.sort_by(|&a, &b| log_probs[b as usize].total_cmp(&log_probs[a as usize]));
    ids.truncate(k);
    ids
}

/// Keep the `k` highest scores. The sort is stable, so exact ties stay in
/// the order the items were pushed.
fn keep_best<T>(items: &mut Vec<T>, k: usize, score: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| score(b).total_cmp(&score(a)));
    items.truncate(k);
}

struct LiveHypothesis {
    tokens: Vec<u32>,
    score: f64,
    state: StepState,
    ctc: Option<CtcPrefixState>,
    coverage: f64,
    alignments: Vec<Tensor>,
}

struct Candidate {
    parent: usize,
    token: u32,
    score: f64,
    ctc: Option<CtcPrefixState>,
    coverage: f64,
}

/// Beam search over a single utterance (`enc` and `keys` hold one row).
///
/// Every extension scores `att + length_penalty + coverage_penalty * Δcov`,
/// where `att` is replaced by `(1 - λ) att + λ Δctc` when `ctc_weight = λ > 0`.
/// Candidates from all live hypotheses are pooled and sorted stably, so equal
/// scores keep the order in which they were generated.
pub fn beam_search(
    decoder: &TaskDecoder,
    keys: &AttentionKeys,
    enc: &EncodedSequence,
    eos: u32,
    params: &DecodeConfig,
    ctc: Option<&CtcPrefixScorer>,
    snapshot: Option<&Tensor>,
) -> Result<DecodeOutput> {
    let beam_width = params.beam_width.max(1);
    let device = enc.xs.device();
    let ctc = ctc.filter(|_| params.ctc_weight > 0.0);
    let lambda = params.ctc_weight;

    let mut live = vec![LiveHypothesis {
        tokens: vec![],
        score: 0.0,
        state: decoder.init_state(keys, enc)?,
        ctc: ctc.map(CtcPrefixScorer::initial),
        coverage: 0.0,
        alignments: vec![],
    }];
    let mut complete: Vec<Hypothesis> = vec![];

    for step in 0..params.max_decode_len {
        let mut scored = Vec::with_capacity(live.len());
        let mut candidates = Vec::with_capacity(live.len() * beam_width);
        for (i, hyp) in live.iter().enumerate() {
            let s = decoder.score(keys, &hyp.state, snapshot, false)?;
            let log_probs = decoder.log_probs(&s.logits)?.squeeze(0)?.to_vec1::<f32>()?;
            let coverage = if params.coverage_penalty > 0.0 {
                s.attention()
                    .coverage()
                    .clamp(0f32, 1f32)?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64
            } else {
                0.0
            };

            for c in top_k(&log_probs, beam_width, decoder.blank()) {
                let att = log_probs[c as usize] as f64;
                let (base, ctc_state) = match (ctc, &hyp.ctc) {
                    (Some(scorer), Some(prev)) => {
                        let next = scorer.extend(prev, c);
                        let delta = if next.score() == f64::NEG_INFINITY {
                            f64::NEG_INFINITY
                        } else {
                            next.score() - prev.score()
                        };
                        ((1.0 - lambda) * att + lambda * delta, Some(next))
                    }
                    _ => (att, None),
                };
                candidates.push(Candidate {
                    parent: i,
                    token: c,
                    score: hyp.score
                        + base
                        + params.length_penalty
                        + params.coverage_penalty * (coverage - hyp.coverage),
                    ctc: ctc_state,
                    coverage,
                });
            }
            scored.push(s);
        }

        keep_best(&mut candidates, beam_width, |c| c.score);
        tracing::trace!(
            step,
            live = live.len(),
            kept = candidates.len(),
            complete = complete.len(),
            "beam step"
        );

        let mut next_live = Vec::with_capacity(candidates.len());
        for cand in candidates {
            let parent = &live[cand.parent];
            let s = &scored[cand.parent];
            let mut alignments = parent.alignments.clone();
            alignments.push(s.attention().weights().squeeze(0)?);
            if cand.token == eos {
                complete.push(Hypothesis {
                    tokens: parent.tokens.clone(),
                    score: cand.score,
                    terminal: true,
                    alignments,
                });
                continue;
            }
            let y = Tensor::new(&[cand.token], device)?;
            let state = decoder.advance(s, &y, snapshot, false)?;
            let mut tokens = parent.tokens.clone();
            tokens.push(cand.token);
            next_live.push(LiveHypothesis {
                tokens,
                score: cand.score,
                state,
                ctc: cand.ctc,
                coverage: cand.coverage,
                alignments,
            });
        }
        live = next_live;

        if complete.len() >= beam_width || live.is_empty() {
            break;
        }
    }

    let truncated = complete.is_empty();
    let mut hypotheses = if truncated {
        tracing::debug!(
            max_decode_len = params.max_decode_len,
            "no hypothesis reached the end marker; returning partial hypotheses"
        );
        live.into_iter()
            .map(|hyp| Hypothesis {
                tokens: hyp.tokens,
                score: hyp.score,
                terminal: false,
                alignments: hyp.alignments,
            })
            .collect()
    } else {
        complete
    };
    keep_best(&mut hypotheses, beam_width, |h| h.score);

    Ok(DecodeOutput {
        hypotheses,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_skips_blank_and_breaks_ties_by_id() {
        let lp = [0.0f32, -1.0, -0.5, -0.5, -3.0];
        assert_eq!(top_k(&lp, 3, 0), vec![2, 3, 1]);
        assert_eq!(top_k(&lp, 10, 0).len(), 4);
    }

    fn candidate(parent: usize, token: u32, score: f64) -> Candidate {
        Candidate {
            parent,
            token,
            score,
            ctc: None,
            coverage: 0.0,
        }
    }

    #[test]
    fn pooled_ties_keep_generation_order_across_parents() {
        // parent 0 expands before parent 1; both offer -1.0 twice
        let mut pool = vec![
            candidate(0, 3, -1.0),
            candidate(0, 1, -1.0),
            candidate(0, 2, -4.0),
            candidate(1, 2, -1.0),
            candidate(1, 4, -0.5),
            candidate(1, 1, -1.0),
        ];
        keep_best(&mut pool, 4, |c| c.score);
        let kept: Vec<_> = pool.iter().map(|c| (c.parent, c.token)).collect();
        assert_eq!(kept, vec![(1, 4), (0, 3), (0, 1), (1, 2)]);
    }

    #[test]
    fn completed_ties_keep_completion_order() {
        let done = |tokens: Vec<u32>, score: f64| Hypothesis {
            tokens,
            score,
            terminal: true,
            alignments: vec![],
        };
        let mut hyps = vec![
            done(vec![2], -2.0),
            done(vec![1, 1], -3.0),
            done(vec![3], -2.0),
            done(vec![1], -2.0),
        ];
        keep_best(&mut hyps, 3, |h| h.score);
        let kept: Vec<_> = hyps.iter().map(|h| h.tokens.clone()).collect();
        assert_eq!(kept, vec![vec![2], vec![3], vec![1]]);
    }
}
