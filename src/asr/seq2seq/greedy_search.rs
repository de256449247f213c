use candle::{Result, Tensor};

use crate::asr::{
    attention::AttentionKeys,
    decoder::TaskDecoder,
    encoder::EncodedSequence,
    seq2seq::beam_search::{top_k, Hypothesis},
};

pub struct GreedyOutput {
    pub hypotheses: Vec<Hypothesis>,
    /// [B, U, E] context of every step that was run.
    pub contexts: Tensor,
    /// Steps each utterance actually used, the end step included.
    pub steps: Vec<usize>,
}

/// Arg-max decoding of a whole batch; rows stop contributing once they emit `eos`.
pub fn greedy_search(
    decoder: &TaskDecoder,
    keys: &AttentionKeys,
    enc: &EncodedSequence,
    eos: u32,
    max_decode_len: usize,
    snapshot: Option<&Tensor>,
) -> Result<GreedyOutput> {
    let batch = enc.batch_size();
    let device = enc.xs.device();
    let mut state = decoder.init_state(keys, enc)?;
    let mut hypotheses = vec![
        Hypothesis {
            tokens: vec![],
            score: 0.0,
            terminal: false,
            alignments: vec![],
        };
        batch
    ];
    let mut steps = vec![0; batch];
    let mut contexts = Vec::with_capacity(max_decode_len);

    for _ in 0..max_decode_len {
        let scored = decoder.score(keys, &state, snapshot, false)?;
        let log_probs = decoder.log_probs(&scored.logits)?.to_vec2::<f32>()?;
        let weights = scored.attention().weights();
        contexts.push(scored.context().clone());

        let mut next = Vec::with_capacity(batch);
        for (b, row) in log_probs.iter().enumerate() {
            let c = top_k(row, 1, decoder.blank())[0];
            next.push(c);
            let hyp = &mut hypotheses[b];
            if hyp.terminal {
                continue;
            }
            hyp.score += row[c as usize] as f64;
            hyp.alignments.push(weights.get(b)?);
            steps[b] += 1;
            if c == eos {
                hyp.terminal = true;
            } else {
                hyp.tokens.push(c);
            }
        }
        if hypotheses.iter().all(|h| h.terminal) {
            break;
        }
        state = decoder.advance(&scored, &Tensor::new(next.as_slice(), device)?, snapshot, false)?;
    }

    Ok(GreedyOutput {
        hypotheses,
        contexts: Tensor::stack(&contexts, 1)?,
        steps,
    })
}
