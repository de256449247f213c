mod beam_search;
mod greedy_search;
mod loss;
mod schedule;

pub use beam_search::{beam_search, DecodeOutput, Hypothesis};
pub use greedy_search::{greedy_search, GreedyOutput};
pub use loss::{
    attention_regularization, cross_entropy_label_smoothing, label_smoothing_target,
    ComposedLoss, LossComposer, TaskLosses,
};
pub use schedule::ScheduledSampling;

use candle::{Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::{
    asr::{
        batch::{Batch, FeatureSequence},
        common::tensor_ext::length_mask,
        ctc::{
            ctc_beam_search, ctc_greedy_decode, ctc_loss, host_log_probs, min_frames, CtcHead,
            CtcPrefixScorer,
        },
        decoder::{DecoderOutput, TaskDecoder, TaskDims},
        encoder::{EncodedSequence, RnnEncoder},
        vocab::Vocabulary,
    },
    config::{
        AttentionConfig, Config, DecodeConfig, DecoderConfig, RnnType, Task, TrainingConfig,
        UsageDecSub,
    },
    error::{ConfigError, Error, Result},
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskMetrics {
    pub loss: f32,
    pub attention_loss: Option<f32>,
    pub ctc_loss: Option<f32>,
    /// Token accuracy of the teacher-forced arg-max, end marker included.
    pub accuracy: Option<f32>,
}

pub struct TrainOutput {
    /// Scalar to call `backward` on.
    pub loss: Tensor,
    pub loss_value: f32,
    pub main: TaskMetrics,
    pub sub: Option<TaskMetrics>,
    pub sampling_prob: f64,
}

struct TaskSpec<'a> {
    task: Task,
    vocab: Vocabulary,
    enc_units: usize,
    enc_rnn_type: RnnType,
    attention: Option<(&'a AttentionConfig, &'a DecoderConfig)>,
    ctc_head: bool,
    ctc_loss_weight: f64,
    cross: Option<(UsageDecSub, usize)>,
}

/// Decoder, CTC head and vocabulary of one label granularity.
struct TaskModel {
    task: Task,
    vocab: Vocabulary,
    bridge: Option<Linear>,
    decoder: Option<TaskDecoder>,
    ctc: Option<CtcHead>,
    ctc_loss_weight: f64,
}

struct TaskForward {
    losses: TaskLosses,
    metrics: TaskMetrics,
    decoded: Option<DecoderOutput>,
}

impl TaskModel {
    fn new(spec: TaskSpec, bridge_layer: bool, vb: VarBuilder) -> candle::Result<Self> {
        let (bridge, enc_units) = match spec.attention {
            Some((_, dec)) if bridge_layer => (
                Some(candle_nn::linear(spec.enc_units, dec.num_units, vb.pp("bridge"))?),
                dec.num_units,
            ),
            _ => (None, spec.enc_units),
        };
        let decoder = match spec.attention {
            Some((att, dec)) => Some(TaskDecoder::new(
                TaskDims {
                    num_classes: spec.vocab.len(),
                    sos: spec.vocab.sos(),
                    blank: spec.vocab.blank(),
                    enc_units,
                    enc_rnn_type: spec.enc_rnn_type,
                    cross: spec.cross,
                },
                att,
                dec,
                vb.clone(),
            )?),
            None => None,
        };
        let ctc = if spec.ctc_head {
            Some(CtcHead::new(enc_units, spec.vocab.ctc_size(), vb.pp("ctc"))?)
        } else {
            None
        };
        Ok(Self {
            task: spec.task,
            vocab: spec.vocab,
            bridge,
            decoder,
            ctc,
            ctc_loss_weight: spec.ctc_loss_weight,
        })
    }

    fn bridge(&self, enc: EncodedSequence) -> candle::Result<EncodedSequence> {
        match &self.bridge {
            Some(bridge) => Ok(EncodedSequence {
                xs: bridge.forward(&enc.xs)?,
                lens: enc.lens,
            }),
            None => Ok(enc),
        }
    }

    fn decoder(&self) -> Result<&TaskDecoder> {
        self.decoder.as_ref().ok_or(match self.task {
            Task::Main => Error::Config(ConfigError::MissingMainDecoder("attention decoding")),
            Task::Sub => Error::Config(ConfigError::MissingSubTask("attention decoding")),
        })
    }

    fn check_labels(&self, enc: &EncodedSequence, labels: &[Vec<u32>]) -> Result<()> {
        for (b, seq) in labels.iter().enumerate() {
            if let Some(&bad) = seq.iter().find(|&&id| !self.vocab.is_label(id)) {
                return Err(Error::input(format!(
                    "{:?} label {bad} of utterance {b} is outside 1..={}",
                    self.task,
                    self.vocab.num_labels()
                )));
            }
            if self.ctc_loss_weight > 0.0 && enc.lens[b] < min_frames(seq) {
                return Err(Error::input(format!(
                    "utterance {b} has {} encoded frames but its {} {:?} labels need {}",
                    enc.lens[b],
                    seq.len(),
                    self.task,
                    min_frames(seq)
                )));
            }
        }
        Ok(())
    }

    fn forward(
        &self,
        enc: &EncodedSequence,
        labels: &[Vec<u32>],
        sample_at: &[bool],
        snapshot: Option<&Tensor>,
        training: &TrainingConfig,
        train: bool,
    ) -> Result<TaskForward> {
        self.check_labels(enc, labels)?;
        let batch = labels.len() as f64;
        let mut losses = TaskLosses::default();
        let mut metrics = TaskMetrics::default();
        let mut decoded = None;

        if let (Some(decoder), true) = (&self.decoder, self.ctc_loss_weight < 1.0) {
            let eos = self.vocab.eos();
            let u = labels.iter().map(Vec::len).max().unwrap_or(0) + 1;
            let targets: Vec<Vec<u32>> = labels
                .iter()
                .map(|seq| seq.iter().copied().chain(std::iter::once(eos)).collect())
                .collect();
            let padded: Vec<u32> = targets
                .iter()
                .flat_map(|row| row.iter().copied().chain(std::iter::repeat(eos)).take(u))
                .collect();
            let padded = Tensor::from_vec(padded, (targets.len(), u), enc.xs.device())?;

            let keys = decoder.prepare(enc)?;
            let out = decoder.forward_train(&keys, enc, &padded, sample_at, snapshot, train)?;
            let logits = if training.logits_temperature != 1.0 {
                out.logits.affine(1.0 / training.logits_temperature, 0.0)?
            } else {
                out.logits.clone()
            };
            let att = cross_entropy_label_smoothing(
                &logits,
                &targets,
                training.label_smoothing_prob,
                Some(decoder.blank()),
            )?;
            metrics.attention_loss = Some(att.to_scalar::<f32>()?);
            metrics.accuracy = Some(token_accuracy(&out.logits, &targets)?);
            losses.attention = Some(att);

            if training.att_reg_weight > 0.0 {
                let out_lens: Vec<usize> = targets.iter().map(Vec::len).collect();
                let reg = attention_regularization(&out.weights, &out_lens, &enc.lens)?;
                losses.att_reg = Some(reg);
            }
            decoded = Some(out);
        }

        if let (Some(head), true) = (&self.ctc, self.ctc_loss_weight > 0.0) {
            let log_probs = head.log_probs(&enc.xs)?;
            let nll = ctc_loss(&log_probs, &enc.lens, labels, self.vocab.blank())?;
            let ctc = (nll.sum_all()? / batch)?;
            metrics.ctc_loss = Some(ctc.to_scalar::<f32>()?);
            losses.ctc = Some(ctc);
        }

        Ok(TaskForward {
            losses,
            metrics,
            decoded,
        })
    }
}

fn token_accuracy(logits: &Tensor, targets: &[Vec<u32>]) -> candle::Result<f32> {
    let best = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
    let (hit, total) = best
        .iter()
        .zip(targets)
        .flat_map(|(pred, gold)| pred.iter().zip(gold))
        .fold((0usize, 0usize), |(hit, total), (p, g)| {
            (hit + usize::from(p == g), total + 1)
        });
    Ok(if total == 0 {
        0.0
    } else {
        hit as f32 / total as f32
    })
}

/// Length-masked mean over steps of `contexts` [B, U, E] => [B, E].
fn context_snapshot(contexts: &Tensor, steps: &[usize]) -> candle::Result<Tensor> {
    let (b, u, _) = contexts.dims3()?;
    let mask = length_mask(steps, u, contexts.device())?.unsqueeze(2)?;
    let counts: Vec<f32> = steps.iter().map(|&s| s.clamp(1, u.max(1)) as f32).collect();
    let counts = Tensor::from_vec(counts, (b, 1), contexts.device())?;
    contexts
        .broadcast_mul(&mask)?
        .sum(1)?
        .broadcast_div(&counts)
}

struct Encoded {
    main: EncodedSequence,
    sub: Option<EncodedSequence>,
}

/// Joint CTC/attention encoder-decoder with an optional hierarchical sub-task.
pub struct AttentionSeq2seq {
    config: Config,
    device: Device,
    encoder: RnnEncoder,
    main: TaskModel,
    sub: Option<TaskModel>,
    composer: LossComposer,
    sampling: ScheduledSampling,
}

impl AttentionSeq2seq {
    pub fn new(
        config: Config,
        vocab: Vocabulary,
        vocab_sub: Option<Vocabulary>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let num_layers_sub = config.sub_task.as_ref().map(|s| s.encoder_num_layers_sub);
        let encoder = RnnEncoder::new(
            config.input_size,
            &config.encoder,
            num_layers_sub,
            vb.pp("encoder"),
        )?;

        let main_attention = config
            .has_main_attention()
            .then_some((&config.attention, &config.decoder));
        let main_enc_units = match main_attention {
            Some((_, dec)) if config.bridge_layer => dec.num_units,
            _ => encoder.output_units(),
        };
        let main = TaskModel::new(
            TaskSpec {
                task: Task::Main,
                vocab,
                enc_units: encoder.output_units(),
                enc_rnn_type: encoder.rnn_type(),
                attention: main_attention,
                ctc_head: config.training.ctc_loss_weight > 0.0 || config.decode.ctc_weight > 0.0,
                ctc_loss_weight: config.training.ctc_loss_weight,
                cross: None,
            },
            config.bridge_layer,
            vb.pp("main"),
        )?;

        let sub = match (&config.sub_task, vocab_sub) {
            (Some(sub_cfg), Some(vocab_sub)) => {
                let sub_units = encoder.sub_units().ok_or(ConfigError::SubLayerOutOfRange {
                    index: sub_cfg.encoder_num_layers_sub,
                    num_layers: config.encoder.num_layers,
                })?;
                Some(TaskModel::new(
                    TaskSpec {
                        task: Task::Sub,
                        vocab: vocab_sub,
                        enc_units: sub_units,
                        enc_rnn_type: encoder.rnn_type(),
                        attention: sub_cfg
                            .has_attention()
                            .then_some((&sub_cfg.attention, &sub_cfg.decoder)),
                        ctc_head: sub_cfg.ctc_loss_weight_sub > 0.0
                            || config.decode.ctc_weight > 0.0,
                        ctc_loss_weight: sub_cfg.ctc_loss_weight_sub,
                        cross: Some((sub_cfg.usage_dec_sub, main_enc_units)),
                    },
                    config.bridge_layer,
                    vb.pp("sub"),
                )?)
            }
            (Some(_), None) => {
                return Err(ConfigError::InvalidVocabulary(
                    "a sub-task is configured without a sub-task vocabulary".into(),
                )
                .into())
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingSubTask("a sub-task vocabulary").into())
            }
            (None, None) => None,
        };

        let composer = LossComposer::from_config(&config);
        let sampling = ScheduledSampling::new(
            config.training.scheduled_sampling_prob,
            config.training.scheduled_sampling_max_step,
            config.training.seed,
        );
        tracing::debug!(
            encoder_units = encoder.output_units(),
            sub_task = sub.is_some(),
            "built attention seq2seq model"
        );

        Ok(Self {
            config,
            device: vb.device().clone(),
            encoder,
            main,
            sub,
            composer,
            sampling,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &RnnEncoder {
        &self.encoder
    }

    pub fn vocab(&self, task: Task) -> Result<&Vocabulary> {
        Ok(&self.task_model(task)?.vocab)
    }

    pub fn sampling(&self) -> &ScheduledSampling {
        &self.sampling
    }

    fn task_model(&self, task: Task) -> Result<&TaskModel> {
        match task {
            Task::Main => Ok(&self.main),
            Task::Sub => self
                .sub
                .as_ref()
                .ok_or(Error::Config(ConfigError::MissingSubTask("sub-task decoding"))),
        }
    }

    fn encode(&self, batch: &Batch, train: bool) -> Result<Encoded> {
        let dim = batch.xs.dim(2)?;
        if dim != self.config.input_size {
            return Err(Error::input(format!(
                "feature width {dim} does not match input_size {}",
                self.config.input_size
            )));
        }
        let too_short = |&t: &usize| {
            self.encoder.output_length(t) == 0 || self.encoder.output_length_sub(t) == Some(0)
        };
        if let Some(b) = batch.x_lens.iter().position(too_short) {
            return Err(Error::input(format!(
                "utterance {b} ({} frames) is too short for the subsampling policy",
                batch.x_lens[b]
            )));
        }
        let out = self.encoder.forward(&batch.xs, &batch.x_lens, train)?;
        let main = self.main.bridge(out.main)?;
        let sub = match (&self.sub, out.sub) {
            (Some(task), Some(enc)) => Some(task.bridge(enc)?),
            _ => None,
        };
        Ok(Encoded { main, sub })
    }

    fn forward(
        &self,
        batch: &Batch,
        sample_main: &[bool],
        sample_sub: &[bool],
        train: bool,
    ) -> Result<TrainOutput> {
        let encoded = self.encode(batch, train)?;
        let training = &self.config.training;
        let main = self.main.forward(
            &encoded.main,
            &batch.labels,
            sample_main,
            None,
            training,
            train,
        )?;

        let sub = match (&self.sub, &encoded.sub) {
            (Some(task), Some(enc)) => {
                let labels = batch.labels_sub.as_ref().ok_or_else(|| {
                    Error::input("the model has a sub-task but the batch has no sub-task labels")
                })?;
                let usage = task.decoder.as_ref().map(TaskDecoder::usage);
                let snapshot = match (usage, &main.decoded) {
                    (Some(UsageDecSub::Independent) | None, _) | (_, None) => None,
                    (Some(_), Some(decoded)) => {
                        let steps: Vec<usize> = batch.labels.iter().map(|l| l.len() + 1).collect();
                        Some(context_snapshot(&decoded.contexts, &steps)?)
                    }
                };
                Some(task.forward(enc, labels, sample_sub, snapshot.as_ref(), training, train)?)
            }
            _ => None,
        };

        let composed = self
            .composer
            .compose(&main.losses, sub.as_ref().map(|s| &s.losses))?;
        let mut main_metrics = main.metrics;
        main_metrics.loss = composed.main.to_scalar::<f32>()?;
        let sub_metrics = match (sub, &composed.sub) {
            (Some(sub), Some(loss)) => {
                let mut metrics = sub.metrics;
                metrics.loss = loss.to_scalar::<f32>()?;
                Some(metrics)
            }
            _ => None,
        };

        let loss_value = composed.total.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            let task = if !main_metrics.loss.is_finite() {
                "main"
            } else if sub_metrics.as_ref().is_some_and(|m| !m.loss.is_finite()) {
                "sub"
            } else {
                "total"
            };
            tracing::warn!(task, loss = loss_value, "loss is not finite");
            return Err(Error::NonFiniteLoss {
                task,
                value: loss_value,
            });
        }

        Ok(TrainOutput {
            loss: composed.total,
            loss_value,
            main: main_metrics,
            sub: sub_metrics,
            sampling_prob: self.sampling.current_probability(),
        })
    }

    /// Forward pass with dropout and scheduled sampling; advances the sampling schedule.
    pub fn train_step(&mut self, batch: &Batch) -> Result<TrainOutput> {
        let u_main = batch.labels.iter().map(Vec::len).max().unwrap_or(0) + 1;
        let sample_main = self.sampling.decisions(u_main);
        let sample_sub = match &batch.labels_sub {
            Some(labels) => {
                let u_sub = labels.iter().map(Vec::len).max().unwrap_or(0) + 1;
                self.sampling.decisions(u_sub)
            }
            None => vec![],
        };
        let out = self.forward(batch, &sample_main, &sample_sub, true)?;
        tracing::debug!(
            step = self.sampling.step(),
            loss = out.loss_value,
            main = out.main.loss,
            sub = out.sub.as_ref().map(|m| m.loss),
            accuracy = out.main.accuracy,
            sampling_prob = out.sampling_prob,
            "train step"
        );
        self.sampling.advance();
        Ok(out)
    }

    /// Teacher-forced loss without dropout or sampling.
    pub fn evaluate(&self, batch: &Batch) -> Result<TrainOutput> {
        self.forward(batch, &[], &[], false)
    }

    fn task_encoding<'a>(&self, encoded: &'a Encoded, task: Task) -> Result<&'a EncodedSequence> {
        match task {
            Task::Main => Ok(&encoded.main),
            Task::Sub => encoded
                .sub
                .as_ref()
                .ok_or(Error::Config(ConfigError::MissingSubTask("sub-task decoding"))),
        }
    }

    /// Main-decoder context summary fed to a cross-conditioned sub decoder.
    fn decode_snapshot(
        &self,
        encoded: &Encoded,
        task: Task,
        max_decode_len: usize,
    ) -> Result<Option<Tensor>> {
        let usage = match (task, &self.sub) {
            (Task::Sub, Some(sub)) => sub.decoder()?.usage(),
            _ => return Ok(None),
        };
        if usage == UsageDecSub::Independent {
            return Ok(None);
        }
        let decoder = self.main.decoder()?;
        let keys = decoder.prepare(&encoded.main)?;
        let greedy = greedy_search(
            decoder,
            &keys,
            &encoded.main,
            self.main.vocab.eos(),
            max_decode_len,
            None,
        )?;
        Ok(Some(context_snapshot(&greedy.contexts, &greedy.steps)?))
    }

    /// Beam search of every utterance in `batch`, one ranked output each.
    pub fn decode_batch(
        &self,
        batch: &Batch,
        params: &DecodeConfig,
        task: Task,
    ) -> Result<Vec<DecodeOutput>> {
        params.validate()?;
        let model = self.task_model(task)?;
        let decoder = model.decoder()?;
        let encoded = self.encode(batch, false)?;
        let enc = self.task_encoding(&encoded, task)?;
        let snapshot = self.decode_snapshot(&encoded, task, params.max_decode_len)?;
        let eos = model.vocab.eos();

        let ctc_log_probs = if params.ctc_weight > 0.0 {
            let head = model.ctc.as_ref().ok_or(ConfigError::MissingCtcHead(task))?;
            Some(head.log_probs(&enc.xs)?)
        } else {
            None
        };

        (0..enc.batch_size())
            .map(|b| {
                let one = enc.select(b)?;
                let keys = decoder.prepare(&one)?;
                let scorer = match &ctc_log_probs {
                    Some(lp) => Some(CtcPrefixScorer::new(
                        &host_log_probs(lp, b, enc.lens[b])?,
                        model.vocab.blank(),
                        eos,
                    )),
                    None => None,
                };
                let snapshot = match &snapshot {
                    Some(s) => Some(s.narrow(0, b, 1)?),
                    None => None,
                };
                Ok(beam_search(
                    decoder,
                    &keys,
                    &one,
                    eos,
                    params,
                    scorer.as_ref(),
                    snapshot.as_ref(),
                )?)
            })
            .collect()
    }

    pub fn decode(
        &self,
        features: &FeatureSequence,
        params: &DecodeConfig,
        task: Task,
    ) -> Result<DecodeOutput> {
        let batch = Batch::from_features(std::slice::from_ref(features), &self.device)?;
        self.decode_batch(&batch, params, task)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::input("decoding produced no output"))
    }

    /// Batched arg-max decoding; matches `decode` with a beam width of one.
    pub fn decode_greedy_batch(
        &self,
        batch: &Batch,
        max_decode_len: usize,
        task: Task,
    ) -> Result<Vec<Hypothesis>> {
        let model = self.task_model(task)?;
        let decoder = model.decoder()?;
        let encoded = self.encode(batch, false)?;
        let enc = self.task_encoding(&encoded, task)?;
        let snapshot = self.decode_snapshot(&encoded, task, max_decode_len)?;
        let keys = decoder.prepare(enc)?;
        let out = greedy_search(
            decoder,
            &keys,
            enc,
            model.vocab.eos(),
            max_decode_len.max(1),
            snapshot.as_ref(),
        )?;
        Ok(out.hypotheses)
    }

    fn ctc_log_probs(&self, batch: &Batch, task: Task) -> Result<(Tensor, Vec<usize>, u32)> {
        let model = self.task_model(task)?;
        let head = model.ctc.as_ref().ok_or(ConfigError::MissingCtcHead(task))?;
        let encoded = self.encode(batch, false)?;
        let enc = self.task_encoding(&encoded, task)?;
        Ok((head.log_probs(&enc.xs)?, enc.lens.clone(), model.vocab.blank()))
    }

    /// CTC-only decoding: best path for a beam width of one, prefix search otherwise.
    pub fn decode_ctc(
        &self,
        batch: &Batch,
        beam_width: usize,
        task: Task,
    ) -> Result<Vec<Vec<u32>>> {
        if beam_width < 1 {
            return Err(ConfigError::InvalidBeamWidth(beam_width).into());
        }
        let (log_probs, lens, blank) = self.ctc_log_probs(batch, task)?;
        if beam_width == 1 {
            return Ok(ctc_greedy_decode(&log_probs, &lens, blank)?);
        }
        lens.iter()
            .enumerate()
            .map(|(b, &len)| {
                let frames = host_log_probs(&log_probs, b, len)?;
                Ok(ctc_beam_search(&frames, beam_width, blank)
                    .into_iter()
                    .next()
                    .map(|h| h.labels)
                    .unwrap_or_default())
            })
            .collect()
    }

    /// Per-frame CTC label posteriors `[T'][C]` of every utterance.
    pub fn ctc_posteriors(&self, batch: &Batch, task: Task) -> Result<Vec<Vec<Vec<f32>>>> {
        let (log_probs, lens, _) = self.ctc_log_probs(batch, task)?;
        let probs = log_probs.exp()?;
        lens.iter()
            .enumerate()
            .map(|(b, &len)| Ok(host_log_probs(&probs, b, len)?))
            .collect()
    }
}
