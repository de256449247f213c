mod corpus;

use std::path::PathBuf;

use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use las_asr::{
    config::{AttentionConfig, DecoderConfig, EncoderConfig, TrainingConfig},
    AttentionSeq2seq, Batch, Config, DecodeConfig, Task,
};
use tracing_subscriber::EnvFilter;

use crate::corpus::ToyCorpus;

#[derive(Debug, Parser)]
#[command(name = "las")]
#[command(about = "Train and decode a listen-attend-spell model on a toy corpus")]
#[command(version)]
struct Cli {
    /// JSON model configuration (default: a small built-in model)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train with AdamW and log the losses
    Train {
        #[arg(long, default_value_t = 200)]
        steps: usize,

        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        #[arg(long, default_value_t = 1e-3)]
        learning_rate: f64,

        /// Write the trained weights as safetensors
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Beam-search a few toy utterances and print ranked hypotheses
    Decode {
        /// Safetensors weights written by `train --save`
        #[arg(long)]
        load: Option<PathBuf>,

        #[arg(long, default_value_t = 4)]
        utterances: usize,

        #[arg(long)]
        beam_width: Option<usize>,

        #[arg(long)]
        task: Option<Task>,

        /// Decode with the CTC head alone
        #[arg(long)]
        ctc: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => toy_config(),
    };
    let device = device()?;

    match cli.command {
        Commands::Train {
            steps,
            batch_size,
            learning_rate,
            save,
        } => train(
            config,
            &device,
            cli.seed,
            steps,
            batch_size,
            learning_rate,
            save,
        ),
        Commands::Decode {
            load,
            utterances,
            beam_width,
            task,
            ctc,
        } => decode(
            config,
            &device,
            cli.seed,
            load,
            utterances,
            beam_width,
            task.unwrap_or_default(),
            ctc,
        ),
    }
}

fn device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    return Ok(Device::new_cuda(0)?);
    #[cfg(not(feature = "cuda"))]
    Ok(Device::Cpu)
}

fn toy_config() -> Config {
    Config {
        input_size: 8,
        encoder: EncoderConfig {
            num_units: 32,
            num_layers: 2,
            subsample_list: vec![true, false],
            ..Default::default()
        },
        attention: AttentionConfig {
            attention_dim: 32,
            conv_num_channels: 4,
            conv_width: 5,
            ..Default::default()
        },
        decoder: DecoderConfig {
            num_units: 32,
            embedding_dim: 16,
            bottleneck_dim: 32,
            ..Default::default()
        },
        training: TrainingConfig {
            ctc_loss_weight: 0.2,
            ..Default::default()
        },
        decode: DecodeConfig {
            max_decode_len: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build(config: Config, device: &Device) -> Result<(AttentionSeq2seq, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let vocab_sub = match config.sub_task {
        Some(_) => Some(ToyCorpus::vocab_sub()?),
        None => None,
    };
    let model = AttentionSeq2seq::new(config, ToyCorpus::vocab()?, vocab_sub, vb)?;
    Ok((model, varmap))
}

fn train(
    config: Config,
    device: &Device,
    seed: u64,
    steps: usize,
    batch_size: usize,
    learning_rate: f64,
    save: Option<PathBuf>,
) -> Result<()> {
    let input_size = config.input_size;
    let (mut model, varmap) = build(config, device)?;
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: learning_rate,
            ..Default::default()
        },
    )?;
    let mut corpus = ToyCorpus::new(seed, input_size);
    let vocab = model.vocab(Task::Main)?.clone();
    let vocab_sub = model.vocab(Task::Sub).ok().cloned();

    for step in 0..steps {
        let (batch, _) = corpus.batch(batch_size, &vocab, vocab_sub.as_ref(), device)?;
        let out = match model.train_step(&batch) {
            Ok(out) => out,
            Err(las_asr::Error::NonFiniteLoss { task, value }) => {
                tracing::warn!(step, task, value, "skipping batch with non-finite loss");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        optimizer.backward_step(&out.loss)?;
        if step % 10 == 0 || step + 1 == steps {
            tracing::info!(
                step,
                loss = out.loss_value,
                main = out.main.loss,
                accuracy = out.main.accuracy,
                sub = out.sub.as_ref().map(|m| m.loss),
                "train"
            );
        }
    }

    let (batch, _) = corpus.batch(batch_size, &vocab, vocab_sub.as_ref(), device)?;
    let eval = model.evaluate(&batch)?;
    tracing::info!(loss = eval.loss_value, accuracy = eval.main.accuracy, "held-out batch");

    if let Some(path) = save {
        varmap.save(&path)?;
        tracing::info!(path = %path.display(), "saved weights");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode(
    config: Config,
    device: &Device,
    seed: u64,
    load: Option<PathBuf>,
    utterances: usize,
    beam_width: Option<usize>,
    task: Task,
    ctc: bool,
) -> Result<()> {
    let input_size = config.input_size;
    let params = DecodeConfig {
        beam_width: beam_width.unwrap_or(config.decode.beam_width),
        ..config.decode.clone()
    };
    let (model, mut varmap) = build(config, device)?;
    if let Some(path) = load {
        varmap.load(&path)?;
        tracing::info!(path = %path.display(), "loaded weights");
    }
    let vocab = model.vocab(task)?;
    let mut corpus = ToyCorpus::new(seed.wrapping_add(1), input_size);

    for i in 0..utterances {
        let utt = corpus.utterance()?;
        let reference = match task {
            Task::Main => utt.tokens.join(" "),
            Task::Sub => utt
                .tokens
                .iter()
                .map(|t| ToyCorpus::coarse(t))
                .collect::<Vec<_>>()
                .join(" "),
        };
        println!("utt {i}  ref: {reference}");

        if ctc {
            let batch = Batch::from_features(std::slice::from_ref(&utt.features), device)?;
            let labels = model.decode_ctc(&batch, params.beam_width, task)?;
            for ids in labels {
                println!("  ctc: {}", vocab.decode(&ids).join(" "));
            }
            continue;
        }

        let out = model.decode(&utt.features, &params, task)?;
        for (rank, h) in out.hypotheses.iter().enumerate() {
            println!(
                "  {rank}: {:>9.4}{} {}",
                h.score,
                if h.terminal { " " } else { "*" },
                vocab.decode(&h.tokens).join(" ")
            );
        }
        if out.truncated {
            println!("  (truncated at {} steps)", params.max_decode_len);
        }
    }
    Ok(())
}
