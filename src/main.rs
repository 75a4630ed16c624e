use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use eagle3_train::{
    AttentionBackend, DeviceKind, Eagle3Trainer, PrepareConfig, Precision, SampleConfig,
    SampleMode, TrainConfig, logging, prepare_dataset, sample_jsonl,
};

#[derive(Parser, Debug)]
#[command(name = "eagle3-train")]
#[command(about = "Prepare chat data and train EAGLE3 draft models against Qwen3 targets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a chat dataset into conversation JSONL
    PrepareData(PrepareArgs),
    /// Sample lines from a JSONL file
    Sample(SampleArgs),
    /// Train an EAGLE3 draft model online
    Train(Box<TrainArgs>),
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// `sharegpt` or a local JSON / JSONL file
    #[arg(long, default_value = "sharegpt")]
    dataset: String,

    /// Directory receiving `<dataset>.jsonl`
    #[arg(long, default_value = "cache/dataset")]
    output_path: PathBuf,

    /// Keep a random subset of this many conversations
    #[arg(long)]
    sample_size: Option<usize>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Debug)]
struct SampleArgs {
    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    output: PathBuf,

    /// Number of lines to keep
    #[arg(long, conflicts_with = "fraction", required_unless_present = "fraction")]
    size: Option<usize>,

    /// Probability of keeping each line
    #[arg(long)]
    fraction: Option<f64>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Skip lines that are not valid JSON
    #[arg(long)]
    validate: bool,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Target model directory or HuggingFace model ID
    #[arg(long, default_value = "Qwen/Qwen3-8B")]
    target_model_path: String,

    #[arg(long, default_value = "main")]
    target_revision: String,

    /// Draft model JSON config
    #[arg(long)]
    draft_model_config: PathBuf,

    #[arg(long)]
    train_data_path: PathBuf,

    #[arg(long)]
    eval_data_path: Option<PathBuf>,

    #[arg(long)]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 10)]
    num_epochs: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    /// Maximum tokens per sample
    #[arg(long, default_value_t = 2048)]
    max_length: usize,

    #[arg(long, default_value = "qwen")]
    chat_template: String,

    #[arg(long, env = "EAGLE3_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,

    /// Name of the target's embedding tensor
    #[arg(long, default_value = "model.embed_tokens.weight")]
    embedding_key: String,

    /// Tensor parallel size (only 1 is supported)
    #[arg(long, default_value_t = 1)]
    tp_size: usize,

    /// Number of unrolled draft steps
    #[arg(long, default_value_t = 7)]
    ttt_length: usize,

    /// `sdpa` or `flex_attention`
    #[arg(long, default_value = "flex_attention")]
    attention_backend: AttentionBackend,

    #[arg(long, default_value_t = 0.015)]
    warmup_ratio: f64,

    #[arg(long, default_value_t = 0.5)]
    max_grad_norm: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 50)]
    log_interval: usize,

    /// Evaluate every N epochs
    #[arg(long, default_value_t = 1)]
    eval_interval: usize,

    /// Checkpoint every N epochs
    #[arg(long, default_value_t = 1)]
    save_interval: usize,

    /// Continue from the newest checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// f32, bf16 or f16
    #[arg(long, default_value = "f32")]
    precision: Precision,

    /// cpu, cuda or auto
    #[arg(long, default_value = "auto")]
    device: DeviceKind,
}

impl From<TrainArgs> for TrainConfig {
    fn from(args: TrainArgs) -> Self {
        TrainConfig {
            target_model_path: args.target_model_path,
            target_revision: args.target_revision,
            draft_model_config: args.draft_model_config,
            train_data_path: args.train_data_path,
            eval_data_path: args.eval_data_path,
            output_dir: args.output_dir,
            num_epochs: args.num_epochs,
            batch_size: args.batch_size,
            learning_rate: args.learning_rate,
            max_length: args.max_length,
            chat_template: args.chat_template,
            cache_dir: args.cache_dir,
            embedding_key: args.embedding_key,
            tp_size: args.tp_size,
            ttt_length: args.ttt_length,
            attention_backend: args.attention_backend,
            warmup_ratio: args.warmup_ratio,
            max_grad_norm: args.max_grad_norm,
            seed: args.seed,
            log_interval: args.log_interval,
            eval_interval: args.eval_interval,
            save_interval: args.save_interval,
            resume: args.resume,
            precision: args.precision,
            device: args.device,
        }
    }
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::PrepareData(args) => {
            let config = PrepareConfig {
                dataset: args.dataset,
                output_path: args.output_path,
                sample_size: args.sample_size,
                seed: args.seed,
            };
            let stats = prepare_dataset(&config)
                .with_context(|| format!("failed to prepare dataset '{}'", config.dataset))?;
            info!(
                written = stats.written,
                converted = stats.converted,
                total = stats.total,
                output = %stats.output.display(),
                "dataset ready"
            );
        }
        Command::Sample(args) => {
            let mode = match (args.size, args.fraction) {
                (Some(size), _) => SampleMode::Size(size),
                (None, Some(fraction)) => SampleMode::Fraction(fraction),
                (None, None) => anyhow::bail!("either --size or --fraction is required"),
            };
            let config = SampleConfig {
                input: args.input,
                output: args.output,
                mode,
                seed: args.seed,
                validate: args.validate,
            };
            let stats = sample_jsonl(&config)
                .with_context(|| format!("failed to sample {}", config.input.display()))?;
            info!(written = stats.written, valid = stats.valid, total = stats.total, "sample done");
        }
        Command::Train(args) => {
            let config = TrainConfig::from(*args);
            let output_dir = config.output_dir.clone();
            let mut trainer = Eagle3Trainer::new(config).context("failed to set up training")?;
            let summary = trainer.train().context("training failed")?;
            info!(
                epochs = summary.epochs_run,
                steps = summary.global_step,
                last_loss = ?summary.last_loss,
                output = %output_dir.display(),
                "training finished"
            );
        }
    }
    Ok(())
}
