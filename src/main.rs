//! Bavarian city name GPT CLI
//!
//! Prepare the name list, train a character-level transformer, and sample new names.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bavgpt::data::{DataConfig, NameProcessor};
use bavgpt::device::resolve_device;
use bavgpt::inference::{SampleConfig, generate_names};
use bavgpt::model::GptConfig;
use bavgpt::train::{TrainConfig, Trainer};
use bavgpt::weights::{load_checkpoint, load_config};

/// File written next to a checkpoint by `sample`.
const SAMPLES_FILE: &str = "samples.txt";

/// Bavarian city name GPT - train a tiny transformer on place names and invent new ones.
#[derive(Debug, Parser)]
#[command(name = "bavgpt", version, about = "Character-level GPT for Bavarian city names")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Filter, shuffle, encode, and split the raw name list
    Prepare(PrepareArgs),
    /// Train a model on prepared data and save a checkpoint
    Train(TrainArgs),
    /// Generate names from a checkpoint
    Sample(SampleArgs),
    /// Print model configuration and parameter counts
    Info(InfoArgs),
}

#[derive(Debug, Args)]
struct PrepareArgs {
    /// JSON file with a DataConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// Newline-separated list of names
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output directory for splits and meta.json
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seed for shuffling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// JSON file with a TrainConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with a GptConfig
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Directory with prepared splits
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of training iterations
    #[arg(long)]
    iters: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// cpu, cuda[:N], or metal
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct SampleArgs {
    /// Checkpoint directory (config.json, model.safetensors, meta.json)
    #[arg(index = 1)]
    model_dir: Option<PathBuf>,

    /// JSON file with a SampleConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of names to generate
    #[arg(short, long)]
    num_samples: Option<usize>,

    /// Maximum characters per name
    #[arg(long)]
    max_length: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Top-k sampling (0 = disabled)
    #[arg(long)]
    top_k: Option<usize>,

    /// Random seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    device: Option<String>,
}

#[derive(Debug, Args)]
struct InfoArgs {
    /// Checkpoint directory; the default configuration is shown when omitted
    #[arg(index = 1)]
    model_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Prepare(args) => run_prepare(args),
        Command::Train(args) => run_train(args),
        Command::Sample(args) => run_sample(args),
        Command::Info(args) => run_info(&args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Read a JSON config file, or fall back to the defaults.
fn load_json_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    let mut config: DataConfig = load_json_or_default(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.input_file = input;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let summary = NameProcessor::new(config).execute()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut config: TrainConfig = load_json_or_default(args.config.as_deref())?;
    let model_config: GptConfig = load_json_or_default(args.model_config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(iters) = args.iters {
        config.train_iter = iters;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let device = resolve_device(&config.device)?;
    let save_dir = config.save_dir_current();
    let mut trainer = Trainer::from_data_dir(config, model_config, &device)?;

    let start = Instant::now();
    let estimate = trainer.run()?;
    info!(elapsed_s = start.elapsed().as_secs_f32(), "training finished");
    if let Some(est) = estimate {
        println!("final loss: train {:.4}, dev {:.4}", est.train, est.dev);
    }

    trainer.save(&save_dir)?;
    println!("saved model to {}", save_dir.display());
    println!("parameters: {}", trainer.model().num_params(false));

    for name in trainer.sample_names()? {
        println!("{name}");
    }
    Ok(())
}

fn run_sample(args: SampleArgs) -> Result<()> {
    let mut config: SampleConfig = load_json_or_default(args.config.as_deref())?;
    if let Some(dir) = args.model_dir {
        config.model_dir = Some(dir);
    }
    if let Some(n) = args.num_samples {
        config.num_samples = n;
    }
    if let Some(max_length) = args.max_length {
        config.max_length = max_length;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    let model_dir = config
        .model_dir
        .clone()
        .context("No model directory given. Usage: bavgpt sample saved_models/bavGPT_<ts>")?;
    let device = resolve_device(&config.device)?;
    let (model, vocab) = load_checkpoint(&model_dir, &device)?;
    if let Some(seed) = config.seed {
        model.reseed(seed)?;
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let names = generate_names(&model, &vocab, &config, &mut rng)?;

    let out = model_dir.join(SAMPLES_FILE);
    let mut text = names.join("\n");
    text.push('\n');
    std::fs::write(&out, &text).with_context(|| format!("write {}", out.display()))?;
    info!(path = %out.display(), count = names.len(), "wrote samples");

    print!("{text}");
    Ok(())
}

fn run_info(args: &InfoArgs) -> Result<()> {
    let config = match &args.model_dir {
        Some(dir) => load_config(dir)?,
        None => GptConfig::default(),
    };
    let model = bavgpt::model::BavGpt::new(config.clone(), &candle_core::Device::Cpu, false, 0)
        .context("build model")?;

    println!("Bavarian City Name GPT Model Info");
    println!("=================================");
    println!();
    println!("Configuration:");
    println!("  Vocabulary size: {} chars", config.vocab_size);
    println!("  Context length:  {} chars", config.context_len);
    println!("  Layers:          {}", config.n_layer);
    println!("  Attention heads: {}", config.n_head);
    println!("  Embedding dim:   {}", config.n_embd);
    println!("  Head size:       {}", config.head_size());
    println!("  FFN width:       {}", config.ffw_width());
    println!("  Dropout:         {}", config.dropout);
    println!();
    println!("Parameters:        {}", model.num_params(false));
    println!("  non-embedding:   {}", model.num_params(true));

    if let Some(dir) = &args.model_dir {
        println!();
        println!("Model path: {}", dir.display());
    }
    Ok(())
}
