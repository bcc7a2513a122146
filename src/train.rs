//! Training loop.
//!
//! Random-window batches from the train split, AdamW over every parameter, periodic loss
//! estimates on train and dev in eval mode, and a checkpoint at the end.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, ensure};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::{META_FILE, SPLIT_FILES, TokenDataset};
use crate::inference::{SampleConfig, generate_names};
use crate::model::{BavGpt, GptConfig};
use crate::tokenizer::CharVocab;
use crate::weights::save_checkpoint;

/// Training settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train_iter: usize,
    /// Batches averaged per loss estimate
    pub eval_iter: usize,
    pub eval_interval: usize,
    pub device: String,
    /// Directory with the `.bin` splits and `meta.json`
    pub data_dir: PathBuf,
    pub saved_models_root: PathBuf,
    pub model_name: String,
    pub seed: u64,
    /// Names printed after training
    pub num_samples: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            learning_rate: 3e-4,
            train_iter: 1,
            eval_iter: 150,
            eval_interval: 500,
            device: "cpu".to_string(),
            data_dir: PathBuf::from("data"),
            saved_models_root: PathBuf::from("saved_models"),
            model_name: "bavGPT".to_string(),
            seed: 42,
            num_samples: 20,
        }
    }
}

impl TrainConfig {
    /// Fresh checkpoint directory, e.g. `saved_models/bavGPT_1751556929`.
    #[must_use]
    pub fn save_dir_current(&self) -> PathBuf {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.saved_models_root
            .join(format!("{}_{secs}", self.model_name))
    }
}

/// Mean loss on both splits.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LossEstimate {
    pub train: f32,
    pub dev: f32,
}

/// Owns the model, its data, and the optimizer for one run.
pub struct Trainer {
    config: TrainConfig,
    model: BavGpt,
    vocab: CharVocab,
    train_data: TokenDataset,
    dev_data: TokenDataset,
    optimizer: AdamW,
    rng: StdRng,
}

impl Trainer {
    /// Set up a run over in-memory splits.
    ///
    /// # Errors
    /// Returns an error if a split is too short for the context length or the optimizer cannot
    /// be created.
    pub fn new(
        config: TrainConfig,
        model: BavGpt,
        vocab: CharVocab,
        train_data: TokenDataset,
        dev_data: TokenDataset,
    ) -> Result<Self> {
        let context_len = model.config().context_len;
        for (name, data) in [("train", &train_data), ("dev", &dev_data)] {
            ensure!(
                data.len() > context_len,
                "{name} split has {} tokens; need more than context_len {context_len}",
                data.len()
            );
        }
        ensure!(config.batch_size > 0, "batch_size must be positive");

        let params = ParamsAdamW {
            lr: config.learning_rate,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(model.vars(), params).context("create AdamW")?;
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            model,
            vocab,
            train_data,
            dev_data,
            optimizer,
            rng,
        })
    }

    /// Load the splits and vocabulary from `config.data_dir` and build a freshly initialized
    /// model. `model_config.vocab_size` is replaced by the size of the stored vocabulary.
    ///
    /// # Errors
    /// Returns an error if a data file is missing or the model cannot be built.
    pub fn from_data_dir(
        config: TrainConfig,
        mut model_config: GptConfig,
        device: &Device,
    ) -> Result<Self> {
        let dir = config.data_dir.clone();
        let vocab = CharVocab::load(&dir.join(META_FILE))?;
        let train_data = TokenDataset::from_bin(&dir.join(SPLIT_FILES[0]))?;
        let dev_data = TokenDataset::from_bin(&dir.join(SPLIT_FILES[1]))?;
        info!(
            dir = %dir.display(),
            train_tokens = train_data.len(),
            dev_tokens = dev_data.len(),
            vocab_size = vocab.vocab_size(),
            "loaded training data"
        );

        model_config.vocab_size = vocab.vocab_size();
        let model =
            BavGpt::new(model_config, device, true, config.seed).context("build model")?;
        info!(
            params = model.num_params(false),
            non_embedding = model.num_params(true),
            "built model"
        );
        Self::new(config, model, vocab, train_data, dev_data)
    }

    #[must_use]
    pub fn model(&self) -> &BavGpt {
        &self.model
    }

    #[must_use]
    pub fn vocab(&self) -> &CharVocab {
        &self.vocab
    }

    /// Average loss over `eval_iter` random batches per split, with dropout disabled.
    ///
    /// The model is back in training mode afterwards.
    ///
    /// # Errors
    /// Returns an error if a forward pass fails.
    pub fn estimate_loss(&mut self) -> Result<LossEstimate> {
        self.model.eval();
        let train = self.mean_loss(true);
        let dev = self.mean_loss(false);
        self.model.train();
        Ok(LossEstimate {
            train: train?,
            dev: dev?,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean_loss(&mut self, train_split: bool) -> Result<f32> {
        let iters = self.config.eval_iter.max(1);
        let context_len = self.model.config().context_len;
        let data = if train_split {
            &self.train_data
        } else {
            &self.dev_data
        };

        let mut total = 0.0_f32;
        for _ in 0..iters {
            let (x, y) = data.get_batch(
                self.config.batch_size,
                context_len,
                &mut self.rng,
                self.model.device(),
            )?;
            let (_, loss) = self.model.forward(&x, Some(&y))?;
            let loss = loss.context("forward with targets returned no loss")?;
            total += loss.to_scalar::<f32>()?;
        }
        Ok(total / iters as f32)
    }

    /// One optimizer step on a fresh train batch. Returns the batch loss.
    ///
    /// # Errors
    /// Returns an error if the forward or backward pass fails.
    pub fn step(&mut self) -> Result<f32> {
        let (x, y) = self.train_data.get_batch(
            self.config.batch_size,
            self.model.config().context_len,
            &mut self.rng,
            self.model.device(),
        )?;
        let (_, loss) = self.model.forward(&x, Some(&y))?;
        let loss = loss.context("forward with targets returned no loss")?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Run `train_iter` iterations, estimating the loss every `eval_interval` iterations and
    /// at the last one. Returns the last estimate.
    ///
    /// # Errors
    /// Returns an error if any step fails.
    pub fn run(&mut self) -> Result<Option<LossEstimate>> {
        let total = self.config.train_iter;
        let interval = self.config.eval_interval.max(1);
        info!(
            iters = total,
            batch_size = self.config.batch_size,
            lr = self.config.learning_rate,
            "training"
        );

        self.model.train();
        let mut last = None;
        for iter in 0..total {
            if iter % interval == 0 || iter + 1 == total {
                let est = self.estimate_loss()?;
                info!(
                    iter,
                    train_loss = format_args!("{:.4}", est.train),
                    dev_loss = format_args!("{:.4}", est.dev),
                    "eval"
                );
                last = Some(est);
            }
            let loss = self.step()?;
            debug!(iter, loss, "step");
        }
        Ok(last)
    }

    /// Save a checkpoint into `dir`.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn save(&self, dir: &Path) -> Result<()> {
        save_checkpoint(&self.model, &self.vocab, dir)
    }

    /// Switch to eval mode and draw `num_samples` names.
    ///
    /// # Errors
    /// Returns an error if generation fails.
    pub fn sample_names(&mut self) -> Result<Vec<String>> {
        self.model.eval();
        let cfg = SampleConfig {
            num_samples: self.config.num_samples,
            ..SampleConfig::default()
        };
        generate_names(&self.model, &self.vocab, &cfg, &mut self.rng)
    }
}
