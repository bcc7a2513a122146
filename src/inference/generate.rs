//! Autoregressive name generation.
//!
//! Starts from the newline token (the separator between names), repeatedly runs the inference
//! forward pass on the cropped context, and samples the next character until a newline appears or
//! the length limit is reached.

use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::inference::sampling::sample_from_logits;
use crate::model::BavGpt;
use crate::tokenizer::CharVocab;

/// Sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Checkpoint directory to sample from
    pub model_dir: Option<PathBuf>,
    pub device: String,
    pub num_samples: usize,
    /// Maximum characters per name, newline excluded
    pub max_length: usize,
    pub temperature: f32,
    /// Keep only the k most likely characters (0 = disabled)
    pub top_k: usize,
    pub seed: Option<u64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            device: "cpu".to_string(),
            num_samples: 25,
            max_length: 50,
            temperature: 1.0,
            top_k: 0,
            seed: None,
        }
    }
}

/// Generate a single name.
///
/// The model must be in eval mode. The returned string has no trailing newline.
///
/// # Errors
/// Returns an error if the model is in training mode, the vocabulary has no newline, or
/// inference fails.
pub fn generate_name(
    model: &BavGpt,
    vocab: &CharVocab,
    cfg: &SampleConfig,
    rng: &mut impl Rng,
) -> Result<String> {
    ensure!(
        !model.is_training(),
        "model is in training mode; call eval() before sampling"
    );
    let newline = vocab
        .newline_id()
        .context("vocabulary has no newline token to start and stop names")?;

    let context_len = model.config().context_len;
    let mut tokens = vec![newline];
    let mut generated = Vec::with_capacity(cfg.max_length);

    for _ in 0..cfg.max_length {
        let ctx = &tokens[tokens.len().saturating_sub(context_len)..];
        let input = Tensor::new(ctx, model.device())?.unsqueeze(0)?;
        let (logits, _) = model.forward(&input, None)?;
        let logits = logits.flatten_all()?.to_vec1::<f32>()?;

        let next = sample_from_logits(&logits, cfg.temperature, cfg.top_k, rng);
        if next == newline {
            break;
        }
        tokens.push(next);
        generated.push(next);
    }

    let name = vocab.decode(&generated);
    debug!(name = %name, "sampled name");
    Ok(name)
}

/// Generate `cfg.num_samples` names.
///
/// # Errors
/// Returns an error if any generation fails.
pub fn generate_names(
    model: &BavGpt,
    vocab: &CharVocab,
    cfg: &SampleConfig,
    rng: &mut impl Rng,
) -> Result<Vec<String>> {
    (0..cfg.num_samples)
        .map(|_| generate_name(model, vocab, cfg, rng))
        .collect()
}
