//! Checkpoint persistence.
//!
//! A checkpoint directory holds `config.json` (architecture), `model.safetensors` (parameters;
//! the tied embedding/head weight is stored once), and `meta.json` (vocabulary).

use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::Device;
use safetensors::SafeTensors;
use tracing::info;

use crate::data::META_FILE;
use crate::model::{BavGpt, GptConfig};
use crate::tokenizer::CharVocab;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Write config, parameters, and vocabulary into `dir`, creating it if needed.
///
/// # Errors
/// Returns an error if any file cannot be written.
pub fn save_checkpoint(model: &BavGpt, vocab: &CharVocab, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(model.config()).context("serialize GptConfig")?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("write {}", config_path.display()))?;

    let weights_path = dir.join(WEIGHTS_FILE);
    model
        .params()
        .save(&weights_path)
        .with_context(|| format!("write {}", weights_path.display()))?;

    vocab.save(&dir.join(META_FILE))?;
    info!(dir = %dir.display(), params = model.num_params(false), "saved checkpoint");
    Ok(())
}

/// Read `config.json` from a checkpoint directory.
///
/// # Errors
/// Returns an error if the file is missing, malformed, or describes an invalid model.
pub fn load_config(dir: &Path) -> Result<GptConfig> {
    let config_path = dir.join(CONFIG_FILE);
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let config: GptConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", config_path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid GptConfig")?;
    Ok(config)
}

/// Rebuild a model and its vocabulary from a checkpoint directory.
///
/// The model is built without initialization and then overwritten from the weights file. It is
/// returned in eval mode.
///
/// # Errors
/// Returns an error if any file is missing or does not match the configuration.
pub fn load_checkpoint(dir: &Path, device: &Device) -> Result<(BavGpt, CharVocab)> {
    let config = load_config(dir)?;
    let vocab = CharVocab::load(&dir.join(META_FILE))?;
    if vocab.vocab_size() != config.vocab_size {
        bail!(
            "vocabulary has {} characters but config.json expects vocab_size {}",
            vocab.vocab_size(),
            config.vocab_size
        );
    }

    let weights_path = dir.join(WEIGHTS_FILE);
    let data = std::fs::read(&weights_path)
        .with_context(|| format!("read weights {}", weights_path.display()))?;
    let mut model = BavGpt::new(config, device, false, 0).context("build model")?;
    check_tensor_names(&data, &model)
        .with_context(|| format!("inspect {}", weights_path.display()))?;

    model
        .params_mut()
        .load(&weights_path)
        .with_context(|| format!("load weights {}", weights_path.display()))?;
    model.eval();
    info!(dir = %dir.display(), params = model.num_params(false), "loaded checkpoint");
    Ok((model, vocab))
}

fn check_tensor_names(data: &[u8], model: &BavGpt) -> Result<()> {
    let tensors = SafeTensors::deserialize(data).context("parse safetensors header")?;
    let names = tensors.names();
    let missing: Vec<&str> = model
        .params()
        .entries()
        .iter()
        .map(|e| e.name.as_str())
        .filter(|name| !names.iter().any(|n| n.as_str() == *name))
        .collect();
    if !missing.is_empty() {
        bail!(
            "weights file is missing {} tensor(s), first: {}; was it written for this config.json?",
            missing.len(),
            missing[0]
        );
    }
    Ok(())
}
