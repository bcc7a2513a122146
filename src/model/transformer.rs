//! Bavarian city name GPT.
//!
//! A character-level decoder-only transformer: token + position embeddings, a stack of pre-norm
//! blocks, a final layer norm, and an output head tied to the token embedding.

use std::sync::{Arc, Mutex};

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{Linear, Module};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::config::GptConfig;
use super::embedding::Embeddings;
use super::layers::{LayerNorm, TransformerBlock};
use super::loss::{IGNORE_INDEX, cross_entropy};
use super::params::{ParamRole, ParamStore, SharedRng, lock_rng};

/// Name of the shared token-embedding / output-head weight.
pub const TOKEN_EMBEDDING: &str = "transformer.wte.weight";
/// Name of the position-embedding weight.
pub const POSITION_EMBEDDING: &str = "transformer.wpe.weight";

/// Decoder-only transformer over characters.
///
/// Features:
/// - Learned absolute position embedding
/// - Pre-norm blocks with causal multi-head attention and a ReLU feed-forward
/// - Weight tying between the token embedding and the output head
/// - Seeded initialization and dropout
pub struct BavGpt {
    /// Token + position embedding with dropout
    embeddings: Embeddings,
    /// Transformer blocks
    blocks: Vec<TransformerBlock>,
    /// Final layer norm
    ln_f: LayerNorm,
    /// Output head; its weight is the token embedding tensor
    lm_head: Linear,
    /// Owner of every parameter above
    params: ParamStore,
    config: GptConfig,
    device: Device,
    rng: SharedRng,
    training: bool,
}

impl BavGpt {
    /// Build a model from a configuration.
    ///
    /// # Arguments
    /// * `config` - Architecture hyperparameters, validated here
    /// * `device` - Device holding the parameters
    /// * `init_weights` - Apply the initialization policy; when false every parameter keeps its
    ///   backend default (zeros, ones for layer norm scales)
    /// * `seed` - Seed for initialization and dropout
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or parameter allocation fails.
    pub fn new(config: GptConfig, device: &Device, init_weights: bool, seed: u64) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(format!("invalid GptConfig: {e}")))?;

        let rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        let mut params = ParamStore::new(device);
        let mut root = params.builder();
        let mut transformer = root.pp("transformer");

        let embeddings = Embeddings::new(&config, &mut transformer, &rng)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            let mut block_pb = transformer.pp(format!("h.{i}"));
            blocks.push(TransformerBlock::new(&config, &mut block_pb, &rng)?);
        }

        let ln_f = transformer.pp("ln_f").layer_norm(config.n_embd)?;

        // The head reuses the embedding tensor handle: same storage, never a copy.
        let lm_bias = if config.lm_head_bias {
            Some(
                root.pp("lm_head")
                    .tensor("bias", config.vocab_size, ParamRole::Bias)?,
            )
        } else {
            None
        };
        let lm_head = Linear::new(embeddings.token_weight().clone(), lm_bias);

        if init_weights {
            let mut rng_guard = lock_rng(&rng)?;
            params.initialize(config.n_layer, &mut rng_guard)?;
        }

        Ok(Self {
            embeddings,
            blocks,
            ln_f,
            lm_head,
            params,
            config,
            device: device.clone(),
            rng,
            training: true,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `idx` - Token ids of shape (batch, seq_len), dtype u32, seq_len <= context_len
    /// * `targets` - Optional next-token ids of the same shape; `IGNORE_INDEX` entries are
    ///   excluded from the loss
    ///
    /// # Returns
    /// With targets: logits (batch, seq_len, vocab_size) and the mean loss.
    /// Without targets: logits for the last position only, (batch, 1, vocab_size), and `None`.
    ///
    /// # Errors
    /// Returns an error if seq_len exceeds the context length or tensor operations fail.
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_, t) = idx.dims2()?;
        if t == 0 {
            return Err(candle_core::Error::Msg("empty input sequence".to_string()));
        }
        if t > self.config.context_len {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {t} exceeds context_len {}",
                self.config.context_len
            )));
        }

        let mut x = self.embeddings.forward(idx, self.training)?;
        for block in &self.blocks {
            x = block.forward(&x, self.training)?;
        }
        let x = self.ln_f.forward(&x)?;

        if let Some(targets) = targets {
            let logits = self.lm_head.forward(&x)?;
            let (b, t, v) = logits.dims3()?;
            let loss = cross_entropy(
                &logits.reshape((b * t, v))?,
                &targets.flatten_all()?,
                IGNORE_INDEX,
            )?;
            Ok((logits, Some(loss)))
        } else {
            // Only the last position is needed for next-token sampling.
            let last = x.narrow(1, t - 1, 1)?;
            Ok((self.lm_head.forward(&last)?, None))
        }
    }

    /// Enable dropout.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Disable dropout.
    pub fn eval(&mut self) {
        self.training = false;
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Number of parameters.
    ///
    /// The tied token embedding is counted once. With `non_embedding` the position embedding is
    /// subtracted; the token embedding stays because it doubles as the output head.
    #[must_use]
    pub fn num_params(&self, non_embedding: bool) -> usize {
        let total = self.params.num_elements();
        if non_embedding {
            total - self.embeddings.position_weight().elem_count()
        } else {
            total
        }
    }

    /// Get the model configuration.
    #[must_use]
    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store, e.g. for persistence.
    #[must_use]
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Mutable parameter store, e.g. to load a checkpoint.
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// All trainable variables for an optimizer.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.params.all_vars()
    }

    /// Token embedding weight.
    #[must_use]
    pub fn token_embedding(&self) -> &Tensor {
        self.embeddings.token_weight()
    }

    /// Output head weight; the same tensor as [`Self::token_embedding`].
    #[must_use]
    pub fn lm_head_weight(&self) -> &Tensor {
        self.lm_head.weight()
    }

    /// Reseed the dropout RNG.
    ///
    /// # Errors
    /// Returns an error if the RNG lock is poisoned.
    pub fn reseed(&self, seed: u64) -> Result<()> {
        *lock_rng(&self.rng)? = StdRng::seed_from_u64(seed);
        Ok(())
    }
}
