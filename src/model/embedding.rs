//! Input embeddings.
//!
//! Token embedding plus learned absolute position embedding, followed by dropout.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Module};

use super::config::GptConfig;
use super::layers::Dropout;
use super::params::{ParamBuilder, SharedRng};

/// Token and position embedding tables.
pub struct Embeddings {
    /// Token embedding (vocab_size, n_embd); shared with the output head
    wte: Embedding,
    /// Position embedding (context_len, n_embd)
    wpe: Embedding,
    drop: Dropout,
}

impl Embeddings {
    /// Create the embedding tables under `transformer.wte` / `transformer.wpe`.
    ///
    /// # Errors
    /// Returns an error if parameter registration fails.
    pub fn new(config: &GptConfig, pb: &mut ParamBuilder<'_>, rng: &SharedRng) -> Result<Self> {
        let wte = pb.pp("wte").embedding(config.vocab_size, config.n_embd)?;
        let wpe = pb.pp("wpe").embedding(config.context_len, config.n_embd)?;
        Ok(Self {
            wte,
            wpe,
            drop: Dropout::new(config.dropout, rng.clone()),
        })
    }

    /// Embed a batch of token ids.
    ///
    /// # Arguments
    /// * `idx` - Token ids of shape (batch, seq_len), dtype u32
    /// * `train` - Whether dropout is active
    ///
    /// # Returns
    /// Embeddings of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns an error if a token id is out of range or tensor operations fail.
    pub fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let (_, t) = idx.dims2()?;
        #[allow(clippy::cast_possible_truncation)]
        let pos = Tensor::arange(0u32, t as u32, idx.device())?;
        let tok_emb = self.wte.forward(idx)?;
        let pos_emb = self.wpe.forward(&pos)?;
        let x = tok_emb.broadcast_add(&pos_emb)?;
        self.drop.forward(&x, train)
    }

    /// Token embedding weight, (vocab_size, n_embd).
    #[must_use]
    pub fn token_weight(&self) -> &Tensor {
        self.wte.embeddings()
    }

    /// Position embedding weight, (context_len, n_embd).
    #[must_use]
    pub fn position_weight(&self) -> &Tensor {
        self.wpe.embeddings()
    }
}
