//! Token streams and random training batches.

use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use rand::Rng;

/// A token stream loaded from a u16 `.bin` split.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    tokens: Vec<u32>,
}

impl TokenDataset {
    #[must_use]
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    /// Read a little-endian u16 token file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or has an odd byte length.
    pub fn from_bin(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        ensure!(
            bytes.len() % 2 == 0,
            "{} has odd length {}; expected u16 tokens",
            path.display(),
            bytes.len()
        );
        let tokens = bytes
            .chunks_exact(2)
            .map(|b| u32::from(u16::from_le_bytes([b[0], b[1]])))
            .collect();
        Ok(Self { tokens })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Sample `batch_size` random windows of length `context_len`.
    ///
    /// Returns inputs `x` (u32) and next-token targets `y` (i64), both (batch_size, context_len),
    /// where `y[b][t] == x[b][t + 1]` within the stream.
    ///
    /// # Errors
    /// Returns an error if the stream is not longer than `context_len`.
    pub fn get_batch(
        &self,
        batch_size: usize,
        context_len: usize,
        rng: &mut impl Rng,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        ensure!(
            self.tokens.len() > context_len,
            "dataset of {} tokens is too short for context_len {context_len}",
            self.tokens.len()
        );
        let max_start = self.tokens.len() - context_len;

        let mut xs = Vec::with_capacity(batch_size * context_len);
        let mut ys = Vec::with_capacity(batch_size * context_len);
        for _ in 0..batch_size {
            let start = rng.gen_range(0..max_start);
            xs.extend_from_slice(&self.tokens[start..start + context_len]);
            ys.extend(
                self.tokens[start + 1..=start + context_len]
                    .iter()
                    .map(|&t| i64::from(t)),
            );
        }

        let x = Tensor::from_vec(xs, (batch_size, context_len), device)?;
        let y = Tensor::from_vec(ys, (batch_size, context_len), device)?;
        Ok((x, y))
    }
}
