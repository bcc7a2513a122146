use serde::{Deserialize, Serialize};

/// Architecture hyperparameters for [`super::BavGpt`].
///
/// The configuration is a plain record. It is validated when the model is built, not when the
/// struct is created, so partially filled configs can be passed around freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GptConfig {
    /// Maximum sequence length the model accepts (block size)
    pub context_len: usize,
    /// Number of distinct tokens
    pub vocab_size: usize,
    /// Embedding width
    pub n_embd: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Number of transformer blocks
    pub n_layer: usize,
    /// Dropout probability after embeddings, attention weights, and sub-layer outputs
    pub dropout: f32,
    /// Inner width multiplier of the feed-forward layers
    pub ffw_widen: usize,
    /// Bias on the attention qkv and output projections
    pub a_bias: bool,
    /// Bias on both feed-forward linear layers
    pub ffw_bias: bool,
    /// Bias on the output head
    pub lm_head_bias: bool,
}

impl GptConfig {
    /// Width of a single attention head.
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Inner width of the feed-forward layers.
    #[must_use]
    pub fn ffw_width(&self) -> usize {
        self.n_embd * self.ffw_widen
    }

    /// Check the structural invariants of the configuration.
    ///
    /// # Errors
    /// Returns a message naming the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_head == 0 {
            return Err("n_head must be positive".to_string());
        }
        if self.n_layer == 0 {
            return Err("n_layer must be positive".to_string());
        }
        if self.vocab_size == 0 {
            return Err("vocab_size must be positive".to_string());
        }
        if self.context_len == 0 {
            return Err("context_len must be positive".to_string());
        }
        if self.n_embd == 0 {
            return Err("n_embd must be positive".to_string());
        }
        if !self.n_embd.is_multiple_of(self.n_head) {
            return Err(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        if self.ffw_widen == 0 {
            return Err("ffw_widen must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        Ok(())
    }
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            context_len: 64,
            vocab_size: 61,
            n_embd: 256,
            n_head: 8,
            n_layer: 8,
            dropout: 0.2,
            ffw_widen: 4,
            a_bias: true,
            ffw_bias: true,
            lm_head_bias: false,
        }
    }
}
