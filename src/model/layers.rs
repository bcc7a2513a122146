//! Common neural network layers.
//!
//! Layer norm, dropout, the feed-forward network, and the transformer block.

use candle_core::{D, Result, Tensor};
use candle_nn::{Linear, Module};
use rand::Rng;

use super::attention::CausalSelfAttention;
use super::config::GptConfig;
use super::params::{ParamBuilder, ParamRole, SharedRng, lock_rng};

/// Epsilon used by every layer norm in the model.
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization over the last dimension with learned scale and shift.
///
/// Written with primitive tensor ops so gradients flow through it.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    #[must_use]
    pub fn new(weight: Tensor, bias: Tensor) -> Self {
        Self { weight, bias }
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + LAYER_NORM_EPS)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Inverted dropout drawing its masks from the model's seeded RNG.
///
/// Identity when `train` is false or the probability is zero.
#[derive(Clone)]
pub struct Dropout {
    p: f32,
    rng: SharedRng,
}

impl Dropout {
    #[must_use]
    pub fn new(p: f32, rng: SharedRng) -> Self {
        Self { p, rng }
    }

    /// Apply dropout.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p == 0.0 {
            return Ok(x.clone());
        }
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = {
            let mut rng = lock_rng(&self.rng)?;
            (0..x.elem_count())
                .map(|_| {
                    if rng.r#gen::<f32>() < self.p {
                        0.0
                    } else {
                        scale
                    }
                })
                .collect()
        };
        let mask = Tensor::from_vec(mask, x.shape(), x.device())?.to_dtype(x.dtype())?;
        x.mul(&mask)
    }
}

/// Position-wise feed-forward network with ReLU.
///
/// c_fc -> ReLU -> proj -> dropout, widening by `ffw_widen` in between.
pub struct FeedForward {
    /// Up projection (n_embd -> ffw_widen * n_embd)
    c_fc: Linear,
    /// Down projection back into the residual stream
    proj: Linear,
    dropout: Dropout,
}

impl FeedForward {
    /// Create a new feed-forward layer.
    ///
    /// # Errors
    /// Returns an error if parameter registration fails.
    pub fn new(config: &GptConfig, pb: &mut ParamBuilder<'_>, rng: &SharedRng) -> Result<Self> {
        let hidden = config.ffw_width();
        let c_fc = pb
            .pp("c_fc")
            .linear(config.n_embd, hidden, config.ffw_bias, ParamRole::LinearWeight)?;
        let proj = pb.pp("proj").linear(
            hidden,
            config.n_embd,
            config.ffw_bias,
            ParamRole::ResidualProjection,
        )?;
        Ok(Self {
            c_fc,
            proj,
            dropout: Dropout::new(config.dropout, rng.clone()),
        })
    }

    /// Forward pass, (B, T, C) -> (B, T, C).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.relu()?;
        let h = self.proj.forward(&h)?;
        self.dropout.forward(&h, train)
    }
}

/// Transformer block with pre-norm architecture.
///
/// Structure: LayerNorm -> Attention -> Residual -> LayerNorm -> FeedForward -> Residual
pub struct TransformerBlock {
    ln1: LayerNorm,
    multi_head_sa: CausalSelfAttention,
    ln2: LayerNorm,
    ffw: FeedForward,
}

impl TransformerBlock {
    /// Create a new transformer block.
    ///
    /// # Errors
    /// Returns an error if the configuration is inconsistent or registration fails.
    pub fn new(config: &GptConfig, pb: &mut ParamBuilder<'_>, rng: &SharedRng) -> Result<Self> {
        let multi_head_sa = CausalSelfAttention::new(config, &mut pb.pp("multi_head_sa"), rng)?;
        let ffw = FeedForward::new(config, &mut pb.pp("ffw"), rng)?;
        let ln1 = pb.pp("ln1").layer_norm(config.n_embd)?;
        let ln2 = pb.pp("ln2").layer_norm(config.n_embd)?;

        Ok(Self {
            ln1,
            multi_head_sa,
            ln2,
            ffw,
        })
    }

    /// Forward pass through the block.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.multi_head_sa.forward(&self.ln1.forward(x)?, train)?;
        let x = (x + h)?;

        let h = self.ffw.forward(&self.ln2.forward(&x)?, train)?;
        x + h
    }
}
