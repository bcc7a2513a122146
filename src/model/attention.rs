//! Causal self-attention implementation.
//!
//! Multi-head masked scaled dot-product attention with a combined qkv projection.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module};

use super::config::GptConfig;
use super::layers::Dropout;
use super::params::{ParamBuilder, ParamRole, SharedRng};

/// Multi-head causal self-attention.
///
/// Uses combined QKV projection for efficiency.
pub struct CausalSelfAttention {
    /// Combined query, key, value projection (n_embd -> 3 * n_embd)
    qkv: Linear,
    /// Output projection (n_embd -> n_embd)
    proj: Linear,
    /// Lower-triangular keep-mask, (context_len, context_len)
    tril: Tensor,
    /// Dropout on attention weights
    attn_dropout: Dropout,
    /// Dropout on the projected output
    resid_dropout: Dropout,
    n_head: usize,
    n_embd: usize,
    head_size: usize,
}

impl CausalSelfAttention {
    /// Create a new causal self-attention layer.
    ///
    /// # Errors
    /// Returns an error if `n_embd` is not divisible by `n_head` or registration fails.
    pub fn new(config: &GptConfig, pb: &mut ParamBuilder<'_>, rng: &SharedRng) -> Result<Self> {
        let n_embd = config.n_embd;
        let n_head = config.n_head;
        if n_head == 0 || !n_embd.is_multiple_of(n_head) {
            return Err(candle_core::Error::Msg(format!(
                "n_embd ({n_embd}) must be divisible by n_head ({n_head})"
            )));
        }

        let qkv = pb
            .pp("qkv")
            .linear(n_embd, 3 * n_embd, config.a_bias, ParamRole::LinearWeight)?;
        let proj = pb.pp("proj").linear(
            n_embd,
            n_embd,
            config.a_bias,
            ParamRole::ResidualProjection,
        )?;
        let tril = create_causal_mask(config.context_len, pb.device())?;

        Ok(Self {
            qkv,
            proj,
            tril,
            attn_dropout: Dropout::new(config.dropout, rng.clone()),
            resid_dropout: Dropout::new(config.dropout, rng.clone()),
            n_head,
            n_embd,
            head_size: config.head_size(),
        })
    }

    /// Forward pass for causal self-attention.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd), seq_len <= context_len
    /// * `train` - Whether dropout is active
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    #[allow(clippy::many_single_char_names)]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;

        // (B, T, C) -> (B, T, 3*C), laid out as [q | k | v]
        let qkv = self.qkv.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(D::Minus1, i * self.n_embd, self.n_embd)?
                .reshape((b, t, self.n_head, self.head_size))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_size as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let att = (q.matmul(&k_t)? * scale)?;

        // Only the first t rows/columns of the mask apply to this call.
        let keep = self
            .tril
            .narrow(0, 0, t)?
            .narrow(1, 0, t)?
            .broadcast_as(att.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, att.device())?
            .to_dtype(att.dtype())?
            .broadcast_as(att.shape())?;
        let att = keep.where_cond(&att, &neg_inf)?;

        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;

        // (B, n_head, T, T) @ (B, n_head, T, head_size) -> (B, T, C)
        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.n_embd))?;

        let y = self.proj.forward(&y)?;
        self.resid_dropout.forward(&y, train)
    }
}

/// Create the lower-triangular keep-mask.
///
/// Entry (i, j) is 1 when j <= i and 0 otherwise, so position i only sees itself and the past.
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn create_causal_mask(context_len: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(context_len, DType::U8, device)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::model::params::ParamStore;

    fn config() -> GptConfig {
        GptConfig {
            context_len: 6,
            vocab_size: 5,
            n_embd: 16,
            n_head: 4,
            n_layer: 1,
            dropout: 0.0,
            ..GptConfig::default()
        }
    }

    fn build(config: &GptConfig) -> (ParamStore, Result<CausalSelfAttention>) {
        let device = Device::Cpu;
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(0)));
        let mut store = ParamStore::new(&device);
        let attn = CausalSelfAttention::new(config, &mut store.builder().pp("attn"), &rng);
        (store, attn)
    }

    #[test]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu).unwrap();
        let values: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(values, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let (_, attn) = build(&GptConfig {
            n_embd: 15,
            ..config()
        });
        assert!(attn.is_err());
    }

    #[test]
    fn test_shorter_sequence_than_context() {
        let config = config();
        let (store, attn) = build(&config);
        let attn = attn.unwrap();
        store
            .initialize(1, &mut StdRng::seed_from_u64(1))
            .unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu).unwrap();
        let y = attn.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_first_position_ignores_future() {
        let config = config();
        let (store, attn) = build(&config);
        let attn = attn.unwrap();
        store
            .initialize(1, &mut StdRng::seed_from_u64(2))
            .unwrap();

        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let tail = Tensor::randn(0f32, 1.0, (1, 3, 16), &device).unwrap();
        let b = Tensor::cat(&[&a.narrow(1, 0, 1).unwrap(), &tail], 1).unwrap();

        let ya: Vec<f32> = attn
            .forward(&a, false)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let yb: Vec<f32> = attn
            .forward(&b, false)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(ya, yb);
    }
}
