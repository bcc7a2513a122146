//! Parameter ownership and initialization.
//!
//! Every learned tensor of the model lives in one [`ParamStore`], tagged with a [`ParamRole`]
//! when it is registered. Initialization dispatches on the tag.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::{Embedding, Linear, VarMap};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use super::layers::LayerNorm;

/// Standard deviation for linear and embedding weights.
pub const INIT_STD: f64 = 0.02;

/// RNG shared by initialization and every dropout site of one model.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Lock the shared RNG, mapping a poisoned lock to a tensor error.
///
/// # Errors
/// Returns an error if another thread panicked while holding the lock.
pub fn lock_rng(rng: &SharedRng) -> Result<MutexGuard<'_, StdRng>> {
    rng.lock()
        .map_err(|e| candle_core::Error::Msg(format!("rng lock poisoned: {e}")))
}

/// What a parameter is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Weight of a linear layer
    LinearWeight,
    /// Weight of an embedding table
    EmbeddingWeight,
    /// Weight of a linear layer that maps back into the residual stream
    ResidualProjection,
    /// Additive bias of a linear layer
    Bias,
    /// Layer norm scale
    NormWeight,
    /// Layer norm shift
    NormBias,
}

impl ParamRole {
    fn is_weight(self) -> bool {
        matches!(
            self,
            Self::LinearWeight | Self::EmbeddingWeight | Self::ResidualProjection
        )
    }
}

/// A registered parameter.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub name: String,
    pub role: ParamRole,
    pub var: Var,
}

/// Owner of all model parameters.
///
/// Parameters are kept in registration order so initialization consumes the RNG
/// deterministically. The same variables are mirrored into a [`VarMap`] for safetensors
/// persistence and for handing to an optimizer.
pub struct ParamStore {
    entries: Vec<ParamEntry>,
    varmap: VarMap,
    device: Device,
}

impl ParamStore {
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            entries: Vec::new(),
            varmap: VarMap::new(),
            device: device.clone(),
        }
    }

    /// Root builder with an empty name prefix.
    pub fn builder(&mut self) -> ParamBuilder<'_> {
        ParamBuilder {
            store: self,
            prefix: String::new(),
        }
    }

    /// Register a new parameter at its backend default value.
    ///
    /// Layer norm scales start at one, everything else at zero.
    ///
    /// # Errors
    /// Returns an error if the name is already taken or allocation fails.
    pub fn register<S: Into<Shape>>(
        &mut self,
        name: &str,
        shape: S,
        role: ParamRole,
    ) -> Result<Tensor> {
        if self.get(name).is_some() {
            return Err(candle_core::Error::Msg(format!(
                "parameter {name} registered twice"
            )));
        }
        let var = match role {
            ParamRole::NormWeight => Var::ones(shape, DType::F32, &self.device)?,
            _ => Var::zeros(shape, DType::F32, &self.device)?,
        };
        self.varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?
            .insert(name.to_string(), var.clone());
        let tensor = var.as_tensor().clone();
        self.entries.push(ParamEntry {
            name: name.to_string(),
            role,
            var,
        });
        Ok(tensor)
    }

    /// Apply the initialization policy.
    ///
    /// General pass: weights ~ N(0, 0.02), biases = 0, norm parameters untouched. Then a single
    /// rescaling pass re-draws residual projections from N(0, 0.02 / sqrt(2 * n_layer)).
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be written.
    pub fn initialize(&self, n_layer: usize, rng: &mut StdRng) -> Result<()> {
        for entry in &self.entries {
            if entry.role.is_weight() {
                fill_normal(&entry.var, INIT_STD, rng)?;
            } else if entry.role == ParamRole::Bias {
                entry.var.set(&entry.var.zeros_like()?)?;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let residual_std = INIT_STD / ((2 * n_layer) as f64).sqrt();
        for entry in &self.entries {
            if entry.role == ParamRole::ResidualProjection {
                fill_normal(&entry.var, residual_std, rng)?;
            }
        }
        Ok(())
    }

    /// Look up a parameter by its full name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All parameters in registration order.
    #[must_use]
    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Variables for an optimizer.
    #[must_use]
    pub fn all_vars(&self) -> Vec<Var> {
        self.entries.iter().map(|e| e.var.clone()).collect()
    }

    /// Total number of scalar parameters. Shared tensors are registered once and counted once.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|e| e.var.elem_count()).sum()
    }

    /// Write all parameters to a safetensors file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
    }

    /// Overwrite every parameter from a safetensors file.
    ///
    /// # Errors
    /// Returns an error if the file is unreadable or a parameter is missing or misshaped.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)
    }
}

fn fill_normal(var: &Var, std: f64, rng: &mut StdRng) -> Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let dist = Normal::new(0.0f32, std as f32)
        .map_err(|e| candle_core::Error::Msg(format!("invalid init std {std}: {e}")))?;
    let data: Vec<f32> = (0..var.elem_count()).map(|_| dist.sample(rng)).collect();
    var.set(&Tensor::from_vec(data, var.shape(), var.device())?)
}

/// Prefix-scoped view of a [`ParamStore`], used by layer constructors.
pub struct ParamBuilder<'a> {
    store: &'a mut ParamStore,
    prefix: String,
}

impl ParamBuilder<'_> {
    /// Builder for a nested component.
    pub fn pp(&mut self, name: impl AsRef<str>) -> ParamBuilder<'_> {
        let prefix = self.path(name.as_ref());
        ParamBuilder {
            store: &mut *self.store,
            prefix,
        }
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.store.device
    }

    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    /// Register a single tensor under this prefix.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub fn tensor<S: Into<Shape>>(
        &mut self,
        name: &str,
        shape: S,
        role: ParamRole,
    ) -> Result<Tensor> {
        let full = self.path(name);
        self.store.register(&full, shape, role)
    }

    /// Linear layer `in_dim -> out_dim`. The weight has shape `(out_dim, in_dim)`.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub fn linear(
        &mut self,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        weight_role: ParamRole,
    ) -> Result<Linear> {
        let weight = self.tensor("weight", (out_dim, in_dim), weight_role)?;
        let bias = if bias {
            Some(self.tensor("bias", out_dim, ParamRole::Bias)?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }

    /// Embedding table with `n` rows of width `dim`.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub fn embedding(&mut self, n: usize, dim: usize) -> Result<Embedding> {
        let weight = self.tensor("weight", (n, dim), ParamRole::EmbeddingWeight)?;
        Ok(Embedding::new(weight, dim))
    }

    /// Layer norm over a last dimension of width `dim`.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub fn layer_norm(&mut self, dim: usize) -> Result<LayerNorm> {
        let weight = self.tensor("weight", dim, ParamRole::NormWeight)?;
        let bias = self.tensor("bias", dim, ParamRole::NormBias)?;
        Ok(LayerNorm::new(weight, bias))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn values(entry: &ParamEntry) -> Vec<f32> {
        entry.var.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn std_of(v: &[f32]) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let n = v.len() as f64;
        let mean = v.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
        (v.iter().map(|&x| (f64::from(x) - mean).powi(2)).sum::<f64>() / n).sqrt()
    }

    #[test]
    fn test_prefixes_compose() {
        let mut store = ParamStore::new(&Device::Cpu);
        store
            .builder()
            .pp("h")
            .pp("0")
            .pp("ffw")
            .pp("c_fc")
            .linear(4, 8, true, ParamRole::LinearWeight)
            .unwrap();
        assert!(store.get("h.0.ffw.c_fc.weight").is_some());
        assert!(store.get("h.0.ffw.c_fc.bias").is_some());
        assert_eq!(store.num_elements(), 4 * 8 + 8);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = ParamStore::new(&Device::Cpu);
        store.register("a", 3, ParamRole::Bias).unwrap();
        assert!(store.register("a", 3, ParamRole::Bias).is_err());
    }

    #[test]
    fn test_defaults_before_init() {
        let mut store = ParamStore::new(&Device::Cpu);
        store.builder().pp("ln").layer_norm(4).unwrap();
        store.builder().pp("fc").linear(4, 4, true, ParamRole::LinearWeight).unwrap();
        assert_eq!(values(store.get("ln.weight").unwrap()), vec![1.0; 4]);
        assert_eq!(values(store.get("ln.bias").unwrap()), vec![0.0; 4]);
        assert!(values(store.get("fc.weight").unwrap()).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_initialize_policy() {
        let mut store = ParamStore::new(&Device::Cpu);
        store
            .builder()
            .pp("fc")
            .linear(64, 256, true, ParamRole::LinearWeight)
            .unwrap();
        store
            .builder()
            .pp("proj")
            .linear(256, 64, true, ParamRole::ResidualProjection)
            .unwrap();
        store.builder().pp("ln").layer_norm(64).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        store.initialize(8, &mut rng).unwrap();

        let fc = std_of(&values(store.get("fc.weight").unwrap()));
        let proj = std_of(&values(store.get("proj.weight").unwrap()));
        assert!((fc - 0.02).abs() < 0.002, "fc std {fc}");
        assert!((proj - 0.005).abs() < 0.0005, "proj std {proj}");
        assert!(values(store.get("fc.bias").unwrap()).iter().all(|&v| v == 0.0));
        assert!(values(store.get("proj.bias").unwrap()).iter().all(|&v| v == 0.0));
        assert_eq!(values(store.get("ln.weight").unwrap()), vec![1.0; 64]);
    }
}
