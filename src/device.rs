//! Compute device selection.

use anyhow::{Context, Result, bail};
use candle_core::Device;

/// Resolve a device name from a config file or the command line.
///
/// Accepts `cpu`, `cuda` (or `cuda:N`), and `metal` (`mps` is accepted as an alias).
///
/// # Errors
/// Returns an error for unknown names or when the backend is not available in this build.
pub fn resolve_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal: usize = ordinal
                .parse()
                .with_context(|| format!("invalid device ordinal in {name:?}"))?;
            (kind.to_string(), ordinal)
        }
        None => (name.clone(), 0),
    };

    match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            Device::new_cuda(ordinal).with_context(|| format!("cuda:{ordinal} is not available"))
        }
        "metal" | "mps" => {
            Device::new_metal(ordinal).with_context(|| format!("metal:{ordinal} is not available"))
        }
        other => bail!("unknown device {other:?}; expected cpu, cuda[:N], or metal"),
    }
}
