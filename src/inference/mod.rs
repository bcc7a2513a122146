//! Name generation from a trained model.

pub mod generate;
pub mod sampling;

pub use generate::{SampleConfig, generate_name, generate_names};
pub use sampling::sample_from_logits;
