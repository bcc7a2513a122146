//! Data preparation and batching.

pub mod loader;
pub mod prepare;

pub use loader::TokenDataset;
pub use prepare::{DataConfig, META_FILE, NameProcessor, PrepareSummary, SPLIT_FILES, Splits};
