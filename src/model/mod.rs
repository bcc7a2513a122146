pub mod attention;
pub mod config;
pub mod embedding;
pub mod layers;
pub mod loss;
pub mod params;
pub mod transformer;

// Re-exports for convenience
pub use attention::{CausalSelfAttention, create_causal_mask};
pub use config::GptConfig;
pub use embedding::Embeddings;
pub use layers::{Dropout, FeedForward, LayerNorm, TransformerBlock};
pub use loss::{IGNORE_INDEX, cross_entropy};
pub use params::{ParamEntry, ParamRole, ParamStore};
pub use transformer::{BavGpt, POSITION_EMBEDDING, TOKEN_EMBEDDING};
