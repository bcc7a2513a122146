//! Bavarian City Name GPT
//!
//! A character-level decoder-only transformer trained on Bavarian place names.
//!
//! - [`data`]: raw name list to encoded splits, and random training batches
//! - [`model`]: configuration, layers, loss, and the [`model::BavGpt`] model
//! - [`train`]: AdamW training loop with periodic loss estimates
//! - [`inference`]: temperature / top-k sampling of new names
//! - [`weights`]: checkpoint save and load

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod data;
pub mod device;
pub mod inference;
pub mod model;
pub mod tokenizer;
pub mod train;
pub mod weights;
