//! Raw name list -> encoded train/dev/test splits.
//!
//! Reads a text file with one city name per line, filters and shuffles the names, builds the
//! character vocabulary, and exports each split as a little-endian u16 token stream next to a
//! `meta.json` vocabulary file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::tokenizer::CharVocab;

/// File names of the exported splits, in split order.
pub const SPLIT_FILES: [&str; 3] = ["train.bin", "dev.bin", "test.bin"];
/// File name of the exported vocabulary.
pub const META_FILE: &str = "meta.json";

/// Data preparation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Newline-separated list of names
    pub input_file: PathBuf,
    /// Directory receiving the `.bin` splits and `meta.json`
    pub output_dir: PathBuf,
    /// Seed for shuffling names
    pub seed: u64,
    /// Minimum name length in characters, trailing newline included
    pub min_name_length: usize,
    /// Maximum name length in characters, trailing newline included
    pub max_name_length: usize,
    pub train_size: f64,
    pub dev_size: f64,
    pub test_size: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::from("data/names.txt"),
            output_dir: PathBuf::from("data"),
            seed: 42,
            min_name_length: 3,
            max_name_length: 50,
            train_size: 0.8,
            dev_size: 0.1,
            test_size: 0.1,
        }
    }
}

/// Token streams of the three splits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Splits {
    pub train: Vec<u32>,
    pub dev: Vec<u32>,
    pub test: Vec<u32>,
}

/// Outcome of a preparation run.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareSummary {
    pub valid_names: usize,
    pub vocab_size: usize,
    pub total_tokens: usize,
    pub train_tokens: usize,
    pub dev_tokens: usize,
    pub test_tokens: usize,
}

/// Runs the preparation pipeline for one [`DataConfig`].
pub struct NameProcessor {
    config: DataConfig,
    rng: StdRng,
}

impl NameProcessor {
    #[must_use]
    pub fn new(config: DataConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Load names from the input file, keeping each trailing newline.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn load_raw_data(&self) -> Result<Vec<String>> {
        let path = &self.config.input_file;
        info!(path = %path.display(), "loading names");
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let raw = normalize_line_endings(&raw);
        let names: Vec<String> = raw
            .split_inclusive('\n')
            .filter(|name| self.is_valid_name(name))
            .map(str::to_string)
            .collect();
        info!(valid = names.len(), "loaded names");
        debug!(sample = ?names.iter().take(5).collect::<Vec<_>>(), "first names");
        Ok(names)
    }

    /// Whether a name (with its newline) is within the configured length bounds.
    #[must_use]
    pub fn is_valid_name(&self, name: &str) -> bool {
        let len = name.chars().count();
        (self.config.min_name_length..=self.config.max_name_length).contains(&len)
    }

    /// Shuffle names with the seeded RNG.
    pub fn shuffle_names(&mut self, mut names: Vec<String>) -> Vec<String> {
        names.shuffle(&mut self.rng);
        names
    }

    /// Split a token stream into train, dev, and test.
    ///
    /// Boundaries are `train_size * n`, `(train_size + dev_size) * n`, and
    /// `(1 - test_size) * n`, each truncated; the test split starts at the third boundary.
    #[must_use]
    pub fn create_splits(&self, tokens: &[u32]) -> Splits {
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let boundary = |fraction: f64| -> usize {
            ((fraction * tokens.len() as f64) as usize).min(tokens.len())
        };
        let b1 = boundary(self.config.train_size);
        let b2 = boundary(self.config.train_size + self.config.dev_size).max(b1);
        let b3 = boundary(1.0 - self.config.test_size);

        let splits = Splits {
            train: tokens[..b1].to_vec(),
            dev: tokens[b1..b2].to_vec(),
            test: tokens[b3..].to_vec(),
        };
        info!(
            train = splits.train.len(),
            dev = splits.dev.len(),
            test = splits.test.len(),
            "created splits"
        );
        splits
    }

    /// Write the splits as u16 streams plus the vocabulary to the output directory.
    ///
    /// # Errors
    /// Returns an error if a token does not fit in u16 or a write fails.
    pub fn export_data(&self, splits: &Splits, vocab: &CharVocab) -> Result<()> {
        let dir = &self.config.output_dir;
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        for (name, data) in SPLIT_FILES.iter().zip([&splits.train, &splits.dev, &splits.test]) {
            write_u16_tokens(&dir.join(name), data)?;
        }
        vocab.save(&dir.join(META_FILE))
    }

    /// Load, shuffle, encode, split, and export.
    ///
    /// # Errors
    /// Returns an error if any step fails.
    pub fn execute(&mut self) -> Result<PrepareSummary> {
        let names = self.load_raw_data()?;
        ensure!(
            !names.is_empty(),
            "no valid names in {}",
            self.config.input_file.display()
        );
        let names = self.shuffle_names(names);

        let vocab = CharVocab::from_names(&names);
        ensure!(
            vocab.vocab_size() <= usize::from(u16::MAX) + 1,
            "vocabulary of {} characters does not fit in u16 tokens",
            vocab.vocab_size()
        );
        info!(
            vocab_size = vocab.vocab_size(),
            chars = ?vocab.chars().iter().collect::<String>(),
            "built vocabulary"
        );

        let encoded = vocab.encode(&names.concat())?;
        let splits = self.create_splits(&encoded);
        self.export_data(&splits, &vocab)?;

        let summary = PrepareSummary {
            valid_names: names.len(),
            vocab_size: vocab.vocab_size(),
            total_tokens: encoded.len(),
            train_tokens: splits.train.len(),
            dev_tokens: splits.dev.len(),
            test_tokens: splits.test.len(),
        };
        info!(total_tokens = summary.total_tokens, "data processing completed");
        Ok(summary)
    }
}

/// Convert `\r\n` and lone `\r` line endings to `\n`.
#[must_use]
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Write tokens as little-endian u16.
///
/// # Errors
/// Returns an error if a token exceeds u16 or the write fails.
pub fn write_u16_tokens(path: &Path, tokens: &[u32]) -> Result<()> {
    let mut bytes = Vec::with_capacity(tokens.len() * 2);
    for &t in tokens {
        let t = u16::try_from(t).with_context(|| format!("token {t} does not fit in u16"))?;
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}
