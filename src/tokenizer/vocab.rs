//! Character-level vocabulary for city names.
//!
//! The vocabulary is derived from the training corpus: every distinct character, sorted, gets
//! one id. The newline character is part of the vocabulary and separates names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

/// Mapping between characters and token ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharVocab {
    itos: Vec<char>,
    stoi: BTreeMap<char, u32>,
}

/// On-disk form of the vocabulary (`meta.json`).
#[derive(Debug, Serialize, Deserialize)]
struct VocabMeta {
    vocab_size: usize,
    itos: BTreeMap<u32, char>,
    stoi: BTreeMap<char, u32>,
}

impl CharVocab {
    /// Build a vocabulary from the distinct characters of `names`.
    #[must_use]
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let chars: BTreeSet<char> = names.iter().flat_map(|n| n.as_ref().chars()).collect();
        Self::from_chars(chars.into_iter().collect())
    }

    fn from_chars(itos: Vec<char>) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self { itos, stoi }
    }

    /// Number of distinct tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    /// Token id of `'\n'`, if the corpus contained one.
    #[must_use]
    pub fn newline_id(&self) -> Option<u32> {
        self.stoi.get(&'\n').copied()
    }

    /// Id of a single character.
    #[must_use]
    pub fn char_id(&self, ch: char) -> Option<u32> {
        self.stoi.get(&ch).copied()
    }

    /// Encode text into token ids.
    ///
    /// # Errors
    /// Returns an error naming the first character missing from the vocabulary.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|ch| match self.stoi.get(&ch) {
                Some(&id) => Ok(id),
                None => bail!("character {ch:?} is not in the vocabulary"),
            })
            .collect()
    }

    /// Decode token ids into text. Unknown ids are skipped.
    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&id| self.itos.get(id as usize))
            .collect()
    }

    /// Characters in id order.
    #[must_use]
    pub fn chars(&self) -> &[char] {
        &self.itos
    }

    /// Write the vocabulary as `meta.json`.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let meta = VocabMeta {
            vocab_size: self.vocab_size(),
            itos: self
                .itos
                .iter()
                .enumerate()
                .map(|(i, &c)| (i as u32, c))
                .collect(),
            stoi: self.stoi.clone(),
        };
        let json = serde_json::to_string_pretty(&meta).context("serialize vocabulary")?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))
    }

    /// Read a vocabulary written by [`CharVocab::save`].
    ///
    /// # Errors
    /// Returns an error if the file is missing, malformed, or inconsistent.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let meta: VocabMeta =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

        ensure!(
            meta.itos.len() == meta.vocab_size,
            "vocab_size {} does not match {} itos entries",
            meta.vocab_size,
            meta.itos.len()
        );
        let mut itos = Vec::with_capacity(meta.vocab_size);
        for (expected, (id, ch)) in meta.itos.into_iter().enumerate() {
            ensure!(id as usize == expected, "itos ids are not contiguous at {id}");
            ensure!(
                meta.stoi.get(&ch) == Some(&id),
                "stoi and itos disagree on {ch:?}"
            );
            itos.push(ch);
        }
        Ok(Self::from_chars(itos))
    }
}
