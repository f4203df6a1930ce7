//! # Vocabularies
//!
//! Closed string-to-id maps built once from the training corpora and frozen
//! for the rest of the run. Every category shares the same reserved prefix so
//! that padding and unknown handling is identical across categories.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::conllu::{Document, EMPTY, Field, Token};
use crate::error::{ArborError, Result};

pub const PAD: &str = "<PAD>";
pub const UNK: &str = "<UNK>";
pub const EMPTY_TOKEN: &str = "<EMPTY>";
pub const ROOT: &str = "<ROOT>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const EMPTY_ID: u32 = 2;
pub const ROOT_ID: u32 = 3;

/// Reserved entries at the start of every vocabulary.
pub const VOCAB_PREFIX: [&str; 4] = [PAD, UNK, EMPTY_TOKEN, ROOT];

/// Default frequency cutoff for the trainable word embedding.
pub const DEFAULT_WORD_CUTOFF: usize = 7;

/// How tag sets from several training files are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VocabPolicy {
    /// Union every file's values, warning about disjoint tag sets.
    #[default]
    Union,
    /// Refuse to build when two files populate a column with disjoint tag sets.
    Strict,
}

/// A single frozen category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVocab {
    items: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, u32>,
    lower: bool,
}

impl CategoryVocab {
    /// Builds a category from value counts; values below `cutoff` are dropped.
    fn from_counts(counts: HashMap<String, usize>, cutoff: usize, lower: bool) -> Self {
        let mut entries: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(value, count)| *count >= cutoff && !VOCAB_PREFIX.contains(&value.as_str()))
            .collect();
        entries.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));

        let items = VOCAB_PREFIX
            .iter()
            .map(|s| s.to_string())
            .chain(entries.into_iter().map(|(value, _)| value))
            .collect();
        Self::from_items(items, lower)
    }

    fn from_items(items: Vec<String>, lower: bool) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Self { items, index, lower }
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
    }

    /// Id for `unit`, or [`UNK_ID`] when unseen.
    pub fn unit2id(&self, unit: &str) -> u32 {
        self.index
            .get(unit)
            .or_else(|| {
                self.lower
                    .then(|| self.index.get(&unit.to_lowercase()))
                    .flatten()
            })
            .copied()
            .unwrap_or(UNK_ID)
    }

    pub fn id2unit(&self, id: u32) -> &str {
        self.items.get(id as usize).map_or(UNK, String::as_str)
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.index.contains_key(unit)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.len() == VOCAB_PREFIX.len()
    }

    /// Values excluding the reserved prefix.
    pub fn values(&self) -> &[String] {
        &self.items[VOCAB_PREFIX.len()..]
    }
}

/// The full set of vocabularies owned by a trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocab {
    pub word: CategoryVocab,
    pub char: CategoryVocab,
    pub upos: CategoryVocab,
    pub xpos: CategoryVocab,
    pub feats: CategoryVocab,
    pub deprel: CategoryVocab,
}

impl Vocab {
    /// Builds the vocabularies from one or more training documents.
    pub fn build(docs: &[Document], word_cutoff: usize, policy: VocabPolicy) -> Result<Self> {
        check_tag_sets(docs, policy)?;

        let tokens = || docs.iter().flat_map(|d| &d.sentences).flat_map(|s| &s.tokens);

        let mut words = HashMap::new();
        let mut chars = HashMap::new();
        for token in tokens() {
            *words.entry(token.form.to_lowercase()).or_insert(0) += 1;
            for c in token.form.chars() {
                *chars.entry(c.to_string()).or_insert(0) += 1;
            }
        }

        let tag_counts = |field: Field| {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for token in tokens() {
                *counts.entry(token.field(field)).or_insert(0) += 1;
            }
            // An absent category still yields the placeholder.
            counts.entry(EMPTY.to_string()).or_insert(0);
            counts
        };

        Ok(Self {
            word: CategoryVocab::from_counts(words, word_cutoff, true),
            char: CategoryVocab::from_counts(chars, 0, false),
            upos: CategoryVocab::from_counts(tag_counts(Field::Upos), 0, false),
            xpos: CategoryVocab::from_counts(tag_counts(Field::Xpos), 0, false),
            feats: CategoryVocab::from_counts(tag_counts(Field::Feats), 0, false),
            deprel: CategoryVocab::from_counts(tag_counts(Field::Deprel), 0, false),
        })
    }

    /// Vocabulary for a tag column.
    pub fn tags(&self, field: Field) -> &CategoryVocab {
        match field {
            Field::Upos => &self.upos,
            Field::Xpos => &self.xpos,
            Field::Feats => &self.feats,
            Field::Deprel | Field::Head => &self.deprel,
        }
    }

    /// Encodes a token's value for a tag column.
    pub fn tag_id(&self, token: &Token, field: Field) -> u32 {
        self.tags(field).unit2id(&token.field(field))
    }

    /// Stable FNV-1a hash over every category, used to detect train/eval drift.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        for category in [
            &self.word,
            &self.char,
            &self.upos,
            &self.xpos,
            &self.feats,
            &self.deprel,
        ] {
            for item in &category.items {
                for byte in item.bytes().chain(std::iter::once(0xff)) {
                    hash ^= u64::from(byte);
                    hash = hash.wrapping_mul(PRIME);
                }
            }
            hash ^= 0xfe;
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }

    /// Restores the lookup indices after deserialization.
    pub fn reindex(&mut self) {
        for category in [
            &mut self.word,
            &mut self.char,
            &mut self.upos,
            &mut self.xpos,
            &mut self.feats,
            &mut self.deprel,
        ] {
            category.rebuild_index();
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut vocab: Vocab = serde_json::from_str(json)?;
        vocab.reindex();
        Ok(vocab)
    }
}

/// Flags tag categories populated by several files with no value in common.
fn check_tag_sets(docs: &[Document], policy: VocabPolicy) -> Result<()> {
    if docs.len() < 2 {
        return Ok(());
    }

    for field in [Field::Upos, Field::Xpos, Field::Feats, Field::Deprel] {
        let sets: Vec<BTreeSet<String>> = docs
            .iter()
            .filter(|d| d.has_field(field))
            .map(|d| {
                d.sentences
                    .iter()
                    .flat_map(|s| &s.tokens)
                    .map(|t| t.field(field))
                    .filter(|v| v != EMPTY)
                    .collect()
            })
            .collect();

        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                if a.is_disjoint(b) {
                    let message = format!(
                        "training files use disjoint {field} tag sets; they likely need separate runs"
                    );
                    match policy {
                        VocabPolicy::Strict => return Err(ArborError::Configuration(message)),
                        VocabPolicy::Union => warn!("{message}"),
                    }
                }
            }
        }
    }
    Ok(())
}
