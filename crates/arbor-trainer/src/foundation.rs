//! # Contextual Feature Loaders
//!
//! Frozen feature extractors shared through the [`FoundationCache`]: a pair
//! of character language models (forward and backward) and a DistilBERT
//! encoder. Neither is trained; their outputs are detached before they reach
//! the tagger or parser.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arbor_core::{ArborError, FoundationCache, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN, lstm};
use candle_nn::{Embedding, VarBuilder, VarMap, embedding};
use candle_transformers::models::distilbert::{Config as BertConfig, DistilBertModel};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{info, warn};

use crate::checkpoint::{read_metadata, write_tensors};
use crate::error::ModelResultExt;
use crate::model::BatchInputs;

/// Cache key kind for character language models.
pub const CHARLM_KIND: &str = "charlm";
/// Cache key kind for transformer encoders.
pub const TRANSFORMER_KIND: &str = "transformer";

/// Subword positions a DistilBERT encoder accepts.
const MAX_SUBWORDS: usize = 512;

const CHARS_KEY: &str = "chars";
const DIRECTION_KEY: &str = "direction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// A character-level LSTM language model used as a frozen word feature.
///
/// Stored as safetensors with `char_emb.weight` and the `lstm.*` weights,
/// plus `chars` (JSON list) and `direction` metadata.
pub struct CharLanguageModel {
    embedding: Embedding,
    lstm: LSTM,
    index: HashMap<char, u32>,
    direction: Direction,
    hidden_dim: usize,
    device: Device,
}

impl CharLanguageModel {
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = read_metadata(path)?;
        let chars: Vec<String> = serde_json::from_str(
            metadata
                .get(CHARS_KEY)
                .ok_or_else(|| ArborError::format(path, 0, "charlm has no character list"))?,
        )?;
        let direction = match metadata.get(DIRECTION_KEY).map(String::as_str) {
            None | Some("forward") => Direction::Forward,
            Some("backward") => Direction::Backward,
            Some(other) => {
                return Err(ArborError::format(path, 0, format!("unknown charlm direction {other:?}")));
            }
        };

        let device = Device::Cpu;
        let tensors = candle_core::safetensors::load(path, &device).model_err()?;
        let (_, emb_dim) = tensors
            .get("char_emb.weight")
            .ok_or_else(|| ArborError::format(path, 0, "charlm has no char_emb.weight"))?
            .dims2()
            .model_err()?;
        let hidden_dim = tensors
            .get("lstm.weight_hh_l0")
            .ok_or_else(|| ArborError::format(path, 0, "charlm has no lstm.weight_hh_l0"))?
            .dim(1)
            .model_err()?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        Self::from_parts(&chars, direction, emb_dim, hidden_dim, vb, device)
    }

    fn from_parts(
        chars: &[String],
        direction: Direction,
        emb_dim: usize,
        hidden_dim: usize,
        vb: VarBuilder,
        device: Device,
    ) -> Result<Self> {
        let embedding = embedding(chars.len(), emb_dim, vb.pp("char_emb")).model_err()?;
        let lstm = lstm(emb_dim, hidden_dim, LSTMConfig::default(), vb.pp("lstm")).model_err()?;
        let index = chars
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let mut it = c.chars();
                match (it.next(), it.next()) {
                    (Some(ch), None) => Some((ch, i as u32)),
                    _ => None,
                }
            })
            .collect();
        Ok(Self {
            embedding,
            lstm,
            index,
            direction,
            hidden_dim,
            device,
        })
    }

    /// Writes a randomly initialised model, for bootstrapping a language model
    /// vocabulary before it is trained elsewhere.
    pub fn create(
        path: &Path,
        chars: &[String],
        direction: Direction,
        emb_dim: usize,
        hidden_dim: usize,
    ) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Self::from_parts(chars, direction, emb_dim, hidden_dim, vb, Device::Cpu)?;

        let tensors: Vec<(String, Tensor)> = varmap
            .data()
            .lock()
            .map_err(|_| ArborError::Model("parameter map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let metadata = HashMap::from([
            (CHARS_KEY.to_string(), serde_json::to_string(chars)?),
            (DIRECTION_KEY.to_string(), direction.as_str().to_string()),
        ]);
        write_tensors(&tensors, metadata, path)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// One hidden state per word, `[words.len(), hidden_dim]`. The forward
    /// model reads `w1 w2 ... wn ` and a word's state is taken at the space
    /// that ends it; the backward model does the same over the reversed text.
    pub fn word_features(&self, words: &[String]) -> Result<Tensor> {
        if words.is_empty() {
            return Tensor::zeros((0, self.hidden_dim), DType::F32, &self.device).model_err();
        }
        let ordered: Vec<String> = match self.direction {
            Direction::Forward => words.to_vec(),
            Direction::Backward => words.iter().rev().map(|w| w.chars().rev().collect()).collect(),
        };

        let mut ids = Vec::new();
        let mut ends = Vec::with_capacity(ordered.len());
        for word in &ordered {
            ids.extend(word.chars().map(|c| self.char_id(c)));
            ends.push(ids.len() as u32);
            ids.push(self.char_id(' '));
        }
        if self.direction == Direction::Backward {
            ends.reverse();
        }

        let len = ids.len();
        let input = Tensor::from_vec(ids, (1, len), &self.device).model_err()?;
        let emb = self.embedding.forward(&input).model_err()?;
        let states = self.lstm.seq(&emb).model_err()?;
        let hidden = self.lstm.states_to_tensor(&states).model_err()?.squeeze(0).model_err()?;
        let ends = Tensor::from_vec(ends, words.len(), &self.device).model_err()?;
        Ok(hidden.index_select(&ends, 0).model_err()?.detach())
    }

    fn char_id(&self, c: char) -> u32 {
        self.index.get(&c).copied().unwrap_or(arbor_core::vocab::UNK_ID)
    }
}

/// Forward and backward language models, concatenated per word.
#[derive(Clone)]
pub struct CharlmPair {
    forward: Arc<CharLanguageModel>,
    backward: Arc<CharLanguageModel>,
}

impl CharlmPair {
    pub fn load(cache: &FoundationCache, forward: &Path, backward: &Path) -> Result<Self> {
        let forward = cache.get_or_load(CHARLM_KIND, forward, CharLanguageModel::load)?;
        let backward = cache.get_or_load(CHARLM_KIND, backward, CharLanguageModel::load)?;
        if forward.direction() != Direction::Forward || backward.direction() != Direction::Backward {
            warn!("charlm directions do not match their roles");
        }
        Ok(Self { forward, backward })
    }

    pub fn dim(&self) -> usize {
        self.forward.hidden_dim() + self.backward.hidden_dim()
    }

    /// `[B, T, dim]` features aligned with `inputs`.
    pub fn features(&self, inputs: &BatchInputs) -> Result<Tensor> {
        let per_sentence = inputs
            .forms
            .iter()
            .map(|words| {
                let fwd = self.forward.word_features(words)?;
                let bwd = self.backward.word_features(words)?;
                Tensor::cat(&[&fwd, &bwd], 1).model_err()
            })
            .collect::<Result<Vec<_>>>()?;
        pad_sentence_features(per_sentence, inputs, self.dim())
    }
}

/// A frozen DistilBERT encoder with its tokenizer. Each word is represented
/// by its first subword.
pub struct TransformerFeatures {
    model: DistilBertModel,
    tokenizer: HfTokenizer,
    dim: usize,
    device: Device,
}

impl TransformerFeatures {
    /// Loads `config.json`, `tokenizer.json` and `model.safetensors` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let device = Device::Cpu;
        let config_path = dir.join("config.json");
        let weights_path = dir.join("model.safetensors");
        let tokenizer_path = dir.join("tokenizer.json");
        for path in [&config_path, &weights_path, &tokenizer_path] {
            if !path.exists() {
                return Err(ArborError::ResourceNotFound(path.clone()));
            }
        }

        let config_str = std::fs::read_to_string(&config_path)?;
        let raw: serde_json::Value = serde_json::from_str(&config_str)?;
        let dim = raw
            .get("dim")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ArborError::format(&config_path, 0, "transformer config has no `dim`"))?
            as usize;
        let config: BertConfig = serde_json::from_str(&config_str)?;

        let tokenizer = HfTokenizer::from_file(&tokenizer_path).map_err(|e| ArborError::Model(e.to_string()))?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights_path], DType::F32, &device) }.model_err()?;
        let vb = if vb.contains_tensor("distilbert.embeddings.word_embeddings.weight") {
            vb.pp("distilbert")
        } else {
            vb
        };
        let model = DistilBertModel::load(vb, &config).model_err()?;
        info!(dir = %dir.display(), dim, "loaded transformer encoder");
        Ok(Self {
            model,
            tokenizer,
            dim,
            device,
        })
    }

    /// Loads through `cache`, keyed by the model directory.
    pub fn load_shared(cache: &FoundationCache, dir: &Path) -> Result<Arc<Self>> {
        cache.get_or_load(TRANSFORMER_KIND, dir, Self::load)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `[words.len(), dim]` features. Words past the subword limit get zeros.
    pub fn word_features(&self, words: &[String]) -> Result<Tensor> {
        let pieces: Vec<&str> = words.iter().map(String::as_str).collect();
        let encoding = self
            .tokenizer
            .encode(pieces, true)
            .map_err(|e| ArborError::Model(format!("tokenize error: {e}")))?;

        let limit = encoding.get_ids().len().min(MAX_SUBWORDS);
        let ids = &encoding.get_ids()[..limit];
        let mut first_subword = vec![limit as u32; words.len()];
        let mut seen = vec![false; words.len()];
        for (position, word) in encoding.get_word_ids()[..limit].iter().enumerate() {
            if let Some(w) = word.map(|w| w as usize).filter(|&w| w < words.len() && !seen[w]) {
                seen[w] = true;
                first_subword[w] = position as u32;
            }
        }

        let input_ids = Tensor::new(ids, &self.device).model_err()?.unsqueeze(0).model_err()?;
        let mask = Tensor::zeros((1, limit), DType::U8, &self.device).model_err()?;
        let hidden = self
            .model
            .forward(&input_ids, &mask)
            .model_err()?
            .squeeze(0)
            .model_err()?;
        let padded = Tensor::cat(
            &[&hidden, &Tensor::zeros((1, self.dim), hidden.dtype(), &self.device).model_err()?],
            0,
        )
        .model_err()?;
        let index = Tensor::from_vec(first_subword, words.len(), &self.device).model_err()?;
        Ok(padded.index_select(&index, 0).model_err()?.detach())
    }

    pub fn features(&self, inputs: &BatchInputs) -> Result<Tensor> {
        let per_sentence = inputs
            .forms
            .iter()
            .map(|words| self.word_features(words))
            .collect::<Result<Vec<_>>>()?;
        pad_sentence_features(per_sentence, inputs, self.dim)
    }
}

/// Stacks `[len_i, dim]` per-sentence features into `[B, T, dim]`, with zero
/// rows for the root position and padding.
pub(crate) fn pad_sentence_features(per_sentence: Vec<Tensor>, inputs: &BatchInputs, dim: usize) -> Result<Tensor> {
    let device = inputs.words.device();
    let mut rows = Vec::with_capacity(per_sentence.len());
    for (features, &len) in per_sentence.iter().zip(&inputs.lens) {
        let mut parts = Vec::with_capacity(3);
        if inputs.root_offset > 0 {
            parts.push(Tensor::zeros((inputs.root_offset, dim), DType::F32, device).model_err()?);
        }
        parts.push(features.to_dtype(DType::F32).model_err()?);
        let tail = inputs.seq_len - inputs.root_offset - len;
        if tail > 0 {
            parts.push(Tensor::zeros((tail, dim), DType::F32, device).model_err()?);
        }
        rows.push(Tensor::cat(&parts, 0).model_err()?);
    }
    Tensor::stack(&rows, 0).model_err()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::testing;

    fn alphabet() -> Vec<String> {
        let mut chars: Vec<String> = arbor_core::vocab::VOCAB_PREFIX.iter().map(|s| s.to_string()).collect();
        chars.extend("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ .".chars().map(String::from));
        chars
    }

    pub(crate) fn write_charlm_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let forward = dir.join("en_test_forward_charlm.safetensors");
        let backward = dir.join("en_test_backward_charlm.safetensors");
        CharLanguageModel::create(&forward, &alphabet(), Direction::Forward, 8, 6).unwrap();
        CharLanguageModel::create(&backward, &alphabet(), Direction::Backward, 8, 5).unwrap();
        (forward, backward)
    }

    #[test]
    fn charlm_round_trip_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, backward) = write_charlm_pair(dir.path());

        let model = CharLanguageModel::load(&backward).unwrap();
        assert_eq!(model.direction(), Direction::Backward);
        assert_eq!(model.hidden_dim(), 5);

        let words: Vec<String> = ["The", "dog"].iter().map(|s| s.to_string()).collect();
        assert_eq!(model.word_features(&words).unwrap().dims(), &[2, 5]);
        assert_eq!(model.word_features(&[]).unwrap().dims(), &[0, 5]);

        let cache = FoundationCache::new();
        let pair = CharlmPair::load(&cache, &forward, &backward).unwrap();
        assert_eq!(pair.dim(), 11);
        let inputs = BatchInputs::new(&testing::batch(), true, None, &Device::Cpu).unwrap();
        assert_eq!(pair.features(&inputs).unwrap().dims(), &[3, 5, 11]);
    }

    #[test]
    fn forward_features_ignore_following_words() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, _) = write_charlm_pair(dir.path());
        let model = CharLanguageModel::load(&forward).unwrap();

        let short: Vec<String> = vec!["dog".into()];
        let long: Vec<String> = vec!["dog".into(), "barks".into()];
        let a = model.word_features(&short).unwrap().to_vec2::<f32>().unwrap();
        let b = model.word_features(&long).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_transformer_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = TransformerFeatures::load(dir.path()).err().unwrap();
        assert!(matches!(err, ArborError::ResourceNotFound(_)));
    }
}
