//! # Pretrained Word Vectors
//!
//! A frozen word-to-vector table read from a text vector file (word2vec /
//! fastText text layout) or from the safetensors cache written the first time
//! the text file is read.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use crate::cache::FoundationCache;
use crate::error::{ArborError, Result};
use crate::vocab::{UNK_ID, VOCAB_PREFIX};

/// Cache key kind for pretrain tables in the [`FoundationCache`].
pub const PRETRAIN_KIND: &str = "pretrain";

/// Default cap on the number of vectors kept.
pub const DEFAULT_MAX_VOCAB: usize = 250_000;

const TENSOR_NAME: &str = "emb";
const WORDS_KEY: &str = "words";

/// Resolves where the pretrain cache for a treebank lives.
///
/// An explicitly configured file always wins; otherwise the cache sits in
/// `save_dir` named after the shorthand.
pub fn find_pretrain_file(explicit: Option<&Path>, save_dir: &Path, shorthand: &str) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => save_dir.join(format!("{shorthand}.pretrain.safetensors")),
    }
}

/// A frozen embedding table. Rows for the reserved vocabulary prefix are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Pretrain {
    words: Vec<String>,
    index: HashMap<String, u32>,
    vectors: Vec<f32>,
    dim: usize,
}

impl Pretrain {
    /// Loads the table from `cache_path`, or parses `vec_file` and writes the
    /// cache when the cache does not exist yet.
    pub fn load(cache_path: &Path, vec_file: Option<&Path>, max_vocab: usize) -> Result<Self> {
        if cache_path.exists() {
            info!(path = %cache_path.display(), "reading pretrain cache");
            return Self::read_cache(cache_path);
        }

        let vec_file = vec_file.ok_or_else(|| ArborError::ResourceNotFound(cache_path.into()))?;
        if !vec_file.exists() {
            return Err(ArborError::ResourceNotFound(vec_file.to_path_buf()));
        }

        info!(path = %vec_file.display(), max_vocab, "reading word vectors");
        let pretrain = Self::read_text(vec_file, max_vocab)?;
        pretrain.write_cache(cache_path)?;
        info!(
            path = %cache_path.display(),
            words = pretrain.num_words(),
            dim = pretrain.dim,
            "wrote pretrain cache"
        );
        Ok(pretrain)
    }

    /// Like [`Pretrain::load`], but shared through `cache` so a second trainer
    /// asking for the same file reuses the table.
    pub fn load_shared(
        cache: &FoundationCache,
        cache_path: &Path,
        vec_file: Option<&Path>,
        max_vocab: usize,
    ) -> Result<std::sync::Arc<Self>> {
        // the cap changes the table, so it is part of the key
        cache.get_or_load_variant(PRETRAIN_KIND, cache_path, &max_vocab.to_string(), |path| {
            Self::load(path, vec_file, max_vocab)
        })
    }

    /// Builds a table directly from `(word, vector)` pairs.
    pub fn from_pairs(pairs: Vec<(String, Vec<f32>)>) -> Result<Self> {
        let dim = pairs.first().map_or(0, |(_, v)| v.len());
        let mut words: Vec<String> = VOCAB_PREFIX.iter().map(|s| s.to_string()).collect();
        let mut vectors = vec![0.0; VOCAB_PREFIX.len() * dim];
        let mut index = HashMap::new();

        for (word, vector) in pairs {
            if vector.len() != dim {
                return Err(ArborError::Configuration(format!(
                    "vector for {word:?} has {} dimensions, expected {dim}",
                    vector.len()
                )));
            }
            if index.contains_key(&word) || VOCAB_PREFIX.contains(&word.as_str()) {
                continue;
            }
            index.insert(word.clone(), words.len() as u32);
            words.push(word);
            vectors.extend(vector);
        }

        Ok(Self {
            words,
            index,
            vectors,
            dim,
        })
    }

    fn read_text(path: &Path, max_vocab: usize) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut pairs = Vec::new();
        let mut dim = None;

        for (line_no, line) in reader.lines().enumerate() {
            if pairs.len() >= max_vocab {
                break;
            }
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let values: Vec<&str> = parts.collect();

            // word2vec header: "<count> <dim>"
            if line_no == 0 && values.len() == 1 && word.parse::<usize>().is_ok() {
                continue;
            }

            let vector = values
                .iter()
                .map(|v| v.parse::<f32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ArborError::format(path, line_no + 1, e.to_string()))?;

            match dim {
                None => dim = Some(vector.len()),
                Some(d) if d != vector.len() => {
                    return Err(ArborError::format(
                        path,
                        line_no + 1,
                        format!("expected {d} dimensions, found {}", vector.len()),
                    ));
                }
                Some(_) => {}
            }
            pairs.push((word.to_string(), vector));
        }

        Self::from_pairs(pairs)
    }

    fn read_cache(path: &Path) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
        let words_json = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(WORDS_KEY))
            .ok_or_else(|| ArborError::format(path, 0, "pretrain cache has no word list"))?;
        let cached_words: Vec<String> = serde_json::from_str(words_json)?;

        let tensors = SafeTensors::deserialize(&buffer)?;
        let view = tensors.tensor(TENSOR_NAME)?;
        let shape = view.shape();
        if view.dtype() != Dtype::F32 || shape.len() != 2 || shape[0] != cached_words.len() {
            return Err(ArborError::format(
                path,
                0,
                format!("unexpected embedding tensor {:?} {shape:?}", view.dtype()),
            ));
        }
        let vectors: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let index = cached_words
            .iter()
            .enumerate()
            .skip(VOCAB_PREFIX.len())
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();

        Ok(Self {
            words: cached_words,
            index,
            vectors,
            dim: shape[1],
        })
    }

    fn write_cache(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let bytes: Vec<u8> = self.vectors.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::F32, vec![self.words.len(), self.dim], &bytes)?;
        let metadata = HashMap::from([(WORDS_KEY.to_string(), serde_json::to_string(&self.words)?)]);
        safetensors::serialize_to_file([(TENSOR_NAME, &view)], &Some(metadata), path)?;
        Ok(())
    }

    /// Row id for `word`; exact match first, then lower-cased.
    pub fn word_id(&self, word: &str) -> u32 {
        self.index
            .get(word)
            .or_else(|| self.index.get(&word.to_lowercase()))
            .copied()
            .unwrap_or(UNK_ID)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows, including the reserved prefix.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_words() == 0
    }

    /// Number of real words (excluding the reserved prefix).
    pub fn num_words(&self) -> usize {
        self.words.len() - VOCAB_PREFIX.len()
    }

    /// Row-major `[len, dim]` matrix.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTORS: &str = "3 2\nthe 0.1 0.2\ncat 0.3 0.4\nsat 0.5 0.6\n";

    #[test]
    fn test_find_pretrain_file() {
        let save_dir = Path::new("saved_models/pos");
        assert_eq!(
            find_pretrain_file(None, save_dir, "en_ewt"),
            PathBuf::from("saved_models/pos/en_ewt.pretrain.safetensors")
        );
        let explicit = Path::new("/data/en.pt");
        assert_eq!(find_pretrain_file(Some(explicit), save_dir, "en_ewt"), explicit);
    }

    #[test]
    fn test_reads_text_and_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let vec_file = dir.path().join("en.vec");
        std::fs::write(&vec_file, VECTORS).unwrap();
        let cache_path = dir.path().join("en_ewt.pretrain.safetensors");

        let pretrain = Pretrain::load(&cache_path, Some(&vec_file), 2).unwrap();
        assert_eq!(pretrain.num_words(), 2);
        assert_eq!(pretrain.dim(), 2);
        assert_eq!(pretrain.word_id("sat"), UNK_ID);
        assert_eq!(pretrain.vector(pretrain.word_id("The")), &[0.1, 0.2]);
        assert!(cache_path.exists());

        // the cache alone is enough the second time
        std::fs::remove_file(&vec_file).unwrap();
        let cached = Pretrain::load(&cache_path, Some(&vec_file), 2).unwrap();
        assert_eq!(cached, pretrain);
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = Pretrain::load(&dir.path().join("none.safetensors"), None, 10).unwrap_err();
        assert!(matches!(err, ArborError::ResourceNotFound(_)));
    }

    #[test]
    fn test_malformed_vector_row() {
        let dir = tempfile::tempdir().unwrap();
        let vec_file = dir.path().join("bad.vec");
        std::fs::write(&vec_file, "the 0.1 0.2\ncat 0.3\n").unwrap();
        let err = Pretrain::load(&dir.path().join("c.safetensors"), Some(&vec_file), 10).unwrap_err();
        assert!(matches!(err, ArborError::Format { line: 2, .. }));
    }

    #[test]
    fn test_shared_load_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let vec_file = dir.path().join("en.vec");
        std::fs::write(&vec_file, VECTORS).unwrap();
        let cache_path = dir.path().join("en.pretrain.safetensors");

        let cache = FoundationCache::new();
        let a = Pretrain::load_shared(&cache, &cache_path, Some(&vec_file), 10).unwrap();
        std::fs::remove_file(&cache_path).unwrap();
        std::fs::remove_file(&vec_file).unwrap();
        let b = Pretrain::load_shared(&cache, &cache_path, Some(&vec_file), 10).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_shared_load_keys_on_max_vocab() {
        let dir = tempfile::tempdir().unwrap();
        let vec_file = dir.path().join("en.vec");
        std::fs::write(&vec_file, VECTORS).unwrap();
        let cache_path = dir.path().join("en.pretrain.safetensors");

        let cache = FoundationCache::new();
        let small = Pretrain::load_shared(&cache, &cache_path, Some(&vec_file), 1).unwrap();
        std::fs::remove_file(&cache_path).unwrap();
        let full = Pretrain::load_shared(&cache, &cache_path, Some(&vec_file), 3).unwrap();
        assert_eq!(small.num_words(), 1);
        assert_eq!(full.num_words(), 3);
        assert_eq!(cache.len(), 2);
    }
}
