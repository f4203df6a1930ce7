//! # Models
//!
//! Small candle networks for the two tasks. Both share the composite word
//! representation and the BiLSTM encoder; the tagger adds per-token
//! classifiers, the parser pairwise biaffine scorers.

pub mod biaffine;
pub mod embedding;
pub mod encoder;
pub mod parser;
pub mod tagger;

use arbor_core::{Batch, EncodedSentence};
use arbor_core::vocab::{PAD_ID, ROOT_ID, UNK_ID, VOCAB_PREFIX};
use candle_core::{D, DType, Device, Result, Tensor};
use oorandom::Rand64;

/// Tag columns that contribute to the tagger loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    pub upos: bool,
    pub xpos: bool,
    pub feats: bool,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            upos: true,
            xpos: true,
            feats: true,
        }
    }
}

/// Score used for positions that must never win an argmax.
pub(crate) const NEG_INF: f32 = -1e9;

/// Id tensors for one batch, padded to the longest sentence.
#[derive(Debug, Clone)]
pub struct BatchInputs {
    pub batch_size: usize,
    /// Padded length, including the root position when present.
    pub seq_len: usize,
    /// Number of real words per sentence.
    pub lens: Vec<usize>,
    /// `1` when a `<ROOT>` position was prepended to every sentence.
    pub root_offset: usize,
    pub words: Tensor,
    pub pretrained: Tensor,
    pub upos: Tensor,
    pub xpos: Tensor,
    pub feats: Tensor,
    /// `[batch * seq_len, max_chars]`, one row per padded position.
    pub chars: Tensor,
    pub char_lens: Vec<usize>,
    pub max_chars: usize,
    pub forms: Vec<Vec<String>>,
    pub heads: Vec<Vec<u32>>,
    pub deprels: Vec<Vec<u32>>,
}

impl BatchInputs {
    /// Builds the tensors of `batch`. With a `word_dropout` generator, word
    /// ids are replaced by `<UNK>` with the given probability.
    pub fn new(
        batch: &Batch,
        prepend_root: bool,
        word_dropout: Option<(f64, &mut Rand64)>,
        device: &Device,
    ) -> Result<Self> {
        let root_offset = usize::from(prepend_root);
        let batch_size = batch.len();
        let seq_len = batch.max_len() + root_offset;
        let lens: Vec<usize> = batch.sentences.iter().map(|s| s.len()).collect();

        let sentences = &batch.sentences;
        let pad = |column: fn(&EncodedSentence) -> &[u32]| {
            pad_column(sentences, seq_len, prepend_root, column)
        };

        let mut words = pad(|s| s.words.as_slice());
        if let Some((p, rng)) = word_dropout.filter(|(p, _)| *p > 0.0) {
            for id in words.iter_mut().filter(|id| **id as usize >= VOCAB_PREFIX.len()) {
                if rng.rand_float() < p {
                    *id = UNK_ID;
                }
            }
        }
        let tensor = |flat: Vec<u32>| Tensor::from_vec(flat, (batch_size, seq_len), device);

        let max_chars = sentences
            .iter()
            .flat_map(|s| s.chars.iter().map(Vec::len))
            .max()
            .unwrap_or(1)
            .max(1);
        let mut chars = Vec::with_capacity(batch_size * seq_len * max_chars);
        let mut char_lens = Vec::with_capacity(batch_size * seq_len);
        for sentence in sentences {
            let mut push_word = |word: &[u32]| {
                chars.extend_from_slice(word);
                chars.extend(std::iter::repeat_n(PAD_ID, max_chars - word.len()));
                char_lens.push(word.len().max(1));
            };
            if prepend_root {
                push_word(&[ROOT_ID]);
            }
            for word in &sentence.chars {
                push_word(word);
            }
            for _ in sentence.len() + root_offset..seq_len {
                push_word(&[]);
            }
        }

        Ok(Self {
            batch_size,
            seq_len,
            root_offset,
            words: tensor(words)?,
            pretrained: tensor(pad(|s| s.pretrained.as_slice()))?,
            upos: tensor(pad(|s| s.upos.as_slice()))?,
            xpos: tensor(pad(|s| s.xpos.as_slice()))?,
            feats: tensor(pad(|s| s.feats.as_slice()))?,
            chars: Tensor::from_vec(chars, (batch_size * seq_len, max_chars), device)?,
            char_lens,
            max_chars,
            forms: sentences.iter().map(|s| s.forms.clone()).collect(),
            heads: sentences.iter().map(|s| s.heads.clone()).collect(),
            deprels: sentences.iter().map(|s| s.deprels.clone()).collect(),
            lens,
        })
    }

    /// Flat `batch * seq_len` indices of every real word.
    pub fn word_positions(&self) -> Vec<u32> {
        self.lens
            .iter()
            .enumerate()
            .flat_map(|(b, &len)| {
                let start = b * self.seq_len + self.root_offset;
                (start..start + len).map(|p| p as u32)
            })
            .collect()
    }
}

fn pad_column(
    sentences: &[EncodedSentence],
    seq_len: usize,
    prepend_root: bool,
    column: fn(&EncodedSentence) -> &[u32],
) -> Vec<u32> {
    let mut flat = Vec::with_capacity(sentences.len() * seq_len);
    for sentence in sentences {
        let values = column(sentence);
        if prepend_root {
            flat.push(ROOT_ID);
        }
        flat.extend_from_slice(values);
        flat.resize(flat.len() + seq_len - usize::from(prepend_root) - values.len(), PAD_ID);
    }
    flat
}

/// Cross-entropy over the rows of `logits` (`[.., classes]`) selected by
/// `positions`, against the same positions of the flat `targets`.
pub(crate) fn masked_cross_entropy(logits: &Tensor, positions: &[u32], targets: &Tensor) -> Result<Tensor> {
    let classes = logits.dim(D::Minus1)?;
    let index = Tensor::new(positions, logits.device())?;
    let selected = logits.reshape(((), classes))?.index_select(&index, 0)?;
    let targets = targets.flatten_all()?.index_select(&index, 0)?;
    candle_nn::loss::cross_entropy(&selected, &targets)
}

/// Adds a large negative bias to the reserved vocabulary ids so a decoder
/// never emits padding or unknown markers.
pub(crate) fn mask_reserved(logits: &Tensor) -> Result<Tensor> {
    let classes = logits.dim(D::Minus1)?;
    let bias: Vec<f32> = (0..classes)
        .map(|c| if c < VOCAB_PREFIX.len() { NEG_INF } else { 0.0 })
        .collect();
    let bias = Tensor::from_vec(bias, classes, logits.device())?;
    logits.broadcast_add(&bias)
}

/// Splits a flat per-word vector back into sentences of `lens`.
pub(crate) fn split_by_lens(flat: &[u32], lens: &[usize]) -> Vec<Vec<u32>> {
    let mut start = 0;
    lens.iter()
        .map(|&len| {
            let sentence = flat[start..start + len].to_vec();
            start += len;
            sentence
        })
        .collect()
}

/// Argmax over the last dimension of the rows selected by `positions`.
pub(crate) fn argmax_rows(logits: &Tensor, positions: &[u32]) -> Result<Vec<u32>> {
    let classes = logits.dim(D::Minus1)?;
    let flat = logits.reshape(((), classes))?;
    let index = Tensor::new(positions, logits.device())?;
    flat.index_select(&index, 0)?.argmax(D::Minus1)?.to_vec1::<u32>()
}

pub(crate) fn ones(batch: usize, seq: usize, device: &Device) -> Result<Tensor> {
    Tensor::ones((batch, seq, 1), DType::F32, device)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_inputs_pad_and_root() {
        let batch = testing::batch();
        let inputs = BatchInputs::new(&batch, true, None, &Device::Cpu).unwrap();
        assert_eq!(inputs.seq_len, 5);
        assert_eq!(inputs.words.dims(), &[3, 5]);
        assert_eq!(inputs.chars.dims()[0], 15);
        assert_eq!(inputs.char_lens.len(), 15);

        let words = inputs.words.to_vec2::<u32>().unwrap();
        assert!(words.iter().all(|row| row[0] == ROOT_ID));
        // second sentence (length 3) is padded once
        assert_eq!(words[1][4], PAD_ID);
        assert_eq!(inputs.word_positions().len(), 9);
        assert_eq!(inputs.word_positions()[0], 1);
    }

    #[test]
    fn word_dropout_only_touches_real_words() {
        let batch = testing::batch();
        let mut rng = Rand64::new(3);
        let inputs = BatchInputs::new(&batch, false, Some((0.999_999, &mut rng)), &Device::Cpu).unwrap();
        let words = inputs.words.to_vec2::<u32>().unwrap();
        for (row, len) in words.iter().zip(&inputs.lens) {
            assert!(row[..*len].iter().all(|&id| id == UNK_ID));
            assert!(row[*len..].iter().all(|&id| id == PAD_ID));
        }
    }

    #[test]
    fn split_restores_sentences() {
        assert_eq!(split_by_lens(&[1, 2, 3, 4, 5], &[2, 0, 3]), vec![vec![1, 2], vec![], vec![3, 4, 5]]);
    }

    #[test]
    fn cross_entropy_uses_selected_rows() {
        let device = Device::Cpu;
        // row 1 is garbage and must be skipped
        let logits = Tensor::new(&[[0.0f32, 10.0], [10.0, 0.0], [10.0, 0.0]], &device).unwrap();
        let targets = Tensor::new(&[1u32, 1, 0], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &[0, 2], &targets).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() < 1e-3);
    }

    #[test]
    fn reserved_ids_never_win() {
        let logits = Tensor::new(&[[9.0f32, 9.0, 9.0, 9.0, 1.0, 2.0]], &Device::Cpu).unwrap();
        let masked = mask_reserved(&logits).unwrap();
        assert_eq!(argmax_rows(&masked, &[0]).unwrap(), vec![5]);
    }
}
