use std::sync::Arc;

use arbor_core::{Pretrain, RunConfig, Vocab};
use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN, lstm};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear};

use super::BatchInputs;
use crate::foundation::{CharlmPair, TransformerFeatures};

/// Frozen resources a model reads features from.
#[derive(Clone, Default)]
pub struct FeatureSources {
    pub pretrain: Option<Arc<Pretrain>>,
    pub charlm: Option<CharlmPair>,
    pub transformer: Option<Arc<TransformerFeatures>>,
}

/// Summarises each word's characters with the last state of a char LSTM.
#[derive(Debug, Clone)]
struct CharModel {
    embedding: Embedding,
    layers: Vec<LSTM>,
    projection: Linear,
}

impl CharModel {
    fn new(num_chars: usize, emb_dim: usize, hidden_dim: usize, num_layers: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers.max(1));
        for layer in 0..num_layers.max(1) {
            let in_dim = if layer == 0 { emb_dim } else { hidden_dim };
            layers.push(lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp(format!("lstm{layer}")))?);
        }
        Ok(Self {
            embedding: embedding(num_chars, emb_dim, vb.pp("emb"))?,
            layers,
            projection: linear(hidden_dim, out_dim, vb.pp("proj"))?,
        })
    }

    fn forward(&self, inputs: &BatchInputs) -> Result<Tensor> {
        let words = inputs.batch_size * inputs.seq_len;
        let mut h = self.embedding.forward(&inputs.chars)?;
        for layer in &self.layers {
            h = layer.states_to_tensor(&layer.seq(&h)?)?;
        }
        let hidden = h.dim(D::Minus1)?;
        let last: Vec<u32> = inputs
            .char_lens
            .iter()
            .enumerate()
            .map(|(w, &len)| (w * inputs.max_chars + len - 1) as u32)
            .collect();
        let last = Tensor::new(last.as_slice(), h.device())?;
        let summary = h.reshape((words * inputs.max_chars, hidden))?.index_select(&last, 0)?;
        self.projection
            .forward(&summary)?
            .reshape((inputs.batch_size, inputs.seq_len, ()))
    }
}

/// Composite word representation: trainable word embedding, char summary,
/// projected pretrained vectors and frozen contextual features, concatenated.
#[derive(Clone)]
pub struct WordRepresentation {
    word_emb: Option<Embedding>,
    char_model: Option<CharModel>,
    pretrained: Option<(Tensor, Linear)>,
    charlm: Option<CharlmPair>,
    transformer: Option<Arc<TransformerFeatures>>,
    dropout: Dropout,
    output_dim: usize,
}

impl WordRepresentation {
    pub fn new(config: &RunConfig, vocab: &Vocab, sources: &FeatureSources, vb: VarBuilder) -> Result<Self> {
        let model = &config.model;
        let mut output_dim = 0;

        let word_emb = if model.word_emb_dim > 0 {
            output_dim += model.word_emb_dim;
            Some(embedding(vocab.word.len(), model.word_emb_dim, vb.pp("word_emb"))?)
        } else {
            None
        };

        let char_model = if config.char && model.char_emb_dim > 0 {
            output_dim += model.transformed_dim;
            Some(CharModel::new(
                vocab.char.len(),
                model.char_emb_dim,
                model.char_hidden_dim,
                model.char_num_layers,
                model.transformed_dim,
                vb.pp("char"),
            )?)
        } else {
            None
        };

        let pretrained = match sources.pretrain.as_deref().filter(|_| config.pretrain) {
            Some(table) => {
                output_dim += model.transformed_dim;
                let vectors = Tensor::from_slice(table.vectors(), (table.len(), table.dim()), vb.device())?;
                let projection = linear(table.dim(), model.transformed_dim, vb.pp("trans_pretrained"))?;
                Some((vectors, projection))
            }
            None => None,
        };

        output_dim += sources.charlm.as_ref().map_or(0, CharlmPair::dim);
        output_dim += sources.transformer.as_ref().map_or(0, |t| t.dim());
        if output_dim == 0 {
            return Err(candle_core::Error::Msg(
                "word representation is empty: enable word embeddings, chars or pretrained vectors".into(),
            ));
        }

        Ok(Self {
            word_emb,
            char_model,
            pretrained,
            charlm: sources.charlm.clone(),
            transformer: sources.transformer.clone(),
            dropout: Dropout::new(model.dropout as f32),
            output_dim,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// `[B, T, output_dim]` for the padded positions of `inputs`.
    pub fn forward(&self, inputs: &BatchInputs, train: bool) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(5);
        if let Some(emb) = &self.word_emb {
            parts.push(emb.forward(&inputs.words)?);
        }
        if let Some(chars) = &self.char_model {
            parts.push(chars.forward(inputs)?);
        }
        if let Some((vectors, projection)) = &self.pretrained {
            let ids = inputs.pretrained.flatten_all()?;
            let rows = vectors.index_select(&ids, 0)?.detach();
            parts.push(
                projection
                    .forward(&rows)?
                    .reshape((inputs.batch_size, inputs.seq_len, ()))?,
            );
        }
        if let Some(charlm) = &self.charlm {
            parts.push(charlm.features(inputs).map_err(candle_core::Error::wrap)?);
        }
        if let Some(transformer) = &self.transformer {
            parts.push(transformer.features(inputs).map_err(candle_core::Error::wrap)?);
        }
        let parts = parts
            .iter()
            .map(|p| p.to_dtype(DType::F32))
            .collect::<Result<Vec<_>>>()?;
        self.dropout.forward(&Tensor::cat(&parts, D::Minus1)?, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing;
    use arbor_core::VocabPolicy;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn vocab() -> Vocab {
        Vocab::build(&[testing::corpus()], 1, VocabPolicy::Union).unwrap()
    }

    #[test]
    fn concatenates_enabled_parts() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = RunConfig::tagger();
        config.model.word_emb_dim = 6;
        config.model.char_emb_dim = 4;
        config.model.char_hidden_dim = 5;
        config.model.transformed_dim = 3;

        let pretrain = Pretrain::from_pairs(vec![("dog".into(), vec![0.5, 0.5]), ("cats".into(), vec![1.0, 0.0])]).unwrap();
        let sources = FeatureSources {
            pretrain: Some(Arc::new(pretrain)),
            ..FeatureSources::default()
        };
        let repr = WordRepresentation::new(&config, &vocab(), &sources, vb).unwrap();
        assert_eq!(repr.output_dim(), 6 + 3 + 3);

        let inputs = BatchInputs::new(&testing::batch(), false, None, &Device::Cpu).unwrap();
        let out = repr.forward(&inputs, true).unwrap();
        assert_eq!(out.dims(), &[3, 4, 12]);
    }

    #[test]
    fn empty_representation_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = RunConfig::tagger().with_pretrain(false);
        config.char = false;
        config.model.word_emb_dim = 0;
        assert!(WordRepresentation::new(&config, &vocab(), &FeatureSources::default(), vb).is_err());
    }
}
