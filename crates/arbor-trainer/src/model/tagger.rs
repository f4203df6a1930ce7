use arbor_core::{RunConfig, Vocab};
use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear};

use super::biaffine::TokenBiaffine;
use super::embedding::{FeatureSources, WordRepresentation};
use super::encoder::BiLstm;
use super::{BatchInputs, Columns, argmax_rows, mask_reserved, masked_cross_entropy, split_by_lens};

/// Predicted tag ids, one vector per sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPredictions {
    pub upos: Vec<Vec<u32>>,
    pub xpos: Vec<Vec<u32>>,
    pub feats: Vec<Vec<u32>>,
}

/// A classifier over the encoder output conditioned on the UPOS embedding.
#[derive(Debug, Clone)]
struct ConditionedClassifier {
    hidden: Linear,
    scorer: TokenBiaffine,
}

impl ConditionedClassifier {
    fn new(in_dim: usize, hidden: usize, tag_dim: usize, classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: linear(in_dim, hidden, vb.pp("hid"))?,
            scorer: TokenBiaffine::new(hidden, tag_dim, classes, vb.pp("clf"))?,
        })
    }

    fn forward(&self, h: &Tensor, upos: &Tensor, dropout: &Dropout, train: bool) -> Result<Tensor> {
        let hidden = dropout.forward(&self.hidden.forward(h)?.relu()?, train)?;
        self.scorer.forward(&hidden, upos)
    }
}

/// BiLSTM tagger predicting UPOS, then XPOS and FEATS given UPOS.
#[derive(Clone)]
pub struct TaggerModel {
    repr: WordRepresentation,
    encoder: BiLstm,
    upos_hid: Linear,
    upos_clf: Linear,
    upos_emb: Embedding,
    xpos: ConditionedClassifier,
    feats: ConditionedClassifier,
    dropout: Dropout,
}

struct TaggerLogits {
    upos: Tensor,
    xpos: Tensor,
    feats: Tensor,
}

impl TaggerModel {
    pub fn new(config: &RunConfig, vocab: &Vocab, sources: &FeatureSources, vb: VarBuilder) -> Result<Self> {
        let model = &config.model;
        let repr = WordRepresentation::new(config, vocab, sources, vb.pp("repr"))?;
        let encoder = BiLstm::new(
            repr.output_dim(),
            model.hidden_dim,
            model.num_layers,
            model.dropout as f32,
            vb.pp("encoder"),
        )?;
        let enc_dim = encoder.output_dim();
        Ok(Self {
            upos_hid: linear(enc_dim, model.deep_biaff_hidden_dim, vb.pp("upos_hid"))?,
            upos_clf: linear(model.deep_biaff_hidden_dim, vocab.upos.len(), vb.pp("upos_clf"))?,
            upos_emb: embedding(vocab.upos.len(), model.tag_emb_dim, vb.pp("upos_emb"))?,
            xpos: ConditionedClassifier::new(
                enc_dim,
                model.composite_deep_biaff_hidden_dim,
                model.tag_emb_dim,
                vocab.xpos.len(),
                vb.pp("xpos"),
            )?,
            feats: ConditionedClassifier::new(
                enc_dim,
                model.composite_deep_biaff_hidden_dim,
                model.tag_emb_dim,
                vocab.feats.len(),
                vb.pp("feats"),
            )?,
            dropout: Dropout::new(model.dropout as f32),
            repr,
            encoder,
        })
    }

    /// `upos_ids` conditions the XPOS and FEATS scorers; `None` uses the
    /// model's own UPOS predictions.
    fn logits(&self, inputs: &BatchInputs, upos_ids: Option<&Tensor>, train: bool) -> Result<TaggerLogits> {
        let x = self.repr.forward(inputs, train)?;
        let h = self.encoder.forward(&x, &inputs.lens, train)?;

        let upos_hidden = self.dropout.forward(&self.upos_hid.forward(&h)?.relu()?, train)?;
        let upos = self.upos_clf.forward(&upos_hidden)?;
        let predicted;
        let upos_ids = match upos_ids {
            Some(ids) => ids,
            None => {
                predicted = mask_reserved(&upos)?.argmax(D::Minus1)?;
                &predicted
            }
        };
        let upos_emb = self.upos_emb.forward(upos_ids)?;

        Ok(TaggerLogits {
            xpos: self.xpos.forward(&h, &upos_emb, &self.dropout, train)?,
            feats: self.feats.forward(&h, &upos_emb, &self.dropout, train)?,
            upos,
        })
    }

    /// Summed cross-entropy over the enabled columns, conditioned on gold UPOS.
    pub fn loss(&self, inputs: &BatchInputs, columns: Columns) -> Result<Tensor> {
        let logits = self.logits(inputs, Some(&inputs.upos), true)?;
        let positions = inputs.word_positions();
        let mut terms = Vec::with_capacity(3);
        if columns.upos {
            terms.push(masked_cross_entropy(&logits.upos, &positions, &inputs.upos)?);
        }
        if columns.xpos {
            terms.push(masked_cross_entropy(&logits.xpos, &positions, &inputs.xpos)?);
        }
        if columns.feats {
            terms.push(masked_cross_entropy(&logits.feats, &positions, &inputs.feats)?);
        }
        if terms.is_empty() {
            return Err(candle_core::Error::Msg("no tag column to train".into()));
        }
        Tensor::stack(&terms, 0)?.sum_all()
    }

    pub fn predict(&self, inputs: &BatchInputs) -> Result<TagPredictions> {
        let logits = self.logits(inputs, None, false)?;
        let positions = inputs.word_positions();
        let decode = |scores: &Tensor| -> Result<Vec<Vec<u32>>> {
            let ids = argmax_rows(&mask_reserved(&scores.detach())?, &positions)?;
            Ok(split_by_lens(&ids, &inputs.lens))
        };
        Ok(TagPredictions {
            upos: decode(&logits.upos)?,
            xpos: decode(&logits.xpos)?,
            feats: decode(&logits.feats)?,
        })
    }
}
