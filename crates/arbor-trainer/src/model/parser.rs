use arbor_core::{RunConfig, Vocab};
use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder, embedding};

use super::biaffine::DeepBiaffine;
use super::embedding::{FeatureSources, WordRepresentation};
use super::encoder::BiLstm;
use super::{BatchInputs, NEG_INF, argmax_rows, mask_reserved, masked_cross_entropy, split_by_lens};

/// Predicted heads (`0` is the root) and relation ids per sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePredictions {
    pub heads: Vec<Vec<u32>>,
    pub deprels: Vec<Vec<u32>>,
}

/// Biaffine dependency parser over a `<ROOT>`-prefixed sentence.
#[derive(Clone)]
pub struct ParserModel {
    repr: WordRepresentation,
    upos_emb: Embedding,
    xpos_emb: Embedding,
    encoder: BiLstm,
    arc: DeepBiaffine,
    rel: DeepBiaffine,
    num_rels: usize,
}

struct ParserScores {
    /// `[B, T, T]`: dependent by candidate head, invalid heads masked.
    arcs: Tensor,
    /// `[B, T, T, R]`.
    rels: Tensor,
}

impl ParserModel {
    pub fn new(config: &RunConfig, vocab: &Vocab, sources: &FeatureSources, vb: VarBuilder) -> Result<Self> {
        let model = &config.model;
        let repr = WordRepresentation::new(config, vocab, sources, vb.pp("repr"))?;
        let input_dim = repr.output_dim() + 2 * model.tag_emb_dim;
        let encoder = BiLstm::new(
            input_dim,
            model.hidden_dim,
            model.num_layers,
            model.dropout as f32,
            vb.pp("encoder"),
        )?;
        let enc_dim = encoder.output_dim();
        let dropout = model.dropout as f32;
        Ok(Self {
            upos_emb: embedding(vocab.upos.len(), model.tag_emb_dim, vb.pp("upos_emb"))?,
            xpos_emb: embedding(vocab.xpos.len(), model.tag_emb_dim, vb.pp("xpos_emb"))?,
            arc: DeepBiaffine::new(enc_dim, enc_dim, model.deep_biaff_hidden_dim, 1, dropout, vb.pp("arc"))?,
            rel: DeepBiaffine::new(
                enc_dim,
                enc_dim,
                model.deep_biaff_hidden_dim,
                vocab.deprel.len(),
                dropout,
                vb.pp("rel"),
            )?,
            num_rels: vocab.deprel.len(),
            repr,
            encoder,
        })
    }

    fn scores(&self, inputs: &BatchInputs, train: bool) -> Result<ParserScores> {
        let words = self.repr.forward(inputs, train)?;
        let upos = self.upos_emb.forward(&inputs.upos)?;
        let xpos = self.xpos_emb.forward(&inputs.xpos)?;
        let x = Tensor::cat(&[&words, &upos, &xpos], D::Minus1)?;
        let lens: Vec<usize> = inputs.lens.iter().map(|len| len + inputs.root_offset).collect();
        let h = self.encoder.forward(&x, &lens, train)?;

        let arcs = self.arc.forward(&h, &h, train)?.squeeze(3)?;
        let arcs = arcs.broadcast_add(&head_mask(inputs)?)?;
        let rels = self.rel.forward(&h, &h, train)?;
        Ok(ParserScores { arcs, rels })
    }

    /// Cross-entropy of each gold head plus that of the gold relation at the
    /// gold head.
    pub fn loss(&self, inputs: &BatchInputs) -> Result<Tensor> {
        let scores = self.scores(inputs, true)?;
        let t = inputs.seq_len;
        let dependents = inputs.word_positions();
        let gold_heads = clamped_heads(inputs);
        let device = inputs.words.device();

        let mut head_targets = vec![0u32; inputs.batch_size * t];
        let mut rel_rows = Vec::with_capacity(dependents.len());
        let mut rel_targets = Vec::with_capacity(dependents.len());
        for (&dep, &head) in dependents.iter().zip(gold_heads.iter().flatten()) {
            head_targets[dep as usize] = head;
            rel_rows.push(dep * t as u32 + head);
        }
        for rels in &inputs.deprels {
            rel_targets.extend_from_slice(rels);
        }

        let head_targets = Tensor::from_vec(head_targets, inputs.batch_size * t, device)?;
        let arc_loss = masked_cross_entropy(&scores.arcs, &dependents, &head_targets)?;

        let rel_rows = Tensor::from_vec(rel_rows, dependents.len(), device)?;
        let rel_logits = scores
            .rels
            .reshape(((), self.num_rels))?
            .index_select(&rel_rows, 0)?;
        let rel_targets = Tensor::from_vec(rel_targets, dependents.len(), device)?;
        let rel_loss = candle_nn::loss::cross_entropy(&rel_logits, &rel_targets)?;
        arc_loss + rel_loss
    }

    /// Greedy decoding: best head per dependent, then the best relation at it.
    pub fn predict(&self, inputs: &BatchInputs) -> Result<ParsePredictions> {
        let scores = self.scores(inputs, false)?;
        let t = inputs.seq_len;
        let dependents = inputs.word_positions();
        let heads = argmax_rows(&scores.arcs.detach(), &dependents)?;

        let rows: Vec<u32> = dependents
            .iter()
            .zip(&heads)
            .map(|(&dep, &head)| dep * t as u32 + head)
            .collect();
        let rels = mask_reserved(&scores.rels.detach())?;
        let deprels = argmax_rows(&rels, &rows)?;
        Ok(ParsePredictions {
            heads: split_by_lens(&heads, &inputs.lens),
            deprels: split_by_lens(&deprels, &inputs.lens),
        })
    }
}

/// Gold heads bounded by sentence length.
fn clamped_heads(inputs: &BatchInputs) -> Vec<Vec<u32>> {
    inputs
        .heads
        .iter()
        .zip(&inputs.lens)
        .map(|(heads, &len)| heads.iter().map(|&h| h.min(len as u32)).collect())
        .collect()
}

/// `[B, T, T]` additive mask: padding heads and self-attachment are excluded.
fn head_mask(inputs: &BatchInputs) -> Result<Tensor> {
    let t = inputs.seq_len;
    let mut mask = vec![0f32; inputs.batch_size * t * t];
    for (b, &len) in inputs.lens.iter().enumerate() {
        let valid = len + inputs.root_offset;
        for dep in 0..t {
            for head in 0..t {
                if head >= valid || head == dep {
                    mask[(b * t + dep) * t + head] = NEG_INF;
                }
            }
        }
    }
    Tensor::from_vec(mask, (inputs.batch_size, t, t), inputs.words.device())?.to_dtype(DType::F32)
}
