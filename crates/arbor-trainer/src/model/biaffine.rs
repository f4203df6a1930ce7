//! Biaffine scorers.
//!
//! Both variants append a constant `1` to each input so the bilinear form
//! also carries the linear and bias terms. Weights start at zero.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder, linear};

use super::ones;

fn with_bias_column(x: &Tensor) -> Result<Tensor> {
    let (b, t, _) = x.dims3()?;
    Tensor::cat(&[x, &ones(b, t, x.device())?.to_dtype(x.dtype())?], D::Minus1)
}

/// Scores every `(dependent, head)` pair: `[B, T, d1] x [B, T, d2] -> [B, T, T, out]`.
#[derive(Debug, Clone)]
pub struct PairwiseBiaffine {
    weight: Tensor,
    out: usize,
    d2: usize,
}

impl PairwiseBiaffine {
    pub fn new(d1: usize, d2: usize, out: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((d1 + 1, out * (d2 + 1)), "weight", Init::Const(0.0))?;
        Ok(Self { weight, out, d2: d2 + 1 })
    }

    pub fn forward(&self, x1: &Tensor, x2: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x1.dims3()?;
        let x1 = with_bias_column(x1)?;
        let x2 = with_bias_column(x2)?;
        // [B, T*out, d2] x [B, d2, T] -> [B, T*out, T]
        let projected = x1
            .broadcast_matmul(&self.weight)?
            .reshape((b, t * self.out, self.d2))?;
        let scores = projected.matmul(&x2.transpose(1, 2)?.contiguous()?)?;
        scores
            .reshape((b, t, self.out, t))?
            .permute((0, 1, 3, 2))?
            .contiguous()
    }
}

/// Scores each position against a second per-position input:
/// `[B, T, d1] x [B, T, d2] -> [B, T, out]`.
#[derive(Debug, Clone)]
pub struct TokenBiaffine {
    weight: Tensor,
    out: usize,
    d2: usize,
}

impl TokenBiaffine {
    pub fn new(d1: usize, d2: usize, out: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((d1 + 1, out * (d2 + 1)), "weight", Init::Const(0.0))?;
        Ok(Self { weight, out, d2: d2 + 1 })
    }

    pub fn forward(&self, x1: &Tensor, x2: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x1.dims3()?;
        let x1 = with_bias_column(x1)?;
        let x2 = with_bias_column(x2)?.reshape((b * t, self.d2, 1))?;
        let projected = x1
            .broadcast_matmul(&self.weight)?
            .reshape((b * t, self.out, self.d2))?;
        projected.matmul(&x2)?.reshape((b, t, self.out))
    }
}

/// ReLU projections of both inputs followed by a [`PairwiseBiaffine`].
#[derive(Debug, Clone)]
pub struct DeepBiaffine {
    left: Linear,
    right: Linear,
    scorer: PairwiseBiaffine,
    dropout: Dropout,
}

impl DeepBiaffine {
    pub fn new(d1: usize, d2: usize, hidden: usize, out: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            left: linear(d1, hidden, vb.pp("left"))?,
            right: linear(d2, hidden, vb.pp("right"))?,
            scorer: PairwiseBiaffine::new(hidden, hidden, out, vb.pp("scorer"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, x1: &Tensor, x2: &Tensor, train: bool) -> Result<Tensor> {
        let h1 = self.dropout.forward(&self.left.forward(x1)?.relu()?, train)?;
        let h2 = self.dropout.forward(&self.right.forward(x2)?.relu()?, train)?;
        self.scorer.forward(&h1, &h2)
    }
}
