use candle_core::{Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN, lstm};
use candle_nn::{Dropout, VarBuilder};

/// Stacked bidirectional LSTM over padded sentences.
///
/// The backward direction reads each sentence reversed within its own
/// length, so padding never flows into real positions.
#[derive(Debug, Clone)]
pub struct BiLstm {
    layers: Vec<(LSTM, LSTM)>,
    dropout: Dropout,
    hidden_dim: usize,
}

impl BiLstm {
    pub fn new(input_dim: usize, hidden_dim: usize, num_layers: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let in_dim = if layer == 0 { input_dim } else { 2 * hidden_dim };
            let forward = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp(format!("l{layer}_fwd")))?;
            let backward = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp(format!("l{layer}_bwd")))?;
            layers.push((forward, backward));
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
            hidden_dim,
        })
    }

    /// Output width, `2 * hidden_dim`.
    pub fn output_dim(&self) -> usize {
        2 * self.hidden_dim
    }

    /// `x` is `[B, T, D]`; `lens` holds the number of valid positions of each row.
    pub fn forward(&self, x: &Tensor, lens: &[usize], train: bool) -> Result<Tensor> {
        let (_, seq_len, _) = x.dims3()?;
        let reversal = Tensor::new(reversal_index(lens, seq_len).as_slice(), x.device())?;

        let mut h = x.clone();
        for (forward, backward) in &self.layers {
            let fwd = forward.states_to_tensor(&forward.seq(&h)?)?;
            let reversed = reorder(&h, &reversal)?;
            let bwd = backward.states_to_tensor(&backward.seq(&reversed)?)?;
            let bwd = reorder(&bwd, &reversal)?;
            h = self.dropout.forward(&Tensor::cat(&[&fwd, &bwd], 2)?, train)?;
        }
        Ok(h)
    }
}

/// Applies a flat row permutation to `[B, T, D]`.
fn reorder(x: &Tensor, index: &Tensor) -> Result<Tensor> {
    let (b, t, d) = x.dims3()?;
    x.reshape((b * t, d))?.index_select(index, 0)?.reshape((b, t, d))
}

/// Flat indices reversing each row within its length. The permutation is
/// its own inverse.
pub(crate) fn reversal_index(lens: &[usize], seq_len: usize) -> Vec<u32> {
    lens.iter()
        .enumerate()
        .flat_map(|(b, &len)| {
            let len = len.min(seq_len);
            (0..seq_len).map(move |t| {
                let src = if t < len { len - 1 - t } else { t };
                (b * seq_len + src) as u32
            })
        })
        .collect()
}
