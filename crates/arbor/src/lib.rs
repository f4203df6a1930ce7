//! # Arbor
//!
//! Train and evaluate neural POS / morphological taggers and dependency
//! parsers over CoNLL-U treebanks.
//!
//! This crate re-exports [`arbor_core`] (corpora, vocabularies, batching,
//! scoring, the training controller) and [`arbor_trainer`] (models and the
//! train / predict entry points).

pub use arbor_core::*;
pub use arbor_trainer::{
    self as trainer, CharlmPair, Columns, Outcome, Trainer, TrainerOptimizer, TransformerFeatures,
    TreebankMode, TreebankReport, evaluate, run, run_treebank, train,
};
