//! # Arbor Trainer
//!
//! Candle networks for the arbor tagger and parser, the optimizers and
//! checkpoint format they train with, frozen character language model and
//! transformer features, and the train / predict entry points that wire
//! them to the [`arbor_core::Controller`].

pub mod checkpoint;
pub mod error;
pub mod foundation;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod trainer;

pub use checkpoint::CheckpointMeta;
pub use error::ModelResultExt;
pub use foundation::{CharLanguageModel, CharlmPair, Direction, TransformerFeatures};
pub use model::Columns;
pub use optim::{TrainerOptimizer, clip_grad_norm, compute_grad_norm};
pub use pipeline::{Outcome, TreebankMode, TreebankReport, evaluate, run, run_treebank, train};
pub use trainer::Trainer;
