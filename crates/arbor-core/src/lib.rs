//! # Arbor Core
//!
//! Everything a tagger or parser run needs besides the network itself:
//! CoNLL-U corpora, frozen vocabularies, token-budgeted batching, pretrained
//! vector tables behind a shared foundation cache, scoring, typed run options
//! and the training controller.
//!
//! ## Quick Start
//!
//! ```rust
//! use arbor_core::{DataLoader, Document, LoaderOptions};
//!
//! let text = "1\tDogs\tdog\tNOUN\tNNS\t_\t2\tnsubj\t_\t_\n\
//!             2\tbark\tbark\tVERB\tVBP\t_\t0\troot\t_\t_\n\n";
//! let doc = Document::from_reader(text.as_bytes(), std::path::Path::new("inline.conllu")).unwrap();
//!
//! let loader = DataLoader::new(doc, 5000, &LoaderOptions::default(), None, None, true, true).unwrap();
//! assert_eq!(loader.len(), 1);
//! assert_eq!(loader.batches()[0].num_tokens(), 2);
//! ```
pub mod augment;
pub mod batch;
pub mod cache;
pub mod config;
pub mod conllu;
pub mod controller;
pub mod error;
pub mod pretrain;
pub mod scorer;
pub mod vocab;

// Re-export primary API
pub use batch::{Batch, DataLoader, EncodedSentence, LoaderOptions, reconcile_columns, unsort};
pub use cache::FoundationCache;
pub use config::{Mode, ModelConfig, OptimizerKind, RunConfig, Task, adaptive_eval_interval};
pub use conllu::{Document, Field, Sentence, Token};
pub use controller::{
    Controller, Phase, PlateauAction, Schedule, SentencePrediction, StopReason, TaskTrainer,
    TrainingState, TrainingSummary, predict_all, write_predictions,
};
pub use error::{ArborError, Result};
pub use pretrain::{Pretrain, find_pretrain_file};
pub use scorer::{EvalType, ParserScorer, Score, Scorer, TaggerScorer, get_eval_type};
pub use vocab::{Vocab, VocabPolicy};
