//! # Run Configuration
//!
//! Typed options for a tagger or parser run. A [`RunConfig`] is validated once
//! before anything is loaded and travels with the checkpoint, so a model can
//! be reloaded with its own hyperparameters.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::LoaderOptions;
use crate::error::{ArborError, Result};
use crate::pretrain::{DEFAULT_MAX_VOCAB, find_pretrain_file};
use crate::vocab::{DEFAULT_WORD_CUTOFF, VocabPolicy};

/// Dev sets larger than this evaluate less often when the interval adapts.
pub const EVAL_INTERVAL_DEV_SIZE: usize = 2000;

/// Which model a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Tagger,
    Parser,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Tagger => write!(f, "tagger"),
            Task::Parser => write!(f, "parser"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Train,
    Predict,
}

impl FromStr for Mode {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Mode::Train),
            "predict" => Ok(Mode::Predict),
            other => Err(ArborError::Configuration(format!(
                "unknown mode {other:?}, expected train or predict"
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Predict => write!(f, "predict"),
        }
    }
}

/// Optimizers a run can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
    /// Adam with the AMSGrad running maximum of the second moment.
    AmsGrad,
}

impl FromStr for OptimizerKind {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            "amsgrad" => Ok(OptimizerKind::AmsGrad),
            other => Err(ArborError::Configuration(format!(
                "unknown optimizer {other:?} (expected sgd, adam, adamw or amsgrad)"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::AdamW => write!(f, "adamw"),
            OptimizerKind::AmsGrad => write!(f, "amsgrad"),
        }
    }
}

/// Network hyperparameters. Always taken from the checkpoint when a model
/// is reloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_dim: usize,
    pub char_hidden_dim: usize,
    pub deep_biaff_hidden_dim: usize,
    pub composite_deep_biaff_hidden_dim: usize,
    /// `0` turns the trainable word embedding off.
    pub word_emb_dim: usize,
    pub char_emb_dim: usize,
    pub tag_emb_dim: usize,
    pub transformed_dim: usize,
    pub num_layers: usize,
    pub char_num_layers: usize,
    pub word_dropout: f64,
    pub dropout: f64,
    pub pretrain_max_vocab: usize,
}

impl ModelConfig {
    pub fn tagger() -> Self {
        Self {
            hidden_dim: 200,
            char_hidden_dim: 400,
            deep_biaff_hidden_dim: 400,
            composite_deep_biaff_hidden_dim: 100,
            word_emb_dim: 75,
            char_emb_dim: 100,
            tag_emb_dim: 50,
            transformed_dim: 125,
            num_layers: 2,
            char_num_layers: 1,
            word_dropout: 0.33,
            dropout: 0.5,
            pretrain_max_vocab: DEFAULT_MAX_VOCAB,
        }
    }

    pub fn parser() -> Self {
        Self {
            hidden_dim: 400,
            num_layers: 3,
            ..Self::tagger()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::tagger()
    }
}

/// Every option of a training or prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub task: Task,
    pub mode: Mode,
    pub lang: Option<String>,
    pub shorthand: String,

    /// One file, or several separated by `;` for the tagger.
    pub train_file: Option<String>,
    pub eval_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub gold_file: Option<PathBuf>,
    /// Score the eval file against itself after predicting.
    pub gold_labels: bool,

    pub save_dir: PathBuf,
    /// May contain `{shorthand}` and `{embedding}`.
    pub save_name: String,
    pub wordvec_dir: PathBuf,
    pub wordvec_file: Option<PathBuf>,
    pub wordvec_pretrain_file: Option<PathBuf>,
    pub charlm_save_dir: PathBuf,
    pub charlm_forward_file: Option<PathBuf>,
    pub charlm_backward_file: Option<PathBuf>,

    pub pretrain: bool,
    pub char: bool,
    pub charlm: bool,
    pub charlm_shorthand: Option<String>,
    /// Directory holding a DistilBERT `config.json`, `model.safetensors` and
    /// `tokenizer.json`.
    pub bert_model: Option<String>,

    pub batch_size: usize,
    pub eval_interval: usize,
    pub adapt_eval_interval: bool,
    pub max_steps: usize,
    pub max_steps_before_stop: usize,
    pub log_step: usize,
    pub lr: f64,
    pub second_lr: Option<f64>,
    pub optim: OptimizerKind,
    pub second_optim: Option<OptimizerKind>,
    pub second_optim_reload: bool,
    pub beta2: f64,
    pub initial_weight_decay: f64,
    pub second_weight_decay: f64,
    pub max_grad_norm: f64,
    pub seed: u64,
    pub augment_nopunct: Option<f64>,
    pub sample_train: f64,
    pub word_cutoff: usize,
    pub strict_vocab: bool,

    pub model: ModelConfig,
}

impl RunConfig {
    /// Defaults of the POS tagger.
    pub fn tagger() -> Self {
        Self {
            task: Task::Tagger,
            mode: Mode::Train,
            lang: None,
            shorthand: String::new(),
            train_file: None,
            eval_file: None,
            output_file: None,
            gold_file: None,
            gold_labels: true,
            save_dir: PathBuf::from("saved_models/pos"),
            save_name: "{shorthand}_{embedding}_tagger.safetensors".into(),
            wordvec_dir: PathBuf::from("extern_data/wordvec"),
            wordvec_file: None,
            wordvec_pretrain_file: None,
            charlm_save_dir: PathBuf::from("saved_models/charlm"),
            charlm_forward_file: None,
            charlm_backward_file: None,
            pretrain: true,
            char: true,
            charlm: false,
            charlm_shorthand: None,
            bert_model: None,
            batch_size: 5000,
            eval_interval: 100,
            adapt_eval_interval: true,
            max_steps: 50_000,
            max_steps_before_stop: 3000,
            log_step: 20,
            lr: 3e-3,
            second_lr: None,
            optim: OptimizerKind::Adam,
            second_optim: Some(OptimizerKind::AmsGrad),
            second_optim_reload: false,
            beta2: 0.95,
            initial_weight_decay: 0.0,
            second_weight_decay: 0.0,
            max_grad_norm: 1.0,
            seed: 1234,
            augment_nopunct: None,
            sample_train: 1.0,
            word_cutoff: DEFAULT_WORD_CUTOFF,
            strict_vocab: false,
            model: ModelConfig::tagger(),
        }
    }

    /// Defaults of the dependency parser. Its second optimizer is always
    /// AMSGrad at `lr`, and the interval between evaluations is fixed.
    pub fn parser() -> Self {
        Self {
            task: Task::Parser,
            save_dir: PathBuf::from("saved_models/depparse"),
            save_name: "{shorthand}_{embedding}_parser.safetensors".into(),
            wordvec_dir: PathBuf::from("extern_data/word2vec"),
            adapt_eval_interval: false,
            model: ModelConfig::parser(),
            ..Self::tagger()
        }
    }

    pub fn with_shorthand(mut self, shorthand: impl Into<String>) -> Self {
        self.shorthand = shorthand.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_train_file(mut self, train_file: impl Into<String>) -> Self {
        self.train_file = Some(train_file.into());
        self
    }

    pub fn with_eval_file(mut self, eval_file: impl Into<PathBuf>) -> Self {
        self.eval_file = Some(eval_file.into());
        self
    }

    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_gold_file(mut self, gold_file: impl Into<PathBuf>) -> Self {
        self.gold_file = Some(gold_file.into());
        self
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_eval_interval(mut self, eval_interval: usize) -> Self {
        self.eval_interval = eval_interval;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_steps_before_stop(mut self, steps: usize) -> Self {
        self.max_steps_before_stop = steps;
        self
    }

    pub fn with_pretrain(mut self, pretrain: bool) -> Self {
        self.pretrain = pretrain;
        self
    }

    pub fn with_second_optim(mut self, second_optim: Option<OptimizerKind>) -> Self {
        self.second_optim = second_optim;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    /// Rejects out-of-range numbers and missing cross-referenced options.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("eval_interval", self.eval_interval),
            ("max_steps", self.max_steps),
            ("max_steps_before_stop", self.max_steps_before_stop),
            ("log_step", self.log_step),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ArborError::Configuration(format!("{name} must be > 0")));
            }
        }

        if !(self.lr > 0.0) {
            return Err(ArborError::Configuration(format!("lr must be > 0, got {}", self.lr)));
        }
        if let Some(lr) = self.second_lr.filter(|lr| !(*lr > 0.0)) {
            return Err(ArborError::Configuration(format!("second_lr must be > 0, got {lr}")));
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return Err(ArborError::Configuration(format!(
                "beta2 must be in [0, 1), got {}",
                self.beta2
            )));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(ArborError::Configuration(format!(
                "max_grad_norm must be > 0, got {}",
                self.max_grad_norm
            )));
        }
        if !(self.sample_train > 0.0 && self.sample_train <= 1.0) {
            return Err(ArborError::Configuration(format!(
                "sample_train must be in (0, 1], got {}",
                self.sample_train
            )));
        }
        if let Some(ratio) = self.augment_nopunct.filter(|r| !(0.0..=1.0).contains(r)) {
            return Err(ArborError::Configuration(format!(
                "augment_nopunct must be in [0, 1], got {ratio}"
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) || !(0.0..1.0).contains(&self.model.word_dropout) {
            return Err(ArborError::Configuration("dropout must be in [0, 1)".into()));
        }
        if self.charlm && self.charlm_shorthand.is_none() {
            return Err(ArborError::Configuration(
                "charlm_shorthand is required to load a pretrained character language model".into(),
            ));
        }
        if self.shorthand.is_empty() {
            return Err(ArborError::Configuration("shorthand is required".into()));
        }

        let needs = |name: &str, present: bool| {
            if present {
                Ok(())
            } else {
                Err(ArborError::Configuration(format!("{name} is required in {} mode", self.mode)))
            }
        };
        needs("eval_file", self.eval_file.is_some())?;
        needs("output_file", self.output_file.is_some())?;
        if self.mode == Mode::Train {
            needs("train_file", self.train_file.is_some())?;
            if self.task == Task::Tagger && !self.gold_labels {
                return Err(ArborError::Configuration(
                    "gold labels cannot be disabled at training time".into(),
                ));
            }
        }
        Ok(())
    }

    /// Training files; the tagger accepts a `;`-separated list.
    pub fn train_files(&self) -> Vec<PathBuf> {
        self.train_file
            .as_deref()
            .map(|files| {
                files
                    .split(';')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The file dev predictions are scored against: the parser's explicit
    /// `gold_file`, or the tagger's eval file when gold labels are on.
    pub fn gold_path(&self) -> Option<&Path> {
        match self.task {
            Task::Parser => self.gold_file.as_deref(),
            Task::Tagger => self
                .gold_labels
                .then_some(self.eval_file.as_deref())
                .flatten(),
        }
    }

    /// Fills in the default forward and backward charlm paths.
    pub fn resolve_charlm_files(&mut self) -> Result<()> {
        if !self.charlm {
            return Ok(());
        }
        let shorthand = self.charlm_shorthand.as_deref().ok_or_else(|| {
            ArborError::Configuration(
                "charlm_shorthand is required to load a pretrained character language model".into(),
            )
        })?;
        if self.charlm_forward_file.is_none() {
            self.charlm_forward_file = Some(
                self.charlm_save_dir
                    .join(format!("{shorthand}_forward_charlm.safetensors")),
            );
        }
        if self.charlm_backward_file.is_none() {
            self.charlm_backward_file = Some(
                self.charlm_save_dir
                    .join(format!("{shorthand}_backward_charlm.safetensors")),
            );
        }
        Ok(())
    }

    /// The `{embedding}` part of the model file name.
    pub fn embedding_name(&self) -> String {
        let mut embedding = "nocharlm".to_string();
        if self.wordvec_pretrain_file.is_none() && self.wordvec_file.is_none() {
            embedding = "nopretrain".into();
        }
        if self.charlm && (self.charlm_forward_file.is_some() || self.charlm_backward_file.is_some()) {
            embedding = "charlm".into();
        }
        if let Some(bert) = self.bert_model.as_deref() {
            embedding = bert.trim_end_matches('/').replace('/', "_");
        }
        embedding
    }

    /// Where the checkpoint is written and read.
    ///
    /// `save_name` is resolved under `save_dir`, unless only the bare
    /// `save_name` exists on disk.
    pub fn model_file_name(&self) -> PathBuf {
        let name = self
            .save_name
            .replace("{shorthand}", &self.shorthand)
            .replace("{embedding}", &self.embedding_name());
        let in_save_dir = self.save_dir.join(&name);
        let bare = PathBuf::from(&name);
        if !in_save_dir.exists() && bare.exists() {
            bare
        } else {
            in_save_dir
        }
    }

    /// Pretrain cache location.
    pub fn pretrain_file(&self) -> PathBuf {
        find_pretrain_file(
            self.wordvec_pretrain_file.as_deref(),
            &self.save_dir,
            &self.shorthand,
        )
    }

    /// Raw vector file read when no pretrain cache exists.
    pub fn vec_file(&self) -> PathBuf {
        if let Some(file) = &self.wordvec_file {
            return file.clone();
        }
        let lang = self
            .lang
            .clone()
            .unwrap_or_else(|| self.shorthand.split('_').next().unwrap_or_default().to_string());
        self.wordvec_dir.join(&lang).join(format!("{lang}.vectors.txt"))
    }

    /// Copies the options that may differ between training and a later run
    /// into a configuration loaded from a checkpoint: every `*_dir` and
    /// `*_file` path, `shorthand` and `mode`.
    pub fn apply_run_overrides(&mut self, run: &RunConfig) {
        self.save_dir = run.save_dir.clone();
        self.wordvec_dir = run.wordvec_dir.clone();
        self.charlm_save_dir = run.charlm_save_dir.clone();

        self.train_file = run.train_file.clone();
        self.eval_file = run.eval_file.clone();
        self.output_file = run.output_file.clone();
        self.gold_file = run.gold_file.clone();
        self.wordvec_file = run.wordvec_file.clone();
        self.wordvec_pretrain_file = run.wordvec_pretrain_file.clone();
        self.charlm_forward_file = run.charlm_forward_file.clone();
        self.charlm_backward_file = run.charlm_backward_file.clone();

        self.shorthand = run.shorthand.clone();
        self.mode = run.mode;
    }

    /// Loader settings for the loader at position `salt`.
    pub fn loader_options(&self, salt: u64) -> LoaderOptions {
        LoaderOptions::default()
            .with_seed(self.seed)
            .with_salt(salt)
            .with_word_cutoff(self.word_cutoff)
            .with_sample_train(self.sample_train)
            .with_augment_nopunct(self.augment_nopunct)
            .with_policy(if self.strict_vocab {
                VocabPolicy::Strict
            } else {
                VocabPolicy::Union
            })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::tagger()
    }
}

/// Evaluation interval scaled to the dev set: `base` up to `threshold`
/// sentences, `base * round(dev_size / threshold)` beyond.
pub fn adaptive_eval_interval(dev_size: usize, threshold: usize, base: usize) -> usize {
    if dev_size <= threshold {
        base
    } else {
        let alpha = (dev_size as f64 / threshold as f64).round_ties_even() as usize;
        base * alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RunConfig {
        RunConfig::tagger()
            .with_shorthand("en_ewt")
            .with_train_file("train.conllu")
            .with_eval_file("dev.conllu")
            .with_output_file("pred.conllu")
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
        let parser = RunConfig {
            task: Task::Parser,
            ..valid()
        };
        assert!(parser.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(valid().with_batch_size(0).validate().is_err());
        assert!(RunConfig { lr: 0.0, ..valid() }.validate().is_err());
        assert!(RunConfig { sample_train: 1.5, ..valid() }.validate().is_err());
        assert!(RunConfig { beta2: 1.0, ..valid() }.validate().is_err());
    }

    #[test]
    fn test_charlm_requires_shorthand() {
        let mut config = RunConfig { charlm: true, ..valid() };
        assert!(matches!(config.validate(), Err(ArborError::Configuration(_))));
        assert!(config.resolve_charlm_files().is_err());

        config.charlm_shorthand = Some("en_1billion".into());
        config.resolve_charlm_files().unwrap();
        assert_eq!(
            config.charlm_forward_file.as_deref(),
            Some(Path::new("saved_models/charlm/en_1billion_forward_charlm.safetensors"))
        );
        assert_eq!(config.embedding_name(), "charlm");
    }

    #[test]
    fn test_unknown_optimizer() {
        assert_eq!("AMSGrad".parse::<OptimizerKind>().unwrap(), OptimizerKind::AmsGrad);
        assert!(matches!(
            "adagrad".parse::<OptimizerKind>(),
            Err(ArborError::Configuration(_))
        ));
    }

    #[test]
    fn test_embedding_name_and_model_file() {
        let config = valid();
        assert_eq!(config.embedding_name(), "nopretrain");
        assert_eq!(
            config.model_file_name(),
            PathBuf::from("saved_models/pos/en_ewt_nopretrain_tagger.safetensors")
        );

        let config = RunConfig {
            wordvec_file: Some("en.vec".into()),
            ..valid()
        };
        assert_eq!(config.embedding_name(), "nocharlm");

        let config = RunConfig {
            bert_model: Some("models/distilbert-base".into()),
            ..valid()
        };
        assert_eq!(config.embedding_name(), "models_distilbert-base");
    }

    #[test]
    fn test_train_files_split() {
        let config = valid().with_train_file("a.conllu;b.conllu ; ");
        assert_eq!(
            config.train_files(),
            vec![PathBuf::from("a.conllu"), PathBuf::from("b.conllu")]
        );
    }

    #[test]
    fn test_override_allow_list() {
        let mut loaded = RunConfig {
            lr: 0.5,
            ..valid()
        }
        .with_model(ModelConfig {
            hidden_dim: 17,
            ..ModelConfig::tagger()
        });
        let run = RunConfig {
            lr: 0.1,
            mode: Mode::Predict,
            batch_size: 3,
            ..valid()
        }
        .with_shorthand("fr_gsd")
        .with_save_dir("elsewhere")
        .with_eval_file("test.conllu");

        loaded.apply_run_overrides(&run);
        assert_eq!(loaded.shorthand, "fr_gsd");
        assert_eq!(loaded.mode, Mode::Predict);
        assert_eq!(loaded.save_dir, PathBuf::from("elsewhere"));
        assert_eq!(loaded.eval_file, Some(PathBuf::from("test.conllu")));
        // modeling options stay as trained
        assert_eq!(loaded.lr, 0.5);
        assert_eq!(loaded.batch_size, 5000);
        assert_eq!(loaded.model.hidden_dim, 17);
    }

    #[test]
    fn test_adaptive_eval_interval() {
        assert_eq!(adaptive_eval_interval(1500, EVAL_INTERVAL_DEV_SIZE, 100), 100);
        assert_eq!(adaptive_eval_interval(2000, EVAL_INTERVAL_DEV_SIZE, 100), 100);
        assert_eq!(adaptive_eval_interval(6100, EVAL_INTERVAL_DEV_SIZE, 100), 300);
        assert_eq!(adaptive_eval_interval(5000, EVAL_INTERVAL_DEV_SIZE, 100), 200);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = valid();
        assert_eq!(RunConfig::from_json(&config.to_json().unwrap()).unwrap(), config);
    }

    #[test]
    fn test_gold_path() {
        assert_eq!(valid().gold_path(), Some(Path::new("dev.conllu")));
        let no_gold = RunConfig {
            gold_labels: false,
            ..valid()
        };
        assert_eq!(no_gold.gold_path(), None);
        let parser = RunConfig {
            task: Task::Parser,
            ..valid()
        };
        assert_eq!(parser.gold_path(), None);
    }
}
