//! # Trainer
//!
//! Owns a candle model, its parameters and its optimizer, and implements
//! [`TaskTrainer`] so the controller can drive it. The optimizer moves from
//! the primary to the secondary kind at most once.

use std::path::Path;
use std::sync::Arc;

use arbor_core::controller::SentencePrediction;
use arbor_core::{
    ArborError, Batch, Field, FoundationCache, OptimizerKind, Pretrain, Result, RunConfig, Task, TaskTrainer, Vocab,
};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use oorandom::Rand64;
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointMeta};
use crate::error::ModelResultExt;
use crate::foundation::{CharlmPair, TransformerFeatures};
use crate::model::embedding::FeatureSources;
use crate::model::parser::ParserModel;
use crate::model::tagger::TaggerModel;
use crate::model::{BatchInputs, Columns};
use crate::optim::{TrainerOptimizer, clip_grad_norm};

const TAGGER_FIELDS: &[Field] = &[Field::Upos, Field::Xpos, Field::Feats];
const PARSER_FIELDS: &[Field] = &[Field::Head, Field::Deprel];

enum TaskModel {
    Tagger(TaggerModel),
    Parser(ParserModel),
}

pub struct Trainer {
    config: RunConfig,
    vocab: Arc<Vocab>,
    varmap: VarMap,
    model: TaskModel,
    optimizer: TrainerOptimizer,
    optimizer_kind: OptimizerKind,
    switched: bool,
    columns: Columns,
    rng: Rand64,
    device: Device,
}

impl Trainer {
    /// A freshly initialised model for `config`.
    pub fn new(
        config: RunConfig,
        vocab: Arc<Vocab>,
        pretrain: Option<Arc<Pretrain>>,
        cache: &FoundationCache,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let sources = feature_sources(&config, pretrain, cache)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = match config.task {
            Task::Tagger => TaskModel::Tagger(TaggerModel::new(&config, &vocab, &sources, vb.pp("tagger")).model_err()?),
            Task::Parser => TaskModel::Parser(ParserModel::new(&config, &vocab, &sources, vb.pp("parser")).model_err()?),
        };

        let optimizer = TrainerOptimizer::new(
            config.optim,
            varmap.all_vars(),
            config.lr,
            config.beta2,
            config.initial_weight_decay,
        )
        .model_err()?;
        info!(
            task = %config.task,
            optimizer = %config.optim,
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            vocab = format!("{:016x}", vocab.fingerprint()),
            "built model"
        );

        Ok(Self {
            rng: Rand64::new((u128::from(config.seed) << 64) | 0x5eed),
            optimizer_kind: config.optim,
            switched: false,
            columns: Columns::default(),
            config,
            vocab,
            varmap,
            model,
            optimizer,
            device,
        })
    }

    /// Restores a checkpoint. Modeling options come from the checkpoint; only
    /// the paths, `shorthand` and `mode` of `run` override them.
    pub fn load(
        path: &Path,
        run: &RunConfig,
        pretrain: Option<Arc<Pretrain>>,
        cache: &FoundationCache,
    ) -> Result<Self> {
        let meta = checkpoint::load_meta(path)?;
        let mut config = meta.config;
        config.apply_run_overrides(run);
        config.resolve_charlm_files()?;

        let mut trainer = Self::new(config, Arc::new(meta.vocab), pretrain, cache)?;
        checkpoint::load_weights(&mut trainer.varmap, path)?;
        if meta.switched {
            let lr = trainer.config.second_lr.unwrap_or(trainer.config.lr);
            let weight_decay = trainer.config.second_weight_decay;
            trainer.rebuild_optimizer(meta.optimizer, lr, weight_decay)?;
            trainer.switched = true;
        }
        info!(path = %path.display(), "loaded model");
        Ok(trainer)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    pub fn optimizer_kind(&self) -> OptimizerKind {
        self.optimizer_kind
    }

    pub fn has_switched(&self) -> bool {
        self.switched
    }

    /// Restricts the tagger loss to the columns the training data populates.
    pub fn set_columns(&mut self, columns: Columns) {
        self.columns = columns;
    }

    fn rebuild_optimizer(&mut self, kind: OptimizerKind, lr: f64, weight_decay: f64) -> Result<()> {
        self.optimizer =
            TrainerOptimizer::new(kind, self.varmap.all_vars(), lr, self.config.beta2, weight_decay).model_err()?;
        self.optimizer_kind = kind;
        Ok(())
    }

    fn prepend_root(&self) -> bool {
        matches!(self.model, TaskModel::Parser(_))
    }
}

impl TaskTrainer for Trainer {
    fn update(&mut self, batch: &Batch) -> Result<f32> {
        batch.check_vocab(&self.vocab)?;
        let dropout = self.config.model.word_dropout;
        let inputs =
            BatchInputs::new(batch, self.prepend_root(), Some((dropout, &mut self.rng)), &self.device).model_err()?;
        let loss = match &self.model {
            TaskModel::Tagger(model) => model.loss(&inputs, self.columns),
            TaskModel::Parser(model) => model.loss(&inputs),
        }
        .model_err()?;

        let mut grads = loss.backward().model_err()?;
        clip_grad_norm(&mut grads, &self.varmap.all_vars(), self.config.max_grad_norm).model_err()?;
        self.optimizer.step(&mut grads).model_err()?;
        loss.to_scalar::<f32>().model_err()
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<SentencePrediction>> {
        batch.check_vocab(&self.vocab)?;
        let inputs = BatchInputs::new(batch, self.prepend_root(), None, &self.device).model_err()?;
        let vocab = &self.vocab;
        match &self.model {
            TaskModel::Tagger(model) => {
                let tags = model.predict(&inputs).model_err()?;
                Ok(tags
                    .upos
                    .iter()
                    .zip(&tags.xpos)
                    .zip(&tags.feats)
                    .map(|((upos, xpos), feats)| {
                        upos.iter()
                            .zip(xpos)
                            .zip(feats)
                            .map(|((&u, &x), &f)| {
                                vec![
                                    vocab.upos.id2unit(u).to_string(),
                                    vocab.xpos.id2unit(x).to_string(),
                                    vocab.feats.id2unit(f).to_string(),
                                ]
                            })
                            .collect()
                    })
                    .collect())
            }
            TaskModel::Parser(model) => {
                let parse = model.predict(&inputs).model_err()?;
                Ok(parse
                    .heads
                    .iter()
                    .zip(&parse.deprels)
                    .map(|(heads, rels)| {
                        heads
                            .iter()
                            .zip(rels)
                            .map(|(&head, &rel)| vec![head.to_string(), vocab.deprel.id2unit(rel).to_string()])
                            .collect()
                    })
                    .collect())
            }
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let meta = CheckpointMeta {
            config: self.config.clone(),
            vocab: (*self.vocab).clone(),
            optimizer: self.optimizer_kind,
            switched: self.switched,
        };
        checkpoint::save(&self.varmap, &meta, path)
    }

    fn reload(&mut self, path: &Path) -> Result<()> {
        let meta = checkpoint::load_meta(path)?;
        let (expected, actual) = (self.vocab.fingerprint(), meta.vocab.fingerprint());
        if expected != actual {
            return Err(ArborError::VocabMismatch { expected, actual });
        }
        checkpoint::load_weights(&mut self.varmap, path)
    }

    fn switch_optimizer(&mut self, kind: OptimizerKind, lr: f64, weight_decay: f64) -> Result<()> {
        if self.switched {
            return Err(ArborError::OptimizerAlreadySwitched(self.optimizer_kind.to_string()));
        }
        self.rebuild_optimizer(kind, lr, weight_decay)?;
        self.switched = true;
        info!(optimizer = %kind, lr, "switched optimizer");
        Ok(())
    }

    fn output_fields(&self) -> &'static [Field] {
        match self.model {
            TaskModel::Tagger(_) => TAGGER_FIELDS,
            TaskModel::Parser(_) => PARSER_FIELDS,
        }
    }
}

fn feature_sources(
    config: &RunConfig,
    pretrain: Option<Arc<Pretrain>>,
    cache: &FoundationCache,
) -> Result<FeatureSources> {
    let pretrain = if config.pretrain {
        if pretrain.is_none() {
            warn!("pretrained vectors are enabled but none were loaded");
        }
        pretrain
    } else {
        None
    };

    let charlm = if config.charlm {
        match (&config.charlm_forward_file, &config.charlm_backward_file) {
            (Some(forward), Some(backward)) => Some(CharlmPair::load(cache, forward, backward)?),
            _ => {
                return Err(ArborError::Configuration(
                    "charlm is enabled but the forward or backward charlm file is not set".into(),
                ));
            }
        }
    } else {
        None
    };

    let transformer = match config.bert_model.as_deref() {
        Some(dir) => Some(TransformerFeatures::load_shared(cache, Path::new(dir))?),
        None => None,
    };

    Ok(FeatureSources {
        pretrain,
        charlm,
        transformer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::tests::write_charlm_pair;
    use crate::model::tagger::tests::tiny_model_config;
    use crate::model::testing;
    use arbor_core::VocabPolicy;

    fn vocab() -> Arc<Vocab> {
        Arc::new(Vocab::build(&[testing::corpus()], 1, VocabPolicy::Union).unwrap())
    }

    fn tagger_config() -> RunConfig {
        RunConfig::tagger()
            .with_shorthand("en_test")
            .with_pretrain(false)
            .with_model(tiny_model_config())
    }

    #[test]
    fn second_switch_is_rejected() {
        let cache = FoundationCache::new();
        let mut trainer = Trainer::new(tagger_config(), vocab(), None, &cache).unwrap();
        trainer.switch_optimizer(OptimizerKind::AmsGrad, 1e-3, 0.0).unwrap();
        assert_eq!(trainer.optimizer_kind(), OptimizerKind::AmsGrad);

        let err = trainer.switch_optimizer(OptimizerKind::Sgd, 1e-3, 0.0).unwrap_err();
        assert!(matches!(err, ArborError::OptimizerAlreadySwitched(_)));
    }

    #[test]
    fn update_then_predict() {
        let cache = FoundationCache::new();
        let mut trainer = Trainer::new(tagger_config(), vocab(), None, &cache).unwrap();
        let batch = testing::batch();
        let loss = trainer.update(&batch).unwrap();
        assert!(loss.is_finite());

        let preds = trainer.predict(&batch).unwrap();
        assert_eq!(preds.len(), batch.len());
        assert!(preds.iter().flatten().all(|row| row.len() == 3));
    }

    #[test]
    fn mismatched_vocab_is_rejected() {
        let cache = FoundationCache::new();
        let mut trainer = Trainer::new(tagger_config(), vocab(), None, &cache).unwrap();
        let mut batch = testing::batch();
        batch.vocab_fingerprint ^= 1;
        assert!(matches!(trainer.update(&batch), Err(ArborError::VocabMismatch { .. })));
    }

    #[test]
    fn load_keeps_model_options_and_overrides_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let cache = FoundationCache::new();

        let mut config = tagger_config();
        config.lr = 0.5;
        config.eval_file = Some("train_dev.conllu".into());
        let trainer = Trainer::new(config, vocab(), None, &cache).unwrap();
        trainer.save(&path).unwrap();

        let mut run = RunConfig::tagger()
            .with_shorthand("en_other")
            .with_mode(arbor_core::Mode::Predict)
            .with_eval_file("test.conllu")
            .with_save_dir(dir.path());
        run.model.hidden_dim = 999;
        run.lr = 0.1;

        let loaded = Trainer::load(&path, &run, None, &cache).unwrap();
        assert_eq!(loaded.config().model, tiny_model_config());
        assert_eq!(loaded.config().lr, 0.5);
        assert_eq!(loaded.config().shorthand, "en_other");
        assert_eq!(loaded.config().mode, arbor_core::Mode::Predict);
        assert_eq!(loaded.config().eval_file.as_deref(), Some(Path::new("test.conllu")));
        assert_eq!(loaded.vocab().fingerprint(), vocab().fingerprint());

        let batch = testing::batch();
        assert_eq!(trainer.predict(&batch).unwrap(), loaded.predict(&batch).unwrap());
    }

    #[test]
    fn second_trainer_hits_the_charlm_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, backward) = write_charlm_pair(dir.path());
        let mut config = tagger_config();
        config.charlm = true;
        config.charlm_shorthand = Some("en_test".into());
        config.charlm_forward_file = Some(forward.clone());
        config.charlm_backward_file = Some(backward.clone());

        let cache = FoundationCache::new();
        Trainer::new(config.clone(), vocab(), None, &cache).unwrap();
        assert_eq!(cache.len(), 2);

        // a second construction must not read the files again
        std::fs::remove_file(&forward).unwrap();
        std::fs::remove_file(&backward).unwrap();
        Trainer::new(config, vocab(), None, &cache).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
