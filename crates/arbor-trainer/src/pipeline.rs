//! # Task Entry Points
//!
//! Train and predict for the tagger and the parser: load the corpora, build
//! or restore the vocabulary and the model, then hand over to the
//! [`Controller`] or score a prediction file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arbor_core::config::EVAL_INTERVAL_DEV_SIZE;
use arbor_core::scorer::score_named_dependencies;
use arbor_core::{
    ArborError, Controller, DataLoader, Document, EvalType, FoundationCache, Mode, ParserScorer, Pretrain, RunConfig,
    Schedule, Score, Scorer, TaggerScorer, Task, TrainingSummary, Vocab, adaptive_eval_interval, get_eval_type,
    predict_all, reconcile_columns, write_predictions,
};
use tracing::{error, info};

use crate::checkpoint;
use crate::model::Columns;
use crate::trainer::Trainer;

/// What a [`run`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Trained(TrainingSummary),
    /// `None` when no gold file was available to score against.
    Evaluated(Option<Score>),
    /// Train or dev data was missing.
    Skipped,
}

/// Runs `config` in its mode. Missing data is logged and skipped, not failed.
pub fn run(mut config: RunConfig, cache: &FoundationCache) -> Result<Outcome> {
    config.validate()?;
    config.resolve_charlm_files()?;
    let outcome = match config.mode {
        Mode::Train => train(&config, cache)?.map(Outcome::Trained),
        Mode::Predict => evaluate(&config, cache)?.map(Outcome::Evaluated),
    };
    Ok(outcome.unwrap_or(Outcome::Skipped))
}

pub fn train_tagger(config: &RunConfig, cache: &FoundationCache) -> Result<Option<TrainingSummary>> {
    debug_assert_eq!(config.task, Task::Tagger);
    train(config, cache)
}

pub fn train_parser(config: &RunConfig, cache: &FoundationCache) -> Result<Option<TrainingSummary>> {
    debug_assert_eq!(config.task, Task::Parser);
    train(config, cache)
}

pub fn evaluate_tagger(config: &RunConfig, cache: &FoundationCache) -> Result<Option<Option<Score>>> {
    debug_assert_eq!(config.task, Task::Tagger);
    evaluate(config, cache)
}

pub fn evaluate_parser(config: &RunConfig, cache: &FoundationCache) -> Result<Option<Option<Score>>> {
    debug_assert_eq!(config.task, Task::Parser);
    evaluate(config, cache)
}

fn skip(reason: impl std::fmt::Display) {
    info!("Skip training because no data available... ({reason})");
}

fn load_pretrain(config: &RunConfig, cache: &FoundationCache) -> Result<Option<Arc<Pretrain>>> {
    if !config.pretrain {
        return Ok(None);
    }
    let vec_file = config.vec_file();
    let pretrain = Pretrain::load_shared(
        cache,
        &config.pretrain_file(),
        Some(vec_file.as_path()),
        config.model.pretrain_max_vocab,
    )
    .with_context(|| format!("loading pretrained vectors for {}", config.shorthand))?;
    Ok(Some(pretrain))
}

/// Trains a model. Returns `Ok(None)` when training or dev data is missing.
pub fn train(config: &RunConfig, cache: &FoundationCache) -> Result<Option<TrainingSummary>> {
    let train_files = config.train_files();
    if train_files.is_empty() {
        skip("no train_file");
        return Ok(None);
    }
    if let Some(missing) = train_files.iter().find(|p| !p.exists()) {
        skip(format!("{} does not exist", missing.display()));
        return Ok(None);
    }
    let Some(eval_file) = config.eval_file.as_deref().filter(|p| p.exists()) else {
        skip("dev file does not exist");
        return Ok(None);
    };

    let train_docs = train_files
        .iter()
        .map(|path| Document::from_conllu_file(path).with_context(|| format!("reading {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    let dev_doc = Document::from_conllu_file(eval_file).with_context(|| format!("reading {}", eval_file.display()))?;

    let pretrain = load_pretrain(config, cache)?;
    let policy = config.loader_options(0).policy;
    let vocab = Arc::new(Vocab::build(&train_docs, config.word_cutoff, policy)?);
    info!(
        words = vocab.word.len(),
        upos = vocab.upos.len(),
        xpos = vocab.xpos.len(),
        feats = vocab.feats.len(),
        deprel = vocab.deprel.len(),
        "built vocabulary"
    );

    let mut train_loaders = train_loaders(config, train_docs, pretrain.as_deref(), &vocab)?;
    if train_loaders.iter().all(DataLoader::is_empty) {
        skip("training data is empty");
        return Ok(None);
    }

    let mut dev = DataLoader::new(
        dev_doc,
        config.batch_size,
        &config.loader_options(train_loaders.len() as u64),
        pretrain.as_deref(),
        Some(Arc::clone(&vocab)),
        true,
        true,
    )?;
    if dev.is_empty() {
        skip("dev data is empty");
        return Ok(None);
    }

    let eval_interval = if config.task == Task::Tagger && config.adapt_eval_interval {
        let interval = adaptive_eval_interval(dev.num_examples(), EVAL_INTERVAL_DEV_SIZE, config.eval_interval);
        info!(dev_sentences = dev.num_examples(), interval, "adapted evaluation interval");
        interval
    } else {
        config.eval_interval
    };
    let eval_type = match config.task {
        Task::Tagger => get_eval_type(&dev),
        Task::Parser => EvalType::AllTags,
    };
    info!(%eval_type, "evaluation type");

    let mut trainer = Trainer::new(config.clone(), vocab, pretrain, cache)?;
    trainer.set_columns(Columns {
        upos: train_loaders.iter().any(|l| l.has_upos),
        xpos: train_loaders.iter().any(|l| l.has_xpos),
        feats: train_loaders.iter().any(|l| l.has_feats),
    });

    let schedule = Schedule::from_config(config, eval_interval)?;
    let mut controller = Controller::new(schedule, eval_type);
    let summary = match config.task {
        Task::Tagger => controller.run(&mut trainer, &TaggerScorer, &mut train_loaders, &mut dev),
        Task::Parser => controller.run(&mut trainer, &ParserScorer, &mut train_loaders, &mut dev),
    };
    match summary {
        Ok(summary) => Ok(Some(summary)),
        Err(ArborError::DataUnavailable(reason)) => {
            skip(reason);
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// One training loader per corpus. The tagger marks a column as present in
/// every loader when no corpus has it.
fn train_loaders(
    config: &RunConfig,
    docs: Vec<Document>,
    pretrain: Option<&Pretrain>,
    vocab: &Arc<Vocab>,
) -> arbor_core::Result<Vec<DataLoader>> {
    let mut loaders = docs
        .into_iter()
        .enumerate()
        .map(|(i, doc)| {
            DataLoader::new(
                doc,
                config.batch_size,
                &config.loader_options(i as u64),
                pretrain,
                Some(Arc::clone(vocab)),
                false,
                false,
            )
        })
        .collect::<arbor_core::Result<Vec<_>>>()?;
    if config.task == Task::Tagger {
        reconcile_columns(&mut loaders);
    }
    Ok(loaders)
}

/// Predicts the eval file with a saved model, writes `output_file` and scores
/// it when a gold file is available. Returns `Ok(None)` when the eval file is
/// missing.
pub fn evaluate(config: &RunConfig, cache: &FoundationCache) -> Result<Option<Option<Score>>> {
    let model_file = config.model_file_name();
    if !model_file.exists() {
        return Err(ArborError::ResourceNotFound(model_file).into());
    }
    let Some(eval_file) = config.eval_file.as_deref().filter(|p| p.exists()) else {
        info!("Skip evaluation because no data available...");
        return Ok(None);
    };
    let output_file = config
        .output_file
        .as_deref()
        .context("output_file is required for prediction")?;

    // pretrained vectors are loaded only if the saved model used them
    let saved = checkpoint::load_meta(&model_file)?.config;
    let mut pretrain_config = config.clone();
    pretrain_config.pretrain = saved.pretrain;
    pretrain_config.model.pretrain_max_vocab = saved.model.pretrain_max_vocab;
    let pretrain = load_pretrain(&pretrain_config, cache)?;

    let trainer = Trainer::load(&model_file, config, pretrain.clone(), cache)?;
    let doc = Document::from_conllu_file(eval_file).with_context(|| format!("reading {}", eval_file.display()))?;
    let mut loader = DataLoader::new(
        doc,
        config.batch_size,
        &config.loader_options(0),
        pretrain.as_deref(),
        Some(Arc::clone(trainer.vocab())),
        true,
        true,
    )?;

    info!("Start evaluation...");
    let preds = predict_all(&trainer, &loader)?;
    write_predictions(&mut loader, arbor_core::TaskTrainer::output_fields(&trainer), preds, output_file)?;

    let Some(gold) = config.gold_path() else {
        info!("no gold file, skipping scoring");
        return Ok(Some(None));
    };
    let score = match config.task {
        Task::Tagger => TaggerScorer.score(output_file, gold, get_eval_type(&loader))?,
        Task::Parser => {
            score_named_dependencies(output_file, gold)?;
            ParserScorer.score(output_file, gold, EvalType::AllTags)?
        }
    };
    info!("{} score: {score}", config.shorthand);
    Ok(Some(Some(score)))
}

/// Which steps [`run_treebank`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreebankMode {
    /// Train on the train split, then score the dev split.
    Train,
    ScoreDev,
    ScoreTest,
}

impl FromStr for TreebankMode {
    type Err = ArborError;

    fn from_str(s: &str) -> arbor_core::Result<Self> {
        match s {
            "train" => Ok(TreebankMode::Train),
            "score_dev" => Ok(TreebankMode::ScoreDev),
            "score_test" => Ok(TreebankMode::ScoreTest),
            other => Err(ArborError::Configuration(format!(
                "unknown treebank mode {other:?}, expected train, score_dev or score_test"
            ))),
        }
    }
}

impl fmt::Display for TreebankMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreebankMode::Train => write!(f, "train"),
            TreebankMode::ScoreDev => write!(f, "score_dev"),
            TreebankMode::ScoreTest => write!(f, "score_test"),
        }
    }
}

/// The split files of one treebank, named after its shorthand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreebankFiles {
    pub train: PathBuf,
    pub dev_in: PathBuf,
    pub dev_gold: PathBuf,
    pub dev_pred: PathBuf,
    pub test_in: PathBuf,
    pub test_gold: PathBuf,
    pub test_pred: PathBuf,
}

impl TreebankFiles {
    /// Files under `data_dir`. A given `output_file` replaces both prediction
    /// files.
    pub fn new(data_dir: &Path, shorthand: &str, output_file: Option<&Path>) -> Self {
        let file = |split: &str| data_dir.join(format!("{shorthand}.{split}.conllu"));
        let pred = |split: &str| output_file.map_or_else(|| file(split), Path::to_path_buf);
        Self {
            train: file("train.in"),
            dev_in: file("dev.in"),
            dev_gold: file("dev.gold"),
            dev_pred: pred("dev.pred"),
            test_in: file("test.in"),
            test_gold: file("test.gold"),
            test_pred: pred("test.pred"),
        }
    }
}

/// Parser token budget for a treebank; a few large-sentence treebanks need
/// smaller batches.
pub fn treebank_batch_size(shorthand: &str) -> usize {
    match shorthand {
        "de_hdt" => 1300,
        "hr_set" | "fi_tdt" | "ru_taiga" | "cs_cltt" | "gl_treegal" | "lv_lvtb" | "ro_simonero" => 3000,
        _ => 5000,
    }
}

/// What [`run_treebank`] produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreebankReport {
    pub training: Option<TrainingSummary>,
    /// `None` when the split to score was missing or had no gold file.
    pub score: Option<Score>,
}

/// Trains and/or scores the treebank `shorthand` from the conventional files
/// in `data_dir`. Every other option comes from `template`; the parser batch
/// size follows [`treebank_batch_size`] unless `template` changes it.
///
/// Returns `Ok(None)` when training was requested but the train file is
/// missing.
pub fn run_treebank(
    data_dir: &Path,
    shorthand: &str,
    mode: TreebankMode,
    template: &RunConfig,
    cache: &FoundationCache,
) -> Result<Option<TreebankReport>> {
    let files = TreebankFiles::new(data_dir, shorthand, template.output_file.as_deref());
    let mut base = template.clone();
    base.shorthand = shorthand.to_string();
    if base.lang.is_none() {
        base.lang = shorthand.split('_').next().map(str::to_string);
    }

    let mut report = TreebankReport::default();
    if mode == TreebankMode::Train {
        if !files.train.exists() {
            error!("TRAIN FILE NOT FOUND: {} ... skipping", files.train.display());
            return Ok(None);
        }
        let mut config = base.clone();
        config.mode = Mode::Train;
        config.train_file = Some(files.train.to_string_lossy().into_owned());
        config.eval_file = Some(files.dev_in.clone());
        config.output_file = Some(files.dev_pred.clone());
        config.gold_file = Some(files.dev_gold.clone());
        if config.task == Task::Parser && config.batch_size == RunConfig::parser().batch_size {
            config.batch_size = treebank_batch_size(shorthand);
        }
        info!(task = %config.task, batch_size = config.batch_size, "Running train for {shorthand}");
        match run(config, cache)? {
            Outcome::Trained(summary) => report.training = Some(summary),
            _ => return Ok(None),
        }
    }

    let (split, eval_in, gold, pred) = match mode {
        TreebankMode::Train | TreebankMode::ScoreDev => ("dev", files.dev_in, files.dev_gold, files.dev_pred),
        TreebankMode::ScoreTest => ("test", files.test_in, files.test_gold, files.test_pred),
    };
    let mut config = base;
    config.mode = Mode::Predict;
    config.train_file = None;
    config.eval_file = Some(eval_in);
    config.output_file = Some(pred);
    config.gold_file = Some(gold);
    info!(task = %config.task, "Running {split} for {shorthand}");
    if let Outcome::Evaluated(score) = run(config, cache)? {
        report.score = score;
    }
    match report.score {
        Some(score) => info!("Finished running {split} set on {shorthand}: {score}"),
        None => info!("{split} set of {shorthand} was not scored"),
    }
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tagger::tests::tiny_model_config;

    const TRAIN: &str = "\
1\tThe\tthe\tDET\tDT\tDefinite=Def\t2\tdet\t_\t_
2\tdog\tdog\tNOUN\tNN\tNumber=Sing\t3\tnsubj\t_\t_
3\tbarks\tbark\tVERB\tVBZ\t_\t0\troot\t_\tSpaceAfter=No
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_

1\tCats\tcat\tNOUN\tNNS\tNumber=Plur\t2\tnsubj\t_\t_
2\tsleep\tsleep\tVERB\tVBP\t_\t0\troot\t_\t_

1\tA\ta\tDET\tDT\tDefinite=Ind\t2\tdet\t_\t_
2\tbird\tbird\tNOUN\tNN\tNumber=Sing\t3\tnsubj\t_\t_
3\tsings\tsing\tVERB\tVBZ\t_\t0\troot\t_\t_

";

    struct Workspace {
        _dir: tempfile::TempDir,
        train: PathBuf,
        dev: PathBuf,
        output: PathBuf,
        save_dir: PathBuf,
    }

    fn workspace() -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let train = dir.path().join("train.conllu");
        let dev = dir.path().join("dev.conllu");
        std::fs::write(&train, TRAIN).unwrap();
        std::fs::write(&dev, TRAIN).unwrap();
        Workspace {
            output: dir.path().join("pred.conllu"),
            save_dir: dir.path().join("models"),
            train,
            dev,
            _dir: dir,
        }
    }

    fn config(ws: &Workspace, base: RunConfig) -> RunConfig {
        base.with_shorthand("en_test")
            .with_train_file(ws.train.to_string_lossy())
            .with_eval_file(&ws.dev)
            .with_output_file(&ws.output)
            .with_save_dir(&ws.save_dir)
            .with_pretrain(false)
            .with_batch_size(50)
            .with_eval_interval(2)
            .with_max_steps(4)
            .with_max_steps_before_stop(100)
            .with_model(tiny_model_config())
    }

    #[test]
    fn tagger_trains_then_predicts() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let train_config = config(&ws, RunConfig::tagger());

        let Outcome::Trained(summary) = run(train_config.clone(), &cache).unwrap() else {
            panic!("expected a training run");
        };
        assert_eq!(summary.steps, 4);
        assert_eq!(summary.evaluations, 2);
        assert!(train_config.model_file_name().exists());

        let predict = train_config.with_mode(Mode::Predict);
        let Outcome::Evaluated(Some(score)) = run(predict, &cache).unwrap() else {
            panic!("expected a scored prediction");
        };
        assert!((0.0..=1.0).contains(&score.f1));
        let written = Document::from_conllu_file(&ws.output).unwrap();
        assert_eq!(written.num_tokens(), 9);
    }

    #[test]
    fn parser_without_gold_saves_final_model() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let parser = config(&ws, RunConfig::parser());

        let summary = train_parser(&parser, &cache).unwrap().unwrap();
        assert_eq!(summary.evaluations, 0);
        assert!(summary.best_score.is_none());
        assert!(parser.model_file_name().exists());

        let Outcome::Evaluated(None) = run(parser.with_mode(Mode::Predict), &cache).unwrap() else {
            panic!("prediction without gold must not be scored");
        };
        let written = Document::from_conllu_file(&ws.output).unwrap();
        assert!(written.sentences.iter().flat_map(|s| &s.tokens).all(|t| t.head.is_some()));
    }

    const UPOS_ONLY: &str = "\
1\tBirds\tbird\tNOUN\t_\t_\t2\tnsubj\t_\t_
2\tfly\tfly\tVERB\t_\t_\t0\troot\t_\t_

";

    fn write_file(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn tagger_trains_on_several_files() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let second = write_file(ws._dir.path(), "second.conllu", UPOS_ONLY);
        let mut config = config(&ws, RunConfig::tagger());
        config.train_file = Some(format!("{};{}", ws.train.display(), second.display()));
        assert_eq!(config.train_files().len(), 2);

        let Outcome::Trained(summary) = run(config, &cache).unwrap() else {
            panic!("expected a training run");
        };
        assert_eq!(summary.steps, 4);
    }

    #[test]
    fn strict_vocab_rejects_disjoint_files() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let disjoint = UPOS_ONLY.replace("NOUN\t_", "NOUN\tn").replace("VERB\t_", "VERB\tv");
        let second = write_file(ws._dir.path(), "second.conllu", &disjoint);
        let mut config = config(&ws, RunConfig::tagger());
        config.train_file = Some(format!("{};{}", ws.train.display(), second.display()));
        config.strict_vocab = true;

        let err = run(config.clone(), &cache).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArborError>(),
            Some(ArborError::Configuration(_))
        ));

        // the default policy unions the tag sets instead
        config.strict_vocab = false;
        assert!(matches!(run(config, &cache).unwrap(), Outcome::Trained(_)));
    }

    #[test]
    fn tagger_loaders_share_missing_columns() {
        let ws = workspace();
        let config = config(&ws, RunConfig::tagger());
        let doc = || Document::from_reader(UPOS_ONLY.as_bytes(), Path::new("upos.conllu")).unwrap();
        let vocab = Arc::new(Vocab::build(&[doc(), doc()], 1, arbor_core::VocabPolicy::Union).unwrap());

        let loaders = train_loaders(&config, vec![doc(), doc()], None, &vocab).unwrap();
        assert!(loaders.iter().all(|l| l.has_upos && l.has_xpos && l.has_feats));

        let mut parser = config.clone();
        parser.task = Task::Parser;
        let loaders = train_loaders(&parser, vec![doc(), doc()], None, &vocab).unwrap();
        assert!(loaders.iter().all(|l| !l.has_xpos));
    }

    fn treebank_dir(ws: &Workspace) -> PathBuf {
        let data = ws._dir.path().join("depparse");
        std::fs::create_dir_all(&data).unwrap();
        for split in ["train.in", "dev.in", "dev.gold"] {
            write_file(&data, &format!("en_test.{split}.conllu"), TRAIN);
        }
        data
    }

    #[test]
    fn treebank_training_scores_dev() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let data = treebank_dir(&ws);
        let mut template = config(&ws, RunConfig::parser());
        template.output_file = None;

        let report = run_treebank(&data, "en_test", TreebankMode::Train, &template, &cache)
            .unwrap()
            .unwrap();
        let summary = report.training.unwrap();
        assert_eq!(summary.steps, 4);
        assert_eq!(summary.evaluations, 2);
        let score = report.score.unwrap();
        assert!((0.0..=1.0).contains(&score.f1));
        assert!(data.join("en_test.dev.pred.conllu").exists());

        // no test split on disk: nothing to score, nothing trained
        let report = run_treebank(&data, "en_test", TreebankMode::ScoreTest, &template, &cache)
            .unwrap()
            .unwrap();
        assert_eq!(report, TreebankReport::default());
    }

    #[test]
    fn treebank_without_train_file_is_skipped() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let template = config(&ws, RunConfig::parser());
        let report = run_treebank(ws._dir.path(), "xx_none", TreebankMode::Train, &template, &cache).unwrap();
        assert!(report.is_none());
    }

    #[test]
    fn treebank_files_and_batch_sizes() {
        let files = TreebankFiles::new(Path::new("data/depparse"), "de_hdt", None);
        assert_eq!(files.train, PathBuf::from("data/depparse/de_hdt.train.in.conllu"));
        assert_eq!(files.dev_gold, PathBuf::from("data/depparse/de_hdt.dev.gold.conllu"));
        assert_eq!(files.test_pred, PathBuf::from("data/depparse/de_hdt.test.pred.conllu"));
        let temp = TreebankFiles::new(Path::new("data"), "de_hdt", Some(Path::new("/tmp/out.conllu")));
        assert_eq!(temp.dev_pred, temp.test_pred);

        assert_eq!(treebank_batch_size("de_hdt"), 1300);
        assert_eq!(treebank_batch_size("fi_tdt"), 3000);
        assert_eq!(treebank_batch_size("en_ewt"), 5000);
        assert_eq!("score_dev".parse::<TreebankMode>().unwrap(), TreebankMode::ScoreDev);
        assert!("dev".parse::<TreebankMode>().is_err());
    }

    #[test]
    fn missing_train_file_is_skipped() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let mut missing = config(&ws, RunConfig::tagger());
        missing.train_file = Some("no/such/train.conllu".into());
        assert_eq!(run(missing, &cache).unwrap(), Outcome::Skipped);
    }

    #[test]
    fn predicting_without_a_model_fails() {
        let ws = workspace();
        let cache = FoundationCache::new();
        let predict = config(&ws, RunConfig::tagger()).with_mode(Mode::Predict);
        let err = run(predict, &cache).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArborError>(),
            Some(ArborError::ResourceNotFound(_))
        ));
    }
}
