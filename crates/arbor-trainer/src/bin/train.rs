//! Train or evaluate a POS tagger or dependency parser.
//!
//! ```text
//! arbor-train tagger --train_file train.conllu --eval_file dev.conllu \
//!     --output_file pred.conllu --shorthand en_ewt
//! arbor-train parser --mode predict --eval_file test.conllu \
//!     --output_file pred.conllu --gold_file test.conllu --shorthand en_ewt
//! arbor-train treebank --data_dir data/depparse --shorthand en_ewt --score_dev
//! ```

use std::path::PathBuf;

use anyhow::Result;
use arbor_core::{FoundationCache, Mode, OptimizerKind, RunConfig};
use arbor_trainer::pipeline::{self, Outcome, TreebankMode};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor-train")]
#[command(about = "Train and evaluate arbor taggers and parsers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// UPOS / XPOS / FEATS tagger
    Tagger(RunArgs),
    /// Dependency parser
    Parser(RunArgs),
    /// Train or score one treebank from `{shorthand}.{split}.conllu` files
    Treebank(TreebankArgs),
}

#[derive(Args)]
struct TreebankArgs {
    #[arg(long = "data_dir")]
    data_dir: PathBuf,
    /// Run the tagger instead of the parser
    #[arg(long)]
    tagger: bool,
    /// Score the dev split with a trained model
    #[arg(long = "score_dev", conflicts_with = "score_test")]
    score_dev: bool,
    /// Score the test split with a trained model
    #[arg(long = "score_test")]
    score_test: bool,
    #[command(flatten)]
    run: RunArgs,
}

impl TreebankArgs {
    fn mode(&self) -> TreebankMode {
        if self.score_test {
            TreebankMode::ScoreTest
        } else if self.score_dev {
            TreebankMode::ScoreDev
        } else {
            TreebankMode::Train
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "train")]
    mode: Mode,
    #[arg(long)]
    shorthand: String,
    #[arg(long)]
    lang: Option<String>,

    /// `;`-separated for the tagger
    #[arg(long = "train_file")]
    train_file: Option<String>,
    #[arg(long = "eval_file")]
    eval_file: Option<PathBuf>,
    #[arg(long = "output_file")]
    output_file: Option<PathBuf>,
    #[arg(long = "gold_file")]
    gold_file: Option<PathBuf>,
    /// Do not score the tagger output (prediction only)
    #[arg(long = "no_gold_labels")]
    no_gold_labels: bool,

    #[arg(long = "save_dir")]
    save_dir: Option<PathBuf>,
    #[arg(long = "save_name")]
    save_name: Option<String>,
    #[arg(long = "wordvec_dir")]
    wordvec_dir: Option<PathBuf>,
    #[arg(long = "wordvec_file")]
    wordvec_file: Option<PathBuf>,
    #[arg(long = "wordvec_pretrain_file")]
    wordvec_pretrain_file: Option<PathBuf>,
    #[arg(long = "charlm_save_dir")]
    charlm_save_dir: Option<PathBuf>,
    #[arg(long = "charlm_forward_file")]
    charlm_forward_file: Option<PathBuf>,
    #[arg(long = "charlm_backward_file")]
    charlm_backward_file: Option<PathBuf>,

    #[arg(long = "no_pretrain")]
    no_pretrain: bool,
    #[arg(long = "no_char")]
    no_char: bool,
    #[arg(long)]
    charlm: bool,
    #[arg(long = "charlm_shorthand")]
    charlm_shorthand: Option<String>,
    /// Directory holding a DistilBERT `config.json`, `tokenizer.json` and `model.safetensors`
    #[arg(long = "bert_model")]
    bert_model: Option<String>,

    #[arg(long = "batch_size")]
    batch_size: Option<usize>,
    #[arg(long = "eval_interval")]
    eval_interval: Option<usize>,
    #[arg(long = "fix_eval_interval")]
    fix_eval_interval: bool,
    #[arg(long = "max_steps")]
    max_steps: Option<usize>,
    #[arg(long = "max_steps_before_stop")]
    max_steps_before_stop: Option<usize>,
    #[arg(long = "log_step")]
    log_step: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,
    #[arg(long = "second_lr")]
    second_lr: Option<f64>,
    #[arg(long)]
    optim: Option<OptimizerKind>,
    #[arg(long = "second_optim")]
    second_optim: Option<OptimizerKind>,
    #[arg(long = "no_second_optim")]
    no_second_optim: bool,
    #[arg(long = "second_optim_reload")]
    second_optim_reload: bool,
    #[arg(long)]
    beta2: Option<f64>,
    #[arg(long = "initial_weight_decay")]
    initial_weight_decay: Option<f64>,
    #[arg(long = "second_weight_decay")]
    second_weight_decay: Option<f64>,
    #[arg(long = "max_grad_norm")]
    max_grad_norm: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
    #[arg(long = "augment_nopunct")]
    augment_nopunct: Option<f64>,
    #[arg(long = "sample_train")]
    sample_train: Option<f64>,
    #[arg(long = "word_cutoff")]
    word_cutoff: Option<usize>,
    #[arg(long = "strict_vocab")]
    strict_vocab: bool,

    #[arg(long = "hidden_dim")]
    hidden_dim: Option<usize>,
    #[arg(long = "char_hidden_dim")]
    char_hidden_dim: Option<usize>,
    #[arg(long = "deep_biaff_hidden_dim")]
    deep_biaff_hidden_dim: Option<usize>,
    #[arg(long = "word_emb_dim")]
    word_emb_dim: Option<usize>,
    #[arg(long = "char_emb_dim")]
    char_emb_dim: Option<usize>,
    #[arg(long = "tag_emb_dim")]
    tag_emb_dim: Option<usize>,
    #[arg(long = "transformed_dim")]
    transformed_dim: Option<usize>,
    #[arg(long = "num_layers")]
    num_layers: Option<usize>,
    #[arg(long = "word_dropout")]
    word_dropout: Option<f64>,
    #[arg(long)]
    dropout: Option<f64>,
    #[arg(long = "pretrain_max_vocab")]
    pretrain_max_vocab: Option<usize>,
}

impl RunArgs {
    fn into_config(self, mut config: RunConfig) -> RunConfig {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        config.mode = self.mode;
        config.shorthand = self.shorthand;
        config.lang = self.lang;
        config.train_file = self.train_file;
        config.eval_file = self.eval_file;
        config.output_file = self.output_file;
        config.gold_file = self.gold_file;
        config.gold_labels = !self.no_gold_labels;

        set(&mut config.save_dir, self.save_dir);
        set(&mut config.save_name, self.save_name);
        set(&mut config.wordvec_dir, self.wordvec_dir);
        config.wordvec_file = self.wordvec_file;
        config.wordvec_pretrain_file = self.wordvec_pretrain_file;
        set(&mut config.charlm_save_dir, self.charlm_save_dir);
        config.charlm_forward_file = self.charlm_forward_file;
        config.charlm_backward_file = self.charlm_backward_file;

        config.pretrain = !self.no_pretrain;
        config.char = !self.no_char;
        config.charlm = self.charlm;
        config.charlm_shorthand = self.charlm_shorthand;
        config.bert_model = self.bert_model;

        set(&mut config.batch_size, self.batch_size);
        set(&mut config.eval_interval, self.eval_interval);
        if self.fix_eval_interval {
            config.adapt_eval_interval = false;
        }
        set(&mut config.max_steps, self.max_steps);
        set(&mut config.max_steps_before_stop, self.max_steps_before_stop);
        set(&mut config.log_step, self.log_step);

        set(&mut config.lr, self.lr);
        config.second_lr = self.second_lr.or(config.second_lr);
        set(&mut config.optim, self.optim);
        config.second_optim = if self.no_second_optim {
            None
        } else {
            self.second_optim.or(config.second_optim)
        };
        config.second_optim_reload = self.second_optim_reload;
        set(&mut config.beta2, self.beta2);
        set(&mut config.initial_weight_decay, self.initial_weight_decay);
        set(&mut config.second_weight_decay, self.second_weight_decay);
        set(&mut config.max_grad_norm, self.max_grad_norm);

        set(&mut config.seed, self.seed);
        config.augment_nopunct = self.augment_nopunct.or(config.augment_nopunct);
        set(&mut config.sample_train, self.sample_train);
        set(&mut config.word_cutoff, self.word_cutoff);
        config.strict_vocab = self.strict_vocab;

        let model = &mut config.model;
        set(&mut model.hidden_dim, self.hidden_dim);
        set(&mut model.char_hidden_dim, self.char_hidden_dim);
        set(&mut model.deep_biaff_hidden_dim, self.deep_biaff_hidden_dim);
        set(&mut model.word_emb_dim, self.word_emb_dim);
        set(&mut model.char_emb_dim, self.char_emb_dim);
        set(&mut model.tag_emb_dim, self.tag_emb_dim);
        set(&mut model.transformed_dim, self.transformed_dim);
        set(&mut model.num_layers, self.num_layers);
        set(&mut model.word_dropout, self.word_dropout);
        set(&mut model.dropout, self.dropout);
        set(&mut model.pretrain_max_vocab, self.pretrain_max_vocab);
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cache = FoundationCache::new();
    let config = match Cli::parse().command {
        Commands::Tagger(args) => args.into_config(RunConfig::tagger()),
        Commands::Parser(args) => args.into_config(RunConfig::parser()),
        Commands::Treebank(args) => {
            let mode = args.mode();
            let base = if args.tagger {
                RunConfig::tagger()
            } else {
                RunConfig::parser()
            };
            let data_dir = args.data_dir;
            let template = args.run.into_config(base);
            let shorthand = template.shorthand.clone();
            if let Some(report) = pipeline::run_treebank(&data_dir, &shorthand, mode, &template, &cache)? {
                if let Some(summary) = report.training {
                    info!(steps = summary.steps, best = ?summary.best_score, "training finished");
                }
            }
            return Ok(());
        }
    };
    info!(task = %config.task, mode = %config.mode, shorthand = %config.shorthand, "running");

    match pipeline::run(config, &cache)? {
        Outcome::Trained(summary) => info!(
            steps = summary.steps,
            evaluations = summary.evaluations,
            switched = summary.switched_optimizer,
            stop = ?summary.stop_reason,
            "training finished"
        ),
        Outcome::Evaluated(Some(score)) => info!(f1 = %score, "evaluation finished"),
        Outcome::Evaluated(None) => info!("predictions written"),
        Outcome::Skipped => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(std::iter::once("arbor-train").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn flags_map_onto_the_run_config() {
        let Commands::Tagger(args) = parse(&[
            "tagger",
            "--shorthand",
            "en_ewt",
            "--initial_weight_decay",
            "0.01",
            "--second_weight_decay",
            "0.02",
            "--no_second_optim",
            "--fix_eval_interval",
        ]) else {
            panic!("expected the tagger subcommand");
        };
        let config = args.into_config(RunConfig::tagger());
        assert_eq!(config.shorthand, "en_ewt");
        assert_eq!(config.initial_weight_decay, 0.01);
        assert_eq!(config.second_weight_decay, 0.02);
        assert_eq!(config.second_optim, None);
        assert!(!config.adapt_eval_interval);
        assert_eq!(config.batch_size, RunConfig::tagger().batch_size);
    }

    #[test]
    fn treebank_modes() {
        let mode = |extra: &[&str]| {
            let mut args = vec!["treebank", "--data_dir", "data", "--shorthand", "en_ewt"];
            args.extend_from_slice(extra);
            match parse(&args) {
                Commands::Treebank(args) => args.mode(),
                _ => panic!("expected the treebank subcommand"),
            }
        };
        assert_eq!(mode(&[]), TreebankMode::Train);
        assert_eq!(mode(&["--score_dev"]), TreebankMode::ScoreDev);
        assert_eq!(mode(&["--score_test"]), TreebankMode::ScoreTest);

        let both = ["arbor-train", "treebank", "--data_dir", "d", "--shorthand", "x", "--score_dev", "--score_test"];
        assert!(Cli::try_parse_from(both).is_err());
    }
}
