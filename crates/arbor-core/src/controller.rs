//! # Training Controller
//!
//! The step loop shared by the tagger and the parser. All stop and switch
//! decisions are made by [`TrainingState`], a plain value that can be driven
//! without a model; [`Controller`] wires it to a [`TaskTrainer`], the batch
//! loaders and a [`Scorer`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use oorandom::Rand64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::augment::shuffle;
use crate::batch::{Batch, DataLoader, unsort};
use crate::config::{OptimizerKind, RunConfig, Task};
use crate::conllu::Field;
use crate::error::{ArborError, Result};
use crate::scorer::{EvalType, Scorer};

/// Predicted column values for one sentence: one row per token, one value
/// per field in [`TaskTrainer::output_fields`] order.
pub type SentencePrediction = Vec<Vec<String>>;

/// What the controller needs from a model.
pub trait TaskTrainer {
    /// One optimization step; returns the batch loss.
    fn update(&mut self, batch: &Batch) -> Result<f32>;

    /// Predictions aligned with `batch.sentences`. Must not change parameters.
    fn predict(&self, batch: &Batch) -> Result<Vec<SentencePrediction>>;

    fn save(&self, path: &Path) -> Result<()>;

    /// Restores the parameters of a checkpoint written by [`TaskTrainer::save`].
    fn reload(&mut self, path: &Path) -> Result<()>;

    /// Replaces the primary optimizer. Fails if it was already replaced.
    fn switch_optimizer(&mut self, kind: OptimizerKind, lr: f64, weight_decay: f64) -> Result<()>;

    /// Columns written back by [`TaskTrainer::predict`].
    fn output_fields(&self) -> &'static [Field];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Running,
    Evaluating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `max_steps` reached.
    MaxSteps,
    /// No improvement for `max_steps_before_stop` steps and nothing left to switch to.
    Plateau,
}

/// What to do about a plateau at the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauAction {
    Continue,
    SwitchOptimizer,
    Stop,
}

/// Everything the stop and switch logic looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: usize,
    pub last_best_step: usize,
    pub dev_score_history: Vec<f64>,
    /// Best dev score and the step it was reached at.
    pub best: Option<(f64, usize)>,
    pub switched: bool,
    /// Loss summed since the last evaluation.
    pub train_loss: f64,
    pub phase: Phase,
    pub stop_reason: Option<StopReason>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            global_step: 0,
            last_best_step: 0,
            dev_score_history: Vec::new(),
            best: None,
            switched: false,
            train_loss: 0.0,
            phase: Phase::Running,
            stop_reason: None,
        }
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one processed batch.
    pub fn record_step(&mut self, loss: f32) {
        self.global_step += 1;
        self.train_loss += f64::from(loss);
    }

    /// Appends a dev score. Returns `true` when it is a new best, in which
    /// case the checkpoint must be saved.
    pub fn record_eval(&mut self, score: f64) -> bool {
        let is_best = self
            .dev_score_history
            .iter()
            .copied()
            .reduce(f64::max)
            .is_none_or(|max| score > max);
        if is_best {
            self.last_best_step = self.global_step;
            self.best = Some((score, self.global_step));
        }
        self.dev_score_history.push(score);
        is_best
    }

    /// Average loss per batch since the last call, then resets the sum.
    pub fn take_average_loss(&mut self, interval: usize) -> f64 {
        let average = self.train_loss / interval.max(1) as f64;
        self.train_loss = 0.0;
        average
    }

    pub fn plateau_action(&self, max_steps_before_stop: usize, has_second_optim: bool) -> PlateauAction {
        if self.global_step - self.last_best_step < max_steps_before_stop {
            PlateauAction::Continue
        } else if !self.switched && has_second_optim {
            PlateauAction::SwitchOptimizer
        } else {
            PlateauAction::Stop
        }
    }

    /// Records the optimizer switch; the plateau window restarts.
    pub fn apply_switch(&mut self) {
        self.switched = true;
        self.last_best_step = self.global_step;
    }

    pub fn should_stop(&self, max_steps: usize) -> bool {
        self.global_step >= max_steps
    }

    pub fn stop(&mut self, reason: StopReason) {
        self.phase = Phase::Stopped;
        self.stop_reason = Some(reason);
    }
}

/// Replacement optimizer used once training plateaus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SecondOptimizer {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    /// Reload the best checkpoint before switching.
    pub reload: bool,
}

/// Step schedule and file locations of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub eval_interval: usize,
    pub max_steps: usize,
    pub max_steps_before_stop: usize,
    pub log_step: usize,
    pub lr: f64,
    pub second_optim: Option<SecondOptimizer>,
    pub model_file: PathBuf,
    pub output_file: PathBuf,
    /// Dev predictions are not scored without one.
    pub gold_file: Option<PathBuf>,
    pub seed: u64,
}

impl Schedule {
    /// Schedule for `config`, with `eval_interval` already adapted to the
    /// dev set if requested.
    pub fn from_config(config: &RunConfig, eval_interval: usize) -> Result<Self> {
        let output_file = config
            .output_file
            .clone()
            .ok_or_else(|| ArborError::Configuration("output_file is required".into()))?;
        let second_optim = match config.task {
            Task::Parser => Some(SecondOptimizer {
                kind: OptimizerKind::AmsGrad,
                lr: config.lr,
                weight_decay: 0.0,
                reload: false,
            }),
            Task::Tagger => config.second_optim.map(|kind| SecondOptimizer {
                kind,
                lr: config.second_lr.unwrap_or(config.lr),
                weight_decay: config.second_weight_decay,
                reload: config.second_optim_reload,
            }),
        };
        Ok(Self {
            eval_interval,
            max_steps: config.max_steps,
            max_steps_before_stop: config.max_steps_before_stop,
            log_step: config.log_step,
            lr: config.lr,
            second_optim,
            model_file: config.model_file_name(),
            output_file,
            gold_file: config.gold_path().map(Path::to_path_buf),
            seed: config.seed,
        })
    }
}

/// Outcome of [`Controller::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub steps: usize,
    pub best_score: Option<f64>,
    pub best_step: Option<usize>,
    pub evaluations: usize,
    pub stop_reason: StopReason,
    pub switched_optimizer: bool,
}

/// Drives training until a stop condition fires.
pub struct Controller {
    schedule: Schedule,
    eval_type: EvalType,
    state: TrainingState,
    rng: Rand64,
}

impl Controller {
    pub fn new(schedule: Schedule, eval_type: EvalType) -> Self {
        let rng = Rand64::new((u128::from(schedule.seed) << 64) | 0x9e37_79b9);
        Self {
            schedule,
            eval_type,
            state: TrainingState::new(),
            rng,
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn run<T: TaskTrainer, S: Scorer>(
        &mut self,
        trainer: &mut T,
        scorer: &S,
        train: &mut [DataLoader],
        dev: &mut DataLoader,
    ) -> Result<TrainingSummary> {
        if train.iter().all(DataLoader::is_empty) {
            return Err(ArborError::DataUnavailable("no training batches".into()));
        }
        info!(
            eval_interval = self.schedule.eval_interval,
            max_steps = self.schedule.max_steps,
            "starting training"
        );

        let mut current_lr = self.schedule.lr;
        'training: loop {
            let mut pool: Vec<&Batch> = train.iter().flat_map(DataLoader::batches).collect();
            shuffle(&mut pool, &mut self.rng);

            for batch in pool {
                let start = Instant::now();
                let loss = trainer.update(batch)?;
                self.state.record_step(loss);
                let step = self.state.global_step;

                if step % self.schedule.log_step == 0 {
                    info!(
                        "Finished STEP {step}/{}, loss = {loss:.6} ({:.3} sec/batch), lr: {current_lr:.6}",
                        self.schedule.max_steps,
                        start.elapsed().as_secs_f64()
                    );
                }

                if step % self.schedule.eval_interval == 0 {
                    self.evaluate(trainer, scorer, dev)?;
                }

                let has_second = self.schedule.second_optim.is_some();
                match self
                    .state
                    .plateau_action(self.schedule.max_steps_before_stop, has_second)
                {
                    PlateauAction::Continue => {}
                    PlateauAction::SwitchOptimizer => {
                        if let Some(second) = self.schedule.second_optim {
                            current_lr = self.switch(trainer, second)?;
                        }
                    }
                    PlateauAction::Stop => {
                        info!(
                            "Early termination: have not improved in {} steps",
                            self.schedule.max_steps_before_stop
                        );
                        self.state.stop(StopReason::Plateau);
                        break 'training;
                    }
                }

                if self.state.should_stop(self.schedule.max_steps) {
                    self.state.stop(StopReason::MaxSteps);
                    break 'training;
                }
            }

            for loader in train.iter_mut() {
                loader.reshuffle();
            }
        }

        info!("Training ended with {} steps.", self.state.global_step);
        match self.state.best {
            Some((score, step)) => {
                info!("Best dev F1 = {:.2}, at iteration = {step}", score * 100.0);
            }
            None => {
                info!("Dev set never evaluated. Saving final model.");
                trainer.save(&self.schedule.model_file)?;
            }
        }

        Ok(TrainingSummary {
            steps: self.state.global_step,
            best_score: self.state.best.map(|(score, _)| score),
            best_step: self.state.best.map(|(_, step)| step),
            evaluations: self.state.dev_score_history.len(),
            stop_reason: self.state.stop_reason.unwrap_or(StopReason::MaxSteps),
            switched_optimizer: self.state.switched,
        })
    }

    fn evaluate<T: TaskTrainer, S: Scorer>(
        &mut self,
        trainer: &mut T,
        scorer: &S,
        dev: &mut DataLoader,
    ) -> Result<()> {
        self.state.phase = Phase::Evaluating;
        info!("Evaluating on dev set...");
        let preds = predict_all(trainer, dev)?;
        write_predictions(dev, trainer.output_fields(), preds, &self.schedule.output_file)?;
        let train_loss = self.state.take_average_loss(self.schedule.eval_interval);

        match &self.schedule.gold_file {
            Some(gold) => {
                let score = scorer.score(&self.schedule.output_file, gold, self.eval_type)?;
                info!(
                    "step {}: train_loss = {train_loss:.6}, dev_score = {:.4}",
                    self.state.global_step, score.f1
                );
                if self.state.record_eval(score.f1) {
                    trainer.save(&self.schedule.model_file)?;
                    info!("new best model saved.");
                }
            }
            None => {
                debug!(train_loss, "no gold file, dev predictions are not scored");
            }
        }
        self.state.phase = Phase::Running;
        Ok(())
    }

    fn switch<T: TaskTrainer>(&mut self, trainer: &mut T, second: SecondOptimizer) -> Result<f64> {
        info!("Switching to second optimizer: {}", second.kind);
        if second.reload {
            if self.schedule.model_file.exists() {
                info!("Reloading best model to continue from current local optimum");
                trainer.reload(&self.schedule.model_file)?;
            } else {
                warn!(
                    path = %self.schedule.model_file.display(),
                    "no checkpoint to reload yet, continuing from the current model"
                );
            }
        }
        trainer.switch_optimizer(second.kind, second.lr, second.weight_decay)?;
        self.state.apply_switch();
        Ok(second.lr)
    }
}

/// Predicts every batch of `loader` and returns the sentences in corpus order.
pub fn predict_all<T: TaskTrainer>(trainer: &T, loader: &DataLoader) -> Result<Vec<SentencePrediction>> {
    let mut preds = Vec::with_capacity(loader.num_examples());
    for batch in loader.batches() {
        let batch_preds = trainer.predict(batch)?;
        if batch_preds.len() != batch.len() {
            return Err(ArborError::Model(format!(
                "{} predictions for a batch of {} sentences",
                batch_preds.len(),
                batch.len()
            )));
        }
        preds.extend(batch_preds);
    }
    Ok(unsort(preds, &loader.orig_idx()))
}

/// Writes predictions into the loader's document and saves it as CoNLL-U.
pub fn write_predictions(
    loader: &mut DataLoader,
    fields: &[Field],
    preds: Vec<SentencePrediction>,
    output_file: &Path,
) -> Result<()> {
    let rows: Vec<Vec<String>> = preds.into_iter().flatten().collect();
    loader.doc_mut().set(fields, &rows)?;
    loader.doc().write_conllu(output_file)
}
