//! The epoch loop: sampling, optimisation, evaluation and checkpointing.
use std::fmt;
use std::time::{Duration, Instant};

use failure;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::checkpoint::{CheckpointError, Checkpointer, TrainingState};
use crate::config::Config;
use crate::data::{TestCase, TrainingData};
use crate::datasets::Dataset;
use crate::evaluation::{evaluate, EvaluationResult};
use crate::models::naism::ImplicitNAISModel;
use crate::FittingError;

/// Timings and metrics of one epoch.
#[derive(Clone, Debug)]
pub struct EpochReport {
    /// Zero-based index of the epoch.
    pub epoch: usize,
    /// Time spent sampling negatives and shuffling.
    pub shuffle_time: Duration,
    /// Time spent on optimizer steps.
    pub train_time: Duration,
    /// Hit rate on the held-out items.
    pub hit_ratio: f32,
    /// NDCG on the held-out items.
    pub ndcg: f32,
    /// Objective on the held-out candidates.
    pub test_loss: f32,
    /// Time spent evaluating.
    pub eval_time: Duration,
    /// Mean objective over the epoch's minibatches after training.
    pub train_loss: f32,
    /// Time spent computing the training loss.
    pub loss_time: Duration,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Epoch {} [{:.1}s + {:.1}s]: HR = {:.4}, NDCG = {:.4}, loss = {:.4} [{:.1}s] train_loss = {:.4} [{:.1}s]",
            self.epoch,
            self.shuffle_time.as_secs_f64(),
            self.train_time.as_secs_f64(),
            self.hit_ratio,
            self.ndcg,
            self.test_loss,
            self.eval_time.as_secs_f64(),
            self.train_loss,
            self.loss_time.as_secs_f64()
        )
    }
}

/// Trains a NAISM1 model on a dataset for a configured number of epochs.
#[derive(Debug)]
pub struct Trainer {
    config: Config,
    data: TrainingData,
    test: Vec<TestCase>,
    model: ImplicitNAISModel,
    rng: XorShiftRng,
    epoch: usize,
    checkpointer: Option<Checkpointer>,
}

impl Trainer {
    /// Set up training on `dataset`.
    ///
    /// If `checkpointer` holds a checkpoint, the model parameters, sampling
    /// RNG and epoch count are restored from the latest one and training
    /// resumes after the last completed epoch. The restored model takes its
    /// regularization, `alpha` and learning rate from `config`.
    pub fn new(
        config: &Config,
        dataset: &Dataset,
        checkpointer: Option<Checkpointer>,
    ) -> Result<Self, failure::Error> {
        let train = dataset.train.to_compressed();

        if train.is_empty() {
            return Err(FittingError::NoInteractions.into());
        }

        let restored = match checkpointer {
            Some(ref checkpointer) => checkpointer.restore_latest()?,
            None => None,
        };

        let (model, rng, epoch) = match restored {
            Some(state) => {
                let mut model = ImplicitNAISModel::from_state(state.model)?;

                if model.num_items() != dataset.num_items()
                    || model.embedding_dim() != config.embedding_dim
                {
                    return Err(CheckpointError::ShapeMismatch {
                        reason: format!(
                            "checkpoint has {} items of dimension {}, run has {} of dimension {}",
                            model.num_items(),
                            model.embedding_dim(),
                            dataset.num_items(),
                            config.embedding_dim
                        ),
                    }
                    .into());
                }

                if model.l2_penalties() != config.regs
                    || model.alpha() != config.alpha
                    || model.learning_rate() != config.learning_rate
                {
                    info!(
                        regs = ?config.regs,
                        alpha = config.alpha,
                        learning_rate = config.learning_rate,
                        "overriding checkpointed hyperparameters"
                    );
                }

                model.reconfigure(config.alpha, config.regs, config.learning_rate);

                info!(epoch = state.epoch, step = model.global_step(), "restored");

                (model, state.rng, state.epoch)
            }
            None => {
                let model = config.hyperparameters(dataset.num_items()).build();
                let rng = match config.seed {
                    Some(seed) => XorShiftRng::seed_from_u64(seed),
                    None => XorShiftRng::from_seed(rand::thread_rng().gen()),
                };

                if let Some(ref checkpointer) = checkpointer {
                    info!(
                        directory = %checkpointer.directory().display(),
                        "no checkpoint found"
                    );
                }

                info!(
                    items = model.num_items(),
                    embedding_dim = model.embedding_dim(),
                    "initialized"
                );

                (model, rng, 0)
            }
        };

        Ok(Trainer {
            config: config.clone(),
            data: TrainingData::new(train, config.num_negatives),
            test: dataset.test.clone(),
            model,
            rng,
            epoch,
            checkpointer,
        })
    }

    /// The model being trained.
    pub fn model(&self) -> &ImplicitNAISModel {
        &self.model
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Evaluate the current model on the held-out test cases.
    pub fn evaluate(&self) -> Result<EvaluationResult, failure::Error> {
        Ok(evaluate(
            &self.model,
            self.data.interactions(),
            &self.test,
            self.config.top_k,
        )?)
    }

    /// Mean objective over the current epoch's minibatches.
    pub fn train_loss(&self) -> f32 {
        let batch_size = self.config.batch_size;
        let num_batches = self.data.num_minibatches(batch_size);

        if num_batches == 0 {
            return self.model.regularization();
        }

        let total: f32 = self
            .data
            .iter_minibatch(batch_size)
            .map(|batch| self.model.loss(&batch))
            .sum();

        total / num_batches as f32
    }

    /// Run a single epoch and checkpoint the result.
    pub fn run_epoch(&mut self) -> Result<EpochReport, failure::Error> {
        let start = Instant::now();
        self.data.shuffle(&mut self.rng);
        let shuffle_time = start.elapsed();

        let start = Instant::now();
        for batch in self.data.iter_minibatch(self.config.batch_size) {
            self.model.fit_minibatch(&batch)?;
        }
        let train_time = start.elapsed();

        let start = Instant::now();
        let train_loss = self.train_loss();
        let loss_time = start.elapsed();

        let start = Instant::now();
        let result = self.evaluate()?;
        let eval_time = start.elapsed();

        let report = EpochReport {
            epoch: self.epoch,
            shuffle_time,
            train_time,
            hit_ratio: result.hit_ratio,
            ndcg: result.ndcg,
            test_loss: result.loss,
            eval_time,
            train_loss,
            loss_time,
        };

        info!("{}", report);

        self.epoch += 1;

        if let Some(ref checkpointer) = self.checkpointer {
            checkpointer.save(&TrainingState {
                epoch: self.epoch,
                rng: self.rng.clone(),
                model: self.model.state(),
            })?;
        }

        Ok(report)
    }

    /// Train until the configured number of epochs has been completed,
    /// returning the report of the last epoch run, if any.
    pub fn fit(&mut self) -> Result<Option<EpochReport>, failure::Error> {
        if self.epoch >= self.config.epochs {
            info!(
                epoch = self.epoch,
                epochs = self.config.epochs,
                "all epochs already completed"
            );
        }

        let mut last = None;

        while self.epoch < self.config.epochs {
            last = Some(self.run_epoch()?);
        }

        Ok(last)
    }
}
