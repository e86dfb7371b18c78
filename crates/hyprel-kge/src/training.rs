//! Epoch loop with periodic validation and early stopping.

use std::time::{Duration, Instant};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{info, warn};

use crate::error::Result;
use crate::evaluation::RankMetrics;
use crate::model::LinkPredictor;
use crate::sampler::BatchSource;

/// Global gradient norm bound applied when clipping is enabled.
pub const MAX_GRAD_NORM: f64 = 1.0;

/// Loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Validate on epoch 1 and every `eval_every` epochs.
    pub eval_every: usize,
    /// Feed qualifier columns to the model; otherwise batches are cut to `(s, r)`.
    pub qualifier_aware: bool,
    pub grad_clipping: bool,
    /// Stop when the best of the last `k` validation MRRs is the oldest.
    pub early_stopping: Option<usize>,
    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 400,
            eval_every: 5,
            qualifier_aware: true,
            grad_clipping: true,
            early_stopping: None,
            show_progress: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_eval_every(mut self, eval_every: usize) -> Self {
        self.eval_every = eval_every.max(1);
        self
    }

    pub fn with_qualifier_aware(mut self, qualifier_aware: bool) -> Self {
        self.qualifier_aware = qualifier_aware;
        self
    }

    pub fn with_grad_clipping(mut self, grad_clipping: bool) -> Self {
        self.grad_clipping = grad_clipping;
        self
    }

    pub fn with_early_stopping(mut self, window: Option<usize>) -> Self {
        self.early_stopping = window;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

/// Per-epoch learning-rate update.
pub trait LrScheduler {
    /// Learning rate for the next epoch.
    fn next_lr(&mut self, current: f64) -> f64;
}

/// Multiply the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }
}

impl LrScheduler for StepLr {
    fn next_lr(&mut self, current: f64) -> f64 {
        self.epoch += 1;
        if self.epoch % self.step_size == 0 {
            current * self.gamma
        } else {
            current
        }
    }
}

/// Multiply the rate by `gamma` every epoch.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialLr {
    pub gamma: f64,
}

impl LrScheduler for ExponentialLr {
    fn next_lr(&mut self, current: f64) -> f64 {
        current * self.gamma
    }
}

/// Recorded losses and validation metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    /// Mean batch loss per epoch.
    pub train_loss: Vec<f64>,
    /// Validation hits@1, reported as accuracy.
    pub valid_hits_at_1: Vec<f64>,
    pub valid_mrr: Vec<f64>,
    pub valid_mr: Vec<f64>,
    pub valid_hits_at_3: Vec<f64>,
    pub valid_hits_at_5: Vec<f64>,
    pub valid_hits_at_10: Vec<f64>,
    /// Wall time of each epoch, validation included.
    pub epoch_time: Vec<Duration>,
    pub epochs_run: usize,
    pub stopped_early: bool,
}

impl TrainingHistory {
    fn record(&mut self, metrics: &RankMetrics) {
        self.valid_hits_at_1.push(metrics.hits_at_1);
        self.valid_mrr.push(metrics.mrr);
        self.valid_mr.push(metrics.mr);
        self.valid_hits_at_3.push(metrics.hits_at_3);
        self.valid_hits_at_5.push(metrics.hits_at_5);
        self.valid_hits_at_10.push(metrics.hits_at_10);
    }
}

/// True when the last `window` values have their maximum at the first position.
///
/// Fewer than `window` values never trigger.
pub fn no_improvement(values: &[f64], window: usize) -> bool {
    if window == 0 || values.len() < window {
        return false;
    }
    let tail = &values[values.len() - window..];
    let mut best = 0;
    for (i, &v) in tail.iter().enumerate() {
        if v > tail[best] {
            best = i;
        }
    }
    best == 0
}

/// Scale `grads` so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = g.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Drives training epochs over a [`LinkPredictor`].
pub struct TrainingLoop {
    config: TrainingConfig,
    scheduler: Option<Box<dyn LrScheduler>>,
}

impl TrainingLoop {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: impl LrScheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train for the configured number of epochs.
    ///
    /// # Arguments
    /// - `model`: scored batch by batch
    /// - `optimizer`: stepped once per batch
    /// - `vars`: trainable variables, used for gradient clipping
    /// - `source`: yields each epoch's batches
    /// - `validate`: ranks the validation set, called on evaluation epochs
    pub fn run<M, O, S, V>(
        &mut self,
        model: &M,
        optimizer: &mut O,
        vars: &[Var],
        source: &mut S,
        mut validate: V,
    ) -> Result<TrainingHistory>
    where
        M: LinkPredictor,
        O: Optimizer,
        S: BatchSource,
        V: FnMut() -> Result<RankMetrics>,
    {
        let mut history = TrainingHistory::default();
        let start = Instant::now();

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            let batches = source.batches();
            let pb = ProgressBar::new(batches.len() as u64);
            if self.config.show_progress {
                pb.set_style(
                    ProgressStyle::with_template("{prefix} [{bar:30}] {pos}/{len} loss {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                );
                pb.set_prefix(format!("epoch {epoch}"));
            } else {
                pb.set_draw_target(ProgressDrawTarget::hidden());
            }

            let mut total = 0f64;
            for batch in &batches {
                let loss = if self.config.qualifier_aware {
                    model.batch_loss(batch, true)?
                } else {
                    model.batch_loss(&batch.without_qualifiers(), true)?
                };
                let value = scalar(&loss)?;
                total += value;

                let mut grads = loss.backward()?;
                if self.config.grad_clipping {
                    clip_grad_norm(&mut grads, vars, MAX_GRAD_NORM)?;
                }
                optimizer.step(&grads)?;

                pb.set_message(format!("{value:.4}"));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let mean = if batches.is_empty() {
                0.0
            } else {
                total / batches.len() as f64
            };
            history.train_loss.push(mean);
            history.epochs_run = epoch;

            if epoch == 1 || epoch % self.config.eval_every == 0 {
                let metrics = validate()?;
                history.record(&metrics);
                let elapsed = epoch_start.elapsed();
                history.epoch_time.push(elapsed);
                info!(
                    "Epoch {epoch:4} | loss {mean:.5} | {} | {elapsed:.1?} (total {:.1?})",
                    metrics.summary(),
                    start.elapsed()
                );

                if let Some(window) = self.config.early_stopping {
                    if no_improvement(&history.valid_mrr, window) {
                        warn!(
                            epoch,
                            window,
                            best_mrr = history.valid_mrr[history.valid_mrr.len() - window],
                            "validation MRR has not improved, stopping early"
                        );
                        history.stopped_early = true;
                        break;
                    }
                }
            } else {
                let elapsed = epoch_start.elapsed();
                history.epoch_time.push(elapsed);
                info!(
                    "Epoch {epoch:4} | loss {mean:.5} | {elapsed:.1?} (total {:.1?})",
                    start.elapsed()
                );
            }

            if let Some(scheduler) = self.scheduler.as_mut() {
                let lr = scheduler.next_lr(optimizer.learning_rate());
                optimizer.set_learning_rate(lr);
            }
        }

        Ok(history)
    }
}
