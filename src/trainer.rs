use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{self, CheckpointDescriptor, SaveRequest, TrainingProgress},
    data::{Batch, BlockingDataLoader, DataLoader, Microbatches},
    diffusion::{DiffusionModel, DiffusionObjective},
    ema::EmaTracker,
    logging::{Logger, LoggingSettings},
    metrics::TrainingMetrics,
    optimizer::{contains_non_finite, AdamW, AdamWConfig, LossScaleConfig, LossScaler},
    sampler::{create_schedule_sampler, NamedSampler, ScheduleSampler},
    schedule::LrSchedule,
    TrainingConfig, TrainingError,
};

/// Drives the whole training run: batches in, one optimizer step (or skip)
/// per iteration, periodic logging and checkpointing, and a final
/// checkpoint on shutdown or budget exhaustion.
pub struct Trainer<M, D, L>
where
    M: DiffusionModel,
    D: DiffusionObjective<M>,
    L: DataLoader,
{
    config: TrainingConfig,
    model: M,
    objective: D,
    loader: BlockingDataLoader<L>,
    parameters: Vec<(String, Var)>,
    optimizer: AdamW,
    sampler: NamedSampler,
    ema: EmaTracker,
    scaler: LossScaler,
    schedule: LrSchedule,
    metrics: TrainingMetrics,
    logger: Logger,
    rng: StdRng,
    device: Device,
    global_step: usize,
    resume_step: usize,
    last_step_loss: f64,
    shutdown: Arc<AtomicBool>,
}

impl<M, D, L> Trainer<M, D, L>
where
    M: DiffusionModel,
    D: DiffusionObjective<M>,
    L: DataLoader,
{
    pub fn new(
        config: TrainingConfig,
        model: M,
        objective: D,
        loader: L,
        device: Device,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let parameters = model.named_parameters();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model exposes no trainable parameters",
            ));
        }

        let optimizer = AdamW::new(
            parameters.clone(),
            AdamWConfig {
                learning_rate: config.lr,
                weight_decay: config.weight_decay,
                ..AdamWConfig::default()
            },
        )?;

        let sampler = create_schedule_sampler(config.schedule_sampler, objective.num_timesteps())?;
        let ema = EmaTracker::new(&config.parsed_ema_rates()?, &parameters)?;

        let scaler = if config.use_fp16 {
            LossScaler::reduced_precision(LossScaleConfig {
                growth_increment: config.fp16_scale_growth,
                ..LossScaleConfig::default()
            })
        } else {
            LossScaler::full_precision()
        };

        let schedule = LrSchedule::new(config.lr, config.lr_anneal_steps);
        let metrics = TrainingMetrics::new(objective.num_timesteps());
        let logger = Logger::new(LoggingSettings::from_config(
            true,
            Some(config.log_dir.clone()),
            config.log_interval,
        ))?;

        let rng = StdRng::seed_from_u64(config.seed);

        let mut trainer = Self {
            config,
            model,
            objective,
            loader: BlockingDataLoader::new(loader),
            parameters,
            optimizer,
            sampler,
            ema,
            scaler,
            schedule,
            metrics,
            logger,
            rng,
            device,
            global_step: 0,
            resume_step: 0,
            last_step_loss: 0.0,
            shutdown,
        };
        trainer.maybe_resume()?;
        Ok(trainer)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn resume_step(&self) -> usize {
        self.resume_step
    }

    /// Runs until the annealing budget is exhausted or shutdown is
    /// requested, then writes a final checkpoint.
    pub fn run(&mut self) -> Result<(), TrainingError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.logger
                    .log_message("shutdown requested; writing final checkpoint");
                break;
            }
            if self.schedule.is_exhausted(self.global_step) {
                self.logger
                    .log_message("annealing budget exhausted; writing final checkpoint");
                break;
            }

            let batch = self.loader.next_batch()?.ok_or_else(|| {
                TrainingError::runtime("data source exhausted before the run finished")
            })?;

            self.step(&batch)?;

            if self.global_step % self.config.log_interval == 0 {
                self.log_interval_snapshot();
            }
            if self.config.save_interval > 0 && self.global_step % self.config.save_interval == 0 {
                self.save_checkpoint()?;
            }
        }

        self.save_checkpoint()?;
        self.logger.flush();
        Ok(())
    }

    /// One full batch: microbatch accumulation, overflow detection, and
    /// either an applied optimizer step or a skip. The global step
    /// advances either way so schedules and intervals stay step-keyed.
    fn step(&mut self, batch: &Batch) -> Result<(), TrainingError> {
        let lr = self.schedule.lr_at(self.global_step);
        self.optimizer.set_learning_rate(lr);

        let mut merged: Option<GradStore> = None;
        let mut step_loss = 0.0f64;

        for item in Microbatches::new(batch, self.config.microbatch_limit()) {
            let (micro, weight) = item?;
            let (timesteps, importance) = self.sampler.sample(micro.len(), &mut self.rng);

            let losses = self.objective.losses(&self.model, &micro, &timesteps)?;
            let loss_values = losses
                .to_vec1::<f32>()
                .map_err(candle_to_training_error)?;
            self.sampler.update_with_losses(&timesteps, &loss_values);
            self.metrics.record_microbatch(&timesteps, &loss_values);

            let importance_tensor =
                Tensor::from_vec(importance, timesteps.len(), &self.device)
                    .map_err(candle_to_training_error)?;
            let weighted = losses
                .mul(&importance_tensor)
                .and_then(|scaled| scaled.mean_all())
                .map_err(candle_to_training_error)?;
            let micro_loss = weighted
                .affine(weight, 0.0)
                .map_err(candle_to_training_error)?;
            step_loss += micro_loss
                .to_scalar::<f32>()
                .map_err(candle_to_training_error)? as f64;

            let scaled = self.scaler.scale_loss(&micro_loss)?;
            let grads = scaled.backward().map_err(candle_to_training_error)?;
            merged = Some(match merged.take() {
                Some(mut accumulated) => {
                    merge_gradients(&self.parameters, &mut accumulated, grads)?;
                    accumulated
                }
                None => grads,
            });
        }

        let mut grads = merged.ok_or_else(|| {
            TrainingError::runtime("batch produced no microbatches to accumulate")
        })?;

        let mut found_inf = !step_loss.is_finite();
        for (_, var) in &self.parameters {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let grad = self.scaler.unscale(&grad)?;
                if !found_inf && contains_non_finite(&grad)? {
                    found_inf = true;
                }
                grads.insert(var.as_tensor(), grad);
            }
        }

        self.scaler.update(found_inf);

        if found_inf {
            self.optimizer.zero_grad(&mut grads);
            self.metrics.record_skipped_step();
            self.global_step += 1;
            self.logger.log_message(&format!(
                "step {} skipped: non-finite gradients, loss scale now {:.1}",
                self.global_step,
                self.scaler.current_scale()
            ));
            return Ok(());
        }

        self.optimizer.step(&mut grads)?;
        self.ema.update(&self.parameters)?;
        self.global_step += 1;
        self.last_step_loss = step_loss;
        Ok(())
    }

    fn log_interval_snapshot(&mut self) {
        let snapshot = self.metrics.snapshot(
            self.global_step,
            self.last_step_loss,
            self.schedule.lr_at(self.global_step),
            self.scaler.current_scale(),
        );
        self.logger.log_training_step(&snapshot);
    }

    pub fn save_checkpoint(&mut self) -> Result<CheckpointDescriptor, TrainingError> {
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: &self.config.checkpoint_dir,
            config: &self.config,
            parameters: &self.parameters,
            optimizer: &self.optimizer,
            ema: &self.ema,
            progress: TrainingProgress {
                global_step: self.global_step,
                resume_step: self.resume_step,
            },
            max_keep: None,
        })?;
        self.logger.log_message(&format!(
            "saved checkpoint at step {} to {}",
            self.global_step,
            descriptor.directory.display()
        ));
        Ok(descriptor)
    }

    /// Restores state from `resume_checkpoint` when one is configured. An
    /// absent path always means a fresh run, even if the checkpoint
    /// directory already holds checkpoints from an earlier invocation.
    fn maybe_resume(&mut self) -> Result<(), TrainingError> {
        let Some(directory) = self.config.resume_checkpoint.clone() else {
            return Ok(());
        };

        let outcome = checkpoint::load_checkpoint(&directory)?;
        checkpoint::apply_weights(&self.parameters, &outcome.model_weights_path, &self.device)?;
        self.optimizer.load_state(outcome.optimizer_state)?;

        for (index, rate) in self.ema.rates().into_iter().enumerate() {
            let stored = outcome
                .ema_weights
                .iter()
                .find(|(saved_rate, _)| (saved_rate - rate).abs() < 1e-12);
            match stored {
                Some((_, path)) => {
                    let tensors = checkpoint::load_shadow_tensors(path, &self.device)?;
                    self.ema.restore_shadow(index, tensors)?;
                }
                None => {
                    self.logger.warn(&format!(
                        "checkpoint has no EMA weights for rate {rate}; re-initializing from the restored model"
                    ));
                    self.ema.reinit_shadow(index, &self.parameters)?;
                }
            }
        }

        self.global_step = outcome.manifest.progress.global_step;
        self.resume_step = self.global_step;
        self.logger.log_message(&format!(
            "resumed from {} at step {}",
            directory.display(),
            self.global_step
        ));
        Ok(())
    }
}

fn merge_gradients(
    parameters: &[(String, Var)],
    accumulated: &mut GradStore,
    mut fresh: GradStore,
) -> Result<(), TrainingError> {
    for (_, var) in parameters {
        if let Some(grad) = fresh.remove(var.as_tensor()) {
            let combined = match accumulated.remove(var.as_tensor()) {
                Some(existing) => existing.add(&grad).map_err(candle_to_training_error)?,
                None => grad,
            };
            accumulated.insert(var.as_tensor(), combined);
        }
    }
    Ok(())
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
