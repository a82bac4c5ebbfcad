use candle_core::{DType, Device, Tensor, Var};

use crate::{data::Batch, TrainingError};

/// The model surface the trainer depends on. The concrete architecture is a
/// collaborator; the engine only needs a forward pass and named parameters
/// for optimization, EMA tracking, and checkpointing.
pub trait DiffusionModel {
    /// Predicts the noise component of `x_t` at the given timesteps.
    /// `timesteps` is a `[B]` U32 tensor; `labels` is present only for
    /// class-conditional training.
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Tensor, TrainingError>;

    /// Stable-named trainable parameters. Names key optimizer state, EMA
    /// shadows, and checkpoint payloads.
    fn named_parameters(&self) -> Vec<(String, Var)>;
}

/// Stochastic per-timestep training objective. The trainer treats this as a
/// black box that turns (model, clean batch, timesteps) into per-example
/// losses.
pub trait DiffusionObjective<M: DiffusionModel> {
    fn num_timesteps(&self) -> usize;

    /// Per-example scalar losses, shape `[B]`, F32.
    fn losses(&self, model: &M, batch: &Batch, timesteps: &[usize])
        -> Result<Tensor, TrainingError>;
}

/// Gaussian forward process with a linear beta schedule and a
/// noise-prediction (epsilon) MSE objective.
pub struct GaussianDiffusion {
    num_timesteps: usize,
    sqrt_alphas_cumprod: Vec<f32>,
    sqrt_one_minus_alphas_cumprod: Vec<f32>,
    device: Device,
}

const BETA_START: f64 = 1e-4;
const BETA_END: f64 = 2e-2;

impl GaussianDiffusion {
    pub fn new(num_timesteps: usize, device: Device) -> Result<Self, TrainingError> {
        if num_timesteps == 0 {
            return Err(TrainingError::initialization(
                "diffusion requires at least one timestep",
            ));
        }

        let mut sqrt_alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut sqrt_one_minus_alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut alphas_cumprod = 1.0f64;
        for step in 0..num_timesteps {
            let frac = if num_timesteps == 1 {
                0.0
            } else {
                step as f64 / (num_timesteps - 1) as f64
            };
            let beta = BETA_START + (BETA_END - BETA_START) * frac;
            alphas_cumprod *= 1.0 - beta;
            sqrt_alphas_cumprod.push(alphas_cumprod.sqrt() as f32);
            sqrt_one_minus_alphas_cumprod.push((1.0 - alphas_cumprod).sqrt() as f32);
        }

        Ok(Self {
            num_timesteps,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            device,
        })
    }

    /// Draws `x_t ~ q(x_t | x_0)` for the per-example timesteps.
    fn q_sample(
        &self,
        x0: &Tensor,
        timesteps: &[usize],
        noise: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let signal = self.per_example_coeff(timesteps, &self.sqrt_alphas_cumprod, x0)?;
        let sigma = self.per_example_coeff(timesteps, &self.sqrt_one_minus_alphas_cumprod, x0)?;
        x0.broadcast_mul(&signal)
            .and_then(|scaled| noise.broadcast_mul(&sigma).and_then(|n| scaled.add(&n)))
            .map_err(to_runtime_error)
    }

    /// Gathers `table[t]` per example, shaped `[B, 1, 1, ...]` for
    /// broadcasting against `like`.
    fn per_example_coeff(
        &self,
        timesteps: &[usize],
        table: &[f32],
        like: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let values: Vec<f32> = timesteps.iter().map(|&t| table[t]).collect();
        let mut shape = vec![values.len()];
        shape.extend(std::iter::repeat(1).take(like.dims().len().saturating_sub(1)));
        Tensor::from_vec(values, shape, &self.device)
            .and_then(|coeff| coeff.to_dtype(like.dtype()))
            .map_err(to_runtime_error)
    }
}

impl<M: DiffusionModel> DiffusionObjective<M> for GaussianDiffusion {
    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    fn losses(
        &self,
        model: &M,
        batch: &Batch,
        timesteps: &[usize],
    ) -> Result<Tensor, TrainingError> {
        if timesteps.len() != batch.len() {
            return Err(TrainingError::runtime(format!(
                "timestep count {} does not match batch size {}",
                timesteps.len(),
                batch.len()
            )));
        }
        if let Some(&bad) = timesteps.iter().find(|&&t| t >= self.num_timesteps) {
            return Err(TrainingError::runtime(format!(
                "timestep {bad} outside schedule of {} steps",
                self.num_timesteps
            )));
        }

        let x0 = &batch.images;
        let noise = x0.randn_like(0.0, 1.0).map_err(to_runtime_error)?;
        let x_t = self.q_sample(x0, timesteps, &noise)?;

        let t_values: Vec<u32> = timesteps.iter().map(|&t| t as u32).collect();
        let t_tensor =
            Tensor::from_vec(t_values, timesteps.len(), &self.device).map_err(to_runtime_error)?;

        let predicted = model.forward(&x_t, &t_tensor, batch.labels.as_ref())?;

        // Mean squared error over everything but the batch dimension.
        predicted
            .sub(&noise)
            .and_then(|diff| diff.sqr())
            .and_then(|sq| sq.to_dtype(DType::F32))
            .and_then(|sq| sq.flatten_from(1))
            .and_then(|flat| flat.mean(1))
            .map_err(to_runtime_error)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
