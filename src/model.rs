use candle_core::{DType, Device, Tensor, Var};

use crate::{diffusion::DiffusionModel, TrainingError};

const TIME_EMBED_DIM: usize = 64;
const INIT_STD: f64 = 0.02;

/// Small timestep-conditioned denoiser over flattened sketch images.
///
/// A stand-in for the full architecture: one hidden layer conditioned on a
/// sinusoidal timestep embedding (and optionally a class embedding),
/// predicting the noise component of its input. It exists so the training
/// engine can be exercised end-to-end; anything implementing
/// [`DiffusionModel`] can replace it.
pub struct SketchDenoiser {
    image_size: usize,
    dtype: DType,
    input_proj: Var,
    input_bias: Var,
    time_proj: Var,
    label_embed: Option<Var>,
    output_proj: Var,
    output_bias: Var,
}

impl SketchDenoiser {
    pub fn new(
        image_size: usize,
        hidden_dim: usize,
        num_classes: Option<usize>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        if image_size == 0 || hidden_dim == 0 {
            return Err(TrainingError::initialization(
                "denoiser requires positive image and hidden dimensions",
            ));
        }
        let in_dim = image_size * image_size;

        let input_proj = init_var((in_dim, hidden_dim), dtype, device)?;
        let input_bias = zero_var(hidden_dim, dtype, device)?;
        let time_proj = init_var((TIME_EMBED_DIM, hidden_dim), dtype, device)?;
        let label_embed = match num_classes {
            Some(classes) if classes > 0 => Some(init_var((classes, hidden_dim), dtype, device)?),
            _ => None,
        };
        let output_proj = init_var((hidden_dim, in_dim), dtype, device)?;
        let output_bias = zero_var(in_dim, dtype, device)?;

        Ok(Self {
            image_size,
            dtype,
            input_proj,
            input_bias,
            time_proj,
            label_embed,
            output_proj,
            output_bias,
        })
    }

    fn timestep_embedding(&self, timesteps: &Tensor) -> Result<Tensor, TrainingError> {
        let steps = timesteps.to_vec1::<u32>().map_err(to_runtime_error)?;
        let half = TIME_EMBED_DIM / 2;
        let mut values = Vec::with_capacity(steps.len() * TIME_EMBED_DIM);
        for &step in &steps {
            for i in 0..half {
                let freq = (-(i as f64) * (10_000f64).ln() / half as f64).exp();
                values.push((step as f64 * freq).sin() as f32);
            }
            for i in 0..half {
                let freq = (-(i as f64) * (10_000f64).ln() / half as f64).exp();
                values.push((step as f64 * freq).cos() as f32);
            }
        }
        Tensor::from_vec(values, (steps.len(), TIME_EMBED_DIM), timesteps.device())
            .and_then(|emb| emb.to_dtype(self.dtype))
            .map_err(to_runtime_error)
    }
}

impl DiffusionModel for SketchDenoiser {
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Tensor, TrainingError> {
        let batch = x_t.dims().first().copied().unwrap_or(0);
        let flat = x_t
            .reshape((batch, self.image_size * self.image_size))
            .and_then(|flat| flat.to_dtype(self.dtype))
            .map_err(to_runtime_error)?;

        let mut hidden = flat
            .matmul(self.input_proj.as_tensor())
            .map_err(to_runtime_error)?;

        let t_emb = self.timestep_embedding(timesteps)?;
        let t_hidden = t_emb
            .matmul(self.time_proj.as_tensor())
            .map_err(to_runtime_error)?;
        hidden = hidden.add(&t_hidden).map_err(to_runtime_error)?;

        if let (Some(table), Some(labels)) = (&self.label_embed, labels) {
            let class_hidden = table
                .as_tensor()
                .index_select(labels, 0)
                .map_err(to_runtime_error)?;
            hidden = hidden.add(&class_hidden).map_err(to_runtime_error)?;
        }

        hidden = hidden
            .broadcast_add(self.input_bias.as_tensor())
            .and_then(|h| h.relu())
            .map_err(to_runtime_error)?;

        hidden
            .matmul(self.output_proj.as_tensor())
            .and_then(|out| out.broadcast_add(self.output_bias.as_tensor()))
            .and_then(|out| out.reshape(x_t.dims()))
            .map_err(to_runtime_error)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![
            ("input_proj.weight".to_string(), self.input_proj.clone()),
            ("input_proj.bias".to_string(), self.input_bias.clone()),
            ("time_proj.weight".to_string(), self.time_proj.clone()),
        ];
        if let Some(table) = &self.label_embed {
            params.push(("label_embed.weight".to_string(), table.clone()));
        }
        params.push(("output_proj.weight".to_string(), self.output_proj.clone()));
        params.push(("output_proj.bias".to_string(), self.output_bias.clone()));
        params
    }
}

fn init_var<S: Into<candle_core::Shape>>(
    shape: S,
    dtype: DType,
    device: &Device,
) -> Result<Var, TrainingError> {
    Tensor::randn(0f32, INIT_STD as f32, shape, device)
        .and_then(|t| t.to_dtype(dtype))
        .and_then(|t| Var::from_tensor(&t))
        .map_err(to_runtime_error)
}

fn zero_var(len: usize, dtype: DType, device: &Device) -> Result<Var, TrainingError> {
    Tensor::zeros(len, dtype, device)
        .and_then(|t| Var::from_tensor(&t))
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
