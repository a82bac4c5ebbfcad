pub mod scaler;

pub use scaler::{contains_non_finite, LossScaleConfig, LossScaler};

use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// AdamW over named parameter Vars, with F32 master weights when the model
/// runs in a reduced-precision dtype. Moments are always F32.
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            let device = tensor.device();
            let dims = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(dims.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(dims.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// One AdamW update from the accumulated gradients. Gradients for
    /// tensors the optimizer does not track are left in place.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| grad.affine(1.0 - cfg.beta1, 0.0).and_then(|g| m.add(&g)))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| {
                    grad.sqr()
                        .and_then(|sq| sq.affine(1.0 - cfg.beta2, 0.0))
                        .and_then(|sq| v.add(&sq))
                })
                .map_err(to_runtime_error)?;

            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m_hat| {
                    new_v
                        .affine(scale_v, 0.0)
                        .and_then(|v_hat| v_hat.sqrt())
                        .and_then(|denom| denom.affine(1.0, cfg.epsilon))
                        .and_then(|denom| m_hat.div(&denom))
                })
                .and_then(|dir| dir.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any accumulated gradients for tracked parameters without
    /// applying them. Used when a step is skipped.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let expected: usize = shape.iter().product();
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), expected)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, expected)?,
                second_moment: flatten_to_vec(&slot.second_moment, expected)?,
                master,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims().to_vec();
            let expected: usize = dims.iter().product();
            if dims != state.shape
                || state.first_moment.len() != expected
                || state.second_moment.len() != expected
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = restore_tensor(state.first_moment, &dims, &device)?;
            slot.second_moment = restore_tensor(state.second_moment, &dims, &device)?;

            match (&slot.master, state.master) {
                (Some(master), Some(values)) => {
                    if values.len() != expected {
                        return Err(TrainingError::runtime(format!(
                            "optimizer master-weight size mismatch for '{}'",
                            slot.name
                        )));
                    }
                    let tensor = restore_tensor(values, &dims, &device)?;
                    master.set(&tensor).map_err(to_runtime_error)?;
                    let cast = tensor.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                    slot.param.set(&cast).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) | (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer master-weight presence mismatch for '{}'",
                        slot.name
                    )));
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

fn restore_tensor(
    values: Vec<f32>,
    dims: &[usize],
    device: &candle_core::Device,
) -> Result<Tensor, TrainingError> {
    let len = values.len();
    Tensor::from_vec(values, len, device)
        .and_then(|t| t.reshape(dims))
        .map_err(to_runtime_error)
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during optimizer serialization",
        ));
    }
    Ok(flat)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_params(value: f32) -> Vec<(String, Var)> {
        let tensor = Tensor::from_slice(&[value], 1, &Device::Cpu).unwrap();
        vec![("w".to_string(), Var::from_tensor(&tensor).unwrap())]
    }

    #[test]
    fn step_moves_parameters_downhill() {
        let params = quadratic_params(2.0);
        let var = params[0].1.clone();
        let mut optimizer = AdamW::new(
            params,
            AdamWConfig {
                learning_rate: 0.1,
                ..AdamWConfig::default()
            },
        )
        .unwrap();

        // Minimize w^2: repeated steps should shrink |w|.
        for _ in 0..20 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let mut grads = loss.backward().unwrap();
            optimizer.step(&mut grads).unwrap();
        }
        let value = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(value.abs() < 2.0, "expected |w| to shrink, got {value}");
    }

    #[test]
    fn state_round_trips() {
        let params = quadratic_params(1.0);
        let var = params[0].1.clone();
        let mut optimizer = AdamW::new(params, AdamWConfig::default()).unwrap();

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 1);

        let fresh_params = quadratic_params(1.0);
        let mut restored = AdamW::new(fresh_params, AdamWConfig::default()).unwrap();
        restored.load_state(state.clone()).unwrap();
        let restored_state = restored.state().unwrap();
        assert_eq!(restored_state.step, state.step);
        assert_eq!(
            restored_state.parameters[0].first_moment,
            state.parameters[0].first_moment
        );
    }

    #[test]
    fn load_rejects_unknown_parameters() {
        let params = quadratic_params(1.0);
        let mut optimizer = AdamW::new(params, AdamWConfig::default()).unwrap();
        let mut state = optimizer.state().unwrap();
        state.parameters[0].name = "other".to_string();
        assert!(optimizer.load_state(state).is_err());
    }
}
