use std::collections::HashMap;

use candle_core::{DType, Tensor, Var};

use crate::TrainingError;

/// Exponentially averaged shadow copies of the model parameters.
///
/// One shadow set is kept per configured decay rate; each is updated as
/// `shadow = rate * shadow + (1 - rate) * current` after every applied
/// optimizer step and never on a skipped one. Shadows are detached F32
/// copies; they are read for checkpointing and downstream sampling, never
/// optimized directly.
pub struct EmaTracker {
    shadows: Vec<EmaShadow>,
}

struct EmaShadow {
    rate: f64,
    tensors: Vec<(String, Tensor)>,
}

impl EmaTracker {
    /// Initializes every shadow set as an exact copy of the current
    /// parameters.
    pub fn new(rates: &[f64], params: &[(String, Var)]) -> Result<Self, TrainingError> {
        if rates.is_empty() {
            return Err(TrainingError::initialization(
                "EMA tracker requires at least one decay rate",
            ));
        }
        let mut shadows = Vec::with_capacity(rates.len());
        for &rate in rates {
            if !(0.0 < rate && rate < 1.0) {
                return Err(TrainingError::initialization(format!(
                    "EMA decay rate {rate} must be in (0, 1)"
                )));
            }
            shadows.push(EmaShadow {
                rate,
                tensors: copy_params(params)?,
            });
        }
        Ok(Self { shadows })
    }

    pub fn rates(&self) -> Vec<f64> {
        self.shadows.iter().map(|shadow| shadow.rate).collect()
    }

    /// Applies one EMA step for every tracked rate.
    pub fn update(&mut self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        for shadow in &mut self.shadows {
            let rate = shadow.rate;
            for ((name, var), (shadow_name, shadow_tensor)) in
                params.iter().zip(shadow.tensors.iter_mut())
            {
                if name != shadow_name {
                    return Err(TrainingError::runtime(format!(
                        "EMA shadow order diverged: expected {shadow_name}, got {name}"
                    )));
                }
                let current = var
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                *shadow_tensor = shadow_tensor
                    .affine(rate, 0.0)
                    .and_then(|decayed| {
                        current
                            .affine(1.0 - rate, 0.0)
                            .and_then(|blended| decayed.add(&blended))
                    })
                    .map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    /// Shadow tensors for one rate, keyed by parameter name. Used by the
    /// checkpoint writer.
    pub fn shadow_tensors(&self, index: usize) -> HashMap<String, Tensor> {
        self.shadows[index]
            .tensors
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect()
    }

    /// Restores one rate's shadow set from checkpoint tensors. Every
    /// parameter must be present with a matching shape.
    pub fn restore_shadow(
        &mut self,
        index: usize,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<(), TrainingError> {
        let shadow = &mut self.shadows[index];
        for (name, slot) in shadow.tensors.iter_mut() {
            let restored = tensors.remove(name).ok_or_else(|| {
                TrainingError::runtime(format!("EMA checkpoint missing parameter {name}"))
            })?;
            if restored.dims() != slot.dims() {
                return Err(TrainingError::runtime(format!(
                    "EMA checkpoint shape mismatch for {name}"
                )));
            }
            *slot = restored.to_dtype(DType::F32).map_err(to_runtime_error)?;
        }
        if !tensors.is_empty() {
            let extra: Vec<String> = tensors.keys().cloned().collect();
            return Err(TrainingError::runtime(format!(
                "EMA checkpoint contains unknown parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    /// Re-initializes one rate's shadow set from the current parameters.
    /// Used when a resume checkpoint lacks a configured rate.
    pub fn reinit_shadow(
        &mut self,
        index: usize,
        params: &[(String, Var)],
    ) -> Result<(), TrainingError> {
        self.shadows[index].tensors = copy_params(params)?;
        Ok(())
    }
}

fn copy_params(params: &[(String, Var)]) -> Result<Vec<(String, Tensor)>, TrainingError> {
    params
        .iter()
        .map(|(name, var)| {
            var.as_tensor()
                .to_dtype(DType::F32)
                .and_then(|t| t.copy())
                .map(|t| (name.clone(), t))
                .map_err(to_runtime_error)
        })
        .collect()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(values: &[f32]) -> Vec<(String, Var)> {
        let tensor = Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap();
        vec![("w".to_string(), Var::from_tensor(&tensor).unwrap())]
    }

    #[test]
    fn shadows_start_as_exact_copies() {
        let params = params(&[1.0, -2.0, 3.0]);
        let tracker = EmaTracker::new(&[0.5, 0.9], &params).unwrap();
        for idx in 0..2 {
            let shadow = tracker.shadow_tensors(idx);
            let values = shadow["w"].to_vec1::<f32>().unwrap();
            assert_eq!(values, vec![1.0, -2.0, 3.0]);
        }
    }

    #[test]
    fn one_update_matches_the_closed_form() {
        let params = params(&[0.0]);
        let mut tracker = EmaTracker::new(&[0.9], &params).unwrap();
        params[0].1.set(&Tensor::from_slice(&[10.0f32], 1, &Device::Cpu).unwrap()).unwrap();
        tracker.update(&params).unwrap();
        let shadow = tracker.shadow_tensors(0)["w"].to_vec1::<f32>().unwrap();
        // 0.9 * 0.0 + 0.1 * 10.0
        assert!((shadow[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rates_update_independently() {
        let params = params(&[0.0]);
        let mut tracker = EmaTracker::new(&[0.5, 0.99], &params).unwrap();
        params[0].1.set(&Tensor::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap()).unwrap();
        tracker.update(&params).unwrap();
        let fast = tracker.shadow_tensors(0)["w"].to_vec1::<f32>().unwrap()[0];
        let slow = tracker.shadow_tensors(1)["w"].to_vec1::<f32>().unwrap()[0];
        assert!((fast - 0.5).abs() < 1e-6);
        assert!((slow - 0.01).abs() < 1e-6);
    }

    #[test]
    fn restore_rejects_shape_mismatch() {
        let params = params(&[1.0, 2.0]);
        let mut tracker = EmaTracker::new(&[0.9], &params).unwrap();
        let mut wrong = HashMap::new();
        wrong.insert(
            "w".to_string(),
            Tensor::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap(),
        );
        assert!(tracker.restore_shadow(0, wrong).is_err());
    }

    #[test]
    fn reinit_copies_current_parameters() {
        let params = params(&[1.0]);
        let mut tracker = EmaTracker::new(&[0.9], &params).unwrap();
        params[0].1.set(&Tensor::from_slice(&[5.0f32], 1, &Device::Cpu).unwrap()).unwrap();
        tracker.reinit_shadow(0, &params).unwrap();
        let shadow = tracker.shadow_tensors(0)["w"].to_vec1::<f32>().unwrap();
        assert_eq!(shadow, vec![5.0]);
    }
}
