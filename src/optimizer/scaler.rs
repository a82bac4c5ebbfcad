use candle_core::{DType, Tensor};

use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    /// Added to the scale after each patience window of overflow-free steps.
    pub growth_increment: f64,
    /// Consecutive finite-gradient steps required before the scale grows.
    pub growth_patience: usize,
    pub min_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(16),
            growth_increment: 1e-3,
            growth_patience: 1,
            min_scale: 1.0,
        }
    }
}

/// Dynamic loss scaling for reduced-precision training.
///
/// In full precision every step passes through untouched. In reduced
/// precision the loss is multiplied by the current scale before backward
/// and gradients divided by it afterwards; an overflow halves the scale
/// and the step is skipped, while a patience window of clean steps grows
/// the scale by a fixed increment. Fast down, slow up.
#[derive(Debug, Clone)]
pub struct LossScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    FullPrecision,
    Reduced {
        scale: f64,
        good_steps: usize,
        config: LossScaleConfig,
    },
}

impl LossScaler {
    pub fn full_precision() -> Self {
        Self {
            state: ScalerState::FullPrecision,
        }
    }

    pub fn reduced_precision(config: LossScaleConfig) -> Self {
        let scale = config.initial_scale.max(config.min_scale);
        Self {
            state: ScalerState::Reduced {
                scale,
                good_steps: 0,
                config,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Reduced { .. })
    }

    pub fn current_scale(&self) -> f64 {
        match &self.state {
            ScalerState::FullPrecision => 1.0,
            ScalerState::Reduced { scale, .. } => *scale,
        }
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::FullPrecision => Ok(loss.clone()),
            ScalerState::Reduced { scale, .. } => {
                loss.affine(*scale, 0.0).map_err(to_runtime_error)
            }
        }
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::FullPrecision => Ok(grad.clone()),
            ScalerState::Reduced { scale, .. } => grad
                .affine(1.0 / *scale, 0.0)
                .map_err(to_runtime_error),
        }
    }

    /// Records the outcome of a step attempt and adjusts the scale:
    /// overflow halves it and resets the good-step counter; a full
    /// patience window of clean steps adds the growth increment.
    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Reduced {
            scale,
            good_steps,
            config,
        } = &mut self.state
        {
            if found_inf {
                *scale = (*scale * 0.5).max(config.min_scale);
                *good_steps = 0;
            } else {
                *good_steps += 1;
                if *good_steps >= config.growth_patience.max(1) {
                    *scale += config.growth_increment;
                    *good_steps = 0;
                }
            }
        }
    }
}

/// True when any element of `tensor` is NaN or infinite. Reduces to a
/// single scalar on-device before inspecting it.
pub fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.sqr())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, data.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn overflow_halves_the_scale() {
        let mut scaler = LossScaler::reduced_precision(LossScaleConfig {
            initial_scale: 1024.0,
            ..LossScaleConfig::default()
        });
        scaler.update(true);
        assert_eq!(scaler.current_scale(), 512.0);
        scaler.update(true);
        assert_eq!(scaler.current_scale(), 256.0);
    }

    #[test]
    fn scale_never_drops_below_the_floor() {
        let mut scaler = LossScaler::reduced_precision(LossScaleConfig {
            initial_scale: 2.0,
            min_scale: 1.0,
            ..LossScaleConfig::default()
        });
        for _ in 0..10 {
            scaler.update(true);
        }
        assert_eq!(scaler.current_scale(), 1.0);
    }

    #[test]
    fn growth_is_additive_after_patience() {
        let mut scaler = LossScaler::reduced_precision(LossScaleConfig {
            initial_scale: 100.0,
            growth_increment: 0.25,
            growth_patience: 3,
            ..LossScaleConfig::default()
        });
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.current_scale(), 100.0);
        scaler.update(false);
        assert_eq!(scaler.current_scale(), 100.25);
    }

    #[test]
    fn overflow_resets_the_patience_counter() {
        let mut scaler = LossScaler::reduced_precision(LossScaleConfig {
            initial_scale: 100.0,
            growth_increment: 1.0,
            growth_patience: 2,
            ..LossScaleConfig::default()
        });
        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.current_scale(), 50.0);
        scaler.update(false);
        assert_eq!(scaler.current_scale(), 50.0);
        scaler.update(false);
        assert_eq!(scaler.current_scale(), 51.0);
    }

    #[test]
    fn full_precision_is_pass_through() {
        let mut scaler = LossScaler::full_precision();
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.current_scale(), 1.0);
        scaler.update(true);
        assert_eq!(scaler.current_scale(), 1.0);

        let tensor = tensor_from(&[2.0, 4.0]);
        let scaled = scaler.scale_loss(&tensor).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn scaling_round_trips() {
        let scaler = LossScaler::reduced_precision(LossScaleConfig {
            initial_scale: 8.0,
            ..LossScaleConfig::default()
        });
        let tensor = tensor_from(&[1.0, -2.0]);
        let scaled = scaler.scale_loss(&tensor).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![8.0, -16.0]);
        let unscaled = scaler.unscale(&scaled).unwrap();
        assert_eq!(unscaled.to_vec1::<f32>().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn detects_non_finite_values() {
        assert!(!contains_non_finite(&tensor_from(&[1.0, -3.0])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[f32::INFINITY])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[f32::NAN, 1.0])).unwrap());
    }
}
