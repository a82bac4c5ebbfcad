//! Training engine for sketch diffusion models.
//!
//! The crate wires a timestep schedule sampler, microbatch gradient
//! accumulation, dynamic loss scaling, EMA shadow weights, and step-keyed
//! checkpoints around a pluggable model/objective pair, all driven by
//! [`Trainer`].

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod diffusion;
pub mod ema;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod schedule;
pub mod trainer;

pub use config::{ModelOverrides, SamplerKind, TrainingConfig, TrainingError};
pub use trainer::Trainer;

use candle_core::Device;

/// Picks the best available compute backend. `CANDLE_FORCE_CPU` overrides
/// detection for debugging.
pub fn setup_device() -> Result<Device, TrainingError> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        println!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            println!("CUDA device selected: {device:?}");
            Ok(device)
        }
        Ok(_) | Err(_) => {
            println!("Using CPU backend");
            Ok(Device::Cpu)
        }
    }
}
