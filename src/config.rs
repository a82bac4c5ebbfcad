use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Every knob the training engine recognizes, validated once at startup.
///
/// Model and diffusion hyperparameters the engine does not interpret are
/// carried in [`ModelOverrides`] and handed through to the model factory
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Directory containing the sketch shard files. Must exist.
    pub data_dir: PathBuf,
    /// Directory for structured log output. Created if absent.
    pub log_dir: PathBuf,
    /// Directory checkpoints are written to.
    pub checkpoint_dir: PathBuf,
    /// Category shard names to train on; empty selects every shard.
    pub categories: Vec<String>,
    /// Side length of the (square) training images.
    pub image_size: usize,
    pub schedule_sampler: SamplerKind,
    pub lr: f64,
    pub weight_decay: f64,
    /// Total annealing budget in steps. 0 means run unbounded with a
    /// constant learning rate.
    pub lr_anneal_steps: usize,
    pub batch_size: usize,
    /// Microbatch size limit. Zero or negative disables microbatching and
    /// each batch is processed whole.
    pub microbatch: i64,
    /// Comma-separated EMA decay rates, e.g. "0.9999" or "0.999,0.9999".
    pub ema_rates: String,
    pub log_interval: usize,
    pub save_interval: usize,
    /// Checkpoint directory to resume from; `None` starts a fresh run.
    pub resume_checkpoint: Option<PathBuf>,
    pub use_fp16: bool,
    /// Additive loss-scale growth applied after each patience window of
    /// overflow-free steps.
    pub fp16_scale_growth: f64,
    pub seed: u64,
    #[serde(default)]
    pub model: ModelOverrides,
}

/// Hyperparameters passed through to the model/diffusion factories opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub diffusion_steps: usize,
    pub hidden_dim: usize,
    pub class_cond: bool,
}

impl Default for ModelOverrides {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            hidden_dim: 256,
            class_cond: false,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            log_dir: PathBuf::from("./logs"),
            checkpoint_dir: PathBuf::from("./checkpoints"),
            categories: Vec::new(),
            image_size: 64,
            schedule_sampler: SamplerKind::Uniform,
            lr: 1e-4,
            weight_decay: 0.0,
            lr_anneal_steps: 0,
            batch_size: 4,
            microbatch: -1,
            ema_rates: "0.9999".to_string(),
            log_interval: 10,
            save_interval: 100_000,
            resume_checkpoint: None,
            use_fp16: false,
            fp16_scale_growth: 1e-3,
            seed: 42,
            model: ModelOverrides::default(),
        }
    }
}

impl TrainingConfig {
    /// Checks every field eagerly and reports all problems at once, so a
    /// bad invocation fails before any training state is built.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        } else if !self.data_dir.is_dir() {
            errors.push(format!(
                "dataset path {} not found",
                self.data_dir.display()
            ));
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }

        if self.weight_decay < 0.0 {
            errors.push("weight_decay must be >= 0".to_string());
        }

        if self.log_interval == 0 {
            errors.push("log_interval must be greater than 0".to_string());
        }

        if self.image_size == 0 {
            errors.push("image_size must be greater than 0".to_string());
        }

        if self.model.diffusion_steps == 0 {
            errors.push("diffusion_steps must be greater than 0".to_string());
        }

        if self.fp16_scale_growth < 0.0 {
            errors.push("fp16_scale_growth must be >= 0".to_string());
        }

        if let Err(err) = self.parsed_ema_rates() {
            errors.push(err.to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Parses the `ema_rates` list. Each rate must lie in (0, 1).
    pub fn parsed_ema_rates(&self) -> Result<Vec<f64>, TrainingError> {
        parse_ema_rates(&self.ema_rates)
    }

    /// Effective microbatch size limit: `None` when microbatching is
    /// disabled via the sentinel value.
    pub fn microbatch_limit(&self) -> Option<usize> {
        if self.microbatch <= 0 {
            None
        } else {
            Some(self.microbatch as usize)
        }
    }
}

pub fn parse_ema_rates(raw: &str) -> Result<Vec<f64>, TrainingError> {
    let mut rates = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let rate: f64 = part.parse().map_err(|_| {
            TrainingError::validation(vec![format!("malformed EMA decay rate '{part}'")])
        })?;
        if !(0.0 < rate && rate < 1.0) {
            return Err(TrainingError::validation(vec![format!(
                "EMA decay rate {rate} must be in (0, 1)"
            )]));
        }
        rates.push(rate);
    }
    if rates.is_empty() {
        return Err(TrainingError::validation(vec![
            "ema_rates must contain at least one decay rate".to_string(),
        ]));
    }
    Ok(rates)
}

/// Closed set of schedule-sampler variants, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SamplerKind {
    Uniform,
    LossSecondMoment,
}

impl FromStr for SamplerKind {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "uniform" => Ok(SamplerKind::Uniform),
            "loss-second-moment" | "loss_second_moment" => Ok(SamplerKind::LossSecondMoment),
            other => Err(TrainingError::validation(vec![format!(
                "unknown schedule sampler '{other}'"
            )])),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerKind::Uniform => write!(f, "uniform"),
            SamplerKind::LossSecondMoment => write!(f, "loss-second-moment"),
        }
    }
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    /// Configuration-class errors are fatal before training starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TrainingError::Validation(_) | TrainingError::Initialization(_)
        )
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {err}"),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {msg}")
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {msg}"),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_rate_list_parses() {
        assert_eq!(parse_ema_rates("0.9999").unwrap(), vec![0.9999]);
        assert_eq!(
            parse_ema_rates("0.999, 0.9999").unwrap(),
            vec![0.999, 0.9999]
        );
    }

    #[test]
    fn ema_rate_list_rejects_garbage() {
        assert!(parse_ema_rates("fast").is_err());
        assert!(parse_ema_rates("1.5").is_err());
        assert!(parse_ema_rates("").is_err());
    }

    #[test]
    fn sampler_names_round_trip() {
        assert_eq!(
            SamplerKind::from_str("uniform").unwrap(),
            SamplerKind::Uniform
        );
        assert_eq!(
            SamplerKind::from_str("loss-second-moment").unwrap(),
            SamplerKind::LossSecondMoment
        );
        assert!(SamplerKind::from_str("importance").is_err());
    }

    #[test]
    fn microbatch_sentinel_disables_splitting() {
        let mut config = TrainingConfig::default();
        config.microbatch = -1;
        assert_eq!(config.microbatch_limit(), None);
        config.microbatch = 2;
        assert_eq!(config.microbatch_limit(), Some(2));
    }
}
