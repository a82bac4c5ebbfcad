use std::time::Instant;

const NUM_QUARTILES: usize = 4;

/// Scalar exponential moving average for smoothing noisy step losses.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    decay: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f64) -> Self {
        Self { decay, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(value) => self.decay * value + (1.0 - self.decay) * sample,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Per-timestep-quartile loss accumulator. Timesteps are mapped to four
/// equal-width bins over the schedule so the logs expose where in the
/// noising process the model is struggling.
#[derive(Debug, Clone)]
pub struct TimestepLossBins {
    num_timesteps: usize,
    sums: [f64; NUM_QUARTILES],
    counts: [u64; NUM_QUARTILES],
}

impl TimestepLossBins {
    pub fn new(num_timesteps: usize) -> Self {
        Self {
            num_timesteps: num_timesteps.max(1),
            sums: [0.0; NUM_QUARTILES],
            counts: [0; NUM_QUARTILES],
        }
    }

    pub fn record(&mut self, timestep: usize, loss: f64) {
        let quartile = (timestep * NUM_QUARTILES / self.num_timesteps).min(NUM_QUARTILES - 1);
        self.sums[quartile] += loss;
        self.counts[quartile] += 1;
    }

    /// Mean loss per quartile; `None` for quartiles with no samples yet.
    pub fn means(&self) -> [Option<f64>; NUM_QUARTILES] {
        let mut means = [None; NUM_QUARTILES];
        for idx in 0..NUM_QUARTILES {
            if self.counts[idx] > 0 {
                means[idx] = Some(self.sums[idx] / self.counts[idx] as f64);
            }
        }
        means
    }

    pub fn reset(&mut self) {
        self.sums = [0.0; NUM_QUARTILES];
        self.counts = [0; NUM_QUARTILES];
    }
}

/// What one logging interval reports.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub global_step: usize,
    pub loss: f64,
    pub smoothed_loss: f64,
    pub quartile_losses: [Option<f64>; NUM_QUARTILES],
    pub learning_rate: f64,
    pub loss_scale: f64,
    pub samples_per_sec: f64,
    pub skipped_steps: u64,
}

/// Running training statistics between logging intervals.
pub struct TrainingMetrics {
    smoothed_loss: ExponentialMovingAverage,
    bins: TimestepLossBins,
    skipped_steps: u64,
    samples_since_log: usize,
    interval_start: Instant,
}

impl TrainingMetrics {
    pub fn new(num_timesteps: usize) -> Self {
        Self {
            smoothed_loss: ExponentialMovingAverage::new(0.9),
            bins: TimestepLossBins::new(num_timesteps),
            skipped_steps: 0,
            samples_since_log: 0,
            interval_start: Instant::now(),
        }
    }

    pub fn record_microbatch(&mut self, timesteps: &[usize], losses: &[f32]) {
        for (&t, &loss) in timesteps.iter().zip(losses.iter()) {
            self.bins.record(t, loss as f64);
        }
        self.samples_since_log += timesteps.len();
    }

    pub fn record_skipped_step(&mut self) {
        self.skipped_steps += 1;
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn snapshot(
        &mut self,
        global_step: usize,
        loss: f64,
        learning_rate: f64,
        loss_scale: f64,
    ) -> StepSnapshot {
        let smoothed_loss = self.smoothed_loss.update(loss);
        let elapsed = self.interval_start.elapsed().as_secs_f64().max(1e-9);
        let samples_per_sec = self.samples_since_log as f64 / elapsed;
        let snapshot = StepSnapshot {
            global_step,
            loss,
            smoothed_loss,
            quartile_losses: self.bins.means(),
            learning_rate,
            loss_scale,
            samples_per_sec,
            skipped_steps: self.skipped_steps,
        };
        self.bins.reset();
        self.samples_since_log = 0;
        self.interval_start = Instant::now();
        snapshot
    }
}
