use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
};

use crate::{config::SamplerKind, TrainingError};

/// Number of recent squared-loss observations kept per timestep before the
/// adaptive sampler trusts its statistics.
const HISTORY_PER_TIMESTEP: usize = 10;
/// Uniform probability floor mixed into the adaptive distribution so no
/// timestep starves once reweighting kicks in.
const UNIFORM_FLOOR: f64 = 1e-3;

/// Chooses a diffusion timestep per training example, together with an
/// importance weight that keeps the weighted loss an unbiased estimate of
/// the uniform-sampling loss: `weight[t] = 1 / (prob[t] * T)`.
pub trait ScheduleSampler: Send {
    /// Draws `n` timesteps and their importance weights.
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Vec<usize>, Vec<f32>);

    /// Feeds raw per-example losses back into the sampler. Only adaptive
    /// variants record them.
    fn update_with_losses(&mut self, timesteps: &[usize], losses: &[f32]);

    fn num_timesteps(&self) -> usize;
}

/// Builds the sampler variant selected at configuration time.
pub fn create_schedule_sampler(
    kind: SamplerKind,
    num_timesteps: usize,
) -> Result<NamedSampler, TrainingError> {
    if num_timesteps == 0 {
        return Err(TrainingError::initialization(
            "schedule sampler requires a positive number of diffusion timesteps",
        ));
    }
    Ok(match kind {
        SamplerKind::Uniform => NamedSampler::Uniform(UniformSampler { num_timesteps }),
        SamplerKind::LossSecondMoment => {
            NamedSampler::LossSecondMoment(LossSecondMomentSampler::new(num_timesteps))
        }
    })
}

/// Closed enum over the sampler variants; avoids dynamic dispatch in the
/// hot sampling path.
pub enum NamedSampler {
    Uniform(UniformSampler),
    LossSecondMoment(LossSecondMomentSampler),
}

impl ScheduleSampler for NamedSampler {
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Vec<usize>, Vec<f32>) {
        match self {
            NamedSampler::Uniform(sampler) => sampler.sample(n, rng),
            NamedSampler::LossSecondMoment(sampler) => sampler.sample(n, rng),
        }
    }

    fn update_with_losses(&mut self, timesteps: &[usize], losses: &[f32]) {
        match self {
            NamedSampler::Uniform(sampler) => sampler.update_with_losses(timesteps, losses),
            NamedSampler::LossSecondMoment(sampler) => {
                sampler.update_with_losses(timesteps, losses)
            }
        }
    }

    fn num_timesteps(&self) -> usize {
        match self {
            NamedSampler::Uniform(sampler) => sampler.num_timesteps(),
            NamedSampler::LossSecondMoment(sampler) => sampler.num_timesteps(),
        }
    }
}

pub struct UniformSampler {
    num_timesteps: usize,
}

impl ScheduleSampler for UniformSampler {
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Vec<usize>, Vec<f32>) {
        let timesteps = (0..n)
            .map(|_| rng.gen_range(0..self.num_timesteps))
            .collect();
        (timesteps, vec![1.0; n])
    }

    fn update_with_losses(&mut self, _timesteps: &[usize], _losses: &[f32]) {}

    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }
}

/// Importance sampler that concentrates on timesteps with a large recent
/// loss second moment, reducing gradient variance.
///
/// Until every timestep has `HISTORY_PER_TIMESTEP` observations it behaves
/// exactly like [`UniformSampler`]; afterwards the sampling probability is
/// proportional to the RMS of each timestep's recent loss history, mixed
/// with a small uniform floor.
pub struct LossSecondMomentSampler {
    num_timesteps: usize,
    history: Vec<[f64; HISTORY_PER_TIMESTEP]>,
    counts: Vec<usize>,
}

impl LossSecondMomentSampler {
    pub fn new(num_timesteps: usize) -> Self {
        Self {
            num_timesteps,
            history: vec![[0.0; HISTORY_PER_TIMESTEP]; num_timesteps],
            counts: vec![0; num_timesteps],
        }
    }

    fn warmed_up(&self) -> bool {
        self.counts.iter().all(|&c| c >= HISTORY_PER_TIMESTEP)
    }

    /// Sampling probability per timestep. Uniform during warm-up.
    fn probabilities(&self) -> Vec<f64> {
        let t = self.num_timesteps;
        if !self.warmed_up() {
            return vec![1.0 / t as f64; t];
        }
        let mut probs: Vec<f64> = self
            .history
            .iter()
            .map(|h| {
                let mean_sq = h.iter().map(|l| l * l).sum::<f64>() / HISTORY_PER_TIMESTEP as f64;
                mean_sq.sqrt()
            })
            .collect();
        let total: f64 = probs.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return vec![1.0 / t as f64; t];
        }
        for p in probs.iter_mut() {
            *p = (*p / total) * (1.0 - UNIFORM_FLOOR) + UNIFORM_FLOOR / t as f64;
        }
        probs
    }
}

impl ScheduleSampler for LossSecondMomentSampler {
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Vec<usize>, Vec<f32>) {
        let probs = self.probabilities();
        let timesteps: Vec<usize> = match WeightedIndex::new(&probs) {
            Ok(dist) => (0..n).map(|_| dist.sample(rng)).collect(),
            // Probabilities are positive and finite by construction; this
            // branch keeps sampling alive if that ever stops holding.
            Err(_) => (0..n)
                .map(|_| rng.gen_range(0..self.num_timesteps))
                .collect(),
        };
        let t = self.num_timesteps as f64;
        let weights = timesteps
            .iter()
            .map(|&step| (1.0 / (probs[step] * t)) as f32)
            .collect();
        (timesteps, weights)
    }

    fn update_with_losses(&mut self, timesteps: &[usize], losses: &[f32]) {
        for (&step, &loss) in timesteps.iter().zip(losses.iter()) {
            let slot = self.counts[step] % HISTORY_PER_TIMESTEP;
            self.history[step][slot] = loss as f64;
            self.counts[step] = self.counts[step].saturating_add(1);
        }
    }

    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn zero_timesteps_is_a_configuration_error() {
        assert!(create_schedule_sampler(SamplerKind::Uniform, 0).is_err());
    }

    #[test]
    fn uniform_weights_are_exactly_one() {
        let sampler = create_schedule_sampler(SamplerKind::Uniform, 100).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (timesteps, weights) = sampler.sample(64, &mut rng);
        assert_eq!(timesteps.len(), 64);
        assert!(timesteps.iter().all(|&t| t < 100));
        assert!(weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn uniform_frequencies_converge() {
        let sampler = create_schedule_sampler(SamplerKind::Uniform, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut counts = [0usize; 4];
        let (timesteps, _) = sampler.sample(40_000, &mut rng);
        for t in timesteps {
            counts[t] += 1;
        }
        for count in counts {
            let freq = count as f64 / 40_000.0;
            assert!((freq - 0.25).abs() < 0.02, "frequency {freq} drifted");
        }
    }

    #[test]
    fn adaptive_is_uniform_before_warmup() {
        let mut sampler = LossSecondMomentSampler::new(8);
        // Only some timesteps have history; warm-up is not satisfied.
        sampler.update_with_losses(&[0, 1, 2], &[5.0, 5.0, 5.0]);
        let probs = sampler.probabilities();
        assert!(probs.iter().all(|&p| (p - 1.0 / 8.0).abs() < 1e-12));
    }

    #[test]
    fn adaptive_prefers_high_loss_timesteps_after_warmup() {
        let mut sampler = LossSecondMomentSampler::new(4);
        for _ in 0..HISTORY_PER_TIMESTEP {
            sampler.update_with_losses(&[0, 1, 2, 3], &[4.0, 1.0, 1.0, 1.0]);
        }
        assert!(sampler.warmed_up());
        let probs = sampler.probabilities();
        assert!(probs[0] > probs[1]);
        assert!(probs[0] > probs[2]);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn adaptive_weights_invert_probabilities() {
        let mut sampler = LossSecondMomentSampler::new(4);
        for _ in 0..HISTORY_PER_TIMESTEP {
            sampler.update_with_losses(&[0, 1, 2, 3], &[4.0, 1.0, 1.0, 1.0]);
        }
        let probs = sampler.probabilities();
        let mut rng = StdRng::seed_from_u64(3);
        let (timesteps, weights) = sampler.sample(256, &mut rng);
        for (&t, &w) in timesteps.iter().zip(weights.iter()) {
            let expected = 1.0 / (probs[t] * 4.0);
            assert!((w as f64 - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn history_is_a_ring_buffer() {
        let mut sampler = LossSecondMomentSampler::new(1);
        for i in 0..(HISTORY_PER_TIMESTEP * 3) {
            sampler.update_with_losses(&[0], &[i as f32]);
        }
        assert_eq!(sampler.counts[0], HISTORY_PER_TIMESTEP * 3);
        // Only the most recent HISTORY_PER_TIMESTEP observations survive.
        let max = sampler.history[0]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max, (HISTORY_PER_TIMESTEP * 3 - 1) as f64);
    }
}
