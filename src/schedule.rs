/// Linear learning-rate anneal over a fixed step budget.
///
/// With a zero budget the base rate is held for the whole run. Otherwise the
/// rate decays linearly from the base to zero as the global step approaches
/// the budget; because it is a pure function of the global step, a resumed
/// run continues exactly where the interrupted one left off.
#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    base_lr: f64,
    anneal_steps: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f64, anneal_steps: usize) -> Self {
        Self {
            base_lr,
            anneal_steps,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn anneal_steps(&self) -> usize {
        self.anneal_steps
    }

    pub fn lr_at(&self, global_step: usize) -> f64 {
        if self.anneal_steps == 0 {
            return self.base_lr;
        }
        let frac_done = (global_step as f64 / self.anneal_steps as f64).min(1.0);
        self.base_lr * (1.0 - frac_done)
    }

    /// True once the annealing budget is exhausted. Never true for an
    /// unbounded (zero budget) schedule.
    pub fn is_exhausted(&self, global_step: usize) -> bool {
        self.anneal_steps != 0 && global_step >= self.anneal_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_holds_the_base_rate() {
        let schedule = LrSchedule::new(1e-4, 0);
        assert_eq!(schedule.lr_at(0), 1e-4);
        assert_eq!(schedule.lr_at(1_000_000), 1e-4);
        assert!(!schedule.is_exhausted(1_000_000));
    }

    #[test]
    fn rate_decays_linearly_to_zero() {
        let schedule = LrSchedule::new(1.0, 100);
        assert_eq!(schedule.lr_at(0), 1.0);
        assert!((schedule.lr_at(25) - 0.75).abs() < 1e-12);
        assert!((schedule.lr_at(50) - 0.50).abs() < 1e-12);
        assert_eq!(schedule.lr_at(100), 0.0);
        assert_eq!(schedule.lr_at(250), 0.0);
    }

    #[test]
    fn exhaustion_tracks_the_budget() {
        let schedule = LrSchedule::new(1.0, 10);
        assert!(!schedule.is_exhausted(9));
        assert!(schedule.is_exhausted(10));
        assert!(schedule.is_exhausted(11));
    }

    #[test]
    fn resumed_run_sees_the_same_rates() {
        // A schedule rebuilt from config must agree with the original at
        // every step past the resume point.
        let first = LrSchedule::new(3e-4, 1000);
        let resumed = LrSchedule::new(3e-4, 1000);
        for step in 400..410 {
            assert_eq!(first.lr_at(step), resumed.lr_at(step));
        }
    }
}
