use serde::{Deserialize, Serialize};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualAverageOptions {
    /// Target acceptance statistic
    pub delta: f64,
    pub gamma: f64,
    pub kappa: f64,
    pub t0: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            delta: 0.8,
            gamma: 0.05,
            kappa: 0.75,
            t0: 10.,
        }
    }
}

/// Nesterov dual averaging of the log step size.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64) {
        let accept_stat = if accept_stat.is_finite() {
            accept_stat.min(1.)
        } else {
            0.
        };
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.settings.delta - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.kappa);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart the adaptation at `initial_step`, eg after the metric changed.
    pub fn reset(&mut self, initial_step: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (10. * initial_step).ln();
        self.count = 1;
    }
}

pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }
}

/// Apply uniform jitter to a nominal step size.
pub(crate) fn jittered<R: rand::Rng + ?Sized>(step_size: f64, jitter: f64, rng: &mut R) -> f64 {
    if jitter > 0. {
        let u: f64 = rng.random();
        step_size * (1. + jitter * (2. * u - 1.))
    } else {
        step_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn step_shrinks_on_low_acceptance() {
        let mut da = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..50 {
            da.advance(0.1);
        }
        assert!(da.current_step_size() < 1.);
        assert!(da.current_step_size_adapted() < 1.);
    }

    #[test]
    fn step_grows_on_high_acceptance() {
        let mut da = DualAverage::new(DualAverageOptions::default(), 0.1);
        for _ in 0..50 {
            da.advance(1.);
        }
        assert!(da.current_step_size() > 0.1);
    }

    #[test]
    fn nan_acceptance_counts_as_rejection() {
        let mut a = DualAverage::new(DualAverageOptions::default(), 1.);
        let mut b = a.clone();
        a.advance(f64::NAN);
        b.advance(0.);
        assert_eq!(a.current_step_size(), b.current_step_size());
    }

    #[test]
    fn reset_restarts() {
        let mut da = DualAverage::new(DualAverageOptions::default(), 1.);
        da.advance(0.2);
        da.reset(0.5);
        assert_relative_eq!(da.current_step_size(), 0.5);
        assert_relative_eq!(da.current_step_size_adapted(), 0.5);
    }

    #[test]
    fn jitter_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(jittered(0.5, 0., &mut rng), 0.5);
        for _ in 0..100 {
            let eps = jittered(1., 0.2, &mut rng);
            assert!((0.8..=1.2).contains(&eps));
        }
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::new();
        assert_eq!(mean.current(), 0.);
        mean.add(1.);
        mean.add(2.);
        assert_relative_eq!(mean.current(), 1.5);
        mean.reset();
        assert_eq!(mean.current(), 0.);
    }
}
