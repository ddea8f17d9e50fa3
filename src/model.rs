//! The model capability consumed by the sampler.

use anyhow::Result;
use thiserror::Error;

use crate::resource::VarContext;

/// Errors that happen when we evaluate the logp and gradient function
#[derive(Debug, Error)]
pub enum LogpError {
    /// The position is outside the support of the density or the
    /// evaluation failed numerically. Seen as a divergence.
    #[error("log density could not be evaluated: {0}")]
    Domain(String),
    /// Sampling cannot continue.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl LogpError {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LogpError::Domain(_))
    }
}

/// A statistical model on an unconstrained parameter space.
///
/// One model is shared read-only by all chains of a run.
pub trait Model: Send + Sync {
    /// Used to name output files.
    fn name(&self) -> &str;

    /// The number of unconstrained parameters.
    fn dim(&self) -> usize;

    /// Flat parameter names, `dim()` of them. Array elements use 1-based
    /// indices separated by dots, eg `theta.2` or `beta.1.3`.
    fn param_names(&self) -> Vec<String>;

    /// Compute the log density at `position` and write its gradient.
    fn log_density(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, LogpError>;

    /// Initial values from an init resource, one entry per parameter.
    /// `None` entries are drawn at random.
    fn init_values(&self, inits: &VarContext) -> Result<Vec<Option<f64>>> {
        Ok(self
            .param_names()
            .iter()
            .map(|name| inits.lookup_flat(name))
            .collect())
    }
}

pub mod test_logps {
    //! Simple models for tests and benchmarks.

    use anyhow::anyhow;

    use super::{LogpError, Model};

    /// An isotropic normal distribution.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    impl Model for NormalLogp {
        fn name(&self) -> &str {
            "normal"
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn param_names(&self) -> Vec<String> {
            (1..=self.dim).map(|i| format!("x.{}", i)).collect()
        }

        fn log_density(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, LogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }

    /// A normal distribution with a separate scale per coordinate.
    #[derive(Clone, Debug)]
    pub struct ScaledNormalLogp {
        scales: Vec<f64>,
    }

    impl ScaledNormalLogp {
        pub fn new(scales: Vec<f64>) -> Self {
            Self { scales }
        }
    }

    impl Model for ScaledNormalLogp {
        fn name(&self) -> &str {
            "scaled_normal"
        }

        fn dim(&self) -> usize {
            self.scales.len()
        }

        fn param_names(&self) -> Vec<String> {
            (1..=self.dim()).map(|i| format!("theta.{}", i)).collect()
        }

        fn log_density(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, LogpError> {
            let mut logp = 0f64;
            for ((p, g), s) in position.iter().zip(gradient.iter_mut()).zip(&self.scales) {
                let val = p / s;
                logp -= val * val / 2.;
                *g = -val / s;
            }
            Ok(logp)
        }
    }

    /// A normal whose density is undefined for negative first coordinate.
    #[derive(Clone, Debug)]
    pub struct HalfNormalLogp;

    impl Model for HalfNormalLogp {
        fn name(&self) -> &str {
            "half_normal"
        }

        fn dim(&self) -> usize {
            1
        }

        fn param_names(&self) -> Vec<String> {
            vec!["sigma".to_string()]
        }

        fn log_density(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, LogpError> {
            if position[0] < 0. {
                return Err(LogpError::Domain("sigma must be non-negative".to_string()));
            }
            gradient[0] = -position[0];
            Ok(-position[0] * position[0] / 2.)
        }
    }

    /// A model that fails fatally after a number of evaluations.
    #[derive(Debug)]
    pub struct FailingLogp {
        dim: usize,
        fail_after: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FailingLogp {
        pub fn new(dim: usize, fail_after: usize) -> Self {
            Self {
                dim,
                fail_after,
                calls: Default::default(),
            }
        }
    }

    impl Model for FailingLogp {
        fn name(&self) -> &str {
            "failing"
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn param_names(&self) -> Vec<String> {
            (1..=self.dim).map(|i| format!("y.{}", i)).collect()
        }

        fn log_density(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, LogpError> {
            let calls = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if calls >= self.fail_after {
                return Err(anyhow!("model evaluation failed after {} calls", calls).into());
            }
            NormalLogp::new(self.dim, 0.).log_density(position, gradient)
        }
    }

    /// A model without parameters.
    #[derive(Clone, Debug)]
    pub struct FixedParamModel;

    impl Model for FixedParamModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn dim(&self) -> usize {
            0
        }

        fn param_names(&self) -> Vec<String> {
            vec![]
        }

        fn log_density(&self, _position: &[f64], _gradient: &mut [f64]) -> Result<f64, LogpError> {
            Ok(0.)
        }
    }
}
