use rand_distr::{Distribution, StandardUniform};

use crate::mass_matrix::MassMatrix;
use crate::math::{all_finite, axpy, axpy_out, scalar_prods2};
use crate::model::{LogpError, Model};

/// Leapfrog steps with a larger energy error are divergent.
pub const MAX_ENERGY_ERROR: f64 = 1000.;

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_location: Box<[f64]>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub logp_function_error: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// A point in phase space.
///
/// `p_sum` is the sum of the momenta from the initial point of the
/// trajectory to this point. For points before the initial point the
/// initial momentum is not included.
#[derive(Debug, Clone)]
pub struct State {
    pub q: Box<[f64]>,
    pub p: Box<[f64]>,
    pub v: Box<[f64]>,
    pub grad: Box<[f64]>,
    pub p_sum: Box<[f64]>,
    pub idx_in_trajectory: i64,
    pub potential_energy: f64,
    pub kinetic_energy: f64,
}

impl State {
    pub fn new(dim: usize) -> State {
        State {
            q: vec![0.; dim].into(),
            p: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            potential_energy: 0.,
            kinetic_energy: 0.,
        }
    }

    /// The total energy (potential + kinetic)
    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    /// The generalized no-U-turn criterion for the part of the trajectory
    /// between `self` and `other`.
    pub fn is_turning(&self, other: &State) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let mut rho = vec![0f64; start.p.len()];
        if start.idx_in_trajectory >= 0 {
            axpy_out(&end.p_sum, &start.p_sum, -1., &mut rho);
            axpy(&start.p, &mut rho, 1.);
        } else if end.idx_in_trajectory >= 0 {
            axpy_out(&end.p_sum, &start.p_sum, 1., &mut rho);
        } else {
            axpy_out(&start.p_sum, &end.p_sum, -1., &mut rho);
            axpy(&end.p, &mut rho, 1.);
        }

        let (a, b) = scalar_prods2(&rho, &start.v, &end.v);
        (a < 0.) | (b < 0.)
    }
}

/// The hamiltonian defined by the model and a mass matrix.
pub struct Hamiltonian<'m, Mdl: Model + ?Sized, M: MassMatrix> {
    model: &'m Mdl,
    pub metric: M,
    pub step_size: f64,
}

impl<'m, Mdl: Model + ?Sized, M: MassMatrix> Hamiltonian<'m, Mdl, M> {
    pub fn new(model: &'m Mdl, metric: M, step_size: f64) -> Self {
        Self {
            model,
            metric,
            step_size,
        }
    }

    pub fn dim(&self) -> usize {
        self.metric.dim()
    }

    fn update_potential_gradient(&self, state: &mut State) -> Result<(), LogpError> {
        let logp = self.model.log_density(&state.q, &mut state.grad)?;
        if !logp.is_finite() || !all_finite(&state.grad) {
            return Err(LogpError::Domain(
                "log density or gradient is not finite".to_string(),
            ));
        }
        state.potential_energy = -logp;
        Ok(())
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is set later by [`Hamiltonian::randomize_momentum`].
    pub fn init_state(&self, position: &[f64]) -> Result<State, LogpError> {
        let mut state = State::new(self.dim());
        state.q.copy_from_slice(position);
        self.update_potential_gradient(&mut state)?;
        Ok(state)
    }

    /// Draw a fresh momentum and make `state` the initial point of a trajectory.
    pub fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        self.metric.randomize_momentum(&mut state.p, rng);
        self.metric.update_velocity(&state.p, &mut state.v);
        state.kinetic_energy = self.metric.kinetic_energy(&state.p, &state.v);
        state.idx_in_trajectory = 0;
        state.p_sum.copy_from_slice(&state.p);
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub fn leapfrog(
        &self,
        start: &State,
        dir: Direction,
        initial_energy: f64,
    ) -> Result<Result<State, DivergenceInfo>, LogpError> {
        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };
        let epsilon = (sign as f64) * self.step_size;

        let mut out = start.clone();
        axpy(&start.grad, &mut out.p, epsilon / 2.);
        self.metric.update_velocity(&out.p, &mut out.v);
        axpy(&out.v, &mut out.q, epsilon);

        if let Err(logp_error) = self.update_potential_gradient(&mut out) {
            if !logp_error.is_recoverable() {
                return Err(logp_error);
            }
            return Ok(Err(DivergenceInfo {
                start_location: start.q.clone(),
                end_location: None,
                energy_error: None,
                logp_function_error: Some(logp_error.to_string()),
            }));
        }

        axpy(&out.grad, &mut out.p, epsilon / 2.);
        self.metric.update_velocity(&out.p, &mut out.v);
        out.kinetic_energy = self.metric.kinetic_energy(&out.p, &out.v);
        out.idx_in_trajectory = start.idx_in_trajectory + sign;

        if start.idx_in_trajectory == 0 && dir == Direction::Backward {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&start.p_sum, &out.p, 1., &mut out.p_sum);
        }

        let energy_error = out.energy() - initial_energy;
        if (energy_error.abs() > MAX_ENERGY_ERROR) | !energy_error.is_finite() {
            return Ok(Err(DivergenceInfo {
                start_location: start.q.clone(),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                logp_function_error: None,
            }));
        }

        Ok(Ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::{DiagMetric, UnitMetric};
    use crate::model::test_logps::{HalfNormalLogp, NormalLogp};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn leapfrog_conserves_energy() {
        let model = NormalLogp::new(3, 0.5);
        let metric = DiagMetric::from_values(3, vec![1., 2., 0.5]).unwrap();
        let ham = Hamiltonian::new(&model, metric, 0.01);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut state = ham.init_state(&[1., -1., 0.]).unwrap();
        ham.randomize_momentum(&mut state, &mut rng);
        let initial_energy = state.energy();

        let mut current = state;
        for _ in 0..100 {
            current = ham
                .leapfrog(&current, Direction::Forward, initial_energy)
                .unwrap()
                .unwrap();
        }
        assert_eq!(current.idx_in_trajectory, 100);
        assert_relative_eq!(current.energy(), initial_energy, epsilon = 1e-3);
    }

    #[test]
    fn leapfrog_is_reversible() {
        let model = NormalLogp::new(2, 0.);
        let ham = Hamiltonian::new(&model, UnitMetric::identity(2), 0.1);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut state = ham.init_state(&[0.3, -0.7]).unwrap();
        ham.randomize_momentum(&mut state, &mut rng);
        let energy = state.energy();

        let forward = ham
            .leapfrog(&state, Direction::Forward, energy)
            .unwrap()
            .unwrap();
        let back = ham
            .leapfrog(&forward, Direction::Backward, energy)
            .unwrap()
            .unwrap();
        for (a, b) in back.q.iter().zip(state.q.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(back.idx_in_trajectory, 0);
    }

    #[test]
    fn domain_error_is_divergence() {
        let model = HalfNormalLogp;
        let ham = Hamiltonian::new(&model, UnitMetric::identity(1), 10.);
        let mut state = ham.init_state(&[0.1]).unwrap();
        state.p[0] = -1.;
        state.v[0] = -1.;
        state.kinetic_energy = 0.5;
        let info = ham
            .leapfrog(&state, Direction::Forward, state.energy())
            .unwrap()
            .unwrap_err();
        assert!(info.logp_function_error.is_some());
        assert!(info.energy_error.is_none());
    }

    #[test]
    fn huge_step_diverges() {
        let model = NormalLogp::new(1, 0.);
        let ham = Hamiltonian::new(&model, UnitMetric::identity(1), 1e3);
        let mut state = ham.init_state(&[1.]).unwrap();
        state.p[0] = 1.;
        state.v[0] = 1.;
        state.kinetic_energy = 0.5;
        let info = ham
            .leapfrog(&state, Direction::Forward, state.energy())
            .unwrap()
            .unwrap_err();
        assert!(info.energy_error.unwrap() > MAX_ENERGY_ERROR);
    }

    #[test]
    fn turning_on_reversal() {
        let dim = 1;
        let mut a = State::new(dim);
        let mut b = State::new(dim);
        a.idx_in_trajectory = 0;
        a.p[0] = 1.;
        a.v[0] = 1.;
        a.p_sum[0] = 1.;
        b.idx_in_trajectory = 1;
        b.p[0] = -0.5;
        b.v[0] = -0.5;
        b.p_sum[0] = 0.5;
        assert!(b.is_turning(&a));

        b.p[0] = 0.5;
        b.v[0] = 0.5;
        b.p_sum[0] = 1.5;
        assert!(!a.is_turning(&b));
    }
}
