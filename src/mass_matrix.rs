use std::fmt::Debug;

use faer::{Col, Mat};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::math::dot;
use crate::metric::{MetricError, MetricKind};
use crate::resource::VarContext;

/// The name of the variable that holds the inverse metric in a metric file.
pub const INV_METRIC_VAR: &str = "inv_metric";

/// Collects warmup draws and proposes a new inverse metric.
pub trait MetricEstimator: Send + Debug {
    fn observe(&mut self, position: &[f64]);

    fn count(&self) -> u64;

    /// A regularized estimate of the inverse metric in the layout of
    /// [`MassMatrix::from_values`], or `None` if there is nothing to estimate.
    fn estimate(&self) -> Option<Vec<f64>>;

    fn reset(&mut self);
}

/// The representation of the (inverse) mass matrix used by one chain.
///
/// Inverse metric values are exchanged as flat vectors: the diagonal for
/// [`DiagMetric`], the full matrix in row-major order for [`DenseMetric`]
/// and nothing for [`UnitMetric`].
pub trait MassMatrix: Clone + Send + Debug + 'static {
    const KIND: MetricKind;

    type Estimator: MetricEstimator;

    fn identity(dim: usize) -> Self;

    fn identity_values(dim: usize) -> Vec<f64>;

    /// Extract inverse metric values from a metric resource.
    fn read_values(ctx: &VarContext, dim: usize) -> Result<Vec<f64>, String>;

    /// Build the metric, checking that the values describe a valid metric.
    fn from_values(dim: usize, values: Vec<f64>) -> Result<Self, MetricError>;

    fn dim(&self) -> usize;

    /// Draw a momentum `p ~ N(0, M)`.
    fn randomize_momentum<R: Rng + ?Sized>(&self, momentum: &mut [f64], rng: &mut R);

    /// `velocity = M^{-1} momentum`
    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]);

    fn kinetic_energy(&self, momentum: &[f64], velocity: &[f64]) -> f64 {
        0.5 * dot(momentum, velocity)
    }

    fn new_estimator(&self) -> Self::Estimator;

    /// The inverse metric as rows: one row for diagonal metrics, `dim` rows
    /// for dense ones.
    fn inv_metric_rows(&self) -> Vec<Vec<f64>>;

    /// The inverse metric as stored in a metric file.
    fn inv_metric_json(&self) -> serde_json::Value {
        let rows = self.inv_metric_rows();
        match Self::KIND {
            MetricKind::Dense => serde_json::json!(rows),
            MetricKind::Unit | MetricKind::Diag => {
                serde_json::json!(rows.into_iter().next().unwrap_or_default())
            }
        }
    }
}

fn regularize(count: u64, estimate: f64, shift: f64) -> f64 {
    let n = count as f64;
    (n / (n + 5.)) * estimate + shift * (5. / (n + 5.))
}

const REGULARIZATION_SHIFT: f64 = 1e-3;

/// Estimator for metrics that are never adapted.
#[derive(Debug, Default)]
pub struct NoEstimator;

impl MetricEstimator for NoEstimator {
    fn observe(&mut self, _position: &[f64]) {}

    fn count(&self) -> u64 {
        0
    }

    fn estimate(&self) -> Option<Vec<f64>> {
        None
    }

    fn reset(&mut self) {}
}

/// The identity metric.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMetric {
    dim: usize,
}

impl MassMatrix for UnitMetric {
    const KIND: MetricKind = MetricKind::Unit;

    type Estimator = NoEstimator;

    fn identity(dim: usize) -> Self {
        Self { dim }
    }

    fn identity_values(_dim: usize) -> Vec<f64> {
        vec![]
    }

    fn read_values(_ctx: &VarContext, _dim: usize) -> Result<Vec<f64>, String> {
        Ok(vec![])
    }

    fn from_values(dim: usize, _values: Vec<f64>) -> Result<Self, MetricError> {
        Ok(Self { dim })
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, momentum: &mut [f64], rng: &mut R) {
        momentum
            .iter_mut()
            .for_each(|p| *p = rng.sample(StandardNormal));
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        velocity.copy_from_slice(momentum);
    }

    fn new_estimator(&self) -> NoEstimator {
        NoEstimator
    }

    fn inv_metric_rows(&self) -> Vec<Vec<f64>> {
        vec![vec![1.; self.dim]]
    }
}

/// A diagonal inverse metric.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagMetric {
    inv_metric: Box<[f64]>,
    inv_sqrt: Box<[f64]>,
}

impl DiagMetric {
    pub fn inv_metric(&self) -> &[f64] {
        &self.inv_metric
    }
}

impl MassMatrix for DiagMetric {
    const KIND: MetricKind = MetricKind::Diag;

    type Estimator = VarianceEstimator;

    fn identity(dim: usize) -> Self {
        Self {
            inv_metric: vec![1.; dim].into(),
            inv_sqrt: vec![1.; dim].into(),
        }
    }

    fn identity_values(dim: usize) -> Vec<f64> {
        vec![1.; dim]
    }

    fn read_values(ctx: &VarContext, dim: usize) -> Result<Vec<f64>, String> {
        ctx.vector(INV_METRIC_VAR, dim).map(|vals| vals.to_vec())
    }

    fn from_values(dim: usize, values: Vec<f64>) -> Result<Self, MetricError> {
        if values.len() != dim {
            return Err(MetricError::Shape {
                expected: dim,
                found: values.len(),
            });
        }
        for (index, &value) in values.iter().enumerate() {
            if !value.is_finite() {
                return Err(MetricError::NonFinite { index });
            }
            if value <= 0. {
                return Err(MetricError::NotPositive { index, value });
            }
        }
        let inv_sqrt = values.iter().map(|val| val.sqrt().recip()).collect();
        Ok(Self {
            inv_metric: values.into(),
            inv_sqrt,
        })
    }

    fn dim(&self) -> usize {
        self.inv_metric.len()
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, momentum: &mut [f64], rng: &mut R) {
        momentum
            .iter_mut()
            .zip(self.inv_sqrt.iter())
            .for_each(|(p, &scale)| {
                let z: f64 = rng.sample(StandardNormal);
                *p = z * scale;
            });
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        velocity
            .iter_mut()
            .zip(momentum.iter().zip(self.inv_metric.iter()))
            .for_each(|(v, (p, m))| *v = p * m);
    }

    fn new_estimator(&self) -> VarianceEstimator {
        VarianceEstimator::new(self.dim())
    }

    fn inv_metric_rows(&self) -> Vec<Vec<f64>> {
        vec![self.inv_metric.to_vec()]
    }
}

/// Welford's running variance of each coordinate.
#[derive(Debug, Clone)]
pub struct VarianceEstimator {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl VarianceEstimator {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }
}

impl MetricEstimator for VarianceEstimator {
    fn observe(&mut self, position: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        self.mean
            .iter_mut()
            .zip(self.m2.iter_mut())
            .zip(position)
            .for_each(|((mean, m2), &x)| {
                let delta = x - *mean;
                *mean += delta / n;
                *m2 += delta * (x - *mean);
            });
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn estimate(&self) -> Option<Vec<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        Some(
            self.m2
                .iter()
                .map(|m2| regularize(self.count, m2 / denom, REGULARIZATION_SHIFT))
                .collect(),
        )
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// A dense inverse metric.
///
/// Momenta are drawn through the eigendecomposition `M^{-1} = U S U^T`
/// as `p = U S^{-1/2} z`.
#[derive(Debug, Clone)]
pub struct DenseMetric {
    inv_metric: Mat<f64>,
    momentum_transform: Mat<f64>,
}

impl DenseMetric {
    pub fn inv_metric(&self) -> &Mat<f64> {
        &self.inv_metric
    }
}

impl PartialEq for DenseMetric {
    fn eq(&self, other: &Self) -> bool {
        self.inv_metric_rows() == other.inv_metric_rows()
    }
}

impl MassMatrix for DenseMetric {
    const KIND: MetricKind = MetricKind::Dense;

    type Estimator = CovarianceEstimator;

    fn identity(dim: usize) -> Self {
        Self {
            inv_metric: Mat::identity(dim, dim),
            momentum_transform: Mat::identity(dim, dim),
        }
    }

    fn identity_values(dim: usize) -> Vec<f64> {
        let mut values = vec![0f64; dim * dim];
        (0..dim).for_each(|i| values[i * dim + i] = 1.);
        values
    }

    fn read_values(ctx: &VarContext, dim: usize) -> Result<Vec<f64>, String> {
        ctx.square_matrix(INV_METRIC_VAR, dim)
            .map(|vals| vals.to_vec())
    }

    fn from_values(dim: usize, values: Vec<f64>) -> Result<Self, MetricError> {
        if values.len() != dim * dim {
            return Err(MetricError::Shape {
                expected: dim * dim,
                found: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|val| !val.is_finite()) {
            return Err(MetricError::NonFinite { index });
        }
        let inv_metric = Mat::from_fn(dim, dim, |i, j| values[i * dim + j]);
        for row in 0..dim {
            for col in 0..row {
                let (a, b) = (inv_metric[(row, col)], inv_metric[(col, row)]);
                if (a - b).abs() > 1e-8 * a.abs().max(b.abs()).max(1.) {
                    return Err(MetricError::NotSymmetric { row, col });
                }
            }
        }

        let eigen = inv_metric
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|_| MetricError::NotPositiveDefinite)?;
        let vals: Col<f64> = eigen.S().column_vector().to_owned();
        let vecs = eigen.U();
        if (0..dim).any(|i| vals[i] <= 0. || !vals[i].is_finite()) {
            return Err(MetricError::NotPositiveDefinite);
        }
        let momentum_transform = Mat::from_fn(dim, dim, |i, j| vecs[(i, j)] / vals[j].sqrt());

        Ok(Self {
            inv_metric,
            momentum_transform,
        })
    }

    fn dim(&self) -> usize {
        self.inv_metric.nrows()
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, momentum: &mut [f64], rng: &mut R) {
        let dim = self.dim();
        let z: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
        for (i, p) in momentum.iter_mut().enumerate() {
            *p = (0..dim)
                .map(|j| self.momentum_transform[(i, j)] * z[j])
                .sum();
        }
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        let dim = self.dim();
        for (i, v) in velocity.iter_mut().enumerate() {
            *v = (0..dim).map(|j| self.inv_metric[(i, j)] * momentum[j]).sum();
        }
    }

    fn new_estimator(&self) -> CovarianceEstimator {
        CovarianceEstimator::new(self.dim())
    }

    fn inv_metric_rows(&self) -> Vec<Vec<f64>> {
        let dim = self.dim();
        (0..dim)
            .map(|i| (0..dim).map(|j| self.inv_metric[(i, j)]).collect())
            .collect()
    }
}

/// Welford's running covariance, stored row-major.
#[derive(Debug, Clone)]
pub struct CovarianceEstimator {
    dim: usize,
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl CovarianceEstimator {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim * dim].into(),
            count: 0,
        }
    }
}

impl MetricEstimator for CovarianceEstimator {
    fn observe(&mut self, position: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        let delta: Vec<f64> = position
            .iter()
            .zip(self.mean.iter())
            .map(|(x, mean)| x - mean)
            .collect();
        self.mean
            .iter_mut()
            .zip(&delta)
            .for_each(|(mean, d)| *mean += d / n);
        for i in 0..self.dim {
            for j in 0..self.dim {
                self.m2[i * self.dim + j] += delta[i] * (position[j] - self.mean[j]);
            }
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn estimate(&self) -> Option<Vec<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        let dim = self.dim;
        let estimate = (0..dim * dim)
            .map(|idx| {
                // Symmetrize to remove rounding asymmetry of the update
                let (i, j) = (idx / dim, idx % dim);
                let cov = 0.5 * (self.m2[i * dim + j] + self.m2[j * dim + i]) / denom;
                let shift = if i == j { REGULARIZATION_SHIFT } else { 0. };
                regularize(self.count, cov, shift)
            })
            .collect();
        Some(estimate)
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}
