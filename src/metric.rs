//! Metric strategy selection and per-chain metric configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::mass_matrix::MassMatrix;
use crate::resource::LoadedResource;
use crate::settings::ConfigError;

/// The metric strategy of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    Unit,
    #[default]
    Diag,
    Dense,
}

impl MetricKind {
    /// Whether the metric is re-estimated in windows during warmup.
    pub fn adapts_windowed(self) -> bool {
        match self {
            MetricKind::Unit => false,
            MetricKind::Diag | MetricKind::Dense => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Unit => "unit_e",
            MetricKind::Diag => "diag_e",
            MetricKind::Dense => "dense_e",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unit" | "unit_e" => Ok(MetricKind::Unit),
            "diag" | "diagonal" | "diag_e" => Ok(MetricKind::Diag),
            "dense" | "dense_e" => Ok(MetricKind::Dense),
            _ => Err(ConfigError::UnknownMetric(s.to_string())),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricKind> for String {
    fn from(kind: MetricKind) -> Self {
        kind.name().to_string()
    }
}

/// A metric that fails validation. Always fatal.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("expected {expected} inverse metric values, found {found}")]
    Shape { expected: usize, found: usize },
    #[error("inverse metric value {index} is not finite")]
    NonFinite { index: usize },
    #[error("diagonal inverse metric value {index} must be positive, got {value}")]
    NotPositive { index: usize, value: f64 },
    #[error("dense inverse metric is not symmetric at ({row}, {col})")]
    NotSymmetric { row: usize, col: usize },
    #[error("dense inverse metric is not positive definite")]
    NotPositiveDefinite,
}

/// Where a chain's initial metric came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MetricSource {
    /// No metric file was given, or the strategy does not read one.
    Identity,
    /// Read from a metric file.
    Supplied { path: PathBuf },
    /// The metric file could not be used and the identity was taken instead.
    Substituted { reason: String },
}

/// Build the initial metric of one chain.
///
/// The unit strategy ignores the resource. For the others, a metric resource
/// that cannot be loaded or does not contain an `inv_metric` of the right
/// shape is replaced by the identity with a warning. The chosen values are
/// then validated, and validation failures are returned as errors.
pub fn configure_metric<M: MassMatrix>(
    resource: &LoadedResource,
    dim: usize,
    chain: usize,
) -> Result<(M, MetricSource), MetricError> {
    if !M::KIND.adapts_windowed() {
        return Ok((M::identity(dim), MetricSource::Identity));
    }

    let (values, source) = match resource {
        Ok(ctx) if ctx.is_empty() && ctx.source().is_none() => {
            (M::identity_values(dim), MetricSource::Identity)
        }
        Ok(ctx) => match M::read_values(ctx, dim) {
            Ok(values) => {
                let path = ctx.source().map(|p| p.to_path_buf()).unwrap_or_default();
                (values, MetricSource::Supplied { path })
            }
            Err(reason) => substitute::<M>(dim, chain, reason),
        },
        Err(err) => substitute::<M>(dim, chain, err.to_string()),
    };

    let metric = M::from_values(dim, values)?;
    Ok((metric, source))
}

fn substitute<M: MassMatrix>(dim: usize, chain: usize, reason: String) -> (Vec<f64>, MetricSource) {
    let fallback = match M::KIND {
        MetricKind::Dense => "identity matrix",
        MetricKind::Unit | MetricKind::Diag => "unit diagonal",
    };
    warn!(
        chain,
        metric = %M::KIND,
        %reason,
        "Using {} metric (failed to read provided metric)",
        fallback
    );
    (
        M::identity_values(dim),
        MetricSource::Substituted { reason },
    )
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::mass_matrix::{DenseMetric, DiagMetric, UnitMetric};
    use crate::resource::{ResourceError, VarContext, Variable};
    use pretty_assertions::assert_eq;

    fn loaded(text: &str) -> LoadedResource {
        VarContext::from_json_str(text, Path::new("metric.json"))
            .map(Arc::new)
            .map_err(Arc::new)
    }

    #[test]
    fn parse_kinds() {
        assert_eq!("unit_e".parse::<MetricKind>().unwrap(), MetricKind::Unit);
        assert_eq!("Diagonal".parse::<MetricKind>().unwrap(), MetricKind::Diag);
        assert_eq!("dense".parse::<MetricKind>().unwrap(), MetricKind::Dense);
        assert!("sparse".parse::<MetricKind>().is_err());
        assert!(!MetricKind::Unit.adapts_windowed());
        assert!(MetricKind::Dense.adapts_windowed());
    }

    #[test]
    fn serde_names() {
        let json = serde_json::to_string(&MetricKind::Dense).unwrap();
        assert_eq!(json, "\"dense_e\"");
        let kind: MetricKind = serde_json::from_str("\"diag\"").unwrap();
        assert_eq!(kind, MetricKind::Diag);
    }

    #[test]
    fn empty_resource_is_identity() {
        let resource: LoadedResource = Ok(Arc::new(VarContext::empty()));
        let (metric, source) = configure_metric::<DiagMetric>(&resource, 3, 1).unwrap();
        assert_eq!(metric, DiagMetric::identity(3));
        assert_eq!(source, MetricSource::Identity);
    }

    #[test]
    fn supplied_diag_metric() {
        let resource = loaded(r#"{"inv_metric": [0.5, 2.0]}"#);
        let (metric, source) = configure_metric::<DiagMetric>(&resource, 2, 1).unwrap();
        assert_eq!(metric.inv_metric(), &[0.5, 2.0]);
        assert_eq!(
            source,
            MetricSource::Supplied {
                path: "metric.json".into()
            }
        );
    }

    #[test]
    fn unreadable_metric_is_substituted() {
        let missing: LoadedResource =
            Err(Arc::new(ResourceError::Missing("gone.json".into())));
        let (metric, source) = configure_metric::<DenseMetric>(&missing, 2, 3).unwrap();
        assert_eq!(metric, DenseMetric::identity(2));
        assert!(matches!(source, MetricSource::Substituted { .. }));

        let wrong_shape = loaded(r#"{"inv_metric": [1.0, 2.0, 3.0]}"#);
        let (metric, source) = configure_metric::<DiagMetric>(&wrong_shape, 2, 1).unwrap();
        assert_eq!(metric, DiagMetric::identity(2));
        assert!(matches!(source, MetricSource::Substituted { .. }));

        let no_var = loaded(r#"{"stepsize": 0.1}"#);
        let (_, source) = configure_metric::<DiagMetric>(&no_var, 2, 1).unwrap();
        assert!(matches!(source, MetricSource::Substituted { .. }));
    }

    #[test]
    fn invalid_supplied_metric_is_fatal() {
        let negative = loaded(r#"{"inv_metric": [1.0, -2.0]}"#);
        assert!(matches!(
            configure_metric::<DiagMetric>(&negative, 2, 1),
            Err(MetricError::NotPositive { index: 1, .. })
        ));

        let indefinite = loaded(r#"{"inv_metric": [[1.0, 2.0], [2.0, 1.0]]}"#);
        assert!(matches!(
            configure_metric::<DenseMetric>(&indefinite, 2, 1),
            Err(MetricError::NotPositiveDefinite)
        ));
    }

    #[test]
    fn unit_ignores_resource() {
        let resource = Ok(Arc::new(VarContext::from_vars([(
            "inv_metric",
            Variable::vector(vec![-1.]),
        )])));
        let (metric, source) = configure_metric::<UnitMetric>(&resource, 4, 1).unwrap();
        assert_eq!(metric.dim(), 4);
        assert_eq!(source, MetricSource::Identity);
    }
}
