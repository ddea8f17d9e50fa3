//! Run several independently seeded NUTS chains on one model.
//!
//! Chains share parsed init and metric files, use a unit, diagonal or
//! dense metric, and write their draws to per-chain output files. They are
//! executed one after another or on a thread pool; the random stream of a
//! chain depends only on the seed and the chain index, so both policies
//! produce the same draws.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use nuts_multichain::{load_data, sample, test_logps::NormalLogp, JsonResourceParser, RunSettings};
//!
//! # fn main() -> Result<(), nuts_multichain::RunError> {
//! let data = load_data(&JsonResourceParser, Path::new("data.json"))?;
//! let mu = data.lookup_flat("mu").unwrap_or(3.);
//!
//! let model = NormalLogp::new(10, mu);
//! let settings = RunSettings {
//!     num_chains: 4,
//!     ..Default::default()
//! };
//! let report = sample(&model, &settings)?;
//! assert_eq!(report.chains.len(), 4);
//! # Ok(())
//! # }
//! ```

pub(crate) mod adapt;
pub(crate) mod chain;
pub(crate) mod error;
pub(crate) mod hamiltonian;
pub(crate) mod init;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod metric;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod resource;
pub(crate) mod sampler;
pub(crate) mod settings;
pub(crate) mod stepsize;
pub mod storage;

pub use adapt::WindowOptions;
pub use chain::{AnySampler, ChainError, ChainSampler, ChainStats, IterationPlan, STAT_NAMES};
pub use error::{
    RunError, STATUS_INVALID_ARGS, STATUS_PARSING, STATUS_RUNTIME, STATUS_SAMPLING,
    STATUS_SUCCESS,
};
pub use hamiltonian::DivergenceInfo;
pub use init::{chain_rng, initial_position, InitError, MAX_INIT_TRIES};
pub use mass_matrix::{
    CovarianceEstimator, DenseMetric, DiagMetric, MassMatrix, MetricEstimator, NoEstimator,
    UnitMetric, VarianceEstimator, INV_METRIC_VAR,
};
pub use metric::{configure_metric, MetricError, MetricKind, MetricSource};
pub use model::{test_logps, LogpError, Model};
pub use nuts::{NutsOptions, SampleInfo};
pub use resource::{
    load_data, JsonResourceParser, LoadedResource, ResourceError, ResourceKind, ResourceList,
    ResourceParser, ResourceResolver, VarContext, Variable,
};
pub use sampler::{exit_status, sample, ChainReport, InterruptFlag, MultiChainRun, RunReport};
pub use settings::{ConfigError, OutputSettings, RunSettings, SchedulePolicy};
pub use stepsize::DualAverageOptions;
