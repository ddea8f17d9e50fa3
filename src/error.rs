use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::chain::ChainError;
use crate::init::InitError;
use crate::metric::MetricError;
use crate::resource::{ResourceError, ResourceKind};
use crate::settings::ConfigError;

/// Status code of a successful run.
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_PARSING: i32 = 1;
pub const STATUS_SAMPLING: i32 = 3;
pub const STATUS_INVALID_ARGS: i32 = 4;
pub const STATUS_RUNTIME: i32 = 5;

/// Every fatal error of a run.
///
/// The `Display` output is the diagnostic reported to the caller. Chain
/// numbers in messages are 1-based ordinals.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("error reading input data: {0}")]
    Data(#[source] Arc<ResourceError>),
    #[error("error reading {kind} file for chain {chain}: {source}")]
    ResourceLoad {
        kind: ResourceKind,
        chain: usize,
        #[source]
        source: Arc<ResourceError>,
    },
    #[error("invalid metric for chain {chain}: {source}")]
    MetricValidation {
        chain: usize,
        #[source]
        source: MetricError,
    },
    #[error("cannot open output file {path:?}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("initialization failed for chain {chain}: {source}")]
    Initialization {
        chain: usize,
        #[source]
        source: InitError,
    },
    #[error("chain {chain} failed: {source}")]
    Chain {
        chain: usize,
        #[source]
        source: ChainError,
    },
    #[error("could not start worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl RunError {
    /// The numeric status reported for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            RunError::Config(_) => STATUS_INVALID_ARGS,
            RunError::Data(_) | RunError::ResourceLoad { .. } => STATUS_PARSING,
            RunError::MetricValidation { .. }
            | RunError::Initialization { .. }
            | RunError::Chain { .. } => STATUS_SAMPLING,
            RunError::Sink { .. } | RunError::ThreadPool(_) => STATUS_RUNTIME,
        }
    }

    /// The 1-based ordinal of the chain that failed, if the error belongs
    /// to a single chain.
    pub fn chain(&self) -> Option<usize> {
        match self {
            RunError::ResourceLoad { chain, .. }
            | RunError::MetricValidation { chain, .. }
            | RunError::Initialization { chain, .. }
            | RunError::Chain { chain, .. } => Some(*chain),
            _ => None,
        }
    }
}
