use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapt::WindowOptions;
use crate::metric::MetricKind;
use crate::resource::{ResourceKind, ResourceList};
use crate::stepsize::DualAverageOptions;

/// Errors in the run configuration, detected before any chain is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the number of chains must be at least 1")]
    NoChains,
    #[error("thin ({thin}) cannot exceed samples ({samples})")]
    ThinExceedsSamples { thin: u64, samples: u64 },
    #[error(
        "{kind} must specify either 1 file (for all chains) or {num_chains} files \
         (one per chain), found {found} files"
    )]
    Cardinality {
        kind: ResourceKind,
        num_chains: usize,
        found: usize,
    },
    #[error("unknown metric type '{0}', expected one of unit, diag, dense")]
    UnknownMetric(String),
    #[error("{name} must be {requirement}, got {value}")]
    OutOfRange {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },
    #[error("could not read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How chains are executed when there is more than one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// One chain after the other in index order. The run stops at the
    /// first failing chain.
    Sequential,
    /// Chains run on a thread pool. A failing chain does not cancel the
    /// others; the first recorded error is reported.
    #[default]
    Parallel,
}

/// Where and what a chain writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Output directory. If empty a fresh directory in the system temp
    /// dir is used.
    pub output_dir: PathBuf,
    pub save_start_params: bool,
    pub save_warmup: bool,
    /// Write momenta and gradients of every saved draw.
    pub save_diagnostics: bool,
    /// Write the adapted step size and inverse metric after warmup.
    pub save_metric: bool,
}

/// Settings for a multi-chain NUTS run.
///
/// Immutable once chain construction begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub num_chains: usize,
    pub seed: u64,
    /// Unspecified initial values are drawn uniformly from
    /// `(-init_radius, init_radius)`.
    pub init_radius: f64,
    pub num_warmup: u64,
    pub num_samples: u64,
    pub thin: u64,
    /// Log progress every `refresh` iterations. 0 disables progress logs.
    pub refresh: u64,
    /// The maximum tree depth. The number of leapfrog steps is smaller
    /// than 2 ^ max_depth.
    pub max_depth: u64,
    pub stepsize: f64,
    pub stepsize_jitter: f64,
    pub step_size_adapt: DualAverageOptions,
    pub windows: WindowOptions,
    pub metric: MetricKind,
    pub inits: ResourceList,
    pub metric_files: ResourceList,
    pub output: OutputSettings,
    pub policy: SchedulePolicy,
    /// Worker threads for the parallel policy. 0 means one per chain.
    pub num_threads: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            num_chains: 1,
            seed: 1,
            init_radius: 2.,
            num_warmup: 1000,
            num_samples: 1000,
            thin: 1,
            refresh: 100,
            max_depth: 10,
            stepsize: 1.,
            stepsize_jitter: 0.,
            step_size_adapt: DualAverageOptions::default(),
            windows: WindowOptions::default(),
            metric: MetricKind::default(),
            inits: ResourceList::default(),
            metric_files: ResourceList::default(),
            output: OutputSettings::default(),
            policy: SchedulePolicy::default(),
            num_threads: 0,
        }
    }
}

fn require(
    ok: bool,
    name: &'static str,
    requirement: &'static str,
    value: f64,
) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            requirement,
            value,
        })
    }
}

impl RunSettings {
    /// Read settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every setting. No file is opened here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_chains == 0 {
            return Err(ConfigError::NoChains);
        }
        require(self.thin >= 1, "thin", "at least 1", self.thin as f64)?;
        if self.thin > self.num_samples {
            return Err(ConfigError::ThinExceedsSamples {
                thin: self.thin,
                samples: self.num_samples,
            });
        }
        require(
            self.init_radius.is_finite() && self.init_radius >= 0.,
            "init_radius",
            "finite and non-negative",
            self.init_radius,
        )?;
        require(
            self.max_depth >= 1,
            "max_depth",
            "at least 1",
            self.max_depth as f64,
        )?;
        require(
            self.stepsize.is_finite() && self.stepsize > 0.,
            "stepsize",
            "positive",
            self.stepsize,
        )?;
        require(
            (0. ..=1.).contains(&self.stepsize_jitter),
            "stepsize_jitter",
            "in [0, 1]",
            self.stepsize_jitter,
        )?;

        let da = &self.step_size_adapt;
        require(
            da.delta > 0. && da.delta < 1.,
            "delta",
            "in (0, 1)",
            da.delta,
        )?;
        require(da.gamma > 0., "gamma", "positive", da.gamma)?;
        require(da.kappa > 0., "kappa", "positive", da.kappa)?;
        require(da.t0 > 0., "t0", "positive", da.t0)?;

        let windows = &self.windows;
        require(
            windows.init_buffer >= 1,
            "init_buffer",
            "at least 1",
            windows.init_buffer as f64,
        )?;
        require(
            windows.term_buffer >= 1,
            "term_buffer",
            "at least 1",
            windows.term_buffer as f64,
        )?;
        require(
            windows.window >= 1,
            "window",
            "at least 1",
            windows.window as f64,
        )?;

        self.inits.check(ResourceKind::Inits, self.num_chains)?;
        self.metric_files
            .check(ResourceKind::Metric, self.num_chains)?;
        Ok(())
    }
}
