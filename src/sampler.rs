//! Orchestration of a multi-chain run.
//!
//! A run moves through `Constructed → Initializing → Running → {Completed,
//! Failed}`. Configuration errors and required resources are checked first,
//! then every chain is initialized in index order, and finally the chains
//! are executed, inline for a single chain and according to the
//! [`SchedulePolicy`] otherwise.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::chain::{AnySampler, ChainError, ChainSampler, ChainStats, IterationPlan};
use crate::error::{RunError, STATUS_SUCCESS};
use crate::init::{chain_rng, initial_position, InitError};
use crate::mass_matrix::{DenseMetric, DiagMetric, MassMatrix, UnitMetric};
use crate::metric::{configure_metric, MetricKind, MetricSource};
use crate::model::Model;
use crate::resource::{
    JsonResourceParser, LoadedResource, ResourceKind, ResourceParser, ResourceResolver, VarContext,
};
use crate::settings::{OutputSettings, RunSettings, SchedulePolicy};
use crate::storage::{ensure_output_dir, generate_timestamp, OutputPaths, OutputSinkSet};

/// A shared interrupt signal, checked by every chain once per iteration.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask all chains to stop.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The outcome of one chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    /// 1-based chain ordinal.
    pub chain: usize,
    pub initial_position: Vec<f64>,
    pub metric_source: MetricSource,
    pub outputs: OutputPaths,
    pub stats: ChainStats,
}

/// The outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model_name: String,
    pub timestamp: String,
    pub output_dir: PathBuf,
    pub metric: MetricKind,
    /// One report per chain, in chain order.
    pub chains: Vec<ChainReport>,
}

/// Status code and diagnostic of a finished run.
pub fn exit_status<T>(result: &Result<T, RunError>) -> (i32, Option<String>) {
    match result {
        Ok(_) => (STATUS_SUCCESS, None),
        Err(err) => (err.status_code(), Some(err.to_string())),
    }
}

/// Run all chains with the default JSON resource parser.
pub fn sample<Mdl: Model + ?Sized>(
    model: &Mdl,
    settings: &RunSettings,
) -> Result<RunReport, RunError> {
    MultiChainRun::new(model, settings).run()
}

/// One initialized chain, ready to run.
struct ChainUnit<'m, Mdl: Model + ?Sized> {
    sampler: AnySampler<'m, Mdl>,
    sinks: OutputSinkSet,
    initial_position: Vec<f64>,
    metric_source: MetricSource,
}

impl<Mdl: Model + ?Sized> ChainUnit<'_, Mdl> {
    /// Run the chain. The sinks are closed on every exit path.
    fn execute(
        mut self,
        plan: &IterationPlan,
        interrupt: &InterruptFlag,
    ) -> Result<ChainReport, RunError> {
        let chain = self.sampler.chain();
        info!(chain, metric = %self.sampler.kind(), "starting chain");
        let start = Instant::now();
        let result = self.sampler.run(plan, interrupt, &mut self.sinks);
        let outputs = self.sinks.paths();
        let closed = self.sinks.close();

        let stats = result.map_err(|source| RunError::Chain { chain, source })?;
        closed.map_err(|err| RunError::Chain {
            chain,
            source: ChainError::Output(err),
        })?;
        info!(
            chain,
            elapsed = ?start.elapsed(),
            divergences = stats.divergences,
            step_size = stats.step_size,
            "chain finished"
        );

        Ok(ChainReport {
            chain,
            initial_position: self.initial_position,
            metric_source: self.metric_source,
            outputs,
            stats,
        })
    }
}

/// Builder for a multi-chain run.
pub struct MultiChainRun<'a, Mdl: Model + ?Sized> {
    model: &'a Mdl,
    settings: &'a RunSettings,
    parser: &'a dyn ResourceParser,
    interrupt: InterruptFlag,
    timestamp: Option<String>,
}

impl<'a, Mdl: Model + ?Sized> MultiChainRun<'a, Mdl> {
    pub fn new(model: &'a Mdl, settings: &'a RunSettings) -> Self {
        Self {
            model,
            settings,
            parser: &JsonResourceParser,
            interrupt: InterruptFlag::new(),
            timestamp: None,
        }
    }

    /// Read init and metric files with `parser`.
    pub fn with_parser(mut self, parser: &'a dyn ResourceParser) -> Self {
        self.parser = parser;
        self
    }

    /// Share an interrupt flag with the caller.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Use a fixed timestamp in output file names.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Validate, initialize every chain and run them. Blocks until all
    /// chains have finished.
    pub fn run(self) -> Result<RunReport, RunError> {
        let settings = self.settings;
        settings.validate()?;

        let timestamp = self.timestamp.clone().unwrap_or_else(generate_timestamp);
        let model_name = self.model.name().to_string();

        if self.model.dim() == 0 {
            info!(model = %model_name, "Model contains no parameters, nothing to sample");
            return Ok(RunReport {
                model_name,
                timestamp,
                output_dir: settings.output.output_dir.clone(),
                metric: settings.metric,
                chains: vec![],
            });
        }

        let num_chains = settings.num_chains;
        let mut resolver = ResourceResolver::new(self.parser);
        let inits = resolver.resolve_required(&settings.inits, ResourceKind::Inits, num_chains)?;
        let metrics =
            resolver.resolve_all(&settings.metric_files, ResourceKind::Metric, num_chains)?;
        debug!(files = resolver.files_parsed(), "resolved resources");

        let output = OutputSettings {
            output_dir: ensure_output_dir(&settings.output.output_dir)?,
            ..settings.output.clone()
        };

        info!(
            model = %model_name,
            chains = num_chains,
            output_dir = ?output.output_dir,
            num_warmup = settings.num_warmup,
            num_samples = settings.num_samples,
            metric = %settings.metric,
            "starting run"
        );
        let start = Instant::now();

        let mut units = Vec::with_capacity(num_chains);
        for (chain_index, (inits, metric)) in inits.iter().zip(&metrics).enumerate() {
            units.push(self.initialize_chain(chain_index, inits, metric, &output, &timestamp)?);
        }

        let plan = IterationPlan::from_settings(settings);
        let chains = match settings.policy {
            _ if num_chains == 1 => run_sequential(units, &plan, &self.interrupt)?,
            SchedulePolicy::Sequential => run_sequential(units, &plan, &self.interrupt)?,
            SchedulePolicy::Parallel => {
                run_parallel(units, &plan, &self.interrupt, settings.num_threads)?
            }
        };

        info!(elapsed = ?start.elapsed(), chains = chains.len(), "run finished");
        Ok(RunReport {
            model_name,
            timestamp,
            output_dir: output.output_dir,
            metric: settings.metric,
            chains,
        })
    }

    fn initialize_chain(
        &self,
        chain_index: usize,
        inits: &VarContext,
        metric: &LoadedResource,
        output: &OutputSettings,
        timestamp: &str,
    ) -> Result<ChainUnit<'a, Mdl>, RunError> {
        let chain = chain_index + 1;
        let model = self.model;
        let settings = self.settings;

        let mut rng = chain_rng(settings.seed, chain_index);
        debug!(chain, seed = settings.seed, stream = chain_index + 1, "derived random stream");
        let mut sinks = OutputSinkSet::create(output, model.name(), timestamp, chain)?;

        let position = initial_position(model, inits, settings.init_radius, &mut rng)
            .map_err(|source| RunError::Initialization { chain, source })?;
        let start_params = sinks
            .start_params
            .write_header(&model.param_names())
            .and_then(|_| sinks.start_params.write_row(&position));
        start_params.map_err(|err| RunError::Chain {
            chain,
            source: ChainError::Output(err),
        })?;

        let (sampler, metric_source) = match settings.metric {
            MetricKind::Unit => {
                let (sampler, source) =
                    self.build_sampler::<UnitMetric>(chain, metric, &position, rng)?;
                (AnySampler::Unit(sampler), source)
            }
            MetricKind::Diag => {
                let (sampler, source) =
                    self.build_sampler::<DiagMetric>(chain, metric, &position, rng)?;
                (AnySampler::Diag(sampler), source)
            }
            MetricKind::Dense => {
                let (sampler, source) =
                    self.build_sampler::<DenseMetric>(chain, metric, &position, rng)?;
                (AnySampler::Dense(sampler), source)
            }
        };

        Ok(ChainUnit {
            sampler,
            sinks,
            initial_position: position.to_vec(),
            metric_source,
        })
    }

    fn build_sampler<M: MassMatrix>(
        &self,
        chain: usize,
        metric: &LoadedResource,
        position: &[f64],
        rng: ChaCha8Rng,
    ) -> Result<(ChainSampler<'a, Mdl, M>, MetricSource), RunError> {
        let settings = self.settings;
        let (metric, source) = configure_metric::<M>(metric, self.model.dim(), chain)
            .map_err(|source| RunError::MetricValidation { chain, source })?;

        let mut sampler = ChainSampler::new(self.model, metric, position, rng, chain).map_err(
            |err| RunError::Initialization {
                chain,
                source: InitError::Logp(err),
            },
        )?;
        sampler.set_nominal_stepsize(settings.stepsize);
        sampler.set_stepsize_jitter(settings.stepsize_jitter);
        sampler.set_max_depth(settings.max_depth);
        sampler.set_dual_averaging(settings.step_size_adapt);
        sampler.set_window_params(settings.windows);
        Ok((sampler, source))
    }
}

/// Run chains one after the other, stopping at the first failure.
fn run_sequential<Mdl: Model + ?Sized>(
    units: Vec<ChainUnit<'_, Mdl>>,
    plan: &IterationPlan,
    interrupt: &InterruptFlag,
) -> Result<Vec<ChainReport>, RunError> {
    units
        .into_iter()
        .map(|unit| unit.execute(plan, interrupt))
        .collect()
}

/// Run chains on a thread pool. Chains that are already running are not
/// cancelled when another chain fails; the first recorded error is returned.
fn run_parallel<Mdl: Model + ?Sized>(
    units: Vec<ChainUnit<'_, Mdl>>,
    plan: &IterationPlan,
    interrupt: &InterruptFlag,
    num_threads: usize,
) -> Result<Vec<ChainReport>, RunError> {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let num_threads = if num_threads == 0 {
        units.len().min(available)
    } else {
        num_threads
    };
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("nuts-chain-{}", i))
        .build()?;

    let first_error: OnceLock<RunError> = OnceLock::new();
    let reports: Vec<Option<ChainReport>> = pool.install(|| {
        units
            .into_par_iter()
            .map(|unit| match unit.execute(plan, interrupt) {
                Ok(report) => Some(report),
                Err(err) => {
                    let _ = first_error.set(err);
                    None
                }
            })
            .collect()
    });

    if let Some(err) = first_error.into_inner() {
        return Err(err);
    }
    Ok(reports.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_logps::{FixedParamModel, NormalLogp};
    use crate::resource::{ResourceError, ResourceList, Variable};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    struct MapParser;

    impl ResourceParser for MapParser {
        fn parse(&self, path: &Path) -> Result<VarContext, ResourceError> {
            match path.to_str() {
                Some("init.json") => Ok(VarContext::from_vars([(
                    "x",
                    Variable::vector(vec![0.5, -0.5]),
                )])),
                _ => Err(ResourceError::Missing(path.to_path_buf())),
            }
        }
    }

    fn settings(dir: &Path) -> RunSettings {
        RunSettings {
            num_chains: 2,
            num_warmup: 30,
            num_samples: 20,
            refresh: 0,
            output: OutputSettings {
                output_dir: dir.to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn interrupt_flag_is_shared() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
    }

    #[test]
    fn custom_parser_for_inits() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunSettings {
            inits: ResourceList::new(["init.json"]),
            ..settings(dir.path())
        };
        let model = NormalLogp::new(2, 0.);
        let report = MultiChainRun::new(&model, &settings)
            .with_parser(&MapParser)
            .with_timestamp("t")
            .run()
            .unwrap();
        assert_eq!(report.chains.len(), 2);
        for chain in &report.chains {
            assert_eq!(chain.initial_position, vec![0.5, -0.5]);
        }
    }

    #[test]
    fn missing_init_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunSettings {
            inits: ResourceList::new(["other.json"]),
            ..settings(dir.path())
        };
        let model = NormalLogp::new(2, 0.);
        let result = MultiChainRun::new(&model, &settings)
            .with_parser(&MapParser)
            .run();
        let (status, message) = exit_status(&result);
        assert_eq!(status, crate::error::STATUS_PARSING);
        assert!(message.unwrap().contains("other.json"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn fixed_param_model_samples_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample(&FixedParamModel, &settings(dir.path())).unwrap();
        assert!(report.chains.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
