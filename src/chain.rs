//! Sampling of one chain.

use std::fmt::Write as _;

use itertools::Itertools;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::adapt::{WindowOptions, WindowSchedule, WindowStep};
use crate::hamiltonian::{Direction, Hamiltonian, State};
use crate::mass_matrix::{DenseMetric, DiagMetric, MassMatrix, MetricEstimator, UnitMetric};
use crate::metric::MetricKind;
use crate::model::{LogpError, Model};
use crate::nuts::{draw, AcceptanceRateCollector, NutsOptions, SampleInfo};
use crate::sampler::InterruptFlag;
use crate::settings::RunSettings;
use crate::stepsize::{jittered, DualAverage, DualAverageOptions};
use crate::storage::{MetricRecord, OutputSinkSet};

/// Sampler statistics written in front of the parameters of every draw.
pub const STAT_NAMES: [&str; 7] = [
    "lp__",
    "accept_stat__",
    "stepsize__",
    "treedepth__",
    "n_leapfrog__",
    "divergent__",
    "energy__",
];

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("sampling interrupted at iteration {iteration}")]
    Interrupted { iteration: u64 },
    #[error("log density evaluation failed: {0}")]
    Model(#[source] LogpError),
    #[error("could not write output: {0:#}")]
    Output(anyhow::Error),
}

/// The iterations a chain runs and which of them it saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    pub num_warmup: u64,
    pub num_samples: u64,
    pub thin: u64,
    pub save_warmup: bool,
    pub refresh: u64,
}

impl IterationPlan {
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            num_warmup: settings.num_warmup,
            num_samples: settings.num_samples,
            thin: settings.thin.max(1),
            save_warmup: settings.output.save_warmup,
            refresh: settings.refresh,
        }
    }

    fn total(&self) -> u64 {
        self.num_warmup + self.num_samples
    }

    /// Whether iteration `iteration` (0-based over warmup and sampling) is written.
    fn is_saved(&self, iteration: u64) -> bool {
        if iteration < self.num_warmup {
            self.save_warmup && iteration % self.thin == 0
        } else {
            (iteration - self.num_warmup) % self.thin == 0
        }
    }
}

/// Summary of a finished chain.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ChainStats {
    pub iterations: u64,
    pub saved_draws: u64,
    pub divergences: u64,
    pub max_depth_hits: u64,
    pub step_size: f64,
}

/// A NUTS sampler for one chain under the metric `M`.
pub struct ChainSampler<'m, Mdl: Model + ?Sized, M: MassMatrix> {
    hamiltonian: Hamiltonian<'m, Mdl, M>,
    param_names: Vec<String>,
    rng: ChaCha8Rng,
    state: State,
    chain: usize,
    nominal_step_size: f64,
    jitter: f64,
    options: NutsOptions,
    dual_average: DualAverageOptions,
    windows: Option<WindowOptions>,
}

impl<'m, Mdl: Model + ?Sized, M: MassMatrix> ChainSampler<'m, Mdl, M> {
    /// Create a sampler for chain `chain` (1-based) starting at `position`.
    pub fn new(
        model: &'m Mdl,
        metric: M,
        position: &[f64],
        rng: ChaCha8Rng,
        chain: usize,
    ) -> Result<Self, LogpError> {
        let hamiltonian = Hamiltonian::new(model, metric, 1.);
        let state = hamiltonian.init_state(position)?;
        Ok(Self {
            hamiltonian,
            param_names: model.param_names(),
            rng,
            state,
            chain,
            nominal_step_size: 1.,
            jitter: 0.,
            options: NutsOptions { maxdepth: 10 },
            dual_average: DualAverageOptions::default(),
            windows: None,
        })
    }

    pub fn set_nominal_stepsize(&mut self, step_size: f64) {
        self.nominal_step_size = step_size;
    }

    pub fn set_stepsize_jitter(&mut self, jitter: f64) {
        self.jitter = jitter;
    }

    pub fn set_max_depth(&mut self, max_depth: u64) {
        self.options.maxdepth = max_depth;
    }

    pub fn set_dual_averaging(&mut self, options: DualAverageOptions) {
        self.dual_average = options;
    }

    pub fn set_metric(&mut self, metric: M) {
        self.hamiltonian.metric = metric;
    }

    /// Enable windowed metric adaptation. Ignored by metrics that are
    /// never adapted.
    pub fn set_window_params(&mut self, windows: WindowOptions) {
        if M::KIND.adapts_windowed() {
            self.windows = Some(windows);
        }
    }

    pub fn metric(&self) -> &M {
        &self.hamiltonian.metric
    }

    pub fn chain(&self) -> usize {
        self.chain
    }

    pub fn position(&self) -> &[f64] {
        &self.state.q
    }

    pub fn nominal_stepsize(&self) -> f64 {
        self.nominal_step_size
    }

    /// Find a step size where a single leapfrog step has an acceptance
    /// probability close to 0.8, by doubling or halving.
    fn init_stepsize(&mut self) -> Result<(), ChainError> {
        let mut step_size = self.nominal_step_size;
        if !step_size.is_finite() || step_size <= 0. || step_size > 1e7 {
            return Ok(());
        }
        let target = 0.8f64.ln();
        let mut increase = None;
        for _ in 0..100 {
            self.hamiltonian.step_size = step_size;
            let mut start = self.state.clone();
            self.hamiltonian.randomize_momentum(&mut start, &mut self.rng);
            let initial_energy = start.energy();
            let delta = match self
                .hamiltonian
                .leapfrog(&start, Direction::Forward, initial_energy)
                .map_err(ChainError::Model)?
            {
                Ok(end) => initial_energy - end.energy(),
                Err(_) => f64::NEG_INFINITY,
            };
            let accept = delta > target;
            if *increase.get_or_insert(accept) != accept {
                break;
            }
            let next = if accept { 2. * step_size } else { 0.5 * step_size };
            if !(1e-10..=1e7).contains(&next) {
                warn!(
                    chain = self.chain,
                    step_size, "step size search did not converge"
                );
                break;
            }
            step_size = next;
        }
        self.nominal_step_size = step_size;
        Ok(())
    }

    fn header(&self) -> Vec<String> {
        STAT_NAMES
            .iter()
            .map(|name| name.to_string())
            .chain(self.param_names.iter().cloned())
            .collect()
    }

    fn diagnostics_header(&self) -> Vec<String> {
        let mut header = self.header();
        header.extend(self.param_names.iter().map(|name| format!("p_{}", name)));
        header.extend(self.param_names.iter().map(|name| format!("g_{}", name)));
        header
    }

    fn stats_row(&self, info: &SampleInfo, step_size: f64) -> Vec<f64> {
        let mut row = vec![
            self.state.logp(),
            info.accept_stat,
            step_size,
            info.depth as f64,
            info.n_leapfrog as f64,
            if info.divergence_info.is_some() { 1. } else { 0. },
            self.state.energy(),
        ];
        row.extend_from_slice(&self.state.q);
        row
    }

    fn adaptation_summary(&self) -> String {
        let mut text = String::from("Adaptation terminated\n");
        let _ = writeln!(text, "Step size = {}", self.nominal_step_size);
        match M::KIND {
            MetricKind::Unit => text.push_str("No free parameters for unit metric\n"),
            MetricKind::Diag => text.push_str("Diagonal elements of inverse mass matrix:\n"),
            MetricKind::Dense => text.push_str("Elements of inverse mass matrix:\n"),
        }
        if M::KIND != MetricKind::Unit {
            for row in self.hamiltonian.metric.inv_metric_rows() {
                let _ = writeln!(text, "{}", row.iter().join(", "));
            }
        }
        text
    }

    fn metric_record(&self) -> anyhow::Result<serde_json::Value> {
        let record = MetricRecord {
            stepsize: self.nominal_step_size,
            metric_type: M::KIND.name().to_string(),
            inv_metric: self.hamiltonian.metric.inv_metric_json(),
        };
        Ok(serde_json::to_value(record)?)
    }

    fn update_metric(&mut self, estimator: &mut M::Estimator) {
        if let Some(values) = estimator.estimate() {
            match M::from_values(self.hamiltonian.dim(), values) {
                Ok(metric) => self.hamiltonian.metric = metric,
                Err(err) => warn!(
                    chain = self.chain,
                    error = %err,
                    "keeping previous metric, estimate is not a valid metric"
                ),
            }
        }
        estimator.reset();
    }

    fn log_progress(&self, iteration: u64, plan: &IterationPlan) {
        if plan.refresh == 0 {
            return;
        }
        let done = iteration + 1;
        if done == 1 || done == plan.total() || done % plan.refresh == 0 {
            let phase = if iteration < plan.num_warmup {
                "Warmup"
            } else {
                "Sampling"
            };
            info!(
                chain = self.chain,
                "Iteration: {} / {} [{:3.0}%] ({})",
                done,
                plan.total(),
                100. * done as f64 / plan.total() as f64,
                phase
            );
        }
    }

    /// Run warmup and sampling, writing to `sinks`.
    ///
    /// The interrupt flag is checked before every iteration.
    pub fn run(
        &mut self,
        plan: &IterationPlan,
        interrupt: &InterruptFlag,
        sinks: &mut OutputSinkSet,
    ) -> Result<ChainStats, ChainError> {
        sinks
            .sample
            .write_header(&self.header())
            .map_err(ChainError::Output)?;
        sinks
            .diagnostics
            .write_header(&self.diagnostics_header())
            .map_err(ChainError::Output)?;

        if plan.num_warmup > 0 {
            self.init_stepsize()?;
        }
        let mut step_size_adapt = DualAverage::new(self.dual_average, self.nominal_step_size);
        let mut schedule = match self.windows {
            Some(windows) if plan.num_warmup > 0 => {
                WindowSchedule::new(windows, plan.num_warmup, self.chain)
            }
            _ => WindowSchedule::disabled(plan.num_warmup),
        };
        let mut estimator = self.hamiltonian.metric.new_estimator();
        let mut collector = AcceptanceRateCollector::new();

        if plan.num_warmup == 0 {
            let record = self.metric_record().map_err(ChainError::Output)?;
            sinks
                .metric
                .write_record(&record)
                .map_err(ChainError::Output)?;
        }

        let mut stats = ChainStats {
            iterations: 0,
            saved_draws: 0,
            divergences: 0,
            max_depth_hits: 0,
            step_size: self.nominal_step_size,
        };

        for iteration in 0..plan.total() {
            if interrupt.is_set() {
                return Err(ChainError::Interrupted { iteration });
            }
            let warmup = iteration < plan.num_warmup;

            let step_size = jittered(self.nominal_step_size, self.jitter, &mut self.rng);
            self.hamiltonian.step_size = step_size;
            let (next, info) = draw(
                &mut self.state,
                &mut self.rng,
                &self.hamiltonian,
                &self.options,
                &mut collector,
            )
            .map_err(ChainError::Model)?;
            self.state = next;
            stats.iterations += 1;
            if !warmup {
                stats.divergences += info.divergence_info.is_some() as u64;
                stats.max_depth_hits += info.reached_maxdepth as u64;
            }

            if plan.is_saved(iteration) {
                let row = self.stats_row(&info, step_size);
                sinks.sample.write_row(&row).map_err(ChainError::Output)?;
                let mut diag_row = row;
                diag_row.extend_from_slice(&self.state.p);
                diag_row.extend_from_slice(&self.state.grad);
                sinks
                    .diagnostics
                    .write_row(&diag_row)
                    .map_err(ChainError::Output)?;
                stats.saved_draws += 1;
            }

            if warmup {
                step_size_adapt.advance(info.accept_stat);
                self.nominal_step_size = step_size_adapt.current_step_size();
                match schedule.step() {
                    WindowStep::Skip => {}
                    WindowStep::Collect => estimator.observe(&self.state.q),
                    WindowStep::CollectAndUpdate => {
                        estimator.observe(&self.state.q);
                        self.update_metric(&mut estimator);
                        self.init_stepsize()?;
                        step_size_adapt.reset(self.nominal_step_size);
                    }
                }

                if iteration + 1 == plan.num_warmup {
                    self.nominal_step_size = step_size_adapt.current_step_size_adapted();
                    sinks
                        .sample
                        .write_comment(&self.adaptation_summary())
                        .map_err(ChainError::Output)?;
                    let record = self.metric_record().map_err(ChainError::Output)?;
                    sinks
                        .metric
                        .write_record(&record)
                        .map_err(ChainError::Output)?;
                }
            }

            self.log_progress(iteration, plan);
        }

        stats.step_size = self.nominal_step_size;
        Ok(stats)
    }
}

/// A chain sampler under one of the three metric strategies.
pub enum AnySampler<'m, Mdl: Model + ?Sized> {
    Unit(ChainSampler<'m, Mdl, UnitMetric>),
    Diag(ChainSampler<'m, Mdl, DiagMetric>),
    Dense(ChainSampler<'m, Mdl, DenseMetric>),
}

impl<Mdl: Model + ?Sized> AnySampler<'_, Mdl> {
    pub fn kind(&self) -> MetricKind {
        match self {
            AnySampler::Unit(_) => MetricKind::Unit,
            AnySampler::Diag(_) => MetricKind::Diag,
            AnySampler::Dense(_) => MetricKind::Dense,
        }
    }

    pub fn chain(&self) -> usize {
        match self {
            AnySampler::Unit(sampler) => sampler.chain(),
            AnySampler::Diag(sampler) => sampler.chain(),
            AnySampler::Dense(sampler) => sampler.chain(),
        }
    }

    pub fn run(
        &mut self,
        plan: &IterationPlan,
        interrupt: &InterruptFlag,
        sinks: &mut OutputSinkSet,
    ) -> Result<ChainStats, ChainError> {
        match self {
            AnySampler::Unit(sampler) => sampler.run(plan, interrupt, sinks),
            AnySampler::Diag(sampler) => sampler.run(plan, interrupt, sinks),
            AnySampler::Dense(sampler) => sampler.run(plan, interrupt, sinks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::chain_rng;
    use crate::model::test_logps::{FailingLogp, NormalLogp, ScaledNormalLogp};
    use crate::settings::OutputSettings;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn plan(num_warmup: u64, num_samples: u64) -> IterationPlan {
        IterationPlan {
            num_warmup,
            num_samples,
            thin: 1,
            save_warmup: false,
            refresh: 0,
        }
    }

    #[test]
    fn saved_iterations() {
        let plan = IterationPlan {
            num_warmup: 10,
            num_samples: 10,
            thin: 3,
            save_warmup: true,
            refresh: 0,
        };
        let saved: Vec<u64> = (0..20).filter(|&i| plan.is_saved(i)).collect();
        assert_eq!(saved, vec![0, 3, 6, 9, 10, 13, 16, 19]);
        let no_warmup = IterationPlan {
            save_warmup: false,
            ..plan
        };
        assert_eq!((0..20).filter(|&i| no_warmup.is_saved(i)).count(), 4);
    }

    #[test]
    fn diag_adaptation_learns_scales() {
        let model = ScaledNormalLogp::new(vec![0.1, 10.]);
        let mut sampler =
            ChainSampler::new(&model, DiagMetric::identity(2), &[0., 0.], chain_rng(1, 0), 1)
                .unwrap();
        sampler.set_window_params(WindowOptions::default());
        let mut sinks = OutputSinkSet::null();
        let stats = sampler
            .run(&plan(1000, 100), &InterruptFlag::new(), &mut sinks)
            .unwrap();

        assert_eq!(stats.iterations, 1100);
        assert_eq!(stats.saved_draws, 100);
        let inv_metric = sampler.metric().inv_metric();
        assert!(inv_metric[0] < 0.1);
        assert!(inv_metric[1] > 10.);
    }

    #[test]
    fn unit_metric_is_never_adapted() {
        let model = ScaledNormalLogp::new(vec![0.1, 10.]);
        let mut sampler =
            ChainSampler::new(&model, UnitMetric::identity(2), &[0., 0.], chain_rng(1, 0), 1)
                .unwrap();
        sampler.set_window_params(WindowOptions::default());
        assert!(sampler.windows.is_none());
        sampler
            .run(&plan(200, 10), &InterruptFlag::new(), &mut OutputSinkSet::null())
            .unwrap();
        assert_eq!(sampler.metric(), &UnitMetric::identity(2));
    }

    #[test]
    fn supplied_metric_is_kept_without_warmup() {
        let model = NormalLogp::new(2, 0.);
        let mut sampler =
            ChainSampler::new(&model, DiagMetric::identity(2), &[0., 0.], chain_rng(1, 1), 2)
                .unwrap();
        let metric = DiagMetric::from_values(2, vec![4., 0.25]).unwrap();
        sampler.set_metric(metric.clone());
        sampler.set_window_params(WindowOptions::default());

        let mut sampler = AnySampler::Diag(sampler);
        assert_eq!(sampler.kind(), MetricKind::Diag);
        assert_eq!(sampler.chain(), 2);
        let stats = sampler
            .run(&plan(0, 10), &InterruptFlag::new(), &mut OutputSinkSet::null())
            .unwrap();
        assert_eq!(stats.saved_draws, 10);

        let AnySampler::Diag(sampler) = sampler else {
            panic!("sampler changed its metric kind");
        };
        assert_eq!(sampler.metric(), &metric);
    }

    #[test]
    fn writes_sample_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputSettings {
            output_dir: dir.path().to_path_buf(),
            save_diagnostics: true,
            save_metric: true,
            ..Default::default()
        };
        let model = NormalLogp::new(2, 0.);
        let mut sampler =
            ChainSampler::new(&model, DiagMetric::identity(2), &[0., 0.], chain_rng(3, 0), 1)
                .unwrap();
        sampler.set_window_params(WindowOptions::default());
        let mut sinks = OutputSinkSet::create(&output, "normal", "t", 1).unwrap();
        let paths = sinks.paths();
        sampler
            .run(&plan(50, 20), &InterruptFlag::new(), &mut sinks)
            .unwrap();
        sinks.close().unwrap();

        let text = std::fs::read_to_string(&paths.sample).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,x.1,x.2"
        );
        assert_eq!(lines.next().unwrap(), "# Adaptation terminated");
        let rows = text.lines().filter(|line| !line.starts_with('#')).count();
        assert_eq!(rows, 21);

        let diag = std::fs::read_to_string(paths.diagnostics.unwrap()).unwrap();
        let header = diag.lines().next().unwrap();
        assert!(header.ends_with("x.1,x.2,p_x.1,p_x.2,g_x.1,g_x.2"));
        assert_eq!(diag.lines().count(), 21);

        let metric: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(paths.metric.unwrap()).unwrap())
                .unwrap();
        assert_eq!(metric["metric_type"], "diag_e");
        assert_eq!(metric["inv_metric"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn interrupt_stops_chain() {
        let model = NormalLogp::new(2, 0.);
        let mut sampler =
            ChainSampler::new(&model, DiagMetric::identity(2), &[0., 0.], chain_rng(1, 0), 1)
                .unwrap();
        let interrupt = InterruptFlag::new();
        interrupt.set();
        let err = sampler
            .run(&plan(10, 10), &interrupt, &mut OutputSinkSet::null())
            .unwrap_err();
        assert!(matches!(err, ChainError::Interrupted { iteration: 0 }));
    }

    #[test]
    fn model_failure_fails_chain() {
        let model = FailingLogp::new(2, 20);
        let mut sampler =
            ChainSampler::new(&model, DenseMetric::identity(2), &[0., 0.], chain_rng(1, 0), 1)
                .unwrap();
        let err = sampler
            .run(&plan(100, 100), &InterruptFlag::new(), &mut OutputSinkSet::null())
            .unwrap_err();
        assert!(matches!(err, ChainError::Model(_)));
    }

    #[test]
    fn sampling_without_warmup_keeps_step_size() {
        let model = NormalLogp::new(1, 2.);
        let mut sampler =
            ChainSampler::new(&model, UnitMetric::identity(1), &[2.], chain_rng(5, 0), 1).unwrap();
        sampler.set_nominal_stepsize(0.7);
        let stats = sampler
            .run(&plan(0, 500), &InterruptFlag::new(), &mut OutputSinkSet::null())
            .unwrap();
        assert_eq!(stats.step_size, 0.7);
        assert_eq!(stats.saved_draws, 500);
        assert_abs_diff_eq!(sampler.position()[0], 2., epsilon = 5.);
    }
}
