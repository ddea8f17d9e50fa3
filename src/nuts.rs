use crate::hamiltonian::{Direction, DivergenceInfo, Hamiltonian, State};
use crate::mass_matrix::MassMatrix;
use crate::math::logaddexp;
use crate::model::{LogpError, Model};
use crate::stepsize::RunningMean;

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,

    /// Mean acceptance probability over all leapfrog steps of the trajectory.
    pub accept_stat: f64,

    pub n_leapfrog: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
}

/// Collects the acceptance statistic of a trajectory.
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    mean: RunningMean,
    n_leapfrog: u64,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
            n_leapfrog: 0,
        }
    }

    fn register_init(&mut self, state: &State) {
        self.initial_energy = state.energy();
        self.mean.reset();
        self.n_leapfrog = 0;
    }

    fn register_leapfrog(&mut self, end: Option<&State>) {
        self.n_leapfrog += 1;
        match end {
            None => self.mean.add(0.),
            Some(end) => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        }
    }
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(LogpError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    fn extend<R, Mdl, M>(
        mut self,
        rng: &mut R,
        hamiltonian: &Hamiltonian<'_, Mdl, M>,
        direction: Direction,
        collector: &mut AcceptanceRateCollector,
    ) -> ExtendResult
    where
        R: rand::Rng + ?Sized,
        Mdl: Model + ?Sized,
        M: MassMatrix,
    {
        let mut other = match self.single_step(hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(rng, hamiltonian, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.idx_in_trajectory <= self.right.idx_in_trajectory);
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // The main tree uses biased progressive sampling, subtrees
        // sample uniformly from their points.
        let self_log_size = if self.is_main {
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp())
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    fn single_step<Mdl, M>(
        &self,
        hamiltonian: &Hamiltonian<'_, Mdl, M>,
        direction: Direction,
        collector: &mut AcceptanceRateCollector,
    ) -> Result<Result<NutsTree, DivergenceInfo>, LogpError>
    where
        Mdl: Model + ?Sized,
        M: MassMatrix,
    {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, self.initial_energy)? {
            Ok(end) => end,
            Err(info) => {
                collector.register_leapfrog(None);
                return Ok(Err(info));
            }
        };
        collector.register_leapfrog(Some(&end));

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(
        &self,
        maxdepth: bool,
        divergence_info: Option<DivergenceInfo>,
        collector: &AcceptanceRateCollector,
    ) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            accept_stat: collector.mean.current(),
            n_leapfrog: collector.n_leapfrog,
        }
    }
}

/// Draw the next point of the chain starting at `init`.
///
/// The momentum of `init` is resampled.
pub(crate) fn draw<R, Mdl, M>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &Hamiltonian<'_, Mdl, M>,
    options: &NutsOptions,
    collector: &mut AcceptanceRateCollector,
) -> Result<(State, SampleInfo), LogpError>
where
    R: rand::Rng + ?Sized,
    Mdl: Model + ?Sized,
    M: MassMatrix,
{
    hamiltonian.randomize_momentum(init, rng);
    collector.register_init(init);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None, collector);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info), collector);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None, collector);
    Ok((tree.draw, info))
}
