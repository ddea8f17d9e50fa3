//! Per-chain random streams and initial points.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;

use crate::math::all_finite;
use crate::model::{LogpError, Model};
use crate::resource::VarContext;

/// Attempts at finding a random initial point.
pub const MAX_INIT_TRIES: usize = 100;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("could not read initial values: {0:#}")]
    InitValues(anyhow::Error),
    #[error("expected {expected} initial values, the model returned {found}")]
    WrongLength { expected: usize, found: usize },
    #[error("initial value for parameter {index} is not finite")]
    NonFiniteValue { index: usize },
    #[error("no initial point with finite log density and gradient after {tries} attempts: {reason}")]
    NoValidPoint { tries: usize, reason: String },
    #[error("log density evaluation failed: {0}")]
    Logp(#[source] LogpError),
}

/// The random stream of one chain.
///
/// Depends only on the seed and the chain index, so chains can be created
/// in any order and on any thread.
pub fn chain_rng(seed: u64, chain_index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain_index as u64 + 1);
    rng
}

/// Find an initial point for a chain.
///
/// Coordinates given in `inits` are used as they are; the others are drawn
/// uniformly from `(-init_radius, init_radius)` until the log density and
/// its gradient are finite. A fully specified point is tried once.
pub fn initial_position<Mdl, R>(
    model: &Mdl,
    inits: &VarContext,
    init_radius: f64,
    rng: &mut R,
) -> Result<Box<[f64]>, InitError>
where
    Mdl: Model + ?Sized,
    R: Rng + ?Sized,
{
    let dim = model.dim();
    let specified = model.init_values(inits).map_err(InitError::InitValues)?;
    if specified.len() != dim {
        return Err(InitError::WrongLength {
            expected: dim,
            found: specified.len(),
        });
    }
    if let Some(index) = specified
        .iter()
        .position(|val| val.is_some_and(|val| !val.is_finite()))
    {
        return Err(InitError::NonFiniteValue { index });
    }

    let fully_specified = specified.iter().all(Option::is_some);
    let tries = if fully_specified || init_radius == 0. {
        1
    } else {
        MAX_INIT_TRIES
    };

    let mut position = vec![0f64; dim];
    let mut gradient = vec![0f64; dim];
    let mut reason = String::new();
    for attempt in 0..tries {
        for (pos, spec) in position.iter_mut().zip(&specified) {
            *pos = match spec {
                Some(val) => *val,
                None if init_radius > 0. => rng.random_range(-init_radius..init_radius),
                None => 0.,
            };
        }
        match model.log_density(&position, &mut gradient) {
            Ok(logp) if logp.is_finite() && all_finite(&gradient) => {
                debug!(attempt, "found initial point");
                return Ok(position.into());
            }
            Ok(logp) if !logp.is_finite() => {
                reason = format!("log density is {}", logp);
            }
            Ok(_) => {
                reason = "gradient is not finite".to_string();
            }
            Err(err) if err.is_recoverable() => {
                reason = err.to_string();
            }
            Err(err) => return Err(InitError::Logp(err)),
        }
    }
    Err(InitError::NoValidPoint { tries, reason })
}
