//! Minibatch index selection for stochastic variational updates.
//!
//! A minibatch is a random subset of location indices plus the set of
//! observed pairs whose both endpoints fall inside that subset. A subset
//! containing zero such pairs carries no gradient signal, so draws are
//! rejected and retried — but only up to a bound: past it, the data cannot
//! support minibatching at the requested size and the fit fails loudly
//! instead of looping forever.

use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::error::ModelError;

/// Maximum redraw attempts before a minibatch draw is declared exhausted.
pub const MAX_MINIBATCH_RETRIES: usize = 100;

/// A location subset and the observed pairs it fully contains.
/// Lifetime: one stochastic update iteration.
#[derive(Debug, Clone)]
pub struct Minibatch {
    /// Selected location indices, sorted ascending.
    pub loc_idxs: Vec<usize>,
    /// Positions of the observed pairs with both endpoints in `loc_idxs`.
    pub pair_idxs: Vec<usize>,
}

/// Positions of the pairs whose both endpoints are in `loc_idxs` (sorted).
fn pair_membership(loc_idxs: &[usize], pref_v: &[usize], pref_u: &[usize]) -> Vec<usize> {
    let inside = |idx: usize| loc_idxs.binary_search(&idx).is_ok();
    pref_v
        .iter()
        .zip(pref_u.iter())
        .enumerate()
        .filter(|(_, (&v, &u))| inside(v) && inside(u))
        .map(|(i, _)| i)
        .collect()
}

/// Recompute the pair-membership mask for a pinned (fixed) location subset.
/// Fails when the pinned subset contains no observed pair at all.
pub fn pinned(
    loc_idxs: &[usize],
    pref_v: &[usize],
    pref_u: &[usize],
) -> Result<Minibatch, ModelError> {
    let mut loc_idxs = loc_idxs.to_vec();
    loc_idxs.sort_unstable();
    loc_idxs.dedup();

    let pair_idxs = pair_membership(&loc_idxs, pref_v, pref_u);
    if pair_idxs.is_empty() {
        return Err(ModelError::MinibatchExhausted { attempts: 0 });
    }
    Ok(Minibatch {
        loc_idxs,
        pair_idxs,
    })
}

/// Draw a fixed-size location subset without replacement, redrawing until it
/// contains at least one observed pair. Bounded by
/// [`MAX_MINIBATCH_RETRIES`].
pub fn draw(
    n_locs: usize,
    size: usize,
    pref_v: &[usize],
    pref_u: &[usize],
    rng: &mut StdRng,
) -> Result<Minibatch, ModelError> {
    if n_locs < 2 || pref_v.is_empty() {
        // No subset can ever contain a compared pair.
        return Err(ModelError::MinibatchExhausted { attempts: 0 });
    }
    let size = size.min(n_locs).max(2);

    for _ in 0..MAX_MINIBATCH_RETRIES {
        let mut loc_idxs = sample(rng, n_locs, size).into_vec();
        loc_idxs.sort_unstable();
        let pair_idxs = pair_membership(&loc_idxs, pref_v, pref_u);
        if !pair_idxs.is_empty() {
            return Ok(Minibatch {
                loc_idxs,
                pair_idxs,
            });
        }
    }
    Err(ModelError::MinibatchExhausted {
        attempts: MAX_MINIBATCH_RETRIES,
    })
}
