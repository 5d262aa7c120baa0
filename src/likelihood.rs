//! Probit pairwise-preference likelihood.
//!
//! Maps latent function values at two indexed locations to the probability
//! that the first is preferred: `Phi((f[v] - f[u]) / sqrt(2))`. The `sqrt(2)`
//! comes from summing two independent unit-variance noise terms, one per
//! compared item; it is a fixed design constant, not a hyperparameter — any
//! output-scale hyperparameter is absorbed into the scale of `f` itself.
//!
//! Two computation modes are kept deliberately distinct: the sparse indexed
//! path over observed pairs (O(number of pairs)) and the dense outer-product
//! path over an entire index domain (O(n^2), exhaustive comparison).

use std::f64::consts::{PI, SQRT_2};

use nalgebra::{DMatrix, DVector};
use statrs::function::erf::erf;

use crate::engine::ObservationModel;
use crate::locations::ObservedPairs;
use crate::minibatch::Minibatch;

/// Probabilities are clipped into `[PROB_EPS, 1 - PROB_EPS]` before any
/// logarithm ("tempering"), so the lower bound never sees `-inf` or NaN.
pub const PROB_EPS: f64 = 1e-10;

pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

pub(crate) fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

/// Clip a probability away from exactly 0 and 1.
pub fn temper_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

/// Tempered copy of a probability vector.
pub fn temper_probs(p: &DVector<f64>) -> DVector<f64> {
    p.map(temper_prob)
}

/// Sparse forward model: probability that the `v`-endpoint of each indexed
/// pair is preferred, plus the raw linearization argument
/// `g = (f[v] - f[u]) / sqrt(2)` for reuse by the Jacobian builder.
pub fn pair_likelihood(
    f: &DVector<f64>,
    v: &[usize],
    u: &[usize],
) -> (DVector<f64>, DVector<f64>) {
    debug_assert_eq!(v.len(), u.len());
    let g = DVector::from_iterator(
        v.len(),
        v.iter().zip(u.iter()).map(|(&a, &b)| (f[a] - f[b]) / SQRT_2),
    );
    let phi = g.map(normal_cdf);
    (phi, g)
}

/// Dense exhaustive mode: `Phi((f_i - f_j) / sqrt(2))` over the full outer
/// product of the index domain.
pub fn likelihood_matrix(f: &DVector<f64>) -> DMatrix<f64> {
    let n = f.len();
    DMatrix::from_fn(n, n, |i, j| normal_cdf((f[i] - f[j]) / SQRT_2))
}

/// Dense mode restricted to a location subset: slices `f` before the outer
/// product.
pub fn likelihood_matrix_subset(f: &DVector<f64>, subset: &[usize]) -> DMatrix<f64> {
    let n = subset.len();
    DMatrix::from_fn(n, n, |i, j| {
        normal_cdf((f[subset[i]] - f[subset[j]]) / SQRT_2)
    })
}

/// Restrict explicit pair index arrays to pairs whose both endpoints belong
/// to `subset` (which must be sorted ascending). Returns the kept pair
/// positions.
pub fn filter_pairs(v: &[usize], u: &[usize], subset: &[usize]) -> Vec<usize> {
    debug_assert!(subset.windows(2).all(|w| w[0] < w[1]));
    let inside = |idx: usize| subset.binary_search(&idx).is_ok();
    v.iter()
        .zip(u.iter())
        .enumerate()
        .filter(|(_, (&a, &b))| inside(a) && inside(b))
        .map(|(i, _)| i)
        .collect()
}

/// Per-instance observation state for the pairwise-preference model: the
/// canonical pair indices and counts, the observed positive fractions `z`,
/// the Beta pseudo-count noise prior, and the cached Jacobian blend.
#[derive(Debug, Clone)]
pub struct PairwiseObservations {
    pref_v: Vec<usize>,
    pref_u: Vec<usize>,
    poscounts: DVector<f64>,
    totals: DVector<f64>,
    /// Observed fraction of comparisons won by the `v` endpoint.
    z: DVector<f64>,
    n_locs: usize,
    /// Beta pseudo-counts `(b, a)` per pair, set once at fit initialization.
    nu0: Option<(DVector<f64>, DVector<f64>)>,
    /// Blended Jacobian from previous iterations; empty until first refresh.
    g: DMatrix<f64>,
}

impl PairwiseObservations {
    pub fn new(pairs: &ObservedPairs) -> Self {
        let m = pairs.len();
        let poscounts = DVector::from_iterator(m, pairs.poscounts.iter().copied());
        let totals = DVector::from_iterator(m, pairs.totals.iter().copied());
        let z = DVector::from_iterator(
            m,
            pairs
                .poscounts
                .iter()
                .zip(pairs.totals.iter())
                .map(|(&p, &t)| if t > 0.0 { p / t } else { 0.5 }),
        );
        Self {
            pref_v: pairs.pref_v.clone(),
            pref_u: pairs.pref_u.clone(),
            poscounts,
            totals,
            z,
            n_locs: pairs.n_locations(),
            nu0: None,
            g: DMatrix::zeros(0, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.pref_v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pref_v.is_empty()
    }

    pub fn n_locations(&self) -> usize {
        self.n_locs
    }

    pub fn endpoints(&self) -> (&[usize], &[usize]) {
        (&self.pref_v, &self.pref_u)
    }

    pub fn targets(&self) -> (&DVector<f64>, &DVector<f64>) {
        (&self.z, &self.totals)
    }

    pub fn counts(&self) -> (&DVector<f64>, &DVector<f64>) {
        (&self.poscounts, &self.totals)
    }

    /// Install the pairwise-noise prior pseudo-counts `(b, a)`. Read-only
    /// afterwards.
    pub fn set_noise_prior(&mut self, b: DVector<f64>, a: DVector<f64>) {
        debug_assert_eq!(b.len(), self.len());
        debug_assert_eq!(a.len(), self.len());
        self.nu0 = Some((b, a));
    }

    /// Forward model at the given mean, over all observed pairs.
    pub fn forward(&self, f: &DVector<f64>) -> DVector<f64> {
        pair_likelihood(f, &self.pref_v, &self.pref_u).0
    }

    /// Rebuild the first-order linearization of the forward model about the
    /// current mean and blend it with the cached Jacobian at `update_rate`
    /// (outright replacement on first build or shape change). Returns the
    /// probability vector for the active pairs, computed once here and reused
    /// by the caller for the residual term.
    ///
    /// When `scope` is given, rows are restricted to the pairs inside the
    /// minibatch and the signed endpoint indicator is computed against the
    /// minibatch's location indices rather than the full location list.
    pub fn refresh_jacobian(
        &mut self,
        f: &DVector<f64>,
        scope: Option<&Minibatch>,
        update_rate: f64,
    ) -> DVector<f64> {
        let full_pairs: Vec<usize>;
        let full_locs: Vec<usize>;
        let (pair_idxs, loc_idxs): (&[usize], &[usize]) = match scope {
            Some(mb) => (&mb.pair_idxs, &mb.loc_idxs),
            None => {
                full_pairs = (0..self.len()).collect();
                full_locs = (0..self.n_locs).collect();
                (&full_pairs, &full_locs)
            }
        };

        let v_active: Vec<usize> = pair_idxs.iter().map(|&p| self.pref_v[p]).collect();
        let u_active: Vec<usize> = pair_idxs.iter().map(|&p| self.pref_u[p]).collect();
        let (phi, g_mean) = pair_likelihood(f, &v_active, &u_active);

        // First-order Taylor term: J_i = pdf(g_i) * sqrt(0.5), signed by the
        // endpoint indicator against the active location scope.
        let scale = 0.5f64.sqrt();
        let mut j = DMatrix::zeros(pair_idxs.len(), loc_idxs.len());
        for (row, &p) in pair_idxs.iter().enumerate() {
            let j_p = normal_pdf(g_mean[row]) * scale;
            for (col, &loc) in loc_idxs.iter().enumerate() {
                let s = (self.pref_v[p] == loc) as i32 - (self.pref_u[p] == loc) as i32;
                if s != 0 {
                    j[(row, col)] = j_p * f64::from(s);
                }
            }
        }

        let blend = self.g.shape() == j.shape() && self.g.iter().any(|x| *x != 0.0);
        if blend {
            self.g = &j * update_rate + &self.g * (1.0 - update_rate);
        } else {
            self.g = j;
        }

        phi
    }

    /// The current blended Jacobian. Empty (0x0) before the first refresh.
    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.g
    }

    /// Evidence terms: tempered `log(p)` and `log(1 - p)` at the given mean,
    /// one entry per observed pair.
    pub fn log_likelihood(&self, f: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let rho = temper_probs(&self.forward(f));
        let log_rho = rho.map(f64::ln);
        let log_not_rho = rho.map(|p| (1.0 - p).ln());
        (log_rho, log_not_rho)
    }

    /// Observation-noise diagonal at the given per-pair probabilities:
    /// the moment-matched Beta posterior variance scale
    /// `rho (1 - rho) / (a + b + total + 1)`. Falls back to a flat
    /// `Beta(1, 1)` prior when no noise prior has been installed.
    pub fn noise_variance(
        &self,
        phi: &DVector<f64>,
        scope: Option<&Minibatch>,
    ) -> DVector<f64> {
        let full_pairs: Vec<usize>;
        let pair_idxs: &[usize] = match scope {
            Some(mb) => &mb.pair_idxs,
            None => {
                full_pairs = (0..self.len()).collect();
                &full_pairs
            }
        };
        debug_assert_eq!(phi.len(), pair_idxs.len());

        DVector::from_iterator(
            pair_idxs.len(),
            pair_idxs.iter().enumerate().map(|(row, &p)| {
                let (b, a) = match &self.nu0 {
                    Some((b, a)) => (b[p], a[p]),
                    None => (1.0, 1.0),
                };
                let rho = temper_prob(phi[row]);
                rho * (1.0 - rho) / (a + b + self.totals[p] + 1.0)
            }),
        )
    }
}

impl ObservationModel for PairwiseObservations {
    fn len(&self) -> usize {
        PairwiseObservations::len(self)
    }

    fn endpoints(&self) -> (&[usize], &[usize]) {
        PairwiseObservations::endpoints(self)
    }

    fn targets(&self) -> (&DVector<f64>, &DVector<f64>) {
        PairwiseObservations::targets(self)
    }

    fn counts(&self) -> (&DVector<f64>, &DVector<f64>) {
        PairwiseObservations::counts(self)
    }

    fn forward(&self, f: &DVector<f64>) -> DVector<f64> {
        PairwiseObservations::forward(self, f)
    }

    fn refresh_jacobian(
        &mut self,
        f: &DVector<f64>,
        scope: Option<&Minibatch>,
        update_rate: f64,
    ) -> DVector<f64> {
        PairwiseObservations::refresh_jacobian(self, f, scope, update_rate)
    }

    fn jacobian(&self) -> &DMatrix<f64> {
        PairwiseObservations::jacobian(self)
    }

    fn log_likelihood(&self, f: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        PairwiseObservations::log_likelihood(self, f)
    }

    fn noise_variance(&self, phi: &DVector<f64>, scope: Option<&Minibatch>) -> DVector<f64> {
        PairwiseObservations::noise_variance(self, phi, scope)
    }
}
