//! Dense variational GP engine.
//!
//! The engine owns the latent posterior (mean `f`, covariance `C`) over the
//! deduplicated locations and advances it with a linearized variational
//! update each iteration, driven by an [`ObservationModel`]: the observation
//! layer supplies the forward probabilities, the Jacobian linearization, and
//! the log-likelihood terms; the engine supplies the kernel prior, the update
//! step, and blocked posterior prediction at new coordinates.
//!
//! Everything here is single-threaded and synchronous: one control thread
//! mutates `f`, `C`, and the minibatch scope in place once per iteration, and
//! prediction blocks run strictly in order.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ModelError;
use crate::minibatch::{self, Minibatch};

/// Floor applied to predicted posterior variances.
const MIN_POSTERIOR_VAR: f64 = 1e-12;

/// Jitter escalation attempts before a Cholesky failure becomes fatal.
const MAX_JITTER_ATTEMPTS: usize = 5;

// =============================================================================
// Kernels
// =============================================================================

/// Stationary kernel families supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kernel {
    /// Matern 3/2 (the default; tolerant of non-smooth utility surfaces).
    Matern32,
    /// Squared exponential.
    SquaredExponential,
}

fn kernel_value(kernel: Kernel, r: f64, scale: f64) -> f64 {
    match kernel {
        Kernel::Matern32 => {
            let sr = 3f64.sqrt() * r;
            scale * (1.0 + sr) * (-sr).exp()
        }
        Kernel::SquaredExponential => scale * (-0.5 * r * r).exp(),
    }
}

/// Covariance between two coordinate lists under an isotropic length scale.
pub fn kernel_matrix(
    kernel: Kernel,
    x: &[Vec<f64>],
    y: &[Vec<f64>],
    length_scale: f64,
    scale: f64,
) -> DMatrix<f64> {
    let ls = length_scale.max(f64::EPSILON);
    DMatrix::from_fn(x.len(), y.len(), |i, j| {
        let r2: f64 = x[i]
            .iter()
            .zip(y[j].iter())
            .map(|(a, b)| {
                let d = (a - b) / ls;
                d * d
            })
            .sum();
        kernel_value(kernel, r2.sqrt(), scale)
    })
}

// =============================================================================
// Settings
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpSettings {
    // -- Prior ---------------------------------------------------------------
    /// Kernel family for the prior covariance.
    pub kernel: Kernel,
    /// Isotropic kernel length scale.
    pub length_scale: f64,
    /// Gamma pseudo-parameters of the prior over the function scale `s`.
    /// The engine uses the fixed prior expectation `rate_s0 / shape_s0` as
    /// the kernel output scale; hyperparameter optimization is out of scope.
    pub shape_s0: f64,
    pub rate_s0: f64,
    /// Default prior mean of the latent function, used at every location
    /// unless per-endpoint prior means are supplied.
    pub prior_mean: f64,

    // -- Fit loop ------------------------------------------------------------
    /// Maximum variational iterations.
    pub max_iters: usize,
    /// Convergence threshold on `max|delta f|`, required on two consecutive
    /// iterations.
    pub conv_tol: f64,
    /// Exponential blending rate for the Jacobian linearization, in (0, 1].
    /// 1.0 means each iteration's linearization fully replaces the last.
    pub g_update_rate: f64,

    // -- Stochastic updates --------------------------------------------------
    /// Enable minibatch (stochastic) updates when the location count exceeds
    /// `max_update_size`.
    pub use_svi: bool,
    /// Largest location subset updated per stochastic iteration.
    pub max_update_size: usize,
    /// Step-size delay: the stochastic step is `(t + delay)^(-forgetting_rate)`.
    pub delay: f64,
    /// Step-size decay exponent, in (0.5, 1] for convergence.
    pub forgetting_rate: f64,
    /// Pin the stochastic location subset across iterations instead of
    /// redrawing (deterministic testing); only the pair-membership mask is
    /// recomputed.
    pub pinned_sample_idxs: Option<Vec<usize>>,

    // -- Numerics ------------------------------------------------------------
    /// Base diagonal jitter for prior and innovation Cholesky factorizations.
    pub jitter: f64,
    /// RNG seed for minibatch draws and Monte-Carlo prediction variance.
    pub rng_seed: u64,
}

impl Default for GpSettings {
    fn default() -> Self {
        Self {
            kernel: Kernel::Matern32,
            length_scale: 1.0,
            shape_s0: 2.0,
            rate_s0: 2.0,
            prior_mean: 0.0,
            max_iters: 200,
            conv_tol: 1e-5,
            g_update_rate: 1.0,
            use_svi: true,
            max_update_size: 1000,
            delay: 1.0,
            forgetting_rate: 0.9,
            pinned_sample_idxs: None,
            jitter: 1e-8,
            rng_seed: 1337,
        }
    }
}

/// Result of a fit loop.
#[derive(Debug, Clone, Serialize)]
pub struct FitSummary {
    /// Iterations actually run.
    pub iterations: usize,
    /// Whether the convergence criterion was met before `max_iters`.
    pub converged: bool,
    /// Data log-likelihood at the final posterior mean.
    pub log_likelihood: f64,
}

// =============================================================================
// Observation-model hook contract
// =============================================================================

/// The hooks any compatible observation model must implement for the engine's
/// update step. The engine holds a reference to an instance of this trait;
/// model specialization happens here, not through inheritance.
pub trait ObservationModel {
    /// Number of observations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pair endpoint index arrays, used for minibatch membership.
    fn endpoints(&self) -> (&[usize], &[usize]);

    /// Observation targets: positive fraction `z` and comparison totals.
    fn targets(&self) -> (&DVector<f64>, &DVector<f64>);

    /// Raw counts `(poscounts, totals)` for the likelihood weighting.
    fn counts(&self) -> (&DVector<f64>, &DVector<f64>);

    /// Forward/likelihood function: per-observation probabilities at `f`.
    fn forward(&self, f: &DVector<f64>) -> DVector<f64>;

    /// Rebuild (and blend) the linearization about `f` for `scope`; returns
    /// the probability vector over the active observations.
    fn refresh_jacobian(
        &mut self,
        f: &DVector<f64>,
        scope: Option<&Minibatch>,
        update_rate: f64,
    ) -> DVector<f64>;

    /// The current linearization matrix, valid after `refresh_jacobian`.
    fn jacobian(&self) -> &DMatrix<f64>;

    /// Log-likelihood terms `(log p, log(1 - p))` for the lower bound.
    fn log_likelihood(&self, f: &DVector<f64>) -> (DVector<f64>, DVector<f64>);

    /// Observation-noise diagonal at the given probabilities.
    fn noise_variance(&self, phi: &DVector<f64>, scope: Option<&Minibatch>) -> DVector<f64>;
}

// =============================================================================
// Helpers
// =============================================================================

fn gather_vector(v: &DVector<f64>, idxs: &[usize]) -> DVector<f64> {
    DVector::from_iterator(idxs.len(), idxs.iter().map(|&i| v[i]))
}

fn gather_matrix(m: &DMatrix<f64>, idxs: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(idxs.len(), idxs.len(), |i, j| m[(idxs[i], idxs[j])])
}

/// Cholesky with escalating diagonal jitter, in the spirit of ridge
/// escalation in weighted least-squares solvers. Fatal after
/// `MAX_JITTER_ATTEMPTS`.
fn cholesky_with_jitter(
    m: &DMatrix<f64>,
    base_jitter: f64,
) -> Result<Cholesky<f64, Dyn>, ModelError> {
    let mut jitter = base_jitter.max(f64::MIN_POSITIVE);
    for attempt in 0..MAX_JITTER_ATTEMPTS {
        let mut candidate = m.clone();
        if attempt > 0 {
            for d in 0..candidate.nrows() {
                candidate[(d, d)] += jitter;
            }
            warn!(attempt, jitter, "Cholesky failed, retrying with jitter");
            jitter *= 10.0;
        }
        if let Some(chol) = Cholesky::new(candidate) {
            return Ok(chol);
        }
    }
    Err(ModelError::Numerical(format!(
        "Cholesky factorization failed after {MAX_JITTER_ATTEMPTS} jitter attempts"
    )))
}

// =============================================================================
// Engine
// =============================================================================

/// Variational GP over a fixed set of deduplicated locations.
#[derive(Debug, Clone)]
pub struct VariationalGp {
    settings: GpSettings,
    coords: Vec<Vec<f64>>,
    scale: f64,
    mu0: DVector<f64>,
    /// Prior covariance (jittered diagonal) and its factorization.
    k: DMatrix<f64>,
    k_chol: Cholesky<f64, Dyn>,
    /// Posterior mean, one scalar per location.
    f: DVector<f64>,
    /// Posterior covariance at the training locations.
    c: DMatrix<f64>,
    rng: StdRng,
}

impl VariationalGp {
    pub fn new(
        settings: GpSettings,
        coords: Vec<Vec<f64>>,
        mu0: DVector<f64>,
    ) -> Result<Self, ModelError> {
        if mu0.len() != coords.len() {
            return Err(ModelError::LengthMismatch {
                context: "prior mean",
                expected: coords.len(),
                actual: mu0.len(),
            });
        }

        let shape_s0 = if settings.shape_s0 > 0.0 {
            settings.shape_s0
        } else {
            0.5
        };
        let rate_s0 = if settings.rate_s0 > 0.0 {
            settings.rate_s0
        } else {
            0.5
        };
        let scale = rate_s0 / shape_s0;

        let mut k = kernel_matrix(
            settings.kernel,
            &coords,
            &coords,
            settings.length_scale,
            scale,
        );
        for d in 0..k.nrows() {
            k[(d, d)] += settings.jitter;
        }
        let k_chol = cholesky_with_jitter(&k, settings.jitter)?;

        let f = mu0.clone();
        let c = k.clone();
        let rng = StdRng::seed_from_u64(settings.rng_seed);

        Ok(Self {
            settings,
            coords,
            scale,
            mu0,
            k,
            k_chol,
            f,
            c,
            rng,
        })
    }

    pub fn n_locations(&self) -> usize {
        self.coords.len()
    }

    pub fn coords(&self) -> &[Vec<f64>] {
        &self.coords
    }

    /// Posterior mean at the training locations.
    pub fn mean(&self) -> &DVector<f64> {
        &self.f
    }

    /// Posterior marginal variances at the training locations.
    pub fn variances(&self) -> DVector<f64> {
        self.c.diagonal().map(|v| v.max(0.0))
    }

    pub fn prior_mean(&self) -> &DVector<f64> {
        &self.mu0
    }

    /// Prior marginal variance (kernel output scale).
    pub fn prior_variance(&self) -> f64 {
        self.scale
    }

    /// Run the variational fit loop against the observation model.
    ///
    /// Each iteration linearizes the forward model about the current mean
    /// (`A = G K G^T + Q`, `f <- mu0 + K G^T A^{-1} ((z - rho) + G (f - mu0))`,
    /// `C <- K - K G^T A^{-1} G K`), either over all locations or — when
    /// stochastic updates are active — over a minibatch scope blended with a
    /// Robbins-Monro step.
    pub fn fit<M: ObservationModel>(&mut self, model: &mut M) -> Result<FitSummary, ModelError> {
        if model.is_empty() {
            return Err(ModelError::EmptyObservations);
        }

        let n = self.n_locations();
        let m = model.len();
        let svi_active = self.settings.use_svi
            && (self.settings.pinned_sample_idxs.is_some() || self.settings.max_update_size < n);

        let mut converged = false;
        let mut streak = 0usize;
        let mut iterations = 0usize;
        let mut log_likelihood = f64::NEG_INFINITY;

        for it in 0..self.settings.max_iters {
            iterations = it + 1;

            let scope: Option<Minibatch> = if svi_active {
                let (pref_v, pref_u) = model.endpoints();
                Some(match &self.settings.pinned_sample_idxs {
                    Some(idxs) => minibatch::pinned(idxs, pref_v, pref_u)?,
                    None => minibatch::draw(
                        n,
                        self.settings.max_update_size,
                        pref_v,
                        pref_u,
                        &mut self.rng,
                    )?,
                })
            } else {
                None
            };

            let phi = model.refresh_jacobian(&self.f, scope.as_ref(), self.settings.g_update_rate);
            let q = model.noise_variance(&phi, scope.as_ref());
            let g = model.jacobian();
            let (z, _) = model.targets();

            let (loc_idxs, pair_idxs): (Vec<usize>, Vec<usize>) = match &scope {
                Some(mb) => (mb.loc_idxs.clone(), mb.pair_idxs.clone()),
                None => ((0..n).collect(), (0..m).collect()),
            };

            let k_sub = gather_matrix(&self.k, &loc_idxs);
            let f_sub = gather_vector(&self.f, &loc_idxs);
            let mu0_sub = gather_vector(&self.mu0, &loc_idxs);
            let z_sub = gather_vector(z, &pair_idxs);

            let resid = &z_sub - &phi + g * (&f_sub - &mu0_sub);
            let a = g * &k_sub * g.transpose() + DMatrix::from_diagonal(&q);
            let a_chol = cholesky_with_jitter(&a, self.settings.jitter)?;

            let b = &k_sub * g.transpose();
            let f_new = &mu0_sub + &b * a_chol.solve(&resid);
            let c_new = &k_sub - &b * a_chol.solve(&(g * &k_sub));

            // The blend step completes fully here before anything downstream
            // reads the posterior.
            let step = if scope.is_some() {
                (it as f64 + self.settings.delay.max(1.0))
                    .powf(-self.settings.forgetting_rate)
                    .clamp(0.0, 1.0)
            } else {
                1.0
            };

            let mut max_delta: f64 = 0.0;
            for (a_i, &loc) in loc_idxs.iter().enumerate() {
                let updated = (1.0 - step) * self.f[loc] + step * f_new[a_i];
                max_delta = max_delta.max((updated - self.f[loc]).abs());
                self.f[loc] = updated;
                for (b_i, &loc2) in loc_idxs.iter().enumerate() {
                    self.c[(loc, loc2)] =
                        (1.0 - step) * self.c[(loc, loc2)] + step * c_new[(a_i, b_i)];
                }
            }

            let (log_rho, log_not_rho) = model.log_likelihood(&self.f);
            let (poscounts, totals) = model.counts();
            log_likelihood = (0..m)
                .map(|i| {
                    poscounts[i] * log_rho[i] + (totals[i] - poscounts[i]) * log_not_rho[i]
                })
                .sum();

            debug!(
                iteration = it,
                max_delta,
                log_likelihood,
                stochastic = scope.is_some(),
                "variational update"
            );

            if max_delta < self.settings.conv_tol {
                streak += 1;
                if streak >= 2 {
                    converged = true;
                    break;
                }
            } else {
                streak = 0;
            }
        }

        let rho = model.forward(&self.f);
        let (z, _) = model.targets();
        let mean_resid = (z - rho).abs().mean();
        debug!(iterations, converged, mean_resid, "fit finished");

        Ok(FitSummary {
            iterations,
            converged,
            log_likelihood,
        })
    }

    /// Posterior mean and marginal variance at query coordinates, processed
    /// in strictly sequential blocks of at most `max_block_size` locations to
    /// cap peak memory. Any block failure fails the whole call.
    pub fn predict_blocks(
        &self,
        query: &[Vec<f64>],
        mu0_out: &DVector<f64>,
        max_block_size: usize,
    ) -> Result<(DVector<f64>, DVector<f64>), ModelError> {
        let nq = query.len();
        if mu0_out.len() != nq {
            return Err(ModelError::LengthMismatch {
                context: "output prior mean",
                expected: nq,
                actual: mu0_out.len(),
            });
        }
        let mut f_out = DVector::zeros(nq);
        let mut v_out = DVector::zeros(nq);
        if nq == 0 {
            return Ok((f_out, v_out));
        }

        let block_size = max_block_size.max(1);
        let nblocks = nq.div_ceil(block_size);
        let alpha = self.k_chol.solve(&(&self.f - &self.mu0));

        for block in 0..nblocks {
            debug!(block, nblocks, "predicting block");
            let start = block * block_size;
            let end = (start + block_size).min(nq);

            let k_star = kernel_matrix(
                self.settings.kernel,
                &query[start..end],
                &self.coords,
                self.settings.length_scale,
                self.scale,
            );
            // w = K^{-1} K*^T; posterior var needs both the prior reduction
            // and the training-posterior term W^T C W.
            let w = self.k_chol.solve(&k_star.transpose());
            let t = &self.c * &w;

            for i in 0..(end - start) {
                let mean = (k_star.row(i) * &alpha)[(0, 0)];
                f_out[start + i] = mu0_out[start + i] + mean;

                let prior_reduction = (k_star.row(i) * w.column(i))[(0, 0)];
                let posterior_term = (w.column(i).transpose() * t.column(i))[(0, 0)];
                let var = self.scale - prior_reduction + posterior_term;
                if !var.is_finite() {
                    return Err(ModelError::Numerical(format!(
                        "non-finite predictive variance in block {block}"
                    )));
                }
                v_out[start + i] = var.max(MIN_POSTERIOR_VAR);
            }
        }

        Ok((f_out, v_out))
    }
}
