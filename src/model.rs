//! Pairwise preference learning with a GP prior.
//!
//! [`PreferenceGp`] is the public entry point: it validates and normalizes
//! raw preference labels, deduplicates the observed coordinate pairs,
//! initializes the pairwise-noise prior by Beta moment matching, drives the
//! engine's variational fit loop, and converts the latent posterior into
//! preference probabilities at query pairs.

use std::f64::consts::SQRT_2;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{FitSummary, GpSettings, VariationalGp};
use crate::error::ModelError;
use crate::likelihood::{normal_cdf, pair_likelihood, temper_probs, PairwiseObservations, PROB_EPS};
use crate::locations::{merge_observations, unique_locations};

/// Monte-Carlo draws per location for the preference-variance estimate.
const MC_SAMPLES: usize = 5000;

/// Predictions with `m (1 - m)` at or below this are treated as degenerate.
const DEGENERATE_PROB: f64 = 1e-7;

/// Variance assigned to degenerate (near-certain) predictions, where the
/// sampling estimate is unstable.
const VAR_FLOOR: f64 = 1e-8;

/// Default number of query locations per prediction block.
const DEFAULT_MAX_BLOCK_SIZE: usize = 1000;

/// Declared range of the raw preference labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    /// Labels in [0, 1]: the fraction of comparisons favoring endpoint 1.
    Binary,
    /// Labels in [-1, 1]: 1 means endpoint 1 preferred, -1 endpoint 2,
    /// 0 no preference. Rescaled to [0, 1] internally.
    ZeroCentered,
}

/// Optional prediction settings.
#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// Maximum query locations per sequential prediction block.
    pub max_block_size: usize,
    /// Return `log` probabilities (tempered first) instead of raw ones.
    pub expected_log: bool,
    /// Estimate the preference-probability variance by Monte Carlo.
    pub with_variance: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            expected_log: false,
            with_variance: true,
        }
    }
}

/// Posterior preference probabilities for a list of query pairs.
#[derive(Debug, Clone, Serialize)]
pub struct PairwisePrediction {
    /// Probability that the first endpoint is preferred (or its log).
    pub prob: Vec<f64>,
    /// Complementary probability (or its log).
    pub not_prob: Vec<f64>,
    /// Monte-Carlo variance of the preference probability, when requested.
    pub var: Option<Vec<f64>>,
}

/// Posterior latent function values at query locations.
#[derive(Debug, Clone, Serialize)]
pub struct LatentPrediction {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
}

#[derive(Debug, Clone)]
struct FitState {
    engine: VariationalGp,
    obs: PairwiseObservations,
}

/// Preference learning with a GP prior and probit pairwise likelihood,
/// fitted by variational inference.
#[derive(Debug, Clone)]
pub struct PreferenceGp {
    ninput_features: usize,
    settings: GpSettings,
    state: Option<FitState>,
}

impl PreferenceGp {
    pub fn new(ninput_features: usize, settings: GpSettings) -> Self {
        Self {
            ninput_features,
            settings,
            state: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Deduplicated training locations, in canonical order. `None` before a
    /// successful fit.
    pub fn training_locations(&self) -> Option<&[Vec<f64>]> {
        self.state.as_ref().map(|s| s.engine.coords())
    }

    /// Canonical observed pair endpoints. `None` before a successful fit.
    pub fn observed_pairs(&self) -> Option<(&[usize], &[usize])> {
        self.state.as_ref().map(|s| s.obs.endpoints())
    }

    /// Fit the latent utility function to raw pairwise observations.
    ///
    /// `preferences` are validated against `input_type` before any state is
    /// touched; `zero-centered` labels are rescaled to [0, 1]. `totals`
    /// default to one comparison per raw pair. When per-endpoint prior means
    /// are supplied they are remapped through the deduplication onto the
    /// unique location list.
    pub fn fit(
        &mut self,
        items_0_coords: &[Vec<f64>],
        items_1_coords: &[Vec<f64>],
        preferences: &[f64],
        totals: Option<&[f64]>,
        input_type: InputType,
        prior_means: Option<(&[f64], &[f64])>,
    ) -> Result<FitSummary, ModelError> {
        let n_raw = items_0_coords.len();
        check_len("items_1_coords", n_raw, items_1_coords.len())?;
        check_len("preferences", n_raw, preferences.len())?;
        if let Some(t) = totals {
            check_len("totals", n_raw, t.len())?;
        }
        if let Some((m0, m1)) = prior_means {
            check_len("prior_means.0", n_raw, m0.len())?;
            check_len("prior_means.1", n_raw, m1.len())?;
        }
        self.check_dims(items_0_coords)?;
        self.check_dims(items_1_coords)?;

        let fractions = validate_labels(preferences, input_type)?;

        let mut poscounts = Vec::with_capacity(n_raw);
        let mut total_vec = Vec::with_capacity(n_raw);
        for i in 0..n_raw {
            let t = totals.map_or(1.0, |t| t[i]);
            if !t.is_finite() || t <= 0.0 {
                return Err(ModelError::InvalidTotal { value: t });
            }
            poscounts.push(fractions[i] * t);
            total_vec.push(t);
        }

        let pairs = merge_observations(items_0_coords, items_1_coords, &poscounts, &total_vec);
        if pairs.is_empty() {
            return Err(ModelError::EmptyObservations);
        }
        debug!(
            raw_pairs = n_raw,
            merged_pairs = pairs.len(),
            locations = pairs.n_locations(),
            "deduplicated observations"
        );

        let n_locs = pairs.n_locations();
        let mu0 = match prior_means {
            Some((m0, m1)) => {
                let all: Vec<f64> = m0.iter().chain(m1.iter()).copied().collect();
                DVector::from_iterator(n_locs, pairs.original_idxs.iter().map(|&i| all[i]))
            }
            None => DVector::from_element(n_locs, self.settings.prior_mean),
        };

        let mut engine = VariationalGp::new(self.settings.clone(), pairs.coords.clone(), mu0)?;
        let mut obs = PairwiseObservations::new(&pairs);

        // Pairwise-noise prior: Beta moment matching of the rough posterior
        // evaluated at the prior mean and prior variance.
        let prior_var = DVector::from_element(n_locs, engine.prior_variance());
        let mut rng = StdRng::seed_from_u64(self.settings.rng_seed.wrapping_add(1));
        let (pref_v, pref_u) = obs.endpoints();
        let (m_prior, not_m_prior, v_prior) = rough_posterior(
            engine.prior_mean(),
            Some(&prior_var),
            pref_v,
            pref_u,
            &mut rng,
        );
        let v_prior = v_prior.unwrap_or_else(|| DVector::from_element(pairs.len(), VAR_FLOOR));
        let mut a = DVector::zeros(pairs.len());
        let mut b = DVector::zeros(pairs.len());
        for i in 0..pairs.len() {
            let a_plus_b = (m_prior[i] * not_m_prior[i] / v_prior[i] - 1.0).max(PROB_EPS);
            a[i] = a_plus_b * m_prior[i];
            b[i] = a_plus_b * not_m_prior[i];
        }
        obs.set_noise_prior(b, a);

        let summary = engine.fit(&mut obs)?;
        self.state = Some(FitState { engine, obs });
        Ok(summary)
    }

    /// Posterior preference probability (and optionally its Monte-Carlo
    /// variance) at query coordinate pairs. With no query coordinates,
    /// returns predictions for the training pairs from the stored posterior.
    /// If only the first coordinate list is given, the second defaults to a
    /// copy of it (degenerate self-pairs).
    pub fn predict_pairs(
        &self,
        items_0_coords: &[Vec<f64>],
        items_1_coords: &[Vec<f64>],
        prior_means: Option<(&[f64], &[f64])>,
        opts: &PredictOptions,
    ) -> Result<PairwisePrediction, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotFitted)?;
        let mut rng = StdRng::seed_from_u64(self.settings.rng_seed.wrapping_add(2));

        if items_0_coords.is_empty() && items_1_coords.is_empty() {
            let (pref_v, pref_u) = state.obs.endpoints();
            let vars = state.engine.variances();
            let f_var = opts.with_variance.then_some(&vars);
            let (m, not_m, v) =
                rough_posterior(state.engine.mean(), f_var, pref_v, pref_u, &mut rng);
            return Ok(finish_pairwise(m, not_m, v, opts.expected_log));
        }

        let items_1_owned;
        let items_1 = if items_1_coords.is_empty() {
            items_1_owned = items_0_coords.to_vec();
            &items_1_owned[..]
        } else {
            items_1_coords
        };
        check_len("items_1_coords", items_0_coords.len(), items_1.len())?;
        self.check_dims(items_0_coords)?;
        self.check_dims(items_1)?;
        if let Some((m0, m1)) = prior_means {
            check_len("prior_means.0", items_0_coords.len(), m0.len())?;
            check_len("prior_means.1", items_0_coords.len(), m1.len())?;
        }

        let uniq = unique_locations(items_0_coords, items_1);
        let mu0_out = match prior_means {
            Some((m0, m1)) => {
                let all: Vec<f64> = m0.iter().chain(m1.iter()).copied().collect();
                DVector::from_iterator(
                    uniq.coords.len(),
                    uniq.original_idxs.iter().map(|&i| all[i]),
                )
            }
            None => DVector::from_element(uniq.coords.len(), self.settings.prior_mean),
        };

        let (f, v) = state
            .engine
            .predict_blocks(&uniq.coords, &mu0_out, opts.max_block_size)?;
        let f_var = opts.with_variance.then_some(&v);
        let (m, not_m, v_post) = rough_posterior(&f, f_var, &uniq.pref_v, &uniq.pref_u, &mut rng);
        Ok(finish_pairwise(m, not_m, v_post, opts.expected_log))
    }

    /// Posterior latent mean and variance at query coordinates, without the
    /// pairwise transform. With no query coordinates, returns the stored
    /// posterior at the deduplicated training locations.
    pub fn predict_latent(
        &self,
        items_coords: &[Vec<f64>],
        prior_mean_out: Option<&[f64]>,
        opts: &PredictOptions,
    ) -> Result<LatentPrediction, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotFitted)?;

        if items_coords.is_empty() {
            return Ok(LatentPrediction {
                mean: state.engine.mean().iter().copied().collect(),
                var: state.engine.variances().iter().copied().collect(),
            });
        }

        self.check_dims(items_coords)?;
        let mu0_out = match prior_mean_out {
            Some(m) => {
                check_len("prior_mean_out", items_coords.len(), m.len())?;
                DVector::from_iterator(m.len(), m.iter().copied())
            }
            None => DVector::from_element(items_coords.len(), self.settings.prior_mean),
        };

        let (f, v) = state
            .engine
            .predict_blocks(items_coords, &mu0_out, opts.max_block_size)?;
        Ok(LatentPrediction {
            mean: f.iter().copied().collect(),
            var: v.iter().copied().collect(),
        })
    }

    fn check_dims(&self, coords: &[Vec<f64>]) -> Result<(), ModelError> {
        for c in coords {
            if c.len() != self.ninput_features {
                return Err(ModelError::DimensionMismatch {
                    expected: self.ninput_features,
                    actual: c.len(),
                });
            }
        }
        Ok(())
    }
}

fn check_len(context: &'static str, expected: usize, actual: usize) -> Result<(), ModelError> {
    if expected != actual {
        return Err(ModelError::LengthMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Validate labels against the declared input type and normalize them into
/// positive fractions in [0, 1].
fn validate_labels(preferences: &[f64], input_type: InputType) -> Result<Vec<f64>, ModelError> {
    let (lo, hi, name, range) = match input_type {
        InputType::Binary => (0.0, 1.0, "binary", "[0, 1]"),
        InputType::ZeroCentered => (-1.0, 1.0, "zero-centered", "[-1, 1]"),
    };
    for &p in preferences {
        if !p.is_finite() || p < lo || p > hi {
            return Err(ModelError::LabelOutOfRange {
                value: p,
                input_type: name,
                range,
            });
        }
    }
    Ok(match input_type {
        InputType::Binary => preferences.to_vec(),
        InputType::ZeroCentered => preferences.iter().map(|p| (p + 1.0) / 2.0).collect(),
    })
}

/// Rough pairwise posterior: the forward model applied to the latent mean,
/// ignoring the uncertainty in `f` for the probability itself. When marginal
/// variances are supplied, the probability variance is estimated empirically
/// from [`MC_SAMPLES`] normal draws per location pushed through the forward
/// model, with a floor at near-certain predictions.
fn rough_posterior(
    f_mean: &DVector<f64>,
    f_var: Option<&DVector<f64>>,
    pref_v: &[usize],
    pref_u: &[usize],
    rng: &mut StdRng,
) -> (DVector<f64>, DVector<f64>, Option<DVector<f64>>) {
    let (phi, _) = pair_likelihood(f_mean, pref_v, pref_u);
    let m_post = temper_probs(&phi);
    let not_m_post = m_post.map(|p| 1.0 - p);

    let v_post = f_var.map(|var| {
        let n = f_mean.len();
        let mut samples = DMatrix::zeros(n, MC_SAMPLES);
        for i in 0..n {
            let sd = var[i].max(0.0).sqrt();
            for s in 0..MC_SAMPLES {
                let z: f64 = rng.sample(StandardNormal);
                samples[(i, s)] = f_mean[i] + sd * z;
            }
        }

        DVector::from_iterator(
            pref_v.len(),
            pref_v.iter().zip(pref_u.iter()).enumerate().map(|(p, (&v, &u))| {
                let mut sum = 0.0;
                let mut sum_sq = 0.0;
                for s in 0..MC_SAMPLES {
                    let rho = normal_cdf((samples[(v, s)] - samples[(u, s)]) / SQRT_2);
                    sum += rho;
                    sum_sq += rho * rho;
                }
                let mean = sum / MC_SAMPLES as f64;
                let var_emp = (sum_sq / MC_SAMPLES as f64 - mean * mean).max(PROB_EPS);
                if m_post[p] * (1.0 - m_post[p]) <= DEGENERATE_PROB {
                    VAR_FLOOR
                } else {
                    var_emp
                }
            }),
        )
    });

    (m_post, not_m_post, v_post)
}

fn finish_pairwise(
    m: DVector<f64>,
    not_m: DVector<f64>,
    v: Option<DVector<f64>>,
    expected_log: bool,
) -> PairwisePrediction {
    let (prob, not_prob) = if expected_log {
        // m and not_m are already tempered, so the logs are finite.
        (m.map(f64::ln), not_m.map(f64::ln))
    } else {
        (m, not_m)
    };
    PairwisePrediction {
        prob: prob.iter().copied().collect(),
        not_prob: not_prob.iter().copied().collect(),
        var: v.map(|v| v.iter().copied().collect()),
    }
}
