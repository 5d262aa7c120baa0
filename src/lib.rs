#![forbid(unsafe_code)]

//! # pref-gp
//!
//! Learn a latent scalar utility function over a feature space from noisy
//! pairwise comparisons ("item A preferred to item B with strength p").
//!
//! Instead of asking for absolute scores (unreliable, miscalibrated), the
//! model consumes pairwise preference labels: a Gaussian process prior over
//! the latent utility, a probit pairwise likelihood
//! `Phi((f[v] - f[u]) / sqrt(2))`, and a variational fit loop with an
//! optional stochastic (minibatch) update for larger location sets. Repeated
//! and reversed observations of the same location pair are merged into
//! canonical counted pairs before fitting, and predictions at new coordinate
//! pairs come back as preference probabilities with Monte-Carlo uncertainty
//! estimates.

pub mod engine;
pub mod error;
pub mod likelihood;
pub mod locations;
pub mod minibatch;
pub mod model;

pub use engine::{FitSummary, GpSettings, Kernel, ObservationModel, VariationalGp};
pub use error::ModelError;
pub use likelihood::PairwiseObservations;
pub use locations::{merge_observations, unique_locations, ObservedPairs, UniqueLocations};
pub use minibatch::Minibatch;
pub use model::{
    InputType, LatentPrediction, PairwisePrediction, PredictOptions, PreferenceGp,
};
