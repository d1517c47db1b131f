//! Meta-models of forest-stand growth trajectories.
//!
//! A meta-model compresses the per-initial-age projections of a detailed
//! growth simulator into one small nonlinear growth curve. Parameters are
//! estimated by Metropolis-Hastings over a hierarchical observation
//! structure with a block-diagonal residual covariance; candidate model
//! forms are fitted in parallel and compared by their log pseudo-marginal
//! likelihood.

mod blocks;
mod model;
mod sampler;
mod structure;

pub mod diagnostics;
pub mod growth;
pub mod meta_model;
pub mod metadata;
pub mod parameters;
pub mod priors;
pub mod summary;
pub mod types;

pub use diagnostics::{ParameterChainDiagnostics, autocorrelation, effective_sample_size};
pub use growth::ModelForm;
pub use meta_model::MetaModel;
pub use metadata::{FitMetaData, GrowthMetaData, MetaModelMetaData};
pub use parameters::{ParameterConfig, ParameterRecord};
pub use priors::UniformPrior;
pub use structure::Observation;
pub use summary::render_comparison_table;
pub use types::{
    MetaModelError, MetropolisHastingsParameters, ModelComparisonRow, MonteCarloPredictionRow,
    PredictionRow, PredictionVarianceOutput,
};
