//! Error taxonomy for the ensemble runtime.
//!
//! Configuration and sink-overlap errors abort the whole step; the per-sample
//! variants abort only the sample that raised them and are surfaced through
//! that sample's finished job.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = EnsembleError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnsembleError {
    /// Fatal at initialize: the declarative configuration cannot produce a
    /// runnable ensemble.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An input variable of a sub-model is neither sampled nor produced by
    /// any other sub-model.
    #[error(
        "configuration error: for sub-model `{model}` the input `{variable}` was not found among \
         the other models' outputs and the sampled variables"
    )]
    UnresolvableInput { model: String, variable: String },

    /// Per-sample: a sampled variable name collides with a declared output.
    #[error("sample `{prefix}`: sampled variable `{variable}` is also a declared output of `{model}`")]
    SampledOutputCollision {
        prefix: String,
        variable: String,
        model: String,
    },

    /// A sub-model run came back as failed. Sibling jobs sharing the sample's
    /// unique handler have already been drained when this is raised.
    #[error("sub-model `{model}` failed for sample `{prefix}`")]
    SubModelFailure { model: String, prefix: String },

    /// Picard iteration hit the iteration cap without meeting tolerance.
    #[error("sample `{prefix}`: Picard iteration did not converge, residual norm {norm:e} after {iterations} iterations")]
    PicardNonConvergence {
        prefix: String,
        norm: f64,
        iterations: u32,
    },

    /// The step output sink is one of the sub-model trace stores.
    #[error("output `{sink}` is the target evaluation of sub-model `{model}` and cannot be used as a step output")]
    SinkOverlap { sink: String, model: String },

    /// A submitted work unit returned an opaque failure (user code error,
    /// nonzero subprocess exit, surrogate backend error, ...).
    #[error("job `{identifier}` failed: {message}")]
    WorkUnitFailed { identifier: String, message: String },

    /// Compound job identifiers are unique among live jobs; an identity can
    /// only be resubmitted after its previous run was collected.
    #[error("job identifier `{0}` is already in flight")]
    DuplicateJobIdentifier(String),

    /// A finished job was requested that the handler does not hold.
    #[error("no finished job `{identifier}` under handler scope `{unique_handler}`")]
    MissingFinishedJob {
        identifier: String,
        unique_handler: String,
    },

    /// A value had the wrong variant kind for the operation.
    #[error("variable `{variable}`: expected {expected}, got {got}")]
    TypeMismatch {
        variable: String,
        expected: String,
        got: String,
    },

    /// The model was driven out of lifecycle order (e.g. `run` before
    /// `initialize`, or evaluation of an untrained surrogate).
    #[error("model `{model}`: {message}")]
    Lifecycle { model: String, message: String },
}

impl EnsembleError {
    /// True for errors that abort the step rather than a single sample.
    pub fn is_fatal_for_step(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnresolvableInput { .. } | Self::SinkOverlap { .. }
        )
    }
}
