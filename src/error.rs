//! Error types for the sampler.
//!
//! Numerical trouble inside a trajectory (energy blow-up, `NaN`, a log-density
//! of `-inf`) is not an error: it is reported through the `diverging` field of
//! [`SampleStats`](crate::step::SampleStats). The variants below are reserved
//! for misconfiguration and for callables that break their output contract.

use thiserror::Error;

/// Sampler error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected before any chain starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A position vector does not match the model dimensionality.
    #[error("position has {got} coordinates, expected {expected}")]
    PositionShape { expected: usize, got: usize },

    /// The log-density callable returned a gradient of the wrong length.
    #[error("log-density gradient has {got} entries, expected {expected}")]
    GradientShape { expected: usize, got: usize },

    /// No starting point with a finite log-density was found.
    #[error("chain {chain}: no finite log-density at the initial point after {attempts} attempts")]
    InitialPoint { chain: usize, attempts: usize },

    /// The worker pool could not be built.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Invalid progress bar template.
    #[error("progress bar template error: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn config<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Config(msg.into()))
}
