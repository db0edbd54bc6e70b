//! Hamiltonian Monte Carlo and the No-U-Turn Sampler for differentiable
//! log-densities, with step-size and mass-matrix adaptation.

pub mod adapt;
#[cfg(feature = "burn")]
pub mod burn_target;
pub mod distributions;
pub mod error;
pub mod hmc;
pub mod integrator;
pub mod nuts;
pub mod potential;
pub mod sampler;
pub mod stats;
pub mod step;
pub mod step_size;
pub mod target;
pub mod trace;

pub use error::{Error, Result};
