/*!
Kinetic-energy metrics ("quadpotentials").

A potential fixes the Gaussian momentum distribution `p ~ N(0, M)` and the
velocity map `v = M⁻¹ p`. The kinetic energy is `½ pᵀ M⁻¹ p`. The inverse mass
matrix `M⁻¹` plays the role of a posterior covariance estimate, so the
adaptive variants learn it from tuning draws with Welford accumulators and only
publish a new metric at the end of an adaptation window.

Step methods hold a [`QuadPotential`], which dispatches to the concrete
variants without dynamic allocation.

# Examples

```rust
use mini_hmc::potential::{DiagPotential, Potential};

let potential = DiagPotential::new(vec![4.0, 0.25]).unwrap();
let momentum = [1.0, 2.0];
assert_eq!(potential.velocity(&momentum), vec![4.0, 0.5]);
assert_eq!(potential.energy(&momentum), 0.5 * (4.0 + 1.0));
```
*/

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::adapt::{WelfordCovariance, WelfordVariance};
use crate::error::{config, Error, Result};

/// The operations the integrator and the adaptation schedule need from a metric.
pub trait Potential {
    fn dim(&self) -> usize;

    /// `M⁻¹ · momentum`.
    fn velocity(&self, momentum: &[f64]) -> Vec<f64>;

    /// Kinetic energy `½ pᵀ M⁻¹ p`.
    fn energy(&self, momentum: &[f64]) -> f64 {
        0.5 * dot(momentum, &self.velocity(momentum))
    }

    /// Draws a momentum from `N(0, M)`.
    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64>;

    /// Records a tuning draw. No-op for fixed metrics.
    fn update(&mut self, _position: &[f64]) {}

    /// Resets the accumulator at the start of an adaptation window.
    fn start_window(&mut self) {}

    /// Publishes the accumulated estimate. Returns whether the metric changed.
    fn finalize_window(&mut self) -> bool {
        false
    }

    /// Stops adaptation for good.
    fn freeze(&mut self) {}
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R, dim: usize) -> Vec<f64> {
    (0..dim).map(|_| rng.sample(StandardNormal)).collect()
}

/// Unit mass matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityPotential {
    dim: usize,
}

impl IdentityPotential {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Potential for IdentityPotential {
    fn dim(&self) -> usize {
        self.dim
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        momentum.to_vec()
    }

    fn energy(&self, momentum: &[f64]) -> f64 {
        0.5 * dot(momentum, momentum)
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        standard_normal(rng, self.dim)
    }
}

/// Diagonal metric parameterized by per-coordinate variances (`diag(M⁻¹)`).
#[derive(Debug, Clone, PartialEq)]
pub struct DiagPotential {
    inv_mass: Vec<f64>,
    mass_std: Vec<f64>,
}

impl DiagPotential {
    pub fn new(variances: Vec<f64>) -> Result<Self> {
        if let Some(bad) = variances.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return config(format!(
                "diagonal potential variances must be positive and finite, got {bad}"
            ));
        }
        Ok(Self::from_valid(variances))
    }

    fn from_valid(inv_mass: Vec<f64>) -> Self {
        let mass_std = inv_mass.iter().map(|v| v.sqrt().recip()).collect();
        Self { inv_mass, mass_std }
    }

    pub fn inv_mass(&self) -> &[f64] {
        &self.inv_mass
    }
}

impl Potential for DiagPotential {
    fn dim(&self) -> usize {
        self.inv_mass.len()
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        momentum
            .iter()
            .zip(&self.inv_mass)
            .map(|(p, v)| p * v)
            .collect()
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.mass_std
            .iter()
            .map(|s| s * rng.sample::<f64, _>(StandardNormal))
            .collect()
    }
}

/// Dense metric parameterized by a covariance matrix (`M⁻¹`).
///
/// Keeps the lower Cholesky factor `L` of the mass matrix `M = (M⁻¹)⁻¹` so
/// that `L z` with `z ~ N(0, I)` is a draw from `N(0, M)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DensePotential {
    inv_mass: DMatrix<f64>,
    mass_chol: DMatrix<f64>,
}

impl DensePotential {
    pub fn new(covariance: DMatrix<f64>) -> Result<Self> {
        if !covariance.is_square() {
            return config(format!(
                "dense potential covariance must be square, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            ));
        }
        if covariance.iter().any(|x| !x.is_finite()) {
            return config("dense potential covariance has non-finite entries");
        }
        Self::factorize(covariance).ok_or_else(|| {
            Error::Config("dense potential covariance is not positive definite".to_string())
        })
    }

    fn factorize(inv_mass: DMatrix<f64>) -> Option<Self> {
        let mass = inv_mass.clone().cholesky()?.inverse();
        let mass_chol = mass.cholesky()?.l();
        Some(Self {
            inv_mass,
            mass_chol,
        })
    }

    pub fn inv_mass(&self) -> &DMatrix<f64> {
        &self.inv_mass
    }
}

impl Potential for DensePotential {
    fn dim(&self) -> usize {
        self.inv_mass.nrows()
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        let p = DVector::from_column_slice(momentum);
        (&self.inv_mass * p).as_slice().to_vec()
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z = DVector::from_vec(standard_normal(rng, self.dim()));
        (&self.mass_chol * z).as_slice().to_vec()
    }
}

/// Diagonal metric learned from the variance of tuning draws.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagAdaptPotential {
    current: DiagPotential,
    estimator: WelfordVariance,
    adapting: bool,
}

impl DiagAdaptPotential {
    /// Starts from the identity metric.
    pub fn new(dim: usize) -> Self {
        Self {
            current: DiagPotential::from_valid(vec![1.0; dim]),
            estimator: WelfordVariance::new(dim),
            adapting: true,
        }
    }

    pub fn inv_mass(&self) -> &[f64] {
        self.current.inv_mass()
    }
}

impl Potential for DiagAdaptPotential {
    fn dim(&self) -> usize {
        self.current.dim()
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        self.current.velocity(momentum)
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.current.random_momentum(rng)
    }

    fn update(&mut self, position: &[f64]) {
        if self.adapting {
            self.estimator.update(position);
        }
    }

    fn start_window(&mut self) {
        self.estimator.reset();
    }

    fn finalize_window(&mut self) -> bool {
        if !self.adapting {
            return false;
        }
        let Some(var) = self.estimator.regularized_variance() else {
            return false;
        };
        if var.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            log::warn!("discarding a non-finite mass matrix estimate");
            return false;
        }
        self.current = DiagPotential::from_valid(var);
        true
    }

    fn freeze(&mut self) {
        self.adapting = false;
        self.estimator.reset();
    }
}

/// Dense metric learned from the covariance of tuning draws.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseAdaptPotential {
    current: DensePotential,
    estimator: WelfordCovariance,
    adapting: bool,
}

impl DenseAdaptPotential {
    /// Starts from the identity metric.
    pub fn new(dim: usize) -> Self {
        let identity = DMatrix::identity(dim, dim);
        Self {
            current: DensePotential {
                inv_mass: identity.clone(),
                mass_chol: identity,
            },
            estimator: WelfordCovariance::new(dim),
            adapting: true,
        }
    }

    pub fn inv_mass(&self) -> &DMatrix<f64> {
        self.current.inv_mass()
    }
}

impl Potential for DenseAdaptPotential {
    fn dim(&self) -> usize {
        self.current.dim()
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        self.current.velocity(momentum)
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.current.random_momentum(rng)
    }

    fn update(&mut self, position: &[f64]) {
        if self.adapting {
            self.estimator.update(position);
        }
    }

    fn start_window(&mut self) {
        self.estimator.reset();
    }

    fn finalize_window(&mut self) -> bool {
        if !self.adapting {
            return false;
        }
        let Some(cov) = self.estimator.regularized_covariance() else {
            return false;
        };
        if cov.iter().any(|x| !x.is_finite()) {
            log::warn!("discarding a non-finite mass matrix estimate");
            return false;
        }
        match DensePotential::factorize(cov) {
            Some(next) => {
                self.current = next;
                true
            }
            None => {
                log::warn!("covariance estimate is not positive definite, keeping the previous mass matrix");
                false
            }
        }
    }

    fn freeze(&mut self) {
        self.adapting = false;
        self.estimator.reset();
    }
}

/// The metric a step method carries.
#[derive(Debug, Clone, PartialEq)]
pub enum QuadPotential {
    Identity(IdentityPotential),
    Diag(DiagPotential),
    Dense(DensePotential),
    DiagAdapt(DiagAdaptPotential),
    DenseAdapt(DenseAdaptPotential),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            QuadPotential::Identity($p) => $body,
            QuadPotential::Diag($p) => $body,
            QuadPotential::Dense($p) => $body,
            QuadPotential::DiagAdapt($p) => $body,
            QuadPotential::DenseAdapt($p) => $body,
        }
    };
}

impl Potential for QuadPotential {
    fn dim(&self) -> usize {
        dispatch!(self, p => p.dim())
    }

    fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        dispatch!(self, p => p.velocity(momentum))
    }

    fn energy(&self, momentum: &[f64]) -> f64 {
        dispatch!(self, p => p.energy(momentum))
    }

    fn random_momentum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        dispatch!(self, p => p.random_momentum(rng))
    }

    fn update(&mut self, position: &[f64]) {
        dispatch!(self, p => p.update(position))
    }

    fn start_window(&mut self) {
        dispatch!(self, p => p.start_window())
    }

    fn finalize_window(&mut self) -> bool {
        dispatch!(self, p => p.finalize_window())
    }

    fn freeze(&mut self) {
        dispatch!(self, p => p.freeze())
    }
}

/// Which metric a step method should start from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PotentialKind {
    Identity,
    /// Fixed diagonal metric given by per-coordinate variances.
    Diag(Vec<f64>),
    /// Fixed dense metric given by a covariance matrix.
    Dense(DMatrix<f64>),
    #[default]
    DiagAdapt,
    DenseAdapt,
}

impl PotentialKind {
    pub fn build(&self, ndim: usize) -> Result<QuadPotential> {
        let potential = match self {
            PotentialKind::Identity => QuadPotential::Identity(IdentityPotential::new(ndim)),
            PotentialKind::Diag(variances) => {
                QuadPotential::Diag(DiagPotential::new(variances.clone())?)
            }
            PotentialKind::Dense(covariance) => {
                QuadPotential::Dense(DensePotential::new(covariance.clone())?)
            }
            PotentialKind::DiagAdapt => QuadPotential::DiagAdapt(DiagAdaptPotential::new(ndim)),
            PotentialKind::DenseAdapt => {
                QuadPotential::DenseAdapt(DenseAdaptPotential::new(ndim))
            }
        };
        if potential.dim() != ndim {
            return config(format!(
                "potential has dimension {}, the model has {ndim}",
                potential.dim()
            ));
        }
        Ok(potential)
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, PotentialKind::DiagAdapt | PotentialKind::DenseAdapt)
    }
}
