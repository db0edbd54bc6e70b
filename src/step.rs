/*!
The per-step contract shared by all step methods.

The driver holds one [`StepMethod`] per chain and only ever calls `prepare`
once, `step` for every transition, and `stop_tuning` at the end of warm-up.
It never branches on which method it holds. Step methods are built either
from a configuration record or from a pre-built instance through
[`IntoStepMethod`]. [`StepMethodConfig`] selects one at runtime.
*/

use rand::Rng;

use crate::error::{config, Result};
use crate::hmc::{HamiltonianMC, HmcConfig};
use crate::integrator::{Leapfrog, State};
use crate::nuts::{Nuts, NutsConfig};
use crate::potential::{Potential, QuadPotential};
use crate::step_size::find_reasonable_step_size;
use crate::target::GradientTarget;

/// Initial step size of a step method.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StepSize {
    /// Search for a step size with single-step acceptance near 0.5.
    #[default]
    Auto,
    Fixed(f64),
}

/// Diagnostics recorded for every transition.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleStats {
    /// Number of trajectory doublings (0 for fixed-length HMC).
    pub depth: usize,
    /// Step size used for this transition.
    pub step_size: f64,
    /// Averaged step size the chain will use after tuning.
    pub step_size_bar: f64,
    /// Leapfrog steps taken.
    pub tree_size: usize,
    pub diverging: bool,
    pub reached_max_treedepth: bool,
    /// Hamiltonian of the returned state.
    pub energy: f64,
    /// Energy change between the initial and the returned state.
    pub energy_error: f64,
    /// Signed energy change with the largest magnitude along the trajectory.
    pub max_energy_error: f64,
    /// Mean acceptance probability over the trajectory.
    pub mean_tree_accept: f64,
    pub tune: bool,
    pub model_logp: f64,
}

impl SampleStats {
    pub const NAMES: [&'static str; 12] = [
        "depth",
        "step_size",
        "step_size_bar",
        "tree_size",
        "diverging",
        "reached_max_treedepth",
        "energy",
        "energy_error",
        "max_energy_error",
        "mean_tree_accept",
        "tune",
        "model_logp",
    ];

    /// All fields as `f64`, in the order of [`SampleStats::NAMES`].
    pub fn values(&self) -> [f64; 12] {
        [
            self.depth as f64,
            self.step_size,
            self.step_size_bar,
            self.tree_size as f64,
            f64::from(u8::from(self.diverging)),
            f64::from(u8::from(self.reached_max_treedepth)),
            self.energy,
            self.energy_error,
            self.max_energy_error,
            self.mean_tree_accept,
            f64::from(u8::from(self.tune)),
            self.model_logp,
        ]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        Self::NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values()[i])
    }
}

/// A Markov transition kernel driven by the sampler.
pub trait StepMethod: Clone + Send + Sync {
    /// Dimensionality of the positions this method was built for.
    fn ndim(&self) -> usize;

    /// Validates run-dependent configuration before any chain starts.
    fn check(&self, n_tune: usize) -> Result<()>;

    /// Picks the initial step size and resolves the adaptation schedule.
    fn prepare<T, R>(
        &mut self,
        target: &T,
        state: &State,
        n_tune: usize,
        rng: &mut R,
    ) -> Result<()>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized;

    /// Performs one transition from `current`.
    ///
    /// During tuning this also feeds the adaptation. Errors are reserved for
    /// contract violations of the target; divergences come back as stats.
    fn step<T, R>(&mut self, target: &T, current: &State, rng: &mut R) -> Result<(State, SampleStats)>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized;

    /// Ends tuning: fixes the averaged step size and freezes the potential.
    fn stop_tuning(&mut self);

    fn step_size(&self) -> f64;

    fn potential(&self) -> &QuadPotential;
}

/// Anything the sampler accepts as a step method.
pub trait IntoStepMethod {
    type Method: StepMethod;

    fn into_step_method(self, ndim: usize) -> Result<Self::Method>;
}

/// Runtime selection of a step method configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum StepMethodConfig {
    Nuts(NutsConfig),
    Hmc(HmcConfig),
}

impl Default for StepMethodConfig {
    fn default() -> Self {
        StepMethodConfig::Nuts(NutsConfig::default())
    }
}

impl From<NutsConfig> for StepMethodConfig {
    fn from(config: NutsConfig) -> Self {
        StepMethodConfig::Nuts(config)
    }
}

impl From<HmcConfig> for StepMethodConfig {
    fn from(config: HmcConfig) -> Self {
        StepMethodConfig::Hmc(config)
    }
}

/// A step method chosen at runtime.
#[derive(Debug, Clone)]
pub enum AnyStep {
    Nuts(Nuts),
    Hmc(HamiltonianMC),
}

impl IntoStepMethod for StepMethodConfig {
    type Method = AnyStep;

    fn into_step_method(self, ndim: usize) -> Result<AnyStep> {
        Ok(match self {
            StepMethodConfig::Nuts(c) => AnyStep::Nuts(c.into_step_method(ndim)?),
            StepMethodConfig::Hmc(c) => AnyStep::Hmc(c.into_step_method(ndim)?),
        })
    }
}

impl IntoStepMethod for AnyStep {
    type Method = AnyStep;

    fn into_step_method(self, ndim: usize) -> Result<AnyStep> {
        check_ndim(self.ndim(), ndim)?;
        Ok(self)
    }
}

impl StepMethod for AnyStep {
    fn ndim(&self) -> usize {
        match self {
            AnyStep::Nuts(s) => s.ndim(),
            AnyStep::Hmc(s) => s.ndim(),
        }
    }

    fn check(&self, n_tune: usize) -> Result<()> {
        match self {
            AnyStep::Nuts(s) => s.check(n_tune),
            AnyStep::Hmc(s) => s.check(n_tune),
        }
    }

    fn prepare<T, R>(&mut self, target: &T, state: &State, n_tune: usize, rng: &mut R) -> Result<()>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            AnyStep::Nuts(s) => s.prepare(target, state, n_tune, rng),
            AnyStep::Hmc(s) => s.prepare(target, state, n_tune, rng),
        }
    }

    fn step<T, R>(&mut self, target: &T, current: &State, rng: &mut R) -> Result<(State, SampleStats)>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            AnyStep::Nuts(s) => s.step(target, current, rng),
            AnyStep::Hmc(s) => s.step(target, current, rng),
        }
    }

    fn stop_tuning(&mut self) {
        match self {
            AnyStep::Nuts(s) => s.stop_tuning(),
            AnyStep::Hmc(s) => s.stop_tuning(),
        }
    }

    fn step_size(&self) -> f64 {
        match self {
            AnyStep::Nuts(s) => s.step_size(),
            AnyStep::Hmc(s) => s.step_size(),
        }
    }

    fn potential(&self) -> &QuadPotential {
        match self {
            AnyStep::Nuts(s) => s.potential(),
            AnyStep::Hmc(s) => s.potential(),
        }
    }
}

pub(crate) fn check_ndim(method: usize, model: usize) -> Result<()> {
    if method != model {
        return config(format!(
            "step method was built for {method} dimensions, the model has {model}"
        ));
    }
    Ok(())
}

/// Checks the options shared by all step methods.
pub(crate) fn validate_common(
    target_accept: f64,
    step_size: StepSize,
    max_energy_error: f64,
) -> Result<()> {
    if !(target_accept > 0.0 && target_accept < 1.0) {
        return config(format!("target_accept must lie in (0, 1), got {target_accept}"));
    }
    if let StepSize::Fixed(eps) = step_size {
        if !(eps.is_finite() && eps > 0.0) {
            return config(format!("step size must be positive and finite, got {eps}"));
        }
    }
    if !(max_energy_error > 0.0) {
        return config(format!(
            "divergence threshold must be positive, got {max_energy_error}"
        ));
    }
    Ok(())
}

/// Resolves [`StepSize`] into a concrete value at the chain's starting point.
pub(crate) fn initial_step_size<T, R>(
    step_size: StepSize,
    target: &T,
    potential: &QuadPotential,
    state: &State,
    rng: &mut R,
) -> Result<f64>
where
    T: GradientTarget + ?Sized,
    R: Rng + ?Sized,
{
    match step_size {
        StepSize::Fixed(eps) => Ok(eps),
        StepSize::Auto => {
            let trial = 0.25 / (potential.dim() as f64).powf(0.25);
            let leapfrog = Leapfrog::new(target, potential);
            find_reasonable_step_size(&leapfrog, state, trial, rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_lookup_by_name() {
        let stats = SampleStats {
            depth: 3,
            tree_size: 7,
            diverging: true,
            tune: true,
            energy: 1.5,
            model_logp: -2.0,
            ..Default::default()
        };
        assert_eq!(stats.get("depth"), Some(3.0));
        assert_eq!(stats.get("tree_size"), Some(7.0));
        assert_eq!(stats.get("diverging"), Some(1.0));
        assert_eq!(stats.get("reached_max_treedepth"), Some(0.0));
        assert_eq!(stats.get("tune"), Some(1.0));
        assert_eq!(stats.get("energy"), Some(1.5));
        assert_eq!(stats.get("model_logp"), Some(-2.0));
        assert_eq!(stats.get("accept"), None);
        assert_eq!(stats.values().len(), SampleStats::NAMES.len());
    }

    #[test]
    fn common_validation() {
        assert!(validate_common(0.8, StepSize::Auto, 1000.0).is_ok());
        assert!(validate_common(1.0, StepSize::Auto, 1000.0).is_err());
        assert!(validate_common(0.0, StepSize::Auto, 1000.0).is_err());
        assert!(validate_common(f64::NAN, StepSize::Auto, 1000.0).is_err());
        assert!(validate_common(0.8, StepSize::Fixed(0.0), 1000.0).is_err());
        assert!(validate_common(0.8, StepSize::Fixed(f64::INFINITY), 1000.0).is_err());
        assert!(validate_common(0.8, StepSize::Fixed(0.1), -1.0).is_err());
    }

    #[test]
    fn runtime_selection_builds_the_right_method() {
        let nuts = StepMethodConfig::default().into_step_method(2).unwrap();
        assert!(matches!(nuts, AnyStep::Nuts(_)));
        let hmc = StepMethodConfig::from(HmcConfig::default())
            .into_step_method(2)
            .unwrap();
        assert!(matches!(hmc, AnyStep::Hmc(_)));
        assert_eq!(hmc.ndim(), 2);
        assert!(hmc.into_step_method(3).is_err());
    }
}
