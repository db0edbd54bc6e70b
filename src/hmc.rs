//! Hamiltonian (Hybrid) Monte Carlo with a fixed trajectory length.
//!
//! Every transition draws a momentum, integrates `path_length / step_size`
//! leapfrog steps and accepts the endpoint with the usual Metropolis
//! probability `min(1, exp(H₀ - H))`. A trajectory that diverges is rejected.
//! During tuning the step size and the mass matrix adapt exactly as for
//! [`Nuts`](crate::nuts::Nuts), with the acceptance probability as feedback.

use rand::Rng;

use crate::adapt::{Adaptation, WindowSchedule};
use crate::error::{config, Result};
use crate::integrator::{Leapfrog, State, DEFAULT_MAX_ENERGY_ERROR};
use crate::potential::{Potential, PotentialKind, QuadPotential};
use crate::step::{
    check_ndim, initial_step_size, validate_common, IntoStepMethod, SampleStats, StepMethod,
    StepSize,
};
use crate::target::GradientTarget;

/// Configuration of [`HamiltonianMC`].
#[derive(Debug, Clone, PartialEq)]
pub struct HmcConfig {
    /// Target acceptance probability for step-size adaptation (default 0.65).
    pub target_accept: f64,
    pub step_size: StepSize,
    /// Integration time per transition (default 2).
    pub path_length: f64,
    /// Upper bound on leapfrog steps per transition (default 1024).
    pub max_steps: usize,
    pub potential: PotentialKind,
    pub windows: WindowSchedule,
    pub max_energy_error: f64,
    pub adapt_step_size: bool,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            target_accept: 0.65,
            step_size: StepSize::Auto,
            path_length: 2.0,
            max_steps: 1024,
            potential: PotentialKind::default(),
            windows: WindowSchedule::default(),
            max_energy_error: DEFAULT_MAX_ENERGY_ERROR,
            adapt_step_size: true,
        }
    }
}

impl HmcConfig {
    pub fn set_target_accept(mut self, target_accept: f64) -> Self {
        self.target_accept = target_accept;
        self
    }

    pub fn set_step_size(mut self, step_size: StepSize) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn set_path_length(mut self, path_length: f64) -> Self {
        self.path_length = path_length;
        self
    }

    pub fn set_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn set_potential(mut self, potential: PotentialKind) -> Self {
        self.potential = potential;
        self
    }

    pub fn set_windows(mut self, windows: WindowSchedule) -> Self {
        self.windows = windows;
        self
    }

    pub fn set_max_energy_error(mut self, max_energy_error: f64) -> Self {
        self.max_energy_error = max_energy_error;
        self
    }

    pub fn set_adapt_step_size(mut self, adapt_step_size: bool) -> Self {
        self.adapt_step_size = adapt_step_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self.target_accept, self.step_size, self.max_energy_error)?;
        if !(self.path_length.is_finite() && self.path_length > 0.0) {
            return config(format!(
                "path_length must be positive and finite, got {}",
                self.path_length
            ));
        }
        if self.max_steps == 0 {
            return config("max_steps must be at least 1");
        }
        Ok(())
    }
}

/// Fixed-length Hamiltonian Monte Carlo.
#[derive(Debug, Clone)]
pub struct HamiltonianMC {
    config: HmcConfig,
    potential: QuadPotential,
    adaptation: Adaptation,
    step_size: f64,
    tuning: bool,
}

impl HamiltonianMC {
    pub fn new(config: HmcConfig, ndim: usize) -> Result<Self> {
        config.validate()?;
        let potential = config.potential.build(ndim)?;
        let step_size = match config.step_size {
            StepSize::Fixed(eps) => eps,
            StepSize::Auto => 0.25 / (ndim as f64).powf(0.25),
        };
        Ok(Self {
            adaptation: Adaptation::new(
                config.target_accept,
                step_size,
                Vec::new(),
                config.adapt_step_size,
            ),
            config,
            potential,
            step_size,
            tuning: true,
        })
    }

    pub fn config(&self) -> &HmcConfig {
        &self.config
    }

    /// Leapfrog steps per transition at the current step size.
    pub fn n_steps(&self) -> usize {
        let n = (self.config.path_length / self.step_size).floor();
        if n.is_finite() {
            (n as usize).clamp(1, self.config.max_steps)
        } else {
            self.config.max_steps
        }
    }

    fn windows(&self, n_tune: usize) -> Result<Vec<std::ops::Range<usize>>> {
        if self.config.potential.is_adaptive() {
            self.config.windows.windows(n_tune)
        } else {
            Ok(Vec::new())
        }
    }
}

impl IntoStepMethod for HmcConfig {
    type Method = HamiltonianMC;

    fn into_step_method(self, ndim: usize) -> Result<HamiltonianMC> {
        HamiltonianMC::new(self, ndim)
    }
}

impl IntoStepMethod for HamiltonianMC {
    type Method = HamiltonianMC;

    fn into_step_method(self, ndim: usize) -> Result<HamiltonianMC> {
        check_ndim(self.ndim(), ndim)?;
        Ok(self)
    }
}

impl StepMethod for HamiltonianMC {
    fn ndim(&self) -> usize {
        self.potential.dim()
    }

    fn check(&self, n_tune: usize) -> Result<()> {
        self.windows(n_tune).map(|_| ())
    }

    fn prepare<T, R>(&mut self, target: &T, state: &State, n_tune: usize, rng: &mut R) -> Result<()>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized,
    {
        self.step_size =
            initial_step_size(self.config.step_size, target, &self.potential, state, rng)?;
        self.adaptation = Adaptation::new(
            self.config.target_accept,
            self.step_size,
            self.windows(n_tune)?,
            self.config.adapt_step_size,
        );
        self.tuning = n_tune > 0;
        Ok(())
    }

    fn step<T, R>(&mut self, target: &T, current: &State, rng: &mut R) -> Result<(State, SampleStats)>
    where
        T: GradientTarget + ?Sized,
        R: Rng + ?Sized,
    {
        let n_steps = self.n_steps();
        let (start, trajectory) = {
            let leapfrog = Leapfrog::new(target, &self.potential);
            let start = leapfrog.with_momentum(current, self.potential.random_momentum(rng));
            let trajectory =
                leapfrog.integrate(&start, self.step_size, n_steps, self.config.max_energy_error)?;
            (start, trajectory)
        };

        let energy_error = trajectory.state.energy - start.energy;
        let accept_prob = if trajectory.diverging {
            0.0
        } else {
            (-energy_error).exp().min(1.0)
        };
        let accepted = !trajectory.diverging && rng.gen::<f64>().ln() < -energy_error;
        let next = if accepted { trajectory.state } else { start };

        let stats = SampleStats {
            depth: 0,
            step_size: self.step_size,
            step_size_bar: self.adaptation.final_step_size(),
            tree_size: trajectory.n_steps,
            diverging: trajectory.diverging,
            reached_max_treedepth: false,
            energy: next.energy,
            energy_error: if accepted { energy_error } else { 0.0 },
            max_energy_error: trajectory.max_energy_error,
            mean_tree_accept: accept_prob,
            tune: self.tuning,
            model_logp: next.log_prob,
        };
        if self.tuning {
            self.step_size = self
                .adaptation
                .tune(&mut self.potential, &next.position, accept_prob);
        }
        Ok((next, stats))
    }

    fn stop_tuning(&mut self) {
        if self.tuning {
            self.tuning = false;
            self.step_size = self.adaptation.final_step_size();
            self.potential.freeze();
        }
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn potential(&self) -> &QuadPotential {
        &self.potential
    }
}
