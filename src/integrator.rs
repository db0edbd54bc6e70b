//! Leapfrog integration of Hamiltonian dynamics.
//!
//! One step is a half momentum update, a full position update through the
//! potential's velocity map, exactly one evaluation of the log-density at the
//! new position, and a second half momentum update. The step size is signed:
//! negative values integrate backward in time.

use crate::error::Result;
use crate::potential::{dot, Potential};
use crate::target::{evaluate, GradientTarget};

/// Default bound on `|H - H₀|` beyond which a step counts as divergent.
pub const DEFAULT_MAX_ENERGY_ERROR: f64 = 1000.0;

/// A point in phase space together with everything derived from it.
///
/// `log_prob` and `gradient` are always the target's values at `position`;
/// `velocity` and `energy` are derived from `momentum` under the potential
/// that produced the state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub position: Vec<f64>,
    pub momentum: Vec<f64>,
    pub velocity: Vec<f64>,
    pub log_prob: f64,
    pub gradient: Vec<f64>,
    /// Hamiltonian `-log p(q) + ½ pᵀ M⁻¹ p`.
    pub energy: f64,
}

impl State {
    pub fn dim(&self) -> usize {
        self.position.len()
    }
}

/// Whether an energy error marks a divergent step.
pub fn is_divergent(energy_error: f64, max_energy_error: f64) -> bool {
    !energy_error.is_finite() || energy_error.abs() > max_energy_error
}

/// Result of [`Leapfrog::integrate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Last valid state reached.
    pub state: State,
    /// Leapfrog steps attempted, including a divergent last one.
    pub n_steps: usize,
    pub diverging: bool,
    /// Signed energy error with the largest magnitude along the path.
    pub max_energy_error: f64,
}

/// Leapfrog integrator over a borrowed target and a frozen potential.
#[derive(Debug)]
pub struct Leapfrog<'a, T: ?Sized, P> {
    target: &'a T,
    potential: &'a P,
}

impl<T: ?Sized, P> Clone for Leapfrog<'_, T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized, P> Copy for Leapfrog<'_, T, P> {}

impl<'a, T, P> Leapfrog<'a, T, P>
where
    T: GradientTarget + ?Sized,
    P: Potential,
{
    pub fn new(target: &'a T, potential: &'a P) -> Self {
        Self { target, potential }
    }

    pub fn potential(&self) -> &'a P {
        self.potential
    }

    /// Evaluates the target at `position` and returns a state at rest.
    ///
    /// `Ok(None)` if the target is invalid there.
    pub fn init_state(&self, position: Vec<f64>) -> Result<Option<State>> {
        let Some((log_prob, gradient)) = evaluate(self.target, &position)? else {
            return Ok(None);
        };
        let dim = position.len();
        Ok(Some(State {
            position,
            momentum: vec![0.0; dim],
            velocity: vec![0.0; dim],
            log_prob,
            gradient,
            energy: -log_prob,
        }))
    }

    /// Replaces the momentum of `state`. Does not evaluate the target.
    pub fn with_momentum(&self, state: &State, momentum: Vec<f64>) -> State {
        let velocity = self.potential.velocity(&momentum);
        let energy = -state.log_prob + 0.5 * dot(&momentum, &velocity);
        State {
            position: state.position.clone(),
            momentum,
            velocity,
            log_prob: state.log_prob,
            gradient: state.gradient.clone(),
            energy,
        }
    }

    /// One leapfrog step of signed size `step_size`.
    ///
    /// `Ok(None)` if the target is invalid at the new position.
    pub fn step(&self, state: &State, step_size: f64) -> Result<Option<State>> {
        let half = 0.5 * step_size;
        let mut momentum: Vec<f64> = state
            .momentum
            .iter()
            .zip(&state.gradient)
            .map(|(p, g)| p + half * g)
            .collect();
        let velocity = self.potential.velocity(&momentum);
        let position: Vec<f64> = state
            .position
            .iter()
            .zip(&velocity)
            .map(|(q, v)| q + step_size * v)
            .collect();

        let Some((log_prob, gradient)) = evaluate(self.target, &position)? else {
            return Ok(None);
        };
        for (p, g) in momentum.iter_mut().zip(&gradient) {
            *p += half * g;
        }
        let velocity = self.potential.velocity(&momentum);
        let energy = -log_prob + 0.5 * dot(&momentum, &velocity);
        Ok(Some(State {
            position,
            momentum,
            velocity,
            log_prob,
            gradient,
            energy,
        }))
    }

    /// Applies up to `n_steps` leapfrog steps, stopping at the first divergent one.
    pub fn integrate(
        &self,
        state: &State,
        step_size: f64,
        n_steps: usize,
        max_energy_error: f64,
    ) -> Result<Trajectory> {
        let energy0 = state.energy;
        let mut current = state.clone();
        let mut largest = 0.0_f64;
        for taken in 1..=n_steps {
            let (next, error) = match self.step(&current, step_size)? {
                Some(next) => {
                    let error = next.energy - energy0;
                    (Some(next), error)
                }
                None => (None, f64::INFINITY),
            };
            if !(error.abs() <= largest.abs()) {
                largest = error;
            }
            match next {
                Some(next) if !is_divergent(error, max_energy_error) => current = next,
                _ => {
                    return Ok(Trajectory {
                        state: current,
                        n_steps: taken,
                        diverging: true,
                        max_energy_error: largest,
                    })
                }
            }
        }
        Ok(Trajectory {
            state: current,
            n_steps,
            diverging: false,
            max_energy_error: largest,
        })
    }
}
