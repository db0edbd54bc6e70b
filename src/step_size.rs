//! Step-size control: Nesterov dual averaging (Stan variant) and the
//! initial step-size heuristic of Hoffman & Gelman (2014, Algorithm 4).

use rand::Rng;

use crate::error::Result;
use crate::integrator::{Leapfrog, State};
use crate::potential::Potential;
use crate::target::GradientTarget;

const MAX_SEARCH_ATTEMPTS: usize = 100;

/// Dual averaging of the log step size toward a target acceptance statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct DualAverage {
    target_accept: f64,
    log_step: f64,
    log_step_bar: f64,
    h_bar: f64,
    mu: f64,
    count: usize,
    gamma: f64,
    t0: f64,
    kappa: f64,
}

impl DualAverage {
    pub fn new(target_accept: f64, initial_step_size: f64) -> Self {
        let log_step = initial_step_size.ln();
        Self {
            target_accept,
            log_step,
            log_step_bar: log_step,
            h_bar: 0.0,
            mu: (10.0 * initial_step_size).ln(),
            count: 0,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
        }
    }

    /// Update with the acceptance statistic of one transition.
    pub fn update(&mut self, accept_stat: f64) {
        // A NaN statistic would poison every later step size.
        let accept_stat = if accept_stat.is_nan() { 0.0 } else { accept_stat };
        self.count += 1;
        let t = self.count as f64;
        let w = 1.0 / (t + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_stat);
        self.log_step = self.mu - t.sqrt() / self.gamma * self.h_bar;
        let eta = t.powf(-self.kappa);
        self.log_step_bar = eta * self.log_step + (1.0 - eta) * self.log_step_bar;
    }

    /// Step size for the next tuning transition.
    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    /// Averaged step size, used once tuning is over.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_step_bar.exp()
    }

    /// Restarts the recursion around `step_size`, keeping the target.
    pub fn restart(&mut self, step_size: f64) {
        *self = Self::new(self.target_accept, step_size);
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Finds a step size whose single-step acceptance probability is close to 0.5.
///
/// Starting from `trial`, the step size is doubled while the one-step
/// acceptance stays above 0.5 (or halved while it stays below) and the first
/// step size on the other side is returned. If no crossing happens within a
/// bounded number of attempts, `trial` is returned unchanged.
pub fn find_reasonable_step_size<T, P, R>(
    leapfrog: &Leapfrog<'_, T, P>,
    state: &State,
    trial: f64,
    rng: &mut R,
) -> Result<f64>
where
    T: GradientTarget + ?Sized,
    P: Potential,
    R: Rng + ?Sized,
{
    let start = leapfrog.with_momentum(state, leapfrog.potential().random_momentum(rng));
    let accept = |step_size: f64| -> Result<f64> {
        let next = leapfrog.step(&start, step_size)?;
        let prob = next.map_or(0.0, |s| (start.energy - s.energy).exp().min(1.0));
        Ok(if prob.is_nan() { 0.0 } else { prob })
    };

    let grow = accept(trial)? > 0.5;
    let mut step_size = trial;
    for _ in 0..MAX_SEARCH_ATTEMPTS {
        step_size = if grow { step_size * 2.0 } else { step_size * 0.5 };
        let prob = accept(step_size)?;
        if (grow && prob < 0.5) || (!grow && prob > 0.5) {
            log::debug!("initial step size {step_size:.4e}");
            return Ok(step_size);
        }
    }
    log::warn!("step size search did not settle, falling back to {trial}");
    Ok(trial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::IdentityPotential;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn normal(q: &[f64]) -> (f64, Vec<f64>) {
        let logp = -0.5 * q.iter().map(|x| x * x).sum::<f64>();
        (logp, q.iter().map(|x| -x).collect())
    }

    #[test]
    fn low_acceptance_shrinks_the_step() {
        let mut da = DualAverage::new(0.8, 1.0);
        for _ in 0..50 {
            da.update(0.1);
        }
        assert!(da.current_step_size() < 1.0);
        assert!(da.adapted_step_size() < 1.0);
    }

    #[test]
    fn high_acceptance_grows_the_step() {
        let mut da = DualAverage::new(0.8, 0.1);
        for _ in 0..50 {
            da.update(1.0);
        }
        assert!(da.current_step_size() > 0.1);
        assert!(da.adapted_step_size() > 0.1);
    }

    #[test]
    fn restart_resets_the_recursion() {
        let mut da = DualAverage::new(0.65, 1.0);
        da.update(0.2);
        da.update(0.3);
        da.restart(0.5);
        assert_eq!(da, DualAverage::new(0.65, 0.5));
        assert_eq!(da.count(), 0);
    }

    #[test]
    fn step_size_search_crosses_one_half() {
        let target = normal;
        let potential = IdentityPotential::new(5);
        let leapfrog = Leapfrog::new(&target, &potential);
        let state = leapfrog.init_state(vec![0.3; 5]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(42);
        for trial in [1e-4, 1.0, 50.0] {
            let eps = find_reasonable_step_size(&leapfrog, &state, trial, &mut rng).unwrap();
            assert!(eps.is_finite() && eps > 0.0);
            assert!(eps > 1e-3 && eps < 10.0, "eps = {eps} from trial {trial}");
        }
    }

    #[test]
    fn flat_target_falls_back_to_the_trial() {
        let target = |q: &[f64]| (0.0, vec![0.0; q.len()]);
        let potential = IdentityPotential::new(2);
        let leapfrog = Leapfrog::new(&target, &potential);
        let state = leapfrog.init_state(vec![0.0; 2]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let eps = find_reasonable_step_size(&leapfrog, &state, 0.25, &mut rng).unwrap();
        assert_eq!(eps, 0.25);
    }
}
