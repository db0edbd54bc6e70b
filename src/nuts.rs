/*!
The No-U-Turn Sampler (Hoffman & Gelman, 2014) with multinomial or slice
proposal weighting.

A transition draws a fresh momentum and repeatedly doubles a leapfrog
trajectory in a random direction. Each doubling builds a balanced subtree
recursively, so only the two endpoints and the current proposal of any subtree
are alive at a time. Doubling stops when the trajectory makes a U-turn, when a
leapfrog step diverges, or at `max_treedepth`.

The U-turn criterion uses the velocity `M⁻¹ p` at both ends of a span:
```text
Δq = q⁺ - q⁻      turning  ⇔  Δq · v⁻ < 0  or  Δq · v⁺ < 0
```
When two subtrees are joined it is checked on the joined span and on the two
spans that straddle the junction, which catches U-turns that happen entirely
between the halves.

# Examples

```rust
use mini_hmc::nuts::NutsConfig;
use mini_hmc::sampler::Sampler;

let target = |q: &[f64]| (-0.5 * q[0] * q[0], vec![-q[0]]);
let config = NutsConfig::default().set_target_accept(0.9);
let trace = Sampler::new(target, 1, config)
    .unwrap()
    .set_chains(2)
    .set_seed(7)
    .run(200, 200)
    .unwrap();
assert_eq!(trace.samples().shape(), &[2, 200, 1]);
```
*/

use rand::Rng;

use crate::adapt::{Adaptation, WindowSchedule};
use crate::error::{config, Result};
use crate::integrator::{is_divergent, Leapfrog, State, DEFAULT_MAX_ENERGY_ERROR};
use crate::potential::{dot, Potential, PotentialKind, QuadPotential};
use crate::step::{
    check_ndim, initial_step_size, validate_common, IntoStepMethod, SampleStats, StepMethod,
    StepSize,
};
use crate::target::GradientTarget;

/// How leaves are weighted when the proposal is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposalScheme {
    /// Leaves weighted by `exp(-H)`.
    #[default]
    Multinomial,
    /// Uniform over leaves inside a slice drawn under `exp(-H₀)`.
    Slice,
}

/// Configuration of [`Nuts`].
#[derive(Debug, Clone, PartialEq)]
pub struct NutsConfig {
    /// Target mean acceptance statistic for step-size adaptation (default 0.8).
    pub target_accept: f64,
    pub step_size: StepSize,
    /// Maximum number of doublings (default 10).
    pub max_treedepth: usize,
    pub potential: PotentialKind,
    pub windows: WindowSchedule,
    /// Energy error beyond which a leapfrog step diverges (default 1000).
    pub max_energy_error: f64,
    pub proposal: ProposalScheme,
    pub adapt_step_size: bool,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            step_size: StepSize::Auto,
            max_treedepth: 10,
            potential: PotentialKind::default(),
            windows: WindowSchedule::default(),
            max_energy_error: DEFAULT_MAX_ENERGY_ERROR,
            proposal: ProposalScheme::default(),
            adapt_step_size: true,
        }
    }
}

impl NutsConfig {
    pub fn set_target_accept(mut self, target_accept: f64) -> Self {
        self.target_accept = target_accept;
        self
    }

    pub fn set_step_size(mut self, step_size: StepSize) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn set_max_treedepth(mut self, max_treedepth: usize) -> Self {
        self.max_treedepth = max_treedepth;
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

    pub fn set_proposal(mut self, proposal: ProposalScheme) -> Self {
        self.proposal = proposal;
        self
    }

    pub fn set_adapt_step_size(mut self, adapt_step_size: bool) -> Self {
        self.adapt_step_size = adapt_step_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self.target_accept, self.step_size, self.max_energy_error)?;
        if self.max_treedepth == 0 {
            return config("max_treedepth must be at least 1");
        }
        Ok(())
    }
}

/// The No-U-Turn step method.
#[derive(Debug, Clone)]
pub struct Nuts {
    config: NutsConfig,
    potential: QuadPotential,
    adaptation: Adaptation,
    step_size: f64,
    tuning: bool,
}

impl Nuts {
    pub fn new(config: NutsConfig, ndim: usize) -> Result<Self> {
        config.validate()?;
        let potential = config.potential.build(ndim)?;
        let step_size = match config.step_size {
            StepSize::Fixed(eps) => eps,
            StepSize::Auto => 0.25 / (ndim as f64).powf(0.25),
        };
        let adaptation = Adaptation::new(
            config.target_accept,
            step_size,
            Vec::new(),
            config.adapt_step_size,
        );
        Ok(Self {
            config,
            potential,
            adaptation,
            step_size,
            tuning: true,
        })
    }

    pub fn config(&self) -> &NutsConfig {
        &self.config
    }

    fn windows(&self, n_tune: usize) -> Result<Vec<std::ops::Range<usize>>> {
        if self.config.potential.is_adaptive() {
            self.config.windows.windows(n_tune)
        } else {
            Ok(Vec::new())
        }
    }
}

impl IntoStepMethod for NutsConfig {
    type Method = Nuts;

    fn into_step_method(self, ndim: usize) -> Result<Nuts> {
        Nuts::new(self, ndim)
    }
}

impl IntoStepMethod for Nuts {
    type Method = Nuts;

    fn into_step_method(self, ndim: usize) -> Result<Nuts> {
        check_ndim(self.ndim(), ndim)?;
        Ok(self)
    }
}

impl StepMethod for Nuts {
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
        let transition = {
            let leapfrog = Leapfrog::new(target, &self.potential);
            let start = leapfrog.with_momentum(current, self.potential.random_momentum(rng));
            TreeBuilder::new(
                leapfrog,
                self.step_size,
                start.energy,
                self.config.max_energy_error,
                self.config.proposal,
                rng,
            )
            .transition(start, self.config.max_treedepth, rng)?
        };

        let stats = SampleStats {
            depth: transition.depth,
            step_size: self.step_size,
            step_size_bar: self.adaptation.final_step_size(),
            tree_size: transition.n_steps,
            diverging: transition.diverging,
            reached_max_treedepth: transition.reached_max_treedepth,
            energy: transition.state.energy,
            energy_error: transition.energy_error,
            max_energy_error: transition.max_energy_error,
            mean_tree_accept: transition.mean_tree_accept,
            tune: self.tuning,
            model_logp: transition.state.log_prob,
        };
        if self.tuning {
            self.step_size = self.adaptation.tune(
                &mut self.potential,
                &transition.state.position,
                transition.mean_tree_accept,
            );
        }
        Ok((transition.state, stats))
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

/// Why a subtree stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Diverging,
    Turning,
}

/// A contiguous piece of trajectory. `left` is earliest in time.
#[derive(Debug, Clone)]
struct Subtree {
    left: State,
    right: State,
    proposal: State,
    /// Log of the summed leaf weights.
    log_size: f64,
}

impl Subtree {
    fn leaf(state: State, log_size: f64) -> Self {
        Self {
            left: state.clone(),
            right: state.clone(),
            proposal: state,
            log_size,
        }
    }

    fn edge(&self, direction: Direction) -> &State {
        match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        }
    }

    /// Joins `self` with `other`, which was grown from `self` in `direction`.
    /// Returns the merged tree and whether it makes a U-turn.
    fn join(self, other: Subtree, direction: Direction, proposal: State) -> (Subtree, bool) {
        let (lo, hi) = match direction {
            Direction::Forward => (self, other),
            Direction::Backward => (other, self),
        };
        let turning = is_turning(&lo.left, &hi.right)
            || is_turning(&lo.left, &hi.left)
            || is_turning(&lo.right, &hi.right);
        let log_size = log_add_exp(lo.log_size, hi.log_size);
        (
            Subtree {
                left: lo.left,
                right: hi.right,
                proposal,
                log_size,
            },
            turning,
        )
    }
}

fn is_turning(left: &State, right: &State) -> bool {
    let dq: Vec<f64> = right
        .position
        .iter()
        .zip(&left.position)
        .map(|(r, l)| r - l)
        .collect();
    dot(&dq, &left.velocity) < 0.0 || dot(&dq, &right.velocity) < 0.0
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Outcome of one NUTS transition.
#[derive(Debug, Clone)]
struct Transition {
    state: State,
    depth: usize,
    n_steps: usize,
    diverging: bool,
    reached_max_treedepth: bool,
    energy_error: f64,
    max_energy_error: f64,
    mean_tree_accept: f64,
}

/// Builds the trajectory of a single transition.
struct TreeBuilder<'a, T: ?Sized, P> {
    leapfrog: Leapfrog<'a, T, P>,
    step_size: f64,
    energy0: f64,
    max_energy_error: f64,
    scheme: ProposalScheme,
    /// Log slice level relative to `-H₀`, only used by the slice scheme.
    log_slice: f64,
    n_steps: usize,
    sum_accept: f64,
    largest_error: f64,
}

impl<'a, T, P> TreeBuilder<'a, T, P>
where
    T: GradientTarget + ?Sized,
    P: Potential,
{
    fn new<R: Rng + ?Sized>(
        leapfrog: Leapfrog<'a, T, P>,
        step_size: f64,
        energy0: f64,
        max_energy_error: f64,
        scheme: ProposalScheme,
        rng: &mut R,
    ) -> Self {
        let log_slice = match scheme {
            ProposalScheme::Multinomial => f64::NEG_INFINITY,
            ProposalScheme::Slice => rng.gen::<f64>().ln(),
        };
        Self {
            leapfrog,
            step_size,
            energy0,
            max_energy_error,
            scheme,
            log_slice,
            n_steps: 0,
            sum_accept: 0.0,
            largest_error: 0.0,
        }
    }

    fn transition<R: Rng + ?Sized>(
        mut self,
        start: State,
        max_treedepth: usize,
        rng: &mut R,
    ) -> Result<Transition> {
        let mut tree = Subtree::leaf(start, 0.0);
        let mut depth = 0;
        let mut halt = None;

        while depth < max_treedepth {
            let direction = if rng.gen::<bool>() {
                Direction::Forward
            } else {
                Direction::Backward
            };
            let extension = self.build(tree.edge(direction), depth, direction, rng)?;
            depth += 1;
            let subtree = match extension {
                Ok(subtree) => subtree,
                Err(h) => {
                    halt = Some(h);
                    break;
                }
            };

            // Biased progressive sampling favours the newer half.
            let log_accept = subtree.log_size - tree.log_size;
            let proposal = if rng.gen::<f64>().ln() < log_accept {
                subtree.proposal.clone()
            } else {
                tree.proposal.clone()
            };
            let (joined, turning) = tree.join(subtree, direction, proposal);
            tree = joined;
            if turning {
                halt = Some(Halt::Turning);
                break;
            }
        }

        let state = tree.proposal;
        let energy_error = state.energy - self.energy0;
        Ok(Transition {
            depth,
            n_steps: self.n_steps,
            diverging: halt == Some(Halt::Diverging),
            reached_max_treedepth: halt.is_none() && depth >= max_treedepth,
            energy_error,
            max_energy_error: self.largest_error,
            mean_tree_accept: if self.n_steps == 0 {
                0.0
            } else {
                self.sum_accept / self.n_steps as f64
            },
            state,
        })
    }

    /// Grows a subtree of `2^depth` leaves starting next to `from`.
    fn build<R: Rng + ?Sized>(
        &mut self,
        from: &State,
        depth: usize,
        direction: Direction,
        rng: &mut R,
    ) -> Result<std::result::Result<Subtree, Halt>> {
        if depth == 0 {
            return self.leaf(from, direction);
        }
        let first = match self.build(from, depth - 1, direction, rng)? {
            Ok(tree) => tree,
            halted => return Ok(halted),
        };
        let second = match self.build(first.edge(direction), depth - 1, direction, rng)? {
            Ok(tree) => tree,
            halted => return Ok(halted),
        };

        // Uniform progressive sampling inside a subtree.
        let log_total = log_add_exp(first.log_size, second.log_size);
        let proposal = if rng.gen::<f64>().ln() < second.log_size - log_total {
            second.proposal.clone()
        } else {
            first.proposal.clone()
        };
        let (tree, turning) = first.join(second, direction, proposal);
        if turning {
            return Ok(Err(Halt::Turning));
        }
        Ok(Ok(tree))
    }

    fn leaf(
        &mut self,
        from: &State,
        direction: Direction,
    ) -> Result<std::result::Result<Subtree, Halt>> {
        self.n_steps += 1;
        let next = self.leapfrog.step(from, direction.sign() * self.step_size)?;
        let error = next
            .as_ref()
            .map_or(f64::INFINITY, |s| s.energy - self.energy0);
        if !(error.abs() <= self.largest_error.abs()) {
            self.largest_error = error;
        }
        let state = match next {
            Some(state) if !is_divergent(error, self.max_energy_error) => state,
            _ => return Ok(Err(Halt::Diverging)),
        };

        self.sum_accept += (-error).exp().min(1.0);
        let log_weight = match self.scheme {
            ProposalScheme::Multinomial => -error,
            ProposalScheme::Slice if -error >= self.log_slice => 0.0,
            ProposalScheme::Slice => f64::NEG_INFINITY,
        };
        Ok(Ok(Subtree::leaf(state, log_weight)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn normal(q: &[f64]) -> (f64, Vec<f64>) {
        let logp = -0.5 * q.iter().map(|x| x * x).sum::<f64>();
        (logp, q.iter().map(|x| -x).collect())
    }

    fn state_at(position: Vec<f64>, velocity: Vec<f64>) -> State {
        let dim = position.len();
        State {
            position,
            momentum: velocity.clone(),
            velocity,
            log_prob: 0.0,
            gradient: vec![0.0; dim],
            energy: 0.0,
        }
    }

    fn fixed_nuts(step_size: f64, max_treedepth: usize) -> Nuts {
        let config = NutsConfig::default()
            .set_step_size(StepSize::Fixed(step_size))
            .set_max_treedepth(max_treedepth)
            .set_potential(PotentialKind::Identity)
            .set_adapt_step_size(false);
        let mut nuts = Nuts::new(config, 1).unwrap();
        nuts.stop_tuning();
        nuts
    }

    #[test]
    fn u_turn_criterion() {
        let left = state_at(vec![0.0, 0.0], vec![1.0, 0.0]);
        let right = state_at(vec![1.0, 0.0], vec![1.0, 0.5]);
        assert!(!is_turning(&left, &right));
        let back = state_at(vec![1.0, 0.0], vec![-1.0, 0.0]);
        assert!(is_turning(&left, &back));
        let left_back = state_at(vec![0.0, 0.0], vec![-0.1, 1.0]);
        assert!(is_turning(&left_back, &right));
    }

    #[test]
    fn join_checks_the_junction_spans() {
        // The full span looks fine but the two halves turn against each other.
        let first = Subtree {
            left: state_at(vec![0.0], vec![1.0]),
            right: state_at(vec![2.0], vec![1.0]),
            proposal: state_at(vec![1.0], vec![1.0]),
            log_size: 0.0,
        };
        let second = Subtree {
            left: state_at(vec![1.5], vec![1.0]),
            right: state_at(vec![3.0], vec![1.0]),
            proposal: state_at(vec![2.5], vec![1.0]),
            log_size: 0.0,
        };
        let proposal = first.proposal.clone();
        let (joined, turning) = first.join(second, Direction::Forward, proposal);
        assert!(turning);
        assert_eq!(joined.left.position, vec![0.0]);
        assert_eq!(joined.right.position, vec![3.0]);
        assert_abs_diff_eq!(joined.log_size, 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn backward_join_keeps_time_order() {
        let first = Subtree::leaf(state_at(vec![0.0], vec![1.0]), 0.0);
        let second = Subtree::leaf(state_at(vec![-1.0], vec![1.0]), 0.0);
        let proposal = second.proposal.clone();
        let (joined, turning) = first.join(second, Direction::Backward, proposal);
        assert!(!turning);
        assert_eq!(joined.left.position, vec![-1.0]);
        assert_eq!(joined.right.position, vec![0.0]);
    }

    #[test]
    fn log_add_exp_handles_empty_weights() {
        assert_eq!(log_add_exp(f64::NEG_INFINITY, 1.5), 1.5);
        assert_eq!(log_add_exp(-2.0, f64::NEG_INFINITY), -2.0);
        assert_abs_diff_eq!(log_add_exp(0.0, 0.0), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_add_exp(1000.0, 1000.0), 1000.0 + 2f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn tiny_steps_saturate_the_tree_depth() {
        let target = normal;
        let mut nuts = fixed_nuts(1e-5, 3);
        let leapfrog = Leapfrog::new(&target, nuts.potential());
        let state = leapfrog.init_state(vec![0.5]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..20 {
            let (_, stats) = nuts.step(&target, &state, &mut rng).unwrap();
            assert_eq!(stats.depth, 3);
            assert_eq!(stats.tree_size, 7);
            assert!(stats.reached_max_treedepth);
            assert!(!stats.diverging);
            assert!(stats.mean_tree_accept > 0.99);
        }
    }

    #[test]
    fn tree_size_is_bounded_by_depth() {
        let target = normal;
        let mut nuts = fixed_nuts(0.3, 6);
        let leapfrog = Leapfrog::new(&target, nuts.potential());
        let mut state = leapfrog.init_state(vec![1.0]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(17);
        for _ in 0..500 {
            let (next, stats) = nuts.step(&target, &state, &mut rng).unwrap();
            assert!(stats.depth >= 1 && stats.depth <= 6);
            assert!(stats.tree_size >= 1);
            assert!(stats.tree_size < 1 << stats.depth);
            assert!(!stats.diverging);
            assert!((0.0..=1.0).contains(&stats.mean_tree_accept));
            assert_eq!(stats.model_logp, next.log_prob);
            state = next;
        }
    }

    #[test]
    fn huge_steps_diverge_without_failing() {
        let target = normal;
        let mut nuts = fixed_nuts(1e3, 10);
        let leapfrog = Leapfrog::new(&target, nuts.potential());
        let state = leapfrog.init_state(vec![0.5]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(2);
        let (next, stats) = nuts.step(&target, &state, &mut rng).unwrap();
        assert!(stats.diverging);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.tree_size, 1);
        assert_eq!(stats.mean_tree_accept, 0.0);
        assert_eq!(next.position, state.position);
    }

    #[test]
    fn slice_scheme_samples_too() {
        let target = normal;
        let config = NutsConfig::default()
            .set_step_size(StepSize::Fixed(0.5))
            .set_potential(PotentialKind::Identity)
            .set_proposal(ProposalScheme::Slice)
            .set_adapt_step_size(false);
        let mut nuts = Nuts::new(config, 1).unwrap();
        nuts.stop_tuning();
        let leapfrog = Leapfrog::new(&target, nuts.potential());
        let mut state = leapfrog.init_state(vec![0.0]).unwrap().unwrap();
        let mut rng = SmallRng::seed_from_u64(23);
        let n = 4000;
        let (mut sum, mut sum_sq) = (0.0, 0.0);
        for _ in 0..n {
            let (next, _) = nuts.step(&target, &state, &mut rng).unwrap();
            sum += next.position[0];
            sum_sq += next.position[0].powi(2);
            state = next;
        }
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((sum_sq / n as f64 - 1.0).abs() < 0.15);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(Nuts::new(NutsConfig::default().set_max_treedepth(0), 1).is_err());
        assert!(Nuts::new(NutsConfig::default().set_target_accept(1.2), 1).is_err());
        let nuts = Nuts::new(NutsConfig::default(), 2).unwrap();
        assert!(nuts.into_step_method(3).is_err());
        let nuts = Nuts::new(NutsConfig::default(), 2).unwrap();
        assert!(nuts.check(100).is_ok());
        let boundaries = NutsConfig::default().set_windows(WindowSchedule::Boundaries(vec![10, 500]));
        assert!(Nuts::new(boundaries, 2).unwrap().check(100).is_err());
    }
}
