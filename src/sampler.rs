/*!
The multi-chain driver.

A [`Sampler`] owns the target, a template step method, and the run options.
Every chain gets its own clone of the step method (and with it its own
potential and step-size state) and its own random number generator seeded with
`seed + chain`. Chains run in parallel on a dedicated `rayon` pool unless a
single worker is configured.

# Examples

```rust
use mini_hmc::hmc::HmcConfig;
use mini_hmc::sampler::Sampler;

let target = |q: &[f64]| {
    let logp = -0.5 * q.iter().map(|x| x * x).sum::<f64>();
    (logp, q.iter().map(|x| -x).collect::<Vec<_>>())
};
let trace = Sampler::new(target, 3, HmcConfig::default())
    .unwrap()
    .set_chains(2)
    .set_seed(42)
    .run(100, 100)
    .unwrap();
assert_eq!(trace.samples().shape(), &[2, 100, 3]);
assert_eq!(trace.stat("diverging").unwrap().shape(), &[2, 100, 1]);
```
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{config, Error, Result};
use crate::integrator::{Leapfrog, State};
use crate::stats::RunStats;
use crate::step::{IntoStepMethod, StepMethod};
use crate::target::GradientTarget;
use crate::trace::{ChainTrace, Draw, Trace};

const INIT_ATTEMPTS: usize = 10;

/// Handle for stopping a running sampler from another thread.
///
/// Chains stop at the next completed step; draws taken so far are kept.
/// The flag is cleared when the run returns, so the sampler can run again.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clears the flag, returning whether it was set.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

/// Runs independent chains of a step method against a target.
pub struct Sampler<T, S> {
    target: T,
    ndim: usize,
    step: S,
    n_chains: usize,
    cores: usize,
    seed: u64,
    initial_positions: Option<Vec<Vec<f64>>>,
    jitter: f64,
    cancel: CancelToken,
}

impl<T, S> Sampler<T, S>
where
    T: GradientTarget,
    S: StepMethod,
{
    /// Creates a sampler with 4 chains, one worker per available core and a
    /// random seed.
    ///
    /// `step` is either a configuration ([`NutsConfig`](crate::nuts::NutsConfig),
    /// [`HmcConfig`](crate::hmc::HmcConfig),
    /// [`StepMethodConfig`](crate::step::StepMethodConfig)) or a pre-built step method.
    pub fn new<I>(target: T, ndim: usize, step: I) -> Result<Self>
    where
        I: IntoStepMethod<Method = S>,
    {
        if ndim == 0 {
            return config("model dimensionality must be at least 1");
        }
        let step = step.into_step_method(ndim)?;
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Ok(Self {
            target,
            ndim,
            step,
            n_chains: 4,
            cores,
            seed: rand::thread_rng().gen::<u64>(),
            initial_positions: None,
            jitter: 1.0,
            cancel: CancelToken::new(),
        })
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_chains(mut self, n_chains: usize) -> Self {
        self.n_chains = n_chains;
        self
    }

    /// Maximum number of chains running at the same time.
    pub fn set_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Starting points, one per chain or a single one shared by all chains.
    pub fn set_initial_positions(mut self, positions: Vec<Vec<f64>>) -> Self {
        self.initial_positions = Some(positions);
        self
    }

    /// Half-width of the uniform jitter around the origin used when no
    /// initial positions are given (default 1).
    pub fn set_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Shares an existing token with the sampler.
    pub fn set_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn step_method(&self) -> &S {
        &self.step
    }

    /// Runs `n_tune` tuning steps followed by `n_draws` recorded draws per chain.
    pub fn run(&self, n_draws: usize, n_tune: usize) -> Result<Trace> {
        self.validate(n_draws, n_tune)?;
        let chains = self.run_chains(|chain| self.run_chain(chain, n_draws, n_tune, None));
        self.finish(chains)
    }

    /// Like [`Sampler::run`] with one progress bar per chain, also returning
    /// split R-hat and ESS summaries of the draws.
    pub fn run_progress(&self, n_draws: usize, n_tune: usize) -> Result<(Trace, RunStats)> {
        self.validate(n_draws, n_tune)?;
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-");
        let bars: Vec<ProgressBar> = (0..self.n_chains)
            .map(|chain| {
                let pb = multi.add(ProgressBar::new((n_tune + n_draws) as u64));
                pb.set_prefix(format!("Chain {chain}"));
                pb.set_style(style.clone());
                pb
            })
            .collect();

        let chains = self.run_chains(|chain| {
            let pb = &bars[chain];
            let trace = self.run_chain(chain, n_draws, n_tune, Some(pb));
            let divergent = trace.as_ref().map_or(0, ChainTrace::n_divergent);
            pb.finish_with_message(format!("Done! {divergent} divergences"));
            trace
        });
        let trace = self.finish(chains)?;
        let stats = RunStats::from(trace.samples().view());
        Ok((trace, stats))
    }

    fn validate(&self, n_draws: usize, n_tune: usize) -> Result<()> {
        if self.n_chains == 0 {
            return config("the number of chains must be at least 1");
        }
        if n_draws == 0 {
            return config("the number of draws must be at least 1");
        }
        if n_tune == 0 {
            return config("the number of tuning steps must be at least 1");
        }
        if !(self.jitter.is_finite() && self.jitter >= 0.0) {
            return config(format!(
                "initial jitter must be non-negative and finite, got {}",
                self.jitter
            ));
        }
        if let Some(positions) = &self.initial_positions {
            if positions.len() != 1 && positions.len() != self.n_chains {
                return config(format!(
                    "got {} initial positions for {} chains",
                    positions.len(),
                    self.n_chains
                ));
            }
            if let Some(bad) = positions.iter().find(|p| p.len() != self.ndim) {
                return Err(Error::PositionShape {
                    expected: self.ndim,
                    got: bad.len(),
                });
            }
        }
        self.step.check(n_tune)
    }

    fn run_chains<F>(&self, run: F) -> Result<Vec<ChainTrace>>
    where
        F: Fn(usize) -> Result<ChainTrace> + Sync + Send,
    {
        let workers = self.cores.min(self.n_chains).max(1);
        if workers == 1 {
            return (0..self.n_chains).map(run).collect();
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        pool.install(|| (0..self.n_chains).into_par_iter().map(run).collect())
    }

    fn run_chain(
        &self,
        chain: usize,
        n_draws: usize,
        n_tune: usize,
        progress: Option<&ProgressBar>,
    ) -> Result<ChainTrace> {
        let seed = self.seed.wrapping_add(chain as u64);
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut step = self.step.clone();
        let mut state = self.initial_state(chain, &step, &mut rng)?;
        step.prepare(&self.target, &state, n_tune, &mut rng)?;

        let mut warmup = Vec::with_capacity(n_tune);
        let mut draws = Vec::with_capacity(n_draws);
        for i in 0..n_tune + n_draws {
            if self.cancel.is_cancelled() {
                break;
            }
            if i == n_tune {
                step.stop_tuning();
            }
            let (next, stats) = step.step(&self.target, &state, &mut rng)?;
            state = next;
            let draw = Draw {
                position: state.position.clone(),
                stats,
            };
            if i < n_tune {
                warmup.push(draw);
            } else {
                draws.push(draw);
            }
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }

        let trace = ChainTrace {
            chain,
            seed,
            warmup,
            draws,
        };
        let divergent = trace.n_divergent();
        if divergent > 0 {
            log::warn!("chain {chain}: {divergent} divergent transitions after tuning");
        }
        let saturated = trace
            .draws
            .iter()
            .filter(|d| d.stats.reached_max_treedepth)
            .count();
        if saturated > 0 {
            log::warn!("chain {chain}: {saturated} transitions reached the maximum tree depth");
        }
        log::info!(
            "chain {chain}: {} tuning steps, {} draws, final step size {:.4e}",
            trace.warmup.len(),
            trace.draws.len(),
            step.step_size()
        );
        Ok(trace)
    }

    fn initial_state<R: Rng + ?Sized>(&self, chain: usize, step: &S, rng: &mut R) -> Result<State> {
        let leapfrog = Leapfrog::new(&self.target, step.potential());
        if let Some(positions) = &self.initial_positions {
            let position = positions[chain % positions.len()].clone();
            return leapfrog
                .init_state(position)?
                .ok_or(Error::InitialPoint { chain, attempts: 1 });
        }
        for _ in 0..INIT_ATTEMPTS {
            let position = (0..self.ndim)
                .map(|_| {
                    if self.jitter > 0.0 {
                        rng.gen_range(-self.jitter..self.jitter)
                    } else {
                        0.0
                    }
                })
                .collect();
            if let Some(state) = leapfrog.init_state(position)? {
                return Ok(state);
            }
        }
        Err(Error::InitialPoint {
            chain,
            attempts: INIT_ATTEMPTS,
        })
    }

    /// Resets the cancellation flag for the next run and, if this run was
    /// cancelled, cuts the chains that got going to a common length. Chains
    /// that never took a step are dropped unless none did.
    fn finish(&self, chains: Result<Vec<ChainTrace>>) -> Result<Trace> {
        let cancelled = self.cancel.take();
        let mut chains = chains?;
        if cancelled {
            if chains.iter().any(|c| !c.warmup.is_empty() || !c.draws.is_empty()) {
                chains.retain(|c| !c.warmup.is_empty() || !c.draws.is_empty());
            }
            let warmup = chains.iter().map(|c| c.warmup.len()).min().unwrap_or(0);
            let draws = chains.iter().map(|c| c.draws.len()).min().unwrap_or(0);
            for chain in &mut chains {
                chain.warmup.truncate(warmup);
                chain.draws.truncate(draws);
            }
            log::warn!("sampling cancelled after {warmup} tuning steps and {draws} draws per chain");
        }
        Ok(Trace::new(self.ndim, chains, cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuts::NutsConfig;
    use std::sync::atomic::AtomicUsize;

    fn normal(q: &[f64]) -> (f64, Vec<f64>) {
        let logp = -0.5 * q.iter().map(|x| x * x).sum::<f64>();
        (logp, q.iter().map(|x| -x).collect())
    }

    #[test]
    fn rejects_bad_run_parameters() {
        assert!(Sampler::new(normal, 0, NutsConfig::default()).is_err());
        let sampler = Sampler::new(normal, 2, NutsConfig::default()).unwrap();
        assert!(sampler.run(0, 10).is_err());
        assert!(sampler.run(10, 0).is_err());
        let sampler = sampler.set_chains(0);
        assert!(sampler.run(10, 10).is_err());
        let sampler = sampler.set_chains(2).set_initial_positions(vec![vec![0.0; 3]]);
        assert!(matches!(
            sampler.run(10, 10),
            Err(Error::PositionShape {
                expected: 2,
                got: 3
            })
        ));
        let sampler = sampler.set_initial_positions(vec![vec![0.0; 2]; 3]);
        assert!(matches!(sampler.run(10, 10), Err(Error::Config(_))));
    }

    #[test]
    fn initial_positions_are_used() {
        let trace = Sampler::new(normal, 1, NutsConfig::default())
            .unwrap()
            .set_chains(2)
            .set_cores(1)
            .set_seed(3)
            .set_initial_positions(vec![vec![5.0], vec![-5.0]])
            .run(1, 1)
            .unwrap();
        let first = trace.warmup_stat("model_logp").unwrap();
        assert_eq!(first.shape(), &[2, 1, 1]);
        assert_eq!(trace.chains()[0].seed, 3);
        assert_eq!(trace.chains()[1].seed, 4);
    }

    #[test]
    fn no_finite_starting_point() {
        let target = |q: &[f64]| (f64::NEG_INFINITY, vec![0.0; q.len()]);
        let sampler = Sampler::new(target, 1, NutsConfig::default())
            .unwrap()
            .set_chains(1);
        assert!(matches!(
            sampler.run(10, 10),
            Err(Error::InitialPoint {
                chain: 0,
                attempts: INIT_ATTEMPTS
            })
        ));
    }

    #[test]
    fn gradient_shape_errors_abort_the_run() {
        let target = |_: &[f64]| (0.0, vec![0.0; 5]);
        let sampler = Sampler::new(target, 2, NutsConfig::default())
            .unwrap()
            .set_chains(2)
            .set_seed(1);
        assert!(matches!(
            sampler.run(10, 10),
            Err(Error::GradientShape {
                expected: 2,
                got: 5
            })
        ));
    }

    #[test]
    fn cancelling_a_sequential_run_keeps_finished_work() {
        let token = CancelToken::new();
        let evaluations = AtomicUsize::new(0);
        let target = |q: &[f64]| {
            if evaluations.fetch_add(1, Ordering::Relaxed) + 1 == 2000 {
                token.cancel();
            }
            normal(q)
        };
        let sampler = Sampler::new(target, 1, NutsConfig::default())
            .unwrap()
            .set_chains(2)
            .set_cores(1)
            .set_seed(11)
            .set_cancel_token(token.clone());

        let trace = sampler.run(500, 500).unwrap();
        assert!(trace.is_cancelled());
        assert_eq!(trace.n_chains(), 1);
        assert_eq!(trace.chains()[0].chain, 0);
        assert!(trace.n_warmup() > 0);
        assert_eq!(trace.warmup_samples().shape(), &[1, trace.n_warmup(), 1]);
        assert_eq!(trace.samples().shape(), &[1, trace.n_draws(), 1]);

        // The next run starts with a clear flag.
        assert!(!token.is_cancelled());
        let trace = sampler.run(50, 50).unwrap();
        assert!(!trace.is_cancelled());
        assert_eq!(trace.samples().shape(), &[2, 50, 1]);
    }

    #[test]
    fn cancelled_run_keeps_a_common_prefix() {
        let sampler = Sampler::new(normal, 1, NutsConfig::default())
            .unwrap()
            .set_chains(3)
            .set_seed(5);
        sampler.cancel_token().cancel();
        let trace = sampler.run(50, 50).unwrap();
        assert!(trace.is_cancelled());
        assert_eq!(trace.n_chains(), 3);
        assert_eq!(trace.n_draws(), 0);
        assert_eq!(trace.samples().shape(), &[3, 0, 1]);
        assert!(!sampler.cancel_token().is_cancelled());
        assert_eq!(sampler.run(20, 20).unwrap().n_draws(), 20);
    }
}
