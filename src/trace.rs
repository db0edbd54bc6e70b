//! Collected draws and their diagnostics.
//!
//! A [`Trace`] keeps every chain's warm-up and post-warm-up draws and exposes
//! them as `[chain, draw, parameter]` arrays. Diagnostics come back with the
//! same leading axes and a trailing axis of length one.

use std::collections::BTreeMap;

use ndarray::Array3;

use crate::step::SampleStats;

/// One recorded transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub position: Vec<f64>,
    pub stats: SampleStats,
}

/// All draws of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    pub chain: usize,
    /// Seed of the chain's random number generator.
    pub seed: u64,
    /// Draws taken while tuning, flagged with `tune = true`.
    pub warmup: Vec<Draw>,
    pub draws: Vec<Draw>,
}

impl ChainTrace {
    pub fn n_divergent(&self) -> usize {
        self.draws.iter().filter(|d| d.stats.diverging).count()
    }
}

/// Result of a sampler run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    ndim: usize,
    chains: Vec<ChainTrace>,
    cancelled: bool,
}

impl Trace {
    pub(crate) fn new(ndim: usize, chains: Vec<ChainTrace>, cancelled: bool) -> Self {
        Self {
            ndim,
            chains,
            cancelled,
        }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Post-warm-up draws per chain.
    pub fn n_draws(&self) -> usize {
        self.chains.first().map_or(0, |c| c.draws.len())
    }

    /// Warm-up draws per chain.
    pub fn n_warmup(&self) -> usize {
        self.chains.first().map_or(0, |c| c.warmup.len())
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    /// Whether the run was cancelled. Chains are then cut to a common length.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Post-warm-up positions, shape `[chain, draw, parameter]`.
    pub fn samples(&self) -> Array3<f64> {
        self.positions(self.n_draws(), |c| &c.draws)
    }

    /// Warm-up positions, shape `[chain, draw, parameter]`.
    pub fn warmup_samples(&self) -> Array3<f64> {
        self.positions(self.n_warmup(), |c| &c.warmup)
    }

    /// One post-warm-up diagnostic, shape `[chain, draw, 1]`.
    ///
    /// `None` if `name` is not one of [`SampleStats::NAMES`].
    pub fn stat(&self, name: &str) -> Option<Array3<f64>> {
        self.stat_of(name, self.n_draws(), |c| &c.draws)
    }

    /// One warm-up diagnostic, shape `[chain, draw, 1]`.
    pub fn warmup_stat(&self, name: &str) -> Option<Array3<f64>> {
        self.stat_of(name, self.n_warmup(), |c| &c.warmup)
    }

    /// Every post-warm-up diagnostic by name.
    pub fn stats(&self) -> BTreeMap<&'static str, Array3<f64>> {
        SampleStats::NAMES
            .iter()
            .filter_map(|name| self.stat(name).map(|a| (*name, a)))
            .collect()
    }

    /// Number of divergent post-warm-up transitions over all chains.
    pub fn n_divergent(&self) -> usize {
        self.chains.iter().map(ChainTrace::n_divergent).sum()
    }

    fn positions(&self, n: usize, draws: impl Fn(&ChainTrace) -> &Vec<Draw>) -> Array3<f64> {
        Array3::from_shape_fn((self.chains.len(), n, self.ndim), |(c, d, p)| {
            draws(&self.chains[c])[d].position[p]
        })
    }

    fn stat_of(
        &self,
        name: &str,
        n: usize,
        draws: impl Fn(&ChainTrace) -> &Vec<Draw>,
    ) -> Option<Array3<f64>> {
        let index = SampleStats::NAMES.iter().position(|s| *s == name)?;
        Some(Array3::from_shape_fn((self.chains.len(), n, 1), |(c, d, _)| {
            draws(&self.chains[c])[d].stats.values()[index]
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(x: f64, diverging: bool, tune: bool) -> Draw {
        Draw {
            position: vec![x, -x],
            stats: SampleStats {
                diverging,
                tune,
                model_logp: -x,
                ..Default::default()
            },
        }
    }

    fn trace() -> Trace {
        let chains = (0..3)
            .map(|c| ChainTrace {
                chain: c,
                seed: 10 + c as u64,
                warmup: vec![draw(-1.0, true, true)],
                draws: (0..4)
                    .map(|d| draw((10 * c + d) as f64, d == 2, false))
                    .collect(),
            })
            .collect();
        Trace::new(2, chains, false)
    }

    #[test]
    fn arrays_are_chain_draw_param() {
        let trace = trace();
        let samples = trace.samples();
        assert_eq!(samples.shape(), &[3, 4, 2]);
        assert_eq!(samples[[2, 3, 0]], 23.0);
        assert_eq!(samples[[1, 0, 1]], -10.0);
        assert_eq!(trace.warmup_samples().shape(), &[3, 1, 2]);
    }

    #[test]
    fn stats_share_the_leading_axes() {
        let trace = trace();
        let stats = trace.stats();
        assert_eq!(stats.len(), SampleStats::NAMES.len());
        for array in stats.values() {
            assert_eq!(array.shape(), &[3, 4, 1]);
        }
        assert_eq!(stats["model_logp"][[1, 2, 0]], -12.0);
        assert_eq!(stats["tune"].sum(), 0.0);
        assert_eq!(trace.warmup_stat("tune").unwrap().sum(), 3.0);
        assert!(trace.stat("nope").is_none());
        assert_eq!(trace.n_divergent(), 3);
    }
}
