//! End-to-end runs of the NUTS sampler on targets with known answers.

use mini_hmc::adapt::WindowSchedule;
use mini_hmc::distributions::IsotropicGaussian;
use mini_hmc::nuts::{NutsConfig, ProposalScheme};
use mini_hmc::potential::PotentialKind;
use mini_hmc::sampler::Sampler;
use mini_hmc::stats::split_rhat_mean_ess;
use mini_hmc::step::SampleStats;
use ndarray::s;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_shapes_follow_chains_draws_and_dimension() {
        let trace = Sampler::new(IsotropicGaussian::standard(1), 1, NutsConfig::default())
            .unwrap()
            .set_chains(4)
            .set_seed(42)
            .run(1000, 500)
            .unwrap();
        assert_eq!(trace.samples().shape(), &[4, 1000, 1]);
        assert_eq!(trace.warmup_samples().shape(), &[4, 500, 1]);
        for name in SampleStats::NAMES {
            assert_eq!(trace.stat(name).unwrap().shape(), &[4, 1000, 1], "{name}");
        }
        assert!(!trace.is_cancelled());
    }

    #[test]
    fn standard_normal_moments() {
        for proposal in [ProposalScheme::Multinomial, ProposalScheme::Slice] {
            let config = NutsConfig::default().set_proposal(proposal);
            let trace = Sampler::new(IsotropicGaussian::standard(2), 2, config)
                .unwrap()
                .set_chains(4)
                .set_seed(11)
                .run(1000, 500)
                .unwrap();
            let samples = trace.samples();
            let mean = samples.mean().unwrap();
            let var = samples.var(0.0);
            assert!(mean.abs() < 0.1, "{proposal:?}: mean = {mean}");
            assert!((var - 1.0).abs() < 0.15, "{proposal:?}: var = {var}");

            let (rhat, ess) = split_rhat_mean_ess(samples.view());
            assert!(rhat.iter().all(|r| *r < 1.05), "rhat = {rhat}");
            assert!(ess.iter().all(|e| *e > 400.0), "ess = {ess}");
        }
    }

    #[test]
    fn runs_are_reproducible_from_the_seed() {
        let run = || {
            Sampler::new(IsotropicGaussian::standard(3), 3, NutsConfig::default())
                .unwrap()
                .set_chains(3)
                .set_seed(2024)
                .run(200, 200)
                .unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.samples(), b.samples());
        assert_eq!(a.stat("tree_size"), b.stat("tree_size"));
        assert_eq!(a.stat("model_logp"), b.stat("model_logp"));

        let sequential = Sampler::new(IsotropicGaussian::standard(3), 3, NutsConfig::default())
            .unwrap()
            .set_chains(3)
            .set_cores(1)
            .set_seed(2024)
            .run(200, 200)
            .unwrap();
        assert_eq!(a.samples(), sequential.samples());
    }

    #[test]
    fn tree_depth_and_size_are_bounded() {
        let config = NutsConfig::default().set_max_treedepth(4);
        let trace = Sampler::new(IsotropicGaussian::new(vec![0.0; 5], 10.0), 5, config)
            .unwrap()
            .set_chains(2)
            .set_seed(5)
            .run(300, 300)
            .unwrap();
        let depth = trace.stat("depth").unwrap();
        let size = trace.stat("tree_size").unwrap();
        for (d, n) in depth.iter().zip(size.iter()) {
            assert!(*d >= 1.0 && *d <= 4.0);
            assert!(*n >= 1.0 && *n <= 2f64.powf(*d) - 1.0);
        }
    }

    #[test]
    fn dual_averaging_reaches_the_target_acceptance() {
        let config = NutsConfig::default()
            .set_potential(PotentialKind::Identity)
            .set_windows(WindowSchedule::Boundaries(vec![]));
        let trace = Sampler::new(IsotropicGaussian::standard(5), 5, config)
            .unwrap()
            .set_chains(4)
            .set_seed(8)
            .run(10, 1500)
            .unwrap();
        let accept = trace.warmup_stat("mean_tree_accept").unwrap();
        let late = accept.slice(s![.., 1000.., ..]).mean().unwrap();
        assert!((late - 0.8).abs() < 0.05, "mean acceptance = {late}");

        let step_size = trace.stat("step_size").unwrap();
        let bar = trace.stat("step_size_bar").unwrap();
        assert_eq!(step_size, bar);
        for chain in 0..4 {
            assert!(step_size
                .slice(s![chain, .., 0])
                .iter()
                .all(|eps| *eps == step_size[[chain, 0, 0]]));
        }
    }

    #[test]
    fn bounded_support_stays_in_range() {
        let target = |q: &[f64]| {
            let logp = if (0.0..=1.0).contains(&q[0]) {
                0.0
            } else {
                f64::NEG_INFINITY
            };
            (logp, vec![0.0])
        };
        let trace = Sampler::new(target, 1, NutsConfig::default())
            .unwrap()
            .set_chains(2)
            .set_seed(3)
            .set_initial_positions(vec![vec![0.5]])
            .run(500, 500)
            .unwrap();
        let samples = trace.samples();
        assert!(samples.iter().all(|x| (0.0..=1.0).contains(x)));
        let mean = samples.mean().unwrap();
        assert!((mean - 0.5).abs() < 0.1, "mean = {mean}");
    }
}
