//! NUTS on a 3D Rosenbrock density whose gradient comes from burn's autodiff.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::Tensor;
use mini_hmc::burn_target::{BurnTarget, DiffLogDensity};
use mini_hmc::nuts::NutsConfig;
use mini_hmc::sampler::Sampler;

type BackendType = Autodiff<NdArray>;

/// `-Σ 100 (x_{i+1} - x_i²)² + (1 - x_i)²`.
struct RosenbrockND;

impl DiffLogDensity<BackendType> for RosenbrockND {
    fn log_density(&self, position: Tensor<BackendType, 1>) -> Tensor<BackendType, 1> {
        let n = position.dims()[0];
        let low = position.clone().slice([0..n - 1]);
        let high = position.slice([1..n]);
        let term_1 = (high - low.clone().powi_scalar(2))
            .powi_scalar(2)
            .mul_scalar(100.0);
        let term_2 = low.neg().add_scalar(1.0).powi_scalar(2);
        -(term_1 + term_2).sum()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let target = BurnTarget::<BackendType, _>::new(RosenbrockND);
    let sampler = Sampler::new(target, 3, NutsConfig::default())?
        .set_chains(4)
        .set_seed(42);
    let (trace, stats) = sampler.run_progress(500, 500)?;
    println!(
        "Collected {} draws per chain, {} divergent",
        trace.n_draws(),
        trace.n_divergent()
    );
    println!("{stats}");
    Ok(())
}
