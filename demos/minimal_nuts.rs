use mini_hmc::distributions::Rosenbrock2D;
use mini_hmc::nuts::NutsConfig;
use mini_hmc::sampler::Sampler;
use ndarray_stats::QuantileExt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Create the 2D Rosenbrock target (a = 1, b = 100).
    let target = Rosenbrock2D { a: 1.0, b: 100.0 };

    // Four chains, NUTS with target_accept = 0.95.
    let config = NutsConfig::default().set_target_accept(0.95);
    let sampler = Sampler::new(target, 2, config)?
        .set_chains(4)
        .set_seed(42);

    let (trace, stats) = sampler.run_progress(400, 400)?;
    println!(
        "NUTS sampler: generated {} observations, {} divergent.",
        trace.n_chains() * trace.n_draws(),
        trace.n_divergent()
    );
    assert_eq!(trace.samples().shape(), &[4, 400, 2]);

    println!("{stats}");
    if let Some(depth) = trace.stat("depth") {
        println!("MAX tree depth: {}", depth.max()?);
    }
    Ok(())
}
