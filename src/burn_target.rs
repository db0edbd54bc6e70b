//! Targets whose gradient comes from `burn`'s reverse-mode autodiff.
//!
//! Write the log-density once as tensor operations and wrap it in a
//! [`BurnTarget`]; the sampler then sees an ordinary
//! [`GradientTarget`](crate::target::GradientTarget).
//!
//! ```rust
//! use burn::backend::{Autodiff, NdArray};
//! use burn::tensor::Tensor;
//! use mini_hmc::burn_target::BurnTarget;
//! use mini_hmc::target::GradientTarget;
//!
//! type B = Autodiff<NdArray>;
//!
//! let target = BurnTarget::<B, _>::new(|q: Tensor<B, 1>| q.powi_scalar(2).sum().mul_scalar(-0.5));
//! let (logp, grad) = target.logp_and_grad(&[1.0, 2.0]).unwrap();
//! assert!((logp + 2.5).abs() < 1e-6);
//! assert!((grad[1] + 2.0).abs() < 1e-6);
//! ```

use std::marker::PhantomData;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor, TensorData};

use crate::target::{EvalError, GradientTarget};

/// A log-density written with `burn` tensors.
///
/// Takes the position as a rank-1 tensor and returns the log-density as a
/// tensor with a single element.
pub trait DiffLogDensity<B: AutodiffBackend> {
    fn log_density(&self, position: Tensor<B, 1>) -> Tensor<B, 1>;
}

impl<B, F> DiffLogDensity<B> for F
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 1>) -> Tensor<B, 1>,
{
    fn log_density(&self, position: Tensor<B, 1>) -> Tensor<B, 1> {
        self(position)
    }
}

/// Adapts a [`DiffLogDensity`] to the sampler's target interface.
#[derive(Debug, Clone)]
pub struct BurnTarget<B: AutodiffBackend, F> {
    density: F,
    device: B::Device,
    backend: PhantomData<fn() -> B>,
}

impl<B: AutodiffBackend, F: DiffLogDensity<B>> BurnTarget<B, F> {
    /// Evaluates on the backend's default device.
    pub fn new(density: F) -> Self {
        Self::with_device(density, B::Device::default())
    }

    pub fn with_device(density: F, device: B::Device) -> Self {
        Self {
            density,
            device,
            backend: PhantomData,
        }
    }
}

impl<B, F> GradientTarget for BurnTarget<B, F>
where
    B: AutodiffBackend,
    F: DiffLogDensity<B> + Sync,
{
    fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
        let data = TensorData::new(position.to_vec(), [position.len()]);
        let pos = Tensor::<B, 1>::from_data(data, &self.device).require_grad();
        let logp = self.density.log_density(pos.clone());
        if logp.dims()[0] != 1 {
            return Err(format!(
                "log-density must have exactly one element, got {}",
                logp.dims()[0]
            )
            .into());
        }
        let grads = logp.clone().backward();
        let grad = pos
            .grad(&grads)
            .ok_or("position is not part of the autodiff graph")?
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| format!("could not read gradient: {e:?}"))?;
        Ok((logp.into_scalar().elem::<f64>(), grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Rosenbrock2D;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    fn rosenbrock(q: Tensor<B, 1>) -> Tensor<B, 1> {
        let x = q.clone().slice([0..1]);
        let y = q.slice([1..2]);
        let term_1 = x.clone().neg().add_scalar(1.0).powi_scalar(2);
        let term_2 = y.sub(x.powi_scalar(2)).powi_scalar(2).mul_scalar(100.0);
        -(term_1 + term_2)
    }

    #[test]
    fn matches_hand_written_gradient() {
        let target = BurnTarget::<B, _>::new(rosenbrock);
        let reference = Rosenbrock2D { a: 1.0, b: 100.0 };
        for point in [[0.3, -0.2], [1.0, 1.0], [-0.7, 0.4]] {
            let (logp, grad) = target.logp_and_grad(&point).unwrap();
            let (ref_logp, ref_grad) = reference.logp_and_grad(&point).unwrap();
            assert_abs_diff_eq!(logp, ref_logp, epsilon = 1e-3);
            for (a, b) in grad.iter().zip(&ref_grad) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn non_scalar_density_is_an_error() {
        let target = BurnTarget::<B, _>::new(|q: Tensor<B, 1>| q);
        assert!(target.logp_and_grad(&[1.0, 2.0]).is_err());
    }
}
