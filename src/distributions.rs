/*!
Ready-made differentiable targets, mostly for tests, demos and benchmarks.

# Examples

```rust
use mini_hmc::distributions::{IsotropicGaussian, Rosenbrock2D};
use mini_hmc::target::GradientTarget;

let gauss = IsotropicGaussian::new(vec![1.0, -1.0], 2.0);
let (logp, grad) = gauss.logp_and_grad(&[1.0, 1.0]).unwrap();
assert_eq!(logp, -0.5);
assert_eq!(grad, vec![0.0, -0.5]);

let banana = Rosenbrock2D { a: 1.0, b: 100.0 };
let (logp, _) = banana.logp_and_grad(&[1.0, 1.0]).unwrap();
assert_eq!(logp, 0.0);
```
*/

use nalgebra::{DMatrix, DVector};

use crate::error::{config, Error, Result};
use crate::target::{EvalError, GradientTarget};

fn check_len(expected: usize, got: usize) -> std::result::Result<(), EvalError> {
    if expected != got {
        return Err(Box::new(Error::PositionShape { expected, got }));
    }
    Ok(())
}

/// Independent normal coordinates sharing one standard deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotropicGaussian {
    pub mean: Vec<f64>,
    pub std: f64,
}

impl IsotropicGaussian {
    pub fn new(mean: Vec<f64>, std: f64) -> Self {
        Self { mean, std }
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self::new(vec![0.0; dim], 1.0)
    }
}

impl GradientTarget for IsotropicGaussian {
    fn logp_and_grad(&self, position: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvalError> {
        check_len(self.mean.len(), position.len())?;
        let var = self.std * self.std;
        let diff: Vec<f64> = position.iter().zip(&self.mean).map(|(x, m)| x - m).collect();
        let logp = -0.5 * diff.iter().map(|d| d * d).sum::<f64>() / var;
        Ok((logp, diff.iter().map(|d| -d / var).collect()))
    }
}

/// Correlated normal given by a mean and a covariance matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateGaussian {
    mean: DVector<f64>,
    precision: DMatrix<f64>,
}

impl MultivariateGaussian {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return config(format!(
                "covariance of shape {}x{} does not match a mean of length {}",
                cov.nrows(),
                cov.ncols(),
                mean.len()
            ));
        }
        let precision = cov
            .cholesky()
            .ok_or_else(|| Error::Config("covariance is not positive definite".to_string()))?
            .inverse();
        Ok(Self { mean, precision })
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
}

impl GradientTarget for MultivariateGaussian {
    fn logp_and_grad(&self, position: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvalError> {
        check_len(self.mean.len(), position.len())?;
        let diff = DVector::from_column_slice(position) - &self.mean;
        let grad = -(&self.precision * &diff);
        let logp = 0.5 * diff.dot(&grad);
        Ok((logp, grad.as_slice().to_vec()))
    }
}

/// The Rosenbrock "banana" `-((a - x)² + b (y - x²)²)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rosenbrock2D {
    pub a: f64,
    pub b: f64,
}

impl GradientTarget for Rosenbrock2D {
    fn logp_and_grad(&self, position: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvalError> {
        check_len(2, position.len())?;
        let (x, y) = (position[0], position[1]);
        let r = y - x * x;
        let logp = -((self.a - x).powi(2) + self.b * r * r);
        let dx = 2.0 * (self.a - x) + 4.0 * self.b * r * x;
        let dy = -2.0 * self.b * r;
        Ok((logp, vec![dx, dy]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn finite_difference<T: GradientTarget>(target: &T, x: &[f64]) -> Vec<f64> {
        let h = 1e-6;
        (0..x.len())
            .map(|i| {
                let mut up = x.to_vec();
                let mut down = x.to_vec();
                up[i] += h;
                down[i] -= h;
                let (fu, _) = target.logp_and_grad(&up).unwrap();
                let (fd, _) = target.logp_and_grad(&down).unwrap();
                (fu - fd) / (2.0 * h)
            })
            .collect()
    }

    fn check_gradient<T: GradientTarget>(target: &T, x: &[f64]) {
        let (_, grad) = target.logp_and_grad(x).unwrap();
        for (a, b) in grad.iter().zip(finite_difference(target, x)) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        check_gradient(&IsotropicGaussian::new(vec![0.5, -1.0, 2.0], 0.7), &[0.1, 0.2, 0.3]);
        check_gradient(&Rosenbrock2D { a: 1.0, b: 5.0 }, &[0.3, -0.4]);
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.6, 0.6, 0.5]);
        let mvn = MultivariateGaussian::new(DVector::from_vec(vec![1.0, -1.0]), cov).unwrap();
        check_gradient(&mvn, &[0.2, 0.9]);
    }

    #[test]
    fn wrong_length_is_an_evaluation_error() {
        assert!(IsotropicGaussian::standard(2).logp_and_grad(&[0.0]).is_err());
        assert!(Rosenbrock2D { a: 1.0, b: 1.0 }
            .logp_and_grad(&[0.0, 1.0, 2.0])
            .is_err());
    }

    #[test]
    fn rejects_bad_covariance() {
        let mean = DVector::from_vec(vec![0.0, 0.0]);
        let not_pd = DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        assert!(MultivariateGaussian::new(mean.clone(), not_pd).is_err());
        assert!(MultivariateGaussian::new(mean, DMatrix::identity(3, 3)).is_err());
    }
}
