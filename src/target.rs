/*!
The log-density interface consumed by every step method.

A target maps a flat position vector to `(log p(q), ∇ log p(q))`. It must be a
pure function of its input and safe to call from several chains at once, hence
the `Sync` bound. Targets may legitimately fail at some points (a bounded
support, an overflow): returning an error or a non-finite value marks the point
as invalid and the integrator treats it as a divergence. A gradient of the
wrong length is a programming error and aborts the run.

# Examples

```rust
use mini_hmc::target::GradientTarget;

// Standard normal in two dimensions, written as a closure.
let target = |q: &[f64]| {
    let logp = -0.5 * q.iter().map(|x| x * x).sum::<f64>();
    (logp, q.iter().map(|x| -x).collect::<Vec<_>>())
};
let (logp, grad) = target.logp_and_grad(&[1.0, 0.0]).unwrap();
assert_eq!(logp, -0.5);
assert_eq!(grad, vec![-1.0, -0.0]);
```
*/

use crate::error::{Error, Result};

/// Error type a target may return for points where it cannot be evaluated.
pub type EvalError = Box<dyn std::error::Error + Send + Sync>;

/// A differentiable, unnormalized log-density.
pub trait GradientTarget: Sync {
    /// Returns the log-density at `position` together with its gradient.
    fn logp_and_grad(&self, position: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvalError>;
}

impl<F> GradientTarget for F
where
    F: Fn(&[f64]) -> (f64, Vec<f64>) + Sync,
{
    fn logp_and_grad(&self, position: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvalError> {
        Ok(self(position))
    }
}

/// Evaluates `target` at `position`.
///
/// `Ok(None)` flags an invalid point: the target returned an error, a
/// non-finite log-density, or a non-finite gradient entry.
pub(crate) fn evaluate<T: GradientTarget + ?Sized>(
    target: &T,
    position: &[f64],
) -> Result<Option<(f64, Vec<f64>)>> {
    let (logp, grad) = match target.logp_and_grad(position) {
        Ok(out) => out,
        Err(err) => {
            log::debug!("log-density evaluation failed: {err}");
            return Ok(None);
        }
    };
    if grad.len() != position.len() {
        return Err(Error::GradientShape {
            expected: position.len(),
            got: grad.len(),
        });
    }
    if !logp.is_finite() || grad.iter().any(|g| !g.is_finite()) {
        return Ok(None);
    }
    Ok(Some((logp, grad)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl GradientTarget for Failing {
        fn logp_and_grad(
            &self,
            _position: &[f64],
        ) -> std::result::Result<(f64, Vec<f64>), EvalError> {
            Err("outside the support".into())
        }
    }

    #[test]
    fn closure_is_a_target() {
        let target = |q: &[f64]| (-q[0] * q[0], vec![-2.0 * q[0]]);
        let (logp, grad) = evaluate(&target, &[2.0]).unwrap().unwrap();
        assert_eq!(logp, -4.0);
        assert_eq!(grad, vec![-4.0]);
    }

    #[test]
    fn non_finite_output_is_an_invalid_point() {
        let target = |_: &[f64]| (f64::NEG_INFINITY, vec![0.0]);
        assert!(evaluate(&target, &[0.0]).unwrap().is_none());

        let target = |_: &[f64]| (0.0, vec![f64::NAN]);
        assert!(evaluate(&target, &[0.0]).unwrap().is_none());

        assert!(evaluate(&Failing, &[0.0]).unwrap().is_none());
    }

    #[test]
    fn wrong_gradient_length_is_fatal() {
        let target = |_: &[f64]| (0.0, vec![0.0, 0.0, 0.0]);
        match evaluate(&target, &[0.0, 1.0]) {
            Err(Error::GradientShape { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected a gradient shape error, got {other:?}"),
        }
    }
}
