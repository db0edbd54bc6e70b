//! Convergence diagnostics: split R-hat and effective sample size.
//!
//! Both follow the Stan reference manual. Chains are split in half, the
//! between/within variance decomposition gives R-hat, and ESS sums the
//! combined autocorrelation using Geyer's initial monotone sequence.

use std::cmp::Ordering;
use std::fmt;

use ndarray::prelude::*;
use ndarray::{concatenate, stack};
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Summary of a set of per-parameter values.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct BasicStats {
    pub name: String,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl fmt::Display for BasicStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in [{:.2}, {:.2}], median: {:.2}, mean: {:.2} ± {:.2}",
            self.name, self.min, self.max, self.median, self.mean, self.std
        )
    }
}

/// Computes basic statistics, ignoring `NaN` entries for the extrema.
pub fn basic_stats(name: &str, data: ArrayView1<f64>) -> BasicStats {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let median = sorted.get(sorted.len() / 2).copied().unwrap_or(f64::NAN);
    BasicStats {
        name: name.to_string(),
        min: *data.min_skipnan(),
        median,
        max: *data.max_skipnan(),
        mean: data.mean().unwrap_or(f64::NAN),
        std: if data.len() > 1 { data.std(1.0) } else { 0.0 },
    }
}

/// ESS and split R-hat summaries of one run.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct RunStats {
    pub ess: BasicStats,
    pub rhat: BasicStats,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.ess, self.rhat)
    }
}

impl<T> From<ArrayView3<'_, T>> for RunStats
where
    T: ToPrimitive + Clone,
{
    fn from(sample: ArrayView3<T>) -> Self {
        let (rhat, ess) = split_rhat_mean_ess(sample);
        RunStats {
            ess: basic_stats("ESS", ess.view()),
            rhat: basic_stats("Split R-hat", rhat.view()),
        }
    }
}

/// Split R-hat and ESS per parameter of a `(chains, draws, parameters)` sample.
///
/// Both are `NaN` when there are fewer than four draws per chain, and ESS is
/// `NaN` for a parameter that never varies.
pub fn split_rhat_mean_ess<T>(sample: ArrayView3<T>) -> (Array1<f64>, Array1<f64>)
where
    T: ToPrimitive + Clone,
{
    let sample = sample.mapv(|x| x.to_f64().unwrap_or(f64::NAN));
    let (n_chains, n_draws, n_params) = sample.dim();
    if n_chains == 0 || n_draws < 4 {
        return (
            Array1::from_elem(n_params, f64::NAN),
            Array1::from_elem(n_params, f64::NAN),
        );
    }
    let split = splitcat(sample.view());
    let (within, var) = withinvar(split.view());
    let rhat = (&var / &within).sqrt();
    let ess = ess(split.view(), within.view(), var.view());
    (rhat, ess)
}

/// `(chains, draws, params)` to `(2 * chains, draws / 2, params)`, dropping
/// the middle draw of odd-length chains.
fn splitcat(sample: ArrayView3<f64>) -> Array3<f64> {
    let n = sample.shape()[1];
    let half = n / 2;
    let first = sample.slice(s![.., ..half, ..]);
    let second = sample.slice(s![.., n - half.., ..]);
    concatenate(Axis(0), &[first, second]).expect("Expected stacking two halves to succeed")
}

/// Mean within-chain variance and the pooled variance estimate per parameter.
fn withinvar(sample: ArrayView3<f64>) -> (Array1<f64>, Array1<f64>) {
    let (c, n, p) = sample.dim();
    let (within, var): (Vec<f64>, Vec<f64>) = (0..p)
        .into_par_iter()
        .map(|param| {
            let data = sample.slice(s![.., .., param]);
            let chain_means = data.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(c));
            let overall = chain_means.mean().unwrap_or(0.0);
            let between = if c > 1 {
                (&chain_means - overall).pow2().sum() * n as f64 / (c - 1) as f64
            } else {
                0.0
            };
            let w = data
                .outer_iter()
                .zip(chain_means.iter())
                .map(|(row, m)| row.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1) as f64)
                .sum::<f64>()
                / c as f64;
            let v = (n - 1) as f64 / n as f64 * w + between / n as f64;
            (w, v)
        })
        .unzip();
    (Array1::from_vec(within), Array1::from_vec(var))
}

fn ess(sample: ArrayView3<f64>, within: ArrayView1<f64>, var: ArrayView1<f64>) -> Array1<f64> {
    let (n_chains, n_draws, n_params) = sample.dim();
    let autocovs: Vec<Array2<f64>> = sample.outer_iter().map(autocov).collect();
    let views: Vec<ArrayView2<f64>> = autocovs.iter().map(|a| a.view()).collect();
    let mean_autocov = stack(Axis(0), &views)
        .ok()
        .and_then(|s| s.mean_axis(Axis(0)))
        .unwrap_or_else(|| Array2::zeros((n_draws, n_params)));

    let tau: Vec<f64> = (0..n_params)
        .into_par_iter()
        .map(|d| {
            if !(var[d] > 0.0) {
                return f64::NAN;
            }
            let rho: Vec<f64> = mean_autocov
                .column(d)
                .iter()
                .map(|acov| 1.0 - (within[d] - acov) / var[d])
                .collect();
            let tau = geyer_tau(&rho);
            if tau > 0.0 {
                tau
            } else {
                f64::NAN
            }
        })
        .collect();
    Array1::from_vec(tau).mapv(|t| (n_chains * n_draws) as f64 / t)
}

/// Integrated autocorrelation time from Geyer's initial monotone sequence.
fn geyer_tau(rho: &[f64]) -> f64 {
    let mut min = f64::INFINITY;
    let mut sum = 0.0;
    for pair in rho.chunks_exact(2) {
        let mut p = pair[0] + pair[1];
        if !(p > 0.0) {
            break;
        }
        if p > min {
            p = min;
        }
        min = p;
        sum += p;
    }
    -1.0 + 2.0 * sum
}

fn autocov(sample: ArrayView2<f64>) -> Array2<f64> {
    if sample.nrows() <= 100 {
        autocov_bf(sample)
    } else {
        autocov_fft(sample)
    }
}

/// Autocovariance of every column of a `(n, d)` array via zero-padded FFT.
fn autocov_fft(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = sample.dim();
    let mut n_padded = 1;
    while n_padded < 2 * n - 1 {
        n_padded <<= 1;
    }
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_padded);
    let ifft = planner.plan_fft_inverse(n_padded);

    let columns: Vec<Vec<f64>> = (0..d)
        .into_par_iter()
        .map(|j| {
            let col = sample.column(j);
            let mean = col.mean().unwrap_or(0.0);
            let mut buf: Vec<Complex<f64>> = col
                .iter()
                .map(|x| Complex::new(x - mean, 0.0))
                .chain(std::iter::repeat(Complex::new(0.0, 0.0)).take(n_padded - n))
                .collect();
            fft.process(&mut buf);
            buf.iter_mut().for_each(|x| *x *= x.conj());
            ifft.process(&mut buf);
            // rustfft leaves the transforms unnormalized.
            buf.iter()
                .take(n)
                .map(|x| x.re / n_padded as f64 / n as f64)
                .collect()
        })
        .collect();
    Array2::from_shape_fn((n, d), |(t, j)| columns[j][t])
}

/// Brute-force autocovariance, same layout as [`autocov_fft`].
fn autocov_bf(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = sample.dim();
    let mut out = Array2::<f64>::zeros((n, d));
    for (mut out_col, col) in out.axis_iter_mut(Axis(1)).zip(sample.axis_iter(Axis(1))) {
        let centered = &col - col.mean().unwrap_or(0.0);
        for lag in 0..n {
            let s: f64 = (0..n - lag).map(|t| centered[t] * centered[t + lag]).sum();
            out_col[lag] = s / n as f64;
        }
    }
    out
}
