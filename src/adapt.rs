//! Warm-up adaptation: online moment estimators, the mass-matrix window
//! schedule, and the per-chain [`Adaptation`] state that drives both the
//! step-size controller and the adaptive potentials during tuning.
//!
//! The default schedule follows Stan: an initial fast buffer where only the
//! step size moves, a sequence of doubling slow windows that each publish a
//! fresh mass matrix, and a terminal fast buffer.
//! ```text
//! n_tune = 1000:
//!   0..75      step size only
//!   75..100    slow window, mass matrix published at 100
//!   100..150   slow window
//!   150..250   slow window
//!   250..450   slow window
//!   450..950   slow window (extended to the terminal buffer)
//!   950..1000  step size only
//! ```

use std::ops::Range;

use nalgebra::DMatrix;

use crate::error::{config, Result};
use crate::potential::Potential;
use crate::step_size::DualAverage;

/// Online Welford variance estimator (diagonal mass matrix).
#[derive(Debug, Clone, PartialEq)]
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    /// Create for `dim`-dimensional parameter vector.
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Incorporate a new sample.
    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &xi) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let delta = xi - *mean;
            *mean += delta / n;
            *m2 += delta * (xi - *mean);
        }
    }

    /// Unbiased sample variance, `None` with fewer than two samples.
    pub fn variance(&self) -> Option<Vec<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = self.count as f64 - 1.0;
        Some(self.m2.iter().map(|m| m / denom).collect())
    }

    /// Sample variance shrunk toward `1e-3` with weight `5 / (n + 5)`.
    pub fn regularized_variance(&self) -> Option<Vec<f64>> {
        let n = self.count as f64;
        let (alpha, prior) = shrinkage(n);
        self.variance()
            .map(|var| var.into_iter().map(|v| alpha * v + prior).collect())
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Online Welford covariance estimator (dense mass matrix).
#[derive(Debug, Clone, PartialEq)]
pub struct WelfordCovariance {
    mean: Vec<f64>,
    m2: DMatrix<f64>,
    count: usize,
}

impl WelfordCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: DMatrix::zeros(dim, dim),
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        let delta: Vec<f64> = x.iter().zip(&self.mean).map(|(xi, m)| xi - m).collect();
        for (mean, d) in self.mean.iter_mut().zip(&delta) {
            *mean += d / n;
        }
        let delta2: Vec<f64> = x.iter().zip(&self.mean).map(|(xi, m)| xi - m).collect();
        let dim = self.mean.len();
        for i in 0..dim {
            for j in 0..dim {
                self.m2[(i, j)] += delta[i] * delta2[j];
            }
        }
    }

    /// Unbiased sample covariance, `None` with fewer than two samples.
    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = self.count as f64 - 1.0;
        // M2 is symmetric only up to rounding.
        let cov = &self.m2 / denom;
        Some((&cov + cov.transpose()) * 0.5)
    }

    /// Sample covariance shrunk toward `1e-3 * I` with weight `5 / (n + 5)`.
    pub fn regularized_covariance(&self) -> Option<DMatrix<f64>> {
        let (alpha, prior) = shrinkage(self.count as f64);
        self.covariance().map(|mut cov| {
            cov *= alpha;
            for i in 0..cov.nrows() {
                cov[(i, i)] += prior;
            }
            cov
        })
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

fn shrinkage(n: f64) -> (f64, f64) {
    (n / (n + 5.0), 1e-3 * (5.0 / (n + 5.0)))
}

/// Where the mass-matrix adaptation windows sit inside the tuning phase.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowSchedule {
    /// Stan-style windows: a fast initial buffer, slow windows starting at
    /// `base_window` draws and doubling in length, and a fast terminal buffer.
    /// If the buffers do not fit into the tuning phase they shrink to 15%,
    /// 75% and 10% of it. Tuning phases shorter than 20 steps get no windows.
    Doubling {
        init_buffer: usize,
        base_window: usize,
        term_buffer: usize,
    },
    /// Explicit window boundaries: `[b0, b1, .., bk]` yields the windows
    /// `b0..b1`, `b1..b2`, .., `b(k-1)..bk`. Fewer than two boundaries means
    /// the mass matrix is never adapted.
    Boundaries(Vec<usize>),
}

impl Default for WindowSchedule {
    fn default() -> Self {
        WindowSchedule::Doubling {
            init_buffer: 75,
            base_window: 25,
            term_buffer: 50,
        }
    }
}

impl WindowSchedule {
    /// Resolves the schedule against a tuning phase of `n_tune` steps.
    pub fn windows(&self, n_tune: usize) -> Result<Vec<Range<usize>>> {
        match self {
            WindowSchedule::Doubling {
                init_buffer,
                base_window,
                term_buffer,
            } => {
                if *base_window == 0 {
                    return config("the base adaptation window must be at least one step");
                }
                Ok(doubling_windows(
                    n_tune,
                    *init_buffer,
                    *base_window,
                    *term_buffer,
                ))
            }
            WindowSchedule::Boundaries(bounds) => {
                if bounds.windows(2).any(|w| w[0] >= w[1]) {
                    return config(format!(
                        "adaptation window boundaries must be strictly increasing, got {bounds:?}"
                    ));
                }
                if let Some(&last) = bounds.last() {
                    if last > n_tune {
                        return config(format!(
                            "adaptation window boundary {last} lies beyond the {n_tune} tuning steps"
                        ));
                    }
                }
                Ok(bounds.windows(2).map(|w| w[0]..w[1]).collect())
            }
        }
    }
}

fn doubling_windows(
    n_tune: usize,
    init_buffer: usize,
    base_window: usize,
    term_buffer: usize,
) -> Vec<Range<usize>> {
    if n_tune < 20 {
        return Vec::new();
    }
    let total = init_buffer
        .checked_add(base_window)
        .and_then(|sum| sum.checked_add(term_buffer));
    let (init_buffer, base_window, term_buffer) = match total {
        Some(total) if total <= n_tune => (init_buffer, base_window, term_buffer),
        _ => {
            let init = (0.15 * n_tune as f64) as usize;
            let term = (0.1 * n_tune as f64) as usize;
            (init, n_tune - init - term, term)
        }
    };

    let end_slow = n_tune - term_buffer;
    let mut windows = Vec::new();
    let mut start = init_buffer;
    let mut size = base_window;
    while start < end_slow {
        let mut end = start + size;
        // Fold a trailing window that could not double into this one.
        if end + 2 * size > end_slow {
            end = end_slow;
        }
        windows.push(start..end);
        start = end;
        size *= 2;
    }
    windows
}

/// Per-chain tuning state: the dual averager plus the resolved windows.
#[derive(Debug, Clone)]
pub struct Adaptation {
    dual_average: DualAverage,
    windows: Vec<Range<usize>>,
    current_window: usize,
    iteration: usize,
    adapt_step_size: bool,
    initial_step_size: f64,
}

impl Adaptation {
    pub fn new(
        target_accept: f64,
        initial_step_size: f64,
        windows: Vec<Range<usize>>,
        adapt_step_size: bool,
    ) -> Self {
        Self {
            dual_average: DualAverage::new(target_accept, initial_step_size),
            windows,
            current_window: 0,
            iteration: 0,
            adapt_step_size,
            initial_step_size,
        }
    }

    pub fn windows(&self) -> &[Range<usize>] {
        &self.windows
    }

    /// Feeds one tuning step into the controllers and returns the step size
    /// to use for the next transition.
    ///
    /// Positions are only handed to `potential` inside a window. At a window's
    /// first step the accumulator is reset; at its last step the potential
    /// publishes a new metric and the dual averager restarts from its
    /// averaged step size.
    pub fn tune<P: Potential>(
        &mut self,
        potential: &mut P,
        position: &[f64],
        accept_stat: f64,
    ) -> f64 {
        let iteration = self.iteration;
        self.iteration += 1;
        if self.adapt_step_size {
            self.dual_average.update(accept_stat);
        }

        while self
            .windows
            .get(self.current_window)
            .is_some_and(|w| w.end <= iteration)
        {
            self.current_window += 1;
        }
        if let Some(window) = self.windows.get(self.current_window).cloned() {
            if window.contains(&iteration) {
                if iteration == window.start {
                    potential.start_window();
                }
                potential.update(position);
                if iteration + 1 == window.end {
                    if potential.finalize_window() {
                        log::debug!(
                            "published a new mass matrix after window {}..{}",
                            window.start,
                            window.end
                        );
                    }
                    if self.adapt_step_size {
                        let step_size = self.dual_average.adapted_step_size();
                        self.dual_average.restart(step_size);
                        log::debug!("restarted step-size adaptation at {step_size:.4e}");
                    }
                    self.current_window += 1;
                }
            }
        }
        self.step_size()
    }

    /// Step size for the next tuning transition.
    pub fn step_size(&self) -> f64 {
        if self.adapt_step_size {
            self.dual_average.current_step_size()
        } else {
            self.initial_step_size
        }
    }

    /// Step size used once tuning is over.
    pub fn final_step_size(&self) -> f64 {
        if self.adapt_step_size {
            self.dual_average.adapted_step_size()
        } else {
            self.initial_step_size
        }
    }
}
