//! Volume-delay function library
//!
//! A volume-delay function (VDF) maps link flow to congested travel time.
//! The equilibrium solver needs two elementwise operations: the function
//! itself (for costs and the line-search objective) and its flow
//! derivative (for the conjugate direction formulas). Both are pure in
//! their inputs and parallelise trivially over links.
//!
//! ## References
//!
//! - **Bureau of Public Roads (1964)**: "Traffic Assignment Manual".
//!   U.S. Dept. of Commerce. The ubiquitous polynomial congestion curve.
//!
//! - **Spiess (1990)**: "Conical Volume-Delay Functions"
//!   Transportation Science, 24(2), 153-158. A BPR alternative with
//!   bounded derivative at zero flow.
//!   DOI: [10.1287/trsc.24.2.153](https://doi.org/10.1287/trsc.24.2.153)

use rayon::prelude::*;

/// Congested travel time and its flow derivative, elementwise over links.
///
/// Implementations must be pure functions of their inputs: the solver
/// calls them repeatedly on intermediate flow vectors during the line
/// search and relies on reproducibility.
pub trait VolumeDelayFunction: Send + Sync {
    /// `out[l] = time(flow[l], capacity[l], free_flow_time[l])`
    fn apply(&self, out: &mut [f64], flow: &[f64], capacity: &[f64], free_flow_time: &[f64]);

    /// `out[l] = d time / d flow` at `flow[l]`
    fn apply_derivative(
        &self,
        out: &mut [f64],
        flow: &[f64],
        capacity: &[f64],
        free_flow_time: &[f64],
    );
}

/// The BPR curve: `t = t0 * (1 + alpha * (v/c)^beta)`.
///
/// Infinite capacity degenerates to free-flow time with zero derivative,
/// which is what uncongested connectors want.
#[derive(Debug, Clone, Copy)]
pub struct Bpr {
    pub alpha: f64,
    pub beta: f64,
}

impl Bpr {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }
}

impl Default for Bpr {
    fn default() -> Self {
        Self::new(0.15, 4.0)
    }
}

impl VolumeDelayFunction for Bpr {
    fn apply(&self, out: &mut [f64], flow: &[f64], capacity: &[f64], free_flow_time: &[f64]) {
        let (alpha, beta) = (self.alpha, self.beta);
        out.par_iter_mut().enumerate().for_each(|(l, t)| {
            let ratio = flow[l] / capacity[l];
            *t = free_flow_time[l] * (1.0 + alpha * ratio.powf(beta));
        });
    }

    fn apply_derivative(
        &self,
        out: &mut [f64],
        flow: &[f64],
        capacity: &[f64],
        free_flow_time: &[f64],
    ) {
        let (alpha, beta) = (self.alpha, self.beta);
        out.par_iter_mut().enumerate().for_each(|(l, d)| {
            let ratio = flow[l] / capacity[l];
            *d = free_flow_time[l] * alpha * beta * ratio.powf(beta - 1.0) / capacity[l];
        });
    }
}

/// Spiess's conical curve: `t = t0 * (2 - a*(1-x) - b + sqrt(a^2*(1-x)^2 + b^2))`
/// with `x = v/c` and `b = (2a-1)/(2a-2)`, `a > 1`.
///
/// Unlike high-exponent BPR it keeps a usable gradient at low volumes,
/// which helps the line search on lightly loaded networks.
#[derive(Debug, Clone, Copy)]
pub struct Conical {
    pub a: f64,
    b: f64,
}

impl Conical {
    /// `a` must exceed 1 for the curve to satisfy t(0) = t0.
    pub fn new(a: f64) -> Self {
        let b = (2.0 * a - 1.0) / (2.0 * a - 2.0);
        Self { a, b }
    }
}

impl Default for Conical {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl VolumeDelayFunction for Conical {
    fn apply(&self, out: &mut [f64], flow: &[f64], capacity: &[f64], free_flow_time: &[f64]) {
        let (a, b) = (self.a, self.b);
        out.par_iter_mut().enumerate().for_each(|(l, t)| {
            let reserve = 1.0 - flow[l] / capacity[l];
            *t = free_flow_time[l]
                * (2.0 - a * reserve - b + (a * a * reserve * reserve + b * b).sqrt());
        });
    }

    fn apply_derivative(
        &self,
        out: &mut [f64],
        flow: &[f64],
        capacity: &[f64],
        free_flow_time: &[f64],
    ) {
        let (a, b) = (self.a, self.b);
        out.par_iter_mut().enumerate().for_each(|(l, d)| {
            let reserve = 1.0 - flow[l] / capacity[l];
            let root = (a * a * reserve * reserve + b * b).sqrt();
            *d = free_flow_time[l] / capacity[l] * (a - a * a * reserve / root);
        });
    }
}
