//! Descent-direction selection and the conjugate scalar formulas
//!
//! Which update formula runs on a given iteration is a small state
//! machine: plain FW steps seed the history, a conjugate step must follow
//! any reset before bi-conjugate steps may resume, and a unit step size
//! throws the history away. [`DirectionState::select`] encodes those
//! transitions; the scalar weights live next to it.
//!
//! ## References
//!
//! - **Mitradjieva & Lindberg (2013)**: "The Stiff Is Moving — Conjugate
//!   Direction Frank-Wolfe Methods with Applications to Traffic Assignment"
//!   Transportation Science, 47(2), 280-293.
//!   DOI: [10.1287/trsc.1120.0409](https://doi.org/10.1287/trsc.1120.0409)

use tas_core::{AssignmentResults, TrafficClass};

use super::Algorithm;

/// Cap on the conjugate weight: at exactly 1 the new direction would
/// repeat the old one and the solver would stall.
pub(crate) const CONJUGATE_DIRECTION_MAX: f64 = 0.99999;

/// Which update formula the current iteration uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    FrankWolfe,
    Conjugate,
    Biconjugate,
}

/// Flags steering the step-kind selection across iterations.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirectionState {
    /// Force a plain FW direction (set after a bad conjugate direction).
    pub do_fw_step: bool,
    /// A conjugate step must run before bi-conjugate steps resume.
    pub do_conjugate_step: bool,
    /// The last conjugate direction failed its line search; the fallback
    /// stays on MSA nudges until a search succeeds again.
    pub conjugate_failed: bool,
}

impl DirectionState {
    /// Pick the step kind for iteration `iter >= 2`, first match wins.
    ///
    /// A unit step size replaced the averaged solution entirely, so the
    /// direction history is void and FW starts over.
    pub fn select(&self, algorithm: Algorithm, iter: usize, last_stepsize: f64) -> StepKind {
        if iter == 2
            || last_stepsize == 1.0
            || self.do_fw_step
            || matches!(algorithm, Algorithm::FrankWolfe | Algorithm::Msa)
        {
            StepKind::FrankWolfe
        } else if iter == 3 || self.do_conjugate_step || algorithm == Algorithm::Cfw {
            StepKind::Conjugate
        } else {
            StepKind::Biconjugate
        }
    }
}

/// Stratum-collapsed difference of two load matrices on one link.
#[inline]
fn row_delta(a: &AssignmentResults, b: &AssignmentResults, link: usize) -> f64 {
    let strata = a.link_loads.strata();
    let mut delta = 0.0;
    for s in 0..strata {
        delta += a.link_loads.at(link, s) - b.link_loads.at(link, s);
    }
    delta
}

/// Conjugate weight gamma for the CFW update `d <- gamma*d + (1-gamma)*aon`.
///
/// gamma makes the new direction conjugate to the previous one under the
/// diagonal Hessian approximation t'(x). Clamped into [0, gamma_max]; a
/// degenerate denominator yields 0 (a plain FW blend) and a warning.
// The class sum runs inside the link sum because t' is shared across
// classes; per-class derivatives would need a multi-VDF model.
pub(crate) fn conjugate_stepsize(
    vdf_der: &[f64],
    classes: &[TrafficClass],
    directions: &[AssignmentResults],
) -> (f64, Option<String>) {
    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for (class, dir) in classes.iter().zip(directions.iter()) {
        for link in 0..vdf_der.len() {
            let u = row_delta(dir, &class.results, link);
            let v = row_delta(&class.aon_results, &class.results, link);
            let w = row_delta(&class.aon_results, dir, link);
            numerator += vdf_der[link] * u * v;
            denominator += vdf_der[link] * u * w;
        }
    }

    if denominator == 0.0 || !denominator.is_finite() {
        return (
            0.0,
            Some("Degenerate denominator in conjugate direction; using plain FW blend".to_string()),
        );
    }

    let gamma = numerator / denominator;
    if gamma < 0.0 {
        (0.0, None)
    } else if gamma > CONJUGATE_DIRECTION_MAX {
        (CONJUGATE_DIRECTION_MAX, None)
    } else {
        (gamma, None)
    }
}

/// Bi-conjugate weights (beta0, beta1, beta2) for the BFW update
/// `d <- beta0*aon + beta1*d + beta2*d_prev`.
///
/// The weights keep the new direction conjugate to the previous two under
/// t'(x). Zero denominators collapse the corresponding weight to 0, which
/// degrades gracefully towards CFW and FW blends.
pub(crate) fn biconjugate_betas(
    vdf_der: &[f64],
    classes: &[TrafficClass],
    directions: &[AssignmentResults],
    previous_directions: &[AssignmentResults],
    stepsize: f64,
) -> ([f64; 3], Option<String>) {
    let mut mu_num = 0.0;
    let mut mu_den = 0.0;
    let mut nu_num = 0.0;
    let mut nu_den = 0.0;

    for ((class, dir), prev) in classes
        .iter()
        .zip(directions.iter())
        .zip(previous_directions.iter())
    {
        let strata = class.results.link_loads.strata();
        for link in 0..vdf_der.len() {
            let mut x_hat = 0.0;
            for s in 0..strata {
                x_hat += dir.link_loads.at(link, s) * stepsize
                    + prev.link_loads.at(link, s) * (1.0 - stepsize)
                    - class.results.link_loads.at(link, s);
            }
            let y = row_delta(&class.aon_results, &class.results, link);
            let z = row_delta(dir, &class.results, link);
            let prev_minus_dir = row_delta(prev, dir, link);

            mu_num += vdf_der[link] * x_hat * y;
            mu_den += vdf_der[link] * x_hat * prev_minus_dir;
            nu_num += vdf_der[link] * z * y;
            nu_den += vdf_der[link] * z * z;
        }
    }

    let mut warning = None;
    let mu = if mu_den == 0.0 || !mu_den.is_finite() {
        warning = Some(
            "Degenerate denominator in bi-conjugate direction; dropping the oldest term"
                .to_string(),
        );
        0.0
    } else {
        (-mu_num / mu_den).max(0.0)
    };

    let nu = if nu_den == 0.0 || !nu_den.is_finite() {
        warning = Some(
            "Degenerate denominator in bi-conjugate direction; dropping the previous term"
                .to_string(),
        );
        0.0
    } else {
        (-(nu_num / nu_den) + mu * stepsize / (1.0 - stepsize)).max(0.0)
    };

    let beta0 = 1.0 / (1.0 + mu + nu);
    ([beta0, nu * beta0, mu * beta0], warning)
}
