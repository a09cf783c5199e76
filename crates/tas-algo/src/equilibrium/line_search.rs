//! One-dimensional line search along the current descent direction
//!
//! The optimal step is the root of
//!
//! ```text
//! phi(alpha) = sum over links of  vdf(x + alpha*(s - x)) * (s - x)
//! ```
//!
//! the derivative of the Beckmann objective along the direction `s - x`.
//! On a strictly convex objective phi is increasing with exactly one root
//! in [0, 1]; a bracketed Brent search finds it. When the bracket does not
//! hold (flat or non-convex stretches), [`resolve_failure`] encodes the
//! fallback table the solver applies instead.

use argmin::core::{CostFunction, Error, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::brent::BrentRoot;
use std::cell::RefCell;

use super::Algorithm;
use crate::vdf::VolumeDelayFunction;

const BRENT_TOL: f64 = 1e-11;
const BRENT_MAX_ITERS: u64 = 100;

#[derive(Debug, Clone)]
struct Scratch {
    trial_flow: Vec<f64>,
    congested_value: Vec<f64>,
}

/// phi as an argmin cost function over the scalar step size.
///
/// Holds reusable scratch vectors; evaluation is cheap enough to call from
/// both the Brent iterations and the endpoint probes of the fallback path.
#[derive(Clone)]
pub(crate) struct DerivativeOfObjective<'a> {
    vdf: &'a dyn VolumeDelayFunction,
    capacity: &'a [f64],
    free_flow_time: &'a [f64],
    current_flow: &'a [f64],
    direction_flow: &'a [f64],
    scratch: RefCell<Scratch>,
}

impl<'a> DerivativeOfObjective<'a> {
    pub(crate) fn new(
        vdf: &'a dyn VolumeDelayFunction,
        capacity: &'a [f64],
        free_flow_time: &'a [f64],
        current_flow: &'a [f64],
        direction_flow: &'a [f64],
    ) -> Self {
        let links = capacity.len();
        Self {
            vdf,
            capacity,
            free_flow_time,
            current_flow,
            direction_flow,
            scratch: RefCell::new(Scratch {
                trial_flow: vec![0.0; links],
                congested_value: vec![0.0; links],
            }),
        }
    }

    pub(crate) fn eval(&self, alpha: f64) -> f64 {
        let mut scratch = self.scratch.borrow_mut();
        let Scratch {
            trial_flow,
            congested_value,
        } = &mut *scratch;

        for (l, trial) in trial_flow.iter_mut().enumerate() {
            *trial =
                self.current_flow[l] + alpha * (self.direction_flow[l] - self.current_flow[l]);
        }
        self.vdf.apply(
            congested_value,
            trial_flow,
            self.capacity,
            self.free_flow_time,
        );

        congested_value
            .iter()
            .enumerate()
            .map(|(l, t)| t * (self.direction_flow[l] - self.current_flow[l]))
            .sum()
    }
}

impl CostFunction for DerivativeOfObjective<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, alpha: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.eval(*alpha))
    }
}

/// Outcome of the bracketed root search.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RootSearch {
    /// Converged to a root in [0, 1]. A boundary root is a legitimate
    /// answer: phi(0) = 0 means the current solution is already optimal
    /// along this direction and must not be disturbed.
    Root(f64),
    /// Bracket violation (no sign change) or non-convergence.
    Failed(String),
}

/// Brent search for phi(alpha) = 0 on [0, 1].
pub(crate) fn find_root(phi: &DerivativeOfObjective) -> RootSearch {
    let solver = BrentRoot::new(0.0, 1.0, BRENT_TOL);
    let executor =
        Executor::new(phi.clone(), solver).configure(|state| state.max_iters(BRENT_MAX_ITERS));

    match executor.run() {
        Ok(result) => {
            let state = result.state();
            let converged = matches!(
                state.get_termination_status(),
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
            );
            match state.get_best_param() {
                Some(&alpha) if converged && (0.0..=1.0).contains(&alpha) => {
                    RootSearch::Root(alpha)
                }
                Some(&alpha) => RootSearch::Failed(format!(
                    "root finder stopped at alpha = {alpha} without converging"
                )),
                None => RootSearch::Failed("root finder produced no step size".to_string()),
            }
        }
        Err(err) => RootSearch::Failed(err.to_string()),
    }
}

/// What to do when the root search fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum FallbackAction {
    /// Use the MSA step 1/k so the solution still moves.
    MsaNudge(f64),
    /// The conjugate direction is bad: force a plain FW direction and
    /// search again.
    RetryDirection,
    /// The full AoN step improves the objective most; take it.
    FullStep,
}

/// Fallback table applied when phi has no usable root in (0, 1).
///
/// phi(0) < phi(1) means the direction still descends near the current
/// solution, so a zero step would stall: plain FW (or a retry that already
/// failed once) gets the MSA nudge, a fresh conjugate direction gets
/// rebuilt. Otherwise the far end is the better point.
pub(crate) fn resolve_failure(
    algorithm: Algorithm,
    iteration: usize,
    conjugate_failed: bool,
    phi0: f64,
    phi1: f64,
) -> FallbackAction {
    if phi0 < phi1 {
        if algorithm == Algorithm::FrankWolfe || conjugate_failed {
            FallbackAction::MsaNudge(1.0 / iteration as f64)
        } else {
            FallbackAction::RetryDirection
        }
    } else {
        FallbackAction::FullStep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdf::Bpr;

    #[test]
    fn test_phi_signs_for_symmetric_swap() {
        // All flow on link 0, direction moves it all to link 1. With equal
        // links the root is the midpoint.
        let bpr = Bpr::new(0.15, 4.0);
        let capacity = vec![2000.0, 2000.0];
        let fft = vec![10.0, 10.0];
        let x = vec![4000.0, 0.0];
        let s = vec![0.0, 4000.0];
        let phi = DerivativeOfObjective::new(&bpr, &capacity, &fft, &x, &s);

        assert!(phi.eval(0.0) < 0.0);
        assert!(phi.eval(1.0) > 0.0);
        assert!(phi.eval(0.5).abs() < 1e-9);
    }

    #[test]
    fn test_find_root_symmetric_swap() {
        let bpr = Bpr::new(0.15, 4.0);
        let capacity = vec![2000.0, 2000.0];
        let fft = vec![10.0, 10.0];
        let x = vec![4000.0, 0.0];
        let s = vec![0.0, 4000.0];
        let phi = DerivativeOfObjective::new(&bpr, &capacity, &fft, &x, &s);

        match find_root(&phi) {
            RootSearch::Root(alpha) => assert!((alpha - 0.5).abs() < 1e-6, "alpha = {alpha}"),
            RootSearch::Failed(reason) => panic!("expected root, got failure: {reason}"),
        }
    }

    #[test]
    fn test_find_root_fails_without_sign_change() {
        // Direction strictly uphill everywhere: no bracket.
        let bpr = Bpr::new(0.15, 4.0);
        let capacity = vec![2000.0];
        let fft = vec![10.0];
        let x = vec![0.0];
        let s = vec![4000.0];
        let phi = DerivativeOfObjective::new(&bpr, &capacity, &fft, &x, &s);

        assert!(matches!(find_root(&phi), RootSearch::Failed(_)));
    }

    #[test]
    fn test_fallback_msa_nudge_for_frank_wolfe() {
        let action = resolve_failure(Algorithm::FrankWolfe, 4, false, -1.0, 1.0);
        assert_eq!(action, FallbackAction::MsaNudge(0.25));
    }

    #[test]
    fn test_fallback_msa_nudge_after_failed_conjugate() {
        let action = resolve_failure(Algorithm::Bfw, 5, true, -1.0, 1.0);
        assert_eq!(action, FallbackAction::MsaNudge(0.2));
    }

    #[test]
    fn test_fallback_retries_fresh_conjugate_direction() {
        for algorithm in [Algorithm::Cfw, Algorithm::Bfw] {
            let action = resolve_failure(algorithm, 5, false, -1.0, 1.0);
            assert_eq!(action, FallbackAction::RetryDirection);
        }
    }

    #[test]
    fn test_fallback_full_step_when_far_end_better() {
        let action = resolve_failure(Algorithm::Bfw, 5, false, 1.0, -1.0);
        assert_eq!(action, FallbackAction::FullStep);
        // flat phi also lands on the full step
        let action = resolve_failure(Algorithm::FrankWolfe, 5, false, 0.0, 0.0);
        assert_eq!(action, FallbackAction::FullStep);
    }
}
