//! # Link-Based User-Equilibrium Assignment
//!
//! This module implements the path-averaging solvers of the Frank-Wolfe
//! family for static user equilibrium: each iteration loads all demand onto
//! current least-cost paths (an all-or-nothing subproblem), blends the
//! result into the running solution along a descent direction, and
//! re-prices the network with the volume-delay function until the relative
//! gap closes.
//!
//! | Method | Direction | Convergence |
//! |--------|-----------|-------------|
//! | [`Algorithm::Msa`] | AoN loading, fixed step 1/k | Slow, bulletproof |
//! | [`Algorithm::FrankWolfe`] | AoN loading, optimal step | Tail-crawling |
//! | [`Algorithm::Cfw`] | Conjugate blend of AoN and previous direction | Fast |
//! | [`Algorithm::Bfw`] | Bi-conjugate blend over two past directions | Fastest |
//!
//! ## Algorithm Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  ITERATION k                                                         │
//! │  ───────────                                                         │
//! │                                                                      │
//! │  1. AoN: load demand on least-cost paths under current times         │
//! │  2. Direction: FW / conjugate / bi-conjugate blend of AoN loads      │
//! │  3. Line search: alpha minimising the Beckmann objective             │
//! │  4. Update: results <- alpha*direction + (1-alpha)*results           │
//! │  5. Relative gap: |cost(x) - cost(y)| / cost(x)                      │
//! │  6. Re-price: congested times from the VDF at the new flows          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Flows aggregate across traffic classes weighted by their
//! passenger-car-equivalent factors; skim matrices follow the same convex
//! combinations as link loads so reported costs stay consistent with
//! assigned flows.
//!
//! ## Example
//!
//! ```ignore
//! use tas_algo::{Algorithm, Bpr, TrafficAssignment};
//!
//! let outcome = TrafficAssignment::new()
//!     .with_classes(vec![car])
//!     .with_vdf(Bpr::new(0.15, 4.0))
//!     .with_capacity(capacity)
//!     .with_free_flow_time(free_flow)
//!     .with_algorithm(Algorithm::Bfw)
//!     .with_rgap_target(1e-5)
//!     .run()?;
//!
//! println!("converged: {}", outcome.report.converged);
//! ```
//!
//! ## References
//!
//! - **Frank & Wolfe (1956)**: "An algorithm for quadratic programming"
//!   Naval Research Logistics Quarterly, 3(1-2), 95-110.
//!   DOI: [10.1002/nav.3800030109](https://doi.org/10.1002/nav.3800030109)
//!
//! - **LeBlanc, Morlok & Pierskalla (1975)**: "An efficient approach to
//!   solving the road network equilibrium traffic assignment problem"
//!   Transportation Research, 9(5), 309-318.
//!   DOI: [10.1016/0041-1647(75)90030-1](https://doi.org/10.1016/0041-1647(75)90030-1)
//!
//! - **Mitradjieva & Lindberg (2013)**: "The Stiff Is Moving — Conjugate
//!   Direction Frank-Wolfe Methods with Applications to Traffic Assignment"
//!   Transportation Science, 47(2), 280-293.
//!   DOI: [10.1287/trsc.1120.0409](https://doi.org/10.1287/trsc.1120.0409)

mod direction;
mod line_search;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tas_core::{AssignmentResults, TasError, TrafficClass};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::vdf::VolumeDelayFunction;
use crate::{aon, kernels};
use direction::{DirectionState, StepKind};
use line_search::{DerivativeOfObjective, FallbackAction, RootSearch};

/// Equilibration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Method of successive averages: fixed step 1/k.
    Msa,
    /// Plain Frank-Wolfe with an optimal line search.
    FrankWolfe,
    /// Conjugate Frank-Wolfe (Mitradjieva & Lindberg).
    Cfw,
    /// Bi-conjugate Frank-Wolfe (Mitradjieva & Lindberg).
    Bfw,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Msa => "msa",
            Algorithm::FrankWolfe => "frank-wolfe",
            Algorithm::Cfw => "cfw",
            Algorithm::Bfw => "bfw",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = EquilibriumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "msa" => Ok(Algorithm::Msa),
            "frank-wolfe" => Ok(Algorithm::FrankWolfe),
            "cfw" => Ok(Algorithm::Cfw),
            "bfw" => Ok(Algorithm::Bfw),
            other => Err(EquilibriumError::Config(format!(
                "Unknown algorithm '{other}'; expected msa, frank-wolfe, cfw or bfw"
            ))),
        }
    }
}

/// Error types for the equilibrium solver.
#[derive(Debug, Error)]
pub enum EquilibriumError {
    /// Missing or out-of-range construction inputs.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inconsistent model data (array lengths, duplicate classes, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unexpected internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EquilibriumError> for TasError {
    fn from(err: EquilibriumError) -> Self {
        match err {
            EquilibriumError::Config(msg) => TasError::Config(msg),
            EquilibriumError::Validation(msg) => TasError::Validation(msg),
            EquilibriumError::Internal(err) => TasError::Solver(err.to_string()),
        }
    }
}

/// Progress events delivered through the optional callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An iteration is starting; `rgap` is the gap after the previous one.
    Iteration { iteration: usize, rgap: f64 },
    /// The solver terminated.
    Finished { iterations: usize, rgap: f64 },
}

/// Callback capability for progress reporting.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send>;

/// One row of the convergence report.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub rgap: f64,
    pub alpha: f64,
    pub warnings: Vec<String>,
    /// Bi-conjugate weights; `Some` only for BFW runs. All `-1` marks an
    /// iteration whose bi-conjugate direction was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betas: Option<[f64; 3]>,
}

/// Convergence diagnostics for one assignment run.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub algorithm: Algorithm,
    /// Whether the final relative gap reached the target.
    pub converged: bool,
    pub iterations: Vec<IterationRecord>,
    pub final_rgap: f64,
    pub solve_time_ms: u128,
}

/// Final solver output: the classes with their equilibrated `results`
/// plus the convergence report.
pub struct AssignmentOutcome {
    pub classes: Vec<TrafficClass>,
    pub report: ConvergenceReport,
}

/// Assembles an assignment problem and runs the equilibrium solver.
///
/// Classes, VDF, capacities and free-flow times are mandatory; everything
/// else has defaults. `run()` consumes the builder so the solver owns all
/// buffers for the duration of the solve.
pub struct TrafficAssignment {
    algorithm: Algorithm,
    rgap_target: f64,
    max_iter: usize,
    cores: usize,
    steps_below_needed_to_terminate: usize,
    time_field: String,
    classes: Vec<TrafficClass>,
    vdf: Option<Box<dyn VolumeDelayFunction>>,
    capacity: Option<Vec<f64>>,
    free_flow_time: Option<Vec<f64>>,
    progress: Option<ProgressCallback>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for TrafficAssignment {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficAssignment {
    pub fn new() -> Self {
        Self {
            algorithm: Algorithm::Bfw,
            rgap_target: 1e-4,
            max_iter: 250,
            cores: num_cpus::get(),
            steps_below_needed_to_terminate: 1,
            time_field: "time".to_string(),
            classes: Vec::new(),
            vdf: None,
            capacity: None,
            free_flow_time: None,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Target relative gap; must be positive.
    pub fn with_rgap_target(mut self, target: f64) -> Self {
        self.rgap_target = target;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Worker-parallelism hint for the AoN fan-out and the array kernels.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// How many consecutive sub-target iterations terminate the run.
    /// The gap can be wiggly; demanding more than one makes termination
    /// sturdier on noisy instances.
    pub fn with_steps_below_needed_to_terminate(mut self, steps: usize) -> Self {
        self.steps_below_needed_to_terminate = steps;
        self
    }

    /// Name of the skim field that carries travel time; it is refreshed
    /// with congested times after every iteration.
    pub fn with_time_field(mut self, name: &str) -> Self {
        self.time_field = name.to_string();
        self
    }

    pub fn with_classes(mut self, classes: Vec<TrafficClass>) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_vdf(mut self, vdf: impl VolumeDelayFunction + 'static) -> Self {
        self.vdf = Some(Box::new(vdf));
        self
    }

    pub fn with_capacity(mut self, capacity: Vec<f64>) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_free_flow_time(mut self, free_flow_time: Vec<f64>) -> Self {
        self.free_flow_time = Some(free_flow_time);
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(ProgressEvent) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Cooperative cancellation: the flag is checked at iteration
    /// boundaries and the last completed iteration's solution is returned.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Validate the assembled problem and equilibrate it.
    pub fn run(self) -> Result<AssignmentOutcome, EquilibriumError> {
        LinearApproximation::new(self)?.execute()
    }
}

/// Step-size outcome inside one iteration.
enum StepResolution {
    Accepted(f64),
    /// The conjugate direction was rejected; rebuild the direction and
    /// search again.
    Retry,
}

/// The link-based path-averaging solver itself.
///
/// Owns every buffer for the duration of the run: the per-class direction
/// history, the aggregate flow vectors and the congested time columns.
struct LinearApproximation {
    algorithm: Algorithm,
    rgap_target: f64,
    max_iter: usize,
    cores: usize,
    steps_below_needed_to_terminate: usize,
    time_field: String,
    classes: Vec<TrafficClass>,
    vdf: Box<dyn VolumeDelayFunction>,
    capacity: Vec<f64>,
    free_flow_time: Vec<f64>,

    iter: usize,
    rgap: f64,
    stepsize: f64,
    steps_below: usize,
    state: DirectionState,
    betas: [f64; 3],

    /// Aggregate current flow x (PCE-weighted, stratum-collapsed).
    fw_total_flow: Vec<f64>,
    /// Aggregate AoN flow y.
    aon_total_flow: Vec<f64>,
    /// Aggregate direction flow s.
    step_direction_flow: Vec<f64>,
    congested_time: Vec<f64>,
    vdf_der: Vec<f64>,

    /// Current direction d, one buffer per class.
    step_direction: Vec<AssignmentResults>,
    /// Direction of the previous iteration (CFW/BFW only).
    previous_step_direction: Vec<AssignmentResults>,
    /// Two iterations back (CFW/BFW only).
    pre_previous_step_direction: Vec<AssignmentResults>,

    iteration_issue: Vec<String>,
    records: Vec<IterationRecord>,
    progress: Option<ProgressCallback>,
    cancel: Option<Arc<AtomicBool>>,
}

impl LinearApproximation {
    fn new(assig: TrafficAssignment) -> Result<Self, EquilibriumError> {
        if assig.classes.is_empty() {
            return Err(EquilibriumError::Config(
                "No traffic classes were set".to_string(),
            ));
        }
        let vdf = assig.vdf.ok_or_else(|| {
            EquilibriumError::Config("No volume-delay function was set".to_string())
        })?;
        let capacity = assig
            .capacity
            .ok_or_else(|| EquilibriumError::Config("No capacity vector was set".to_string()))?;
        let free_flow_time = assig.free_flow_time.ok_or_else(|| {
            EquilibriumError::Config("No free-flow time vector was set".to_string())
        })?;

        if !(assig.rgap_target > 0.0) {
            return Err(EquilibriumError::Config(format!(
                "Relative gap target must be positive, got {}",
                assig.rgap_target
            )));
        }
        if assig.max_iter == 0 {
            return Err(EquilibriumError::Config(
                "Maximum iterations must be at least 1".to_string(),
            ));
        }
        if assig.cores == 0 {
            return Err(EquilibriumError::Config(
                "Worker count must be at least 1".to_string(),
            ));
        }
        if assig.steps_below_needed_to_terminate == 0 {
            return Err(EquilibriumError::Config(
                "Consecutive sub-target iterations must be at least 1".to_string(),
            ));
        }

        let links = capacity.len();
        if free_flow_time.len() != links {
            return Err(EquilibriumError::Validation(format!(
                "Capacity has {} links but free-flow time has {}",
                links,
                free_flow_time.len()
            )));
        }
        for class in &assig.classes {
            if class.graph.num_links() != links {
                return Err(EquilibriumError::Validation(format!(
                    "Class '{}' has a graph with {} links; the assignment has {}",
                    class.name,
                    class.graph.num_links(),
                    links
                )));
            }
        }
        for (i, a) in assig.classes.iter().enumerate() {
            if assig.classes[i + 1..].iter().any(|b| b.name == a.name) {
                return Err(EquilibriumError::Validation(format!(
                    "Duplicate traffic class '{}'",
                    a.name
                )));
            }
        }
        if assig
            .classes
            .iter()
            .all(|c| c.matrix.total_demand() == 0.0)
        {
            return Err(EquilibriumError::Validation(
                "All demand matrices are empty".to_string(),
            ));
        }

        let step_direction: Vec<AssignmentResults> = assig
            .classes
            .iter()
            .map(|c| AssignmentResults::prepare(&c.graph, &c.matrix))
            .collect();
        let (previous_step_direction, pre_previous_step_direction) =
            if matches!(assig.algorithm, Algorithm::Cfw | Algorithm::Bfw) {
                (step_direction.clone(), step_direction.clone())
            } else {
                (Vec::new(), Vec::new())
            };

        Ok(Self {
            algorithm: assig.algorithm,
            rgap_target: assig.rgap_target,
            max_iter: assig.max_iter,
            cores: assig.cores,
            steps_below_needed_to_terminate: assig.steps_below_needed_to_terminate,
            time_field: assig.time_field,
            classes: assig.classes,
            vdf,
            fw_total_flow: vec![0.0; links],
            aon_total_flow: vec![0.0; links],
            step_direction_flow: vec![0.0; links],
            congested_time: vec![0.0; links],
            vdf_der: vec![0.0; links],
            capacity,
            free_flow_time,
            iter: 0,
            rgap: f64::INFINITY,
            stepsize: 1.0,
            steps_below: 0,
            state: DirectionState::default(),
            betas: [1.0, 0.0, 0.0],
            step_direction,
            previous_step_direction,
            pre_previous_step_direction,
            iteration_issue: Vec::new(),
            records: Vec::new(),
            progress: assig.progress,
            cancel: assig.cancel,
        })
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }

    fn execute(mut self) -> Result<AssignmentOutcome, EquilibriumError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cores)
            .build()
            .map_err(|e| {
                EquilibriumError::Config(format!(
                    "Could not build a {}-worker pool: {e}",
                    self.cores
                ))
            })?;
        let start = Instant::now();

        // Free-flow times are both the initial path-building costs and the
        // initial contents of the time skim.
        for class in &mut self.classes {
            class.graph.cost.copy_from_slice(&self.free_flow_time);
            if let Some(field) = class.graph.skim_field_index(&self.time_field) {
                class.graph.set_skim_column(field, &self.free_flow_time);
            }
        }

        info!(
            "{} assignment starting: {} classes, {} links, target rgap {:e}",
            self.algorithm,
            self.classes.len(),
            self.capacity.len(),
            self.rgap_target
        );
        info!("Iteration, RelativeGap, stepsize");

        let mut finished_iterations = 0;
        for iteration in 1..=self.max_iter {
            if let Some(flag) = &self.cancel {
                if flag.load(Ordering::Relaxed) {
                    info!("Assignment cancelled before iteration {}", iteration);
                    break;
                }
            }
            self.iter = iteration;
            self.emit(ProgressEvent::Iteration {
                iteration,
                rgap: self.rgap,
            });

            let converged = pool.install(|| self.iterate())?;

            self.push_record();
            info!("{},{},{}", self.iter, self.rgap, self.stepsize);
            finished_iterations = iteration;

            if converged {
                self.steps_below += 1;
                if self.steps_below >= self.steps_below_needed_to_terminate {
                    break;
                }
            } else {
                self.steps_below = 0;
            }

            pool.install(|| self.update_costs());
        }

        let converged = self.rgap <= self.rgap_target;
        if !converged {
            error!(
                "Desired rgap of {:e} was NOT reached; final rgap {:e}",
                self.rgap_target, self.rgap
            );
        }
        info!(
            "{} assignment finished: {} iterations and {:e} final gap",
            self.algorithm, finished_iterations, self.rgap
        );
        self.emit(ProgressEvent::Finished {
            iterations: finished_iterations,
            rgap: self.rgap,
        });

        Ok(AssignmentOutcome {
            report: ConvergenceReport {
                algorithm: self.algorithm,
                converged,
                iterations: self.records,
                final_rgap: self.rgap,
                solve_time_ms: start.elapsed().as_millis(),
            },
            classes: self.classes,
        })
    }

    /// One full iteration: AoN loading, direction and step, flow update,
    /// gap computation. Returns whether the gap is at or below target.
    fn iterate(&mut self) -> Result<bool, EquilibriumError> {
        self.aon_total_flow.fill(0.0);
        for class in &mut self.classes {
            aon::load(&class.matrix, &class.graph, &mut class.aon_results)?;
            class.aon_results.total_flows();
            kernels::weighted_accumulate(
                &mut self.aon_total_flow,
                &class.aon_results.total_link_loads,
                class.pce,
            );
        }

        if self.iter == 1 {
            // The first solution is the free-flow AoN loading itself.
            self.fw_total_flow.fill(0.0);
            for class in &mut self.classes {
                kernels::copy_from(
                    class.results.link_loads.data_mut(),
                    class.aon_results.link_loads.data(),
                );
                kernels::copy_from(
                    &mut class.results.total_link_loads,
                    &class.aon_results.total_link_loads,
                );
                if let (Some(dst), Some(src)) = (
                    class.results.skims.as_mut(),
                    class.aon_results.skims.as_ref(),
                ) {
                    kernels::copy_from(dst.data_mut(), src.data());
                }
                kernels::weighted_accumulate(
                    &mut self.fw_total_flow,
                    &class.results.total_link_loads,
                    class.pce,
                );
            }
        } else {
            loop {
                let kind = self.state.select(self.algorithm, self.iter, self.stepsize);
                self.compute_step_direction(kind);
                match self.calculate_stepsize() {
                    StepResolution::Accepted(alpha) => {
                        self.stepsize = alpha;
                        break;
                    }
                    StepResolution::Retry => {
                        self.stepsize = 0.0;
                    }
                }
            }
            debug_assert!((0.0..=1.0).contains(&self.stepsize));

            let alpha = self.stepsize;
            self.fw_total_flow.fill(0.0);
            for (class, dir) in self.classes.iter_mut().zip(self.step_direction.iter()) {
                kernels::linear_combination(
                    class.results.link_loads.data_mut(),
                    dir.link_loads.data(),
                    alpha,
                );
                if let (Some(dst), Some(src)) = (class.results.skims.as_mut(), dir.skims.as_ref())
                {
                    kernels::linear_combination(dst.data_mut(), src.data(), alpha);
                }
                class.results.total_flows();
                kernels::weighted_accumulate(
                    &mut self.fw_total_flow,
                    &class.results.total_link_loads,
                    class.pce,
                );
            }
        }

        // The gap must use the costs the AoN loading saw, not the ones the
        // new flows will produce.
        Ok(if self.iter > 1 {
            self.check_convergence()
        } else {
            false
        })
    }

    /// Build the descent direction for this iteration.
    fn compute_step_direction(&mut self, kind: StepKind) {
        self.step_direction_flow.fill(0.0);
        match kind {
            StepKind::FrankWolfe => {
                self.state.do_fw_step = false;
                // after any restart a conjugate step must precede BFW
                self.state.do_conjugate_step = true;
                for (class, dir) in self.classes.iter().zip(self.step_direction.iter_mut()) {
                    kernels::copy_from(
                        dir.link_loads.data_mut(),
                        class.aon_results.link_loads.data(),
                    );
                    if let (Some(dst), Some(src)) =
                        (dir.skims.as_mut(), class.aon_results.skims.as_ref())
                    {
                        kernels::copy_from(dst.data_mut(), src.data());
                    }
                    kernels::weighted_accumulate(
                        &mut self.step_direction_flow,
                        &class.aon_results.total_link_loads,
                        class.pce,
                    );
                }
            }
            StepKind::Conjugate => {
                self.state.do_conjugate_step = false;
                self.vdf.apply_derivative(
                    &mut self.vdf_der,
                    &self.fw_total_flow,
                    &self.capacity,
                    &self.free_flow_time,
                );
                let (gamma, warning) = direction::conjugate_stepsize(
                    &self.vdf_der,
                    &self.classes,
                    &self.step_direction,
                );
                if let Some(message) = warning {
                    warn!("{message}");
                    self.iteration_issue.push(message);
                }
                for ((class, dir), ppst) in self
                    .classes
                    .iter()
                    .zip(self.step_direction.iter_mut())
                    .zip(self.pre_previous_step_direction.iter_mut())
                {
                    kernels::copy_from(ppst.link_loads.data_mut(), dir.link_loads.data());
                    if let (Some(dst), Some(src)) = (ppst.skims.as_mut(), dir.skims.as_ref()) {
                        kernels::copy_from(dst.data_mut(), src.data());
                    }
                    // d <- gamma*d + (1-gamma)*aon
                    kernels::linear_combination(
                        dir.link_loads.data_mut(),
                        class.aon_results.link_loads.data(),
                        1.0 - gamma,
                    );
                    if let (Some(dst), Some(src)) =
                        (dir.skims.as_mut(), class.aon_results.skims.as_ref())
                    {
                        kernels::linear_combination(dst.data_mut(), src.data(), 1.0 - gamma);
                    }
                    dir.total_flows();
                    kernels::weighted_accumulate(
                        &mut self.step_direction_flow,
                        &dir.total_link_loads,
                        class.pce,
                    );
                }
            }
            StepKind::Biconjugate => {
                self.vdf.apply_derivative(
                    &mut self.vdf_der,
                    &self.fw_total_flow,
                    &self.capacity,
                    &self.free_flow_time,
                );
                let (betas, warning) = direction::biconjugate_betas(
                    &self.vdf_der,
                    &self.classes,
                    &self.step_direction,
                    &self.previous_step_direction,
                    self.stepsize,
                );
                self.betas = betas;
                if let Some(message) = warning {
                    warn!("{message}");
                    self.iteration_issue.push(message);
                }
                for (((class, dir), prev), ppst) in self
                    .classes
                    .iter()
                    .zip(self.step_direction.iter_mut())
                    .zip(self.previous_step_direction.iter_mut())
                    .zip(self.pre_previous_step_direction.iter_mut())
                {
                    // the outgoing direction is next iteration's "previous"
                    kernels::copy_from(ppst.link_loads.data_mut(), dir.link_loads.data());
                    if let (Some(dst), Some(src)) = (ppst.skims.as_mut(), dir.skims.as_ref()) {
                        kernels::copy_from(dst.data_mut(), src.data());
                    }
                    kernels::triple_linear_combination(
                        dir.link_loads.data_mut(),
                        class.aon_results.link_loads.data(),
                        prev.link_loads.data(),
                        betas,
                    );
                    if let (Some(dst), Some(a), Some(c)) = (
                        dir.skims.as_mut(),
                        class.aon_results.skims.as_ref(),
                        prev.skims.as_ref(),
                    ) {
                        kernels::triple_linear_combination(dst.data_mut(), a.data(), c.data(), betas);
                    }
                    dir.total_flows();
                    kernels::weighted_accumulate(
                        &mut self.step_direction_flow,
                        &dir.total_link_loads,
                        class.pce,
                    );
                    kernels::copy_from(prev.link_loads.data_mut(), ppst.link_loads.data());
                    if let (Some(dst), Some(src)) = (prev.skims.as_mut(), ppst.skims.as_ref()) {
                        kernels::copy_from(dst.data_mut(), src.data());
                    }
                }
            }
        }
    }

    /// Optimal step along the current direction, with the fallback policy
    /// for non-convex stretches.
    fn calculate_stepsize(&mut self) -> StepResolution {
        if self.algorithm == Algorithm::Msa {
            return StepResolution::Accepted(1.0 / self.iter as f64);
        }

        let phi = DerivativeOfObjective::new(
            self.vdf.as_ref(),
            &self.capacity,
            &self.free_flow_time,
            &self.fw_total_flow,
            &self.step_direction_flow,
        );

        match line_search::find_root(&phi) {
            RootSearch::Root(alpha) => {
                self.state.conjugate_failed = false;
                StepResolution::Accepted(alpha)
            }
            RootSearch::Failed(detail) => {
                warn!("Descent direction step size finder failed: {detail}");
                if self.algorithm == Algorithm::Bfw {
                    self.betas = [-1.0, -1.0, -1.0];
                }
                let phi0 = phi.eval(0.0);
                let phi1 = phi.eval(1.0);
                match line_search::resolve_failure(
                    self.algorithm,
                    self.iter,
                    self.state.conjugate_failed,
                    phi0,
                    phi1,
                ) {
                    FallbackAction::MsaNudge(step) => {
                        warn!("Alert: using stepsize {step} to keep the solution moving");
                        StepResolution::Accepted(step)
                    }
                    FallbackAction::RetryDirection => {
                        self.state.do_fw_step = true;
                        self.state.conjugate_failed = true;
                        self.iteration_issue.push(
                            "Found bad conjugate direction step. Performing FW search".to_string(),
                        );
                        StepResolution::Retry
                    }
                    FallbackAction::FullStep => StepResolution::Accepted(1.0),
                }
            }
        }
    }

    /// Relative gap between the current solution and its AoN loading,
    /// priced at the costs both were built under.
    fn check_convergence(&mut self) -> bool {
        let aon_cost = kernels::dot(&self.congested_time, &self.aon_total_flow);
        let current_cost = kernels::dot(&self.congested_time, &self.fw_total_flow);
        self.rgap = (current_cost - aon_cost).abs() / current_cost;
        self.rgap_target >= self.rgap
    }

    /// Re-price the network at the committed flows and reset the AoN
    /// buffers for the next iteration.
    fn update_costs(&mut self) {
        self.vdf.apply(
            &mut self.congested_time,
            &self.fw_total_flow,
            &self.capacity,
            &self.free_flow_time,
        );
        for class in &mut self.classes {
            class.graph.cost.copy_from_slice(&self.congested_time);
            if let Some(field) = class.graph.skim_field_index(&self.time_field) {
                class.graph.set_skim_column(field, &self.congested_time);
            }
            class.aon_results.reset();
        }
    }

    fn push_record(&mut self) {
        let betas = (self.algorithm == Algorithm::Bfw).then_some(self.betas);
        self.records.push(IterationRecord {
            iteration: self.iter,
            rgap: self.rgap,
            alpha: self.stepsize,
            warnings: std::mem::take(&mut self.iteration_issue),
            betas,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdf::Bpr;
    use tas_core::{DemandMatrix, Link, LinkGraph};

    fn single_link_class(name: &str, pce: f64) -> TrafficClass {
        let graph = LinkGraph::new(2, 2, vec![Link::new(0, 1)]).unwrap();
        let mut matrix = DemandMatrix::new(2, vec!["base".into()]).unwrap();
        matrix.set_demand(0, 0, 1, 100.0);
        TrafficClass::new(name, pce, graph, matrix).unwrap()
    }

    fn assignment() -> TrafficAssignment {
        TrafficAssignment::new()
            .with_classes(vec![single_link_class("car", 1.0)])
            .with_vdf(Bpr::default())
            .with_capacity(vec![f64::INFINITY])
            .with_free_flow_time(vec![1.0])
    }

    #[test]
    fn test_missing_inputs_are_config_errors() {
        let no_classes = TrafficAssignment::new()
            .with_vdf(Bpr::default())
            .with_capacity(vec![1.0])
            .with_free_flow_time(vec![1.0]);
        assert!(matches!(
            no_classes.run(),
            Err(EquilibriumError::Config(_))
        ));

        let no_vdf = TrafficAssignment::new()
            .with_classes(vec![single_link_class("car", 1.0)])
            .with_capacity(vec![1.0])
            .with_free_flow_time(vec![1.0]);
        assert!(matches!(no_vdf.run(), Err(EquilibriumError::Config(_))));

        let no_capacity = TrafficAssignment::new()
            .with_classes(vec![single_link_class("car", 1.0)])
            .with_vdf(Bpr::default())
            .with_free_flow_time(vec![1.0]);
        assert!(matches!(
            no_capacity.run(),
            Err(EquilibriumError::Config(_))
        ));

        let no_times = TrafficAssignment::new()
            .with_classes(vec![single_link_class("car", 1.0)])
            .with_vdf(Bpr::default())
            .with_capacity(vec![1.0]);
        assert!(matches!(no_times.run(), Err(EquilibriumError::Config(_))));
    }

    #[test]
    fn test_out_of_range_options_rejected() {
        assert!(matches!(
            assignment().with_rgap_target(0.0).run(),
            Err(EquilibriumError::Config(_))
        ));
        assert!(matches!(
            assignment().with_max_iter(0).run(),
            Err(EquilibriumError::Config(_))
        ));
        assert!(matches!(
            assignment().with_cores(0).run(),
            Err(EquilibriumError::Config(_))
        ));
        assert!(matches!(
            assignment()
                .with_steps_below_needed_to_terminate(0)
                .run(),
            Err(EquilibriumError::Config(_))
        ));
    }

    #[test]
    fn test_mismatched_array_lengths_rejected() {
        let result = assignment().with_capacity(vec![1.0, 2.0]).run();
        assert!(matches!(result, Err(EquilibriumError::Validation(_))));
    }

    #[test]
    fn test_duplicate_class_names_rejected() {
        let result = assignment()
            .with_classes(vec![
                single_link_class("car", 1.0),
                single_link_class("car", 2.0),
            ])
            .run();
        assert!(matches!(result, Err(EquilibriumError::Validation(_))));
    }

    #[test]
    fn test_empty_demand_rejected() {
        let graph = LinkGraph::new(2, 2, vec![Link::new(0, 1)]).unwrap();
        let matrix = DemandMatrix::new(2, vec!["base".into()]).unwrap();
        let class = TrafficClass::new("car", 1.0, graph, matrix).unwrap();

        let result = assignment().with_classes(vec![class]).run();
        assert!(matches!(result, Err(EquilibriumError::Validation(_))));
    }

    #[test]
    fn test_bad_conjugate_step_resets_to_fw_then_msa_nudges() {
        let assig = TrafficAssignment::new()
            .with_classes(vec![single_link_class("car", 1.0)])
            .with_vdf(Bpr::default())
            .with_capacity(vec![2000.0])
            .with_free_flow_time(vec![10.0])
            .with_algorithm(Algorithm::Bfw);
        let mut solver = LinearApproximation::new(assig).unwrap();

        // Rig an uphill direction: phi is strictly positive on [0, 1], so
        // the bracket fails and phi(0) < phi(1).
        solver.iter = 5;
        solver.fw_total_flow = vec![0.0];
        solver.step_direction_flow = vec![4000.0];

        match solver.calculate_stepsize() {
            StepResolution::Retry => {}
            StepResolution::Accepted(alpha) => {
                panic!("expected a direction retry, got step {alpha}")
            }
        }
        assert!(solver.state.do_fw_step);
        assert!(solver.state.conjugate_failed);
        assert_eq!(solver.betas, [-1.0, -1.0, -1.0]);
        assert!(solver
            .iteration_issue
            .iter()
            .any(|w| w.contains("Found bad conjugate direction step")));

        // the retried search fails the same way; now the MSA nudge applies
        match solver.calculate_stepsize() {
            StepResolution::Accepted(alpha) => assert_eq!(alpha, 0.2),
            StepResolution::Retry => panic!("expected the MSA nudge"),
        }
    }

    #[test]
    fn test_algorithm_parse_round_trip() {
        for tag in ["msa", "frank-wolfe", "cfw", "bfw"] {
            let algorithm: Algorithm = tag.parse().unwrap();
            assert_eq!(algorithm.as_str(), tag);
        }
        assert!("dial".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_algorithm_serde_tags() {
        assert_eq!(
            serde_json::to_string(&Algorithm::FrankWolfe).unwrap(),
            "\"frank-wolfe\""
        );
        assert_eq!(
            serde_json::from_str::<Algorithm>("\"bfw\"").unwrap(),
            Algorithm::Bfw
        );
    }

    #[test]
    fn test_report_serialises_without_betas_for_fw() {
        let record = IterationRecord {
            iteration: 3,
            rgap: 0.5,
            alpha: 0.25,
            warnings: vec![],
            betas: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("betas"));
    }
}
