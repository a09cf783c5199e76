//! # tas-algo: Equilibrium Algorithms for Traffic Assignment
//!
//! This crate provides the numerical machinery of static user-equilibrium
//! traffic assignment: the Frank-Wolfe family of link-based solvers, the
//! all-or-nothing path loader that feeds them, the volume-delay functions
//! that price congestion, and the data-parallel kernels that blend flow
//! buffers.
//!
//! ## Equilibrium Assignment
//!
//! The [`TrafficAssignment`] builder assembles traffic classes, a VDF and
//! the per-link capacity and free-flow time columns, then `run()`
//! equilibrates with the configured [`Algorithm`]:
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`Algorithm::Msa`] | Successive averages, step 1/k |
//! | [`Algorithm::FrankWolfe`] | Optimal step via line search |
//! | [`Algorithm::Cfw`] | Conjugate direction blending |
//! | [`Algorithm::Bfw`] | Bi-conjugate direction blending |
//!
//! ## Example
//!
//! ```rust
//! use tas_algo::{Algorithm, Bpr, TrafficAssignment};
//! use tas_core::{DemandMatrix, Link, LinkGraph, TrafficClass};
//!
//! // Two parallel links between one OD pair
//! let graph = LinkGraph::new(2, 2, vec![Link::new(0, 1), Link::new(0, 1)]).unwrap();
//! let mut matrix = DemandMatrix::new(2, vec!["car".to_string()]).unwrap();
//! matrix.set_demand(0, 0, 1, 4000.0);
//! let car = TrafficClass::new("car", 1.0, graph, matrix).unwrap();
//!
//! let outcome = TrafficAssignment::new()
//!     .with_classes(vec![car])
//!     .with_vdf(Bpr::new(0.15, 4.0))
//!     .with_capacity(vec![2000.0, 2000.0])
//!     .with_free_flow_time(vec![10.0, 10.0])
//!     .with_algorithm(Algorithm::Bfw)
//!     .with_cores(1)
//!     .run()
//!     .unwrap();
//!
//! assert!(outcome.report.converged);
//! ```

pub mod aon;
pub mod equilibrium;
pub mod kernels;
pub mod vdf;

pub use equilibrium::{
    Algorithm, AssignmentOutcome, ConvergenceReport, EquilibriumError, IterationRecord,
    ProgressCallback, ProgressEvent, TrafficAssignment,
};
pub use vdf::{Bpr, Conical, VolumeDelayFunction};
