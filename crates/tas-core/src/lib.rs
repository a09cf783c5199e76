//! # tas-core: Traffic Assignment Modeling Core
//!
//! Provides the fundamental data structures for static traffic assignment.
//!
//! ## Design Philosophy
//!
//! Everything the equilibrium algorithms touch is **link-indexed dense
//! arrays**: costs, capacities, flows and skim values are `Vec<f64>` columns
//! over the links of a [`LinkGraph`]. Topology exists only for path
//! building, backed by a petgraph digraph.
//!
//! - [`LinkGraph`] - directed link network, writable cost column, named
//!   skim columns, zone (centroid) count
//! - [`DemandMatrix`] - zones x zones x strata trip table
//! - [`AssignmentResults`] - links x strata loads, stratum-collapsed
//!   totals, optional OD skim matrix
//! - [`TrafficClass`] - one demand segment: PCE factor, demand, graph and
//!   result buffers
//! - Type-safe IDs: [`NodeId`], [`LinkId`]
//!
//! ## Quick Start
//!
//! ```rust
//! use tas_core::{DemandMatrix, Link, LinkGraph, TrafficClass};
//!
//! // Two zones connected by a pair of parallel links
//! let graph = LinkGraph::new(2, 2, vec![Link::new(0, 1), Link::new(0, 1)]).unwrap();
//!
//! let mut matrix = DemandMatrix::new(2, vec!["car".to_string()]).unwrap();
//! matrix.set_demand(0, 0, 1, 4000.0);
//!
//! let class = TrafficClass::new("car", 1.0, graph, matrix).unwrap();
//! assert_eq!(class.results.link_loads.links(), 2);
//! ```

pub mod demand;
pub mod error;
pub mod network;
pub mod results;

pub use demand::DemandMatrix;
pub use error::{TasError, TasResult};
pub use network::{Link, LinkGraph, LinkId, NodeId};
pub use results::{AssignmentResults, LinkLoads, SkimMatrix, TrafficClass};
