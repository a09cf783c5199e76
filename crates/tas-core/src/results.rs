//! Assignment result buffers and traffic classes
//!
//! [`AssignmentResults`] is the unit of state the equilibrium algorithms
//! shuffle around: a links-by-strata load matrix, its stratum-collapsed
//! totals, and (when the graph carries skim fields) a zones-by-zones skim
//! matrix. The solver owns extra copies of this struct as direction
//! buffers, so everything it needs lives here and nothing in the solver
//! depends on how a class was put together.

use crate::demand::DemandMatrix;
use crate::network::LinkGraph;
use anyhow::{anyhow, Result};

/// Dense links-by-strata flow matrix.
#[derive(Debug, Clone)]
pub struct LinkLoads {
    links: usize,
    strata: usize,
    /// `[link * strata + stratum]`
    data: Vec<f64>,
}

impl LinkLoads {
    pub fn zeros(links: usize, strata: usize) -> Self {
        Self {
            links,
            strata,
            data: vec![0.0; links * strata],
        }
    }

    pub fn links(&self) -> usize {
        self.links
    }

    pub fn strata(&self) -> usize {
        self.strata
    }

    #[inline]
    pub fn at(&self, link: usize, stratum: usize) -> f64 {
        self.data[link * self.strata + stratum]
    }

    #[inline]
    pub fn at_mut(&mut self, link: usize, stratum: usize) -> &mut f64 {
        &mut self.data[link * self.strata + stratum]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }

    /// Elementwise accumulate another load matrix of the same shape.
    pub fn accumulate(&mut self, other: &LinkLoads) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
    }

    /// Collapse strata: `out[link] = sum over strata`.
    pub fn row_sums_into(&self, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.links);
        for (link, slot) in out.iter_mut().enumerate() {
            let base = link * self.strata;
            *slot = self.data[base..base + self.strata].iter().sum();
        }
    }
}

/// Dense zones-by-zones-by-fields skim matrix.
#[derive(Debug, Clone)]
pub struct SkimMatrix {
    zones: usize,
    fields: usize,
    /// `[origin * zones * fields + destination * fields + field]`
    data: Vec<f64>,
}

impl SkimMatrix {
    pub fn zeros(zones: usize, fields: usize) -> Self {
        Self {
            zones,
            fields,
            data: vec![0.0; zones * zones * fields],
        }
    }

    pub fn zones(&self) -> usize {
        self.zones
    }

    pub fn fields(&self) -> usize {
        self.fields
    }

    #[inline]
    pub fn at(&self, origin: usize, destination: usize, field: usize) -> f64 {
        self.data[(origin * self.zones + destination) * self.fields + field]
    }

    #[inline]
    pub fn at_mut(&mut self, origin: usize, destination: usize, field: usize) -> &mut f64 {
        &mut self.data[(origin * self.zones + destination) * self.fields + field]
    }

    /// One origin's row of `zones * fields` cells.
    pub fn origin_row_mut(&mut self, origin: usize) -> &mut [f64] {
        let row = self.zones * self.fields;
        &mut self.data[origin * row..(origin + 1) * row]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }
}

/// Per-class assignment state: link loads, their totals, optional skims.
#[derive(Debug, Clone)]
pub struct AssignmentResults {
    pub link_loads: LinkLoads,
    /// Stratum-collapsed loads, refreshed by [`AssignmentResults::total_flows`].
    pub total_link_loads: Vec<f64>,
    pub skims: Option<SkimMatrix>,
}

impl AssignmentResults {
    /// Allocate buffers shaped for `graph` and `matrix`.
    pub fn prepare(graph: &LinkGraph, matrix: &DemandMatrix) -> Self {
        let skims = if graph.num_skim_fields() > 0 {
            Some(SkimMatrix::zeros(matrix.zones(), graph.num_skim_fields()))
        } else {
            None
        };
        Self {
            link_loads: LinkLoads::zeros(graph.num_links(), matrix.num_strata()),
            total_link_loads: vec![0.0; graph.num_links()],
            skims,
        }
    }

    pub fn num_skims(&self) -> usize {
        self.skims.as_ref().map_or(0, SkimMatrix::fields)
    }

    /// Refresh `total_link_loads` from the stratified loads.
    pub fn total_flows(&mut self) {
        self.link_loads.row_sums_into(&mut self.total_link_loads);
    }

    pub fn reset(&mut self) {
        self.link_loads.reset();
        self.total_link_loads.fill(0.0);
        if let Some(skims) = self.skims.as_mut() {
            skims.reset();
        }
    }
}

/// One demand segment: its PCE factor, demand, graph and result buffers.
///
/// The solver mutates `results`, `aon_results` and `graph.cost` during a
/// run; callers read them back afterwards.
#[derive(Debug, Clone)]
pub struct TrafficClass {
    /// Unique key for the class (e.g. "car", "truck").
    pub name: String,
    /// Passenger-car-equivalent factor applied when flows are aggregated
    /// across classes.
    pub pce: f64,
    pub matrix: DemandMatrix,
    pub graph: LinkGraph,
    pub results: AssignmentResults,
    pub aon_results: AssignmentResults,
}

impl TrafficClass {
    pub fn new(name: &str, pce: f64, graph: LinkGraph, matrix: DemandMatrix) -> Result<Self> {
        if !(pce > 0.0) {
            return Err(anyhow!("Class '{}' has non-positive PCE {}", name, pce));
        }
        if matrix.zones() != graph.zones() {
            return Err(anyhow!(
                "Class '{}': demand has {} zones but the graph has {}",
                name,
                matrix.zones(),
                graph.zones()
            ));
        }
        let results = AssignmentResults::prepare(&graph, &matrix);
        let aon_results = results.clone();
        Ok(Self {
            name: name.to_string(),
            pce,
            matrix,
            graph,
            results,
            aon_results,
        })
    }
}
