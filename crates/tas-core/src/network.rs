//! Link-indexed network model for traffic assignment
//!
//! The assignment algorithms are link-centric: costs, capacities, flows and
//! skim values are all dense arrays indexed by link. The graph topology only
//! matters when paths are built, so [`LinkGraph`] keeps a petgraph digraph
//! for adjacency queries next to the link-indexed columns.
//!
//! Zones (demand centroids) are by convention the first `zones` node ids;
//! they index the rows and columns of the demand matrices.

use anyhow::{anyhow, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(usize);

impl NodeId {
    #[inline]
    pub fn new(value: usize) -> Self {
        NodeId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl LinkId {
    #[inline]
    pub fn new(value: usize) -> Self {
        LinkId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

/// A directed link between two nodes.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
}

impl Link {
    pub fn new(from: usize, to: usize) -> Self {
        Self {
            from: NodeId::new(from),
            to: NodeId::new(to),
        }
    }
}

/// Directed link network with a writable cost column and named skim columns.
///
/// The `cost` column is what path building reads; the solver overwrites it
/// with congested times after every flow update. Skim columns hold per-link
/// quantities (time, distance, tolls) that the loader accumulates along
/// paths into per-OD skim matrices.
#[derive(Debug, Clone)]
pub struct LinkGraph {
    links: Vec<Link>,
    node_count: usize,
    zones: usize,
    /// Link travel costs used for path building.
    pub cost: Vec<f64>,
    skim_fields: Vec<String>,
    /// Per-link skim values, row-major: `[link * num_fields + field]`.
    skims: Vec<f64>,
    graph: DiGraph<(), LinkId>,
}

impl LinkGraph {
    /// Build a graph from a link list.
    ///
    /// `zones` is the number of demand centroids; these are node ids
    /// `0..zones` and must exist in the network.
    pub fn new(node_count: usize, zones: usize, links: Vec<Link>) -> Result<Self> {
        if links.is_empty() {
            return Err(anyhow!("Network has no links"));
        }
        if zones > node_count {
            return Err(anyhow!(
                "{} zones declared but the network only has {} nodes",
                zones,
                node_count
            ));
        }
        for (idx, link) in links.iter().enumerate() {
            if link.from.value() >= node_count || link.to.value() >= node_count {
                return Err(anyhow!(
                    "Link {} references node outside 0..{}",
                    idx,
                    node_count
                ));
            }
        }

        let mut graph = DiGraph::with_capacity(node_count, links.len());
        for _ in 0..node_count {
            graph.add_node(());
        }
        for (idx, link) in links.iter().enumerate() {
            graph.add_edge(
                NodeIndex::new(link.from.value()),
                NodeIndex::new(link.to.value()),
                LinkId::new(idx),
            );
        }

        let num_links = links.len();
        Ok(Self {
            links,
            node_count,
            zones,
            cost: vec![0.0; num_links],
            skim_fields: Vec::new(),
            skims: Vec::new(),
            graph,
        })
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_count
    }

    pub fn zones(&self) -> usize {
        self.zones
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Register a named per-link skim column.
    pub fn add_skim_field(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.links.len() {
            return Err(anyhow!(
                "Skim field '{}' has {} values for {} links",
                name,
                values.len(),
                self.links.len()
            ));
        }
        if self.skim_field_index(name).is_some() {
            return Err(anyhow!("Skim field '{}' already registered", name));
        }
        let fields = self.skim_fields.len() + 1;
        let mut skims = vec![0.0; self.links.len() * fields];
        for link in 0..self.links.len() {
            for f in 0..fields - 1 {
                skims[link * fields + f] = self.skims[link * (fields - 1) + f];
            }
            skims[link * fields + fields - 1] = values[link];
        }
        self.skims = skims;
        self.skim_fields.push(name.to_string());
        Ok(())
    }

    pub fn skim_fields(&self) -> &[String] {
        &self.skim_fields
    }

    pub fn num_skim_fields(&self) -> usize {
        self.skim_fields.len()
    }

    pub fn skim_field_index(&self, name: &str) -> Option<usize> {
        self.skim_fields.iter().position(|f| f == name)
    }

    /// Skim value of `field` on `link`.
    #[inline]
    pub fn skim(&self, link: usize, field: usize) -> f64 {
        self.skims[link * self.skim_fields.len() + field]
    }

    /// Overwrite one skim column with new per-link values.
    pub fn set_skim_column(&mut self, field: usize, values: &[f64]) {
        let fields = self.skim_fields.len();
        for (link, value) in values.iter().enumerate() {
            self.skims[link * fields + field] = *value;
        }
    }

    /// Outgoing links of `node` as `(link index, head node)` pairs.
    pub fn outgoing(&self, node: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.graph
            .edges(NodeIndex::new(node))
            .map(|e| (e.weight().value(), e.target().index()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_parallel_links() -> LinkGraph {
        LinkGraph::new(2, 2, vec![Link::new(0, 1), Link::new(0, 1)]).unwrap()
    }

    #[test]
    fn test_rejects_dangling_link() {
        let result = LinkGraph::new(2, 2, vec![Link::new(0, 5)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_network() {
        assert!(LinkGraph::new(2, 2, vec![]).is_err());
    }

    #[test]
    fn test_rejects_more_zones_than_nodes() {
        assert!(LinkGraph::new(2, 3, vec![Link::new(0, 1)]).is_err());
    }

    #[test]
    fn test_outgoing_links() {
        let graph = two_parallel_links();
        let mut out: Vec<(usize, usize)> = graph.outgoing(0).collect();
        out.sort_unstable();
        assert_eq!(out, vec![(0, 1), (1, 1)]);
        assert_eq!(graph.outgoing(1).count(), 0);
    }

    #[test]
    fn test_skim_columns() {
        let mut graph = two_parallel_links();
        graph.add_skim_field("time", vec![10.0, 12.0]).unwrap();
        graph.add_skim_field("distance", vec![1.0, 2.0]).unwrap();

        assert_eq!(graph.skim_field_index("time"), Some(0));
        assert_eq!(graph.skim_field_index("distance"), Some(1));
        assert_eq!(graph.skim(1, 0), 12.0);
        assert_eq!(graph.skim(1, 1), 2.0);

        graph.set_skim_column(0, &[11.0, 13.0]);
        assert_eq!(graph.skim(0, 0), 11.0);
        // other column untouched
        assert_eq!(graph.skim(0, 1), 1.0);
    }

    #[test]
    fn test_ids_serialise_transparently() {
        assert_eq!(serde_json::to_string(&LinkId::new(7)).unwrap(), "7");
        let id: NodeId = serde_json::from_str("3").unwrap();
        assert_eq!(id.value(), 3);
    }

    #[test]
    fn test_duplicate_skim_field_rejected() {
        let mut graph = two_parallel_links();
        graph.add_skim_field("time", vec![1.0, 1.0]).unwrap();
        assert!(graph.add_skim_field("time", vec![2.0, 2.0]).is_err());
    }
}
