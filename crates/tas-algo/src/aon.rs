//! All-or-nothing path loading
//!
//! Loads every origin's demand onto least-cost paths under the graph's
//! current cost column: one binary-heap Dijkstra tree per origin with
//! predecessor-link tracking, then a backwards walk per destination that
//! drops the per-stratum trips onto every link of the path and accumulates
//! the graph's skim fields into the OD skim cell.
//!
//! Origins fan out across the ambient rayon pool; per-origin partial load
//! matrices merge by reduction, skim rows are written disjointly.
//!
//! The loader is pure given its inputs and overwrites the output buffers,
//! so repeated calls with unchanged costs produce identical results.

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tas_core::{AssignmentResults, DemandMatrix, LinkGraph, LinkLoads};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    cost: f64,
    node: usize,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.node == other.node
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Least-cost tree rooted at one origin.
struct PathTree {
    cost: Vec<f64>,
    /// Incoming tree link per node; `None` for the origin and unreached nodes.
    pred_link: Vec<Option<usize>>,
}

fn shortest_path_tree(graph: &LinkGraph, origin: usize) -> PathTree {
    let n = graph.num_nodes();
    let mut cost = vec![f64::INFINITY; n];
    let mut pred_link = vec![None; n];
    let mut visited = vec![false; n];
    let mut queue = BinaryHeap::new();

    cost[origin] = 0.0;
    queue.push(Reverse(QueueEntry {
        cost: 0.0,
        node: origin,
    }));

    while let Some(Reverse(entry)) = queue.pop() {
        if visited[entry.node] {
            continue;
        }
        visited[entry.node] = true;

        for (link, head) in graph.outgoing(entry.node) {
            let candidate = entry.cost + graph.cost[link];
            if candidate < cost[head] {
                cost[head] = candidate;
                pred_link[head] = Some(link);
                queue.push(Reverse(QueueEntry {
                    cost: candidate,
                    node: head,
                }));
            }
        }
    }

    PathTree { cost, pred_link }
}

/// Per-origin output: partial loads go into `loads`, the origin's skim row
/// (when skim fields exist) is returned, along with the count of demanded
/// destinations no path could reach.
fn load_origin(
    matrix: &DemandMatrix,
    graph: &LinkGraph,
    origin: usize,
    loads: &mut LinkLoads,
) -> (Option<Vec<f64>>, usize) {
    let zones = matrix.zones();
    let strata = matrix.num_strata();
    let fields = graph.num_skim_fields();

    let tree = shortest_path_tree(graph, origin);
    let mut skim_row = (fields > 0).then(|| vec![0.0; zones * fields]);
    let mut unreachable = 0;
    let mut path: Vec<usize> = Vec::new();

    for dest in 0..zones {
        if dest == origin {
            continue;
        }
        let demanded = (0..strata).any(|s| matrix.demand(s, origin, dest) > 0.0);
        if !demanded && fields == 0 {
            continue;
        }
        if !tree.cost[dest].is_finite() {
            if demanded {
                unreachable += 1;
            }
            continue;
        }

        path.clear();
        let mut node = dest;
        while node != origin {
            match tree.pred_link[node] {
                Some(link) => {
                    path.push(link);
                    node = graph.links()[link].from.value();
                }
                None => {
                    path.clear();
                    break;
                }
            }
        }
        if path.is_empty() {
            continue;
        }

        if demanded {
            for stratum in 0..strata {
                let trips = matrix.demand(stratum, origin, dest);
                if trips > 0.0 {
                    for &link in &path {
                        *loads.at_mut(link, stratum) += trips;
                    }
                }
            }
        }

        if let Some(row) = skim_row.as_mut() {
            for &link in &path {
                for field in 0..fields {
                    row[dest * fields + field] += graph.skim(link, field);
                }
            }
        }
    }

    (skim_row, unreachable)
}

/// Load `matrix` onto `graph` under its current costs, overwriting `out`.
pub fn load(matrix: &DemandMatrix, graph: &LinkGraph, out: &mut AssignmentResults) -> Result<()> {
    let links = graph.num_links();
    let strata = matrix.num_strata();
    let fields = graph.num_skim_fields();

    if matrix.zones() != graph.zones() {
        return Err(anyhow!(
            "Demand has {} zones but the graph has {}",
            matrix.zones(),
            graph.zones()
        ));
    }
    if out.link_loads.links() != links || out.link_loads.strata() != strata {
        return Err(anyhow!(
            "Output buffer is {}x{} but the loading needs {}x{}",
            out.link_loads.links(),
            out.link_loads.strata(),
            links,
            strata
        ));
    }
    if fields > 0 && out.num_skims() != fields {
        return Err(anyhow!(
            "Graph has {} skim fields but the output buffer holds {}",
            fields,
            out.num_skims()
        ));
    }

    // Only origins with trips matter for loads, but a skimming run needs
    // every origin's tree to fill the full skim matrix.
    let origins: Vec<usize> = (0..matrix.zones())
        .filter(|&o| fields > 0 || matrix.origin_total(o) > 0.0)
        .collect();

    type Partial = (LinkLoads, Vec<(usize, Vec<f64>)>, usize);
    let identity = || (LinkLoads::zeros(links, strata), Vec::new(), 0usize);

    let (loads, skim_rows, unreachable): Partial = origins
        .par_iter()
        .fold(identity, |(mut loads, mut rows, mut missed), &origin| {
            let (row, unreachable) = load_origin(matrix, graph, origin, &mut loads);
            if let Some(row) = row {
                rows.push((origin, row));
            }
            missed += unreachable;
            (loads, rows, missed)
        })
        .reduce(identity, |(mut la, mut ra, ua), (lb, rb, ub)| {
            la.accumulate(&lb);
            ra.extend(rb);
            (la, ra, ua + ub)
        });

    out.link_loads.data_mut().copy_from_slice(loads.data());
    if let Some(skims) = out.skims.as_mut() {
        for (origin, row) in skim_rows {
            skims.origin_row_mut(origin).copy_from_slice(&row);
        }
    }

    if unreachable > 0 {
        warn!(
            "{} demanded OD pairs were unreachable and loaded nothing",
            unreachable
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tas_core::Link;

    /// Two zones, one intermediate node. A cheap two-link route via the
    /// middle (cost 2) and an expensive direct link (cost 3).
    fn detour_graph() -> LinkGraph {
        let mut graph = LinkGraph::new(
            3,
            2,
            vec![Link::new(0, 2), Link::new(2, 1), Link::new(0, 1)],
        )
        .unwrap();
        graph.cost = vec![1.0, 1.0, 3.0];
        graph
    }

    fn demand_0_to_1(trips: f64) -> DemandMatrix {
        let mut matrix = DemandMatrix::new(2, vec!["car".into()]).unwrap();
        matrix.set_demand(0, 0, 1, trips);
        matrix
    }

    #[test]
    fn test_loads_follow_cheapest_path() {
        let graph = detour_graph();
        let matrix = demand_0_to_1(10.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();

        assert_eq!(out.link_loads.at(0, 0), 10.0);
        assert_eq!(out.link_loads.at(1, 0), 10.0);
        assert_eq!(out.link_loads.at(2, 0), 0.0);
    }

    #[test]
    fn test_loads_switch_with_costs() {
        let mut graph = detour_graph();
        graph.cost = vec![5.0, 5.0, 3.0];
        let matrix = demand_0_to_1(10.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();

        assert_eq!(out.link_loads.at(0, 0), 0.0);
        assert_eq!(out.link_loads.at(2, 0), 10.0);
    }

    #[test]
    fn test_strata_loaded_independently() {
        let graph = detour_graph();
        let mut matrix = DemandMatrix::new(2, vec!["sov".into(), "hov".into()]).unwrap();
        matrix.set_demand(0, 0, 1, 10.0);
        matrix.set_demand(1, 0, 1, 4.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();

        assert_eq!(out.link_loads.at(0, 0), 10.0);
        assert_eq!(out.link_loads.at(0, 1), 4.0);
        out.total_flows();
        assert_eq!(out.total_link_loads[0], 14.0);
    }

    #[test]
    fn test_skims_accumulate_along_path() {
        let mut graph = detour_graph();
        graph
            .add_skim_field("distance", vec![2.0, 2.5, 10.0])
            .unwrap();
        let matrix = demand_0_to_1(10.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();

        let skims = out.skims.as_ref().unwrap();
        // path runs via the middle node: 2.0 + 2.5
        assert!((skims.at(0, 1, 0) - 4.5).abs() < 1e-12);
        // no path ends at the origin itself
        assert_eq!(skims.at(0, 0, 0), 0.0);
    }

    #[test]
    fn test_unreachable_destination_loads_nothing() {
        // Zone 1 has no incoming links at all.
        let graph = LinkGraph::new(3, 2, vec![Link::new(0, 2)]).unwrap();
        let matrix = demand_0_to_1(10.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();

        assert!(out.link_loads.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_repeat_load_is_idempotent() {
        let graph = detour_graph();
        let matrix = demand_0_to_1(10.0);
        let mut out = AssignmentResults::prepare(&graph, &matrix);

        load(&matrix, &graph, &mut out).unwrap();
        let first = out.link_loads.data().to_vec();
        load(&matrix, &graph, &mut out).unwrap();
        assert_eq!(first, out.link_loads.data());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let graph = detour_graph();
        let matrix = demand_0_to_1(10.0);
        let other = DemandMatrix::new(2, vec!["a".into(), "b".into()]).unwrap();
        let mut out = AssignmentResults::prepare(&graph, &other);

        assert!(load(&matrix, &graph, &mut out).is_err());
    }
}
