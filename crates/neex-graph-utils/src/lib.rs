//! Helpers layered on top of `petgraph`: a streaming DAG walker, stable
//! topological ordering, and cycle detection that degrades to a warning
//! instead of refusing to schedule.

mod walker;

use std::fmt::Display;

use itertools::Itertools;
use petgraph::prelude::*;
use thiserror::Error;

pub use walker::{WalkHandle, WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Strongly connected components with more than one member, i.e. the
/// dependency cycles of the graph.
pub fn cycles<N, E>(graph: &Graph<N, E>) -> Vec<Vec<NodeIndex>> {
    petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .collect()
}

/// Render a cycle as `a -> b -> c` for warning output.
pub fn format_cycle<N: Display, E>(graph: &Graph<N, E>, cycle: &[NodeIndex]) -> String {
    cycle
        .iter()
        .filter_map(|ix| graph.node_weight(*ix))
        .join(" -> ")
}

/// A total order over all nodes that respects every edge outside of a cycle.
/// Members of a cycle stay adjacent but in arbitrary relative order, so a
/// cyclic graph still yields a usable ordering.
///
/// Edges are interpreted as `node -> dependency`: dependencies sort before
/// their dependents.
pub fn topological_order<N, E>(graph: &Graph<N, E>) -> Vec<NodeIndex> {
    // Tarjan emits SCCs in reverse topological order of the condensation,
    // which is exactly dependencies-first for `node -> dependency` edges.
    petgraph::algo::tarjan_scc(graph).into_iter().flatten().collect()
}

/// Reject self-edges. Cycles spanning multiple nodes are tolerated by the
/// callers (they warn and continue), but a package depending on itself is
/// always a configuration mistake.
pub fn validate_no_self_dependencies<N, E>(graph: &Graph<N, E>) -> Result<(), Error>
where
    N: Display,
{
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge endpoint must exist");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }
    Ok(())
}
