//! Dependency Resolver: Kahn's algorithm over a flow's nodes and edges.
//!
//! Produces a deterministic execution order (ties broken by node insertion
//! order) together with the dependency/dependent index lists the scheduler
//! needs to track readiness. Cycles are detected explicitly: nodes left with
//! a non-zero in-degree after the ready queue drains are on, or behind, a
//! cycle, and one concrete cycle among them is reported.

use std::collections::{HashMap, HashSet, VecDeque};

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::Flow;

/// A resolved flow: node indices refer to `flow.nodes`.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Node indices in a valid topological order.
    pub order: Vec<usize>,
    /// Distinct upstream node indices per node.
    pub dependencies: Vec<Vec<usize>>,
    /// Distinct downstream node indices per node.
    pub dependents: Vec<Vec<usize>>,
    /// Position of each node in `order`.
    pub position: Vec<usize>,
}

/// Resolve an execution order for `flow`.
///
/// Fails with `InvalidFlow` for duplicate ids or dangling edges and with
/// `CyclicGraph` when the edges contain a cycle.
pub fn resolve(flow: &Flow) -> Result<ExecutionPlan> {
    flow.validate()?;

    let n = flow.nodes.len();
    let index: HashMap<&str, usize> = flow
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), i))
        .collect();

    // Parallel edges collapse into one dependency.
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    for edge in &flow.edges {
        let source = index[edge.source.as_str()];
        let target = index[edge.target.as_str()];
        if seen.insert((source, target)) {
            dependencies[target].push(source);
            dependents[source].push(target);
        }
    }

    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(current) = ready.pop_front() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < n {
        let cycle = find_cycle(&dependencies, &in_degree)
            .into_iter()
            .map(|i| flow.nodes[i].id.clone())
            .collect();
        return Err(FlowError::CyclicGraph { cycle });
    }

    let mut position = vec![0; n];
    for (pos, &node) in order.iter().enumerate() {
        position[node] = pos;
    }

    Ok(ExecutionPlan {
        order,
        dependencies,
        dependents,
        position,
    })
}

/// Walk upstream through unresolved nodes until one repeats.
///
/// Every unresolved node has at least one unresolved dependency, so the walk
/// must revisit a node; the path from its first visit is a cycle. The first
/// element is repeated at the end (`a -> b -> a`).
fn find_cycle(dependencies: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let Some(start) = (0..in_degree.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut visited_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(&prev) = dependencies[current].iter().find(|&&d| in_degree[d] > 0) else {
            return path;
        };
        if let Some(&at) = visited_at.get(&prev) {
            // Reverse so the cycle reads in edge direction.
            let mut cycle: Vec<usize> = path[at..].iter().rev().copied().collect();
            cycle.insert(0, prev);
            return cycle;
        }
        visited_at.insert(prev, path.len());
        path.push(prev);
        current = prev;
    }
}
