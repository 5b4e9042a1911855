//! Dependency graph over registered tasks.
//!
//! Nodes are task registration indices; edges point from a dependent to
//! each of its dependencies. The traversal order is fully deterministic:
//! dependencies are visited in declaration order and roots in request
//! order, so equal graphs always schedule identically and ties fall back
//! to registration order.

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ConfigError;

pub(crate) struct TaskGraph {
    graph: DiGraph<usize, ()>,
}

impl TaskGraph {
    /// Build a graph over the tasks from their resolved dependency lists.
    /// Duplicate dependencies collapse to the first occurrence.
    pub fn new(dep_lists: Vec<Vec<usize>>) -> Self {
        let mut graph = DiGraph::with_capacity(dep_lists.len(), 0);
        let nodes: Vec<NodeIndex> = (0..dep_lists.len()).map(|id| graph.add_node(id)).collect();

        for (id, list) in dep_lists.iter().enumerate() {
            for &dep in list {
                if graph.find_edge(nodes[id], nodes[dep]).is_none() {
                    graph.add_edge(nodes[id], nodes[dep], ());
                }
            }
        }

        TaskGraph { graph }
    }

    /// Declared dependencies of a task, in declaration order.
    pub fn immediate_dependencies(&self, id: usize) -> Vec<usize> {
        // `neighbors` walks edges most-recently-added first.
        let mut deps: Vec<usize> = self
            .graph
            .neighbors(NodeIndex::new(id))
            .map(|n| self.graph[n])
            .collect();
        deps.reverse();
        deps
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Dependency-first order of every task reachable from `roots`.
    ///
    /// Fails with the offending cycle if one is reachable. `names` is only
    /// consulted to describe that cycle.
    pub fn topological_order(
        &self,
        roots: &[usize],
        names: &[String],
    ) -> Result<Vec<usize>, ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut color = vec![Color::White; self.graph.node_count()];
        let mut order = Vec::new();

        // Iterative DFS; each frame carries the node's remaining
        // dependencies in declaration order.
        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();

        for &root in roots {
            if color[root] != Color::White {
                continue;
            }
            color[root] = Color::Grey;
            stack.push((root, self.immediate_dependencies(root), 0));

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                if frame.2 < frame.1.len() {
                    let dep = frame.1[frame.2];
                    frame.2 += 1;
                    match color[dep] {
                        Color::White => {
                            color[dep] = Color::Grey;
                            stack.push((dep, self.immediate_dependencies(dep), 0));
                        }
                        Color::Grey => {
                            // unwind the stack from the first occurrence of
                            // `dep` to name the cycle
                            let mut cycle: Vec<String> = stack
                                .iter()
                                .map(|f| f.0)
                                .skip_while(|&n| n != dep)
                                .map(|n| names[n].clone())
                                .collect();
                            cycle.push(names[dep].clone());
                            return Err(ConfigError::CyclicDependency(cycle));
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    order.push(node);
                    stack.pop();
                }
            }
        }

        Ok(order)
    }
}
