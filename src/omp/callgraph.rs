//! Device call graph over generated functions.
//!
//! Edges are direct calls and taken function addresses (a work-function
//! pointer handed to the runtime is a call by another lane). Reachability
//! from a kernel entry decides which wrappers its worker loop must know.

use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::ir::sir::{Callee, Module};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Call,
    Address,
}

pub struct CallGraph {
    graph: DiGraph<String, EdgeKind>,
    nodes: HashMap<String, NodeIndex>,
}

impl CallGraph {
    pub fn build(module: &Module) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for f in &module.functions {
            let idx = graph.add_node(f.name.clone());
            nodes.insert(f.name.clone(), idx);
        }
        for f in &module.functions {
            let from = nodes[&f.name];
            for callee in f.callees() {
                if let Callee::Direct(name) = callee {
                    if let Some(&to) = nodes.get(name) {
                        graph.update_edge(from, to, EdgeKind::Call);
                    }
                }
            }
            for name in f.address_taken() {
                if let Some(&to) = nodes.get(name) {
                    if graph.find_edge(from, to).is_none() {
                        graph.add_edge(from, to, EdgeKind::Address);
                    }
                }
            }
        }
        Self { graph, nodes }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Functions reachable from `root`, `root` included.
    pub fn reachable_from(&self, root: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.nodes.get(root) else {
            return out;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(n) = dfs.next(&self.graph) {
            out.insert(self.graph[n].clone());
        }
        out
    }

    /// Functions no root reaches.
    pub fn unreachable<'r>(&self, roots: impl IntoIterator<Item = &'r str>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        for r in roots {
            seen.extend(self.reachable_from(r));
        }
        self.nodes
            .keys()
            .filter(|n| !seen.contains(*n))
            .cloned()
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
