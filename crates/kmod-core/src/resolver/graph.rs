//! Explicit dependency graph with stable indices.
//!
//! Edges point from a dependent to its prerequisite.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use kmod_schema::ModuleName;

#[derive(Debug, Default)]
pub(crate) struct ModuleGraph {
    nodes: Vec<ModuleName>,
    index: HashMap<ModuleName, usize>,
    /// `edges[a]` holds every prerequisite of `a`.
    edges: Vec<BTreeSet<usize>>,
}

impl ModuleGraph {
    pub(crate) fn add_node(&mut self, name: &ModuleName) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(name.clone());
        self.index.insert(name.clone(), id);
        self.edges.push(BTreeSet::new());
        id
    }

    /// `dependent` requires `prerequisite`.
    pub(crate) fn add_edge(&mut self, dependent: &ModuleName, prerequisite: &ModuleName) {
        let from = self.add_node(dependent);
        let to = self.add_node(prerequisite);
        self.edges[from].insert(to);
    }

    pub(crate) fn name(&self, id: usize) -> &ModuleName {
        &self.nodes[id]
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Prerequisites before dependents. Ties go to the lexicographically smallest
    /// name, so the order is a function of the graph alone.
    ///
    /// On failure returns one cycle as node ids, first node repeated at the end.
    pub(crate) fn topo_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut pending: Vec<usize> = self.edges.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.len()];
        for (from, prereqs) in self.edges.iter().enumerate() {
            for &to in prereqs {
                dependents[to].push(from);
            }
        }

        let mut ready: BinaryHeap<Reverse<(&ModuleName, usize)>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| Reverse((&self.nodes[id], id)))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for &dependent in &dependents[id] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse((&self.nodes[dependent], dependent)));
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }

        let stuck: BTreeSet<usize> = (0..self.len()).filter(|id| pending[*id] > 0).collect();
        Err(self.find_cycle(&stuck))
    }

    /// Every node in `stuck` has a prerequisite in `stuck`, so walking those
    /// edges from any start must revisit a node.
    fn find_cycle(&self, stuck: &BTreeSet<usize>) -> Vec<usize> {
        let Some(start) = stuck.iter().copied().min_by_key(|id| &self.nodes[*id]) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(next) = self.edges[current]
                .iter()
                .copied()
                .filter(|id| stuck.contains(id))
                .min_by_key(|id| &self.nodes[*id])
            else {
                return path;
            };
            if let Some(&at) = position.get(&next) {
                let mut cycle = path.split_off(at);
                cycle.push(next);
                return cycle;
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    fn names(graph: &ModuleGraph, ids: &[usize]) -> Vec<String> {
        ids.iter().map(|id| graph.name(*id).to_string()).collect()
    }

    #[test]
    fn orders_prerequisites_first() {
        let mut g = ModuleGraph::default();
        g.add_edge(&n("app"), &n("mid"));
        g.add_edge(&n("mid"), &n("base"));
        g.add_edge(&n("app"), &n("base"));

        let order = g.topo_order().unwrap();
        assert_eq!(names(&g, &order), ["base", "mid", "app"]);
    }

    #[test]
    fn ties_break_by_name() {
        let mut g = ModuleGraph::default();
        g.add_edge(&n("root"), &n("zeta"));
        g.add_edge(&n("root"), &n("alpha"));
        g.add_edge(&n("root"), &n("mu"));

        let order = g.topo_order().unwrap();
        assert_eq!(names(&g, &order), ["alpha", "mu", "zeta", "root"]);
    }

    #[test]
    fn reports_cycle() {
        let mut g = ModuleGraph::default();
        g.add_edge(&n("root"), &n("a"));
        g.add_edge(&n("a"), &n("b"));
        g.add_edge(&n("b"), &n("a"));

        let cycle = g.topo_order().unwrap_err();
        assert_eq!(names(&g, &cycle), ["a", "b", "a"]);
    }
}
