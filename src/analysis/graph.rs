//! Generic graph substrate used by the control-flow, data-dependency and
//! loop-inclusion analyses.
//!
//! Nodes address their neighbors via keys instead of raw references, so
//! cyclic structures stay plain data.

use std::collections::HashMap;
use std::hash::Hash;

/// Whether edges distinguish direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Directionality {
    Directed,
    Undirected,
}

/// A graph with node payloads `N` and typed edge payloads `E`, keyed by `K`.
#[derive(Debug)]
pub struct Graph<K, N, E> {
    directionality: Directionality,
    nodes: HashMap<K, N>,
    /// Outgoing adjacency; undirected graphs mirror every edge.
    successors: HashMap<K, HashMap<K, E>>,
    /// Incoming adjacency keys (edge data lives in `successors`).
    predecessors: HashMap<K, Vec<K>>,
}

impl<K: Copy + Eq + Hash, N, E> Graph<K, N, E> {
    pub fn new(directionality: Directionality) -> Self {
        Graph {
            directionality,
            nodes: HashMap::new(),
            successors: HashMap::new(),
            predecessors: HashMap::new(),
        }
    }

    pub fn get_or_create_node(&mut self, key: K, payload: impl FnOnce() -> N) -> &mut N {
        self.nodes.entry(key).or_insert_with(payload)
    }

    pub fn node(&self, key: K) -> Option<&N> {
        self.nodes.get(&key)
    }

    pub fn node_mut(&mut self, key: K) -> Option<&mut N> {
        self.nodes.get_mut(&key)
    }

    pub fn contains_node(&self, key: K) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.nodes.keys().copied()
    }

    /// Add or update the edge from `from` to `to`.
    pub fn add_edge(&mut self, from: K, to: K, data: E)
    where
        E: Clone,
    {
        self.successors.entry(from).or_default().insert(to, data.clone());
        let preds = self.predecessors.entry(to).or_default();
        if !preds.contains(&from) {
            preds.push(from);
        }
        if self.directionality == Directionality::Undirected {
            self.successors.entry(to).or_default().insert(from, data);
            let preds = self.predecessors.entry(from).or_default();
            if !preds.contains(&to) {
                preds.push(to);
            }
        }
    }

    pub fn edge(&self, from: K, to: K) -> Option<&E> {
        self.successors.get(&from)?.get(&to)
    }

    pub fn edge_mut(&mut self, from: K, to: K) -> Option<&mut E> {
        self.successors.get_mut(&from)?.get_mut(&to)
    }

    pub fn successors(&self, key: K) -> impl Iterator<Item = (K, &E)> + '_ {
        self.successors
            .get(&key)
            .into_iter()
            .flat_map(|edges| edges.iter().map(|(k, e)| (*k, e)))
    }

    pub fn predecessors(&self, key: K) -> impl Iterator<Item = (K, &E)> + '_ {
        self.predecessors
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(move |pred| self.edge(*pred, key).map(|e| (*pred, e)))
    }

    pub fn num_successors(&self, key: K) -> usize {
        self.successors.get(&key).map_or(0, HashMap::len)
    }

    pub fn num_predecessors(&self, key: K) -> usize {
        self.predecessors.get(&key).map_or(0, Vec::len)
    }

    /// The only successor, if there is exactly one.
    pub fn single_successor(&self, key: K) -> Option<K> {
        let mut succs = self.successors(key);
        let (first, _) = succs.next()?;
        succs.next().is_none().then_some(first)
    }

    /// The only predecessor, if there is exactly one.
    pub fn single_predecessor(&self, key: K) -> Option<K> {
        let mut preds = self.predecessors(key);
        let (first, _) = preds.next()?;
        preds.next().is_none().then_some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_edges_are_one_way() {
        let mut graph: Graph<u32, (), u32> = Graph::new(Directionality::Directed);
        graph.get_or_create_node(1, || ());
        graph.get_or_create_node(2, || ());
        graph.add_edge(1, 2, 42);
        assert_eq!(graph.edge(1, 2), Some(&42));
        assert_eq!(graph.edge(2, 1), None);
        assert_eq!(graph.single_successor(1), Some(2));
        assert_eq!(graph.single_predecessor(2), Some(1));
    }

    #[test]
    fn undirected_edges_mirror() {
        let mut graph: Graph<u32, (), ()> = Graph::new(Directionality::Undirected);
        graph.add_edge(1, 2, ());
        assert!(graph.edge(2, 1).is_some());
    }
}
