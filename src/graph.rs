//! A directed graph that keeps track of edges into removed nodes.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction;

/// A wrapper around a petgraph [`StableGraph`] with value-typed nodes.
///
/// Unlike the plain graph, removing a node does not silently drop its
/// edges. Edges into the removed node are remembered as "broken edges" and
/// restored if the node is added back. This lets multi-step mutations
/// (remove a package, re-add it under a new version) pass through
/// intermediate states without losing the information needed to detect
/// unsatisfied dependencies afterwards.
#[derive(Clone)]
pub struct DepGraph<N> {
    graph: StableGraph<N, ()>,
    /// For looking up graph indices by node value.
    index_map: HashMap<N, NodeIndex>,
    /// Broken edges, keyed by the target of the edge. Values are the edge
    /// sources.
    broken_edges: HashMap<N, HashSet<N>>,
}

impl<N> Default for DepGraph<N>
where
    N: Clone + Eq + Hash + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N> DepGraph<N>
where
    N: Clone + Eq + Hash + fmt::Debug,
{
    pub fn new() -> DepGraph<N> {
        DepGraph {
            graph: StableGraph::new(),
            index_map: HashMap::new(),
            broken_edges: HashMap::new(),
        }
    }

    fn get_or_insert_index(&mut self, node: &N) -> NodeIndex {
        if let Some(index) = self.index_map.get(node) {
            return *index;
        }

        let index = self.graph.add_node(node.clone());
        self.index_map.insert(node.clone(), index);

        index
    }

    /// Remove the edge from the broken-edge map if it lives there.
    ///
    /// Returns true if the edge was a broken edge.
    fn remove_from_broken_edges(&mut self, from: &N, to: &N) -> bool {
        let Some(sources) = self.broken_edges.get_mut(to) else {
            return false;
        };
        if !sources.remove(from) {
            return false;
        }
        if sources.is_empty() {
            self.broken_edges.remove(to);
        }
        true
    }

    /// Add a node. Broken edges into this node are restored as real edges.
    pub fn add_node(&mut self, node: N) {
        self.get_or_insert_index(&node);
        if let Some(sources) = self.broken_edges.remove(&node) {
            for from in sources {
                let a = self.get_or_insert_index(&from);
                let b = self.index_map[&node];
                if self.graph.find_edge(a, b).is_none() {
                    self.graph.add_edge(a, b, ());
                }
            }
        }
    }

    /// Add an edge, creating missing endpoint nodes. If the edge existed as
    /// a broken edge, it is cleared from the broken-edge map.
    pub fn add_edge(&mut self, from: N, to: N) {
        let a = self.get_or_insert_index(&from);
        let b = self.get_or_insert_index(&to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
        self.remove_from_broken_edges(&from, &to);
    }

    /// Remove an edge from the graph, or from the broken-edge map if it
    /// lives there. Removing an absent edge is a no-op.
    pub fn remove_edge(&mut self, from: &N, to: &N) {
        if self.remove_from_broken_edges(from, to) {
            return;
        }
        if let (Some(&a), Some(&b)) = (self.index_map.get(from), self.index_map.get(to)) {
            if let Some(edge) = self.graph.find_edge(a, b) {
                self.graph.remove_edge(edge);
            }
        }
    }

    /// Remove a node, recording all its remaining edges as broken edges.
    pub fn remove_node(&mut self, node: &N) {
        let Some(&index) = self.index_map.get(node) else {
            return;
        };

        let successors: Vec<N> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|i| self.graph[i].clone())
            .collect();
        let predecessors: Vec<N> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|i| self.graph[i].clone())
            .collect();

        for successor in successors {
            self.broken_edges
                .entry(successor)
                .or_default()
                .insert(node.clone());
        }
        for predecessor in predecessors {
            self.broken_edges
                .entry(node.clone())
                .or_default()
                .insert(predecessor);
        }

        self.graph.remove_node(index);
        self.index_map.remove(node);
    }

    pub fn has_node(&self, node: &N) -> bool {
        self.index_map.contains_key(node)
    }

    /// Whether the graph has this edge. Broken edges do not count.
    pub fn has_edge(&self, from: &N, to: &N) -> bool {
        match (self.index_map.get(from), self.index_map.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn is_broken(&self) -> bool {
        !self.broken_edges.is_empty()
    }

    /// All broken edges as `(from, to)` pairs.
    pub fn broken_edges(&self) -> impl Iterator<Item = (&N, &N)> {
        self.broken_edges
            .iter()
            .flat_map(|(to, sources)| sources.iter().map(move |from| (from, to)))
    }

    pub fn number_of_nodes(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    /// All real edges as `(from, to)` pairs. Broken edges are not included.
    pub fn edges(&self) -> Vec<(N, N)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect()
    }

    fn assert_intact(&self, operation: &str) {
        assert!(
            !self.is_broken(),
            "cannot {operation} a graph with broken edges: {:?}",
            self.broken_edges
        );
    }

    /// Outgoing edge targets without the broken-edge assertion. For use by
    /// mutation sequences that operate on an intentionally broken graph.
    pub fn outgoing_edges(&self, node: &N) -> Vec<N> {
        let Some(&index) = self.index_map.get(node) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|i| self.graph[i].clone())
            .collect()
    }

    pub fn neighbors(&self, node: &N) -> Vec<N> {
        self.assert_intact("traverse");
        let Some(&index) = self.index_map.get(node) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|i| self.graph[i].clone())
            .collect()
    }

    pub fn predecessors(&self, node: &N) -> Vec<N> {
        self.assert_intact("traverse");
        let Some(&index) = self.index_map.get(node) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|i| self.graph[i].clone())
            .collect()
    }

    pub fn in_degree(&self, node: &N) -> usize {
        self.assert_intact("measure");
        let Some(&index) = self.index_map.get(node) else {
            return 0;
        };
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .count()
    }

    pub fn in_degrees(&self) -> Vec<(N, usize)> {
        self.assert_intact("measure");
        self.graph
            .node_indices()
            .map(|i| {
                (
                    self.graph[i].clone(),
                    self.graph
                        .neighbors_directed(i, Direction::Incoming)
                        .count(),
                )
            })
            .collect()
    }

    /// Breadth-first traversal from `source`, returning tree edges in
    /// discovery order.
    pub fn bfs_edges(&self, source: &N) -> Vec<(N, N)> {
        self.assert_intact("traverse");
        let mut edges = Vec::new();
        let Some(&start) = self.index_map.get(source) else {
            return edges;
        };

        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if visited.insert(next) {
                    edges.push((self.graph[index].clone(), self.graph[next].clone()));
                    queue.push_back(next);
                }
            }
        }

        edges
    }

    /// All nodes reachable from `source`, excluding `source` itself.
    pub fn descendants(&self, source: &N) -> HashSet<N> {
        self.bfs_edges(source)
            .into_iter()
            .map(|(_, to)| to)
            .collect()
    }

    /// A copy of this graph with every edge flipped.
    pub fn reverse(&self) -> DepGraph<N> {
        self.assert_intact("reverse");
        let mut reversed = DepGraph::new();
        for node in self.nodes() {
            reversed.add_node(node.clone());
        }
        for (from, to) in self.edges() {
            reversed.add_edge(to, from);
        }
        reversed
    }

    /// The subgraph induced by the given nodes.
    pub fn subgraph<'a>(&self, nodes: impl IntoIterator<Item = &'a N>) -> DepGraph<N>
    where
        N: 'a,
    {
        self.assert_intact("take a subgraph of");
        let mut subgraph = DepGraph::new();
        let keep: HashSet<&N> = nodes.into_iter().filter(|n| self.has_node(n)).collect();
        for &node in &keep {
            subgraph.add_node(node.clone());
        }
        for (from, to) in self.edges() {
            if keep.contains(&from) && keep.contains(&to) {
                subgraph.add_edge(from, to);
            }
        }
        subgraph
    }
}

impl<N> fmt::Debug for DepGraph<N>
where
    N: Clone + Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepGraph")
            .field("nodes", &self.nodes().collect::<Vec<_>>())
            .field("edges", &self.edges())
            .field("broken_edges", &self.broken_edges)
            .finish()
    }
}
