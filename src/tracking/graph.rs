// src/tracking/graph.rs
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{TrackingError, TrackingResult};
use crate::session::{SessionId, UnitId};

/// Node id of a unit in a session: `"{session}_{unit}"`.
pub fn node_id(session: &str, unit_id: UnitId) -> String {
    format!("{}_{}", session, unit_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub session_id: SessionId,
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EdgeAttributes {
    pub weight: f64,
    /// Seconds between the two recordings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_delta: Option<f64>,
    /// Micrometres between the two implant depths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_delta: Option<f64>,
}

impl EdgeAttributes {
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            ..Self::default()
        }
    }

    pub fn get(&self, key: EdgeKey) -> Option<f64> {
        match key {
            EdgeKey::Weight => Some(self.weight),
            EdgeKey::TimeDelta => self.time_delta,
            EdgeKey::DepthDelta => self.depth_delta,
        }
    }
}

/// Edge attribute used for threshold pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKey {
    Weight,
    TimeDelta,
    DepthDelta,
}

impl EdgeKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKey::Weight => "weight",
            EdgeKey::TimeDelta => "time_delta",
            EdgeKey::DepthDelta => "depth_delta",
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKey {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weight" => Ok(EdgeKey::Weight),
            "time_delta" => Ok(EdgeKey::TimeDelta),
            "depth_delta" => Ok(EdgeKey::DepthDelta),
            other => Err(TrackingError::InvalidEdgeKey(other.to_string())),
        }
    }
}

fn edge_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// MATCH GRAPH -----------------------------------------------------------------

/// Undirected graph of units (nodes) joined by accepted matches (edges).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchGraph {
    nodes: BTreeMap<String, NodeAttributes>,
    edges: BTreeMap<(String, String), EdgeAttributes>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl MatchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the node for `unit_id` in `session`. Re-adding is a no-op.
    pub fn add_unit(&mut self, session: &str, unit_id: UnitId) -> String {
        let id = node_id(session, unit_id);
        self.insert_node(
            id.clone(),
            NodeAttributes {
                session_id: session.to_string(),
                unit_id,
            },
        );
        id
    }

    fn insert_node(&mut self, id: String, attributes: NodeAttributes) {
        self.adjacency.entry(id.clone()).or_default();
        self.nodes.entry(id).or_insert(attributes);
    }

    /// Adds or replaces the edge between two existing nodes.
    pub fn add_edge(&mut self, a: &str, b: &str, attributes: EdgeAttributes) -> TrackingResult<()> {
        for node in [a, b] {
            if !self.nodes.contains_key(node) {
                return Err(TrackingError::UnknownNode(node.to_string()));
            }
        }
        self.edges.insert(edge_key(a, b), attributes);
        self.adjacency.entry(a.to_string()).or_default().insert(b.to_string());
        self.adjacency.entry(b.to_string()).or_default().insert(a.to_string());
        Ok(())
    }

    pub fn remove_edge(&mut self, a: &str, b: &str) -> Option<EdgeAttributes> {
        let removed = self.edges.remove(&edge_key(a, b))?;
        if let Some(n) = self.adjacency.get_mut(a) {
            n.remove(b);
        }
        if let Some(n) = self.adjacency.get_mut(b) {
            n.remove(a);
        }
        Some(removed)
    }

    pub fn node(&self, id: &str) -> Option<&NodeAttributes> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeAttributes)> {
        self.nodes.iter().map(|(id, attrs)| (id.as_str(), attrs))
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<&EdgeAttributes> {
        self.edges.get(&edge_key(a, b))
    }

    pub fn edge_mut(&mut self, a: &str, b: &str) -> Option<&mut EdgeAttributes> {
        self.edges.get_mut(&edge_key(a, b))
    }

    /// Every edge once, endpoints in ascending order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &EdgeAttributes)> {
        self.edges
            .iter()
            .map(|((a, b), attrs)| (a.as_str(), b.as_str(), attrs))
    }

    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(id)
            .into_iter()
            .flat_map(|n| n.iter().map(String::as_str))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Connected components, ordered by their smallest node id.
    pub fn connected_components(&self) -> Vec<BTreeSet<String>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = Vec::new();

        for start in self.nodes.keys() {
            if !seen.insert(start.as_str()) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start.as_str()]);
            while let Some(node) = queue.pop_front() {
                component.insert(node.to_string());
                for next in self.neighbors(node) {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// Edges with at least one endpoint in `component`.
    pub fn component_edges<'a>(
        &'a self,
        component: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = (&'a str, &'a str, &'a EdgeAttributes)> + 'a {
        self.edges()
            .filter(move |(a, b, _)| component.contains(*a) || component.contains(*b))
    }

    // PRUNING -----------------------------------------------------------------

    /// Removes every edge whose `key` attribute exceeds `threshold`.
    ///
    /// Fails without touching the graph if an edge lacks the attribute.
    pub fn remove_edges_above_threshold(
        &mut self,
        key: EdgeKey,
        threshold: f64,
    ) -> TrackingResult<usize> {
        let mut to_remove = Vec::new();
        for component in self.connected_components() {
            for (a, b, attrs) in self.component_edges(&component) {
                let value = attrs
                    .get(key)
                    .ok_or_else(|| TrackingError::MissingEdgeAttribute {
                        attribute: key.to_string(),
                        source_node: a.to_string(),
                        target_node: b.to_string(),
                    })?;
                if value > threshold {
                    to_remove.push(edge_key(a, b));
                }
            }
        }
        for (a, b) in &to_remove {
            self.remove_edge(a, b);
        }
        Ok(to_remove.len())
    }

    /// Mean weight of the edges touching `id`; `None` for an isolated node.
    pub fn mean_edge_weight(&self, id: &str) -> Option<f64> {
        let weights: Vec<f64> = self
            .neighbors(id)
            .filter_map(|n| self.edge(id, n).map(|e| e.weight))
            .collect();
        if weights.is_empty() {
            None
        } else {
            Some(weights.iter().sum::<f64>() / weights.len() as f64)
        }
    }

    /// Resolves components holding more than one unit of the same session.
    ///
    /// Within each such component, for every session that appears more than
    /// once, only the node(s) with the lowest mean edge weight keep their
    /// edges; the others are cut loose. Tied nodes all keep their edges.
    pub fn remove_edges_with_duplicate_sessions(&mut self) -> usize {
        let mut to_remove: BTreeSet<(String, String)> = BTreeSet::new();

        for component in self.connected_components() {
            let mut by_session: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for id in &component {
                if let Some(node) = self.nodes.get(id) {
                    by_session
                        .entry(node.session_id.as_str())
                        .or_default()
                        .push(id.as_str());
                }
            }

            for duplicates in by_session.values().filter(|ids| ids.len() > 1) {
                let weights: Vec<(&str, f64)> = duplicates
                    .iter()
                    .filter_map(|&id| self.mean_edge_weight(id).map(|w| (id, w)))
                    .collect();
                let min_weight = weights
                    .iter()
                    .map(|&(_, w)| w)
                    .fold(f64::INFINITY, f64::min);

                for &(id, weight) in &weights {
                    if weight > min_weight {
                        for neighbor in self.neighbors(id) {
                            if component.contains(neighbor) {
                                to_remove.insert(edge_key(id, neighbor));
                            }
                        }
                    }
                }
            }
        }

        for (a, b) in &to_remove {
            self.remove_edge(a, b);
        }
        to_remove.len()
    }

    // PERSISTENCE -------------------------------------------------------------

    pub fn to_yaml(&self) -> TrackingResult<String> {
        let file = GraphFile {
            nodes: self
                .nodes
                .iter()
                .map(|(id, attrs)| NodeRecord {
                    id: id.clone(),
                    session_id: attrs.session_id.clone(),
                    unit_id: attrs.unit_id,
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|((a, b), attrs)| EdgeRecord {
                    source: a.clone(),
                    target: b.clone(),
                    weight: attrs.weight,
                    time_delta: attrs.time_delta,
                    depth_delta: attrs.depth_delta,
                })
                .collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn from_yaml(text: &str) -> TrackingResult<Self> {
        let file: GraphFile = serde_yaml::from_str(text)?;
        let mut graph = MatchGraph::new();
        for node in file.nodes {
            graph.insert_node(
                node.id,
                NodeAttributes {
                    session_id: node.session_id,
                    unit_id: node.unit_id,
                },
            );
        }
        for edge in file.edges {
            let attributes = EdgeAttributes {
                weight: edge.weight,
                time_delta: edge.time_delta,
                depth_delta: edge.depth_delta,
            };
            graph.add_edge(&edge.source, &edge.target, attributes)?;
        }
        Ok(graph)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> TrackingResult<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> TrackingResult<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: String,
    session_id: SessionId,
    unit_id: UnitId,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    source: String,
    target: String,
    weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_delta: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, UnitId, &str, UnitId, f64)]) -> MatchGraph {
        let mut graph = MatchGraph::new();
        for &(s0, u0, s1, u1, weight) in edges {
            let a = graph.add_unit(s0, u0);
            let b = graph.add_unit(s1, u1);
            graph.add_edge(&a, &b, EdgeAttributes::new(weight)).unwrap();
        }
        graph
    }

    #[test]
    fn edges_are_undirected() {
        let g = graph(&[("s2", 1, "s1", 4, 0.3)]);
        assert_eq!(g.edge("s1_4", "s2_1"), g.edge("s2_1", "s1_4"));
        assert_eq!(g.num_edges(), 1);
    }

    #[test]
    fn re_adding_a_node_keeps_it_once() {
        let mut g = MatchGraph::new();
        g.add_unit("s1", 1);
        g.add_unit("s1", 1);
        assert_eq!(g.num_nodes(), 1);
    }

    #[test]
    fn edge_between_unknown_nodes_is_rejected() {
        let mut g = MatchGraph::new();
        g.add_unit("s1", 1);
        assert!(matches!(
            g.add_edge("s1_1", "s2_1", EdgeAttributes::new(0.1)),
            Err(TrackingError::UnknownNode(_))
        ));
    }

    #[test]
    fn components_follow_edges() {
        let mut g = graph(&[("s1", 1, "s2", 1, 0.1), ("s2", 1, "s3", 1, 0.1)]);
        g.add_unit("s3", 2);
        let components = g.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].len(), 3);
        assert!(components[1].contains("s3_2"));
    }

    #[test]
    fn threshold_pruning_cuts_heavy_edges() {
        let mut g = graph(&[("s1", 1, "s2", 1, 0.02), ("s2", 1, "s3", 1, 0.2)]);
        assert_eq!(g.remove_edges_above_threshold(EdgeKey::Weight, 0.05).unwrap(), 1);
        assert!(g.edge("s2_1", "s3_1").is_none());
        assert!(g.edge("s1_1", "s2_1").is_some());
    }

    #[test]
    fn threshold_pruning_needs_the_attribute() {
        let mut g = graph(&[("s1", 1, "s2", 1, 0.02)]);
        assert!(matches!(
            g.remove_edges_above_threshold(EdgeKey::TimeDelta, 10.0),
            Err(TrackingError::MissingEdgeAttribute { .. })
        ));
        assert_eq!(g.num_edges(), 1);
    }

    #[test]
    fn duplicate_session_keeps_lightest_node() {
        let mut g = graph(&[("session1", 1, "session2", 2, 0.2), ("session1", 1, "session2", 3, 0.5)]);
        assert_eq!(g.remove_edges_with_duplicate_sessions(), 1);
        assert!(g.edge("session1_1", "session2_3").is_none());

        let components = g.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(
            components[0],
            ["session1_1", "session2_2"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            components[1],
            ["session2_3"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn duplicate_session_tie_keeps_both() {
        let mut g = graph(&[("s1", 1, "s2", 2, 0.3), ("s1", 1, "s2", 3, 0.3)]);
        assert_eq!(g.remove_edges_with_duplicate_sessions(), 0);
        assert_eq!(g.connected_components().len(), 1);
    }

    #[test]
    fn yaml_round_trip_preserves_attributes() {
        let mut g = graph(&[("s1", 1, "s2", 5, 0.125), ("s2", 5, "s3", 2, 0.25)]);
        g.add_unit("s3", 9);
        if let Some(edge) = g.edge_mut("s1_1", "s2_5") {
            edge.time_delta = Some(86400.0);
            edge.depth_delta = Some(25.0);
        }
        let reloaded = MatchGraph::from_yaml(&g.to_yaml().unwrap()).unwrap();
        assert_eq!(reloaded, g);
        assert_eq!(reloaded.node("s3_9").unwrap().unit_id, 9);
    }

    #[test]
    fn edge_key_parses_known_names_only() {
        assert_eq!("depth_delta".parse::<EdgeKey>().unwrap(), EdgeKey::DepthDelta);
        assert!("distance".parse::<EdgeKey>().is_err());
    }
}
