// src/tracking/multi.rs
use ndarray::Array3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::comparison::{ComparisonOptions, SessionComparison};
use super::graph::{node_id, EdgeAttributes, EdgeKey, MatchGraph};
use super::template::{compute_template, Template};
use crate::config::{OutputConfig, PruningConfig, TrackerConfig};
use crate::error::{TrackingError, TrackingResult};
use crate::session::{
    ChannelGroup, SessionId, SessionMetadata, SessionStore, UnitId, DEFAULT_PROBE,
};
use crate::utils::log::log_csv;

const GRAPH_FILE_PREFIX: &str = "graph-group-";

// -----------------------------------------------------------------------------
// RESULT TYPES
// -----------------------------------------------------------------------------

/// One neuron followed across the sessions in which it was matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedUnit {
    pub id: Uuid,
    pub channel_group: ChannelGroup,
    /// Mean weight of the component's edges; `None` for a lone unit.
    pub average_dissimilarity: Option<f64>,
    pub original_unit_ids: BTreeMap<SessionId, Vec<UnitId>>,
}

impl IdentifiedUnit {
    pub fn session_count(&self) -> usize {
        self.original_unit_ids.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStyle {
    Template,
    Waveform,
}

impl FromStr for DisplayStyle {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "template" => Ok(DisplayStyle::Template),
            "waveform" => Ok(DisplayStyle::Waveform),
            other => Err(TrackingError::InvalidStyle(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UnitTrace {
    Template(Template),
    Waveforms(Array3<f64>),
}

#[derive(Debug, Clone)]
pub struct MemberTrace {
    pub session_id: SessionId,
    pub unit_id: UnitId,
    pub trace: UnitTrace,
}

#[derive(Debug, Clone)]
pub struct TrackedUnitTraces {
    pub unit: Uuid,
    pub members: Vec<MemberTrace>,
}

// -----------------------------------------------------------------------------
// TRACKER
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackerPhase {
    Created,
    Matched,
    GraphBuilt,
    Resolved,
}

impl TrackerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerPhase::Created => "created",
            TrackerPhase::Matched => "matched",
            TrackerPhase::GraphBuilt => "graph built",
            TrackerPhase::Resolved => "resolved",
        }
    }
}

impl fmt::Display for TrackerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks units across many sessions: pairwise matching, match graph,
/// pruning, then one identified unit per connected component.
pub struct MultiSessionTracker<'a> {
    store: &'a dyn SessionStore,
    config: TrackerConfig,
    data_path: PathBuf,
    session_ids: Vec<SessionId>,
    channel_groups: BTreeSet<ChannelGroup>,
    phase: TrackerPhase,
    comparisons: Vec<SessionComparison>,
    graphs: BTreeMap<ChannelGroup, MatchGraph>,
    identified_units: BTreeMap<ChannelGroup, Vec<IdentifiedUnit>>,
}

impl<'a> MultiSessionTracker<'a> {
    pub fn new(store: &'a dyn SessionStore, config: TrackerConfig) -> TrackingResult<Self> {
        let session_ids = match &config.sessions {
            Some(sessions) => sessions.clone(),
            None => store.session_ids()?,
        };
        let mut seen = BTreeSet::new();
        for session in &session_ids {
            if !seen.insert(session.as_str()) {
                return Err(TrackingError::DuplicateSession(session.clone()));
            }
        }

        let channel_groups = match (config.channel_group, session_ids.first()) {
            (Some(group), _) => BTreeSet::from([group]),
            (None, Some(first)) => store.channel_groups(first)?,
            (None, None) => BTreeSet::new(),
        };
        if channel_groups.is_empty() {
            warn!("unable to locate channel groups, check the session list");
        }

        Ok(Self {
            store,
            config,
            data_path: PathBuf::from("."),
            session_ids,
            channel_groups,
            phase: TrackerPhase::Created,
            comparisons: Vec::new(),
            graphs: BTreeMap::new(),
            identified_units: BTreeMap::new(),
        })
    }

    /// Directory used by `save_graphs` and `load_graphs`.
    pub fn with_data_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn session_ids(&self) -> &[SessionId] {
        &self.session_ids
    }

    pub fn channel_groups(&self) -> &BTreeSet<ChannelGroup> {
        &self.channel_groups
    }

    pub fn comparisons(&self) -> &[SessionComparison] {
        &self.comparisons
    }

    pub fn graphs(&self) -> &BTreeMap<ChannelGroup, MatchGraph> {
        &self.graphs
    }

    pub fn graph(&self, channel_group: ChannelGroup) -> Option<&MatchGraph> {
        self.graphs.get(&channel_group)
    }

    pub fn identified_units(&self) -> &BTreeMap<ChannelGroup, Vec<IdentifiedUnit>> {
        &self.identified_units
    }

    fn require(&self, phase: TrackerPhase, operation: &'static str) -> TrackingResult<()> {
        if self.phase < phase {
            return Err(TrackingError::PhaseOrder {
                required: operation,
                current: self.phase.as_str(),
            });
        }
        Ok(())
    }

    // PHASE 1 -----------------------------------------------------------------

    /// Compares every unordered session pair without a dissimilarity
    /// threshold; thresholds are applied to the graph later.
    pub fn do_matching(&mut self) -> TrackingResult<()> {
        let n = self.session_ids.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect();
        info!(
            "pairwise comparison of {} sessions ({} pairs)",
            n,
            pairs.len()
        );

        let options = ComparisonOptions {
            channel_group: self.config.channel_group,
            max_dissimilarity: f64::INFINITY,
            metric: self.config.metric,
        };
        let store = self.store;
        let sessions = &self.session_ids;
        let done = AtomicUsize::new(0);
        let total = pairs.len();
        let compare = |&(i, j): &(usize, usize)| {
            debug!("comparing {} and {}", sessions[i], sessions[j]);
            let result = SessionComparison::new(store, &sessions[i], &sessions[j], options);
            let k = done.fetch_add(1, Ordering::Relaxed) + 1;
            info!("compared {}/{} pairs", k, total);
            result
        };

        let results: Vec<TrackingResult<SessionComparison>> = if self.config.parallel {
            pairs.par_iter().map(compare).collect()
        } else {
            pairs.iter().map(compare).collect()
        };

        self.comparisons = results.into_iter().collect::<TrackingResult<Vec<_>>>()?;
        self.graphs.clear();
        self.identified_units.clear();
        self.phase = TrackerPhase::Matched;
        Ok(())
    }

    // PHASE 2 -----------------------------------------------------------------

    /// One graph per channel group: a node per unit seen in any comparison,
    /// an edge per hungarian match weighted by its dissimilarity.
    pub fn make_graphs_from_matches(&mut self) -> TrackingResult<()> {
        self.require(TrackerPhase::Matched, "make_graphs_from_matches")?;

        let mut graphs = BTreeMap::new();
        for &channel_group in &self.channel_groups {
            let mut graph = MatchGraph::new();

            for comparison in &self.comparisons {
                for (side, session) in comparison.session_ids().iter().enumerate() {
                    for &unit_id in comparison.unit_ids(channel_group, side) {
                        graph.add_unit(session, unit_id);
                    }
                }
            }

            for comparison in &self.comparisons {
                let (Some(matrix), Some(matches)) = (
                    comparison.matrix(channel_group),
                    comparison.matches(channel_group),
                ) else {
                    continue;
                };
                let [session_0, session_1] = comparison.session_ids();
                for (&u0, &u1) in &matches.hungarian.forward {
                    let (Some(u1), Some(score)) = (u1, u1.and_then(|u1| matrix.get(u0, u1)))
                    else {
                        continue;
                    };
                    graph.add_edge(
                        &node_id(session_0, u0),
                        &node_id(session_1, u1),
                        EdgeAttributes::new(score),
                    )?;
                }
            }

            debug!(
                "channel group {}: {} nodes, {} edges",
                channel_group,
                graph.num_nodes(),
                graph.num_edges()
            );
            graphs.insert(channel_group, graph);
        }

        self.graphs = graphs;
        self.identified_units.clear();
        self.phase = TrackerPhase::GraphBuilt;
        Ok(())
    }

    // PHASE 3 -----------------------------------------------------------------

    fn session_metadata(
        &self,
        cache: &mut BTreeMap<SessionId, SessionMetadata>,
        session: &str,
    ) -> TrackingResult<SessionMetadata> {
        if let Some(meta) = cache.get(session) {
            return Ok(meta.clone());
        }
        let meta = self.store.metadata(session)?;
        cache.insert(session.to_string(), meta.clone());
        Ok(meta)
    }

    fn endpoint_sessions(graph: &MatchGraph, a: &str, b: &str) -> TrackingResult<(String, String)> {
        let session_of = |id: &str| {
            graph
                .node(id)
                .map(|n| n.session_id.clone())
                .ok_or_else(|| TrackingError::UnknownNode(id.to_string()))
        };
        Ok((session_of(a)?, session_of(b)?))
    }

    /// Stores the absolute recording-time difference (seconds) on every edge.
    pub fn compute_time_delta_edges(&mut self) -> TrackingResult<()> {
        self.require(TrackerPhase::GraphBuilt, "compute_time_delta_edges")?;
        let mut cache = BTreeMap::new();
        let mut updates = Vec::new();

        for (&channel_group, graph) in &self.graphs {
            for (a, b, _) in graph.edges() {
                let (s0, s1) = Self::endpoint_sessions(graph, a, b)?;
                let t0 = self.session_metadata(&mut cache, &s0)?.datetime(&s0)?;
                let t1 = self.session_metadata(&mut cache, &s1)?.datetime(&s1)?;
                let elapsed = if t0 >= t1 { t0 - t1 } else { t1 - t0 };
                let delta = elapsed.to_std().map_or(0.0, |d| d.as_secs_f64());
                updates.push((channel_group, a.to_string(), b.to_string(), delta));
            }
        }

        for (channel_group, a, b, delta) in updates {
            if let Some(edge) = self
                .graphs
                .get_mut(&channel_group)
                .and_then(|g| g.edge_mut(&a, &b))
            {
                edge.time_delta = Some(delta);
            }
        }
        Ok(())
    }

    /// Stores the absolute implant-depth difference (micrometres) on every
    /// edge. Both sessions must place the channel group at the same
    /// location; a mismatch aborts with `LocationMismatch`.
    pub fn compute_depth_delta_edges(&mut self) -> TrackingResult<()> {
        self.require(TrackerPhase::GraphBuilt, "compute_depth_delta_edges")?;
        let mut cache = BTreeMap::new();
        let mut updates = Vec::new();

        for (&channel_group, graph) in &self.graphs {
            for (a, b, _) in graph.edges() {
                let (s0, s1) = Self::endpoint_sessions(graph, a, b)?;
                let meta_0 = self.session_metadata(&mut cache, &s0)?;
                let meta_1 = self.session_metadata(&mut cache, &s1)?;
                let loc_0 = meta_0.location(&s0, channel_group)?;
                let loc_1 = meta_1.location(&s1, channel_group)?;
                if loc_0 != loc_1 {
                    return Err(TrackingError::LocationMismatch {
                        channel_group,
                        session_a: s0.clone(),
                        location_a: loc_0.to_string(),
                        session_b: s1.clone(),
                        location_b: loc_1.to_string(),
                    });
                }
                let depth_0 = meta_0.depth_um(&s0, loc_0, DEFAULT_PROBE)?;
                let depth_1 = meta_1.depth_um(&s1, loc_1, DEFAULT_PROBE)?;
                updates.push((
                    channel_group,
                    a.to_string(),
                    b.to_string(),
                    (depth_0 - depth_1).abs(),
                ));
            }
        }

        for (channel_group, a, b, delta) in updates {
            if let Some(edge) = self
                .graphs
                .get_mut(&channel_group)
                .and_then(|g| g.edge_mut(&a, &b))
            {
                edge.depth_delta = Some(delta);
            }
        }
        Ok(())
    }

    // PHASE 4 -----------------------------------------------------------------

    pub fn remove_edges_above_threshold(
        &mut self,
        key: EdgeKey,
        threshold: f64,
    ) -> TrackingResult<usize> {
        self.require(TrackerPhase::GraphBuilt, "remove_edges_above_threshold")?;
        let mut removed = 0;
        for (channel_group, graph) in self.graphs.iter_mut() {
            let n = graph.remove_edges_above_threshold(key, threshold)?;
            debug!(
                "channel group {}: removed {} edges with {} > {}",
                channel_group, n, key, threshold
            );
            removed += n;
        }
        Ok(removed)
    }

    pub fn remove_edges_with_duplicate_sessions(&mut self) -> TrackingResult<usize> {
        self.require(
            TrackerPhase::GraphBuilt,
            "remove_edges_with_duplicate_sessions",
        )?;
        let mut removed = 0;
        for (channel_group, graph) in self.graphs.iter_mut() {
            let n = graph.remove_edges_with_duplicate_sessions();
            debug!(
                "channel group {}: removed {} edges joining duplicate sessions",
                channel_group, n
            );
            removed += n;
        }
        Ok(removed)
    }

    // PHASE 5 -----------------------------------------------------------------

    /// Turns every connected component into an `IdentifiedUnit` with a fresh
    /// id. Rerunning on an unchanged graph yields the same grouping.
    pub fn identify_units(&mut self) -> TrackingResult<&BTreeMap<ChannelGroup, Vec<IdentifiedUnit>>> {
        self.require(TrackerPhase::GraphBuilt, "identify_units")?;
        info!("extracting identified units from {} graphs", self.graphs.len());

        let mut identified = BTreeMap::new();
        for (&channel_group, graph) in &self.graphs {
            let mut units = Vec::new();
            for component in graph.connected_components() {
                let weights: Vec<f64> = graph
                    .component_edges(&component)
                    .map(|(_, _, e)| e.weight)
                    .collect();
                let average_dissimilarity = if weights.is_empty() {
                    None
                } else {
                    Some(weights.iter().sum::<f64>() / weights.len() as f64)
                };

                let mut original_unit_ids: BTreeMap<SessionId, Vec<UnitId>> = BTreeMap::new();
                for id in &component {
                    if let Some(node) = graph.node(id) {
                        original_unit_ids
                            .entry(node.session_id.clone())
                            .or_default()
                            .push(node.unit_id);
                    }
                }
                // node ids sort as strings; keep unit ids numeric
                for ids in original_unit_ids.values_mut() {
                    ids.sort_unstable();
                }

                units.push(IdentifiedUnit {
                    id: Uuid::new_v4(),
                    channel_group,
                    average_dissimilarity,
                    original_unit_ids,
                });
            }
            info!(
                "channel group {}: {} identified units",
                channel_group,
                units.len()
            );
            identified.insert(channel_group, units);
        }

        self.identified_units = identified;
        self.phase = TrackerPhase::Resolved;
        Ok(&self.identified_units)
    }

    /// All phases in order, with pruning driven by `pruning`.
    pub fn run(
        &mut self,
        pruning: &PruningConfig,
    ) -> TrackingResult<&BTreeMap<ChannelGroup, Vec<IdentifiedUnit>>> {
        self.do_matching()?;
        self.make_graphs_from_matches()?;

        if pruning.max_time_delta_secs.is_some() {
            self.compute_time_delta_edges()?;
        }
        if pruning.max_depth_delta_um.is_some() {
            self.compute_depth_delta_edges()?;
        }

        let thresholds = [
            (EdgeKey::Weight, pruning.max_dissimilarity),
            (EdgeKey::TimeDelta, pruning.max_time_delta_secs),
            (EdgeKey::DepthDelta, pruning.max_depth_delta_um),
        ];
        for (key, threshold) in thresholds {
            if let Some(threshold) = threshold {
                let removed = self.remove_edges_above_threshold(key, threshold)?;
                info!("removed {} edges with {} above {}", removed, key, threshold);
            }
        }
        if pruning.remove_duplicate_sessions {
            let removed = self.remove_edges_with_duplicate_sessions()?;
            info!("removed {} edges joining duplicate sessions", removed);
        }

        self.identify_units()
    }

    // PERSISTENCE -------------------------------------------------------------

    /// Writes `graph-group-{g}.yaml` for every channel group.
    pub fn save_graphs(&self) -> TrackingResult<Vec<PathBuf>> {
        self.require(TrackerPhase::GraphBuilt, "save_graphs")?;
        fs::create_dir_all(&self.data_path)?;
        let mut written = Vec::new();
        for (channel_group, graph) in &self.graphs {
            let path = self
                .data_path
                .join(format!("{}{}.yaml", GRAPH_FILE_PREFIX, channel_group));
            graph.save(&path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Replaces the graphs with those saved in the data path; annotation,
    /// pruning and identification can run again afterwards.
    pub fn load_graphs(&mut self) -> TrackingResult<usize> {
        let mut graphs = BTreeMap::new();
        for entry in fs::read_dir(&self.data_path)? {
            let path = entry?.path();
            let Some(channel_group) = graph_file_group(&path) else {
                continue;
            };
            graphs.insert(channel_group, MatchGraph::load(&path)?);
        }

        info!(
            "loaded {} graphs from {}",
            graphs.len(),
            self.data_path.display()
        );
        self.channel_groups = graphs.keys().copied().collect();
        self.graphs = graphs;
        self.identified_units.clear();
        self.phase = TrackerPhase::GraphBuilt;
        Ok(self.graphs.len())
    }

    /// Saves graphs, dissimilarity matrices and the unit summary as
    /// selected in `output`.
    pub fn save_outputs(&self, output: &OutputConfig) -> TrackingResult<()> {
        fs::create_dir_all(&output.dir)?;
        if output.save_graphs && self.phase >= TrackerPhase::GraphBuilt {
            for (channel_group, graph) in &self.graphs {
                let path = output
                    .dir
                    .join(format!("{}{}.yaml", GRAPH_FILE_PREFIX, channel_group));
                graph.save(&path)?;
            }
        }
        if output.save_dissimilarity_matrices {
            let dir = output.dir.join("dissimilarity");
            for comparison in &self.comparisons {
                comparison.save_dissimilarity_matrices(&dir)?;
            }
        }
        if output.save_summary && self.phase == TrackerPhase::Resolved {
            let path = output.dir.join("identified-units.csv");
            if path.exists() {
                fs::remove_file(&path)?;
            }
            log_csv(&path, &SUMMARY_HEADERS, &self.summary_rows())?;
        }
        Ok(())
    }

    fn summary_rows(&self) -> Vec<Vec<String>> {
        self.identified_units
            .values()
            .flatten()
            .map(|unit| {
                let members = unit
                    .original_unit_ids
                    .iter()
                    .map(|(session, ids)| {
                        let ids: Vec<String> = ids.iter().map(|u| u.to_string()).collect();
                        format!("{}:{}", session, ids.join("|"))
                    })
                    .collect::<Vec<_>>()
                    .join(";");
                vec![
                    unit.channel_group.to_string(),
                    unit.id.to_string(),
                    unit.average_dissimilarity
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    unit.session_count().to_string(),
                    members,
                ]
            })
            .collect()
    }

    // UNIT DATA ---------------------------------------------------------------

    /// Waveforms of exactly one unit.
    pub fn load_waveforms(
        &self,
        session: &str,
        unit_id: UnitId,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Array3<f64>> {
        let mut matching: Vec<Array3<f64>> = self
            .store
            .spike_trains(session, channel_group)?
            .into_iter()
            .filter(|st| st.unit_id == unit_id)
            .map(|st| st.waveforms)
            .collect();
        if matching.len() != 1 {
            return Err(TrackingError::DataUnavailable {
                session: session.to_string(),
                channel_group,
                reason: format!(
                    "unable to load waveforms of unit {} ({} spike trains match)",
                    unit_id,
                    matching.len()
                ),
            });
        }
        Ok(matching.remove(0))
    }

    /// Template of a unit, from the comparison cache when the pairwise phase
    /// has run. `None` when the session's comparison does not list the unit.
    pub fn template(
        &self,
        session: &str,
        unit_id: UnitId,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Option<Template>> {
        if let Some((comparison, side)) = self
            .comparisons
            .iter()
            .find_map(|c| c.side_of(session).map(|side| (c, side)))
        {
            if !comparison
                .unit_ids(channel_group, side)
                .contains(&unit_id)
            {
                return Ok(None);
            }
            if let Some(template) = comparison.template(session, unit_id, channel_group) {
                return Ok(Some(template.clone()));
            }
        }
        let waveforms = self.load_waveforms(session, unit_id, channel_group)?;
        Ok(compute_template(&waveforms))
    }

    /// Traces of every identified unit seen in more than one session.
    pub fn unit_traces(
        &self,
        channel_group: ChannelGroup,
        style: DisplayStyle,
    ) -> TrackingResult<Vec<TrackedUnitTraces>> {
        let Some(units) = self.identified_units.get(&channel_group) else {
            return Ok(Vec::new());
        };

        let mut traces = Vec::new();
        for unit in units.iter().filter(|u| u.session_count() > 1) {
            let mut members = Vec::new();
            for (session, unit_ids) in &unit.original_unit_ids {
                for &unit_id in unit_ids {
                    let trace = match style {
                        DisplayStyle::Waveform => UnitTrace::Waveforms(self.load_waveforms(
                            session,
                            unit_id,
                            channel_group,
                        )?),
                        DisplayStyle::Template => {
                            match self.template(session, unit_id, channel_group)? {
                                Some(template) => UnitTrace::Template(template),
                                None => {
                                    warn!(
                                        "no template for unit {} in {} channel group {}",
                                        unit_id, session, channel_group
                                    );
                                    continue;
                                }
                            }
                        }
                    };
                    members.push(MemberTrace {
                        session_id: session.clone(),
                        unit_id,
                        trace,
                    });
                }
            }
            traces.push(TrackedUnitTraces {
                unit: unit.id,
                members,
            });
        }
        Ok(traces)
    }
}

const SUMMARY_HEADERS: [&str; 5] = [
    "channel_group",
    "unit",
    "average_dissimilarity",
    "num_sessions",
    "members",
];

fn graph_file_group(path: &Path) -> Option<ChannelGroup> {
    if path.extension()? != "yaml" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(GRAPH_FILE_PREFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::InMemoryStore;
    use chrono::NaiveDate;
    use ndarray::Array3;

    fn one_unit_store(values: &[(&str, f64)]) -> InMemoryStore {
        let mut store = InMemoryStore::new();
        for (i, &(session, value)) in values.iter().enumerate() {
            let when = NaiveDate::from_ymd_opt(2022, 5, 1 + i as u32)
                .and_then(|d| d.and_hms_opt(9, 0, 0))
                .unwrap();
            store.add_session(
                session,
                SessionMetadata::new(when)
                    .with_location(0, "mec")
                    .with_depth("mec", DEFAULT_PROBE, 1000.0 + 50.0 * i as f64),
            );
            store.add_unit(session, 0, 1, Array3::from_elem((2, 1, 3), value));
        }
        store
    }

    #[test]
    fn phases_must_run_in_order() {
        let store = one_unit_store(&[("a", 1.0), ("b", 1.0)]);
        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        assert!(matches!(
            tracker.make_graphs_from_matches(),
            Err(TrackingError::PhaseOrder { .. })
        ));
        assert!(tracker.identify_units().is_err());
        tracker.do_matching().unwrap();
        tracker.make_graphs_from_matches().unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::GraphBuilt);
    }

    #[test]
    fn annotates_time_and_depth_deltas() {
        let store = one_unit_store(&[("a", 1.0), ("b", 1.0)]);
        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        tracker.do_matching().unwrap();
        tracker.make_graphs_from_matches().unwrap();
        tracker.compute_time_delta_edges().unwrap();
        tracker.compute_depth_delta_edges().unwrap();

        let edge = tracker.graph(0).unwrap().edge("a_1", "b_1").unwrap();
        assert_eq!(edge.time_delta, Some(86400.0));
        assert_eq!(edge.depth_delta, Some(50.0));

        assert_eq!(
            tracker
                .remove_edges_above_threshold(EdgeKey::DepthDelta, 10.0)
                .unwrap(),
            1
        );
    }

    #[test]
    fn location_mismatch_is_fatal() {
        let mut store = one_unit_store(&[("a", 1.0), ("b", 1.0)]);
        let when = NaiveDate::from_ymd_opt(2022, 5, 9)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap();
        store.add_session("b", SessionMetadata::new(when).with_location(0, "ca2"));

        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        tracker.do_matching().unwrap();
        tracker.make_graphs_from_matches().unwrap();
        assert!(matches!(
            tracker.compute_depth_delta_edges(),
            Err(TrackingError::LocationMismatch { .. })
        ));
    }

    #[test]
    fn parallel_matching_matches_sequential() {
        let values = [("a", 1.0), ("b", 0.9), ("c", 0.5), ("d", 0.95)];
        let store = one_unit_store(&values);

        let mut sequential = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        sequential.do_matching().unwrap();
        sequential.make_graphs_from_matches().unwrap();

        let config = TrackerConfig {
            parallel: true,
            ..TrackerConfig::default()
        };
        let mut parallel = MultiSessionTracker::new(&store, config).unwrap();
        parallel.do_matching().unwrap();
        parallel.make_graphs_from_matches().unwrap();

        assert_eq!(sequential.graphs(), parallel.graphs());
        assert_eq!(parallel.comparisons().len(), 6);
    }

    #[test]
    fn template_lookup_uses_comparison_cache() {
        let store = one_unit_store(&[("a", 2.0), ("b", 1.0)]);
        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();

        let fresh = tracker.template("b", 1, 0).unwrap().unwrap();
        tracker.do_matching().unwrap();
        let cached = tracker.template("b", 1, 0).unwrap().unwrap();
        assert_eq!(fresh, cached);
        assert_eq!(tracker.template("b", 42, 0).unwrap(), None);
        assert!(tracker.load_waveforms("b", 42, 0).is_err());
    }

    #[test]
    fn time_delta_keeps_sub_millisecond_precision() {
        let mut store = one_unit_store(&[("a", 1.0), ("b", 1.0)]);
        let day = NaiveDate::from_ymd_opt(2022, 5, 1).unwrap();
        let at = |micro| day.and_hms_micro_opt(9, 0, 0, micro).unwrap();
        store.add_session("a", SessionMetadata::new(at(250)));
        store.add_session("b", SessionMetadata::new(at(1_750)));

        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        tracker.do_matching().unwrap();
        tracker.make_graphs_from_matches().unwrap();
        tracker.compute_time_delta_edges().unwrap();
        let delta = tracker.graph(0).unwrap().edge("a_1", "b_1").unwrap().time_delta;
        assert!((delta.unwrap() - 0.0015).abs() < 1e-12);
    }

    #[test]
    fn unit_ids_are_listed_numerically() {
        let mut store = InMemoryStore::new();
        let when = NaiveDate::from_ymd_opt(2022, 5, 1)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap();
        store.add_session("s", SessionMetadata::new(when));
        store.add_session("t", SessionMetadata::new(when));
        store.add_unit("s", 0, 2, Array3::from_elem((2, 1, 3), 1.0));
        store.add_unit("s", 0, 10, Array3::from_elem((2, 1, 3), 0.2));
        store.add_unit("t", 0, 5, Array3::from_elem((2, 1, 3), 1.0));

        let mut tracker = MultiSessionTracker::new(&store, TrackerConfig::default()).unwrap();
        tracker.do_matching().unwrap();
        tracker.make_graphs_from_matches().unwrap();
        let graph = tracker.graphs.get_mut(&0).unwrap();
        // join s_2 and s_10 through t_5 by hand
        graph.add_edge("s_10", "t_5", EdgeAttributes::new(0.5)).unwrap();

        let units = &tracker.identify_units().unwrap()[&0];
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].original_unit_ids["s"], vec![2, 10]);
    }

    #[test]
    fn display_style_rejects_unknown_names() {
        assert_eq!(
            "waveform".parse::<DisplayStyle>().unwrap(),
            DisplayStyle::Waveform
        );
        assert!(matches!(
            "heatmap".parse::<DisplayStyle>(),
            Err(TrackingError::InvalidStyle(_))
        ));
    }

    #[test]
    fn graph_file_names_carry_the_group() {
        assert_eq!(graph_file_group(Path::new("out/graph-group-3.yaml")), Some(3));
        assert_eq!(graph_file_group(Path::new("out/graph-group-3.json")), None);
        assert_eq!(graph_file_group(Path::new("out/other-3.yaml")), None);
    }
}
