// src/tracking/comparison.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::matching::{DissimilarityMatrix, MatchKind, MatchSet};
use super::template::{compute_template, DissimilarityMetric, Template};
use crate::error::{TrackingError, TrackingResult};
use crate::session::{ChannelGroup, SessionId, SessionStore, UnitId};

#[derive(Debug, Clone, Copy)]
pub struct ComparisonOptions {
    /// Restrict the comparison to one channel group.
    pub channel_group: Option<ChannelGroup>,
    pub max_dissimilarity: f64,
    pub metric: DissimilarityMetric,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            channel_group: None,
            max_dissimilarity: 10.0,
            metric: DissimilarityMetric::Weighted,
        }
    }
}

/// Templates, scores and matches of one channel group.
#[derive(Debug, Clone)]
pub struct GroupMatches {
    pub templates: [Vec<Template>; 2],
    pub matrix: DissimilarityMatrix,
    pub matches: MatchSet,
}

#[derive(Debug, Clone)]
pub struct ChannelGroupComparison {
    pub unit_ids: [Vec<UnitId>; 2],
    /// `None` when either side has no units or its waveforms could not be
    /// loaded.
    pub matched: Option<GroupMatches>,
}

/// Compares the units of two sessions, channel group by channel group.
#[derive(Debug, Clone)]
pub struct SessionComparison {
    session_ids: [SessionId; 2],
    options: ComparisonOptions,
    groups: BTreeMap<ChannelGroup, ChannelGroupComparison>,
}

impl SessionComparison {
    pub fn new(
        store: &dyn SessionStore,
        session_0: &str,
        session_1: &str,
        options: ComparisonOptions,
    ) -> TrackingResult<Self> {
        let channel_groups: Vec<ChannelGroup> = match options.channel_group {
            Some(group) => vec![group],
            None => store.channel_groups(session_0)?.into_iter().collect(),
        };

        let mut comparison = Self {
            session_ids: [session_0.to_string(), session_1.to_string()],
            options,
            groups: BTreeMap::new(),
        };
        for channel_group in channel_groups {
            let group = comparison.compare_group(store, channel_group)?;
            comparison.groups.insert(channel_group, group);
        }
        Ok(comparison)
    }

    fn compare_group(
        &self,
        store: &dyn SessionStore,
        channel_group: ChannelGroup,
    ) -> TrackingResult<ChannelGroupComparison> {
        let [session_0, session_1] = &self.session_ids;
        let unit_ids_0: Vec<UnitId> = store
            .unit_annotations(session_0, channel_group)?
            .iter()
            .map(|a| a.unit_id)
            .collect();
        let unit_ids_1: Vec<UnitId> = store
            .unit_annotations(session_1, channel_group)?
            .iter()
            .map(|a| a.unit_id)
            .collect();

        if unit_ids_0.is_empty() || unit_ids_1.is_empty() {
            debug!(
                "no units to compare in group {} ({} vs {})",
                channel_group, session_0, session_1
            );
            return Ok(ChannelGroupComparison {
                unit_ids: [unit_ids_0, unit_ids_1],
                matched: None,
            });
        }

        let templates = load_templates(store, session_0, channel_group, &unit_ids_0).and_then(
            |t0| {
                load_templates(store, session_1, channel_group, &unit_ids_1).map(|t1| [t0, t1])
            },
        );
        let templates = match templates {
            Ok(templates) => templates,
            Err(e) if e.is_group_local() => {
                warn!("skipping channel group {}: {}", channel_group, e);
                return Ok(ChannelGroupComparison {
                    unit_ids: [unit_ids_0, unit_ids_1],
                    matched: None,
                });
            }
            Err(e) => return Err(e),
        };

        debug!(
            "scoring {}x{} units in group {} ({} vs {})",
            unit_ids_0.len(),
            unit_ids_1.len(),
            channel_group,
            session_0,
            session_1
        );
        let matrix = DissimilarityMatrix::from_templates(
            unit_ids_0.clone(),
            &templates[0],
            unit_ids_1.clone(),
            &templates[1],
            self.options.metric,
        )?;
        let matches = MatchSet::compute(&matrix, self.options.max_dissimilarity);

        Ok(ChannelGroupComparison {
            unit_ids: [unit_ids_0, unit_ids_1],
            matched: Some(GroupMatches {
                templates,
                matrix,
                matches,
            }),
        })
    }

    pub fn session_ids(&self) -> &[SessionId; 2] {
        &self.session_ids
    }

    pub fn max_dissimilarity(&self) -> f64 {
        self.options.max_dissimilarity
    }

    /// Position (0 or 1) of `session` in this comparison.
    pub fn side_of(&self, session: &str) -> Option<usize> {
        self.session_ids.iter().position(|s| s == session)
    }

    pub fn channel_groups(&self) -> impl Iterator<Item = ChannelGroup> + '_ {
        self.groups.keys().copied()
    }

    pub fn group(&self, channel_group: ChannelGroup) -> Option<&ChannelGroupComparison> {
        self.groups.get(&channel_group)
    }

    pub fn unit_ids(&self, channel_group: ChannelGroup, side: usize) -> &[UnitId] {
        self.groups
            .get(&channel_group)
            .and_then(|g| g.unit_ids.get(side))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn matrix(&self, channel_group: ChannelGroup) -> Option<&DissimilarityMatrix> {
        self.matched(channel_group).map(|m| &m.matrix)
    }

    pub fn matches(&self, channel_group: ChannelGroup) -> Option<&MatchSet> {
        self.matched(channel_group).map(|m| &m.matches)
    }

    fn matched(&self, channel_group: ChannelGroup) -> Option<&GroupMatches> {
        self.groups.get(&channel_group)?.matched.as_ref()
    }

    /// Cached template of a unit from either session.
    pub fn template(
        &self,
        session: &str,
        unit_id: UnitId,
        channel_group: ChannelGroup,
    ) -> Option<&Template> {
        let side = self.side_of(session)?;
        let group = self.groups.get(&channel_group)?;
        let index = group.unit_ids[side].iter().position(|&u| u == unit_id)?;
        group.matched.as_ref()?.templates[side].get(index)
    }

    /// `(unit in first session, unit in second session, score)` for every
    /// pair matched under `kind`. Empty when the group was not compared.
    pub fn matched_pairs(
        &self,
        channel_group: ChannelGroup,
        kind: MatchKind,
    ) -> Vec<(UnitId, UnitId, f64)> {
        match self.matched(channel_group) {
            Some(m) => m.matches.matched_pairs(&m.matrix, kind),
            None => Vec::new(),
        }
    }

    /// Writes one `{session0}_{session1}_{group}.csv` per compared group.
    pub fn save_dissimilarity_matrices<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> TrackingResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir.as_ref())?;
        let mut written = Vec::new();
        for (channel_group, group) in &self.groups {
            let Some(matched) = &group.matched else {
                continue;
            };
            let path = dir.as_ref().join(format!(
                "{}_{}_{}.csv",
                self.session_ids[0], self.session_ids[1], channel_group
            ));
            matched.matrix.write_csv(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Templates for `unit_ids`, in that order.
pub(crate) fn load_templates(
    store: &dyn SessionStore,
    session: &str,
    channel_group: ChannelGroup,
    unit_ids: &[UnitId],
) -> TrackingResult<Vec<Template>> {
    let spike_trains = store.spike_trains(session, channel_group)?;
    unit_ids
        .iter()
        .map(|&unit_id| {
            let train = spike_trains
                .iter()
                .find(|st| st.unit_id == unit_id)
                .ok_or_else(|| TrackingError::DataUnavailable {
                    session: session.to_string(),
                    channel_group,
                    reason: format!("no waveforms for unit {}", unit_id),
                })?;
            compute_template(&train.waveforms).ok_or_else(|| TrackingError::EmptyWaveforms {
                session: session.to_string(),
                unit_id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::InMemoryStore;
    use crate::session::UnitAnnotation;
    use ndarray::{Array, Array3};

    fn spike(peak: f64, channel: usize) -> Array3<f64> {
        Array::from_shape_fn((3, 2, 6), |(_, c, t)| {
            if c == channel && t == 2 {
                -peak
            } else {
                0.0
            }
        })
    }

    fn store() -> InMemoryStore {
        let mut store = InMemoryStore::new();
        store
            .add_unit("a", 0, 1, spike(100.0, 0))
            .add_unit("a", 0, 2, spike(80.0, 1))
            .add_unit("b", 0, 7, spike(78.0, 1))
            .add_unit("b", 0, 9, spike(95.0, 0))
            .add_unit("a", 1, 1, spike(50.0, 0))
            .add_channel_group("b", 1);
        store
    }

    #[test]
    fn matches_units_per_group() {
        let store = store();
        let comparison =
            SessionComparison::new(&store, "a", "b", ComparisonOptions::default()).unwrap();

        let matches = comparison.matches(0).unwrap();
        assert_eq!(matches.hungarian.forward[&1], Some(9));
        assert_eq!(matches.hungarian.forward[&2], Some(7));
        assert_eq!(matches.hungarian.backward[&9], Some(1));

        let matrix = comparison.matrix(0).unwrap();
        assert_eq!(matrix.row_ids(), &[1, 2]);
        assert_eq!(matrix.col_ids(), &[7, 9]);
        assert!(comparison.template("b", 7, 0).is_some());
    }

    #[test]
    fn group_without_units_on_one_side_is_skipped() {
        let store = store();
        let comparison =
            SessionComparison::new(&store, "a", "b", ComparisonOptions::default()).unwrap();
        assert!(comparison.matrix(1).is_none());
        assert_eq!(comparison.unit_ids(1, 0), &[1]);
        assert!(comparison.unit_ids(1, 1).is_empty());
        assert!(comparison.matched_pairs(1, MatchKind::Hungarian).is_empty());
    }

    #[test]
    fn missing_waveforms_skip_the_group() {
        let mut store = store();
        store.add_annotation("b", 0, UnitAnnotation::new(11));
        let comparison =
            SessionComparison::new(&store, "a", "b", ComparisonOptions::default()).unwrap();
        assert!(comparison.matrix(0).is_none());
        assert_eq!(comparison.unit_ids(0, 1), &[7, 9, 11]);
    }

    #[test]
    fn threshold_rejects_distant_units() {
        let mut store = InMemoryStore::new();
        store
            .add_unit("a", 0, 1, Array3::from_elem((1, 1, 1), 1.0))
            .add_unit("b", 0, 1, Array3::from_elem((1, 1, 1), 0.1));
        let options = ComparisonOptions {
            max_dissimilarity: 0.5,
            ..ComparisonOptions::default()
        };
        let comparison = SessionComparison::new(&store, "a", "b", options).unwrap();
        assert!((comparison.matrix(0).unwrap().get(1, 1).unwrap() - 0.9).abs() < 1e-12);
        assert_eq!(comparison.matches(0).unwrap().hungarian.forward[&1], None);
    }

    #[test]
    fn saves_one_csv_per_compared_group() {
        let dir = tempfile::tempdir().unwrap();
        let comparison =
            SessionComparison::new(&store(), "a", "b", ComparisonOptions::default()).unwrap();
        let written = comparison.save_dissimilarity_matrices(dir.path()).unwrap();
        assert_eq!(written, vec![dir.path().join("a_b_0.csv")]);
    }
}
