// src/session/memory.rs
use ndarray::Array3;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    ChannelGroup, SessionId, SessionMetadata, SessionStore, SpikeTrain, UnitAnnotation, UnitId,
};
use crate::error::{TrackingError, TrackingResult};

#[derive(Debug, Default, Clone)]
struct GroupData {
    annotations: Vec<UnitAnnotation>,
    spike_trains: Vec<SpikeTrain>,
}

#[derive(Debug, Default, Clone)]
struct SessionData {
    metadata: SessionMetadata,
    groups: BTreeMap<ChannelGroup, GroupData>,
}

/// Session store held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    sessions: BTreeMap<SessionId, SessionData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&mut self, session: &str, metadata: SessionMetadata) -> &mut Self {
        self.sessions.entry(session.to_string()).or_default().metadata = metadata;
        self
    }

    /// Registers an empty channel group so it is reported by `channel_groups`.
    pub fn add_channel_group(&mut self, session: &str, channel_group: ChannelGroup) -> &mut Self {
        self.sessions
            .entry(session.to_string())
            .or_default()
            .groups
            .entry(channel_group)
            .or_default();
        self
    }

    /// Adds a unit with its annotation and waveforms.
    pub fn add_unit(
        &mut self,
        session: &str,
        channel_group: ChannelGroup,
        unit_id: UnitId,
        waveforms: Array3<f64>,
    ) -> &mut Self {
        let group = self
            .sessions
            .entry(session.to_string())
            .or_default()
            .groups
            .entry(channel_group)
            .or_default();
        group.annotations.push(UnitAnnotation::new(unit_id));
        group.spike_trains.push(SpikeTrain::new(unit_id, waveforms));
        self
    }

    /// Adds an annotated unit whose waveforms are not available.
    pub fn add_annotation(
        &mut self,
        session: &str,
        channel_group: ChannelGroup,
        annotation: UnitAnnotation,
    ) -> &mut Self {
        self.sessions
            .entry(session.to_string())
            .or_default()
            .groups
            .entry(channel_group)
            .or_default()
            .annotations
            .push(annotation);
        self
    }

    fn session(&self, session: &str) -> TrackingResult<&SessionData> {
        self.sessions
            .get(session)
            .ok_or_else(|| TrackingError::UnknownSession(session.to_string()))
    }

    fn group(&self, session: &str, channel_group: ChannelGroup) -> TrackingResult<&GroupData> {
        self.session(session)?
            .groups
            .get(&channel_group)
            .ok_or_else(|| TrackingError::DataUnavailable {
                session: session.to_string(),
                channel_group,
                reason: "channel group not recorded".to_string(),
            })
    }
}

impl SessionStore for InMemoryStore {
    fn session_ids(&self) -> TrackingResult<Vec<SessionId>> {
        Ok(self.sessions.keys().cloned().collect())
    }

    fn channel_groups(&self, session: &str) -> TrackingResult<BTreeSet<ChannelGroup>> {
        Ok(self.session(session)?.groups.keys().copied().collect())
    }

    fn unit_annotations(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<UnitAnnotation>> {
        // An unrecorded group simply has no units.
        match self.session(session)?.groups.get(&channel_group) {
            Some(group) => Ok(group.annotations.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn spike_trains(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<SpikeTrain>> {
        Ok(self.group(session, channel_group)?.spike_trains.clone())
    }

    fn metadata(&self, session: &str) -> TrackingResult<SessionMetadata> {
        Ok(self.session(session)?.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_groups_and_units() {
        let mut store = InMemoryStore::new();
        store
            .add_unit("s1", 0, 3, Array3::zeros((2, 1, 4)))
            .add_unit("s1", 0, 5, Array3::zeros((1, 1, 4)))
            .add_channel_group("s1", 2);

        let groups = store.channel_groups("s1").unwrap();
        assert_eq!(groups.into_iter().collect::<Vec<_>>(), vec![0, 2]);

        let ids: Vec<_> = store
            .unit_annotations("s1", 0)
            .unwrap()
            .iter()
            .map(|a| a.unit_id)
            .collect();
        assert_eq!(ids, vec![3, 5]);
        assert!(store.unit_annotations("s1", 7).unwrap().is_empty());
        assert_eq!(store.spike_trains("s1", 0).unwrap()[0].num_spikes(), 2);
    }

    #[test]
    fn unknown_session_is_an_error() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.metadata("nope"),
            Err(TrackingError::UnknownSession(_))
        ));
    }
}
