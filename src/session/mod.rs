// src/session/mod.rs
use chrono::NaiveDateTime;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{TrackingError, TrackingResult};

pub mod directory;
pub mod memory;
pub mod synthetic;

pub type SessionId = String;
pub type UnitId = i64;
pub type ChannelGroup = u32;

/// Probe key used when reading implant depth.
pub const DEFAULT_PROBE: &str = "probe_0";

// SESSION STORE ---------------------------------------------------------------

/// Access to spike-sorted recording sessions.
///
/// This is the context handed to the comparator and tracker; nothing in the
/// tracking code reaches for data any other way.
pub trait SessionStore: Send + Sync {
    fn session_ids(&self) -> TrackingResult<Vec<SessionId>>;

    fn channel_groups(&self, session: &str) -> TrackingResult<BTreeSet<ChannelGroup>>;

    /// Units of one channel group, in the order the sorter reported them.
    fn unit_annotations(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<UnitAnnotation>>;

    /// Spike trains with waveforms for one channel group.
    fn spike_trains(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<SpikeTrain>>;

    fn metadata(&self, session: &str) -> TrackingResult<SessionMetadata>;
}

// UNITS -----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitAnnotation {
    pub unit_id: UnitId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl UnitAnnotation {
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            name: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Build an annotation from a sorter name such as `"Unit #12"`.
    pub fn from_name(name: &str) -> TrackingResult<Self> {
        Ok(Self {
            unit_id: parse_unit_id(name)?,
            name: Some(name.to_string()),
            metadata: BTreeMap::new(),
        })
    }
}

/// Parses the integer after the last `#` in a unit name.
pub fn parse_unit_id(name: &str) -> TrackingResult<UnitId> {
    name.rsplit('#')
        .next()
        .map(str::trim)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TrackingError::InvalidUnitName(name.to_string()))
}

#[derive(Debug, Clone)]
pub struct SpikeTrain {
    pub unit_id: UnitId,
    /// spikes x channels x samples
    pub waveforms: Array3<f64>,
}

impl SpikeTrain {
    pub fn new(unit_id: UnitId, waveforms: Array3<f64>) -> Self {
        Self { unit_id, waveforms }
    }

    pub fn num_spikes(&self) -> usize {
        self.waveforms.shape()[0]
    }
}

// METADATA --------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub datetime: Option<NaiveDateTime>,
    /// Anatomical location tag per channel group.
    #[serde(default)]
    pub channel_group_location: BTreeMap<ChannelGroup, String>,
    /// Implant depth in micrometres, keyed by location then probe.
    #[serde(default)]
    pub depth: BTreeMap<String, BTreeMap<String, f64>>,
}

impl SessionMetadata {
    pub fn new(datetime: NaiveDateTime) -> Self {
        Self {
            datetime: Some(datetime),
            channel_group_location: BTreeMap::new(),
            depth: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, channel_group: ChannelGroup, location: &str) -> Self {
        self.channel_group_location
            .insert(channel_group, location.to_string());
        self
    }

    pub fn with_depth(mut self, location: &str, probe: &str, depth_um: f64) -> Self {
        self.depth
            .entry(location.to_string())
            .or_default()
            .insert(probe.to_string(), depth_um);
        self
    }

    pub fn datetime(&self, session: &str) -> TrackingResult<NaiveDateTime> {
        self.datetime.ok_or_else(|| TrackingError::MissingMetadata {
            session: session.to_string(),
            field: "datetime".to_string(),
        })
    }

    pub fn location(&self, session: &str, channel_group: ChannelGroup) -> TrackingResult<&str> {
        self.channel_group_location
            .get(&channel_group)
            .map(String::as_str)
            .ok_or_else(|| TrackingError::MissingMetadata {
                session: session.to_string(),
                field: format!("channel_group_location[{}]", channel_group),
            })
    }

    pub fn depth_um(&self, session: &str, location: &str, probe: &str) -> TrackingResult<f64> {
        self.depth
            .get(location)
            .and_then(|probes| probes.get(probe))
            .copied()
            .ok_or_else(|| TrackingError::MissingMetadata {
                session: session.to_string(),
                field: format!("depth[{}][{}]", location, probe),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_id_after_last_hash() {
        assert_eq!(parse_unit_id("Unit #12").unwrap(), 12);
        assert_eq!(parse_unit_id("group#1#7").unwrap(), 7);
        assert_eq!(parse_unit_id("3").unwrap(), 3);
    }

    #[test]
    fn rejects_non_numeric_unit_name() {
        assert!(matches!(
            parse_unit_id("Unit #abc"),
            Err(TrackingError::InvalidUnitName(_))
        ));
    }

    #[test]
    fn metadata_reports_missing_depth() {
        let meta = SessionMetadata::default().with_location(0, "mec");
        assert!(meta.depth_um("s1", "mec", DEFAULT_PROBE).is_err());
        let meta = meta.with_depth("mec", DEFAULT_PROBE, 1500.0);
        assert_eq!(meta.depth_um("s1", "mec", DEFAULT_PROBE).unwrap(), 1500.0);
    }
}
