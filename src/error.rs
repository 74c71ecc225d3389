// src/error.rs
use thiserror::Error;

use crate::session::{ChannelGroup, UnitId};

pub type TrackingResult<T> = Result<T, TrackingError>;

#[derive(Error, Debug)]
pub enum TrackingError {
    /// Data for a channel group could not be loaded. The comparator skips the
    /// group instead of failing the run.
    #[error("data unavailable for session {session} channel group {channel_group}: {reason}")]
    DataUnavailable {
        session: String,
        channel_group: ChannelGroup,
        reason: String,
    },

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("unit {unit_id} in session {session} has no spikes")]
    EmptyWaveforms { session: String, unit_id: UnitId },

    #[error(
        "channel group {channel_group} is recorded at {location_a:?} in {session_a} \
         but at {location_b:?} in {session_b}"
    )]
    LocationMismatch {
        channel_group: ChannelGroup,
        session_a: String,
        location_a: String,
        session_b: String,
        location_b: String,
    },

    #[error("session {session} is missing metadata field {field}")]
    MissingMetadata { session: String, field: String },

    #[error("edge {source_node} -- {target_node} has no attribute {attribute}")]
    MissingEdgeAttribute {
        attribute: String,
        source_node: String,
        target_node: String,
    },

    #[error("graph has no node {0}")]
    UnknownNode(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session listed more than once: {0}")]
    DuplicateSession(String),

    #[error("style must be \"template\" or \"waveform\", got {0:?}")]
    InvalidStyle(String),

    #[error("match kind must be \"possible\", \"best\" or \"hungarian\", got {0:?}")]
    InvalidMatchKind(String),

    #[error("edge key must be \"weight\", \"time_delta\" or \"depth_delta\", got {0:?}")]
    InvalidEdgeKey(String),

    #[error("cannot parse unit id from name {0:?}")]
    InvalidUnitName(String),

    #[error("{required} requires an earlier phase to complete (current phase: {current})")]
    PhaseOrder {
        required: &'static str,
        current: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl TrackingError {
    /// Errors that only make one channel group unusable.
    pub fn is_group_local(&self) -> bool {
        matches!(
            self,
            TrackingError::DataUnavailable { .. } | TrackingError::EmptyWaveforms { .. }
        )
    }
}
