// src/session/directory.rs
//
// On-disk layout:
//
//   <root>/<session>/session.yaml
//   <root>/<session>/channel_group_<g>/unit_<id>.csv
//
// Each waveform CSV has one spike per row, samples flattened channel-major.
use chrono::NaiveDateTime;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{
    ChannelGroup, SessionId, SessionMetadata, SessionStore, SpikeTrain, UnitAnnotation, UnitId,
};
use crate::error::{TrackingError, TrackingResult};

pub const MANIFEST_FILE: &str = "session.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    #[serde(default)]
    pub datetime: Option<NaiveDateTime>,
    #[serde(default)]
    pub channel_groups: BTreeMap<ChannelGroup, GroupManifest>,
    #[serde(default)]
    pub depth: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub num_channels: usize,
    #[serde(default)]
    pub units: Vec<UnitAnnotation>,
}

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join(session)
    }

    fn waveform_path(&self, session: &str, channel_group: ChannelGroup, unit_id: UnitId) -> PathBuf {
        self.session_dir(session)
            .join(format!("channel_group_{}", channel_group))
            .join(format!("unit_{}.csv", unit_id))
    }

    pub fn read_manifest(&self, session: &str) -> TrackingResult<SessionManifest> {
        let path = self.session_dir(session).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(TrackingError::UnknownSession(session.to_string()));
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn write_manifest(&self, session: &str, manifest: &SessionManifest) -> TrackingResult<()> {
        let dir = self.session_dir(session);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(MANIFEST_FILE), serde_yaml::to_string(manifest)?)?;
        Ok(())
    }

    /// Writes the waveforms of one unit, creating the group directory if needed.
    pub fn write_waveforms(
        &self,
        session: &str,
        channel_group: ChannelGroup,
        unit_id: UnitId,
        waveforms: &Array3<f64>,
    ) -> TrackingResult<()> {
        let path = self.waveform_path(session, channel_group, unit_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        for spike in waveforms.outer_iter() {
            writer.write_record(spike.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn read_waveforms(
        &self,
        session: &str,
        channel_group: ChannelGroup,
        unit_id: UnitId,
        num_channels: usize,
    ) -> TrackingResult<Array3<f64>> {
        let path = self.waveform_path(session, channel_group, unit_id);
        if !path.exists() {
            return Err(TrackingError::DataUnavailable {
                session: session.to_string(),
                channel_group,
                reason: format!("missing waveform file {}", path.display()),
            });
        }

        // a file that exists but cannot be read makes the group unavailable
        let unavailable = |reason: String| TrackingError::DataUnavailable {
            session: session.to_string(),
            channel_group,
            reason: format!("{}: {}", path.display(), reason),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| unavailable(e.to_string()))?;
        let mut values = Vec::new();
        let mut num_spikes = 0;
        let mut row_len = None;
        for record in reader.records() {
            let record = record.map_err(|e| unavailable(e.to_string()))?;
            let expected = *row_len.get_or_insert(record.len());
            if expected != record.len() {
                return Err(unavailable(format!(
                    "spike {} has {} samples, expected {}",
                    num_spikes,
                    record.len(),
                    expected
                )));
            }
            for field in record.iter() {
                let value = field
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| unavailable(format!("bad sample {:?}: {}", field, e)))?;
                values.push(value);
            }
            num_spikes += 1;
        }

        let row_len = row_len.unwrap_or(0);
        if num_channels == 0 || row_len % num_channels != 0 {
            return Err(unavailable(format!(
                "{} samples per spike do not split over {} channels",
                row_len, num_channels
            )));
        }
        let shape = (num_spikes, num_channels, row_len / num_channels);
        Array3::from_shape_vec(shape, values).map_err(|e| unavailable(e.to_string()))
    }
}

impl SessionStore for DirectoryStore {
    fn session_ids(&self) -> TrackingResult<Vec<SessionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn channel_groups(&self, session: &str) -> TrackingResult<BTreeSet<ChannelGroup>> {
        Ok(self
            .read_manifest(session)?
            .channel_groups
            .keys()
            .copied()
            .collect())
    }

    fn unit_annotations(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<UnitAnnotation>> {
        Ok(self
            .read_manifest(session)?
            .channel_groups
            .remove(&channel_group)
            .map(|group| group.units)
            .unwrap_or_default())
    }

    fn spike_trains(
        &self,
        session: &str,
        channel_group: ChannelGroup,
    ) -> TrackingResult<Vec<SpikeTrain>> {
        let manifest = self.read_manifest(session)?;
        let group = manifest.channel_groups.get(&channel_group).ok_or_else(|| {
            TrackingError::DataUnavailable {
                session: session.to_string(),
                channel_group,
                reason: "channel group not recorded".to_string(),
            }
        })?;

        debug!(
            "loading {} spike trains from {} group {}",
            group.units.len(),
            session,
            channel_group
        );
        group
            .units
            .iter()
            .map(|unit| {
                let waveforms =
                    self.read_waveforms(session, channel_group, unit.unit_id, group.num_channels)?;
                Ok(SpikeTrain::new(unit.unit_id, waveforms))
            })
            .collect()
    }

    fn metadata(&self, session: &str) -> TrackingResult<SessionMetadata> {
        let manifest = self.read_manifest(session)?;
        Ok(SessionMetadata {
            datetime: manifest.datetime,
            channel_group_location: manifest
                .channel_groups
                .iter()
                .filter_map(|(group, info)| info.location.clone().map(|loc| (*group, loc)))
                .collect(),
            depth: manifest.depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn manifest(units: &[UnitId]) -> SessionManifest {
        let mut channel_groups = BTreeMap::new();
        channel_groups.insert(
            1,
            GroupManifest {
                location: Some("mec".to_string()),
                num_channels: 2,
                units: units.iter().map(|&id| UnitAnnotation::new(id)).collect(),
            },
        );
        SessionManifest {
            datetime: NaiveDateTime::parse_from_str("2021-03-01 10:00:00", "%Y-%m-%d %H:%M:%S")
                .ok(),
            channel_groups,
            depth: BTreeMap::new(),
        }
    }

    #[test]
    fn reads_back_written_waveforms() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.write_manifest("s1", &manifest(&[4])).unwrap();

        let waveforms = Array::from_shape_fn((3, 2, 5), |(s, c, t)| (s * 100 + c * 10 + t) as f64);
        store.write_waveforms("s1", 1, 4, &waveforms).unwrap();

        let trains = store.spike_trains("s1", 1).unwrap();
        assert_eq!(trains.len(), 1);
        assert_eq!(trains[0].unit_id, 4);
        assert_eq!(trains[0].waveforms, waveforms);

        let meta = store.metadata("s1").unwrap();
        assert_eq!(meta.location("s1", 1).unwrap(), "mec");
        assert_eq!(store.session_ids().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn missing_waveform_file_is_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.write_manifest("s1", &manifest(&[4, 5])).unwrap();
        store
            .write_waveforms("s1", 1, 4, &Array3::zeros((1, 2, 3)))
            .unwrap();

        let err = store.spike_trains("s1", 1).unwrap_err();
        assert!(matches!(err, TrackingError::DataUnavailable { .. }));
    }

    #[test]
    fn unreadable_waveform_files_are_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.write_manifest("s1", &manifest(&[4])).unwrap();
        let path = store.waveform_path("s1", 1, 4);
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        // uneven rows; a row not divisible by 2 channels; a non-numeric sample
        for text in ["1,2,3,4,5,6\n1,2,3\n", "1,2,3\n", "1,x\n"] {
            fs::write(&path, text).unwrap();
            let err = store.spike_trains("s1", 1).unwrap_err();
            assert!(err.is_group_local(), "{}", err);
        }
    }
}
