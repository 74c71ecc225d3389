// src/session/synthetic.rs
use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::directory::{DirectoryStore, GroupManifest, SessionManifest};
use super::memory::InMemoryStore;
use super::{ChannelGroup, SessionMetadata, UnitAnnotation, UnitId, DEFAULT_PROBE};
use crate::error::TrackingResult;

/// Generates recording sessions in which the same neurons reappear with
/// amplitude drift and spike-to-spike noise.
#[derive(Debug, Clone)]
pub struct SyntheticSessions {
    pub num_sessions: usize,
    pub units_per_group: usize,
    pub channel_groups: Vec<ChannelGroup>,
    pub num_channels: usize,
    pub num_samples: usize,
    pub spikes_per_unit: usize,
    /// Relative amplitude of uniform per-sample noise.
    pub noise: f64,
    /// Maximum relative gain change between sessions.
    pub drift: f64,
    pub seed: u64,
}

impl Default for SyntheticSessions {
    fn default() -> Self {
        Self {
            num_sessions: 3,
            units_per_group: 4,
            channel_groups: vec![0],
            num_channels: 4,
            num_samples: 32,
            spikes_per_unit: 20,
            noise: 0.05,
            drift: 0.1,
            seed: 42,
        }
    }
}

pub struct SyntheticUnit {
    pub channel_group: ChannelGroup,
    pub unit_id: UnitId,
    pub waveforms: Array3<f64>,
}

pub struct SyntheticSession {
    pub session_id: String,
    pub metadata: SessionMetadata,
    pub units: Vec<SyntheticUnit>,
}

impl SyntheticSessions {
    pub fn session_id(index: usize) -> String {
        format!("session-{:02}", index + 1)
    }

    /// A biphasic spike shape whose peak channel and width depend on `neuron`.
    fn base_template(&self, neuron: usize, rng: &mut StdRng) -> Array2<f64> {
        let peak_channel = neuron % self.num_channels.max(1);
        let width = 2.0 + rng.gen_range(0.0..3.0);
        let trough_at = self.num_samples as f64 * 0.3;
        Array2::from_shape_fn((self.num_channels, self.num_samples), |(c, t)| {
            let distance = (c as f64 - peak_channel as f64).abs();
            let gain = (-distance).exp() * 100.0;
            let x = (t as f64 - trough_at) / width;
            gain * (-(x * x) / 2.0).exp() * (x * PI / 4.0).cos() * -1.0
        })
    }

    pub fn generate(&self) -> Vec<SyntheticSession> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let start = NaiveDate::from_ymd_opt(2021, 1, 4)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap_or(NaiveDateTime::MIN);

        let neurons: Vec<(ChannelGroup, Array2<f64>)> = self
            .channel_groups
            .iter()
            .flat_map(|&group| (0..self.units_per_group).map(move |n| (group, n)))
            .map(|(group, n)| (group, self.base_template(n, &mut rng)))
            .collect();

        (0..self.num_sessions)
            .map(|s| {
                let mut metadata = SessionMetadata::new(start + Duration::days(s as i64));
                for &group in &self.channel_groups {
                    metadata = metadata.with_location(group, "mec");
                }
                metadata = metadata.with_depth("mec", DEFAULT_PROBE, 1500.0 + 25.0 * s as f64);

                let mut units = Vec::with_capacity(neurons.len());
                for (index, (group, template)) in neurons.iter().enumerate() {
                    let gain = 1.0 + rng.gen_range(-self.drift..=self.drift);
                    let scale = template.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
                    let mut waveforms =
                        Array3::zeros((self.spikes_per_unit, self.num_channels, self.num_samples));
                    for mut spike in waveforms.outer_iter_mut() {
                        spike.zip_mut_with(template, |w, &t| {
                            *w = t * gain + rng.gen_range(-1.0..=1.0) * self.noise * scale;
                        });
                    }
                    units.push(SyntheticUnit {
                        channel_group: *group,
                        // sorters renumber units each session
                        unit_id: (index + 1 + s * 100) as UnitId,
                        waveforms,
                    });
                }

                SyntheticSession {
                    session_id: Self::session_id(s),
                    metadata,
                    units,
                }
            })
            .collect()
    }

    pub fn into_memory_store(&self) -> InMemoryStore {
        let mut store = InMemoryStore::new();
        for session in self.generate() {
            store.add_session(&session.session_id, session.metadata);
            for unit in session.units {
                store.add_unit(
                    &session.session_id,
                    unit.channel_group,
                    unit.unit_id,
                    unit.waveforms,
                );
            }
        }
        store
    }

    pub fn write_to(&self, store: &DirectoryStore) -> TrackingResult<()> {
        for session in self.generate() {
            let mut channel_groups: BTreeMap<ChannelGroup, GroupManifest> = BTreeMap::new();
            for unit in &session.units {
                store.write_waveforms(
                    &session.session_id,
                    unit.channel_group,
                    unit.unit_id,
                    &unit.waveforms,
                )?;
                channel_groups
                    .entry(unit.channel_group)
                    .or_insert_with(|| GroupManifest {
                        location: session
                            .metadata
                            .channel_group_location
                            .get(&unit.channel_group)
                            .cloned(),
                        num_channels: self.num_channels,
                        units: Vec::new(),
                    })
                    .units
                    .push(UnitAnnotation::from_name(&format!("Unit #{}", unit.unit_id))?);
            }
            let manifest = SessionManifest {
                datetime: session.metadata.datetime,
                channel_groups,
                depth: session.metadata.depth.clone(),
            };
            store.write_manifest(&session.session_id, &manifest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let config = SyntheticSessions::default();
        let a = config.generate();
        let b = config.generate();
        assert_eq!(a.len(), 3);
        assert_eq!(a[1].units[2].waveforms, b[1].units[2].waveforms);
        assert_eq!(a[0].units.len(), config.units_per_group);
    }

    #[test]
    fn memory_store_exposes_every_session() {
        let store = SyntheticSessions::default().into_memory_store();
        let ids = store.session_ids().unwrap();
        assert_eq!(ids, vec!["session-01", "session-02", "session-03"]);
        assert_eq!(store.unit_annotations("session-02", 0).unwrap().len(), 4);
    }
}
