// src/config/mod.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TrackingError, TrackingResult};
use crate::session::{ChannelGroup, SessionId};
use crate::tracking::template::DissimilarityMetric;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub pruning: PruningConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TrackerConfig {
    /// Sessions to track, in order. Defaults to every session in the store.
    #[serde(default)]
    pub sessions: Option<Vec<SessionId>>,
    #[serde(default)]
    pub channel_group: Option<ChannelGroup>,
    #[serde(default)]
    pub metric: DissimilarityMetric,
    /// Compare session pairs on the rayon thread pool.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PruningConfig {
    /// `null` disables weight pruning.
    #[serde(default = "default_max_dissimilarity")]
    pub max_dissimilarity: Option<f64>,
    #[serde(default)]
    pub max_time_delta_secs: Option<f64>,
    #[serde(default)]
    pub max_depth_delta_um: Option<f64>,
    #[serde(default = "default_true")]
    pub remove_duplicate_sessions: bool,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            max_dissimilarity: default_max_dissimilarity(),
            max_time_delta_secs: None,
            max_depth_delta_um: None,
            remove_duplicate_sessions: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub save_graphs: bool,
    #[serde(default)]
    pub save_dissimilarity_matrices: bool,
    #[serde(default = "default_true")]
    pub save_summary: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            save_graphs: true,
            save_dissimilarity_matrices: false,
            save_summary: true,
        }
    }
}

fn default_max_dissimilarity() -> Option<f64> {
    Some(0.05)
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("tracking-output")
}

impl Config {
    pub fn validate(&self) -> TrackingResult<()> {
        let thresholds = [
            ("max_dissimilarity", self.pruning.max_dissimilarity),
            ("max_time_delta_secs", self.pruning.max_time_delta_secs),
            ("max_depth_delta_um", self.pruning.max_depth_delta_um),
        ];
        for (name, value) in thresholds {
            if let Some(v) = value {
                if v.is_nan() || v < 0.0 {
                    return Err(TrackingError::Config(format!(
                        "{} must be a non-negative number, got {}",
                        name, v
                    )));
                }
            }
        }

        if let Some(sessions) = &self.tracker.sessions {
            let mut seen = BTreeSet::new();
            for session in sessions {
                if !seen.insert(session) {
                    return Err(TrackingError::DuplicateSession(session.clone()));
                }
            }
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> TrackingResult<Config> {
    let config_str = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> TrackingResult<()> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}
