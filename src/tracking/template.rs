// src/tracking/template.rs
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{TrackingError, TrackingResult};

/// Mean waveform of a unit, channels x samples.
pub type Template = Array2<f64>;

/// Metric used to fill a dissimilarity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DissimilarityMetric {
    /// Mean absolute difference of the flattened, normalised templates.
    MeanAbsolute,
    /// Per-sample Euclidean distance across channels, averaged over samples.
    #[default]
    Weighted,
}

impl DissimilarityMetric {
    pub fn between(&self, a: &Template, b: &Template) -> TrackingResult<f64> {
        match self {
            DissimilarityMetric::MeanAbsolute => dissimilarity(a, b),
            DissimilarityMetric::Weighted => weighted_template_dissimilarity(a, b),
        }
    }
}

impl FromStr for DissimilarityMetric {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean_absolute" => Ok(DissimilarityMetric::MeanAbsolute),
            "weighted" => Ok(DissimilarityMetric::Weighted),
            other => Err(TrackingError::Config(format!("unknown metric {:?}", other))),
        }
    }
}

/// Mean over spikes. `None` when the unit has no spikes.
pub fn compute_template(waveforms: &Array3<f64>) -> Option<Template> {
    waveforms.mean_axis(Axis(0))
}

fn max_abs(template: &Template) -> f64 {
    template.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

fn check_shapes(a: &Template, b: &Template) -> TrackingResult<()> {
    if a.shape() != b.shape() {
        return Err(TrackingError::ShapeMismatch {
            expected: a.shape().to_vec(),
            found: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Shared scale of a template pair; `None` if both are flat zero.
fn joint_scale(a: &Template, b: &Template) -> Option<f64> {
    let m = max_abs(a).max(max_abs(b));
    if m > 0.0 {
        Some(m)
    } else {
        None
    }
}

/// Mean absolute difference between two templates after dividing both by
/// their joint maximum absolute value.
///
/// Requires equal channel and sample counts.
pub fn dissimilarity(a: &Template, b: &Template) -> TrackingResult<f64> {
    check_shapes(a, b)?;
    let Some(m) = joint_scale(a, b) else {
        return Ok(0.0);
    };
    let total: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x / m - y / m).abs())
        .sum();
    Ok(total / a.len() as f64)
}

/// Jointly normalised templates compared sample by sample: the Euclidean
/// norm across channels, averaged over samples.
pub fn weighted_template_dissimilarity(a: &Template, b: &Template) -> TrackingResult<f64> {
    check_shapes(a, b)?;
    let Some(m) = joint_scale(a, b) else {
        return Ok(0.0);
    };
    let diff = (a / m) - (b / m);
    let per_sample = diff.mapv(|v| v * v).sum_axis(Axis(0)).mapv(f64::sqrt);
    Ok(per_sample.mean().unwrap_or(0.0))
}

/// Same metric as [`weighted_template_dissimilarity`] but starting from raw
/// waveform sets (spikes x channels x samples).
pub fn dissimilarity_weighted(
    waveforms_a: &Array3<f64>,
    waveforms_b: &Array3<f64>,
) -> TrackingResult<f64> {
    let (a, b) = match (compute_template(waveforms_a), compute_template(waveforms_b)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(TrackingError::ShapeMismatch {
                expected: waveforms_a.shape().to_vec(),
                found: waveforms_b.shape().to_vec(),
            })
        }
    };
    weighted_template_dissimilarity(&a, &b)
}
