// src/bindings/python.rs
use crate::config::{load_config, Config};
use crate::error::TrackingError;
use crate::session::directory::DirectoryStore;
use crate::tracking::multi::MultiSessionTracker;
use crate::tracking::template::{self, Template};

use ndarray::{Array2, Array3};
use std::collections::BTreeMap;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

type PyIdentifiedUnit = (u32, String, Option<f64>, BTreeMap<String, Vec<i64>>);

fn to_py_err(e: TrackingError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn to_template(rows: Vec<Vec<f64>>) -> PyResult<Template> {
    let n_channels = rows.len();
    let n_samples = rows.first().map_or(0, |r| r.len());
    if rows.iter().any(|r| r.len() != n_samples) {
        return Err(PyValueError::new_err("template rows must have equal length"));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_channels, n_samples), flat)
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

fn to_waveforms(spikes: Vec<Vec<Vec<f64>>>) -> PyResult<Array3<f64>> {
    let n_spikes = spikes.len();
    let templates = spikes
        .into_iter()
        .map(to_template)
        .collect::<PyResult<Vec<_>>>()?;
    let dim = templates.first().map_or((0, 0), |t| t.dim());
    if templates.iter().any(|t| t.dim() != dim) {
        return Err(PyValueError::new_err("every spike must have the same shape"));
    }
    let flat: Vec<f64> = templates.into_iter().flat_map(|t| t.into_iter()).collect();
    Array3::from_shape_vec((n_spikes, dim.0, dim.1), flat)
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Normalised mean absolute difference of two channels x samples templates.
#[pyfunction]
pub fn dissimilarity(a: Vec<Vec<f64>>, b: Vec<Vec<f64>>) -> PyResult<f64> {
    template::dissimilarity(&to_template(a)?, &to_template(b)?).map_err(to_py_err)
}

/// Weighted dissimilarity of two spikes x channels x samples waveform sets.
#[pyfunction]
pub fn dissimilarity_weighted(
    a: Vec<Vec<Vec<f64>>>,
    b: Vec<Vec<Vec<f64>>>,
) -> PyResult<f64> {
    template::dissimilarity_weighted(&to_waveforms(a)?, &to_waveforms(b)?).map_err(to_py_err)
}

#[pyfunction]
#[pyo3(signature = (data_dir, config_path=None))]
pub fn track_directory(
    data_dir: String,
    config_path: Option<String>,
) -> PyResult<Vec<PyIdentifiedUnit>> {
    let config = match config_path {
        Some(path) => load_config(path).map_err(to_py_err)?,
        None => Config::default(),
    };
    let store = DirectoryStore::new(&data_dir);
    let mut tracker = MultiSessionTracker::new(&store, config.tracker.clone())
        .map_err(to_py_err)?
        .with_data_path(&config.output.dir);
    let identified = tracker.run(&config.pruning).map_err(to_py_err)?;

    Ok(identified
        .values()
        .flatten()
        .map(|unit| {
            (
                unit.channel_group,
                unit.id.to_string(),
                unit.average_dissimilarity,
                unit.original_unit_ids.clone(),
            )
        })
        .collect())
}

#[pymodule]
pub fn unit_tracker(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(dissimilarity, m)?)?;
    m.add_function(wrap_pyfunction!(dissimilarity_weighted, m)?)?;
    m.add_function(wrap_pyfunction!(track_directory, m)?)?;
    Ok(())
}
