// src/tracking/matching.rs
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use super::hungarian::linear_sum_assignment;
use super::template::{DissimilarityMetric, Template};
use crate::error::{TrackingError, TrackingResult};
use crate::session::UnitId;

// DISSIMILARITY MATRIX --------------------------------------------------------

/// Scores between the units of two sessions; rows belong to the first
/// session, columns to the second.
#[derive(Debug, Clone, PartialEq)]
pub struct DissimilarityMatrix {
    row_ids: Vec<UnitId>,
    col_ids: Vec<UnitId>,
    scores: Array2<f64>,
}

impl DissimilarityMatrix {
    pub fn new(
        row_ids: Vec<UnitId>,
        col_ids: Vec<UnitId>,
        scores: Array2<f64>,
    ) -> TrackingResult<Self> {
        if scores.dim() != (row_ids.len(), col_ids.len()) {
            return Err(TrackingError::ShapeMismatch {
                expected: vec![row_ids.len(), col_ids.len()],
                found: scores.shape().to_vec(),
            });
        }
        Ok(Self {
            row_ids,
            col_ids,
            scores,
        })
    }

    /// Scores every template pair with `metric`.
    pub fn from_templates(
        row_ids: Vec<UnitId>,
        row_templates: &[Template],
        col_ids: Vec<UnitId>,
        col_templates: &[Template],
        metric: DissimilarityMetric,
    ) -> TrackingResult<Self> {
        let mut scores = Array2::zeros((row_templates.len(), col_templates.len()));
        for (i, t0) in row_templates.iter().enumerate() {
            for (j, t1) in col_templates.iter().enumerate() {
                scores[[i, j]] = metric.between(t0, t1)?;
            }
        }
        Self::new(row_ids, col_ids, scores)
    }

    pub fn row_ids(&self) -> &[UnitId] {
        &self.row_ids
    }

    pub fn col_ids(&self) -> &[UnitId] {
        &self.col_ids
    }

    pub fn scores(&self) -> &Array2<f64> {
        &self.scores
    }

    pub fn get(&self, row_id: UnitId, col_id: UnitId) -> Option<f64> {
        let i = self.row_ids.iter().position(|&u| u == row_id)?;
        let j = self.col_ids.iter().position(|&u| u == col_id)?;
        Some(self.scores[[i, j]])
    }

    /// Writes the matrix as CSV: a header of column unit ids, then one row
    /// per row unit starting with its id.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> TrackingResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let header = std::iter::once(String::new())
            .chain(self.col_ids.iter().map(|id| id.to_string()));
        writer.write_record(header)?;
        for (row_id, row) in self.row_ids.iter().zip(self.scores.outer_iter()) {
            let record =
                std::iter::once(row_id.to_string()).chain(row.iter().map(|v| v.to_string()));
            writer.write_record(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> TrackingResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let col_ids = parse_ids(reader.headers()?.iter().skip(1))?;
        let mut row_ids = Vec::new();
        let mut values = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut fields = record.iter();
            row_ids.extend(parse_ids(fields.next())?);
            for field in fields {
                values.push(field.trim().parse::<f64>().map_err(|e| {
                    TrackingError::Config(format!("bad score {:?}: {}", field, e))
                })?);
            }
        }
        let scores = Array2::from_shape_vec((row_ids.len(), col_ids.len()), values).map_err(
            |_| TrackingError::ShapeMismatch {
                expected: vec![row_ids.len(), col_ids.len()],
                found: vec![],
            },
        )?;
        Self::new(row_ids, col_ids, scores)
    }
}

fn parse_ids<'a, I: IntoIterator<Item = &'a str>>(fields: I) -> TrackingResult<Vec<UnitId>> {
    fields
        .into_iter()
        .map(|f| {
            f.trim()
                .parse::<UnitId>()
                .map_err(|_| TrackingError::InvalidUnitName(f.to_string()))
        })
        .collect()
}

// MATCH SETS ------------------------------------------------------------------

/// A lookup in both directions: `forward` maps first-session units to
/// second-session units, `backward` the reverse.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectedMatch<T> {
    pub forward: BTreeMap<UnitId, T>,
    pub backward: BTreeMap<UnitId, T>,
}

/// `None` marks a unit without a match.
pub type UnitMatch = DirectedMatch<Option<UnitId>>;
pub type PossibleMatch = DirectedMatch<Vec<UnitId>>;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchSet {
    pub possible: PossibleMatch,
    pub best: UnitMatch,
    pub hungarian: UnitMatch,
}

impl MatchSet {
    pub fn compute(matrix: &DissimilarityMatrix, max_dissimilarity: f64) -> Self {
        Self {
            possible: make_possible_match(matrix, max_dissimilarity),
            best: make_best_match(matrix, max_dissimilarity),
            hungarian: make_hungarian_match(matrix, max_dissimilarity),
        }
    }

    /// Matched `(first, second, score)` pairs seen from the first session.
    pub fn matched_pairs(
        &self,
        matrix: &DissimilarityMatrix,
        kind: MatchKind,
    ) -> Vec<(UnitId, UnitId, f64)> {
        let pairs: Vec<(UnitId, UnitId)> = match kind {
            MatchKind::Possible => self
                .possible
                .forward
                .iter()
                .flat_map(|(&u0, targets)| targets.iter().map(move |&u1| (u0, u1)))
                .collect(),
            MatchKind::Best => flatten(&self.best.forward),
            MatchKind::Hungarian => flatten(&self.hungarian.forward),
        };
        pairs
            .into_iter()
            .filter_map(|(u0, u1)| matrix.get(u0, u1).map(|score| (u0, u1, score)))
            .collect()
    }
}

fn flatten(map: &BTreeMap<UnitId, Option<UnitId>>) -> Vec<(UnitId, UnitId)> {
    map.iter()
        .filter_map(|(&u0, u1)| u1.map(|u1| (u0, u1)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Possible,
    Best,
    Hungarian,
}

impl FromStr for MatchKind {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "possible" => Ok(MatchKind::Possible),
            "best" => Ok(MatchKind::Best),
            "hungarian" => Ok(MatchKind::Hungarian),
            other => Err(TrackingError::InvalidMatchKind(other.to_string())),
        }
    }
}

// MATCHERS --------------------------------------------------------------------

/// Every unit on the other side scoring at or below the threshold.
pub fn make_possible_match(matrix: &DissimilarityMatrix, max_dissimilarity: f64) -> PossibleMatch {
    let scores = matrix.scores();
    let accepted = |i: usize, j: usize| scores[[i, j]] <= max_dissimilarity;

    let forward = matrix
        .row_ids()
        .iter()
        .enumerate()
        .map(|(i, &u0)| {
            let targets = (0..matrix.col_ids().len())
                .filter(|&j| accepted(i, j))
                .map(|j| matrix.col_ids()[j])
                .collect();
            (u0, targets)
        })
        .collect();

    let backward = matrix
        .col_ids()
        .iter()
        .enumerate()
        .map(|(j, &u1)| {
            let targets = (0..matrix.row_ids().len())
                .filter(|&i| accepted(i, j))
                .map(|i| matrix.row_ids()[i])
                .collect();
            (u1, targets)
        })
        .collect();

    DirectedMatch { forward, backward }
}

/// Index of the first minimum, ignoring NaN.
fn argmin<I: Iterator<Item = f64>>(values: I) -> Option<(usize, f64)> {
    values
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (idx, v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((idx, v)),
        })
}

/// Nearest unit on the other side, chosen independently for every unit and
/// in each direction, so the two directions need not agree.
pub fn make_best_match(matrix: &DissimilarityMatrix, max_dissimilarity: f64) -> UnitMatch {
    let scores = matrix.scores();

    let forward = matrix
        .row_ids()
        .iter()
        .enumerate()
        .map(|(i, &u0)| {
            let best = argmin(scores.row(i).iter().copied())
                .filter(|&(_, score)| score <= max_dissimilarity)
                .map(|(j, _)| matrix.col_ids()[j]);
            (u0, best)
        })
        .collect();

    let backward = matrix
        .col_ids()
        .iter()
        .enumerate()
        .map(|(j, &u1)| {
            let best = argmin(scores.column(j).iter().copied())
                .filter(|&(_, score)| score <= max_dissimilarity)
                .map(|(i, _)| matrix.row_ids()[i]);
            (u1, best)
        })
        .collect();

    DirectedMatch { forward, backward }
}

/// Globally optimal one-to-one assignment. The solver runs on the full
/// matrix; an assigned pair is kept only if its score is strictly below the
/// threshold, and is then written into both directions.
pub fn make_hungarian_match(matrix: &DissimilarityMatrix, max_dissimilarity: f64) -> UnitMatch {
    let mut forward: BTreeMap<UnitId, Option<UnitId>> =
        matrix.row_ids().iter().map(|&u| (u, None)).collect();
    let mut backward: BTreeMap<UnitId, Option<UnitId>> =
        matrix.col_ids().iter().map(|&u| (u, None)).collect();

    for (i, j) in linear_sum_assignment(matrix.scores()) {
        if matrix.scores()[[i, j]] < max_dissimilarity {
            let u0 = matrix.row_ids()[i];
            let u1 = matrix.col_ids()[j];
            forward.insert(u0, Some(u1));
            backward.insert(u1, Some(u0));
        }
    }

    DirectedMatch { forward, backward }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn matrix(scores: Array2<f64>) -> DissimilarityMatrix {
        let rows = (0..scores.nrows() as UnitId).map(|i| i + 1).collect();
        let cols = (0..scores.ncols() as UnitId).map(|j| j + 10).collect();
        DissimilarityMatrix::new(rows, cols, scores).unwrap()
    }

    #[test]
    fn possible_match_respects_threshold() {
        let m = matrix(array![[0.1, 0.3, 0.6], [0.5, 0.2, 0.05]]);
        let possible = make_possible_match(&m, 0.3);
        assert_eq!(possible.forward[&1], vec![10, 11]);
        assert_eq!(possible.forward[&2], vec![11, 12]);
        assert_eq!(possible.backward[&10], vec![1]);
        assert_eq!(possible.backward[&12], vec![2]);
        for (u0, targets) in &possible.forward {
            for u1 in targets {
                assert!(m.get(*u0, *u1).unwrap() <= 0.3);
            }
        }
    }

    #[test]
    fn best_match_is_not_symmetric() {
        // row 1 is nearest to column 10, but column 10 is nearest to row 2
        let m = matrix(array![[0.2, 0.3], [0.1, 0.9]]);
        let best = make_best_match(&m, 1.0);
        assert_eq!(best.forward[&1], Some(10));
        assert_eq!(best.backward[&10], Some(2));
        assert_ne!(best.backward[&10], Some(1));
    }

    #[test]
    fn best_match_above_threshold_is_none() {
        let m = matrix(array![[0.8, 0.9]]);
        let best = make_best_match(&m, 0.5);
        assert_eq!(best.forward[&1], None);
        assert_eq!(best.backward[&10], None);
    }

    #[test]
    fn hungarian_match_is_a_partial_bijection() {
        let m = matrix(array![[0.1, 0.2, 0.9], [0.15, 0.8, 0.9], [0.9, 0.9, 0.95]]);
        let hungarian = make_hungarian_match(&m, 0.5);
        assert_eq!(hungarian.forward[&1], Some(11));
        assert_eq!(hungarian.forward[&2], Some(10));
        assert_eq!(hungarian.forward[&3], None);
        assert_eq!(hungarian.backward[&12], None);

        let mut targets: Vec<_> = hungarian.forward.values().flatten().collect();
        let before = targets.len();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), before);
        for (u0, u1) in &hungarian.forward {
            if let Some(u1) = u1 {
                assert_eq!(hungarian.backward[u1], Some(*u0));
            }
        }
    }

    #[test]
    fn hungarian_threshold_is_strict() {
        let m = matrix(array![[0.5]]);
        assert_eq!(make_hungarian_match(&m, 0.5).forward[&1], None);
        assert_eq!(make_best_match(&m, 0.5).forward[&1], Some(10));
    }

    #[test]
    fn empty_side_gives_no_matches() {
        let m = DissimilarityMatrix::new(vec![1, 2], vec![], Array2::zeros((2, 0))).unwrap();
        let set = MatchSet::compute(&m, f64::INFINITY);
        assert_eq!(set.best.forward[&1], None);
        assert_eq!(set.hungarian.forward[&2], None);
        assert!(set.possible.forward[&1].is_empty());
    }

    #[test]
    fn matrix_rejects_mismatched_ids() {
        assert!(DissimilarityMatrix::new(vec![1], vec![2, 3], Array2::zeros((1, 1))).is_err());
    }

    #[test]
    fn matched_pairs_report_scores() {
        let m = matrix(array![[0.1, 0.7], [0.6, 0.2]]);
        let set = MatchSet::compute(&m, 0.5);
        assert_eq!(
            set.matched_pairs(&m, MatchKind::Hungarian),
            vec![(1, 10, 0.1), (2, 11, 0.2)]
        );
        assert!("nearest".parse::<MatchKind>().is_err());
    }

    #[test]
    fn csv_export_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1_s2_0.csv");
        let m = matrix(array![[0.125, 0.5], [0.75, 0.0]]);
        m.write_csv(&path).unwrap();
        assert_eq!(DissimilarityMatrix::read_csv(&path).unwrap(), m);
    }
}
