// src/tracking/mod.rs
pub mod comparison;
pub mod graph;
pub mod hungarian;
pub mod matching;
pub mod multi;
pub mod template;

pub use comparison::{ComparisonOptions, SessionComparison};
pub use graph::{EdgeAttributes, EdgeKey, MatchGraph};
pub use matching::{DissimilarityMatrix, MatchKind, MatchSet};
pub use multi::{DisplayStyle, IdentifiedUnit, MultiSessionTracker, TrackerPhase, UnitTrace};
pub use template::{compute_template, dissimilarity, dissimilarity_weighted, DissimilarityMetric};
