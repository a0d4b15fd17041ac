//! Empirical coverage of credible intervals.
//!
//! For each (model, variable) group, coverage is the fraction of replicates
//! whose interval strictly contains the ground-truth value:
//! `lower < truth < upper`. A truth value sitting exactly on a bound is not
//! covered.

use crate::summary::quantile_column_name;
use crate::table::SummaryRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CoverageError {
    #[error("no summary rows to aggregate")]
    Empty,

    #[error("interval level {0} must lie strictly between 0 and 1")]
    InvalidLevel(f64),

    #[error("interval bounds must name two different columns, got '{0}' twice")]
    SameBounds(String),

    #[error("column '{column}' missing for '{variable}' (model '{model}', replicate {index})")]
    MissingColumn {
        column: String,
        model: String,
        variable: String,
        index: usize,
    },

    #[error("'{variable}' (model '{model}') has ground truth in some replicates but not replicate {index}")]
    MissingTruth {
        model: String,
        variable: String,
        index: usize,
    },

    #[error("replicate {index} appears twice for '{variable}' (model '{model}')")]
    DuplicateReplicate {
        model: String,
        variable: String,
        index: usize,
    },

    #[error("interval [{lower}, {upper}] is inverted for '{variable}' (model '{model}', replicate {index})")]
    InvertedInterval {
        model: String,
        variable: String,
        index: usize,
        lower: f64,
        upper: f64,
    },

    #[error("non-finite bound or truth for '{variable}' (model '{model}', replicate {index})")]
    NonFinite {
        model: String,
        variable: String,
        index: usize,
    },

    #[error("no variable carries ground truth; nothing to score")]
    NoGroundTruth,
}

/// Names of the lower and upper bound columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    pub lower: String,
    pub upper: String,
}

impl Default for IntervalSpec {
    fn default() -> Self {
        Self {
            lower: "q2.5".to_string(),
            upper: "q97.5".to_string(),
        }
    }
}

impl IntervalSpec {
    pub fn new(lower: impl Into<String>, upper: impl Into<String>) -> Result<Self, CoverageError> {
        let spec = Self {
            lower: lower.into(),
            upper: upper.into(),
        };
        if spec.lower == spec.upper {
            return Err(CoverageError::SameBounds(spec.lower));
        }
        Ok(spec)
    }

    /// Central interval columns for a credible level, e.g. 0.9 -> `q5` / `q95`
    pub fn central(level: f64) -> Result<Self, CoverageError> {
        if !(level > 0.0 && level < 1.0) {
            return Err(CoverageError::InvalidLevel(level));
        }
        let tail = (1.0 - level) / 2.0;
        Self::new(quantile_column_name(tail), quantile_column_name(1.0 - tail))
    }
}

/// Coverage for one (model, variable) group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageStat {
    pub model: String,
    pub variable: String,
    pub n_reps: usize,
    pub n_covered: usize,
    pub coverage: f64,
    /// Binomial Monte Carlo standard error of `coverage`
    pub mc_se: f64,
}

/// Strict containment; boundary equality and NaN are not covered
pub fn is_covered(lower: f64, upper: f64, truth: f64) -> bool {
    lower < truth && truth < upper
}

/// Aggregate coverage over replicates, grouped by (model, variable).
///
/// Groups with no ground truth in any row are not calibration targets and are
/// skipped. The result is sorted by model then variable and does not depend on
/// the order of `rows`.
pub fn compute_coverage(
    rows: &[SummaryRow],
    interval: &IntervalSpec,
) -> Result<Vec<CoverageStat>, CoverageError> {
    if rows.is_empty() {
        return Err(CoverageError::Empty);
    }

    let mut groups: BTreeMap<(&str, &str), Vec<&SummaryRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.model.as_str(), row.variable.as_str()))
            .or_default()
            .push(row);
    }

    let mut stats = Vec::new();
    for ((model, variable), group) in groups {
        if group.iter().all(|r| r.truth.is_none()) {
            continue;
        }

        let mut seen = BTreeSet::new();
        let mut n_covered = 0;
        for row in &group {
            let index = row.replicate.index;
            if !seen.insert(index) {
                return Err(CoverageError::DuplicateReplicate {
                    model: model.to_string(),
                    variable: variable.to_string(),
                    index,
                });
            }

            let truth = row.truth.ok_or_else(|| CoverageError::MissingTruth {
                model: model.to_string(),
                variable: variable.to_string(),
                index,
            })?;
            let bound = |column: &str| {
                row.stat(column).ok_or_else(|| CoverageError::MissingColumn {
                    column: column.to_string(),
                    model: model.to_string(),
                    variable: variable.to_string(),
                    index,
                })
            };
            let lower = bound(&interval.lower)?;
            let upper = bound(&interval.upper)?;

            if !(lower.is_finite() && upper.is_finite() && truth.is_finite()) {
                return Err(CoverageError::NonFinite {
                    model: model.to_string(),
                    variable: variable.to_string(),
                    index,
                });
            }
            if lower > upper {
                return Err(CoverageError::InvertedInterval {
                    model: model.to_string(),
                    variable: variable.to_string(),
                    index,
                    lower,
                    upper,
                });
            }

            if is_covered(lower, upper, truth) {
                n_covered += 1;
            }
        }

        let n_reps = group.len();
        let coverage = n_covered as f64 / n_reps as f64;
        stats.push(CoverageStat {
            model: model.to_string(),
            variable: variable.to_string(),
            n_reps,
            n_covered,
            coverage,
            mc_se: (coverage * (1.0 - coverage) / n_reps as f64).sqrt(),
        });
    }

    if stats.is_empty() {
        return Err(CoverageError::NoGroundTruth);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ReplicateId;

    fn row(model: &str, variable: &str, index: usize, lower: f64, upper: f64, truth: Option<f64>) -> SummaryRow {
        SummaryRow {
            variable: variable.to_string(),
            stats: [("q2.5".to_string(), lower), ("q97.5".to_string(), upper)]
                .into_iter()
                .collect(),
            truth,
            replicate: ReplicateId {
                batch: 0,
                rep: index,
                index,
                seed: index as u64,
            },
            model: model.to_string(),
            file: format!("{}.stan", model),
        }
    }

    #[test]
    fn test_ten_replicates() {
        // truth 0.0 inside [-1, 1] for 7 replicates, outside for 3
        let rows: Vec<SummaryRow> = (0..10)
            .map(|i| {
                let shift = if i < 7 { 0.0 } else { 5.0 };
                row("linear", "beta", i, -1.0 + shift, 1.0 + shift, Some(0.0))
            })
            .collect();

        let stats = compute_coverage(&rows, &IntervalSpec::default()).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].n_reps, 10);
        assert_eq!(stats[0].n_covered, 7);
        assert!((stats[0].coverage - 0.7).abs() < 1e-12);
        assert!((stats[0].mc_se - (0.21f64 / 10.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_boundary_is_not_covered() {
        assert!(!is_covered(0.0, 1.0, 0.0));
        assert!(!is_covered(0.0, 1.0, 1.0));
        assert!(is_covered(0.0, 1.0, 0.5));
        assert!(!is_covered(0.5, 0.5, 0.5));

        let rows = vec![
            row("m", "beta", 0, 0.2, 0.8, Some(0.2)),
            row("m", "beta", 1, 0.2, 0.8, Some(0.8)),
        ];
        let stats = compute_coverage(&rows, &IntervalSpec::default()).unwrap();
        assert_eq!(stats[0].n_covered, 0);
    }

    #[test]
    fn test_order_invariance() {
        let mut rows: Vec<SummaryRow> = (0..20)
            .map(|i| {
                let truth = (i as f64 * 0.37).sin();
                row(if i % 2 == 0 { "a" } else { "b" }, "beta", i, -0.5, 0.5, Some(truth))
            })
            .collect();
        let forward = compute_coverage(&rows, &IntervalSpec::default()).unwrap();
        rows.reverse();
        rows.swap(3, 11);
        let shuffled = compute_coverage(&rows, &IntervalSpec::default()).unwrap();
        assert_eq!(forward, shuffled);
        assert_eq!(forward[0].model, "a");
        assert_eq!(forward[1].model, "b");
    }

    #[test]
    fn test_groups_by_model_and_variable() {
        let rows = vec![
            row("m1", "beta", 0, -1.0, 1.0, Some(0.0)),
            row("m2", "beta", 0, 1.0, 2.0, Some(0.0)),
            row("m1", "alpha", 0, -1.0, 1.0, Some(0.0)),
            row("m1", "lp", 0, -1.0, 1.0, None),
        ];
        let stats = compute_coverage(&rows, &IntervalSpec::default()).unwrap();
        let keys: Vec<(&str, &str, f64)> = stats
            .iter()
            .map(|s| (s.model.as_str(), s.variable.as_str(), s.coverage))
            .collect();
        assert_eq!(
            keys,
            vec![("m1", "alpha", 1.0), ("m1", "beta", 1.0), ("m2", "beta", 0.0)]
        );
    }

    #[test]
    fn test_partial_truth_is_an_error() {
        let rows = vec![
            row("m", "beta", 0, -1.0, 1.0, Some(0.0)),
            row("m", "beta", 1, -1.0, 1.0, None),
        ];
        assert_eq!(
            compute_coverage(&rows, &IntervalSpec::default()),
            Err(CoverageError::MissingTruth {
                model: "m".to_string(),
                variable: "beta".to_string(),
                index: 1,
            })
        );
    }

    #[test]
    fn test_no_ground_truth() {
        let rows = vec![row("m", "sigma", 0, 0.1, 1.0, None)];
        assert_eq!(
            compute_coverage(&rows, &IntervalSpec::default()),
            Err(CoverageError::NoGroundTruth)
        );
        assert_eq!(
            compute_coverage(&[], &IntervalSpec::default()),
            Err(CoverageError::Empty)
        );
    }

    #[test]
    fn test_missing_column_and_bad_bounds() {
        let rows = vec![row("m", "beta", 0, -1.0, 1.0, Some(0.0))];
        let spec = IntervalSpec::new("q5", "q95").unwrap();
        assert!(matches!(
            compute_coverage(&rows, &spec),
            Err(CoverageError::MissingColumn { column, .. }) if column == "q5"
        ));

        let inverted = vec![row("m", "beta", 0, 1.0, -1.0, Some(0.0))];
        assert!(matches!(
            compute_coverage(&inverted, &IntervalSpec::default()),
            Err(CoverageError::InvertedInterval { .. })
        ));

        let nan = vec![row("m", "beta", 0, f64::NAN, 1.0, Some(0.0))];
        assert!(matches!(
            compute_coverage(&nan, &IntervalSpec::default()),
            Err(CoverageError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_duplicate_replicate_rejected() {
        let rows = vec![
            row("m", "beta", 4, -1.0, 1.0, Some(0.0)),
            row("m", "beta", 4, -1.0, 1.0, Some(0.0)),
        ];
        assert!(matches!(
            compute_coverage(&rows, &IntervalSpec::default()),
            Err(CoverageError::DuplicateReplicate { index: 4, .. })
        ));
    }

    #[test]
    fn test_central_interval_columns() {
        assert_eq!(IntervalSpec::central(0.95).unwrap(), IntervalSpec::default());
        let ninety = IntervalSpec::central(0.9).unwrap();
        assert_eq!(ninety.lower, "q5");
        assert_eq!(ninety.upper, "q95");
        assert_eq!(
            IntervalSpec::central(1.0),
            Err(CoverageError::InvalidLevel(1.0))
        );
        assert!(IntervalSpec::new("q50", "q50").is_err());
    }
}
