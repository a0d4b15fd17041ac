//! Posterior summaries.
//!
//! A summary function maps the draws of one variable to one or more named
//! statistics. The pipeline applies a list of them to every fitted variable,
//! producing one row per variable.

use crate::diagnostics::mcmc::{
    ess_basic, mad, mean, quantile_sorted, sorted_copy, split_rhat, variance,
};
use crate::diagnostics::PosteriorDraws;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SummaryError {
    #[error("no summary functions configured")]
    NoSummaries,

    #[error("quantile probability {0} is outside [0, 1]")]
    InvalidProbability(f64),

    #[error("summary column '{0}' is produced more than once")]
    DuplicateColumn(String),

    #[error("variable '{0}' not found in posterior draws")]
    UnknownVariable(String),
}

/// A statistic computed from the draws of a single variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryFn {
    Mean,
    Median,
    Sd,
    Var,
    /// Median absolute deviation scaled by 1.4826
    Mad,
    /// One column per probability, named `q<100p>`
    Quantiles { probs: Vec<f64> },
    /// Split-chain potential scale reduction
    Rhat,
    /// Autocorrelation-based effective sample size
    EssBasic,
}

impl SummaryFn {
    pub fn columns(&self) -> Vec<String> {
        match self {
            SummaryFn::Mean => vec!["mean".to_string()],
            SummaryFn::Median => vec!["median".to_string()],
            SummaryFn::Sd => vec!["sd".to_string()],
            SummaryFn::Var => vec!["var".to_string()],
            SummaryFn::Mad => vec!["mad".to_string()],
            SummaryFn::Quantiles { probs } => {
                probs.iter().map(|&p| quantile_column_name(p)).collect()
            }
            SummaryFn::Rhat => vec!["rhat".to_string()],
            SummaryFn::EssBasic => vec!["ess_basic".to_string()],
        }
    }

    pub fn validate(&self) -> Result<(), SummaryError> {
        if let SummaryFn::Quantiles { probs } = self {
            if let Some(&p) = probs.iter().find(|p| !(0.0..=1.0).contains(*p)) {
                return Err(SummaryError::InvalidProbability(p));
            }
        }
        Ok(())
    }

    /// Values in the same order as [`SummaryFn::columns`]
    fn apply(&self, chains: &[Vec<f64>], flat: &[f64], sorted: &[f64]) -> Vec<f64> {
        match self {
            SummaryFn::Mean => vec![mean(flat)],
            SummaryFn::Median => vec![quantile_sorted(sorted, 0.5)],
            SummaryFn::Sd => vec![variance(flat).sqrt()],
            SummaryFn::Var => vec![variance(flat)],
            SummaryFn::Mad => vec![mad(flat)],
            SummaryFn::Quantiles { probs } => {
                probs.iter().map(|&p| quantile_sorted(sorted, p)).collect()
            }
            SummaryFn::Rhat => vec![split_rhat(chains)],
            SummaryFn::EssBasic => vec![ess_basic(chains)],
        }
    }
}

/// 2.5% and 97.5% quantiles
pub fn default_summaries() -> Vec<SummaryFn> {
    vec![SummaryFn::Quantiles {
        probs: vec![0.025, 0.975],
    }]
}

/// Column name for a quantile: 0.025 -> `q2.5`, 0.5 -> `q50`
pub fn quantile_column_name(p: f64) -> String {
    let pct = (p * 100.0 * 1e6).round() / 1e6;
    format!("q{}", pct)
}

/// Ordered output columns of a summary list; rejects collisions
pub fn summary_columns(summaries: &[SummaryFn]) -> Result<Vec<String>, SummaryError> {
    if summaries.is_empty() {
        return Err(SummaryError::NoSummaries);
    }
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for summary in summaries {
        summary.validate()?;
        for column in summary.columns() {
            if !seen.insert(column.clone()) {
                return Err(SummaryError::DuplicateColumn(column));
            }
            columns.push(column);
        }
    }
    Ok(columns)
}

/// Statistics for one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub variable: String,
    pub stats: BTreeMap<String, f64>,
}

/// Apply `summaries` to each variable in `draws`.
///
/// With `variables = None` every model variable is summarized in draw order;
/// otherwise only the listed ones, each of which must exist.
pub fn summarize_draws(
    draws: &PosteriorDraws,
    summaries: &[SummaryFn],
    variables: Option<&[String]>,
) -> Result<Vec<VariableSummary>, SummaryError> {
    summary_columns(summaries)?;

    let selected: Vec<&String> = match variables {
        Some(names) => names.iter().collect(),
        None => draws.variables().iter().collect(),
    };

    let mut out = Vec::with_capacity(selected.len());
    for name in selected {
        let chains = draws
            .chains(name)
            .ok_or_else(|| SummaryError::UnknownVariable(name.clone()))?;
        let flat: Vec<f64> = chains.iter().flatten().copied().collect();
        let sorted = sorted_copy(&flat);

        let mut stats = BTreeMap::new();
        for summary in summaries {
            for (column, value) in summary
                .columns()
                .into_iter()
                .zip(summary.apply(chains, &flat, &sorted))
            {
                stats.insert(column, value);
            }
        }
        out.push(VariableSummary {
            variable: name.clone(),
            stats,
        });
    }
    Ok(out)
}
