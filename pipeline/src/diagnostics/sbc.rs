//! Simulation-Based Calibration (SBC) rank statistics
//!
//! SBC tests whether the posterior inference procedure is correctly calibrated
//! by checking if the rank of the true value among posterior draws follows a
//! uniform distribution across replicates.
//!
//! Reference: Talts et al. (2018) "Validating Bayesian Inference Algorithms with Simulation-Based Calibration"

use crate::diagnostics::{DiagnosticsError, PosteriorDraws};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;

/// Configuration for SBC rank analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SbcConfig {
    /// Draws are thinned to at most this many before ranking
    pub max_rank_draws: usize,
    /// Number of histogram bins for the uniformity test
    pub n_bins: usize,
    /// Parameters to track (empty = every parameter with ground truth)
    pub params_to_track: Vec<String>,
}

impl Default for SbcConfig {
    fn default() -> Self {
        SbcConfig {
            max_rank_draws: 100,
            n_bins: 20,
            params_to_track: Vec::new(),
        }
    }
}

/// Rank statistics from a single replicate fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbcReplication {
    /// Global replicate index
    pub sim_id: usize,
    /// Model that produced the draws
    pub model: String,
    /// True parameter values used to generate data
    pub true_params: BTreeMap<String, f64>,
    /// Rank of true value in the thinned posterior draws (one per parameter)
    pub ranks: BTreeMap<String, usize>,
    /// Number of draws the ranks were computed against
    pub n_rank_draws: usize,
    /// Whether the fit succeeded
    pub success: bool,
    /// Optional error message if fit failed
    pub error_message: Option<String>,
}

impl SbcReplication {
    /// Record a replicate whose fit failed
    pub fn failed(sim_id: usize, model: &str, message: String) -> Self {
        Self {
            sim_id,
            model: model.to_string(),
            true_params: BTreeMap::new(),
            ranks: BTreeMap::new(),
            n_rank_draws: 0,
            success: false,
            error_message: Some(message),
        }
    }
}

/// Complete SBC results for one model across all replicates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbcResult {
    pub model: String,
    /// Configuration used
    pub config: SbcConfig,
    /// Results from each replication
    pub replications: Vec<SbcReplication>,
    /// Rank histograms (parameter name -> counts per bin)
    pub rank_histograms: BTreeMap<String, Vec<usize>>,
    /// Number of successful fits
    pub n_success: usize,
    /// Number of failed fits
    pub n_failed: usize,
    /// SBC quality assessment
    pub quality: SbcQuality,
}

/// Quality assessment for SBC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbcQuality {
    /// Whether rank distributions appear uniform (chi-square test)
    pub ranks_uniform: BTreeMap<String, bool>,
    /// Chi-square statistics for each parameter
    pub chi_square_stats: BTreeMap<String, f64>,
    /// P-values for uniformity tests
    pub p_values: BTreeMap<String, f64>,
    /// Overall pass/fail assessment
    pub overall_pass: bool,
    /// Diagnostic messages
    pub messages: Vec<String>,
}

/// Compute rank of true value in posterior draws
///
/// # Returns
/// Number of draws strictly below the true value (0 to n_draws inclusive)
pub fn compute_rank(true_value: f64, posterior_draws: &[f64]) -> usize {
    posterior_draws.iter().filter(|&&x| x < true_value).count()
}

/// Keep at most `max_draws` evenly spaced draws
pub fn thin_draws(draws: &[f64], max_draws: usize) -> Vec<f64> {
    if max_draws == 0 || draws.len() <= max_draws {
        return draws.to_vec();
    }
    (0..max_draws)
        .map(|i| draws[i * draws.len() / max_draws])
        .collect()
}

/// Rank every tracked parameter of one replicate fit
pub fn rank_replication(
    sim_id: usize,
    model: &str,
    draws: &PosteriorDraws,
    true_params: &BTreeMap<String, f64>,
    config: &SbcConfig,
) -> Result<SbcReplication, DiagnosticsError> {
    let tracked: Vec<&String> = if config.params_to_track.is_empty() {
        true_params.keys().collect()
    } else {
        config.params_to_track.iter().collect()
    };

    let mut ranks = BTreeMap::new();
    let mut n_rank_draws = 0;

    for name in tracked {
        let truth = true_params.get(name).ok_or_else(|| {
            DiagnosticsError::InsufficientData(format!("no ground truth for '{}'", name))
        })?;
        let flat = draws.flat(name).ok_or_else(|| {
            DiagnosticsError::InsufficientData(format!("no posterior draws for '{}'", name))
        })?;
        let thinned = thin_draws(&flat, config.max_rank_draws);
        n_rank_draws = thinned.len();
        ranks.insert(name.clone(), compute_rank(*truth, &thinned));
    }

    Ok(SbcReplication {
        sim_id,
        model: model.to_string(),
        true_params: true_params.clone(),
        ranks,
        n_rank_draws,
        success: true,
        error_message: None,
    })
}

/// Build rank histogram from SBC replications
///
/// # Arguments
/// * `ranks` - Rank statistics for a parameter, each in `0..=n_draws`
/// * `n_draws` - Number of draws the ranks were computed against
/// * `n_bins` - Requested number of bins (capped at `n_draws + 1`)
pub fn build_rank_histogram(ranks: &[usize], n_draws: usize, n_bins: usize) -> Vec<usize> {
    let n_values = n_draws + 1;
    let n_bins = n_bins.clamp(1, n_values);
    let mut histogram = vec![0; n_bins];
    for &rank in ranks {
        if rank < n_values {
            histogram[rank * n_bins / n_values] += 1;
        }
    }
    histogram
}

/// Test uniformity of rank histogram using chi-square test
///
/// # Returns
/// (chi_square_statistic, p_value, is_uniform) at alpha = 0.05
pub fn test_uniformity(histogram: &[usize]) -> (f64, f64, bool) {
    let n_bins = histogram.len();
    let total_count: usize = histogram.iter().sum();

    if total_count == 0 || n_bins < 2 {
        return (0.0, 1.0, true);
    }

    let expected = total_count as f64 / n_bins as f64;

    let chi_square: f64 = histogram
        .iter()
        .map(|&observed| {
            let diff = observed as f64 - expected;
            (diff * diff) / expected
        })
        .sum();

    // n_bins >= 2 here, so the degrees of freedom are always valid
    let p_value = ChiSquared::new((n_bins - 1) as f64).map_or(1.0, |dist| dist.sf(chi_square));

    (chi_square, p_value, p_value >= 0.05)
}

/// Analyze SBC results for one model and generate quality assessment
pub fn analyze_sbc_results(
    model: &str,
    replications: Vec<SbcReplication>,
    config: SbcConfig,
) -> Result<SbcResult, DiagnosticsError> {
    if replications.is_empty() {
        return Err(DiagnosticsError::InsufficientData(
            "No SBC replications provided".to_string(),
        ));
    }

    let n_success = replications.iter().filter(|r| r.success).count();
    let n_failed = replications.len() - n_success;

    let mut param_names: Vec<String> = replications
        .iter()
        .filter(|r| r.success)
        .flat_map(|r| r.ranks.keys().cloned())
        .collect();
    param_names.sort();
    param_names.dedup();

    let n_draws = replications
        .iter()
        .filter(|r| r.success)
        .map(|r| r.n_rank_draws)
        .min()
        .unwrap_or(0);

    let mut rank_histograms = BTreeMap::new();
    let mut ranks_uniform = BTreeMap::new();
    let mut chi_square_stats = BTreeMap::new();
    let mut p_values = BTreeMap::new();
    let mut messages = Vec::new();

    for param_name in &param_names {
        let ranks: Vec<usize> = replications
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.ranks.get(param_name).copied())
            .collect();

        if ranks.is_empty() {
            messages.push(format!(
                "No successful ranks for parameter '{}'",
                param_name
            ));
            continue;
        }

        let histogram = build_rank_histogram(&ranks, n_draws, config.n_bins);
        let (chi_sq, p_val, is_uniform) = test_uniformity(&histogram);

        rank_histograms.insert(param_name.clone(), histogram);
        ranks_uniform.insert(param_name.clone(), is_uniform);
        chi_square_stats.insert(param_name.clone(), chi_sq);
        p_values.insert(param_name.clone(), p_val);

        if !is_uniform {
            messages.push(format!(
                "Parameter '{}' shows non-uniform ranks (χ²={:.2}, p={:.3})",
                param_name, chi_sq, p_val
            ));
        }
    }

    let success_rate = n_success as f64 / replications.len() as f64;
    let all_uniform = ranks_uniform.values().all(|&u| u);
    let sufficient_success = success_rate >= 0.80;

    let overall_pass = all_uniform && sufficient_success;

    if !sufficient_success {
        messages.push(format!(
            "Low success rate: {}/{} ({:.1}%) fits succeeded",
            n_success,
            replications.len(),
            success_rate * 100.0
        ));
    }

    if overall_pass {
        messages.push("SBC validation passed: ranks appear uniform".to_string());
    }

    Ok(SbcResult {
        model: model.to_string(),
        config,
        replications,
        rank_histograms,
        n_success,
        n_failed,
        quality: SbcQuality {
            ranks_uniform,
            chi_square_stats,
            p_values,
            overall_pass,
            messages,
        },
    })
}
