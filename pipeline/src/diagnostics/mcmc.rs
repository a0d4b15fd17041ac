//! Posterior draws and MCMC quality metrics
//!
//! This module provides functionality to:
//! - Parse CmdStan CSV output into posterior draws
//! - Compute split R-hat and basic ESS
//! - Count divergences and tree depth exceedances
//! - Summarize overall fit quality

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// CmdStan default max_treedepth
pub const DEFAULT_MAX_TREEDEPTH: usize = 10;

/// Errors during diagnostics computation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiagnosticsError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

/// Draws from one chain, as parsed from a CmdStan CSV file
#[derive(Debug, Clone)]
pub struct ChainData {
    /// Model variable names (diagnostic columns removed, names normalized)
    pub variables: Vec<String>,
    /// One row per draw, one column per variable
    pub draws: Vec<Vec<f64>>,
    pub n_divergent: usize,
    pub n_max_treedepth: usize,
}

/// Posterior draws for every model variable across all chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorDraws {
    variables: Vec<String>,
    /// `columns[variable][chain][draw]`
    columns: Vec<Vec<Vec<f64>>>,
    n_divergent: usize,
    n_max_treedepth: usize,
}

impl PosteriorDraws {
    /// Build from per-variable chain matrices.
    ///
    /// `columns[v][c]` holds the draws of variable `v` in chain `c`. Every
    /// variable must have the same number of chains and every chain at least
    /// one draw.
    pub fn new(
        variables: Vec<String>,
        columns: Vec<Vec<Vec<f64>>>,
    ) -> Result<Self, DiagnosticsError> {
        if variables.len() != columns.len() {
            return Err(DiagnosticsError::ParseError(format!(
                "{} variable names for {} columns",
                variables.len(),
                columns.len()
            )));
        }
        if let Some(first) = columns.first() {
            let n_chains = first.len();
            for (name, chains) in variables.iter().zip(&columns) {
                if chains.len() != n_chains {
                    return Err(DiagnosticsError::ParseError(format!(
                        "variable '{}' has {} chains, expected {}",
                        name,
                        chains.len(),
                        n_chains
                    )));
                }
                if chains.iter().any(|c| c.is_empty()) {
                    return Err(DiagnosticsError::InsufficientData(format!(
                        "variable '{}' has an empty chain",
                        name
                    )));
                }
            }
        }
        Ok(Self {
            variables,
            columns,
            n_divergent: 0,
            n_max_treedepth: 0,
        })
    }

    /// Merge parsed chains. All chains must report the same variables.
    pub fn from_chains(chains: Vec<ChainData>) -> Result<Self, DiagnosticsError> {
        let first = chains
            .first()
            .ok_or_else(|| DiagnosticsError::InsufficientData("no chains".to_string()))?;
        let variables = first.variables.clone();

        let mut columns = vec![Vec::with_capacity(chains.len()); variables.len()];
        let mut n_divergent = 0;
        let mut n_max_treedepth = 0;

        for (chain_idx, chain) in chains.iter().enumerate() {
            if chain.variables != variables {
                return Err(DiagnosticsError::ParseError(format!(
                    "chain {} reports different variables than chain 1",
                    chain_idx + 1
                )));
            }
            if chain.draws.is_empty() {
                return Err(DiagnosticsError::InsufficientData(format!(
                    "chain {} has no draws",
                    chain_idx + 1
                )));
            }
            for (var_idx, column) in columns.iter_mut().enumerate() {
                column.push(chain.draws.iter().map(|draw| draw[var_idx]).collect());
            }
            n_divergent += chain.n_divergent;
            n_max_treedepth += chain.n_max_treedepth;
        }

        let mut draws = Self::new(variables, columns)?;
        draws.n_divergent = n_divergent;
        draws.n_max_treedepth = n_max_treedepth;
        Ok(draws)
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn n_chains(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Total number of draws across chains
    pub fn n_draws(&self) -> usize {
        self.columns
            .first()
            .map(|chains| chains.iter().map(|c| c.len()).sum())
            .unwrap_or(0)
    }

    pub fn n_divergent(&self) -> usize {
        self.n_divergent
    }

    pub fn n_max_treedepth(&self) -> usize {
        self.n_max_treedepth
    }

    /// Per-chain draws of one variable
    pub fn chains(&self, variable: &str) -> Option<&[Vec<f64>]> {
        self.variables
            .iter()
            .position(|v| v == variable)
            .map(|idx| self.columns[idx].as_slice())
    }

    /// All draws of one variable, chains concatenated in order
    pub fn flat(&self, variable: &str) -> Option<Vec<f64>> {
        self.chains(variable)
            .map(|chains| chains.iter().flatten().copied().collect())
    }
}

/// Convert CmdStan column names (`beta.1`, `a.1.2`) to bracket form (`beta[1]`, `a[1,2]`)
pub fn normalize_variable_name(name: &str) -> String {
    let mut parts = name.split('.');
    let base = parts.next().unwrap_or_default();
    let indices: Vec<&str> = parts.collect();
    if indices.is_empty() || indices.iter().any(|i| i.parse::<usize>().is_err()) {
        return name.to_string();
    }
    format!("{}[{}]", base, indices.join(","))
}

/// Parse the contents of one CmdStan CSV file
///
/// A draw counts as saturated when its `treedepth__` reached `max_treedepth`,
/// the limit the chain was sampled with.
pub fn parse_cmdstan_csv(
    content: &str,
    max_treedepth: usize,
) -> Result<ChainData, DiagnosticsError> {
    let mut lines = content.lines();

    // Skip comment lines starting with #
    let mut header_line = None;
    for line in lines.by_ref() {
        if !line.starts_with('#') && !line.trim().is_empty() {
            header_line = Some(line);
            break;
        }
    }

    let header = header_line
        .ok_or_else(|| DiagnosticsError::ParseError("No header found in CSV".to_string()))?;

    let all_names: Vec<String> = header.split(',').map(|s| s.trim().to_string()).collect();

    let divergent_idx = all_names.iter().position(|s| s == "divergent__");
    let treedepth_idx = all_names.iter().position(|s| s == "treedepth__");

    let param_indices: Vec<usize> = all_names
        .iter()
        .enumerate()
        .filter(|(_, name)| !name.ends_with("__"))
        .map(|(idx, _)| idx)
        .collect();

    let variables: Vec<String> = param_indices
        .iter()
        .map(|&idx| normalize_variable_name(&all_names[idx]))
        .collect();

    let mut draws = Vec::new();
    let mut n_divergent = 0;
    let mut n_max_treedepth = 0;

    for (line_num, line) in lines.enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let values: Vec<&str> = line.split(',').collect();
        if values.len() != all_names.len() {
            return Err(DiagnosticsError::ParseError(format!(
                "row {} has {} columns, expected {}",
                line_num + 1,
                values.len(),
                all_names.len()
            )));
        }

        if let Some(idx) = divergent_idx {
            if let Ok(val) = values[idx].trim().parse::<f64>() {
                if val > 0.5 {
                    n_divergent += 1;
                }
            }
        }

        if let Some(idx) = treedepth_idx {
            if let Ok(val) = values[idx].trim().parse::<usize>() {
                if val >= max_treedepth {
                    n_max_treedepth += 1;
                }
            }
        }

        let mut draw = Vec::with_capacity(param_indices.len());
        for &param_idx in &param_indices {
            let val: f64 = values[param_idx].trim().parse().map_err(|e| {
                DiagnosticsError::ParseError(format!(
                    "Cannot parse value '{}' for '{}': {}",
                    values[param_idx].trim(),
                    all_names[param_idx],
                    e
                ))
            })?;
            draw.push(val);
        }
        draws.push(draw);
    }

    Ok(ChainData {
        variables,
        draws,
        n_divergent,
        n_max_treedepth,
    })
}

/// Read and parse one CmdStan CSV file
pub fn read_cmdstan_csv<P: AsRef<Path>>(
    path: P,
    max_treedepth: usize,
) -> Result<ChainData, DiagnosticsError> {
    let content = std::fs::read_to_string(&path).map_err(|e| {
        DiagnosticsError::IoError(format!(
            "Cannot read CSV {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    parse_cmdstan_csv(&content, max_treedepth)
}

// =============================================================================
// Statistics
// =============================================================================

pub fn mean(draws: &[f64]) -> f64 {
    if draws.is_empty() {
        return f64::NAN;
    }
    draws.iter().sum::<f64>() / draws.len() as f64
}

/// Sample variance (n - 1 denominator)
pub fn variance(draws: &[f64]) -> f64 {
    if draws.len() < 2 {
        return f64::NAN;
    }
    let m = mean(draws);
    draws.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (draws.len() - 1) as f64
}

pub fn sd(draws: &[f64]) -> f64 {
    variance(draws).sqrt()
}

/// Quantile with linear interpolation between order statistics (type 7).
/// `sorted` must be sorted ascending.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

pub fn sorted_copy(draws: &[f64]) -> Vec<f64> {
    let mut sorted = draws.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

pub fn quantiles(draws: &[f64], probs: &[f64]) -> Vec<f64> {
    let sorted = sorted_copy(draws);
    probs.iter().map(|&p| quantile_sorted(&sorted, p)).collect()
}

pub fn median(draws: &[f64]) -> f64 {
    quantile_sorted(&sorted_copy(draws), 0.5)
}

/// Median absolute deviation, scaled to be consistent with the normal SD
pub fn mad(draws: &[f64]) -> f64 {
    let center = median(draws);
    let deviations: Vec<f64> = draws.iter().map(|x| (x - center).abs()).collect();
    1.4826 * median(&deviations)
}

/// Split each chain in half, dropping the middle draw of odd-length chains
fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let half = chain.len() / 2;
        split.push(&chain[..half]);
        split.push(&chain[chain.len() - half..]);
    }
    split
}

/// Split-chain potential scale reduction factor
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let n_chains = split.len();
    let n_draws = split.iter().map(|c| c.len()).min().unwrap_or(0);
    if n_chains < 2 || n_draws < 2 {
        return f64::NAN;
    }

    let chain_means: Vec<f64> = split.iter().map(|c| mean(&c[..n_draws])).collect();
    let within_var = split
        .iter()
        .map(|c| variance(&c[..n_draws]))
        .sum::<f64>()
        / n_chains as f64;

    let grand_mean = mean(&chain_means);
    let between_var = chain_means
        .iter()
        .map(|m| (m - grand_mean).powi(2))
        .sum::<f64>()
        * n_draws as f64
        / (n_chains - 1) as f64;

    if within_var <= 0.0 {
        return f64::NAN;
    }

    let var_plus = ((n_draws - 1) as f64 * within_var + between_var) / n_draws as f64;
    (var_plus / within_var).sqrt()
}

/// Autocovariance at `lag` with the biased (1/n) estimator
fn autocovariance(chain: &[f64], chain_mean: f64, lag: usize) -> f64 {
    let n = chain.len();
    if lag >= n {
        return 0.0;
    }
    (0..n - lag)
        .map(|i| (chain[i] - chain_mean) * (chain[i + lag] - chain_mean))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size from split chains using Geyer's initial monotone
/// positive sequence.
pub fn ess_basic(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len();
    let n = split.iter().map(|c| c.len()).min().unwrap_or(0);
    if m == 0 || n < 4 {
        return f64::NAN;
    }

    let split: Vec<&[f64]> = split.into_iter().map(|c| &c[..n]).collect();
    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let mean_acov = |lag: usize| -> f64 {
        split
            .iter()
            .zip(&chain_means)
            .map(|(c, &mu)| autocovariance(c, mu, lag))
            .sum::<f64>()
            / m as f64
    };

    let nf = n as f64;
    let mean_var = mean_acov(0) * nf / (nf - 1.0);
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += variance(&chain_means);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }

    let rho = |lag: usize| 1.0 - (mean_var - mean_acov(lag)) / var_plus;

    let mut rhos = vec![1.0, rho(1)];
    let mut t = 1;
    while t + 2 < n {
        let a = rho(t + 1);
        let b = rho(t + 2);
        if a + b <= 0.0 {
            break;
        }
        rhos.push(a);
        rhos.push(b);
        t += 2;
    }

    let mut pair_sum = 0.0;
    let mut prev_pair = f64::INFINITY;
    for pair in rhos.chunks(2) {
        let p = pair.iter().sum::<f64>().min(prev_pair);
        pair_sum += p;
        prev_pair = p;
    }

    let total = (m * n) as f64;
    let tau = (-1.0 + 2.0 * pair_sum).max(1.0 / total.log10());
    total / tau
}

// =============================================================================
// Fit quality
// =============================================================================

/// MCMC statistics for a single parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamMcmcStats {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub rhat: f64,
    pub ess: f64,
    pub q05: f64,
    pub q50: f64,
    pub q95: f64,
}

/// Summary of MCMC fit quality
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitMcmcSummary {
    pub n_draws: usize,
    pub n_chains: usize,
    pub n_divergent: usize,
    pub max_treedepth_exceeded: usize,
    pub params: Vec<ParamMcmcStats>,
    pub overall_quality: FitQuality,
}

/// Overall fit quality assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitQuality {
    pub has_convergence_issues: bool,
    pub has_sampling_issues: bool,
    pub max_rhat: f64,
    pub min_ess: f64,
    pub quality_grade: String, // "A", "B", "C", "D", "F"
}

/// Summarize fit quality across every variable in `draws`
pub fn summarize_fit(draws: &PosteriorDraws) -> FitMcmcSummary {
    let mut params = Vec::with_capacity(draws.variables().len());
    let mut max_rhat: f64 = 1.0;
    let mut min_ess = f64::INFINITY;

    for name in draws.variables() {
        let chains = match draws.chains(name) {
            Some(chains) => chains,
            None => continue,
        };
        let flat: Vec<f64> = chains.iter().flatten().copied().collect();
        let q = quantiles(&flat, &[0.05, 0.50, 0.95]);
        let rhat = split_rhat(chains);
        let ess = ess_basic(chains);

        // NaN comparisons are false, so constant draws never trip these.
        if rhat > max_rhat {
            max_rhat = rhat;
        }
        if ess < min_ess {
            min_ess = ess;
        }

        let m = mean(&flat);
        params.push(ParamMcmcStats {
            name: name.clone(),
            mean: m,
            sd: sd(&flat),
            rhat,
            ess,
            q05: q[0],
            q50: q[1],
            q95: q[2],
        });
    }

    let n_draws = draws.n_draws();
    let n_divergent = draws.n_divergent();
    let max_treedepth_exceeded = draws.n_max_treedepth();

    let has_convergence_issues = max_rhat > 1.01 || min_ess < 100.0;
    let has_sampling_issues = n_divergent > 0 || max_treedepth_exceeded > n_draws / 20;

    let quality_grade = if !has_convergence_issues && !has_sampling_issues {
        "A"
    } else if max_rhat < 1.05 && min_ess > 50.0 && n_divergent < 10 {
        "B"
    } else if max_rhat < 1.10 && min_ess > 20.0 {
        "C"
    } else if max_rhat < 1.20 {
        "D"
    } else {
        "F"
    };

    FitMcmcSummary {
        n_draws,
        n_chains: draws.n_chains(),
        n_divergent,
        max_treedepth_exceeded,
        params,
        overall_quality: FitQuality {
            has_convergence_issues,
            has_sampling_issues,
            max_rhat,
            min_ess,
            quality_grade: quality_grade.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn iid_normal(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        (0..n).map(|_| StandardNormal.sample(&mut rng)).collect()
    }

    const CMDSTAN_CSV: &str = "\
# model = linear_model
# method = sample (Default)
lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,beta,theta.1,theta.2
# Adaptation terminated
-7.1,0.95,0.9,2,3,0,7.5,0.31,1.0,2.0
-7.3,0.88,0.9,2,3,1,7.9,0.42,1.1,2.1
-6.9,0.99,0.9,10,1023,0,7.2,0.12,0.9,1.9
#  Elapsed Time: 0.01 seconds (Warm-up)
";

    #[test]
    fn test_parse_cmdstan_csv() {
        let chain = parse_cmdstan_csv(CMDSTAN_CSV, DEFAULT_MAX_TREEDEPTH).unwrap();

        assert_eq!(chain.variables, vec!["beta", "theta[1]", "theta[2]"]);
        assert_eq!(chain.draws.len(), 3);
        assert_eq!(chain.draws[1], vec![0.42, 1.1, 2.1]);
        assert_eq!(chain.n_divergent, 1);
        assert_eq!(chain.n_max_treedepth, 1);
    }

    #[test]
    fn test_treedepth_saturation_follows_sampler_limit() {
        let csv = "\
lp__,treedepth__,divergent__,beta
-1.0,8,0,0.1
-1.1,10,0,0.2
-1.2,11,0,0.3
-1.3,15,0,0.4
";
        assert_eq!(parse_cmdstan_csv(csv, 15).unwrap().n_max_treedepth, 1);
        assert_eq!(parse_cmdstan_csv(csv, 10).unwrap().n_max_treedepth, 3);
        assert_eq!(parse_cmdstan_csv(csv, 8).unwrap().n_max_treedepth, 4);
    }

    #[test]
    fn test_diagnostics_error_display() {
        let err = DiagnosticsError::ParseError("bad row".to_string());
        assert_eq!(err.to_string(), "Parse error: bad row");
    }

    #[test]
    fn test_parse_rejects_malformed_row() {
        let csv = "lp__,beta\n-1.0,0.5\n-1.0\n";
        assert!(matches!(
            parse_cmdstan_csv(csv, DEFAULT_MAX_TREEDEPTH),
            Err(DiagnosticsError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_requires_header() {
        assert!(parse_cmdstan_csv("# only comments\n", DEFAULT_MAX_TREEDEPTH).is_err());
    }

    #[test]
    fn test_normalize_variable_name() {
        assert_eq!(normalize_variable_name("beta"), "beta");
        assert_eq!(normalize_variable_name("beta.1"), "beta[1]");
        assert_eq!(normalize_variable_name("a.1.2"), "a[1,2]");
        assert_eq!(normalize_variable_name("a.b"), "a.b");
    }

    #[test]
    fn test_from_chains_merges() {
        let chain = parse_cmdstan_csv(CMDSTAN_CSV, DEFAULT_MAX_TREEDEPTH).unwrap();
        let draws = PosteriorDraws::from_chains(vec![chain.clone(), chain]).unwrap();

        assert_eq!(draws.n_chains(), 2);
        assert_eq!(draws.n_draws(), 6);
        assert_eq!(draws.n_divergent(), 2);
        assert_eq!(draws.flat("beta").unwrap().len(), 6);
        assert!(draws.chains("lp__").is_none());
    }

    #[test]
    fn test_compute_mean() {
        let draws = vec![1.0, 2.0, 3.0, 1.5, 2.5, 3.5];
        assert!((mean(&draws) - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_quantiles_type7() {
        let draws = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let q = quantiles(&draws, &[0.0, 0.5, 1.0, 0.025]);

        assert_eq!(q[0], 1.0);
        assert!((q[1] - 5.5).abs() < 1e-12);
        assert_eq!(q[2], 10.0);
        assert!((q[3] - 1.225).abs() < 1e-12);
    }

    #[test]
    fn test_mad() {
        let draws = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        // median 3, deviations 2,1,0,1,97 -> median 1
        assert!((mad(&draws) - 1.4826).abs() < 1e-12);
    }

    #[test]
    fn test_split_rhat_near_one() {
        let a = iid_normal(1, 200);
        let b = iid_normal(2, 200);
        let rhat = split_rhat(&[a, b]);
        assert!(rhat > 0.95 && rhat < 1.05, "R-hat = {}", rhat);
    }

    #[test]
    fn test_split_rhat_detects_disagreement() {
        let a: Vec<f64> = (0..100).map(|i| (i % 7) as f64).collect();
        let b: Vec<f64> = (0..100).map(|i| 50.0 + (i % 7) as f64).collect();
        assert!(split_rhat(&[a, b]) > 1.5);
    }

    #[test]
    fn test_ess_independent_vs_autocorrelated() {
        let independent = iid_normal(3, 400);
        let sticky: Vec<f64> = (0..400).map(|i| (i / 40) as f64).collect();

        let ess_ind = ess_basic(&[independent]);
        let ess_sticky = ess_basic(&[sticky]);
        assert!(ess_ind > 100.0, "ESS = {}", ess_ind);
        assert!(ess_sticky < ess_ind);
    }

    #[test]
    fn test_summarize_fit_grades() {
        let a = iid_normal(4, 400);
        let b = iid_normal(5, 400);
        let draws = PosteriorDraws::new(vec!["beta".to_string()], vec![vec![a, b]]).unwrap();

        let summary = summarize_fit(&draws);
        assert_eq!(summary.n_chains, 2);
        assert_eq!(summary.n_draws, 800);
        assert_eq!(summary.params.len(), 1);
        assert_eq!(summary.overall_quality.quality_grade, "A");
    }
}
