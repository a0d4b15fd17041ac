//! Diagnostics module for calibration and fit quality
//!
//! This module provides tools for:
//! - Posterior draws and MCMC quality metrics (R-hat, ESS, divergences)
//! - Empirical coverage of credible intervals
//! - Simulation-based calibration (SBC) rank statistics

pub mod coverage;
pub mod mcmc;
pub mod sbc;

pub use coverage::{compute_coverage, is_covered, CoverageError, CoverageStat, IntervalSpec};
pub use mcmc::{
    parse_cmdstan_csv, read_cmdstan_csv, summarize_fit, ChainData, DiagnosticsError,
    DEFAULT_MAX_TREEDEPTH,
    FitMcmcSummary, FitQuality, ParamMcmcStats, PosteriorDraws,
};
pub use sbc::{
    analyze_sbc_results, rank_replication, SbcConfig, SbcQuality, SbcReplication, SbcResult,
};
