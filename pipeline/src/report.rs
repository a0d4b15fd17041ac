//! Pipeline output files and terminal reports

use crate::diagnostics::{CoverageStat, SbcResult};
use crate::pipeline::{PipelineOutput, ReplicateFailure};
use crate::table::{quote_field, TableError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Files produced by [`write_outputs`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPaths {
    pub summaries_csv: PathBuf,
    pub summaries_json: PathBuf,
    pub coverage_csv: PathBuf,
    pub coverage_json: PathBuf,
    /// Dropped replicates; an empty array when none failed
    pub failures_json: PathBuf,
    /// Only written when SBC was enabled
    pub sbc_json: Option<PathBuf>,
}

impl ReportPaths {
    pub fn all(&self) -> Vec<&Path> {
        let mut paths = vec![
            self.summaries_csv.as_path(),
            self.summaries_json.as_path(),
            self.coverage_csv.as_path(),
            self.coverage_json.as_path(),
            self.failures_json.as_path(),
        ];
        paths.extend(self.sbc_json.as_deref());
        paths
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), ReportError> {
    fs::write(path, content).map_err(|source| ReportError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ReportError> {
    write_file(path, &serde_json::to_string_pretty(value)?)
}

const COVERAGE_HEADER: &str = "model,variable,n_reps,n_covered,coverage,mc_se";

/// Coverage statistics as CSV
pub fn coverage_to_csv(stats: &[CoverageStat]) -> String {
    let mut out = String::new();
    out.push_str(COVERAGE_HEADER);
    out.push('\n');
    for s in stats {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            quote_field(&s.model),
            quote_field(&s.variable),
            s.n_reps,
            s.n_covered,
            s.coverage,
            s.mc_se
        ));
    }
    out
}

pub fn write_coverage_csv(path: &Path, stats: &[CoverageStat]) -> Result<(), ReportError> {
    write_file(path, &coverage_to_csv(stats))
}

pub fn write_coverage_json(path: &Path, stats: &[CoverageStat]) -> Result<(), ReportError> {
    write_json(path, stats)
}

pub fn write_failures_json(path: &Path, failures: &[ReplicateFailure]) -> Result<(), ReportError> {
    write_json(path, failures)
}

pub fn write_sbc_json(path: &Path, results: &[SbcResult]) -> Result<(), ReportError> {
    write_json(path, results)
}

/// Write every pipeline artifact into `dir`
pub fn write_outputs(dir: &Path, output: &PipelineOutput) -> Result<ReportPaths, ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let paths = ReportPaths {
        summaries_csv: dir.join("summaries.csv"),
        summaries_json: dir.join("summaries.json"),
        coverage_csv: dir.join("coverage.csv"),
        coverage_json: dir.join("coverage.json"),
        failures_json: dir.join("failures.json"),
        sbc_json: (!output.sbc.is_empty()).then(|| dir.join("sbc.json")),
    };

    output.table.write_csv(&paths.summaries_csv)?;
    output.table.write_json(&paths.summaries_json)?;
    write_coverage_csv(&paths.coverage_csv, &output.coverage)?;
    write_coverage_json(&paths.coverage_json, &output.coverage)?;
    write_failures_json(&paths.failures_json, &output.failures)?;
    if let Some(path) = &paths.sbc_json {
        write_sbc_json(path, &output.sbc)?;
    }

    Ok(paths)
}

/// Fixed-width coverage table
pub fn format_coverage(stats: &[CoverageStat]) -> String {
    let model_w = stats.iter().map(|s| s.model.len()).max().unwrap_or(0).max(5);
    let var_w = stats
        .iter()
        .map(|s| s.variable.len())
        .max()
        .unwrap_or(0)
        .max(8);

    let mut out = String::new();
    out.push_str(&format!(
        "{:<model_w$}  {:<var_w$}  {:>6}  {:>7}  {:>8}  {:>7}\n",
        "model", "variable", "n_reps", "covered", "coverage", "mc_se"
    ));
    out.push_str(&"-".repeat(model_w + var_w + 38));
    out.push('\n');
    for s in stats {
        out.push_str(&format!(
            "{:<model_w$}  {:<var_w$}  {:>6}  {:>7}  {:>8.3}  {:>7.4}\n",
            s.model, s.variable, s.n_reps, s.n_covered, s.coverage, s.mc_se
        ));
    }
    out
}

pub fn print_coverage(stats: &[CoverageStat]) {
    println!("{}", format_coverage(stats));
}

/// Print SBC verdicts to stderr
pub fn print_sbc(results: &[SbcResult]) {
    for result in results {
        eprintln!("\n═══════════════════════════════════════════════════════════════");
        eprintln!("SBC: {}", result.model);
        eprintln!("═══════════════════════════════════════════════════════════════");
        eprintln!(
            "  Replications: {} succeeded, {} failed",
            result.n_success, result.n_failed
        );
        for (param, p) in &result.quality.p_values {
            let uniform = result.quality.ranks_uniform.get(param).copied().unwrap_or(false);
            eprintln!(
                "  {:<12} p = {:.3}  {}",
                param,
                p,
                if uniform { "✓ uniform" } else { "✗ non-uniform" }
            );
        }
        for message in &result.quality.messages {
            eprintln!("  ⚠ {}", message);
        }
        eprintln!(
            "  Overall: {}",
            if result.quality.overall_pass { "PASS" } else { "FAIL" }
        );
    }
}
