// RunLogger: records runs and their artifacts with shared context

use super::storage::Registry;
use super::{ArtifactId, ArtifactKind, ArtifactRecord, RunId, RunKind, RunRecord};
use crate::config::PipelineConfig;
use crate::datagen::LinearRegression;
use crate::diagnostics::{CoverageStat, IntervalSpec};
use crate::pipeline::PipelineOutput;
use crate::report::ReportPaths;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Helper for logging runs with consistent context
#[derive(Debug, Clone)]
pub struct RunLogger {
    registry: Registry,
    project_root: String,
    pipeline: Option<String>,
    git_commit: Option<String>,
    git_dirty: bool,
}

impl RunLogger {
    pub fn with_registry(registry: Registry, project_root: &str, pipeline: Option<&str>) -> Self {
        let (commit, dirty) = detect_git_state(project_root);

        Self {
            registry,
            project_root: project_root.to_string(),
            pipeline: pipeline.map(|s| s.to_string()),
            git_commit: commit,
            git_dirty: dirty,
        }
    }

    /// Log a run that began at `started_at` together with its artifacts
    pub fn log_run_with_artifacts(
        &self,
        kind: RunKind,
        started_at: DateTime<Utc>,
        config: serde_json::Value,
        metrics: serde_json::Value,
        mut artifacts: Vec<ArtifactRecord>,
    ) -> anyhow::Result<RunId> {
        let now = Utc::now();

        let mut artifact_ids: Vec<ArtifactId> = Vec::with_capacity(artifacts.len());
        for art in &mut artifacts {
            art.created_at = now;
            self.registry.log_artifact(art)?;
            artifact_ids.push(art.id);
        }

        let mut run = RunRecord::new(kind, self.project_root.clone())
            .with_git_info(self.git_commit.clone(), self.git_dirty)
            .with_config(config)
            .with_metrics(metrics)
            .with_artifacts(artifact_ids);
        run.pipeline = self.pipeline.clone();
        run.started_at = started_at;
        run.set_finished();

        self.registry.log_run(&run)?;
        debug!(run = %run.id, kind = %kind, "run recorded");

        Ok(run.id)
    }

    /// Log a run without artifacts
    pub fn log_run(
        &self,
        kind: RunKind,
        started_at: DateTime<Utc>,
        config: serde_json::Value,
        metrics: serde_json::Value,
    ) -> anyhow::Result<RunId> {
        self.log_run_with_artifacts(kind, started_at, config, metrics, Vec::new())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// =============================================================================
// Git State Detection
// =============================================================================

/// Current commit and dirty flag; `(None, false)` outside a repository or without git
fn detect_git_state(project_root: &str) -> (Option<String>, bool) {
    let git = |args: &[&str]| {
        Command::new("git")
            .args(args)
            .current_dir(project_root)
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
    };

    match git(&["rev-parse", "HEAD"]) {
        Some(commit) if !commit.is_empty() => {
            let dirty = git(&["status", "--porcelain"])
                .map(|status| !status.is_empty())
                .unwrap_or(false);
            (Some(commit), dirty)
        }
        _ => (None, false),
    }
}

fn artifact(kind: ArtifactKind, path: &Path) -> ArtifactRecord {
    ArtifactRecord::new(kind, Some(path.display().to_string()))
}

fn coverage_metrics(stats: &[CoverageStat]) -> serde_json::Value {
    stats
        .iter()
        .map(|s| {
            serde_json::json!({
                "model": s.model,
                "variable": s.variable,
                "n_reps": s.n_reps,
                "coverage": s.coverage,
                "mc_se": s.mc_se,
            })
        })
        .collect()
}

// =============================================================================
// Specialized Logging Helpers
// =============================================================================

/// Log a full pipeline run
pub fn log_pipeline_run(
    logger: &RunLogger,
    started_at: DateTime<Utc>,
    config: &PipelineConfig,
    output: &PipelineOutput,
    paths: &ReportPaths,
) -> anyhow::Result<RunId> {
    let config_json = serde_json::to_value(config)?;

    let sbc_pass: serde_json::Map<String, serde_json::Value> = output
        .sbc
        .iter()
        .map(|r| (r.model.clone(), serde_json::Value::Bool(r.quality.overall_pass)))
        .collect();

    let metrics = serde_json::json!({
        "n_replicates": config.n_replicates(),
        "n_rows": output.table.len(),
        "n_failed": output.failures.len(),
        "n_poor_fits": output.n_poor_fits,
        "coverage": coverage_metrics(&output.coverage),
        "sbc_pass": sbc_pass,
    });

    let mut artifacts = vec![
        artifact(ArtifactKind::SummaryTable, &paths.summaries_csv),
        artifact(ArtifactKind::SummaryTable, &paths.summaries_json),
        artifact(ArtifactKind::CoverageReport, &paths.coverage_csv),
        artifact(ArtifactKind::CoverageReport, &paths.coverage_json),
        artifact(ArtifactKind::FailureReport, &paths.failures_json)
            .with_metadata(serde_json::json!({"n_failed": output.failures.len()})),
    ];
    if let Some(path) = &paths.sbc_json {
        artifacts.push(artifact(ArtifactKind::SbcReport, path));
    }

    logger.log_run_with_artifacts(RunKind::Simulation, started_at, config_json, metrics, artifacts)
}

/// Log coverage recomputed from an existing summary table
pub fn log_coverage_run(
    logger: &RunLogger,
    started_at: DateTime<Utc>,
    input: &Path,
    interval: &IntervalSpec,
    stats: &[CoverageStat],
    output: Option<&Path>,
) -> anyhow::Result<RunId> {
    let config = serde_json::json!({
        "input": input.display().to_string(),
        "interval": interval,
    });
    let metrics = serde_json::json!({ "coverage": coverage_metrics(stats) });
    let artifacts = output
        .map(|path| vec![artifact(ArtifactKind::CoverageReport, path)])
        .unwrap_or_default();

    logger.log_run_with_artifacts(RunKind::Coverage, started_at, config, metrics, artifacts)
}

/// Log a single generated dataset
pub fn log_generate_run(
    logger: &RunLogger,
    started_at: DateTime<Utc>,
    generator: &LinearRegression,
    seed: u64,
    data_file: &Path,
    truth_file: Option<&Path>,
) -> anyhow::Result<RunId> {
    let config = serde_json::json!({
        "data": generator,
        "seed": seed,
    });

    let mut artifacts = vec![artifact(ArtifactKind::Dataset, data_file)
        .with_metadata(serde_json::json!({"role": "data"}))];
    if let Some(path) = truth_file {
        artifacts.push(
            artifact(ArtifactKind::Dataset, path)
                .with_metadata(serde_json::json!({"role": "truth"})),
        );
    }

    logger.log_run_with_artifacts(
        RunKind::Generate,
        started_at,
        config,
        serde_json::json!({}),
        artifacts,
    )
}
