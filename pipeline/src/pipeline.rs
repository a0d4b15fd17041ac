//! Replicated simulation and fitting.
//!
//! For each replicate in the static `batches x reps` grid:
//! generate data, fit every model, summarize the draws and join the ground
//! truth. Replicates are independent and run in parallel; coverage (and,
//! optionally, SBC ranks) are reduced once every replicate has finished.

use crate::config::{ConfigError, ErrorMode, PipelineConfig};
use crate::datagen::{replicate_seed, DataGenError, DataGenerator};
use crate::diagnostics::{
    analyze_sbc_results, compute_coverage, rank_replication, summarize_fit, CoverageError,
    CoverageStat, DiagnosticsError, SbcReplication, SbcResult,
};
use crate::stanrun::{ModelSpec, Sampler};
use crate::summary::{summarize_draws, SummaryError};
use crate::table::{join_truth, ReplicateId, SummaryRow, SummaryTable, TableError};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single replicate failed
#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("data generation failed: {0}")]
    DataGen(#[from] DataGenError),

    #[error("model fit failed: {0:#}")]
    Fit(anyhow::Error),

    #[error("summary failed: {0}")]
    Summary(#[from] SummaryError),

    #[error("ground-truth join failed: {0}")]
    Join(#[from] TableError),

    #[error("rank statistics failed: {0}")]
    Rank(#[from] DiagnosticsError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("preparing model '{model}' failed: {source:#}")]
    Prepare {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{replicate} (model {}) failed: {source}", .model.as_deref().unwrap_or("-"))]
    Replicate {
        replicate: ReplicateId,
        model: Option<String>,
        #[source]
        source: ReplicateError,
    },

    #[error("every replicate failed ({failed} failures); nothing to aggregate")]
    NoResults { failed: usize },

    #[error("coverage aggregation failed: {0}")]
    Coverage(#[from] CoverageError),

    #[error("SBC analysis failed: {0}")]
    Sbc(DiagnosticsError),

    #[error("cannot build worker pool: {0}")]
    ThreadPool(String),
}

/// A replicate dropped under [`ErrorMode::Continue`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateFailure {
    pub replicate: ReplicateId,
    /// Model being fitted when the replicate failed (`None` for data generation)
    pub model: Option<String>,
    pub error: String,
}

/// Everything a pipeline run produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub table: SummaryTable,
    pub coverage: Vec<CoverageStat>,
    pub failures: Vec<ReplicateFailure>,
    /// Fits flagged with convergence or sampling issues
    pub n_poor_fits: usize,
    pub sbc: Vec<SbcResult>,
}

/// Results of one successful replicate
struct ReplicateOutcome {
    id: ReplicateId,
    rows: Vec<SummaryRow>,
    ranks: Vec<SbcReplication>,
    n_poor_fits: usize,
}

struct ReplicateFault {
    replicate: ReplicateId,
    model: Option<String>,
    error: ReplicateError,
}

struct ReplicateContext<'a> {
    config: &'a PipelineConfig,
    generator: &'a dyn DataGenerator,
    sampler: &'a dyn Sampler,
}

/// Every replicate of the grid, in index order
pub fn replicate_ids(config: &PipelineConfig) -> Vec<ReplicateId> {
    let mut ids = Vec::with_capacity(config.n_replicates());
    for batch in 0..config.batches {
        for rep in 0..config.reps {
            let index = batch * config.reps + rep;
            ids.push(ReplicateId {
                batch,
                rep,
                index,
                seed: replicate_seed(config.seed, index),
            });
        }
    }
    ids
}

/// CmdStan takes a 32-bit seed
fn fit_seed(seed: u64) -> u32 {
    (seed ^ (seed >> 32)) as u32
}

fn fit_dir(config: &PipelineConfig, model: &ModelSpec, id: ReplicateId) -> PathBuf {
    config
        .output_dir
        .join("fits")
        .join(&model.name)
        .join(format!("rep_{:05}", id.index))
}

fn run_replicate(ctx: &ReplicateContext<'_>, id: ReplicateId) -> Result<ReplicateOutcome, ReplicateFault> {
    let config = ctx.config;
    let fault = |model: Option<&ModelSpec>, error: ReplicateError| ReplicateFault {
        replicate: id,
        model: model.map(|m| m.name.clone()),
        error,
    };

    let mut rng = ChaCha20Rng::seed_from_u64(id.seed);
    let dataset = ctx
        .generator
        .generate(&mut rng)
        .and_then(|d| d.validate().map(|_| d))
        .map_err(|e| fault(None, e.into()))?;
    let data = dataset.to_stan_data();

    // Truth for variables outside the summary filter has nothing to join to
    let truth: BTreeMap<String, f64> = match &config.variables {
        Some(selected) => dataset
            .true_params
            .iter()
            .filter(|(name, _)| selected.contains(*name))
            .map(|(name, &value)| (name.clone(), value))
            .collect(),
        None => dataset.true_params.clone(),
    };

    debug!(replicate = id.index, n = dataset.n, "generated dataset");

    let mut rows = Vec::new();
    let mut ranks = Vec::new();
    let mut n_poor_fits = 0;

    for model in &config.models {
        let workdir = fit_dir(config, model, id);
        let draws = ctx
            .sampler
            .sample(model, &data, fit_seed(id.seed), &workdir)
            .map_err(|e| fault(Some(model), ReplicateError::Fit(e)))?;

        let quality = summarize_fit(&draws);
        let q = &quality.overall_quality;
        if q.has_convergence_issues || q.has_sampling_issues {
            n_poor_fits += 1;
            warn!(
                replicate = id.index,
                model = %model.name,
                grade = %q.quality_grade,
                max_rhat = q.max_rhat,
                divergent = quality.n_divergent,
                "fit has convergence or sampling issues"
            );
        }

        let summaries = summarize_draws(&draws, &config.summaries, config.variables.as_deref())
            .map_err(|e| fault(Some(model), e.into()))?;
        let mut model_rows: Vec<SummaryRow> = summaries
            .into_iter()
            .map(|s| SummaryRow {
                variable: s.variable,
                stats: s.stats,
                truth: None,
                replicate: id,
                model: model.name.clone(),
                file: model.file(),
            })
            .collect();
        join_truth(&mut model_rows, &truth)
            .map_err(|e| fault(Some(model), e.into()))?;
        rows.extend(model_rows);

        if let Some(sbc) = &config.sbc {
            let rep = rank_replication(id.index, &model.name, &draws, &truth, sbc)
                .map_err(|e| fault(Some(model), e.into()))?;
            ranks.push(rep);
        }

        debug!(replicate = id.index, model = %model.name, "fit summarized");
    }

    Ok(ReplicateOutcome {
        id,
        rows,
        ranks,
        n_poor_fits,
    })
}

/// Run `job` on a dedicated pool when a worker cap is set
fn with_workers<T: Send>(
    max_workers: Option<usize>,
    job: impl FnOnce() -> T + Send,
) -> Result<T, PipelineError> {
    match max_workers {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;
            Ok(pool.install(job))
        }
        None => Ok(job()),
    }
}

/// Run the full replicate grid and aggregate coverage
pub fn run_pipeline(
    config: &PipelineConfig,
    generator: &dyn DataGenerator,
    sampler: &dyn Sampler,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let columns = config.summary_columns()?;
    let started = Instant::now();

    info!(
        name = %config.name,
        batches = config.batches,
        reps = config.reps,
        models = config.models.len(),
        "starting pipeline"
    );

    for model in &config.models {
        sampler
            .prepare(model)
            .map_err(|source| PipelineError::Prepare {
                model: model.name.clone(),
                source,
            })?;
    }

    let ids = replicate_ids(config);
    let ctx = ReplicateContext {
        config,
        generator,
        sampler,
    };

    let results: Vec<Result<ReplicateOutcome, ReplicateFault>> = match config.error {
        ErrorMode::Stop => {
            let outcomes = with_workers(config.max_workers, || {
                ids.par_iter()
                    .map(|&id| run_replicate(&ctx, id))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            let outcomes = outcomes.map_err(|fault| PipelineError::Replicate {
                replicate: fault.replicate,
                model: fault.model,
                source: fault.error,
            })?;
            outcomes.into_iter().map(Ok).collect()
        }
        ErrorMode::Continue => with_workers(config.max_workers, || {
            ids.par_iter()
                .map(|&id| run_replicate(&ctx, id))
                .collect::<Vec<_>>()
        })?,
    };

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(fault) => {
                warn!(
                    replicate = fault.replicate.index,
                    model = fault.model.as_deref().unwrap_or("-"),
                    error = %fault.error,
                    "replicate dropped"
                );
                failures.push(ReplicateFailure {
                    replicate: fault.replicate,
                    model: fault.model,
                    error: fault.error.to_string(),
                });
            }
        }
    }
    outcomes.sort_by_key(|o| o.id.index);
    failures.sort_by_key(|f| f.replicate.index);

    if outcomes.is_empty() {
        return Err(PipelineError::NoResults {
            failed: failures.len(),
        });
    }

    let mut table = SummaryTable::new(columns);
    let mut n_poor_fits = 0;
    let mut ranks = Vec::new();
    for outcome in outcomes {
        table.extend(outcome.rows);
        ranks.extend(outcome.ranks);
        n_poor_fits += outcome.n_poor_fits;
    }
    table.sort();

    let coverage = compute_coverage(&table.rows, &config.interval)?;

    let mut sbc = Vec::new();
    if let Some(sbc_config) = &config.sbc {
        for model in &config.models {
            let mut replications: Vec<SbcReplication> = ranks
                .iter()
                .filter(|r| r.model == model.name)
                .cloned()
                .collect();
            replications.extend(failures.iter().map(|f| {
                SbcReplication::failed(f.replicate.index, &model.name, f.error.clone())
            }));
            replications.sort_by_key(|r| r.sim_id);
            sbc.push(
                analyze_sbc_results(&model.name, replications, sbc_config.clone())
                    .map_err(PipelineError::Sbc)?,
            );
        }
    }

    info!(
        rows = table.len(),
        failed = failures.len(),
        poor_fits = n_poor_fits,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "pipeline finished"
    );

    Ok(PipelineOutput {
        table,
        coverage,
        failures,
        n_poor_fits,
        sbc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::LinearRegression;
    use crate::diagnostics::PosteriorDraws;
    use std::path::Path;

    /// Returns draws centred on zero regardless of the data
    struct FixedSampler;

    impl Sampler for FixedSampler {
        fn sample(
            &self,
            _model: &ModelSpec,
            _data: &serde_json::Value,
            _seed: u32,
            _workdir: &Path,
        ) -> anyhow::Result<PosteriorDraws> {
            let draws: Vec<f64> = (0..200).map(|i| (i as f64 - 99.5) / 50.0).collect();
            Ok(PosteriorDraws::new(
                vec!["beta".to_string()],
                vec![vec![draws[..100].to_vec(), draws[100..].to_vec()]],
            )?)
        }
    }

    fn config(batches: usize, reps: usize) -> PipelineConfig {
        PipelineConfig {
            batches,
            reps,
            seed: 11,
            models: vec![ModelSpec::from_path("linear.stan")],
            output_dir: std::env::temp_dir().join("stansim-unit"),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_replicate_ids_grid() {
        let ids = replicate_ids(&config(3, 2));
        assert_eq!(ids.len(), 6);
        assert_eq!((ids[3].batch, ids[3].rep, ids[3].index), (1, 1, 3));
        assert_eq!(ids[3].seed, replicate_seed(11, 3));
    }

    #[test]
    fn test_fixed_sampler_pipeline() {
        let out = run_pipeline(&config(2, 5), &LinearRegression::default(), &FixedSampler).unwrap();

        assert_eq!(out.table.len(), 10);
        assert_eq!(out.coverage.len(), 1);
        assert_eq!(out.coverage[0].n_reps, 10);
        assert!(out.failures.is_empty());
        assert!(out.table.rows.iter().all(|r| r.truth.is_some()));
    }

    #[test]
    fn test_variable_filter_limits_truth_join() {
        let mut cfg = config(1, 3);
        cfg.variables = Some(vec!["beta".to_string()]);
        let out = run_pipeline(&cfg, &LinearRegression::default(), &FixedSampler).unwrap();
        assert_eq!(out.table.len(), 3);
    }

    #[test]
    fn test_invalid_config_rejected_before_running() {
        let mut cfg = config(1, 1);
        cfg.models.clear();
        assert!(matches!(
            run_pipeline(&cfg, &LinearRegression::default(), &FixedSampler),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_fit_seed_fits_u32() {
        assert_eq!(fit_seed(0), 0);
        assert_eq!(fit_seed(1 << 32), 1);
    }
}
