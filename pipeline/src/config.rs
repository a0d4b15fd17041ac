//! Pipeline configuration.
//!
//! A pipeline is described by a JSON document; every field except `models`
//! has a default. Relative model paths resolve against the directory of the
//! config file.

use crate::datagen::LinearRegression;
use crate::diagnostics::{IntervalSpec, SbcConfig};
use crate::stanrun::{ModelSpec, StanConfig};
use crate::summary::{default_summaries, summary_columns, SummaryFn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when a replicate fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Abort the pipeline with the first failure
    #[default]
    Stop,
    /// Record the failure, drop the replicate and keep going
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Label recorded in the run registry
    pub name: String,
    pub batches: usize,
    /// Replicates per batch
    pub reps: usize,
    /// Base seed; each replicate derives its own
    pub seed: u64,
    pub models: Vec<ModelSpec>,
    /// Data generator settings
    pub data: LinearRegression,
    pub summaries: Vec<SummaryFn>,
    /// Restrict summaries to these variables (default: all model variables)
    pub variables: Option<Vec<String>>,
    /// Interval scored for coverage
    pub interval: IntervalSpec,
    pub sampler: StanConfig,
    pub error: ErrorMode,
    /// Worker threads (default: rayon's global pool)
    pub max_workers: Option<usize>,
    pub output_dir: PathBuf,
    /// Compute SBC rank statistics alongside coverage
    pub sbc: Option<SbcConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "stansim".to_string(),
            batches: 1,
            reps: 1,
            seed: 0,
            models: Vec::new(),
            data: LinearRegression::default(),
            summaries: default_summaries(),
            variables: None,
            interval: IntervalSpec::default(),
            sampler: StanConfig::default(),
            error: ErrorMode::default(),
            max_workers: None,
            output_dir: PathBuf::from("_stansim"),
            sbc: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load from a JSON file, resolving relative paths against its directory
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_json(&content)?;

        if let Some(base) = path.parent() {
            for model in &mut config.models {
                if model.path.is_relative() {
                    model.path = base.join(&model.path);
                }
            }
            if config.output_dir.is_relative() {
                config.output_dir = base.join(&config.output_dir);
            }
        }
        Ok(config)
    }

    /// Total number of replicates
    pub fn n_replicates(&self) -> usize {
        self.batches * self.reps
    }

    /// Ordered statistic columns produced by the summaries
    pub fn summary_columns(&self) -> Result<Vec<String>, ConfigError> {
        summary_columns(&self.summaries).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.batches == 0 || self.reps == 0 {
            return invalid(format!(
                "batches and reps must be positive (got {} x {})",
                self.batches, self.reps
            ));
        }
        if self.data.n == 0 {
            return invalid("data.n must be a positive integer".to_string());
        }
        if self.models.is_empty() {
            return invalid("at least one model is required".to_string());
        }

        let mut names = BTreeSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return invalid(format!("duplicate model name '{}'", model.name));
            }
        }

        let columns = self.summary_columns()?;
        for bound in [&self.interval.lower, &self.interval.upper] {
            if !columns.contains(bound) {
                return invalid(format!(
                    "interval column '{}' is not produced by the summaries ({})",
                    bound,
                    columns.join(", ")
                ));
            }
        }
        if self.interval.lower == self.interval.upper {
            return invalid("interval lower and upper columns must differ".to_string());
        }

        if self.max_workers == Some(0) {
            return invalid("max_workers must be positive".to_string());
        }
        if self.sampler.num_chains == 0 || self.sampler.num_samples == 0 {
            return invalid("sampler needs at least one chain and one sample".to_string());
        }
        if let Some(variables) = &self.variables {
            if variables.is_empty() {
                return invalid("variables filter is empty".to_string());
            }
            let mut seen = BTreeSet::new();
            for variable in variables {
                if !seen.insert(variable.as_str()) {
                    return invalid(format!("duplicate variable '{}' in filter", variable));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> PipelineConfig {
        PipelineConfig {
            models: vec![ModelSpec::from_path("linear.stan")],
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = PipelineConfig::from_json(r#"{"models": ["linear.stan"]}"#).unwrap();
        assert_eq!(config.batches, 1);
        assert_eq!(config.reps, 1);
        assert_eq!(config.data.n, 10);
        assert_eq!(config.interval, IntervalSpec::default());
        assert_eq!(config.error, ErrorMode::Stop);
        assert_eq!(config.models[0].name, "linear");
        config.validate().unwrap();
    }

    #[test]
    fn test_full_json() {
        let config = PipelineConfig::from_json(
            r#"{
                "name": "two_models",
                "batches": 5,
                "reps": 2,
                "seed": 7,
                "models": ["a.stan", {"name": "b", "path": "other.stan"}],
                "data": {"n": 25},
                "summaries": [{"kind": "mean"}, {"kind": "quantiles", "probs": [0.05, 0.95]}],
                "interval": {"lower": "q5", "upper": "q95"},
                "sampler": {"num_chains": 2, "num_samples": 500},
                "error": "continue",
                "max_workers": 2,
                "sbc": {"max_rank_draws": 50}
            }"#,
        )
        .unwrap();

        assert_eq!(config.n_replicates(), 10);
        assert_eq!(config.models[1].name, "b");
        assert_eq!(config.error, ErrorMode::Continue);
        assert_eq!(config.sbc.as_ref().unwrap().n_bins, 20);
        assert_eq!(config.summary_columns().unwrap(), vec!["mean", "q5", "q95"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_grid() {
        let mut config = minimal();
        config.reps = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.data.n = 0;
        assert!(config.validate().is_err());

        let config = PipelineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_models() {
        let mut config = minimal();
        config.models.push(ModelSpec::from_path("other/linear.stan"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model name 'linear'"));
    }

    #[test]
    fn test_validate_rejects_duplicate_variables() {
        let mut config = minimal();
        config.variables = Some(vec!["beta".to_string(), "beta".to_string()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate variable 'beta'"));

        config.variables = Some(vec!["beta".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_interval_columns() {
        let mut config = minimal();
        config.interval = IntervalSpec {
            lower: "q5".to_string(),
            upper: "q95".to_string(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'q5'"));
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"models": ["models/linear.stan"], "output_dir": "out"}"#).unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.models[0].path, dir.path().join("models/linear.stan"));
        assert_eq!(config.output_dir, dir.path().join("out"));
    }
}
