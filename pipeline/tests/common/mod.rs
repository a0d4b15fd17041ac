// Shared helpers for integration tests
//
// The samplers here stand in for CmdStan. For the linear regression
// generator (beta ~ N(0, 1), y ~ N(x * beta, 1)) the posterior of beta is
// Normal with precision 1 + sum(x^2) and mean sum(x * y) / precision, so
// exact draws give intervals with known calibration.

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use stansim::config::PipelineConfig;
use stansim::diagnostics::PosteriorDraws;
use stansim::stanrun::{ModelSpec, Sampler};
use std::path::{Path, PathBuf};

pub const CHAINS: usize = 4;
pub const DRAWS_PER_CHAIN: usize = 250;

fn vector(data: &serde_json::Value, key: &str) -> Result<Vec<f64>> {
    data[key]
        .as_array()
        .with_context(|| format!("data has no '{}' array", key))?
        .iter()
        .map(|v| v.as_f64().context("non-numeric data"))
        .collect()
}

/// Exact posterior mean and sd of beta
pub fn conjugate_posterior(data: &serde_json::Value) -> Result<(f64, f64)> {
    let x = vector(data, "x")?;
    let y = vector(data, "y")?;
    let precision = 1.0 + x.iter().map(|xi| xi * xi).sum::<f64>();
    let sxy: f64 = x.iter().zip(&y).map(|(xi, yi)| xi * yi).sum();
    Ok((sxy / precision, precision.recip().sqrt()))
}

/// Draws `beta` from the exact posterior, with its sd multiplied by `scale`.
/// `scale = 1.0` is calibrated; `scale < 1.0` is overconfident.
pub struct ConjugateSampler {
    pub scale: f64,
}

impl ConjugateSampler {
    pub fn exact() -> Self {
        Self { scale: 1.0 }
    }
}

impl Sampler for ConjugateSampler {
    fn sample(
        &self,
        _model: &ModelSpec,
        data: &serde_json::Value,
        seed: u32,
        _workdir: &Path,
    ) -> Result<PosteriorDraws> {
        let (mean, sd) = conjugate_posterior(data)?;
        let posterior = Normal::new(mean, sd * self.scale)?;
        let mut rng = ChaCha20Rng::seed_from_u64(u64::from(seed));

        let chains: Vec<Vec<f64>> = (0..CHAINS)
            .map(|_| (0..DRAWS_PER_CHAIN).map(|_| posterior.sample(&mut rng)).collect())
            .collect();
        Ok(PosteriorDraws::new(vec!["beta".to_string()], vec![chains])?)
    }
}

/// Dispatches on model name: `narrow` is overconfident, anything else exact
pub struct PerModelSampler;

impl Sampler for PerModelSampler {
    fn sample(
        &self,
        model: &ModelSpec,
        data: &serde_json::Value,
        seed: u32,
        workdir: &Path,
    ) -> Result<PosteriorDraws> {
        let scale = if model.name == "narrow" { 0.5 } else { 1.0 };
        ConjugateSampler { scale }.sample(model, data, seed, workdir)
    }
}

/// Fails whenever the first response is positive, about half the replicates
pub struct FlakySampler;

/// Whether [`FlakySampler`] rejects this dataset
pub fn flaky_rejects(y: &[f64]) -> bool {
    y.first().map_or(false, |&y0| y0 > 0.0)
}

impl Sampler for FlakySampler {
    fn sample(
        &self,
        model: &ModelSpec,
        data: &serde_json::Value,
        seed: u32,
        workdir: &Path,
    ) -> Result<PosteriorDraws> {
        if flaky_rejects(&vector(data, "y")?) {
            bail!("sampler crashed (seed {})", seed);
        }
        ConjugateSampler::exact().sample(model, data, seed, workdir)
    }
}

/// Fails every fit
pub struct BrokenSampler;

impl Sampler for BrokenSampler {
    fn sample(
        &self,
        _model: &ModelSpec,
        _data: &serde_json::Value,
        _seed: u32,
        _workdir: &Path,
    ) -> Result<PosteriorDraws> {
        bail!("no sampler available")
    }
}

pub fn model(name: &str) -> ModelSpec {
    ModelSpec {
        name: name.to_string(),
        path: PathBuf::from(format!("{}.stan", name)),
    }
}

/// Single-model config writing into `output_dir`
pub fn config(batches: usize, reps: usize, seed: u64, output_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        name: "integration".to_string(),
        batches,
        reps,
        seed,
        models: vec![model("linear")],
        output_dir: output_dir.to_path_buf(),
        ..PipelineConfig::default()
    }
}
