//! Synthetic dataset generation for simulation-based calibration.
//!
//! Each replicate is a dataset drawn from a known generative process together
//! with the ground-truth parameter values that produced it. The ground truth
//! never reaches the model; it is joined onto the posterior summaries later.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while generating or exporting a replicate
#[derive(Debug, Error)]
pub enum DataGenError {
    #[error("sample size must be a positive integer, got {0}")]
    InvalidSampleSize(usize),

    #[error("dataset shape mismatch: n = {n}, len(x) = {x_len}, len(y) = {y_len}")]
    ShapeMismatch {
        n: usize,
        x_len: usize,
        y_len: usize,
    },

    #[error("invalid distribution parameters: {0}")]
    Distribution(String),

    #[error("failed to write dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize dataset: {0}")]
    Json(#[from] serde_json::Error),
}

/// One simulated dataset with the parameters that generated it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDataset {
    /// Number of observations
    pub n: usize,
    /// Covariate vector
    pub x: Vec<f64>,
    /// Response vector
    pub y: Vec<f64>,
    /// Ground-truth values keyed by the model's variable names
    pub true_params: BTreeMap<String, f64>,
}

impl SimulatedDataset {
    /// Check that `x`, `y` and `n` agree
    pub fn validate(&self) -> Result<(), DataGenError> {
        if self.n == 0 {
            return Err(DataGenError::InvalidSampleSize(self.n));
        }
        if self.x.len() != self.n || self.y.len() != self.n {
            return Err(DataGenError::ShapeMismatch {
                n: self.n,
                x_len: self.x.len(),
                y_len: self.y.len(),
            });
        }
        Ok(())
    }

    /// Data block handed to the sampler. Ground truth is deliberately absent.
    pub fn to_stan_data(&self) -> serde_json::Value {
        json!({
            "n": self.n,
            "x": self.x,
            "y": self.y,
        })
    }
}

/// Source of simulated replicates.
///
/// Implementations must draw all randomness from `rng` so that a replicate is
/// fully determined by its seed.
pub trait DataGenerator: Send + Sync {
    fn generate(&self, rng: &mut ChaCha20Rng) -> Result<SimulatedDataset, DataGenError>;
}

/// Simple linear regression with unit noise:
///
/// ```text
/// beta ~ Normal(0, 1)
/// x    = n evenly spaced points on [-1, 1]
/// y_i  ~ Normal(x_i * beta, 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearRegression {
    pub n: usize,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self { n: 10 }
    }
}

impl DataGenerator for LinearRegression {
    fn generate(&self, rng: &mut ChaCha20Rng) -> Result<SimulatedDataset, DataGenError> {
        if self.n == 0 {
            return Err(DataGenError::InvalidSampleSize(self.n));
        }

        let prior =
            Normal::new(0.0, 1.0).map_err(|e| DataGenError::Distribution(e.to_string()))?;
        let beta = prior.sample(rng);

        let x = evenly_spaced(-1.0, 1.0, self.n);
        let mut y = Vec::with_capacity(self.n);
        for &xi in &x {
            let noise =
                Normal::new(xi * beta, 1.0).map_err(|e| DataGenError::Distribution(e.to_string()))?;
            y.push(noise.sample(rng));
        }

        let mut true_params = BTreeMap::new();
        true_params.insert("beta".to_string(), beta);

        Ok(SimulatedDataset {
            n: self.n,
            x,
            y,
            true_params,
        })
    }
}

/// `n` evenly spaced points from `from` to `to` inclusive; a single point sits at `from`
fn evenly_spaced(from: f64, to: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![from],
        _ => {
            let step = (to - from) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { to } else { from + step * i as f64 })
                .collect()
        }
    }
}

/// SplitMix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for the replicate at global `index`.
///
/// Depends only on `(base, index)`, so a replicate draws the same data no
/// matter which worker runs it or in what order.
pub fn replicate_seed(base: u64, index: usize) -> u64 {
    mix64(base ^ mix64(index as u64))
}

/// RNG for one replicate
pub fn replicate_rng(base: u64, index: usize) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(replicate_seed(base, index))
}

/// Write the sampler-facing data block as Stan JSON
pub fn write_stan_json(path: &Path, dataset: &SimulatedDataset) -> Result<(), DataGenError> {
    dataset.validate()?;
    let content = serde_json::to_string_pretty(&dataset.to_stan_data())?;
    fs::write(path, content)?;
    Ok(())
}

/// Write the ground-truth parameters as a flat JSON object
pub fn write_truth_json(path: &Path, dataset: &SimulatedDataset) -> Result<(), DataGenError> {
    let content = serde_json::to_string_pretty(&dataset.true_params)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_reproducible() {
        let gen = LinearRegression { n: 25 };
        let a = gen.generate(&mut replicate_rng(42, 3)).unwrap();
        let b = gen.generate(&mut replicate_rng(42, 3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_replicates_are_independent() {
        let gen = LinearRegression { n: 5 };
        let a = gen.generate(&mut replicate_rng(42, 0)).unwrap();
        let b = gen.generate(&mut replicate_rng(42, 1)).unwrap();
        assert_ne!(a.true_params["beta"], b.true_params["beta"]);
        assert_ne!(replicate_seed(42, 0), replicate_seed(43, 0));
    }

    #[test]
    fn test_linear_regression_shape() {
        let data = LinearRegression { n: 10 }
            .generate(&mut replicate_rng(7, 0))
            .unwrap();

        assert_eq!(data.n, 10);
        assert_eq!(data.x.len(), 10);
        assert_eq!(data.y.len(), 10);
        assert_eq!(data.x[0], -1.0);
        assert_eq!(data.x[9], 1.0);
        assert!(data.true_params.contains_key("beta"));
        data.validate().unwrap();
    }

    #[test]
    fn test_single_observation() {
        let data = LinearRegression { n: 1 }
            .generate(&mut replicate_rng(7, 0))
            .unwrap();
        assert_eq!(data.x, vec![-1.0]);
    }

    #[test]
    fn test_zero_sample_size_rejected() {
        let err = LinearRegression { n: 0 }
            .generate(&mut replicate_rng(7, 0))
            .unwrap_err();
        assert!(matches!(err, DataGenError::InvalidSampleSize(0)));
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let data = SimulatedDataset {
            n: 3,
            x: vec![0.0, 1.0, 2.0],
            y: vec![0.0],
            true_params: BTreeMap::new(),
        };
        assert!(matches!(
            data.validate(),
            Err(DataGenError::ShapeMismatch { y_len: 1, .. })
        ));
    }

    #[test]
    fn test_stan_data_hides_truth() {
        let data = LinearRegression { n: 4 }
            .generate(&mut replicate_rng(1, 0))
            .unwrap();
        let stan = data.to_stan_data();

        assert_eq!(stan["n"], 4);
        assert_eq!(stan["x"].as_array().unwrap().len(), 4);
        assert!(stan.get("beta").is_none());
        assert!(stan.get("true_params").is_none());
    }

    #[test]
    fn test_write_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = LinearRegression { n: 3 }
            .generate(&mut replicate_rng(1, 0))
            .unwrap();

        let data_path = dir.path().join("data.json");
        let truth_path = dir.path().join("truth.json");
        write_stan_json(&data_path, &data).unwrap();
        write_truth_json(&truth_path, &data).unwrap();

        let truth: BTreeMap<String, f64> =
            serde_json::from_str(&fs::read_to_string(&truth_path).unwrap()).unwrap();
        assert_eq!(truth, data.true_params);
    }
}
