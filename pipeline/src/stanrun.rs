//! Stan execution
//!
//! This module provides functionality to:
//! - Detect cmdstan installation
//! - Compile Stan models
//! - Execute MCMC chains against a dataset
//! - Parse chain output into posterior draws
//!
//! The [`Sampler`] trait is the seam between the pipeline and the sampling
//! engine; [`CmdStanSampler`] drives CmdStan as a subprocess.

use crate::diagnostics::{read_cmdstan_csv, PosteriorDraws, DEFAULT_MAX_TREEDEPTH};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// A Stan model declared in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ModelEntry")]
pub struct ModelSpec {
    /// Short name used in output rows
    pub name: String,
    /// Path to the `.stan` file
    pub path: PathBuf,
}

/// Config form of a model: a bare path, or a path with an explicit name
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Path(PathBuf),
    Named { name: Option<String>, path: PathBuf },
}

impl From<ModelEntry> for ModelSpec {
    fn from(entry: ModelEntry) -> Self {
        match entry {
            ModelEntry::Path(path) => ModelSpec::from_path(path),
            ModelEntry::Named {
                name: Some(name),
                path,
            } => ModelSpec { name, path },
            ModelEntry::Named { name: None, path } => ModelSpec::from_path(path),
        }
    }
}

impl ModelSpec {
    /// Name the model after its file stem
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }

    pub fn file(&self) -> String {
        self.path.display().to_string()
    }
}

/// Configuration for Stan MCMC sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StanConfig {
    /// Number of chains to run
    pub num_chains: usize,
    /// Number of warmup iterations per chain
    pub num_warmup: usize,
    /// Number of sampling iterations per chain
    pub num_samples: usize,
    /// Adapt delta (target acceptance rate)
    pub adapt_delta: f64,
    /// Maximum tree depth
    pub max_treedepth: usize,
}

impl Default for StanConfig {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_warmup: 1000,
            num_samples: 1000,
            adapt_delta: 0.8,
            max_treedepth: DEFAULT_MAX_TREEDEPTH,
        }
    }
}

/// Fits a model to one dataset and returns posterior draws.
///
/// Implementations must be callable concurrently from several replicates.
pub trait Sampler: Send + Sync {
    /// One-time setup per model before any replicate runs
    fn prepare(&self, _model: &ModelSpec) -> Result<()> {
        Ok(())
    }

    /// Fit `model` to `data`. `workdir` is private to this call.
    fn sample(
        &self,
        model: &ModelSpec,
        data: &serde_json::Value,
        seed: u32,
        workdir: &Path,
    ) -> Result<PosteriorDraws>;
}

/// Detect cmdstan installation
pub fn detect_cmdstan() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CMDSTAN") {
        let cmdstan_path = PathBuf::from(&path);
        if cmdstan_path.exists() {
            return Ok(cmdstan_path);
        }
    }

    let home = dirs::home_dir().context("HOME not set")?;
    let common_paths = vec![
        home.join(".cmdstan"),
        home.join("cmdstan"),
        PathBuf::from("/usr/local/cmdstan"),
        PathBuf::from("/opt/cmdstan"),
    ];

    for cmdstan_path in common_paths {
        if cmdstan_path.exists() {
            // Find the most recent version
            if let Ok(entries) = fs::read_dir(&cmdstan_path) {
                let mut versions: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .collect();
                versions.sort_by_key(|e| e.path());
                if let Some(latest) = versions.last() {
                    return Ok(latest.path());
                }
            }
        }
    }

    bail!("cmdstan not found. Please set CMDSTAN environment variable or install cmdstan")
}

/// Path of the executable CmdStan builds for a model
pub fn executable_path(stan_file: &Path) -> PathBuf {
    if cfg!(windows) {
        stan_file.with_extension("exe")
    } else {
        stan_file.with_extension("")
    }
}

/// Compile a Stan model to executable, skipping the build when it is up to date
pub fn compile_stan_model(stan_file: &Path, cmdstan_path: &Path) -> Result<PathBuf> {
    let stan_file = stan_file
        .canonicalize()
        .with_context(|| format!("Stan file not found: {}", stan_file.display()))?;
    let model_name = stan_file
        .file_stem()
        .context("Invalid Stan file name")?
        .to_string_lossy()
        .to_string();

    let exe_path = executable_path(&stan_file);

    if exe_path.exists() {
        let stan_modified = fs::metadata(&stan_file)?.modified()?;
        let exe_modified = fs::metadata(&exe_path)?.modified()?;
        if exe_modified > stan_modified {
            debug!(model = %model_name, "executable up to date");
            return Ok(exe_path);
        }
    }

    info!(model = %model_name, "compiling Stan model");

    let output = Command::new("make")
        .current_dir(cmdstan_path)
        .arg(exe_path.to_string_lossy().to_string())
        .output()
        .context("Failed to execute make")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Stan compilation of {} failed:\n{}", model_name, stderr);
    }

    info!(model = %model_name, "compilation successful");
    Ok(exe_path)
}

/// Run MCMC sampling with a compiled model and parse the draws
pub fn run_stan_mcmc(
    exe_path: &Path,
    data_file: &Path,
    output_dir: &Path,
    config: &StanConfig,
    seed: u32,
) -> Result<PosteriorDraws> {
    fs::create_dir_all(output_dir).context("Failed to create output directory")?;

    let mut chain_files = Vec::with_capacity(config.num_chains);

    for chain_id in 1..=config.num_chains {
        let output_file = output_dir.join(format!("output_{}.csv", chain_id));

        debug!(chain = chain_id, chains = config.num_chains, "running chain");

        let output = Command::new(exe_path)
            .arg("sample")
            .arg(format!("num_warmup={}", config.num_warmup))
            .arg(format!("num_samples={}", config.num_samples))
            .arg("adapt")
            .arg(format!("delta={}", config.adapt_delta))
            .arg("algorithm=hmc")
            .arg("engine=nuts")
            .arg(format!("max_depth={}", config.max_treedepth))
            .arg("data")
            .arg(format!("file={}", data_file.display()))
            .arg("output")
            .arg(format!("file={}", output_file.display()))
            .arg("refresh=0")
            .arg("random")
            .arg(format!("seed={}", seed))
            .arg(format!("id={}", chain_id))
            .output()
            .context("Failed to execute Stan model")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Chain {} failed:\n{}", chain_id, stderr);
        }

        chain_files.push(output_file);
    }

    let chains = chain_files
        .iter()
        .map(|path| read_cmdstan_csv(path, config.max_treedepth))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PosteriorDraws::from_chains(chains)?)
}

/// [`Sampler`] backed by a local CmdStan installation
#[derive(Debug, Clone)]
pub struct CmdStanSampler {
    cmdstan_path: PathBuf,
    config: StanConfig,
}

impl CmdStanSampler {
    pub fn new(cmdstan_path: PathBuf, config: StanConfig) -> Self {
        Self {
            cmdstan_path,
            config,
        }
    }

    /// Locate CmdStan with [`detect_cmdstan`]
    pub fn detect(config: StanConfig) -> Result<Self> {
        Ok(Self::new(detect_cmdstan()?, config))
    }
}

impl Sampler for CmdStanSampler {
    fn prepare(&self, model: &ModelSpec) -> Result<()> {
        compile_stan_model(&model.path, &self.cmdstan_path)
            .with_context(|| format!("preparing model '{}'", model.name))?;
        Ok(())
    }

    fn sample(
        &self,
        model: &ModelSpec,
        data: &serde_json::Value,
        seed: u32,
        workdir: &Path,
    ) -> Result<PosteriorDraws> {
        fs::create_dir_all(workdir)
            .with_context(|| format!("Failed to create {}", workdir.display()))?;

        let data_file = workdir.join("data.json");
        fs::write(&data_file, serde_json::to_string(data)?)
            .with_context(|| format!("Failed to write {}", data_file.display()))?;

        let exe_path = executable_path(&model.path.canonicalize()?);
        if !exe_path.exists() {
            bail!(
                "model '{}' is not compiled; expected {}",
                model.name,
                exe_path.display()
            );
        }

        run_stan_mcmc(&exe_path, &data_file, workdir, &self.config, seed)
    }
}
