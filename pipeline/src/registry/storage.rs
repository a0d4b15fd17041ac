// Append-only JSONL storage for run and artifact records

use super::{ArtifactId, ArtifactKind, ArtifactRecord, RunId, RunKind, RunRecord};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Registry storage backed by JSONL files
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    runs_path: PathBuf,
    artifacts_path: PathBuf,
}

/// Append one record as a single JSON line
fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    file.flush()?;
    Ok(())
}

/// Read every parseable record; malformed lines are logged and skipped
fn read_jsonl<T: DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut records = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                file = %path.display(),
                line = line_num + 1,
                error = %e,
                "skipping malformed {} record",
                what
            ),
        }
    }
    Ok(records)
}

impl Registry {
    /// Open the registry at the default location (~/.stansim/registry)
    pub fn new_default() -> anyhow::Result<Self> {
        Self::new(super::default_registry_root()?)
    }

    /// Open (creating if needed) a registry rooted at `root`
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("cannot create registry at {}", root.display()))?;
        let runs_path = root.join("runs.jsonl");
        let artifacts_path = root.join("artifacts.jsonl");
        Ok(Self {
            root,
            runs_path,
            artifacts_path,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        append_jsonl(&self.runs_path, run)
    }

    pub fn log_artifact(&self, artifact: &ArtifactRecord) -> anyhow::Result<()> {
        append_jsonl(&self.artifacts_path, artifact)
    }

    pub fn load_runs(&self) -> anyhow::Result<Vec<RunRecord>> {
        read_jsonl(&self.runs_path, "run")
    }

    pub fn load_artifacts(&self) -> anyhow::Result<Vec<ArtifactRecord>> {
        read_jsonl(&self.artifacts_path, "artifact")
    }

    pub fn find_run(&self, id: RunId) -> anyhow::Result<Option<RunRecord>> {
        Ok(self.load_runs()?.into_iter().find(|r| r.id == id))
    }

    pub fn find_artifact(&self, id: ArtifactId) -> anyhow::Result<Option<ArtifactRecord>> {
        Ok(self.load_artifacts()?.into_iter().find(|a| a.id == id))
    }

    pub fn find_runs_by_kind(&self, kind: RunKind) -> anyhow::Result<Vec<RunRecord>> {
        Ok(self
            .load_runs()?
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect())
    }

    pub fn find_artifacts_by_kind(&self, kind: ArtifactKind) -> anyhow::Result<Vec<ArtifactRecord>> {
        Ok(self
            .load_artifacts()?
            .into_iter()
            .filter(|a| a.kind == kind)
            .collect())
    }

    /// Most recent `n` runs, newest first
    pub fn recent_runs(&self, n: usize) -> anyhow::Result<Vec<RunRecord>> {
        let mut runs = self.load_runs()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(n);
        Ok(runs)
    }

    pub fn count_runs(&self) -> anyhow::Result<usize> {
        Ok(self.load_runs()?.len())
    }

    pub fn count_artifacts(&self) -> anyhow::Result<usize> {
        Ok(self.load_artifacts()?.len())
    }
}
