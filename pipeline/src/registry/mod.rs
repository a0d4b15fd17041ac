// Run registry: provenance for pipeline, coverage and generate runs
//
// Every CLI operation that produces files appends a RunRecord describing its
// configuration, headline metrics and the artifacts it wrote, so a coverage
// figure can always be traced back to the seed and models behind it.

pub mod logging;
pub mod storage;

pub use logging::{log_coverage_run, log_generate_run, log_pipeline_run, RunLogger};
pub use storage::Registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Core ID Types
// =============================================================================

/// Unique identifier for a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> anyhow::Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an artifact (output file)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Run Classification
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunKind {
    /// Full replicate pipeline (`stansim run`)
    Simulation,

    /// Coverage recomputed from an existing summary table
    Coverage,

    /// Single dataset written to disk
    Generate,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Simulation => "Simulation",
            RunKind::Coverage => "Coverage",
            RunKind::Generate => "Generate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Simulation" => Some(RunKind::Simulation),
            "Coverage" => Some(RunKind::Coverage),
            "Generate" => Some(RunKind::Generate),
            _ => None,
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Artifact Classification
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Per-replicate posterior summaries (CSV or JSON)
    SummaryTable,

    /// Coverage per (model, variable)
    CoverageReport,

    /// Replicates dropped under `error: continue`
    FailureReport,

    /// SBC rank histograms and uniformity tests
    SbcReport,

    /// Simulated dataset or its ground truth
    Dataset,
}

// =============================================================================
// Record Types
// =============================================================================

/// Metadata about an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Free-form metadata (JSON)
    pub metadata: serde_json::Value,
}

impl ArtifactRecord {
    pub fn new(kind: ArtifactKind, path: Option<String>) -> Self {
        Self {
            id: ArtifactId::new(),
            kind,
            path,
            created_at: Utc::now(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Complete record of a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    // =============================================================================
    // Context Information
    // =============================================================================
    /// Working directory of the run
    pub project_root: String,

    /// Pipeline name from the config
    pub pipeline: Option<String>,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    /// Whether git working directory was dirty
    pub git_dirty: bool,

    // =============================================================================
    // Run Data
    // =============================================================================
    /// Configuration as JSON
    pub config: serde_json::Value,

    /// Summary metrics as JSON (coverage, failures, elapsed time)
    pub metrics: serde_json::Value,

    /// Artifacts produced by this run
    pub artifacts: Vec<ArtifactId>,
}

impl RunRecord {
    pub fn new(kind: RunKind, project_root: String) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            kind,
            started_at: now,
            finished_at: now,
            project_root,
            pipeline: None,
            git_commit: None,
            git_dirty: false,
            config: serde_json::json!({}),
            metrics: serde_json::json!({}),
            artifacts: Vec::new(),
        }
    }

    pub fn with_pipeline(mut self, name: String) -> Self {
        self.pipeline = Some(name);
        self
    }

    pub fn with_git_info(mut self, commit: Option<String>, dirty: bool) -> Self {
        self.git_commit = commit;
        self.git_dirty = dirty;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactId>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn set_finished(&mut self) {
        self.finished_at = Utc::now();
    }
}

/// Default registry root (~/.stansim/registry)
pub fn default_registry_root() -> anyhow::Result<std::path::PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("no HOME directory found"))?;
    Ok(home.join(".stansim/registry"))
}
