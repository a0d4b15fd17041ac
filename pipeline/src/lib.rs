//! stansim: simulation-based coverage checks for Stan models.
//!
//! This crate simulates datasets with known parameters, fits Stan models to
//! each replicate through CmdStan, summarizes the posterior draws and reports
//! how often credible intervals contain the simulated truth.

pub mod config;
pub mod datagen;
pub mod diagnostics;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod stanrun;
pub mod summary;
pub mod table;

pub use config::{ErrorMode, PipelineConfig};
pub use pipeline::{run_pipeline, PipelineError, PipelineOutput, ReplicateFailure};
