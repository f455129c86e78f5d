//! Figma Vision - visual regression runs between Figma designs and live pages.
//!
//! This crate provides:
//! - Test-plan reading with per-row normalization
//! - Deterministic baseline identities for design/page comparisons
//! - Subprocess stage execution with a last-line JSON result contract
//! - A sequential orchestrator that isolates per-row failures
//!
//! # Example
//!
//! ```rust,no_run
//! use figma_vision::{Config, Dataset, Orchestrator, ProcessStages, RunSettings};
//!
//! let config = Config::load("resources/configuration.json").unwrap();
//! let stages = ProcessStages::new(config.reference_stage.clone(), config.comparison_stage.clone());
//! let mut orchestrator = Orchestrator::new(RunSettings::from(&config), stages);
//!
//! let dataset = Dataset::open("resources/TestData.csv").unwrap();
//! let report = orchestrator.run(dataset.rows());
//! println!("{} done, {} failed", report.done_count(), report.failed_count());
//! ```

pub mod config;
pub mod dataset;
pub mod identity;
pub mod pipeline;
pub mod stage;

// Re-export configuration
pub use config::{Config, ConfigError, mask};

// Re-export test plan types
pub use dataset::{Dataset, DatasetError, DatasetRow, MatchLevel, RowError, TestCase};

// Re-export identity derivation
pub use identity::{BaselineIdentity, BoundingBox, ViewportError, ViewportRequest, ViewportSize};

// Re-export orchestration
pub use pipeline::{CaseOutcome, CaseStatus, Orchestrator, RunBatches, RunReport, RunSettings};

// Re-export stage execution
pub use stage::{ProcessStages, StageBackend, StageCommand, StageError, StageKind};
