pub mod orchestrator;
pub mod types;

pub use orchestrator::{CarriedIdentity, Orchestrator};
pub use types::{
    BatchGroup, COMPARISON_BATCH_SUFFIX, CaseFailure, CaseOutcome, CaseState, CaseStatus, FailureKind,
    REFERENCE_BATCH_SUFFIX, RunBatches, RunReport, RunSettings,
};
