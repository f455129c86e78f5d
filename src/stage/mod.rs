pub mod runner;
pub mod types;

pub use runner::{
    ComparisonRequest, ProcessStages, ReferenceRequest, StageBackend, StageCommand, StageRun, parse_last_line, run_stage,
};
pub use types::{
    ComparisonOutput, RectangleSize, ReferenceOutput, ReportedViewport, StageError, StageKind, StageResult, TestResults,
    UploadSummary, Verdict,
};
