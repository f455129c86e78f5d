use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::{Config, mask};
use crate::dataset::TestCase;
use crate::identity::{BaselineIdentity, ViewportSize};
use crate::stage::{ComparisonOutput, StageError, StageKind, Verdict};

/// Batch-name suffix for design reference uploads
pub const REFERENCE_BATCH_SUFFIX: &str = " - Check with Figma";

/// Batch-name suffix for live-page comparisons
pub const COMPARISON_BATCH_SUFFIX: &str = " - Check against Figma";

/// Settings the orchestrator passes to every stage
#[derive(Clone)]
pub struct RunSettings {
    /// Design-source access token
    pub figma_token: String,
    /// Visual-testing backend endpoint
    pub server_url: String,
    /// Visual-testing backend credential
    pub api_key: String,
    /// Browser headless mode
    pub headless: bool,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            figma_token: config.figma_token.clone(),
            server_url: config.server_url.clone(),
            api_key: config.api_key.clone(),
            headless: config.headless,
        }
    }
}

impl fmt::Debug for RunSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSettings")
            .field("figma_token", &mask(Some(&self.figma_token)))
            .field("server_url", &self.server_url)
            .field("api_key", &mask(Some(&self.api_key)))
            .field("headless", &self.headless)
            .finish()
    }
}

/// A named, id-tagged grouping of stage invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchGroup {
    /// Appended to the app name to form the batch name
    pub name_suffix: String,
    /// Run-scoped unique id
    pub id: String,
}

impl BatchGroup {
    pub fn new(name_suffix: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name_suffix: name_suffix.into(),
            id: id.into(),
        }
    }

    /// Batch name as shown in the backend's reporting UI
    pub fn name_for(&self, app_name: &str) -> String {
        format!("{}{}", app_name, self.name_suffix)
    }
}

/// The two batch groups shared by every case of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBatches {
    pub reference: BatchGroup,
    pub comparison: BatchGroup,
}

impl RunBatches {
    /// Fresh ids for a new run
    pub fn generate() -> Self {
        Self {
            reference: BatchGroup::new(REFERENCE_BATCH_SUFFIX, Uuid::new_v4().to_string()),
            comparison: BatchGroup::new(COMPARISON_BATCH_SUFFIX, Uuid::new_v4().to_string()),
        }
    }
}

/// Lifecycle of one case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    ReferenceRunning,
    ComparisonRunning,
    Done,
    Failed,
}

impl CaseState {
    pub fn can_transition_to(self, next: CaseState) -> bool {
        use CaseState::*;
        matches!(
            (self, next),
            (Pending, ReferenceRunning)
                | (ReferenceRunning, ComparisonRunning)
                | (ComparisonRunning, Done)
                | (ReferenceRunning, Failed)
                | (ComparisonRunning, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CaseState::Done | CaseState::Failed)
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaseState::Pending => "pending",
            CaseState::ReferenceRunning => "reference_running",
            CaseState::ComparisonRunning => "comparison_running",
            CaseState::Done => "done",
            CaseState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a case failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The row itself could not be read
    InvalidRow,
    /// Malformed per-case configuration such as the viewport token
    Configuration,
    /// The stage could not start or exited non-zero
    StageProcess,
    /// The stage printed no result or an unparseable one
    ResultParse,
    /// The stage result is missing data the next step needs
    Contract,
}

/// Failure record of a case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub kind: FailureKind,
    pub stage: Option<StageKind>,
    pub message: String,
    pub stderr: Option<String>,
}

impl CaseFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
            stderr: None,
        }
    }
}

impl From<&StageError> for CaseFailure {
    fn from(err: &StageError) -> Self {
        let kind = match err {
            StageError::Spawn { .. } | StageError::Exited { .. } => FailureKind::StageProcess,
            StageError::NoOutput { .. } | StageError::Parse { .. } => FailureKind::ResultParse,
            StageError::Contract { .. } => FailureKind::Contract,
        };
        Self {
            kind,
            stage: Some(err.stage()),
            message: err.to_string(),
            stderr: err.stderr().map(str::to_string).filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Final status of a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    Skipped,
    Done {
        reference_url: Option<String>,
        result: Box<ComparisonOutput>,
    },
    Failed(CaseFailure),
}

/// Per-row outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    /// 1-based row in the test plan
    pub row: usize,
    /// The parsed case (absent when the row was unreadable)
    pub case: Option<TestCase>,
    /// Baseline key carried into the comparison stage
    pub identity: Option<BaselineIdentity>,
    /// Viewport resolved by the reference stage
    pub viewport: Option<ViewportSize>,
    pub outcome: CaseStatus,
}

impl CaseOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, CaseStatus::Done { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CaseStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, CaseStatus::Skipped)
    }

    pub fn failure(&self) -> Option<&CaseFailure> {
        match &self.outcome {
            CaseStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&ComparisonOutput> {
        match &self.outcome {
            CaseStatus::Done { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Backend verdict of a completed comparison
    pub fn verdict(&self) -> Option<Verdict> {
        self.result().map(|r| r.status.verdict())
    }
}

/// Result of a complete run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: RunBatches,
    pub outcomes: Vec<CaseOutcome>,
}

impl RunReport {
    pub fn done_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }

    /// A run succeeds when any case completed, or when nothing failed.
    pub fn succeeded(&self) -> bool {
        self.done_count() > 0 || self.failed_count() == 0
    }
}
