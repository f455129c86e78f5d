use chrono::Utc;
use uuid::Uuid;

use crate::dataset::{DatasetRow, TestCase};
use crate::identity::{BaselineIdentity, UNNAMED_NODE, UNNAMED_PROJECT, ViewportRequest, ViewportSize};
use crate::pipeline::types::{
    CaseFailure, CaseOutcome, CaseState, CaseStatus, FailureKind, RunBatches, RunReport, RunSettings,
};
use crate::stage::{
    ComparisonRequest, ReferenceOutput, ReferenceRequest, StageBackend, StageError, StageKind,
};

/// Identity fields carried from the reference stage into the comparison stage
#[derive(Debug, Clone, PartialEq)]
pub struct CarriedIdentity {
    pub app_name: String,
    pub test_name: String,
    pub viewport: ViewportSize,
    pub baseline: BaselineIdentity,
}

impl CarriedIdentity {
    /// Extract identity fields from a reference result.
    ///
    /// The baseline key is re-derived locally. A key reported by the stage
    /// wins over the derived one, since the reference was uploaded under it.
    pub fn from_reference(output: &ReferenceOutput) -> Result<Self, StageError> {
        let viewport = output
            .view_port_size
            .resolve()
            .map_err(|e| StageError::Contract {
                stage: StageKind::Reference,
                reason: e.to_string(),
            })?;

        let derived =
            BaselineIdentity::for_viewport(output.app_name.as_deref(), output.test_name.as_deref(), viewport);
        let baseline = match output.baseline_env_name.as_deref().map(str::trim) {
            Some(reported) if !reported.is_empty() => {
                if !derived.agrees_with(reported) {
                    tracing::warn!(
                        reported,
                        derived = %derived,
                        "reference stage reported a different baseline key, keeping the reported one"
                    );
                }
                BaselineIdentity::from_reported(reported)
            }
            _ => derived,
        };

        Ok(Self {
            app_name: output.app_name.clone().unwrap_or_else(|| UNNAMED_PROJECT.to_string()),
            test_name: output.test_name.clone().unwrap_or_else(|| UNNAMED_NODE.to_string()),
            viewport,
            baseline,
        })
    }
}

/// Drives every row of a test plan through the reference and comparison stages.
///
/// Cases run strictly one after another. A failing case is recorded and the
/// run moves on to the next row.
pub struct Orchestrator<B: StageBackend> {
    settings: RunSettings,
    backend: B,
}

impl<B: StageBackend> Orchestrator<B> {
    pub fn new(settings: RunSettings, backend: B) -> Self {
        Self { settings, backend }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Run all rows with freshly generated batch ids
    pub fn run<I>(&mut self, rows: I) -> RunReport
    where
        I: IntoIterator<Item = DatasetRow>,
    {
        self.run_with_batches(rows, RunBatches::generate())
    }

    /// Run all rows under the given batch groups
    pub fn run_with_batches<I>(&mut self, rows: I, batches: RunBatches) -> RunReport
    where
        I: IntoIterator<Item = DatasetRow>,
    {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(
            %run_id,
            reference_batch = %batches.reference.id,
            comparison_batch = %batches.comparison.id,
            "starting run"
        );

        let mut outcomes = Vec::new();
        for DatasetRow { row, case } in rows {
            let outcome = match case {
                Ok(case) => self.run_case(row, case, &batches),
                Err(err) => {
                    tracing::error!(row, "skipping unreadable row: {}", err.reason);
                    CaseOutcome {
                        row,
                        case: None,
                        identity: None,
                        viewport: None,
                        outcome: CaseStatus::Failed(CaseFailure::new(FailureKind::InvalidRow, err.reason)),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            batches,
            outcomes,
        };
        tracing::info!(
            done = report.done_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            "run finished"
        );
        report
    }

    /// Process one case to completion or failure
    pub fn run_case(&mut self, row: usize, case: TestCase, batches: &RunBatches) -> CaseOutcome {
        let span = tracing::info_span!("case", row, file_key = %case.file_key, node_id = %case.node_id);
        let _enter = span.enter();

        tracing::info!(
            app_url = %case.app_url,
            viewport = %case.viewport,
            skip = case.skip,
            "processing row"
        );

        let mut outcome = CaseOutcome {
            row,
            case: None,
            identity: None,
            viewport: None,
            outcome: CaseStatus::Skipped,
        };

        if case.skip {
            tracing::info!("skipping row as configured");
            outcome.case = Some(case);
            return outcome;
        }

        let mut state = CaseState::Pending;
        let result = self.drive(&case, batches, &mut state, &mut outcome);
        match result {
            Ok(status) => {
                transition(&mut state, CaseState::Done);
                outcome.outcome = status;
            }
            Err(failure) => {
                transition(&mut state, CaseState::Failed);
                tracing::error!(kind = ?failure.kind, "case failed: {}", failure.message);
                if let Some(stderr) = &failure.stderr {
                    tracing::error!("stage stderr:\n{}", stderr.trim_end());
                }
                outcome.outcome = CaseStatus::Failed(failure);
            }
        }
        outcome.case = Some(case);
        outcome
    }

    fn drive(
        &mut self,
        case: &TestCase,
        batches: &RunBatches,
        state: &mut CaseState,
        outcome: &mut CaseOutcome,
    ) -> Result<CaseStatus, CaseFailure> {
        transition(state, CaseState::ReferenceRunning);

        let viewport = ViewportRequest::parse(&case.viewport).map_err(|e| CaseFailure {
            kind: FailureKind::Configuration,
            stage: Some(StageKind::Reference),
            message: e.to_string(),
            stderr: None,
        })?;

        let reference_request = ReferenceRequest {
            figma_token: self.settings.figma_token.clone(),
            file_key: case.file_key.clone(),
            node_id: case.node_id.clone(),
            server_url: self.settings.server_url.clone(),
            api_key: self.settings.api_key.clone(),
            batch_name_suffix: batches.reference.name_suffix.clone(),
            batch_id: batches.reference.id.clone(),
            viewport_token: viewport.token(),
        };
        let reference = self
            .backend
            .run_reference(&reference_request)
            .map_err(|e| CaseFailure::from(&e))?;

        let carried = CarriedIdentity::from_reference(&reference).map_err(|e| CaseFailure::from(&e))?;
        let reference_url = reference
            .upload_from_figma_results
            .as_ref()
            .and_then(|u| u.url.clone());
        tracing::info!(
            app_name = %carried.app_name,
            test_name = %carried.test_name,
            viewport = %carried.viewport,
            baseline = %carried.baseline,
            reference_url = reference_url.as_deref().unwrap_or("-"),
            batch = %batches.reference.name_for(&carried.app_name),
            "reference stage finished"
        );
        outcome.identity = Some(carried.baseline.clone());
        outcome.viewport = Some(carried.viewport);

        transition(state, CaseState::ComparisonRunning);

        let comparison_request = ComparisonRequest {
            app_name: carried.app_name,
            test_name: carried.test_name,
            api_key: self.settings.api_key.clone(),
            viewport: carried.viewport,
            baseline: carried.baseline,
            app_url: case.app_url.clone(),
            batch_name_suffix: batches.comparison.name_suffix.clone(),
            batch_id: batches.comparison.id.clone(),
            headless: self.settings.headless,
            ignore_displacement: case.ignore_displacement,
            match_level: case.match_level.to_string(),
        };
        let comparison = self
            .backend
            .run_comparison(&comparison_request)
            .map_err(|e| CaseFailure::from(&e))?;

        tracing::info!(
            verdict = %comparison.status.verdict(),
            is_new = comparison.status.is_new,
            is_different = comparison.status.is_different,
            url = comparison.status.url.as_deref().unwrap_or("-"),
            batch = %batches.comparison.name_for(&comparison_request.app_name),
            "comparison stage finished"
        );

        Ok(CaseStatus::Done {
            reference_url,
            result: Box::new(comparison),
        })
    }
}

fn transition(state: &mut CaseState, next: CaseState) {
    debug_assert!(state.can_transition_to(next), "invalid case transition {} -> {}", state, next);
    tracing::debug!(from = %state, to = %next, "case state");
    *state = next;
}
