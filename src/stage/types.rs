// Core types for stage invocations and their structured results

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::identity::{BoundingBox, ViewportSize, ViewportError};

/// The two stage families of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Design-reference acquisition and upload
    Reference,
    /// Live-render capture and comparison
    Comparison,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Reference => "reference",
            StageKind::Comparison => "comparison",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result type for stage operations
pub type StageResult<T> = Result<T, StageError>;

/// Failure of one stage invocation
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The stage process could not be started
    #[error("{stage} stage could not be started ({program}): {source}")]
    Spawn {
        stage: StageKind,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The stage exited with a non-zero status
    #[error("{stage} stage exited with {}", describe_exit(.code))]
    Exited {
        stage: StageKind,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The stage succeeded but printed nothing
    #[error("{stage} stage produced no output line")]
    NoOutput { stage: StageKind, stderr: String },

    /// The final output line is not a valid result object
    #[error("{stage} stage result could not be parsed: {source}")]
    Parse {
        stage: StageKind,
        line: String,
        stderr: String,
        #[source]
        source: serde_json::Error,
    },

    /// The result parsed but is unusable downstream
    #[error("{stage} stage returned an unusable result: {reason}")]
    Contract { stage: StageKind, reason: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl StageError {
    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Spawn { stage, .. }
            | StageError::Exited { stage, .. }
            | StageError::NoOutput { stage, .. }
            | StageError::Parse { stage, .. }
            | StageError::Contract { stage, .. } => *stage,
        }
    }

    /// Captured diagnostic stream, if the process ran
    pub fn stderr(&self) -> Option<&str> {
        match self {
            StageError::Exited { stderr, .. }
            | StageError::NoOutput { stderr, .. }
            | StageError::Parse { stderr, .. } => Some(stderr.as_str()),
            StageError::Spawn { .. } | StageError::Contract { .. } => None,
        }
    }

    /// Whether the failure is a result-parse failure rather than a process failure
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, StageError::NoOutput { .. } | StageError::Parse { .. })
    }
}

/// A viewport as reported by a stage; `USE_SOURCE` runs report the raw
/// bounding box, so dimensions may be fractional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedViewport {
    pub width: f64,
    pub height: f64,
}

impl ReportedViewport {
    pub fn resolve(&self) -> Result<ViewportSize, ViewportError> {
        ViewportSize::from_bounding_box(BoundingBox {
            width: self.width,
            height: self.height,
        })
    }
}

/// Host display size reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectangleSize {
    pub width: u32,
    pub height: u32,
}

/// Visual-testing backend results for one test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResults {
    pub name: Option<String>,
    pub app_name: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_new: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_different: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_aborted: bool,
    #[serde(deserialize_with = "lenient")]
    pub host_display_size: Option<RectangleSize>,
    #[serde(deserialize_with = "null_as_default")]
    pub matches: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub mismatches: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub missing: u32,
}

/// Classification of a backend status string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Unresolved,
    Failed,
    Unknown(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => f.write_str("passed"),
            Verdict::Unresolved => f.write_str("unresolved"),
            Verdict::Failed => f.write_str("failed"),
            Verdict::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

impl TestResults {
    /// Classify `status`, accepting both `Passed` and `TestResultsStatus.Passed`
    pub fn verdict(&self) -> Verdict {
        let raw = self.status.as_deref().unwrap_or("").trim();
        let name = raw.rsplit('.').next().unwrap_or(raw);
        match name.to_ascii_lowercase().as_str() {
            "passed" => Verdict::Passed,
            "unresolved" => Verdict::Unresolved,
            "failed" => Verdict::Failed,
            _ => Verdict::Unknown(raw.to_string()),
        }
    }
}

/// Upload summary returned by the reference stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSummary {
    pub name: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub all_test_results: Option<TestResults>,
}

/// Final line of the reference stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceOutput {
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub test_name: Option<String>,
    pub view_port_size: ReportedViewport,
    #[serde(default)]
    pub baseline_env_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub upload_from_figma_results: Option<UploadSummary>,
}

/// Final line of the comparison stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonOutput {
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub baseline_env_name: Option<String>,
    pub status: TestResults,
    #[serde(default)]
    pub view_port_size: Option<ReportedViewport>,
    #[serde(rename = "APP_URL", default)]
    pub app_url: Option<String>,
}

/// Stages pass SDK attributes through verbatim, so any of them may be `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Diagnostic payloads that do not decode are dropped rather than failing the result.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_classification() {
        let mut results = TestResults::default();
        results.status = Some("TestResultsStatus.Passed".to_string());
        assert_eq!(results.verdict(), Verdict::Passed);

        results.status = Some("Unresolved".to_string());
        assert_eq!(results.verdict(), Verdict::Unresolved);

        results.status = Some("failed".to_string());
        assert_eq!(results.verdict(), Verdict::Failed);

        results.status = None;
        assert_eq!(results.verdict(), Verdict::Unknown(String::new()));
    }

    #[test]
    fn test_parse_reference_output() {
        let line = r#"{"appName": "Shop", "testName": "Home", "viewPortSize": {"width": 300.7, "height": 150.2},
            "baselineEnvName": "Shop_Home_300",
            "uploadFromFigmaResults": {"name": "Home", "status": "Passed", "url": "https://eyes/r/1"}}"#;
        let output: ReferenceOutput = serde_json::from_str(line).unwrap();
        assert_eq!(output.app_name.as_deref(), Some("Shop"));
        assert_eq!(output.view_port_size.resolve().unwrap(), ViewportSize { width: 300, height: 150 });
        let upload = output.upload_from_figma_results.unwrap();
        assert_eq!(upload.url.as_deref(), Some("https://eyes/r/1"));
        assert!(upload.all_test_results.is_none());
    }

    #[test]
    fn test_parse_comparison_output() {
        let line = r#"{"appName": "Shop", "testName": "Home", "baselineEnvName": "Shop_Home_300",
            "status": {"name": "Home", "app_name": "Shop", "status": "TestResultsStatus.Unresolved",
                       "url": "https://eyes/r/2", "is_new": false, "is_different": true, "is_aborted": false,
                       "host_display_size": null, "matches": 1, "mismatches": 2, "missing": 0},
            "viewPortSize": {"width": 300, "height": 150}, "APP_URL": "https://shop.example.com"}"#;
        let output: ComparisonOutput = serde_json::from_str(line).unwrap();
        assert_eq!(output.status.verdict(), Verdict::Unresolved);
        assert!(output.status.is_different);
        assert_eq!(output.status.mismatches, 2);
        assert_eq!(output.app_url.as_deref(), Some("https://shop.example.com"));
    }

    #[test]
    fn test_null_result_attributes_default() {
        let line = r#"{"appName": "Shop", "testName": "Home",
            "status": {"status": "Passed", "is_new": null, "is_different": null, "is_aborted": null,
                       "matches": null, "mismatches": 3, "missing": null}}"#;
        let output: ComparisonOutput = serde_json::from_str(line).unwrap();
        assert_eq!(output.status.verdict(), Verdict::Passed);
        assert!(!output.status.is_new);
        assert!(!output.status.is_different);
        assert_eq!(output.status.matches, 0);
        assert_eq!(output.status.mismatches, 3);
    }

    #[test]
    fn test_reference_upload_details_decoded_leniently() {
        let line = r#"{"appName": "Shop", "testName": "Home", "viewPortSize": {"width": 390, "height": 844},
            "uploadFromFigmaResults": {"url": "https://eyes/r/1",
                "all_test_results": {"status": "Passed", "is_different": null, "matches": "many"}}}"#;
        let output: ReferenceOutput = serde_json::from_str(line).unwrap();
        let upload = output.upload_from_figma_results.unwrap();
        assert_eq!(upload.url.as_deref(), Some("https://eyes/r/1"));
        assert!(upload.all_test_results.is_none());

        let line = r#"{"viewPortSize": {"width": 390, "height": 844}, "uploadFromFigmaResults": "uploaded"}"#;
        let output: ReferenceOutput = serde_json::from_str(line).unwrap();
        assert!(output.upload_from_figma_results.is_none());

        let line = r#"{"viewPortSize": {"width": 390, "height": 844},
            "uploadFromFigmaResults": {"all_test_results": {"status": "Passed", "is_different": null}}}"#;
        let output: ReferenceOutput = serde_json::from_str(line).unwrap();
        let details = output.upload_from_figma_results.unwrap().all_test_results.unwrap();
        assert!(!details.is_different);
    }

    #[test]
    fn test_reference_output_requires_viewport() {
        let result: Result<ReferenceOutput, _> = serde_json::from_str(r#"{"appName": "Shop"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_display_includes_stage() {
        let err = StageError::Exited {
            stage: StageKind::Reference,
            code: Some(2),
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "reference stage exited with status 2");
        assert_eq!(err.stderr(), Some("boom"));
        assert!(!err.is_parse_failure());
    }
}
