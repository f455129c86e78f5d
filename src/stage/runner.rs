//! Stage execution as isolated subprocesses.
//!
//! Each stage is an external program called with a fixed positional argument
//! list. The runner waits for it to exit, captures both streams in full, and
//! parses the **last** stdout line as the stage's JSON result. Earlier stdout
//! lines and the whole stderr stream are diagnostics and are relayed to the
//! log at debug level.
//!
//! Two implementations of [`StageBackend`] exist in practice:
//! - `ProcessStages` for the real stage executables
//! - scripted backends in tests, which never spawn anything

use serde::de::DeserializeOwned;
use std::fmt;
use std::process::{Command, Output};

use super::types::{ComparisonOutput, ReferenceOutput, StageError, StageKind, StageResult};
use crate::identity::{BaselineIdentity, ViewportSize};

/// Environment applied to every stage process
pub const STAGE_ENV: &[(&str, &str)] = &[("NODE_NO_WARNINGS", "1")];

/// A program plus the leading arguments that precede the positional contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build from `[program, args...]`; `None` when there is no program
    pub fn from_parts<I>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parts = parts.into_iter();
        let program = parts.next().filter(|p| !p.trim().is_empty())?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Inputs of the reference stage, in contract order
#[derive(Debug, Clone)]
pub struct ReferenceRequest {
    pub figma_token: String,
    pub file_key: String,
    pub node_id: String,
    pub server_url: String,
    pub api_key: String,
    pub batch_name_suffix: String,
    pub batch_id: String,
    pub viewport_token: String,
}

impl ReferenceRequest {
    /// Positional arguments:
    /// token, file key, node id, endpoint, credential, batch suffix, batch id, viewport
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.figma_token.clone(),
            self.file_key.clone(),
            self.node_id.clone(),
            self.server_url.clone(),
            self.api_key.clone(),
            self.batch_name_suffix.clone(),
            self.batch_id.clone(),
            self.viewport_token.clone(),
        ]
    }
}

/// Inputs of the comparison stage, in contract order
#[derive(Debug, Clone)]
pub struct ComparisonRequest {
    pub app_name: String,
    pub test_name: String,
    pub api_key: String,
    pub viewport: ViewportSize,
    pub baseline: BaselineIdentity,
    pub app_url: String,
    pub batch_name_suffix: String,
    pub batch_id: String,
    pub headless: bool,
    pub ignore_displacement: bool,
    pub match_level: String,
}

impl ComparisonRequest {
    /// Positional arguments:
    /// app, test, credential, viewport JSON, baseline key, URL, batch suffix,
    /// batch id, headless, displacement tolerance, match level
    pub fn to_args(&self) -> serde_json::Result<Vec<String>> {
        Ok(vec![
            self.app_name.clone(),
            self.test_name.clone(),
            self.api_key.clone(),
            self.viewport.to_json()?,
            self.baseline.to_string(),
            self.app_url.clone(),
            self.batch_name_suffix.clone(),
            self.batch_id.clone(),
            self.headless.to_string(),
            self.ignore_displacement.to_string(),
            self.match_level.clone(),
        ])
    }
}

/// Executes the two stages of a case
pub trait StageBackend {
    fn run_reference(&mut self, request: &ReferenceRequest) -> StageResult<ReferenceOutput>;

    fn run_comparison(&mut self, request: &ComparisonRequest) -> StageResult<ComparisonOutput>;
}

/// Runs stages as external processes
#[derive(Debug, Clone)]
pub struct ProcessStages {
    reference: StageCommand,
    comparison: StageCommand,
}

impl ProcessStages {
    pub fn new(reference: StageCommand, comparison: StageCommand) -> Self {
        Self {
            reference,
            comparison,
        }
    }

    pub fn command(&self, stage: StageKind) -> &StageCommand {
        match stage {
            StageKind::Reference => &self.reference,
            StageKind::Comparison => &self.comparison,
        }
    }
}

impl StageBackend for ProcessStages {
    fn run_reference(&mut self, request: &ReferenceRequest) -> StageResult<ReferenceOutput> {
        let value = run_stage(StageKind::Reference, &self.reference, &request.to_args())?;
        decode(StageKind::Reference, value)
    }

    fn run_comparison(&mut self, request: &ComparisonRequest) -> StageResult<ComparisonOutput> {
        let args = request.to_args().map_err(|e| StageError::Contract {
            stage: StageKind::Comparison,
            reason: format!("cannot encode viewport argument: {}", e),
        })?;
        let value = run_stage(StageKind::Comparison, &self.comparison, &args)?;
        decode(StageKind::Comparison, value)
    }
}

/// Captured result of one stage process that exited successfully
#[derive(Debug, Clone)]
pub struct StageRun {
    pub value: serde_json::Value,
    pub stderr: String,
}

/// Run one stage and parse its final stdout line as JSON.
///
/// Blocks until the process exits; no timeout is imposed here.
pub fn run_stage(stage: StageKind, command: &StageCommand, args: &[String]) -> StageResult<StageRun> {
    tracing::debug!(%stage, program = %command.program, arg_count = args.len(), "starting stage");

    let output = Command::new(&command.program)
        .args(&command.args)
        .args(args)
        .envs(STAGE_ENV.iter().copied())
        .output()
        .map_err(|source| StageError::Spawn {
            stage,
            program: command.program.clone(),
            source,
        })?;

    interpret_output(stage, output)
}

fn interpret_output(stage: StageKind, output: Output) -> StageResult<StageRun> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(%stage, "stderr: {}", line);
    }

    if !output.status.success() {
        return Err(StageError::Exited {
            stage,
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    let value = parse_last_line(stage, &stdout, &stderr)?;
    Ok(StageRun { value, stderr })
}

/// Parse the last non-blank line of `stdout` as JSON.
pub fn parse_last_line(stage: StageKind, stdout: &str, stderr: &str) -> StageResult<serde_json::Value> {
    let mut lines = stdout.trim_end().lines().collect::<Vec<_>>();
    let last = match lines.pop() {
        Some(line) if !line.trim().is_empty() => line.trim(),
        _ => {
            return Err(StageError::NoOutput {
                stage,
                stderr: stderr.to_string(),
            });
        }
    };

    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(%stage, "stdout: {}", line);
    }

    serde_json::from_str(last).map_err(|source| StageError::Parse {
        stage,
        line: last.to_string(),
        stderr: stderr.to_string(),
        source,
    })
}

/// Convert a stage's JSON value into its typed result
fn decode<T: DeserializeOwned>(stage: StageKind, run: StageRun) -> StageResult<T> {
    let line = run.value.to_string();
    serde_json::from_value(run.value).map_err(|source| StageError::Parse {
        stage,
        line,
        stderr: run.stderr,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_final_line_only() {
        let stdout = "Loading node 1:2\nuploading...\n{\"ok\": true}\n";
        let value = parse_last_line(StageKind::Reference, stdout, "").unwrap();
        assert_eq!(value, serde_json::json!({ "ok": true }));
    }

    #[test]
    fn test_parse_single_json_line() {
        let value = parse_last_line(StageKind::Comparison, "{\"ok\": true}\n", "").unwrap();
        assert_eq!(value["ok"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_trailing_blank_lines_ignored() {
        let value = parse_last_line(StageKind::Reference, "{\"n\": 1}\n\n  \n", "").unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn test_empty_output_is_parse_failure() {
        let err = parse_last_line(StageKind::Reference, "", "traceback").unwrap_err();
        assert!(matches!(err, StageError::NoOutput { .. }));
        assert!(err.is_parse_failure());
        assert_eq!(err.stderr(), Some("traceback"));

        let err = parse_last_line(StageKind::Reference, "\n\n", "").unwrap_err();
        assert!(matches!(err, StageError::NoOutput { .. }));
    }

    #[test]
    fn test_plain_text_last_line_is_parse_failure() {
        let err = parse_last_line(StageKind::Comparison, "{\"ok\": true}\ndone\n", "").unwrap_err();
        match err {
            StageError::Parse { line, .. } => assert_eq!(line, "done"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reference_args_order() {
        let request = ReferenceRequest {
            figma_token: "tok".into(),
            file_key: "FILE".into(),
            node_id: "1:2".into(),
            server_url: "https://eyes".into(),
            api_key: "key".into(),
            batch_name_suffix: " - Check with Figma".into(),
            batch_id: "batch-1".into(),
            viewport_token: "USE_SOURCE".into(),
        };
        assert_eq!(
            request.to_args(),
            vec!["tok", "FILE", "1:2", "https://eyes", "key", " - Check with Figma", "batch-1", "USE_SOURCE"]
        );
    }

    #[test]
    fn test_comparison_args_order() {
        let request = ComparisonRequest {
            app_name: "Shop".into(),
            test_name: "Home".into(),
            api_key: "key".into(),
            viewport: ViewportSize::new(300, 150).unwrap(),
            baseline: BaselineIdentity::derive(Some("Shop"), Some("Home"), 300.0),
            app_url: "https://shop".into(),
            batch_name_suffix: " - Check against Figma".into(),
            batch_id: "batch-2".into(),
            headless: true,
            ignore_displacement: false,
            match_level: "Strict".into(),
        };
        assert_eq!(
            request.to_args().unwrap(),
            vec![
                "Shop",
                "Home",
                "key",
                r#"{"width":300,"height":150}"#,
                "Shop_Home_300",
                "https://shop",
                " - Check against Figma",
                "batch-2",
                "true",
                "false",
                "Strict",
            ]
        );
    }

    #[test]
    fn test_stage_command_from_parts() {
        let cmd = StageCommand::from_parts(vec!["python3".to_string(), "stage.py".to_string()]).unwrap();
        assert_eq!(cmd, StageCommand::new("python3").arg("stage.py"));
        assert_eq!(cmd.to_string(), "python3 stage.py");
        assert!(StageCommand::from_parts(Vec::<String>::new()).is_none());
        assert!(StageCommand::from_parts(vec![" ".to_string()]).is_none());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cmd = StageCommand::new("/nonexistent/figma-vision-stage");
        let err = run_stage(StageKind::Reference, &cmd, &[]).unwrap_err();
        assert!(matches!(err, StageError::Spawn { .. }));
    }
}
