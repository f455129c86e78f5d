//! Integration tests running the pipeline against real stage processes

#![cfg(unix)]

use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use figma_vision::pipeline::{CaseStatus, FailureKind, REFERENCE_BATCH_SUFFIX};
use figma_vision::stage::StageKind;
use figma_vision::{Config, Dataset, Orchestrator, ProcessStages, RunSettings, StageCommand};

/// Reference stage: fails on the `BROKEN` file key, otherwise reports a
/// fractional source viewport and records the batch id it was given.
const REFERENCE_SCRIPT: &str = r#"
echo "$7 $8" >> "$LOG_DIR/reference.log"
if [ "$2" = "BROKEN" ]; then
    echo "Traceback: node $3 not found" >&2
    exit 3
fi
echo "Loading node $3 from $2"
printf '{"appName":"Shop","testName":"%s","viewPortSize":{"width":390.7,"height":844.2}}\n' "$2"
"#;

/// Comparison stage: records its arguments one per line and reports a pass
const COMPARISON_SCRIPT: &str = r#"
for arg in "$@"; do echo "$arg"; done > "$LOG_DIR/comparison-$2.args"
echo "running checks" >&2
printf '{"appName":"%s","testName":"%s","baselineEnvName":"%s","status":{"status":"Passed","matches":1,"url":"https://eyes/%s"},"APP_URL":"%s"}\n' "$1" "$2" "$5" "$2" "$6"
"#;

const TEST_PLAN: &str = "\
FIGMA_FILE_KEY,FIGMA_NODE_ID,APP_URL,VIEWPORT_SIZE,IGNORE_DISPLACEMENT,MATCH_LEVEL,SKIP
Home,1-2,https://shop/home,USE_SOURCE,true,Layout,false
BROKEN,3-4,https://shop/broken,1024x768,,,
Cart,5-6,https://shop/cart,use_source,,,
Later,7-8,https://shop/later,USE_SOURCE,,,yes
";

fn script_stage(dir: &Path, script: &str) -> StageCommand {
    // LOG_DIR is expanded by the shell wrapper so the script itself stays static
    StageCommand::new("sh")
        .arg("-c")
        .arg(format!("LOG_DIR='{}'\n{}", dir.display(), script))
        .arg("stage")
}

fn settings() -> RunSettings {
    let config = Config::from_json_str(
        r#"{
            "FIGMA_TOKEN": "figd_integration_token",
            "APPLITOOLS_SERVER_URL": "https://eyes.example",
            "APPLITOOLS_API_KEY": "integration_api_key",
            "HEADLESS": "false"
        }"#,
        |_| None,
    )
    .expect("valid configuration");
    RunSettings::from(&config)
}

fn write_plan(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("TestData.csv");
    fs::write(&path, format!("\u{feff}{}", TEST_PLAN)).expect("write test plan");
    path
}

#[test]
fn test_run_isolates_failures_and_threads_identity() {
    let dir = TempDir::new().unwrap();
    let plan = Dataset::open(write_plan(dir.path())).expect("open test plan");

    let stages = ProcessStages::new(
        script_stage(dir.path(), REFERENCE_SCRIPT),
        script_stage(dir.path(), COMPARISON_SCRIPT),
    );
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let report = orchestrator.run(plan.rows());

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.done_count(), 2);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.skipped_count(), 1);
    assert!(report.succeeded());

    // Row 1 completes with a key derived from the truncated source width
    let home = &report.outcomes[0];
    assert!(home.is_done());
    assert_eq!(home.identity.as_ref().map(|i| i.as_str()), Some("Shop_Home_390"));
    let viewport = home.viewport.expect("resolved viewport");
    assert_eq!((viewport.width, viewport.height), (390, 844));
    let result = home.result().expect("comparison result");
    assert_eq!(result.status.url.as_deref(), Some("https://eyes/Home"));
    assert_eq!(result.app_url.as_deref(), Some("https://shop/home"));

    // Row 2 fails in the reference stage, with its diagnostics kept
    let broken = &report.outcomes[1];
    let failure = broken.failure().expect("row 2 should fail");
    assert_eq!(failure.kind, FailureKind::StageProcess);
    assert_eq!(failure.stage, Some(StageKind::Reference));
    assert!(failure.stderr.as_deref().unwrap_or("").contains("node 3:4 not found"));
    assert!(!dir.path().join("comparison-BROKEN.args").exists());

    // Row 3 still runs after the failure
    assert!(report.outcomes[2].is_done());
    assert_eq!(
        report.outcomes[2].identity.as_ref().map(|i| i.as_str()),
        Some("Shop_Cart_390")
    );

    // Row 4 is never handed to a stage
    assert!(matches!(report.outcomes[3].outcome, CaseStatus::Skipped));
}

#[test]
fn test_stage_arguments_follow_contract() {
    let dir = TempDir::new().unwrap();
    let plan = Dataset::open(write_plan(dir.path())).expect("open test plan");

    let stages = ProcessStages::new(
        script_stage(dir.path(), REFERENCE_SCRIPT),
        script_stage(dir.path(), COMPARISON_SCRIPT),
    );
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let report = orchestrator.run(plan.rows());

    // Every reference invocation of the run shares one batch id
    let reference_log = fs::read_to_string(dir.path().join("reference.log")).unwrap();
    let lines: Vec<&str> = reference_log.lines().collect();
    assert_eq!(
        lines,
        vec![
            format!("{} USE_SOURCE", report.batches.reference.id),
            format!("{} 1024x768", report.batches.reference.id),
            format!("{} USE_SOURCE", report.batches.reference.id),
        ]
    );

    let args = fs::read_to_string(dir.path().join("comparison-Home.args")).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(
        args,
        vec![
            "Shop",
            "Home",
            "integration_api_key",
            r#"{"width":390,"height":844}"#,
            "Shop_Home_390",
            "https://shop/home",
            " - Check against Figma",
            report.batches.comparison.id.as_str(),
            "false",
            "true",
            "Layout",
        ]
    );
    assert_ne!(report.batches.reference.id, report.batches.comparison.id);
    assert_eq!(report.batches.reference.name_suffix, REFERENCE_BATCH_SUFFIX);
}

#[test]
fn test_each_run_gets_fresh_batches() {
    let dir = TempDir::new().unwrap();
    let plan_path = write_plan(dir.path());

    let stages = ProcessStages::new(
        script_stage(dir.path(), REFERENCE_SCRIPT),
        script_stage(dir.path(), COMPARISON_SCRIPT),
    );
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let first = orchestrator.run(Dataset::open(&plan_path).unwrap().rows());
    let second = orchestrator.run(Dataset::open(&plan_path).unwrap().rows());

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.batches.reference.id, second.batches.reference.id);
    assert_ne!(first.batches.comparison.id, second.batches.comparison.id);
}

#[test]
fn test_unparseable_result_fails_only_that_row() {
    let dir = TempDir::new().unwrap();
    let plan = Dataset::from_bytes(
        "FIGMA_FILE_KEY,FIGMA_NODE_ID,APP_URL,VIEWPORT_SIZE,SKIP\n\
         Home,1-2,https://shop/home,USE_SOURCE,\n\
         Cart,5-6,https://shop/cart,USE_SOURCE,\n",
    )
    .unwrap();

    let chatty_comparison = r#"
if [ "$2" = "Home" ]; then
    echo "done without a result"
    exit 0
fi
printf '{"status":{"status":"Unresolved","mismatches":2}}\n'
"#;
    let stages = ProcessStages::new(
        script_stage(dir.path(), REFERENCE_SCRIPT),
        script_stage(dir.path(), chatty_comparison),
    );
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let report = orchestrator.run(plan.rows());

    let failure = report.outcomes[0].failure().expect("row 1 should fail");
    assert_eq!(failure.kind, FailureKind::ResultParse);
    assert_eq!(failure.stage, Some(StageKind::Comparison));

    let cart = &report.outcomes[1];
    assert!(cart.is_done());
    assert_eq!(cart.result().map(|r| r.status.mismatches), Some(2));
}

#[test]
fn test_null_result_attributes_do_not_fail_rows() {
    let dir = TempDir::new().unwrap();
    let plan = Dataset::from_bytes(
        "FIGMA_FILE_KEY,FIGMA_NODE_ID,APP_URL,VIEWPORT_SIZE\n\
         Home,1-2,https://shop/home,USE_SOURCE\n",
    )
    .unwrap();

    let reference = r#"
printf '{"appName":"Shop","testName":"Home","viewPortSize":{"width":390,"height":844},"uploadFromFigmaResults":{"url":"https://eyes/ref","all_test_results":{"status":"Passed","is_different":null,"host_display_size":{"width":null}}}}\n'
"#;
    let comparison = r#"
printf '{"status":{"status":"Passed","is_new":null,"is_different":null,"matches":null,"missing":null}}\n'
"#;
    let stages = ProcessStages::new(script_stage(dir.path(), reference), script_stage(dir.path(), comparison));
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let report = orchestrator.run(plan.rows());

    let home = &report.outcomes[0];
    assert!(home.is_done(), "unexpected outcome: {:?}", home.outcome);
    let result = home.result().unwrap();
    assert!(!result.status.is_new);
    assert_eq!(result.status.matches, 0);
    match &home.outcome {
        CaseStatus::Done { reference_url, .. } => assert_eq!(reference_url.as_deref(), Some("https://eyes/ref")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_report_serializes_to_json() {
    let dir = TempDir::new().unwrap();
    let plan = Dataset::open(write_plan(dir.path())).unwrap();

    let stages = ProcessStages::new(
        script_stage(dir.path(), REFERENCE_SCRIPT),
        script_stage(dir.path(), COMPARISON_SCRIPT),
    );
    let mut orchestrator = Orchestrator::new(settings(), stages);
    let report = orchestrator.run(plan.rows());

    let json = serde_json::to_value(&report).unwrap();
    let statuses: Vec<&str> = json["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["outcome"]["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["done", "failed", "done", "skipped"]);
    assert!(!json.to_string().contains("figd_integration_token"));
}
