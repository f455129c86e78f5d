use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use figma_vision::config::{self, Config, ConfigError};
use figma_vision::dataset::{Dataset, DatasetRow};
use figma_vision::identity::{BaselineIdentity, ViewportRequest};
use figma_vision::pipeline::{CaseOutcome, CaseStatus, Orchestrator, RunReport, RunSettings};
use figma_vision::stage::{ProcessStages, StageCommand};

/// Figma Vision - visual regression runs comparing Figma designs against live pages
#[derive(Parser, Debug)]
#[command(
    name = "figma-vision",
    version,
    about = "Row-driven visual regression runs comparing Figma designs against live pages",
    after_help = "ENVIRONMENT VARIABLES:\n\
        FIGMA_VISION_CONFIG        Configuration document path\n\
        FIGMA_VISION_DATASET       Test plan (CSV) path\n\
        FIGMA_TOKEN                Overrides the configured design-source token\n\
        APPLITOOLS_SERVER_URL      Overrides the configured backend endpoint\n\
        APPLITOOLS_API_KEY         Overrides the configured backend credential\n\
        HEADLESS                   Overrides the configured headless mode\n\
        RUST_LOG                   Log filter (default: info)"
)]
struct Args {
    /// Configuration document (JSON)
    #[arg(long, short = 'c', global = true, env = "FIGMA_VISION_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging, including stage diagnostics
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every row of the test plan through both stages
    Run {
        /// Test plan (CSV)
        #[arg(long, short = 'd', env = "FIGMA_VISION_DATASET", default_value = config::DEFAULT_DATASET_PATH)]
        dataset: PathBuf,

        /// Only process these 1-based rows (comma-separated, e.g. "2,5")
        #[arg(long, value_delimiter = ',')]
        rows: Vec<usize>,

        /// Override the configured headless mode
        #[arg(long)]
        headless: Option<bool>,

        /// Reference stage command (comma-separated, e.g. "python3,tests/LoadFromFigma.py")
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        reference_stage: Vec<String>,

        /// Comparison stage command (comma-separated, e.g. "python3,tests/TestInBrowser.py")
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        comparison_stage: Vec<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Also write the run report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Parse the test plan and show each normalized case without running stages
    Plan {
        /// Test plan (CSV)
        #[arg(long, short = 'd', env = "FIGMA_VISION_DATASET", default_value = config::DEFAULT_DATASET_PATH)]
        dataset: PathBuf,
    },

    /// Show the loaded configuration with secrets masked
    Config,

    /// Derive the baseline key for an app name, test name and viewport width
    Identity {
        /// Design file name
        #[arg(long)]
        app: Option<String>,

        /// Design node name
        #[arg(long)]
        test: Option<String>,

        /// Viewport width in pixels (fractions are truncated)
        #[arg(long)]
        width: f64,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match args.command {
        Some(Commands::Run {
            dataset,
            rows,
            headless,
            reference_stage,
            comparison_stage,
            json,
            report,
        }) => {
            let mut config = load_config(&args.config)?;
            if let Some(headless) = headless {
                config.headless = headless;
            }
            if let Some(command) = StageCommand::from_parts(reference_stage) {
                config.reference_stage = command;
            }
            if let Some(command) = StageCommand::from_parts(comparison_stage) {
                config.comparison_stage = command;
            }
            log_config(&config);

            let plan = Dataset::open(&dataset)
                .with_context(|| format!("cannot load test plan {}", dataset.display()))?;
            let selected = plan
                .rows()
                .filter(move |r: &DatasetRow| rows.is_empty() || rows.contains(&r.row));

            let stages = ProcessStages::new(config.reference_stage.clone(), config.comparison_stage.clone());
            let mut orchestrator = Orchestrator::new(RunSettings::from(&config), stages);
            let result = orchestrator.run(selected);

            if let Some(path) = &report {
                std::fs::write(path, serde_json::to_string_pretty(&result)?)
                    .with_context(|| format!("cannot write report {}", path.display()))?;
                tracing::info!(path = %path.display(), "run report written");
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }

            if !result.succeeded() {
                std::process::exit(1);
            }
        }

        Some(Commands::Plan { dataset }) => {
            let plan = Dataset::open(&dataset)
                .with_context(|| format!("cannot load test plan {}", dataset.display()))?;
            for DatasetRow { row, case } in plan.rows() {
                match case {
                    Ok(case) => {
                        let viewport = match ViewportRequest::parse(&case.viewport) {
                            Ok(request) => request.to_string(),
                            Err(e) => format!("INVALID ({})", e),
                        };
                        println!(
                            "  Row {}{}: file={} node={} url={} viewport={} match={} ignore_displacement={}",
                            row,
                            if case.skip { " [skip]" } else { "" },
                            case.file_key,
                            case.node_id,
                            case.app_url,
                            viewport,
                            case.match_level,
                            case.ignore_displacement,
                        );
                    }
                    Err(e) => println!("  Row {} [invalid]: {}", row, e.reason),
                }
            }
        }

        Some(Commands::Config) => {
            let config = load_config(&args.config)?;
            for (key, value) in config.masked_entries() {
                println!("{:<25}: {}", key, value);
            }
        }

        Some(Commands::Identity { app, test, width }) => {
            let identity = BaselineIdentity::try_derive(app.as_deref(), test.as_deref(), width)?;
            println!("{}", identity);
        }

        None => {
            println!("Figma Vision - visual regression runs comparing Figma designs against live pages");
            println!();
            println!("Usage: figma-vision <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run       Run every row of the test plan through both stages");
            println!("  plan      Show the normalized test plan without running stages");
            println!("  config    Show the loaded configuration with secrets masked");
            println!("  identity  Derive a baseline key");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

/// Load configuration, reporting every missing key on its own line
fn load_config(path: &Path) -> anyhow::Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::MissingKeys(keys)) => {
            for key in &keys {
                tracing::error!(key = %key, "missing required configuration value");
            }
            bail!("configuration {} is missing {} required key(s)", path.display(), keys.len())
        }
        Err(e) => Err(e).with_context(|| format!("cannot load configuration {}", path.display())),
    }
}

fn log_config(config: &Config) {
    for (key, value) in config.masked_entries() {
        tracing::info!("{:<25}: {}", key, value);
    }
}

fn print_summary(report: &RunReport) {
    println!("Run {} completed: {} rows", report.run_id, report.outcomes.len());
    for outcome in &report.outcomes {
        println!("  {}", describe_outcome(outcome));
    }
    println!(
        "\nDone: {}  Failed: {}  Skipped: {}",
        report.done_count(),
        report.failed_count(),
        report.skipped_count()
    );
}

fn describe_outcome(outcome: &CaseOutcome) -> String {
    let identity = outcome
        .identity
        .as_ref()
        .map(|i| format!(" {}", i))
        .unwrap_or_default();
    match &outcome.outcome {
        CaseStatus::Skipped => format!("Row {} [skipped]", outcome.row),
        CaseStatus::Done { result, .. } => format!(
            "Row {} [done]{}: {} (matches {}, mismatches {}, missing {}){}",
            outcome.row,
            identity,
            result.status.verdict(),
            result.status.matches,
            result.status.mismatches,
            result.status.missing,
            result
                .status
                .url
                .as_deref()
                .map(|u| format!(" {}", u))
                .unwrap_or_default(),
        ),
        CaseStatus::Failed(failure) => format!("Row {} [failed]{}: {}", outcome.row, identity, failure.message),
    }
}
