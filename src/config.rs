//! Run configuration loaded from a JSON document with environment overrides.
//!
//! The configuration document is a flat key/value object. Environment
//! variables with the same names take precedence over file values.
//!
//! # Keys
//!
//! | Key | Description | Default |
//! |-----|-------------|---------|
//! | `FIGMA_TOKEN` | Design-source access token | required |
//! | `APPLITOOLS_SERVER_URL` | Visual-testing backend endpoint | required |
//! | `APPLITOOLS_API_KEY` | Visual-testing backend credential | required |
//! | `HEADLESS` | Run the browser without a window | `true` |
//! | `REFERENCE_STAGE` | Reference stage command (array) | `["python3", "LoadFromFigma.py"]` |
//! | `COMPARISON_STAGE` | Comparison stage command (array) | `["python3", "TestInBrowser.py"]` |
//!
//! # Example
//!
//! ```json
//! {
//!     "FIGMA_TOKEN": "figd_...",
//!     "APPLITOOLS_SERVER_URL": "https://eyesapi.applitools.com",
//!     "APPLITOOLS_API_KEY": "...",
//!     "HEADLESS": "true"
//! }
//! ```

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::dataset::is_truthy;
use crate::stage::StageCommand;

// ============================================================================
// Default Values
// ============================================================================

/// Default configuration document location
pub const DEFAULT_CONFIG_PATH: &str = "resources/configuration.json";

/// Default test plan location
pub const DEFAULT_DATASET_PATH: &str = "resources/TestData.csv";

/// Default headless mode
pub const DEFAULT_HEADLESS: bool = true;

/// Default reference stage command
pub const DEFAULT_REFERENCE_STAGE: [&str; 2] = ["python3", "LoadFromFigma.py"];

/// Default comparison stage command
pub const DEFAULT_COMPARISON_STAGE: [&str; 2] = ["python3", "TestInBrowser.py"];

/// Values shorter than this are fully masked
pub const MASK_MIN_LENGTH: usize = 8;

// ============================================================================
// Key Names (shared by the JSON document and environment overrides)
// ============================================================================

pub const KEY_FIGMA_TOKEN: &str = "FIGMA_TOKEN";
pub const KEY_SERVER_URL: &str = "APPLITOOLS_SERVER_URL";
pub const KEY_API_KEY: &str = "APPLITOOLS_API_KEY";
pub const KEY_HEADLESS: &str = "HEADLESS";
pub const KEY_REFERENCE_STAGE: &str = "REFERENCE_STAGE";
pub const KEY_COMPARISON_STAGE: &str = "COMPARISON_STAGE";

/// Environment variable naming the configuration document
pub const ENV_CONFIG_PATH: &str = "FIGMA_VISION_CONFIG";

/// Environment variable naming the test plan
pub const ENV_DATASET_PATH: &str = "FIGMA_VISION_DATASET";

// ============================================================================
// Errors
// ============================================================================

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in configuration: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing required configuration keys: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Fully validated run configuration
#[derive(Clone)]
pub struct Config {
    /// Design-source access token
    pub figma_token: String,
    /// Visual-testing backend endpoint
    pub server_url: String,
    /// Visual-testing backend credential
    pub api_key: String,
    /// Browser headless mode for the comparison stage
    pub headless: bool,
    /// Command running the reference stage
    pub reference_stage: StageCommand,
    /// Command running the comparison stage
    pub comparison_stage: StageCommand,
}

// Secrets stay masked even in debug output.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("figma_token", &mask(Some(&self.figma_token)))
            .field("server_url", &self.server_url)
            .field("api_key", &mask(Some(&self.api_key)))
            .field("headless", &self.headless)
            .field("reference_stage", &self.reference_stage)
            .field("comparison_stage", &self.comparison_stage)
            .finish()
    }
}

/// The document as written, before validation
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "FIGMA_TOKEN")]
    figma_token: Option<String>,
    #[serde(rename = "APPLITOOLS_SERVER_URL")]
    server_url: Option<String>,
    #[serde(rename = "APPLITOOLS_API_KEY")]
    api_key: Option<String>,
    #[serde(rename = "HEADLESS")]
    headless: Option<serde_json::Value>,
    #[serde(rename = "REFERENCE_STAGE")]
    reference_stage: Option<Vec<String>>,
    #[serde(rename = "COMPARISON_STAGE")]
    comparison_stage: Option<Vec<String>>,
}

impl Config {
    /// Load from a file, applying overrides from the process environment
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = read_config_file(path.as_ref())?;
        Self::from_json_str(&text, |key| std::env::var(key).ok())
    }

    /// Parse a configuration document. `env` looks up override values by key.
    pub fn from_json_str<F>(text: &str, env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let raw: RawConfig = if text.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_json::from_str(text)?
        };
        Self::from_raw(raw, env)
    }

    fn from_raw<F>(raw: RawConfig, env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str, file_value: Option<String>| -> Option<String> {
            env(key)
                .or(file_value)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let figma_token = lookup(KEY_FIGMA_TOKEN, raw.figma_token);
        let server_url = lookup(KEY_SERVER_URL, raw.server_url);
        let api_key = lookup(KEY_API_KEY, raw.api_key);

        let mut missing = Vec::new();
        if figma_token.is_none() {
            missing.push(KEY_FIGMA_TOKEN);
        }
        if server_url.is_none() {
            missing.push(KEY_SERVER_URL);
        }
        if api_key.is_none() {
            missing.push(KEY_API_KEY);
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }

        let headless = match env(KEY_HEADLESS) {
            Some(value) => is_truthy(&value),
            None => parse_headless(raw.headless)?,
        };

        let reference_stage = stage_command(
            KEY_REFERENCE_STAGE,
            env(KEY_REFERENCE_STAGE),
            raw.reference_stage,
            &DEFAULT_REFERENCE_STAGE,
        )?;
        let comparison_stage = stage_command(
            KEY_COMPARISON_STAGE,
            env(KEY_COMPARISON_STAGE),
            raw.comparison_stage,
            &DEFAULT_COMPARISON_STAGE,
        )?;

        Ok(Self {
            figma_token: figma_token.unwrap_or_default(),
            server_url: server_url.unwrap_or_default(),
            api_key: api_key.unwrap_or_default(),
            headless,
            reference_stage,
            comparison_stage,
        })
    }

    /// Name/value pairs suitable for logging, secrets masked
    pub fn masked_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (KEY_FIGMA_TOKEN, mask(Some(&self.figma_token))),
            (KEY_SERVER_URL, self.server_url.clone()),
            (KEY_API_KEY, mask(Some(&self.api_key))),
            (KEY_HEADLESS, self.headless.to_string()),
            (KEY_REFERENCE_STAGE, self.reference_stage.to_string()),
            (KEY_COMPARISON_STAGE, self.comparison_stage.to_string()),
        ]
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_config_file(path: &Path) -> ConfigResult<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ConfigError::NotFound(path.display().to_string()))
        }
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Accepts JSON booleans or any truthy/falsy string token
fn parse_headless(value: Option<serde_json::Value>) -> ConfigResult<bool> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(DEFAULT_HEADLESS),
        Some(serde_json::Value::Bool(b)) => Ok(b),
        Some(serde_json::Value::String(s)) => Ok(is_truthy(&s)),
        Some(other) => Err(ConfigError::InvalidValue {
            key: KEY_HEADLESS,
            reason: format!("expected a boolean or string, got {}", other),
        }),
    }
}

/// Environment overrides are whitespace separated; file values are arrays.
fn stage_command(
    key: &'static str,
    env_value: Option<String>,
    file_value: Option<Vec<String>>,
    default: &[&str],
) -> ConfigResult<StageCommand> {
    let parts: Vec<String> = match (env_value, file_value) {
        (Some(value), _) => value.split_whitespace().map(str::to_string).collect(),
        (None, Some(parts)) => parts,
        (None, None) => default.iter().map(|s| s.to_string()).collect(),
    };
    StageCommand::from_parts(parts).ok_or(ConfigError::InvalidValue {
        key,
        reason: "stage command must name a program".to_string(),
    })
}

/// Mask a secret for display.
///
/// Missing values render as `<missing>`. Values shorter than
/// [`MASK_MIN_LENGTH`] characters are fully starred; longer values keep only
/// their first and last four characters.
pub fn mask(value: Option<&str>) -> String {
    let value = match value {
        Some(v) if !v.is_empty() => v,
        _ => return "<missing>".to_string(),
    };
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < MASK_MIN_LENGTH {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
