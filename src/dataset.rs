//! Test-plan reading.
//!
//! The plan is a CSV table with named columns, one test case per row. Rows are
//! yielded lazily in file order, each tagged with its 1-based row number.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

pub const COL_FILE_KEY: &str = "FIGMA_FILE_KEY";
pub const COL_NODE_ID: &str = "FIGMA_NODE_ID";
pub const COL_APP_URL: &str = "APP_URL";
pub const COL_VIEWPORT: &str = "VIEWPORT_SIZE";
pub const COL_IGNORE_DISPLACEMENT: &str = "IGNORE_DISPLACEMENT";
pub const COL_MATCH_LEVEL: &str = "MATCH_LEVEL";
pub const COL_SKIP: &str = "SKIP";

const REQUIRED_COLUMNS: [&str; 4] = [COL_FILE_KEY, COL_NODE_ID, COL_APP_URL, COL_VIEWPORT];

/// Tokens accepted as "true" in flag columns (compared case-insensitively)
pub const TRUTHY_TOKENS: [&str; 5] = ["true", "1", "yes", "y", "on"];

/// Node ids in shared URLs use `-`, the API addresses them with `:`.
const NODE_ID_URL_SEPARATOR: char = '-';
const NODE_ID_API_SEPARATOR: char = ':';

/// Whether a flag-like string is truthy
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    TRUTHY_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t))
}

/// Rewrite a node id into the design API's addressing scheme
pub fn normalize_node_id(node_id: &str) -> String {
    node_id.trim().replace(NODE_ID_URL_SEPARATOR, &NODE_ID_API_SEPARATOR.to_string())
}

/// Match strictness levels understood by the visual-testing backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchLevel {
    None,
    Layout,
    Layout2,
    Content,
    #[default]
    Strict,
    Exact,
    IgnoreColors,
}

impl MatchLevel {
    pub fn all() -> [MatchLevel; 7] {
        [
            MatchLevel::None,
            MatchLevel::Layout,
            MatchLevel::Layout2,
            MatchLevel::Content,
            MatchLevel::Strict,
            MatchLevel::Exact,
            MatchLevel::IgnoreColors,
        ]
    }

    /// Canonical name passed to the comparison stage
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchLevel::None => "None",
            MatchLevel::Layout => "Layout",
            MatchLevel::Layout2 => "Layout2",
            MatchLevel::Content => "Content",
            MatchLevel::Strict => "Strict",
            MatchLevel::Exact => "Exact",
            MatchLevel::IgnoreColors => "IgnoreColors",
        }
    }
}

impl fmt::Display for MatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        MatchLevel::all()
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown match level '{}'", wanted))
    }
}

/// One row of the test plan after normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Design file key
    pub file_key: String,
    /// Design node id, `:`-separated
    pub node_id: String,
    /// Page under test
    pub app_url: String,
    /// Raw viewport token (`WxH` or `USE_SOURCE`), trimmed
    pub viewport: String,
    /// Bypass both stages
    pub skip: bool,
    /// Tolerate displaced regions during comparison
    pub ignore_displacement: bool,
    /// Comparison strictness
    pub match_level: MatchLevel,
}

/// Result type for dataset loading
pub type DatasetResult<T> = Result<T, DatasetError>;

/// Errors that make the whole test plan unreadable
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read test plan {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid test plan header: {0}")]
    Csv(#[from] csv::Error),

    #[error("test plan is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<&'static str>),
}

/// A row that could not be turned into a test case
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("row {row}: {reason}")]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

/// One yielded row: its 1-based number and the parsed case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    pub row: usize,
    pub case: Result<TestCase, RowError>,
}

#[derive(Debug, Clone)]
struct Columns {
    file_key: usize,
    node_id: usize,
    app_url: usize,
    viewport: usize,
    ignore_displacement: Option<usize>,
    match_level: Option<usize>,
    skip: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> DatasetResult<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);

        let missing: Vec<&'static str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|name| find(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(DatasetError::MissingColumns(missing));
        }

        Ok(Self {
            file_key: find(COL_FILE_KEY).unwrap_or_default(),
            node_id: find(COL_NODE_ID).unwrap_or_default(),
            app_url: find(COL_APP_URL).unwrap_or_default(),
            viewport: find(COL_VIEWPORT).unwrap_or_default(),
            ignore_displacement: find(COL_IGNORE_DISPLACEMENT),
            match_level: find(COL_MATCH_LEVEL),
            skip: find(COL_SKIP),
        })
    }
}

/// An opened test plan
pub struct Dataset {
    reader: csv::Reader<Cursor<Vec<u8>>>,
    columns: Columns,
}

impl Dataset {
    /// Open a test plan file
    pub fn open(path: impl AsRef<Path>) -> DatasetResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(bytes)
    }

    /// Parse a test plan held in memory. A leading UTF-8 BOM is ignored.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> DatasetResult<Self> {
        let mut bytes = bytes.into();
        if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
            bytes.drain(..3);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(bytes));
        let columns = Columns::from_headers(reader.headers()?)?;
        Ok(Self { reader, columns })
    }

    /// Iterate rows in file order
    pub fn rows(self) -> Rows {
        Rows {
            records: self.reader.into_records(),
            columns: self.columns,
            row: 0,
        }
    }
}

/// Iterator over the rows of a [`Dataset`]
pub struct Rows {
    records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
    columns: Columns,
    row: usize,
}

impl Iterator for Rows {
    type Item = DatasetRow;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        self.row += 1;
        let row = self.row;
        let case = match record {
            Ok(record) => parse_case(row, &record, &self.columns),
            Err(e) => Err(RowError {
                row,
                reason: e.to_string(),
            }),
        };
        Some(DatasetRow { row, case })
    }
}

fn parse_case(row: usize, record: &csv::StringRecord, columns: &Columns) -> Result<TestCase, RowError> {
    let field = move |idx: usize| record.get(idx).unwrap_or("").trim();
    let optional = move |idx: Option<usize>| idx.map(field).filter(|v| !v.is_empty());

    let skip = optional(columns.skip).map(is_truthy).unwrap_or(false);
    let ignore_displacement = optional(columns.ignore_displacement)
        .map(is_truthy)
        .unwrap_or(false);

    let match_level = match optional(columns.match_level) {
        None => MatchLevel::default(),
        Some(raw) => match raw.parse::<MatchLevel>() {
            Ok(level) => level,
            // Skipped rows never reach a stage, so a bad level there is harmless.
            Err(_) if skip => MatchLevel::default(),
            Err(reason) => return Err(RowError { row, reason }),
        },
    };

    let case = TestCase {
        file_key: field(columns.file_key).to_string(),
        node_id: normalize_node_id(field(columns.node_id)),
        app_url: field(columns.app_url).to_string(),
        viewport: field(columns.viewport).to_string(),
        skip,
        ignore_displacement,
        match_level,
    };

    if !skip {
        let required = [
            (COL_FILE_KEY, &case.file_key),
            (COL_NODE_ID, &case.node_id),
            (COL_APP_URL, &case.app_url),
            (COL_VIEWPORT, &case.viewport),
        ];
        let empty: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !empty.is_empty() {
            return Err(RowError {
                row,
                reason: format!("missing values for {}", empty.join(", ")),
            });
        }
    }

    Ok(case)
}
