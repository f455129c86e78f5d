//! Deterministic comparison identities.
//!
//! A baseline in the visual-testing backend is addressed by the triple
//! (app name, test name, viewport width). This module turns design metadata
//! and a requested viewport into that key:
//! - `ViewportRequest` parses the `WxH` / `USE_SOURCE` token from the test plan
//! - `ViewportSize` is the resolved integer viewport
//! - `BaselineIdentity` joins the triple into one stable string

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Token meaning "use the design node's own bounding box".
pub const USE_SOURCE_TOKEN: &str = "USE_SOURCE";

/// Placeholder used when the design file carries no name.
pub const UNNAMED_PROJECT: &str = "<unnamed project>";

/// Placeholder used when the design node carries no name.
pub const UNNAMED_NODE: &str = "<unnamed>";

/// Joins the parts of a baseline key.
pub const IDENTITY_SEPARATOR: char = '_';

/// Escapes separator and escape characters inside a key part.
const IDENTITY_ESCAPE: char = '\\';

/// Error raised for a malformed viewport token or dimension
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ViewportError {
    #[error("invalid viewport '{0}': expected '<width>x<height>' or 'USE_SOURCE'")]
    Malformed(String),

    #[error("invalid viewport '{0}': width and height must be greater than zero")]
    ZeroDimension(String),

    #[error("invalid bounding box {width}x{height}: dimensions must be at least one pixel")]
    BoundingBox { width: f64, height: f64 },

    #[error("invalid viewport width {0}: must be at least one pixel")]
    Width(f64),
}

/// A resolved viewport in whole pixels. Both dimensions are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

impl ViewportSize {
    pub fn new(width: u32, height: u32) -> Result<Self, ViewportError> {
        if width == 0 || height == 0 {
            return Err(ViewportError::ZeroDimension(format!("{}x{}", width, height)));
        }
        Ok(Self { width, height })
    }

    /// Build a viewport from a design bounding box, truncating fractional pixels.
    pub fn from_bounding_box(bbox: BoundingBox) -> Result<Self, ViewportError> {
        let invalid = || ViewportError::BoundingBox {
            width: bbox.width,
            height: bbox.height,
        };
        if !(bbox.width.is_finite() && bbox.height.is_finite()) {
            return Err(invalid());
        }
        let width = bbox.width.trunc();
        let height = bbox.height.trunc();
        if width < 1.0 || height < 1.0 || width > u32::MAX as f64 || height > u32::MAX as f64 {
            return Err(invalid());
        }
        Ok(Self {
            width: width as u32,
            height: height as u32,
        })
    }

    /// Serialized form handed to the comparison stage: `{"width":W,"height":H}`
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for ViewportSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A floating point bounding box as reported by the design source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
}

/// The viewport requested by a test-plan row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportRequest {
    /// Use the design node's native size
    UseSource,
    /// An explicit `WxH` viewport
    Explicit(ViewportSize),
}

impl ViewportRequest {
    /// Parse a viewport token, case-insensitively, ignoring surrounding whitespace.
    pub fn parse(token: &str) -> Result<Self, ViewportError> {
        let trimmed = token.trim();
        if trimmed.eq_ignore_ascii_case(USE_SOURCE_TOKEN) {
            return Ok(Self::UseSource);
        }

        let malformed = || ViewportError::Malformed(token.to_string());
        let lowered = trimmed.to_ascii_lowercase();
        let (width, height) = lowered.split_once('x').ok_or_else(malformed)?;
        let width = parse_dimension(width).ok_or_else(malformed)?;
        let height = parse_dimension(height).ok_or_else(malformed)?;

        ViewportSize::new(width, height)
            .map(Self::Explicit)
            .map_err(|_| ViewportError::ZeroDimension(token.to_string()))
    }

    /// Resolve to integer pixels. `bbox` is consulted only for `UseSource`.
    pub fn resolve(&self, bbox: Option<BoundingBox>) -> Result<ViewportSize, ViewportError> {
        match self {
            Self::Explicit(size) => Ok(*size),
            Self::UseSource => {
                let bbox = bbox.ok_or_else(|| ViewportError::Malformed(USE_SOURCE_TOKEN.to_string()))?;
                ViewportSize::from_bounding_box(bbox)
            }
        }
    }

    /// Canonical token passed to the reference stage
    pub fn token(&self) -> String {
        match self {
            Self::UseSource => USE_SOURCE_TOKEN.to_string(),
            Self::Explicit(size) => size.to_string(),
        }
    }
}

impl FromStr for ViewportRequest {
    type Err = ViewportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ViewportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

// Digits only: rejects signs, decimals and inner whitespace.
fn parse_dimension(part: &str) -> Option<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// The key binding a live capture to its stored baseline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaselineIdentity(String);

impl BaselineIdentity {
    /// Derive the key for `(app, test, width)`.
    ///
    /// Missing names fall back to [`UNNAMED_PROJECT`] / [`UNNAMED_NODE`]. The
    /// width is truncated to its integer part. Separator characters inside a
    /// name are escaped, so names without `_` or `\` produce the plain
    /// `app_test_width` form and distinct triples never share a key.
    pub fn derive(app_name: Option<&str>, test_name: Option<&str>, width: f64) -> Self {
        let app = app_name.unwrap_or(UNNAMED_PROJECT);
        let test = test_name.unwrap_or(UNNAMED_NODE);
        let width = if width.is_finite() && width > 0.0 {
            width.trunc() as u64
        } else {
            0
        };

        let mut key = String::with_capacity(app.len() + test.len() + 8);
        push_escaped(&mut key, app);
        key.push(IDENTITY_SEPARATOR);
        push_escaped(&mut key, test);
        key.push(IDENTITY_SEPARATOR);
        key.push_str(&width.to_string());
        Self(key)
    }

    /// Like [`derive`](Self::derive), but rejects widths that truncate below one pixel.
    pub fn try_derive(app_name: Option<&str>, test_name: Option<&str>, width: f64) -> Result<Self, ViewportError> {
        if !width.is_finite() || width.trunc() < 1.0 {
            return Err(ViewportError::Width(width));
        }
        Ok(Self::derive(app_name, test_name, width))
    }

    /// Derive the key for a resolved viewport.
    pub fn for_viewport(app_name: Option<&str>, test_name: Option<&str>, viewport: ViewportSize) -> Self {
        Self::derive(app_name, test_name, viewport.width as f64)
    }

    /// Wrap a key reported by an external stage as-is.
    pub fn from_reported(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key with escapes removed, as written by stages that join the
    /// parts verbatim.
    pub fn unescaped(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut chars = self.0.chars();
        while let Some(c) = chars.next() {
            if c == IDENTITY_ESCAPE {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Whether a stage-reported key names the same baseline, in either the
    /// escaped or the verbatim form.
    pub fn agrees_with(&self, reported: &str) -> bool {
        reported == self.0 || reported == self.unescaped()
    }
}

impl fmt::Display for BaselineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BaselineIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == IDENTITY_SEPARATOR || c == IDENTITY_ESCAPE {
            out.push(IDENTITY_ESCAPE);
        }
        out.push(c);
    }
}
