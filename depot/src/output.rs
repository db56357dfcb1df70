//! Output formatting for CLI commands.
//!
//! Every command produces a DTO that is printed as pretty JSON in `--json`
//! mode, or rendered by a closure as text otherwise.

use anyhow::Result;
use chrono::{DateTime, Utc};
use depot_core::{ContentKind, ContentReference, GcReport, Hash};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write `data` as JSON, or the text produced by `text_fn`.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Content stored by `add`.
#[derive(Debug, Clone, Serialize)]
pub struct AddedContent {
    pub hash: Hash,
    pub path: String,
    pub kind: ContentKind,
}

#[derive(Debug, Serialize)]
pub struct AddOutput {
    pub success: bool,
    pub result_code: u8,
    pub added: Vec<AddedContent>,
}

#[derive(Debug, Serialize)]
pub struct HasOutput {
    pub success: bool,
    pub result_code: u8,
    pub hash: Hash,
    pub present: bool,
}

/// A child listed by `ls`.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub hash: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ContentKind>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LsData {
    Leaf { hash: Hash, size: u64 },
    Directory { hash: Hash, entries: Vec<EntryInfo> },
}

#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub data: LsData,
}

/// Verification result for one hash.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub hash: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyOutput {
    pub success: bool,
    pub result_code: u8,
    pub results: Vec<VerifyResult>,
}

#[derive(Debug, Serialize)]
pub struct ExplodeOutput {
    pub success: bool,
    pub result_code: u8,
    pub source: Hash,
    pub exploded: Hash,
}

#[derive(Debug, Serialize)]
pub struct CopyOutput {
    pub success: bool,
    pub result_code: u8,
    pub hash: Hash,
    pub destination: String,
}

/// One collection pass.
#[derive(Debug, Clone, Serialize)]
pub struct GcPass {
    pub pass: u32,
    pub completed_at: DateTime<Utc>,
    pub marked: Vec<Hash>,
    pub deleted: Vec<Hash>,
}

impl GcPass {
    pub fn new(pass: u32, report: GcReport) -> Self {
        Self {
            pass,
            completed_at: Utc::now(),
            marked: report.marked.into_iter().collect(),
            deleted: report.deleted.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub kept: Vec<ContentReference>,
    pub passes: Vec<GcPass>,
}
