//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use rombox_core::{Hashes, IndexStats, Item, RefreshStats};
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

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
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

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
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

/// One-line summary of a fingerprint: size and standard digests.
pub fn hashes_line(hashes: &Hashes) -> String {
    let size = hashes
        .size
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "size={} crc={} md5={} sha1={}",
        size, hashes.crc, hashes.md5, hashes.sha1
    )
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

/// Fingerprint of one input file.
#[derive(Debug, Clone, Serialize)]
pub struct HashedFile {
    pub path: String,
    /// False when the file could not be read and the sentinel was returned.
    pub identified: bool,
    #[serde(flatten)]
    pub hashes: Hashes,
}

#[derive(Debug, Serialize)]
pub struct HashOutput {
    pub success: bool,
    pub result_code: u8,
    pub files: Vec<HashedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedFile {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    pub existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArchiveOutput {
    pub success: bool,
    pub result_code: u8,
    pub files: Vec<ArchivedFile>,
    /// Index records newly flagged as present.
    pub records_marked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectedContainer {
    pub path: String,
    /// False when the file does not carry the container header.
    pub container: bool,
    #[serde(flatten)]
    pub hashes: Hashes,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Item>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InspectOutput {
    pub success: bool,
    pub result_code: u8,
    pub containers: Vec<InspectedContainer>,
}

#[derive(Debug, Serialize)]
pub struct ExtractOutput {
    pub success: bool,
    pub result_code: u8,
    pub container: String,
    pub destination: String,
    #[serde(flatten)]
    pub hashes: Hashes,
}

#[derive(Debug, Serialize)]
pub struct RefreshOutput {
    pub success: bool,
    pub result_code: u8,
    pub dats: String,
    #[serde(flatten)]
    pub stats: RefreshStats,
}

#[derive(Debug, Serialize)]
pub struct DbStatsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: IndexStats,
}

/// One machine after resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMachine {
    pub machine: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Serialize)]
pub struct ResolveOutput {
    pub success: bool,
    pub result_code: u8,
    pub topology: String,
    pub machines: Vec<ResolvedMachine>,
}
