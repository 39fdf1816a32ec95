//! Format-specific text and metadata extraction behind a single dispatch.
//!
//! A format is resolved once from the declared MIME type and the file
//! extension; each format maps to exactly one extractor. Adding a format
//! means one new [`FORMAT_RULES`] entry, one [`DocumentFormat`] variant and
//! its extractor module.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::task;

use crate::chunks::ChunkDraft;

pub mod docx;
pub mod legacy;
pub mod pdf;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const MAX_TITLE_CHARS: usize = 255;
const MAX_AUTHOR_CHARS: usize = 255;
const MAX_LANGUAGE_CHARS: usize = 16;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported format: {mime} ({})", display_extension(.extension))]
    UnsupportedFormat { mime: String, extension: String },
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("conversion timed out after {seconds}s")]
    ConversionTimeout { seconds: u64 },
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl ExtractError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::UnsupportedFormat { .. } => "unsupported_format",
            ExtractError::Conversion(_) | ExtractError::ConversionTimeout { .. } => "conversion",
            ExtractError::Extraction(_) => "extraction",
        }
    }
}

fn display_extension(extension: &str) -> String {
    if extension.is_empty() {
        "no extension".to_string()
    } else {
        format!(".{extension}")
    }
}

/// Settings for the external legacy-format converter.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub converter_program: String,
    pub converter_timeout: Duration,
    /// Parent directory for per-call scratch directories; system temp when unset.
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub page_count: Option<i32>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
}

impl DocumentMetadata {
    /// Trims values, drops empty ones and clips them to their column widths.
    pub fn normalized(self) -> Self {
        Self {
            page_count: self.page_count,
            title: clip(self.title, MAX_TITLE_CHARS),
            author: clip(self.author, MAX_AUTHOR_CHARS),
            language: clip(self.language, MAX_LANGUAGE_CHARS),
        }
    }
}

fn clip(value: Option<String>, max_chars: usize) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_chars).collect())
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub metadata: DocumentMetadata,
    pub chunks: Vec<ChunkDraft>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    /// Binary `.doc`, converted to DOCX by an external tool first.
    LegacyDoc,
}

struct FormatRule {
    format: DocumentFormat,
    mimes: &'static [&'static str],
    extensions: &'static [&'static str],
}

/// Checked in order; the first rule whose MIME or extension matches wins.
const FORMAT_RULES: &[FormatRule] = &[
    FormatRule {
        format: DocumentFormat::Pdf,
        mimes: &[MIME_PDF],
        extensions: &["pdf"],
    },
    FormatRule {
        format: DocumentFormat::Docx,
        mimes: &[MIME_DOCX],
        extensions: &["docx"],
    },
    FormatRule {
        format: DocumentFormat::LegacyDoc,
        mimes: &[],
        extensions: &["doc"],
    },
];

impl DocumentFormat {
    /// `mime` may carry parameters; `extension` is given without the dot.
    pub fn resolve(mime: &str, extension: &str) -> Option<Self> {
        let mime = essence(mime);
        let extension = extension.to_ascii_lowercase();
        FORMAT_RULES
            .iter()
            .find(|rule| rule.mimes.contains(&mime.as_str()) || rule.extensions.contains(&extension.as_str()))
            .map(|rule| rule.format)
    }
}

fn essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Extracts metadata and ordered chunks from the file at `path`.
pub async fn extract(
    path: &Path,
    mime: &str,
    options: &ExtractOptions,
) -> Result<ExtractedDocument, ExtractError> {
    let extension = extension_of(path);
    let format =
        DocumentFormat::resolve(mime, &extension).ok_or_else(|| ExtractError::UnsupportedFormat {
            mime: mime.to_string(),
            extension: extension.clone(),
        })?;

    let extracted = match format {
        DocumentFormat::Pdf => run_blocking(path, pdf::extract).await?,
        DocumentFormat::Docx => run_blocking(path, docx::extract).await?,
        DocumentFormat::LegacyDoc => legacy::extract(path, options).await?,
    };

    Ok(ExtractedDocument {
        metadata: extracted.metadata.normalized(),
        chunks: extracted.chunks,
    })
}

type BlockingExtractor = fn(&Path) -> Result<ExtractedDocument, ExtractError>;

/// Parsers are CPU and file bound; keep them off the async workers.
pub(crate) async fn run_blocking(
    path: &Path,
    extractor: BlockingExtractor,
) -> Result<ExtractedDocument, ExtractError> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || extractor(&path))
        .await
        .map_err(|err| ExtractError::Extraction(format!("extractor task panicked: {err}")))?
}
