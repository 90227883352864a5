//! File extractor trait
//!
//! Defines the contract format parsers implement to resolve a carved
//! match into an exact (or bounded) file size plus any metadata the
//! format exposes near its header.

use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;

/// The outcome of running an extractor against a signature match
///
/// `estimated = true` marks a best-effort bound: exact parsing failed, or
/// the structure ran past the extractor's scan cap. A `size` of zero is
/// the rejection signal — the bytes at the offset were not this format at
/// all — and causes the carving engine to drop the match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub size: u64,
    pub estimated: bool,
    pub metadata: Option<FileMetadata>,
    /// Content-derived extension refinement (e.g. `docx` vs `xlsx` for a
    /// ZIP match); the signature's extension applies when absent.
    pub detected_extension: Option<&'static str>,
}

impl ExtractionResult {
    /// An exact size determined from the format's own structure
    pub fn exact(size: u64) -> Self {
        Self {
            size,
            estimated: false,
            ..Default::default()
        }
    }

    /// A best-effort size bound
    pub fn estimated(size: u64) -> Self {
        Self {
            size,
            estimated: true,
            ..Default::default()
        }
    }

    /// The bytes at the offset do not begin this format
    pub fn invalid() -> Self {
        Self {
            size: 0,
            estimated: true,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: FileMetadata) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }

    pub fn with_extension(mut self, extension: &'static str) -> Self {
        self.detected_extension = Some(extension);
        self
    }

    /// True when this result rejects the match outright
    pub fn is_invalid(&self) -> bool {
        self.size == 0
    }
}

/// Trait for format-specific size and metadata extraction
///
/// Extractors never fail: parsing problems degrade to estimated results
/// and a wrong-format offset degrades to [`ExtractionResult::invalid`].
/// Each implementation bounds its own work with a per-format scan cap, so
/// a damaged structure can never walk the whole device.
pub trait FileExtractor: Send + Sync {
    /// Resolves the size and metadata of the file starting at `offset`.
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult;
}
