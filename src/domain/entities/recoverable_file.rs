//! Recoverable file entity
//!
//! A file the engine believes can be reconstructed, found either by
//! signature carving or by walking filesystem metadata. Both recovery
//! paths converge on this one record type so a consumer never has to care
//! where a result came from.

use super::file_signature::{FileCategory, FileType};
use super::wire::u64_string;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional metadata extracted from file content or filesystem records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Duration in seconds for media containers
    pub duration: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub camera_model: Option<String>,
    pub original_name: Option<String>,
}

impl FileMetadata {
    /// True when no field carries a value
    pub fn is_empty(&self) -> bool {
        self == &FileMetadata::default()
    }
}

/// A contiguous run of file bytes on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFragment {
    #[serde(with = "u64_string")]
    pub offset: u64,
    #[serde(with = "u64_string")]
    pub size: u64,
}

/// How likely a byte-faithful reconstruction is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recoverability {
    Good,
    Partial,
    Poor,
}

impl Recoverability {
    /// Derivation rule for carved files: `Good` iff the size is exact;
    /// otherwise `Partial` when the estimate comfortably clears the type's
    /// minimum, else `Poor`.
    pub fn from_carved_size(size: u64, estimated: bool, min_size: u64) -> Self {
        if !estimated {
            Recoverability::Good
        } else if size > 2 * min_size {
            Recoverability::Partial
        } else {
            Recoverability::Poor
        }
    }

    /// Derivation rule for fragment lists produced by metadata parsers.
    pub fn from_fragment_count(count: usize) -> Self {
        match count {
            0 => Recoverability::Poor,
            1..=3 => Recoverability::Good,
            4..=10 => Recoverability::Partial,
            _ => Recoverability::Poor,
        }
    }
}

/// Which recovery strategy produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverySource {
    Carving,
    Metadata,
}

/// A file the engine can attempt to reconstruct
///
/// `offset` always equals `fragments[0].offset` when fragments are
/// present; carved files without fragment information carry `None` and a
/// single implied extent at `offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverableFile {
    pub id: Uuid,
    pub file_type: FileType,
    pub category: FileCategory,
    #[serde(with = "u64_string")]
    pub offset: u64,
    #[serde(with = "u64_string")]
    pub size: u64,
    pub size_estimated: bool,
    pub name: Option<String>,
    pub extension: String,
    pub metadata: Option<FileMetadata>,
    pub recoverability: Recoverability,
    pub source: RecoverySource,
    pub fragments: Option<Vec<FileFragment>>,
}

impl RecoverableFile {
    /// Builds a carved record; recoverability is derived from the size
    /// estimate per the carving rule.
    pub fn carved(
        file_type: FileType,
        offset: u64,
        size: u64,
        size_estimated: bool,
        min_size: u64,
        extension: &str,
        metadata: Option<FileMetadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_type,
            category: file_type.category(),
            offset,
            size,
            size_estimated,
            name: None,
            extension: extension.to_string(),
            metadata: metadata.filter(|m| !m.is_empty()),
            recoverability: Recoverability::from_carved_size(size, size_estimated, min_size),
            source: RecoverySource::Carving,
            fragments: None,
        }
    }

    /// Builds a metadata-sourced record from a fragment list.
    ///
    /// The record offset is pinned to the first fragment when one exists.
    pub fn from_metadata(
        file_type: FileType,
        name: Option<String>,
        size: u64,
        fragments: Vec<FileFragment>,
        recoverability: Recoverability,
        metadata: Option<FileMetadata>,
    ) -> Self {
        let offset = fragments.first().map(|f| f.offset).unwrap_or(0);
        Self {
            id: Uuid::new_v4(),
            file_type,
            category: file_type.category(),
            offset,
            size,
            size_estimated: false,
            name,
            extension: file_type.extension().to_string(),
            metadata: metadata.filter(|m| !m.is_empty()),
            recoverability,
            source: RecoverySource::Metadata,
            fragments: if fragments.is_empty() {
                None
            } else {
                Some(fragments)
            },
        }
    }

    /// Dedup key: `(offset, type code)` — never a string concatenation.
    pub fn dedup_key(&self) -> (u64, u16) {
        (self.offset, self.file_type.code())
    }
}
